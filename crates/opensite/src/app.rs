//! Application lifecycle.
//!
//! Validates the environment and options, prepares folders, bootstraps the
//! clipping master and grids, then wires catalogue, builder, graph and
//! scheduler together. Also owns the purge modes and the state flag files
//! an optional wrapper daemon watches.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use opensite_catalogue::{Catalogue, CatalogueClient};

use crate::builder::Builder;
use crate::config::Settings;
use crate::constants;
use crate::executors::{self, ExecContext};
use crate::graph::Graph;
use crate::grid;
use crate::node::PropValue;
use crate::postgis::Db;
use crate::registry::Registry;
use crate::scheduler::{QueueOutcome, Scheduler, SchedulerOptions};
use crate::vars::SharedVars;

/// Default catalogue endpoint; `--custom <url>` overrides it.
pub const CATALOGUE_DEFAULT_URL: &str = "https://data.opensite.energy";

/// Everything the CLI hands the engine for one invocation.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub height_to_tip: f64,
    pub blade_radius: Option<f64>,
    pub clip: Option<String>,
    pub custom_catalogue: Option<String>,
    /// Local YAML paths, or catalogue package names to fetch.
    pub sites: Vec<String>,
    pub output_formats: Vec<String>,
    pub graph_only: bool,
    pub preview: bool,
    pub overwrite: bool,
    pub snapgrid: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            height_to_tip: 0.0,
            blade_radius: None,
            clip: None,
            custom_catalogue: None,
            sites: Vec::new(),
            output_formats: vec!["gpkg".to_string()],
            graph_only: false,
            preview: false,
            overwrite: false,
            snapgrid: false,
        }
    }
}

/// How a full invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    GraphOnly,
    Stalled { unreachable: Vec<String> },
    Interrupted,
}

pub struct Application {
    settings: Settings,
    db: Db,
    registry: Registry,
    started: Instant,
}

impl Application {
    pub fn new(mut settings: Settings) -> Result<Self> {
        settings
            .ensure_secret_key(Path::new(".env"))
            .context("failed to ensure secret key")?;
        let db = Db::connect(&settings.pg)?;
        let registry = Registry::new(db.clone());
        info!("application initialized");
        Ok(Self {
            settings,
            db,
            registry,
            started: Instant::now(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Folders, registry sync, clipping master and both grids.
    pub async fn init_environment(&self) -> Result<()> {
        self.settings.ensure_folders()?;
        self.registry.sync().await?;

        if !grid::ensure_processing_grid(&self.db, &self.settings).await? {
            anyhow::bail!("could not create the processing grid");
        }
        if !grid::ensure_output_grid(&self.db, &self.settings).await? {
            anyhow::bail!("could not create the output grid");
        }
        if !grid::ensure_buffered_edges(&self.db).await? {
            anyhow::bail!("could not create the buffered grid edges");
        }
        Ok(())
    }

    /// Check clip areas resolve to known administrative regions. Returns
    /// true when the boundaries table does not exist yet; a further check
    /// runs once it has been created.
    pub async fn early_check_area(&self, areas: &[String]) -> Result<bool> {
        if !self.db.table_exists(constants::TABLE_OSM_BOUNDARIES).await? {
            return Ok(true);
        }

        let countries: Vec<String> = constants::osm_name_convert()
            .values()
            .map(|v| (*v).to_string())
            .collect();

        for area in areas {
            let resolved = area;
            let lookup = constants::osm_name_convert()
                .get(resolved.as_str())
                .map(|v| (*v).to_string())
                .unwrap_or_else(|| resolved.clone());
            let rows = self
                .db
                .query(
                    &executors::sql::country_from_area(&lookup, &countries)?,
                    &[],
                )
                .await?;
            if rows.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Global defaults merged under every branch.
    pub fn default_branch_props(&self, opts: &AppOptions) -> BTreeMap<String, PropValue> {
        let mut defaults = BTreeMap::new();
        defaults.insert(
            "height-to-tip".to_string(),
            PropValue::Num(opts.height_to_tip),
        );
        if let Some(radius) = opts.blade_radius {
            defaults.insert("blade-radius".to_string(), PropValue::Num(radius));
        }
        defaults
    }

    /// Resolve site entries to `(name, yaml text)`: local files are read
    /// directly, anything else is fetched from the catalogue.
    pub async fn load_site_sources(
        &self,
        sites: &[String],
        catalogue: &CatalogueClient,
    ) -> Result<Vec<(String, String)>> {
        let mut sources = Vec::new();

        for site in sites {
            let path = PathBuf::from(site);
            if path.exists() {
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(site)
                    .to_string();
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read site file {site}"))?;
                sources.push((name, text));
                continue;
            }

            // Treat the entry as a catalogue package carrying a sites YAML.
            let client = catalogue.clone();
            let package = site.clone();
            let fetched = tokio::task::spawn_blocking(move || {
                let model = client.query()?;
                for group in model.values() {
                    for dataset in &group.datasets {
                        if dataset.package_name != package {
                            continue;
                        }
                        for resource in &dataset.resources {
                            if resource.format == constants::SITES_YML_FORMAT {
                                return client.fetch_text(&resource.url);
                            }
                        }
                    }
                }
                anyhow::bail!("no site YAML found in catalogue for '{package}'")
            })
            .await
            .context("catalogue fetch task panicked")??;
            sources.push((site.clone(), fetched));
        }

        Ok(sources)
    }

    /// Build the full executable graph for this invocation.
    pub async fn build_graph(
        &self,
        opts: &AppOptions,
        site_sources: &[(String, String)],
        catalogue_model: &opensite_catalogue::CatalogueModel,
    ) -> Result<Graph> {
        let mut builder = Builder::new(
            self.default_branch_props(opts),
            opts.output_formats.clone(),
            opts.clip.clone(),
            opts.snapgrid,
        );

        for (name, text) in site_sources {
            builder.add_site_yaml(name, text)?;
        }
        builder.merge_catalogue(catalogue_model);
        builder.explode()?;

        let graph = builder.into_graph();
        self.registry.register_graph(&graph).await?;
        Ok(graph)
    }

    /// Persist the graph preview for the wrapper daemon and `--preview`.
    pub fn write_graph_preview(&self, graph: &Graph) -> Result<PathBuf> {
        let path = self.settings.cache_folder().join("graph.json");
        let rendered = serde_json::to_string_pretty(&graph.preview_value())
            .context("failed to render graph preview")?;
        std::fs::create_dir_all(self.settings.cache_folder())?;
        std::fs::write(&path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    fn set_state_flag(&self, processing: bool) {
        let processing_flag = self.settings.build_root.join(constants::PROCESSING_STATE_FILE);
        let complete_flag = self
            .settings
            .build_root
            .join(constants::PROCESSING_COMPLETE_FILE);
        let stamp = chrono::Utc::now().to_rfc3339();

        if processing {
            let _ = std::fs::write(&processing_flag, &stamp);
            let _ = std::fs::remove_file(&complete_flag);
        } else {
            let _ = std::fs::remove_file(&processing_flag);
            let _ = std::fs::write(&complete_flag, &stamp);
        }
    }

    /// Full build: validate, bootstrap, build the graph, run the queue.
    pub async fn run(&self, opts: &AppOptions) -> Result<RunOutcome> {
        self.init_environment().await?;

        if let Some(area) = &opts.clip
            && !self.early_check_area(std::slice::from_ref(area)).await?
        {
            error!(
                area,
                "clip area not found in boundary database, clipping will not be possible"
            );
            anyhow::bail!("invalid clip area: {area}");
        }

        let catalogue_url = opts
            .custom_catalogue
            .clone()
            .unwrap_or_else(|| CATALOGUE_DEFAULT_URL.to_string());
        let catalogue = CatalogueClient::new(&catalogue_url);

        let site_sources = self.load_site_sources(&opts.sites, &catalogue).await?;
        if site_sources.is_empty() {
            anyhow::bail!("no site descriptions given; pass --sites");
        }

        let model = {
            let client = catalogue.clone();
            tokio::task::spawn_blocking(move || client.query())
                .await
                .context("catalogue query task panicked")??
        };

        let graph = self.build_graph(opts, &site_sources, &model).await?;
        let preview_path = self.write_graph_preview(&graph)?;
        info!(preview = %preview_path.display(), nodes = graph.len(), "graph ready");

        if opts.graph_only {
            return Ok(RunOutcome::GraphOnly);
        }

        let ctx = Arc::new(ExecContext {
            settings: self.settings.clone(),
            db: self.db.clone(),
            registry: self.registry.clone(),
            vars: SharedVars::new(),
            overwrite: opts.overwrite,
        });

        let scheduler_opts = SchedulerOptions {
            probe_sizes: true,
            ..SchedulerOptions::default()
        };
        let mut scheduler = Scheduler::new(graph, executors::dispatcher(ctx), scheduler_opts);

        // Interrupt and terminate both set the shared stop flag; the
        // scheduler drains within its grace window.
        let stop = scheduler.stop_flag();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, initiating graceful shutdown");
                stop.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });

        self.set_state_flag(true);
        let outcome = scheduler.run().await;
        self.set_state_flag(false);

        if opts.preview {
            self.write_graph_preview(scheduler.graph())?;
        }

        self.show_elapsed_time();

        match outcome? {
            QueueOutcome::Completed => Ok(RunOutcome::Success),
            QueueOutcome::Stalled { unreachable } => Ok(RunOutcome::Stalled { unreachable }),
            QueueOutcome::Interrupted => Ok(RunOutcome::Interrupted),
        }
    }

    fn show_elapsed_time(&self) {
        let secs = self.started.elapsed().as_secs_f64();
        let minutes = (secs / 60.0 * 10.0).round() / 10.0;
        let hours = (secs / 3600.0 * 10.0).round() / 10.0;
        info!("completed processing - {minutes} minutes ({hours} hours)");
    }

    fn delete_folder(&self, folder: &Path) -> bool {
        match std::fs::remove_dir_all(folder) {
            Ok(()) => {
                info!(folder = %folder.display(), "deleted");
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(folder = %folder.display(), "folder does not exist");
                false
            }
            Err(err) => {
                error!(folder = %folder.display(), error = %err, "failed to delete");
                false
            }
        }
    }

    pub async fn purge_db(&self) -> Result<()> {
        self.registry.ensure_tables().await?;
        self.registry.purge().await?;
        info!("[purgedb] completed");
        Ok(())
    }

    pub fn purge_downloads(&self) {
        self.delete_folder(&self.settings.downloads_folder());
        info!("[purgedownloads] completed");
    }

    pub fn purge_outputs(&self) {
        self.delete_folder(&self.settings.output_folder());
        info!("[purgeoutputs] completed");
    }

    pub fn purge_tileserver(&self) {
        self.delete_folder(&self.settings.tileserver_folder());
        info!("[purgetileserver] completed");
    }

    pub fn purge_installs(&self) {
        self.delete_folder(&self.settings.install_folder());
        info!("[purgeinstalls] completed");
    }

    /// Purge all files and every managed database table.
    pub async fn purge_all(&self) -> Result<()> {
        self.purge_downloads();
        self.purge_outputs();
        self.purge_installs();
        self.purge_tileserver();
        self.purge_db().await?;
        info!("[purgeall] completed");
        Ok(())
    }
}
