//! Pluggable per-action workers.
//!
//! Dispatch is a closed match on [`Action`]; there is no open registration.
//! Each executor receives an immutable node snapshot plus the shared
//! execution context and reports plain success or failure; the scheduler
//! turns that into `Processed`/`Failed` and propagates it to clones.

pub mod concatenate;
pub mod download;
pub mod extract;
pub mod import;
pub mod output;
pub mod runner;
pub mod spatial;
pub mod sql;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use tracing::{error, info};

use crate::config::Settings;
use crate::constants;
use crate::node::{Action, InputRef, NodeSnapshot, NodeStatus};
use crate::postgis::Db;
use crate::registry::Registry;
use crate::scheduler::ExecFn;
use crate::vars::SharedVars;

/// Everything an executor needs beyond its node snapshot.
#[derive(Clone)]
pub struct ExecContext {
    pub settings: Settings,
    pub db: Db,
    pub registry: Registry,
    pub vars: SharedVars,
    /// Bypass the early-exit check and rebuild artifacts that already
    /// exist.
    pub overwrite: bool,
}

impl ExecContext {
    /// Folder a download lands in: OSM-family formats share the osm
    /// subfolder so the runner and concatenator find them together.
    pub fn download_dir(&self, format: Option<&str>) -> PathBuf {
        match format {
            Some(f) if constants::OSM_DOWNLOADS.contains(&f) => {
                self.settings.osm_downloads_folder()
            }
            _ => self.settings.downloads_folder(),
        }
    }

    /// Resolve a node input to an absolute file path. Variables are looked
    /// up in the shared metadata map (the producer has already completed by
    /// dependency ordering); plain files live under the downloads folder.
    pub fn resolve_input_file(&self, snap: &NodeSnapshot) -> Result<PathBuf> {
        match &snap.input {
            InputRef::Variable(key) => {
                let value = self
                    .vars
                    .get(key)
                    .with_context(|| format!("unresolved metadata variable: {key}"))?;
                Ok(PathBuf::from(value))
            }
            InputRef::File(name) => Ok(self.download_dir(snap.format.as_deref()).join(name)),
            other => anyhow::bail!("node {} has unusable input {:?}", snap.name, other),
        }
    }

    /// Registry-gated early exit. Returns true when the output table is
    /// already present and should be kept; under `--overwrite` the table is
    /// dropped instead so the executor rebuilds it.
    pub async fn table_early_exit(&self, table: &str, node_name: &str) -> Result<bool> {
        if !self.db.table_exists(table).await? {
            return Ok(false);
        }
        if self.overwrite {
            info!(table, node = node_name, "overwrite: dropping existing table");
            self.db.drop_table(table).await?;
            return Ok(false);
        }
        info!(table, node = node_name, "already exists, skipping");
        Ok(true)
    }

    /// Write-then-mark-complete: flip the registry flag after the artifact
    /// write. A missing row means the node was never registered and is
    /// reported as a soft failure.
    pub async fn mark_complete(&self, table: &str, node_name: &str) -> Result<bool> {
        if self.registry.set_completed(table).await? {
            Ok(true)
        } else {
            error!(
                table,
                node = node_name,
                "artifact written but registry row was not found"
            );
            Ok(false)
        }
    }
}

/// Build the scheduler's executor entry point over a shared context.
pub fn dispatcher(ctx: Arc<ExecContext>) -> ExecFn {
    Arc::new(move |snap: NodeSnapshot| {
        let ctx = Arc::clone(&ctx);
        async move {
            info!(
                action = snap.action.as_str(),
                pool = ?snap.action.pool(),
                name = %snap.name,
                "executing node"
            );

            let result = match snap.action {
                Action::Download => download::run(&snap, &ctx).await,
                Action::Unzip => extract::run(&snap, &ctx).await,
                Action::Concatenate => concatenate::run(&snap, &ctx).await,
                Action::Run => runner::run(&snap, &ctx).await,
                Action::Import => import::run(&snap, &ctx).await,
                Action::Buffer => spatial::buffer(&snap, &ctx).await,
                Action::Preprocess => spatial::preprocess(&snap, &ctx).await,
                Action::Amalgamate => spatial::amalgamate(&snap, &ctx).await,
                Action::Postprocess => spatial::postprocess(&snap, &ctx).await,
                Action::Clip => spatial::clip(&snap, &ctx).await,
                Action::Output => output::run(&snap, &ctx).await,
            };

            match result {
                Ok(true) => NodeStatus::Processed,
                Ok(false) => NodeStatus::Failed,
                Err(err) => {
                    error!(
                        action = snap.action.as_str(),
                        name = %snap.name,
                        error = %format!("{err:#}"),
                        "executor error"
                    );
                    NodeStatus::Failed
                }
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PgSettings;
    use std::collections::BTreeMap;

    fn test_ctx(build_root: &std::path::Path) -> ExecContext {
        let settings = Settings {
            pg: PgSettings {
                host: "localhost".to_string(),
                database: "opensite_test".to_string(),
                user: "postgres".to_string(),
                password: "postgres".to_string(),
            },
            build_root: build_root.to_path_buf(),
            tileserver_url: String::new(),
            qgis_python: None,
            secret_key: None,
        };
        let db = Db::connect(&settings.pg).expect("pool is lazy");
        ExecContext {
            registry: Registry::new(db.clone()),
            db,
            settings,
            vars: SharedVars::new(),
            overwrite: false,
        }
    }

    fn snapshot(input: InputRef, format: Option<&str>) -> NodeSnapshot {
        NodeSnapshot {
            urn: 1,
            global_urn: 1,
            name: "test-node".to_string(),
            title: "Test Node".to_string(),
            action: Action::Import,
            format: format.map(str::to_string),
            input,
            output: None,
            props: BTreeMap::new(),
        }
    }

    #[test]
    fn osm_formats_share_the_osm_folder() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());

        assert_eq!(
            ctx.download_dir(Some("OSM")),
            td.path().join("downloads").join("osm")
        );
        assert_eq!(
            ctx.download_dir(Some(constants::OSM_YML_FORMAT)),
            td.path().join("downloads").join("osm")
        );
        assert_eq!(ctx.download_dir(Some("GPKG")), td.path().join("downloads"));
        assert_eq!(ctx.download_dir(None), td.path().join("downloads"));
    }

    #[test]
    fn resolve_input_file_handles_files_and_variables() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());

        let file_snap = snapshot(InputRef::File("a.gpkg".to_string()), Some("GPKG"));
        assert_eq!(
            ctx.resolve_input_file(&file_snap).expect("file"),
            td.path().join("downloads").join("a.gpkg")
        );

        ctx.vars.publish_output(9, "/abs/path/out.gpkg");
        let var_snap = snapshot(
            InputRef::Variable("VAR:global_output_9".to_string()),
            None,
        );
        assert_eq!(
            ctx.resolve_input_file(&var_snap).expect("var"),
            PathBuf::from("/abs/path/out.gpkg")
        );

        let missing = snapshot(InputRef::Variable("VAR:global_output_8".to_string()), None);
        assert!(ctx.resolve_input_file(&missing).is_err());

        let none = snapshot(InputRef::None, None);
        assert!(ctx.resolve_input_file(&none).is_err());
    }
}
