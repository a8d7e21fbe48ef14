use std::io::BufRead;

use anyhow::Result;
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use opensite::app::{AppOptions, Application, RunOutcome};
use opensite::config::Settings;

/// Exit code for a queue that could not complete (stall or interrupt).
const EXIT_STALLED: i32 = 1;
/// Exit code for validation failures before any executor runs.
const EXIT_VALIDATION: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "opensite", version)]
#[command(about = "Geospatial constraint-layer build engine over PostGIS")]
struct Cli {
    /// Turbine height to tip in metres.
    height_to_tip: Option<f64>,

    /// Turbine blade radius in metres.
    blade_radius: Option<f64>,

    /// Clip final outputs to a named administrative area.
    #[arg(long)]
    clip: Option<String>,

    /// Custom catalogue base URL.
    #[arg(long)]
    custom: Option<String>,

    /// Site descriptions: local YAML paths or catalogue package names.
    #[arg(long = "sites", value_delimiter = ',')]
    sites: Vec<String>,

    /// Output formats for the final layers.
    #[arg(long = "outputformats", value_delimiter = ',', default_value = "gpkg")]
    output_formats: Vec<String>,

    /// Delete all downloads, outputs, installs, tileserver files, and
    /// managed database tables.
    #[arg(long)]
    purgeall: bool,

    /// Delete all managed database tables.
    #[arg(long)]
    purgedb: bool,

    /// Delete all downloaded files.
    #[arg(long)]
    purgedownloads: bool,

    /// Delete all output files.
    #[arg(long)]
    purgeoutputs: bool,

    /// Build and print the processing graph without executing it.
    #[arg(long)]
    graphonly: bool,

    /// Refresh the graph preview as processing progresses.
    #[arg(long)]
    preview: bool,

    /// Rebuild artifacts that already exist.
    #[arg(long)]
    overwrite: bool,

    /// Snap geometries to the processing grid during preprocess.
    #[arg(long)]
    snapgrid: bool,

    /// Run the admin HTTP server on the given port.
    #[arg(long)]
    server: Option<u16>,
}

impl Cli {
    fn app_options(&self) -> Option<AppOptions> {
        let height_to_tip = self.height_to_tip?;
        Some(AppOptions {
            height_to_tip,
            blade_radius: self.blade_radius,
            clip: self.clip.clone(),
            custom_catalogue: self.custom.clone(),
            sites: self.sites.clone(),
            output_formats: self.output_formats.clone(),
            graph_only: self.graphonly,
            preview: self.preview,
            overwrite: self.overwrite,
            snapgrid: self.snapgrid,
        })
    }

    fn wants_purge(&self) -> bool {
        self.purgeall || self.purgedb || self.purgedownloads || self.purgeoutputs
    }
}

fn exit_code_for(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Success | RunOutcome::GraphOnly => 0,
        RunOutcome::Stalled { .. } | RunOutcome::Interrupted => EXIT_STALLED,
    }
}

/// Destructive actions require the operator to type 'yes'.
fn confirm(prompt: &str, input: &mut dyn BufRead) -> bool {
    eprintln!("{prompt}");
    eprint!("Type 'yes' to continue: ");
    let mut line = String::new();
    if input.read_line(&mut line).is_err() {
        return false;
    }
    line.trim().eq_ignore_ascii_case("yes")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("OPENSITE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_purges(cli: &Cli, app: &Application) -> Result<()> {
    let mut stdin = std::io::stdin().lock();

    if cli.purgeall {
        let warning = "WARNING: you are about to delete all downloads, outputs, \
                       and every opensite table (registry, branch, and spatial data)";
        if confirm(warning, &mut stdin) {
            app.purge_all().await?;
        } else {
            warn!("purge aborted, nothing was deleted");
        }
        return Ok(());
    }

    if cli.purgedb {
        let warning = "WARNING: you are about to delete every opensite table \
                       (registry, branch, and spatial data)";
        if confirm(warning, &mut stdin) {
            app.purge_db().await?;
        } else {
            warn!("purge aborted, no tables were harmed");
        }
    }
    if cli.purgedownloads {
        app.purge_downloads();
    }
    if cli.purgeoutputs {
        app.purge_outputs();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Some(port) = cli.server {
        // The admin server (auth, domains, TLS) ships as a separate
        // wrapper; the engine only maintains the state files and graph
        // preview it consumes.
        error!(port, "server mode is provided by the opensite admin wrapper, not this binary");
        std::process::exit(EXIT_VALIDATION);
    }

    let settings = Settings::from_env();
    let app = match Application::new(settings) {
        Ok(app) => app,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to initialize");
            std::process::exit(EXIT_VALIDATION);
        }
    };

    if cli.wants_purge() {
        if let Err(err) = run_purges(&cli, &app).await {
            error!(error = %format!("{err:#}"), "purge failed");
            std::process::exit(EXIT_VALIDATION);
        }
        if cli.height_to_tip.is_none() {
            return;
        }
    }

    let Some(opts) = cli.app_options() else {
        error!("height-to-tip is required (e.g. `opensite 125 60 --sites site.yml`)");
        std::process::exit(EXIT_VALIDATION);
    };

    if !opts.height_to_tip.is_finite() || opts.height_to_tip <= 0.0 {
        error!("height-to-tip must be a positive number of metres");
        std::process::exit(EXIT_VALIDATION);
    }
    if let Some(radius) = opts.blade_radius
        && (!radius.is_finite() || radius <= 0.0)
    {
        error!("blade-radius must be a positive number of metres");
        std::process::exit(EXIT_VALIDATION);
    }

    match app.run(&opts).await {
        Ok(outcome) => {
            if let RunOutcome::Stalled { unreachable } = &outcome {
                error!(nodes = ?unreachable, "build stalled with unreachable nodes");
            }
            std::process::exit(exit_code_for(&outcome));
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "build failed");
            std::process::exit(EXIT_VALIDATION);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parses_positional_turbine_parameters() {
        let cli = Cli::parse_from(["opensite", "125", "60", "--sites", "site.yml"]);
        assert_eq!(cli.height_to_tip, Some(125.0));
        assert_eq!(cli.blade_radius, Some(60.0));
        assert_eq!(cli.sites, vec!["site.yml".to_string()]);

        let opts = cli.app_options().expect("options");
        assert_eq!(opts.height_to_tip, 125.0);
        assert_eq!(opts.blade_radius, Some(60.0));
    }

    #[test]
    fn parses_comma_separated_lists() {
        let cli = Cli::parse_from([
            "opensite",
            "100",
            "--sites",
            "a.yml,b.yml",
            "--outputformats",
            "gpkg,geojson",
        ]);
        assert_eq!(cli.sites, vec!["a.yml".to_string(), "b.yml".to_string()]);
        assert_eq!(
            cli.output_formats,
            vec!["gpkg".to_string(), "geojson".to_string()]
        );
    }

    #[test]
    fn parses_mode_flags() {
        let cli = Cli::parse_from([
            "opensite",
            "100",
            "--clip",
            "england",
            "--graphonly",
            "--overwrite",
            "--snapgrid",
        ]);
        assert_eq!(cli.clip.as_deref(), Some("england"));
        assert!(cli.graphonly);
        assert!(cli.overwrite);
        assert!(cli.snapgrid);
        assert!(!cli.wants_purge());
    }

    #[test]
    fn purge_flags_do_not_require_positional_parameters() {
        let cli = Cli::parse_from(["opensite", "--purgedb"]);
        assert!(cli.wants_purge());
        assert!(cli.app_options().is_none());
    }

    #[test]
    fn outcome_exit_codes() {
        assert_eq!(exit_code_for(&RunOutcome::Success), 0);
        assert_eq!(exit_code_for(&RunOutcome::GraphOnly), 0);
        assert_eq!(
            exit_code_for(&RunOutcome::Stalled {
                unreachable: vec!["import".to_string()]
            }),
            EXIT_STALLED
        );
        assert_eq!(exit_code_for(&RunOutcome::Interrupted), EXIT_STALLED);
    }

    #[test]
    fn confirm_accepts_yes_only() {
        assert!(confirm("warning", &mut Cursor::new(b"yes\n".to_vec())));
        assert!(confirm("warning", &mut Cursor::new(b"YES\n".to_vec())));
        assert!(!confirm("warning", &mut Cursor::new(b"no\n".to_vec())));
        assert!(!confirm("warning", &mut Cursor::new(b"\n".to_vec())));
    }
}
