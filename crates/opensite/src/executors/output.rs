//! Output executor.
//!
//! Exports a consolidated table into the layers folder via ogr2ogr. Only
//! the file encoders with a direct ogr2ogr mapping live here (GPKG,
//! GeoJSON); tile bundles, QGIS projects and the static web bundle are
//! produced by external collaborators from these layer files.

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::constants;
use crate::node::{InputRef, NodeSnapshot};

use super::ExecContext;

pub async fn run(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let file_name = snap
        .output
        .clone()
        .with_context(|| format!("output node {} has no file output", snap.name))?;

    // Clipped inputs resolve through shared metadata and are already in
    // the output CRS; welded tables still carry the working CRS.
    let (table, source_crs) = match &snap.input {
        InputRef::Table(table) => (table.clone(), constants::CRS_DEFAULT),
        InputRef::Variable(key) => {
            let Some(table) = ctx.vars.get(key) else {
                error!(node = %snap.name, key, "could not resolve output input table");
                return Ok(false);
            };
            (table, constants::CRS_OUTPUT)
        }
        other => anyhow::bail!("output node {} has unusable input {other:?}", snap.name),
    };

    let layers_dir = ctx.settings.output_layers_folder();
    tokio::fs::create_dir_all(&layers_dir)
        .await
        .with_context(|| format!("failed to create {}", layers_dir.display()))?;
    let destination = layers_dir.join(&file_name);

    if destination.exists() && !ctx.overwrite {
        info!(file = %file_name, "output layer already exists, skipping export");
        return Ok(true);
    }

    let layer_name = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| file_name.clone());

    info!(table, file = %file_name, "exporting layer");

    let conn = ctx.db.ogr_connection_string();
    let dest_str = destination.to_string_lossy().to_string();
    let sql = format!("SELECT geom geometry FROM '{table}'");
    let source_crs = source_crs.to_string();

    let output = tokio::task::spawn_blocking(move || {
        opensite_process::run_ogr2ogr(&[
            &dest_str,
            &conn,
            "-overwrite",
            "-nln",
            &layer_name,
            "-nlt",
            "POLYGON",
            "-dialect",
            "sqlite",
            "-sql",
            &sql,
            "-s_srs",
            &source_crs,
            "-t_srs",
            constants::CRS_OUTPUT,
        ])
    })
    .await
    .context("ogr2ogr task panicked")??;

    if !output.success() {
        error!(table, stderr = %output.stderr.trim(), "PostGIS export error");
        return Ok(false);
    }

    info!(file = %file_name, "layer exported");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use super::*;
    use crate::config::{PgSettings, Settings};
    use crate::node::Action;
    use crate::postgis::Db;
    use crate::registry::Registry;
    use crate::vars::SharedVars;

    fn test_ctx(build_root: &Path) -> ExecContext {
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

    fn output_snapshot(input: InputRef, file: &str) -> NodeSnapshot {
        NodeSnapshot {
            urn: 1,
            global_urn: 1,
            name: "transport--output-gpkg".to_string(),
            title: "Output".to_string(),
            action: Action::Output,
            format: Some("gpkg".to_string()),
            input,
            output: Some(file.to_string()),
            props: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn existing_layer_file_is_reused() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());
        let layers = td.path().join("output").join("layers");
        std::fs::create_dir_all(&layers).expect("mkdir");
        std::fs::write(layers.join("transport.gpkg"), b"layer").expect("write");

        let snap = output_snapshot(
            InputRef::Table("opensite_transport_welded".to_string()),
            "transport.gpkg",
        );
        let ok = run(&snap, &ctx).await.expect("run");
        assert!(ok);
    }

    #[tokio::test]
    async fn unresolved_variable_input_fails() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());

        let snap = output_snapshot(
            InputRef::Variable("VAR:global_output_99".to_string()),
            "transport.gpkg",
        );
        let ok = run(&snap, &ctx).await.expect("run");
        assert!(!ok);
    }
}
