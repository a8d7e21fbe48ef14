//! Run executor: drives the external OSM extraction tool.
//!
//! Resolves the canonical mapping file published by the concatenator,
//! invokes `osm-export-tool` against the downloaded extract, and renames
//! the temporary output into the published name on success. The final
//! path is published under the runner's global urn before anything else
//! so every clone's consumer resolves the same handle.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::node::{InputRef, NodeSnapshot};

use super::ExecContext;

pub async fn run(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let InputRef::Variable(mapping_key) = &snap.input else {
        anyhow::bail!("run node {} has no mapping variable input", snap.name);
    };
    let Some(mapping_file) = ctx.vars.get(mapping_key) else {
        error!(node = %snap.name, key = %mapping_key, "could not resolve mapping input");
        return Ok(false);
    };
    let mapping_path = PathBuf::from(&mapping_file);

    // osm-export-tool appends `.gpkg` to the base name it is given.
    let out_base = mapping_file
        .strip_suffix(".yml")
        .unwrap_or(&mapping_file)
        .to_string();
    let tmp_base = format!("{out_base}-tmp");
    let final_file = PathBuf::from(format!("{out_base}.gpkg"));
    let tmp_file = PathBuf::from(format!("{tmp_base}.gpkg"));

    ctx.vars
        .publish_output(snap.global_urn, final_file.to_string_lossy().to_string());

    if final_file.exists() && !ctx.overwrite {
        info!(file = %final_file.display(), "extract already exists, skipping osm-export-tool");
        return Ok(true);
    }

    let osm_url = snap
        .prop_str("osm")
        .with_context(|| format!("run node {} is missing its osm property", snap.name))?;
    let extract_name = osm_url.rsplit('/').next().unwrap_or(osm_url);
    let extract_path = ctx.settings.osm_downloads_folder().join(extract_name);

    if !mapping_path.exists() {
        error!(mapping = %mapping_path.display(), "mapping file not resolved or missing");
        return Ok(false);
    }
    if !extract_path.exists() {
        error!(extract = %extract_path.display(), "OSM extract missing");
        return Ok(false);
    }

    info!(mapping = %mapping_path.display(), "executing osm-export-tool (long duration)");

    let tmp_base_path = PathBuf::from(&tmp_base);
    let output = tokio::task::spawn_blocking(move || {
        opensite_process::run_osm_export_tool(&mapping_path, &extract_path, &tmp_base_path)
    })
    .await
    .context("osm-export-tool task panicked")??;

    if !output.success() {
        error!(stderr = %output.stderr.trim(), "osm-export-tool failed");
        return Ok(false);
    }

    tokio::fs::rename(&tmp_file, &final_file)
        .await
        .with_context(|| format!("failed to finalize {}", final_file.display()))?;

    info!(file = %final_file.display(), "osm-export-tool successful");
    Ok(true)
}
