//! Concatenate executor.
//!
//! Merges every osm-export-tool mapping YAML that shares the same upstream
//! OSM extract into one canonical config. The result is named by hashing
//! the merged content together with the extract URL, so the same inputs
//! always produce the same file, and the path is published for the runner
//! through the shared metadata map.

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::hashing::hash16;
use crate::node::{InputRef, NodeSnapshot};

use super::ExecContext;

pub async fn run(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let InputRef::FileSet(inputs) = &snap.input else {
        anyhow::bail!("concatenate node {} has no file-set input", snap.name);
    };
    let osm_url = snap
        .prop_str("osm")
        .with_context(|| format!("concatenate node {} is missing its osm property", snap.name))?;

    info!(node = %snap.name, count = inputs.len(), "concatenating OSM mapping configs");

    let osm_dir = ctx.settings.osm_downloads_folder();
    let mut merged = serde_yml::Mapping::new();

    for name in inputs {
        let path = osm_dir.join(name);
        if !path.exists() {
            error!(path = %path.display(), "source mapping YAML not found");
            return Ok(false);
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: serde_yml::Value = serde_yml::from_str(&text)
            .with_context(|| format!("malformed mapping YAML {}", path.display()))?;
        if let serde_yml::Value::Mapping(mapping) = value {
            for (key, entry) in mapping {
                merged.insert(key, entry);
            }
        }
    }

    let yaml_content = serde_yml::to_string(&serde_yml::Value::Mapping(merged))
        .context("failed to serialize merged mapping")?;

    let content_hash = hash16(format!("{yaml_content}{osm_url}"));
    let final_name = format!("osm_config_{content_hash}.yml");
    let final_path = osm_dir.join(&final_name);

    tokio::fs::create_dir_all(&osm_dir)
        .await
        .with_context(|| format!("failed to create {}", osm_dir.display()))?;
    tokio::fs::write(&final_path, &yaml_content)
        .await
        .with_context(|| format!("failed to write {}", final_path.display()))?;

    ctx.vars
        .publish_output(snap.global_urn, final_path.to_string_lossy().to_string());

    info!(file = %final_name, "canonical mapping config generated");
    Ok(true)
}
