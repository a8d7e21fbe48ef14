//! Import executor.
//!
//! Imports a local spatial file into PostGIS via ogr2ogr: transform to the
//! working CRS, promote to multi-geometry, make valid, write the named
//! table, and mark the registry row complete. A handful of upstream
//! sources self-declare the wrong CRS or carry junk rows; those get
//! explicit overrides keyed by dataset slug.

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::constants;
use crate::node::{InputRef, NodeSnapshot};

use super::ExecContext;

/// Explicit source-CRS overrides for files whose self-declaration is
/// missing or known-wrong. GPKG files self-declare reliably and get none.
pub fn source_crs_override(name: &str, input_file: &str) -> Option<&'static str> {
    if !input_file.ends_with(".geojson") {
        return None;
    }

    // DataMapWales publishes EPSG:27700 GeoJSON despite the format default.
    if name.ends_with("--wales") {
        return Some("EPSG:27700");
    }
    // Improvement Service GeoJSON uses EPSG:27700.
    if name == "local-nature-reserves--scotland" {
        return Some("EPSG:27700");
    }
    // Northern Ireland sources are usually Irish Grid, with one exception.
    if name == "world-heritage-sites--northern-ireland" {
        return Some(constants::CRS_GEOJSON);
    }
    if name.ends_with("--northern-ireland") {
        return Some("EPSG:29903");
    }

    Some(constants::CRS_GEOJSON)
}

/// Per-dataset predicate filters applied during import.
pub fn import_where_clause(name: &str) -> Option<&'static str> {
    match name {
        // Historic England conservation areas include 'no data' polygons
        // that would over-restrict every site.
        "conservation-areas--england" => Some("Name NOT LIKE 'No data%'"),
        _ => None,
    }
}

/// The layer produced by osm-export-tool is named after the top-level key
/// of the dataset's own mapping file.
pub fn osm_layer_name(mapping_yaml: &str) -> Option<String> {
    let value: serde_yml::Value = serde_yml::from_str(mapping_yaml).ok()?;
    let mapping = value.as_mapping()?;
    mapping
        .keys()
        .next()
        .and_then(|k| k.as_str())
        .map(str::to_string)
}

pub async fn run(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let table = snap
        .output
        .clone()
        .with_context(|| format!("import node {} has no output table", snap.name))?;

    if ctx.table_early_exit(&table, &snap.name).await? {
        return Ok(true);
    }

    let input_file = ctx.resolve_input_file(snap)?;
    if !input_file.exists() {
        error!(file = %input_file.display(), "import failed: file not found");
        return Ok(false);
    }
    let input_str = input_file.to_string_lossy().to_string();

    // OSM-derived imports pull one named layer out of the shared extract.
    let layer = if matches!(snap.input, InputRef::Variable(_)) {
        let yml_name = snap
            .prop_str("yml")
            .with_context(|| format!("OSM import {} is missing its yml property", snap.name))?;
        let yml_path = ctx.settings.osm_downloads_folder().join(yml_name);
        let text = tokio::fs::read_to_string(&yml_path)
            .await
            .with_context(|| format!("failed to read mapping {}", yml_path.display()))?;
        let layer = osm_layer_name(&text)
            .with_context(|| format!("mapping {} has no top-level layer", yml_path.display()))?;
        info!(layer, table, "importing OSM layer");
        Some(layer)
    } else {
        info!(file = %input_str, table, "importing file");
        None
    };

    let conn = ctx.db.ogr_connection_string();
    let mut args: Vec<String> = vec![
        "-f".into(),
        "PostgreSQL".into(),
        conn,
        input_str.clone(),
    ];
    if let Some(layer) = &layer {
        args.push(layer.clone());
    }
    args.extend(
        [
            "-makevalid",
            "-overwrite",
            "-lco",
            "GEOMETRY_NAME=geom",
            "-nln",
        ]
        .map(String::from),
    );
    args.push(table.clone());
    args.extend(["-nlt", "PROMOTE_TO_MULTI", "-skipfailures"].map(String::from));

    if let Some(crs) = source_crs_override(&snap.name, &input_str) {
        args.extend(["-s_srs".to_string(), crs.to_string()]);
    }
    args.extend(["-t_srs".to_string(), constants::CRS_DEFAULT.to_string()]);

    if let Some(where_clause) = import_where_clause(&snap.name) {
        args.extend(
            [
                "-dialect".to_string(),
                "sqlite".to_string(),
                "-sql".to_string(),
                format!("SELECT * FROM '{}' WHERE {}", snap.name, where_clause),
            ],
        );
    }

    args.extend(
        [
            "--config",
            "PG_USE_COPY",
            "YES",
            "--config",
            "OGR_PG_ENABLE_METADATA",
            "NO",
        ]
        .map(String::from),
    );

    let output = tokio::task::spawn_blocking(move || {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        opensite_process::run_ogr2ogr(&arg_refs)
    })
    .await
    .context("ogr2ogr task panicked")??;

    if !output.success() {
        error!(
            file = %input_str,
            stderr = %output.stderr.trim(),
            "PostGIS import error"
        );
        return Ok(false);
    }

    ctx.db.add_table_comment(&table, &snap.name).await?;
    ctx.mark_complete(&table, &snap.name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpkg_files_trust_their_self_declared_crs() {
        assert_eq!(source_crs_override("anything--wales", "x.gpkg"), None);
    }

    #[test]
    fn regional_geojson_overrides() {
        assert_eq!(
            source_crs_override("ancient-woodland--wales", "x.geojson"),
            Some("EPSG:27700")
        );
        assert_eq!(
            source_crs_override("local-nature-reserves--scotland", "x.geojson"),
            Some("EPSG:27700")
        );
        assert_eq!(
            source_crs_override("ramsar-sites--northern-ireland", "x.geojson"),
            Some("EPSG:29903")
        );
        assert_eq!(
            source_crs_override("world-heritage-sites--northern-ireland", "x.geojson"),
            Some("EPSG:4326")
        );
        assert_eq!(
            source_crs_override("railway-lines--england", "x.geojson"),
            Some("EPSG:4326")
        );
    }

    #[test]
    fn conservation_areas_filter_no_data_rows() {
        assert_eq!(
            import_where_clause("conservation-areas--england"),
            Some("Name NOT LIKE 'No data%'")
        );
        assert_eq!(import_where_clause("railway-lines--england"), None);
    }

    #[test]
    fn osm_layer_name_reads_first_top_level_key() {
        let yaml = "national_parks:\n  types:\n    - polygons\n  select:\n    - name\n";
        assert_eq!(osm_layer_name(yaml).as_deref(), Some("national_parks"));
        assert_eq!(osm_layer_name("- not\n- a\n- mapping\n"), None);
        assert_eq!(osm_layer_name("not yaml: [unclosed"), None);
    }
}
