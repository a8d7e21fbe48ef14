//! Application constants that do not change per environment.

use std::collections::BTreeMap;

/// Default CRS for spatial operations.
/// EPSG:25830 gives metre precision across the United Kingdom.
pub const CRS_DEFAULT: &str = "EPSG:25830";

/// Default CRS declared by GeoJSON sources.
pub const CRS_GEOJSON: &str = "EPSG:4326";

/// CRS of all exported GIS files.
pub const CRS_OUTPUT: &str = "EPSG:4326";

/// Format label used by the catalogue for osm-export-tool mapping files.
pub const OSM_YML_FORMAT: &str = opensite_catalogue::OSM_YML_FORMAT;

/// Format label used by the catalogue for site description files.
pub const SITES_YML_FORMAT: &str = opensite_catalogue::SITES_YML_FORMAT;

/// How many seconds between progress lines from long-running executors.
pub const PROGRESS_INTERVAL_SECS: u64 = 5;

/// Download priority: these formats are submitted ahead of others so slow
/// network transfers overlap with later CPU work.
pub const DOWNLOADS_PRIORITY: &[&str] = &["OSM", SITES_YML_FORMAT, OSM_YML_FORMAT];

/// Formats that are small and change often, so always re-downloaded.
pub const ALWAYS_DOWNLOAD: &[&str] = &[SITES_YML_FORMAT, OSM_YML_FORMAT];

/// OSM-related formats share the downloads/osm/ folder.
pub const OSM_DOWNLOADS: &[&str] = &["OSM", OSM_YML_FORMAT];

/// File extension to expect when downloading each catalogue format.
pub fn file_extension_for_format(format: &str) -> Option<&'static str> {
    match format {
        "GPKG" => Some("gpkg"),
        "ArcGIS GeoServices REST API" => Some("geojson"),
        "GeoJSON" => Some("geojson"),
        "WFS" => Some("gpkg"),
        "KML" => Some("geojson"),
        f if f == OSM_YML_FORMAT => Some("yml"),
        f if f == SITES_YML_FORMAT => Some("yml"),
        _ => None,
    }
}

/// Branch properties recognised during enrichment: keys that feed the
/// per-branch math context.
pub const BRANCH_FUNCTION_KEYS: &[&str] = &["height-to-tip", "blade-radius"];

/// Branch properties recognised during enrichment: plain defaults.
pub const BRANCH_DEFAULT_KEYS: &[&str] = &["title", "type", "clipping-path", "osm", "ckan"];

/// Size of processing grid squares in metres. The processing grid cuts core
/// datasets into squares to bound the ST_Union working set.
pub const GRID_PROCESSING_SPACING_M: i64 = 100 * 1000;

/// Size of output grid squares in metres. The output grid slices final
/// layers for rendering-friendly outputs.
pub const GRID_OUTPUT_SPACING_M: i64 = 10 * 1000;

/// Width in metres of the buffered band around processing-grid edges used
/// to detect seam geometries during postprocess.
pub const GRID_EDGE_BUFFER_M: i64 = 10;

/// Basename of the clipping master file expected under the build root.
pub fn clipping_master_filename() -> String {
    format!("clipping-master-{}.gpkg", CRS_DEFAULT.replace(':', "-"))
}

/// Basename of the OSM boundaries dataset.
pub const OSM_BOUNDARIES: &str = "osm-boundaries";

// Database namespace. Every managed table starts with the general prefix;
// internal bookkeeping tables additionally carry a leading underscore.
pub const DATABASE_GENERAL_PREFIX: &str = "opensite_";
pub const DATABASE_BASE: &str = "_opensite_";

pub const TABLE_REGISTRY: &str = "_opensite_registry";
pub const TABLE_BRANCH: &str = "_opensite_branch";
pub const TABLE_CLIPPING_MASTER: &str = "_opensite_clipping_master";
pub const TABLE_CLIPPING_TEMP: &str = "_opensite_clipping_temp";
pub const TABLE_GRID_PROCESSING: &str = "_opensite_grid_processing";
pub const TABLE_GRID_OUTPUT: &str = "_opensite_grid_output";
pub const TABLE_GRID_BUFFEDGES: &str = "_opensite_grid_buffedges";
pub const TABLE_OSM_BOUNDARIES: &str = "_opensite_osm_boundaries";

/// Tables never considered orphaned during registry sync.
pub fn protected_tables() -> Vec<&'static str> {
    vec![
        TABLE_REGISTRY,
        TABLE_BRANCH,
        TABLE_CLIPPING_MASTER,
        TABLE_CLIPPING_TEMP,
        TABLE_GRID_PROCESSING,
        TABLE_GRID_OUTPUT,
        TABLE_GRID_BUFFEDGES,
        TABLE_OSM_BOUNDARIES,
        "spatial_ref_sys",
        "geography_columns",
        "geometry_columns",
        "raster_columns",
        "raster_overview",
    ]
}

/// Well-known state flag files consumed by the wrapper daemon.
pub const PROCESSING_STATE_FILE: &str = "PROCESSING";
pub const PROCESSING_COMPLETE_FILE: &str = "PROCESSINGCOMPLETE";

/// Lookup to convert internal area slugs to OSM boundary names.
pub fn osm_name_convert() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("england", "England"),
        ("wales", "Cymru / Wales"),
        ("Wales", "Cymru / Wales"),
        ("scotland", "Alba / Scotland"),
        ("Scotland", "Alba / Scotland"),
        ("northern-ireland", "Northern Ireland / Tuaisceart Éireann"),
        ("Northern Ireland", "Northern Ireland / Tuaisceart Éireann"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_cover_catalogue_formats() {
        for format in opensite_catalogue::FORMAT_PRIORITY {
            assert!(
                file_extension_for_format(format).is_some(),
                "missing extension for {format}"
            );
        }
        assert!(file_extension_for_format("XLSX").is_none());
    }

    #[test]
    fn internal_tables_carry_base_prefix() {
        for table in [
            TABLE_REGISTRY,
            TABLE_BRANCH,
            TABLE_CLIPPING_MASTER,
            TABLE_GRID_PROCESSING,
            TABLE_GRID_OUTPUT,
            TABLE_GRID_BUFFEDGES,
            TABLE_OSM_BOUNDARIES,
        ] {
            assert!(table.starts_with(DATABASE_BASE));
        }
    }

    #[test]
    fn clipping_master_filename_embeds_crs() {
        assert_eq!(clipping_master_filename(), "clipping-master-EPSG-25830.gpkg");
    }

    #[test]
    fn osm_name_convert_maps_lowercase_slugs() {
        let map = osm_name_convert();
        assert_eq!(map.get("scotland"), Some(&"Alba / Scotland"));
        assert_eq!(map.get("england"), Some(&"England"));
    }
}
