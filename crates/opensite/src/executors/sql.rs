//! SQL statement builders for the spatial executors.
//!
//! Table names come from YAML slugs, so every identifier is validated and
//! quoted before splicing. Keeping these as pure functions lets the weld
//! and grid protocols be tested without a live PostGIS.

use anyhow::Result;

use crate::constants;
use crate::postgis::{quote_ident, quote_literal};

/// CRS number for SQL literals: `EPSG:25830` -> `25830`.
pub fn crs_number(crs: &str) -> String {
    crs.trim_start_matches("EPSG:").to_string()
}

/// Buffer a table by `metres`. When `polygons_as_lines` is set, polygon
/// rows are buffered via their boundary instead of their area (hedgerow
/// polygons represent boundaries, not surfaces).
pub fn buffer_statements(
    input: &str,
    output: &str,
    metres: f64,
    polygons_as_lines: bool,
) -> Result<Vec<String>> {
    let input = quote_ident(input)?;
    let out = quote_ident(output)?;
    let index = quote_ident(&format!("{output}_idx"))?;

    let create = if polygons_as_lines {
        format!(
            "CREATE TABLE {out} AS (\
             (SELECT ST_Buffer(geom, {metres}) geom FROM {input} \
              WHERE ST_GeometryType(geom) = 'ST_LineString') UNION \
             (SELECT ST_Buffer(ST_Boundary(geom), {metres}) geom FROM {input} \
              WHERE ST_GeometryType(geom) IN ('ST_Polygon', 'ST_MultiPolygon')))"
        )
    } else {
        format!("CREATE TABLE {out} AS SELECT ST_Buffer(geom, {metres}) geom FROM {input}")
    };

    Ok(vec![
        create,
        format!("CREATE INDEX {index} ON {out} USING GIST (geom)"),
    ])
}

/// Preprocess stage (a): dump multipart geometries to singletons, make
/// them valid, and keep polygons only.
pub fn preprocess_dump_statements(
    input: &str,
    scratch1: &str,
    scratch2: &str,
    snap_to_grid: bool,
) -> Result<Vec<String>> {
    let input = quote_ident(input)?;
    let s1 = quote_ident(scratch1)?;
    let s2 = quote_ident(scratch2)?;
    let s1_idx = quote_ident(&format!("{scratch1}_idx"))?;
    let s2_idx = quote_ident(&format!("{scratch2}_idx"))?;

    let source_geom = if snap_to_grid {
        // Snap to a 1m lattice before validation so neighbouring datasets
        // share vertices along grid seams.
        "ST_SnapToGrid(geom, 1.0)"
    } else {
        "geom"
    };

    Ok(vec![
        format!(
            "CREATE TABLE {s1} AS \
             SELECT ST_MakeValid(dumped.geom) geom \
             FROM (SELECT (ST_Dump({source_geom})).geom geom FROM {input}) dumped \
             WHERE ST_GeometryType(dumped.geom) = 'ST_Polygon'"
        ),
        format!("CREATE INDEX {s1_idx} ON {s1} USING GIST (geom)"),
        format!("CREATE TABLE {s2} AS SELECT (ST_Dump(geom)).geom geom FROM {s1}"),
        format!("CREATE INDEX {s2_idx} ON {s2} USING GIST (geom)"),
    ])
}

/// Preprocess stage (b): split against the master clipping polygon so only
/// boundary-crossing geometries pay for an intersection.
pub fn preprocess_clip_statements(scratch2: &str, clipped: &str) -> Result<Vec<String>> {
    let s2 = quote_ident(scratch2)?;
    let out = quote_ident(clipped)?;
    let out_idx = quote_ident(&format!("{clipped}_idx"))?;
    let master = quote_ident(constants::TABLE_CLIPPING_MASTER)?;

    Ok(vec![
        format!(
            "CREATE TABLE {out} AS (\
             (SELECT (ST_Dump(ST_Intersection(d.geom, m.geom))).geom geom \
              FROM {s2} d, {master} m \
              WHERE ST_Intersects(d.geom, m.geom) AND NOT ST_Within(d.geom, m.geom)) \
             UNION ALL \
             (SELECT d.geom FROM {s2} d, {master} m WHERE ST_Within(d.geom, m.geom)))"
        ),
        format!("CREATE INDEX {out_idx} ON {out} USING GIST (geom)"),
    ])
}

/// Create the grid-partitioned `(id, geom)` output table.
pub fn partitioned_output_create(output: &str, crs: &str) -> Result<String> {
    let out = quote_ident(output)?;
    let crs = crs_number(crs);
    Ok(format!(
        "CREATE TABLE {out} (id INTEGER, geom GEOMETRY(Polygon, {crs}))"
    ))
}

/// Per-square intersection-then-union insert. Joining on the square id
/// first keeps the union working set bounded to one square.
pub fn union_square_insert(
    output: &str,
    source: &str,
    gridsquare_id: i32,
) -> Result<String> {
    let out = quote_ident(output)?;
    let source = quote_ident(source)?;
    let grid = quote_ident(constants::TABLE_GRID_PROCESSING)?;

    Ok(format!(
        "INSERT INTO {out} (id, geom) \
         SELECT grid.id, (ST_Dump(ST_Union(ST_Intersection(grid.geom, dataset.geom)))).geom \
         FROM {grid} grid \
         INNER JOIN {source} dataset ON ST_Intersects(grid.geom, dataset.geom) \
         WHERE grid.id = {gridsquare_id} AND ST_GeometryType(dataset.geom) = 'ST_Polygon' \
         GROUP BY grid.id"
    ))
}

pub fn gist_index(output: &str) -> Result<String> {
    let out = quote_ident(output)?;
    let index = quote_ident(&format!("{output}_idx"))?;
    Ok(format!("CREATE INDEX {index} ON {out} USING GIST (geom)"))
}

/// Amalgamate: unlogged staging/output tables keep the pour cheap.
pub fn unlogged_partitioned_create(table: &str, crs: &str) -> Result<String> {
    let ident = quote_ident(table)?;
    let crs = crs_number(crs);
    Ok(format!(
        "CREATE UNLOGGED TABLE {ident} (id int, geom geometry(Geometry, {crs}))"
    ))
}

/// Single-child amalgamate: direct copy.
pub fn amalgamate_copy(output: &str, input: &str) -> Result<String> {
    let out = quote_ident(output)?;
    let input = quote_ident(input)?;
    Ok(format!("INSERT INTO {out} SELECT * FROM {input}"))
}

/// Pour one child table into the staging table, dumped to singletons.
pub fn amalgamate_pour(staging: &str, child: &str) -> Result<String> {
    let staging = quote_ident(staging)?;
    let child = quote_ident(child)?;
    Ok(format!(
        "INSERT INTO {staging} (id, geom) SELECT id, (ST_Dump(geom)).geom FROM {child}"
    ))
}

/// Postprocess: seam rows intersect the buffered grid-edge band.
pub fn seams_create(input: &str, seams: &str) -> Result<Vec<String>> {
    let input = quote_ident(input)?;
    let out = quote_ident(seams)?;
    let edges = quote_ident(constants::TABLE_GRID_BUFFEDGES)?;

    Ok(vec![
        format!(
            "CREATE UNLOGGED TABLE {out} AS \
             SELECT row_number() OVER () seam_id, d.geom \
             FROM {input} d \
             WHERE EXISTS (SELECT 1 FROM {edges} e WHERE ST_Intersects(d.geom, e.geom))"
        ),
        format!(
            "CREATE INDEX ON {out} USING GIST (geom)"
        ),
    ])
}

/// Postprocess: island rows are wholly interior to one grid square.
pub fn islands_create(input: &str, islands: &str) -> Result<String> {
    let input = quote_ident(input)?;
    let out = quote_ident(islands)?;
    let edges = quote_ident(constants::TABLE_GRID_BUFFEDGES)?;

    Ok(format!(
        "CREATE UNLOGGED TABLE {out} AS \
         SELECT d.id, d.geom FROM {input} d \
         WHERE NOT EXISTS (SELECT 1 FROM {edges} e WHERE ST_Intersects(d.geom, e.geom))"
    ))
}

/// Conventional weld: one union over the whole seam set.
pub fn weld_conventional(seams: &str, welded: &str) -> Result<String> {
    let seams = quote_ident(seams)?;
    let out = quote_ident(welded)?;
    Ok(format!(
        "CREATE UNLOGGED TABLE {out} AS \
         SELECT (ST_Dump(ST_Union(geom))).geom geom FROM {seams}"
    ))
}

/// Iterative weld seeding: the accumulator starts from the first seam.
pub fn weld_seed(seams: &str, accumulator: &str) -> Result<String> {
    let seams = quote_ident(seams)?;
    let acc = quote_ident(accumulator)?;
    Ok(format!(
        "CREATE UNLOGGED TABLE {acc} AS \
         SELECT geom FROM {seams} ORDER BY seam_id LIMIT 1"
    ))
}

/// Iterative weld step: pull one batch of seams into the accumulator.
pub fn weld_batch_insert(seams: &str, accumulator: &str, lo: i64, hi: i64) -> Result<String> {
    let seams = quote_ident(seams)?;
    let acc = quote_ident(accumulator)?;
    Ok(format!(
        "INSERT INTO {acc} (geom) \
         SELECT geom FROM {seams} WHERE seam_id > {lo} AND seam_id <= {hi}"
    ))
}

/// Iterative weld step: collapse the accumulator back to one unioned set.
pub fn weld_collapse(accumulator: &str, next: &str) -> Result<Vec<String>> {
    let acc = quote_ident(accumulator)?;
    let next_ident = quote_ident(next)?;
    Ok(vec![
        format!(
            "CREATE UNLOGGED TABLE {next_ident} AS \
             SELECT (ST_Dump(ST_Union(geom))).geom geom FROM {acc}"
        ),
        format!("DROP TABLE {acc}"),
        format!("ALTER TABLE {next_ident} RENAME TO {acc}"),
    ])
}

/// Postprocess output: welded seams plus untouched islands.
pub fn weld_output_create(welded: &str, islands: &str, output: &str, crs: &str) -> Result<Vec<String>> {
    let welded = quote_ident(welded)?;
    let islands = quote_ident(islands)?;
    let out = quote_ident(output)?;
    let crs = crs_number(crs);

    Ok(vec![
        format!("CREATE TABLE {out} (id int, geom geometry(Geometry, {crs}))"),
        format!("INSERT INTO {out} (id, geom) SELECT NULL, geom FROM {welded}"),
        format!("INSERT INTO {out} (id, geom) SELECT id, geom FROM {islands}"),
    ])
}

/// Degraded postprocess output: grid-partitioned seams kept as they are.
pub fn weld_output_degraded(seams: &str, islands: &str, output: &str, crs: &str) -> Result<Vec<String>> {
    let seams = quote_ident(seams)?;
    let islands = quote_ident(islands)?;
    let out = quote_ident(output)?;
    let crs = crs_number(crs);

    Ok(vec![
        format!("CREATE TABLE {out} (id int, geom geometry(Geometry, {crs}))"),
        format!("INSERT INTO {out} (id, geom) SELECT NULL, geom FROM {seams}"),
        format!("INSERT INTO {out} (id, geom) SELECT id, geom FROM {islands}"),
    ])
}

/// Clip: intersect with named admin areas and project to the output CRS.
pub fn clip_create(input: &str, output: &str, areas: &[String]) -> Result<String> {
    let input = quote_ident(input)?;
    let out = quote_ident(output)?;
    let boundaries = quote_ident(constants::TABLE_OSM_BOUNDARIES)?;
    let crs_out = crs_number(constants::CRS_OUTPUT);

    let area_list = areas
        .iter()
        .map(|a| quote_literal(a))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "CREATE TABLE {out} AS \
         SELECT ST_Transform((ST_Dump(ST_Intersection(d.geom, b.geom))).geom, {crs_out}) geom \
         FROM {input} d, {boundaries} b \
         WHERE (b.name ILIKE ANY (ARRAY[{area_list}]) OR b.council_name ILIKE ANY (ARRAY[{area_list}])) \
         AND ST_Intersects(d.geom, b.geom)"
    ))
}

/// Country containment lookup for clip-area validation.
pub fn country_from_area(area: &str, countries: &[String]) -> Result<String> {
    let boundaries = quote_ident(constants::TABLE_OSM_BOUNDARIES)?;
    let area = quote_literal(area);
    let country_list = countries
        .iter()
        .map(|c| quote_literal(c))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "WITH primaryarea AS (\
         SELECT geom FROM {boundaries} \
         WHERE (name ILIKE {area}) OR (council_name ILIKE {area}) LIMIT 1) \
         SELECT name, ST_Area(ST_Intersection(primaryarea.geom, secondaryarea.geom)) geom_intersection \
         FROM {boundaries} secondaryarea, primaryarea \
         WHERE name IN ({country_list}) AND ST_Intersects(primaryarea.geom, secondaryarea.geom) \
         ORDER BY geom_intersection DESC LIMIT 1"
    ))
}
