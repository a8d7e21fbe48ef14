//! Clipping-master and grid bootstrap.
//!
//! The processing grid tessellates the master clipping polygon into coarse
//! squares so per-square unions stay inside a bounded working set; the
//! output grid uses a finer spacing for rendering-friendly slices; the
//! buffered-edges table marks the seam band between adjacent squares for
//! the postprocess weld.

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Settings;
use crate::constants;
use crate::postgis::{Db, quote_ident};

/// Import the clipping master file if its table is missing.
pub async fn ensure_clipping_master(db: &Db, settings: &Settings) -> Result<bool> {
    if db.table_exists(constants::TABLE_CLIPPING_MASTER).await? {
        return Ok(true);
    }

    let file = settings.build_root.join(constants::clipping_master_filename());
    if !file.exists() {
        error!(file = %file.display(), "clipping master file missing");
        return Ok(false);
    }

    info!(file = %file.display(), "importing clipping master");

    let conn = db.ogr_connection_string();
    let file_str = file.to_string_lossy().to_string();
    let output = tokio::task::spawn_blocking(move || {
        opensite_process::run_ogr2ogr(&[
            "-f",
            "PostgreSQL",
            &conn,
            &file_str,
            "-overwrite",
            "-lco",
            "GEOMETRY_NAME=geom",
            "-nln",
            constants::TABLE_CLIPPING_MASTER,
            "-nlt",
            "PROMOTE_TO_MULTI",
            "--config",
            "PG_USE_COPY",
            "YES",
            "--config",
            "OGR_PG_ENABLE_METADATA",
            "NO",
        ])
    })
    .await
    .context("ogr2ogr task panicked")??;

    if !output.success() {
        error!(stderr = %output.stderr.trim(), "clipping master import failed");
        return Ok(false);
    }
    Ok(true)
}

/// Square-grid creation statements shared by both grids.
pub fn grid_statements(grid_table: &str, spacing_m: i64) -> Result<Vec<String>> {
    let grid = quote_ident(grid_table)?;
    let index = quote_ident(&format!("{grid_table}_idx"))?;
    let master = quote_ident(constants::TABLE_CLIPPING_MASTER)?;
    let crs = constants::CRS_DEFAULT.trim_start_matches("EPSG:");

    Ok(vec![
        format!(
            "CREATE TABLE {grid} AS \
             SELECT (ST_SquareGrid({spacing_m}, ST_SetSRID(extent_geom, {crs}))).geom::geometry(Polygon, {crs}) as geom \
             FROM (SELECT ST_Extent(geom)::geometry as extent_geom FROM {master}) AS sub"
        ),
        format!(
            "ALTER TABLE {grid} ADD COLUMN id INTEGER PRIMARY KEY GENERATED ALWAYS AS IDENTITY"
        ),
        format!(
            "DELETE FROM {grid} g WHERE NOT EXISTS \
             (SELECT 1 FROM {master} c WHERE ST_Intersects(g.geom, c.geom))"
        ),
        format!("CREATE INDEX {index} ON {grid} USING GIST (geom)"),
    ])
}

/// Buffered band around every processing-grid square edge; geometries
/// intersecting it are seam geometries during postprocess.
pub fn buffered_edges_statements() -> Result<Vec<String>> {
    let edges = quote_ident(constants::TABLE_GRID_BUFFEDGES)?;
    let index = quote_ident(&format!("{}_idx", constants::TABLE_GRID_BUFFEDGES))?;
    let grid = quote_ident(constants::TABLE_GRID_PROCESSING)?;
    let buffer = constants::GRID_EDGE_BUFFER_M;

    Ok(vec![
        format!(
            "CREATE TABLE {edges} AS \
             SELECT g.id, ST_Buffer(ST_Boundary(g.geom), {buffer}) geom FROM {grid} g"
        ),
        format!("CREATE INDEX {index} ON {edges} USING GIST (geom)"),
    ])
}

/// Create the processing grid if missing. The clipping master must exist.
pub async fn ensure_processing_grid(db: &Db, settings: &Settings) -> Result<bool> {
    if db.table_exists(constants::TABLE_GRID_PROCESSING).await? {
        info!("processing grid already exists");
        return Ok(true);
    }
    if !ensure_clipping_master(db, settings).await? {
        return Ok(false);
    }

    info!(
        spacing = constants::GRID_PROCESSING_SPACING_M,
        "creating processing grid to bound ST_Union working sets"
    );
    db.execute_batch(&grid_statements(
        constants::TABLE_GRID_PROCESSING,
        constants::GRID_PROCESSING_SPACING_M,
    )?)
    .await?;
    Ok(true)
}

/// Create the finer output grid if missing.
pub async fn ensure_output_grid(db: &Db, settings: &Settings) -> Result<bool> {
    if db.table_exists(constants::TABLE_GRID_OUTPUT).await? {
        return Ok(true);
    }
    if !ensure_clipping_master(db, settings).await? {
        return Ok(false);
    }

    info!(
        spacing = constants::GRID_OUTPUT_SPACING_M,
        "creating output grid"
    );
    db.execute_batch(&grid_statements(
        constants::TABLE_GRID_OUTPUT,
        constants::GRID_OUTPUT_SPACING_M,
    )?)
    .await?;
    Ok(true)
}

/// Create the buffered-edges table if missing.
pub async fn ensure_buffered_edges(db: &Db) -> Result<bool> {
    if db.table_exists(constants::TABLE_GRID_BUFFEDGES).await? {
        return Ok(true);
    }
    if !db.table_exists(constants::TABLE_GRID_PROCESSING).await? {
        error!("processing grid missing, cannot derive buffered edges");
        return Ok(false);
    }

    db.execute_batch(&buffered_edges_statements()?).await?;
    Ok(true)
}

/// Ids of every processing-grid square, in stable order.
pub async fn grid_square_ids(db: &Db) -> Result<Vec<i32>> {
    let grid = quote_ident(constants::TABLE_GRID_PROCESSING)?;
    let rows = db
        .query(&format!("SELECT id FROM {grid} ORDER BY id"), &[])
        .await?;
    Ok(rows.iter().map(|r| r.get::<_, i32>(0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_statements_build_over_master_extent() {
        let stmts =
            grid_statements(constants::TABLE_GRID_PROCESSING, 100_000).expect("statements");
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].contains("ST_SquareGrid(100000"));
        assert!(stmts[0].contains("25830"));
        assert!(stmts[1].contains("GENERATED ALWAYS AS IDENTITY"));
        assert!(stmts[2].contains("NOT EXISTS"));
        assert!(stmts[3].contains("USING GIST"));
    }

    #[test]
    fn buffered_edges_wrap_square_boundaries() {
        let stmts = buffered_edges_statements().expect("statements");
        assert!(stmts[0].contains("ST_Buffer(ST_Boundary(g.geom)"));
        assert!(stmts[0].contains(&constants::GRID_EDGE_BUFFER_M.to_string()));
    }
}
