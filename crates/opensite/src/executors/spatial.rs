//! Spatial executors: buffer, preprocess, amalgamate, postprocess, clip.
//!
//! All heavy geometry work happens inside PostGIS. The shared protocol:
//! check the registry-gated early exit, build the artifact through scratch
//! tables, index it, then mark the registry row complete as the last step.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::constants;
use crate::grid;
use crate::hashing::hash16;
use crate::node::{InputRef, NodeSnapshot};
use crate::postgis::quote_ident;

use super::sql;
use super::ExecContext;

/// Iterative weld batch size.
const WELD_BATCH_SIZE: i64 = 50;

/// Run a maintenance pass on the accumulator every this many batches.
const WELD_MAINTENANCE_EVERY: usize = 5;

/// Datasets whose polygons represent boundaries rather than surfaces and
/// therefore buffer as lines.
pub fn buffers_polygons_as_lines(name: &str) -> bool {
    name.contains("hedgerows--")
}

/// Heuristic classification of PostGIS failures that indicate geometry
/// complexity or resource exhaustion, where the iterative weld fallback is
/// worth attempting. Transient errors should fail the node instead.
pub fn is_complexity_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    [
        "out of memory",
        "topologyexception",
        "geos",
        "array size exceeds",
        "invalid memory alloc",
        "statement timeout",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}

/// Stable dynamic handle for a clip output.
pub fn clip_handle(input_table: &str, area: &str) -> String {
    format!(
        "{}clip_{}",
        constants::DATABASE_GENERAL_PREFIX,
        hash16(format!("{input_table}|{area}"))
    )
}

fn input_table(snap: &NodeSnapshot) -> Result<String> {
    match &snap.input {
        InputRef::Table(table) => Ok(table.clone()),
        other => anyhow::bail!("node {} expected a table input, got {other:?}", snap.name),
    }
}

/// Buffer the input by `buffer_value` metres. Buffering always precedes
/// grid partitioning.
pub async fn buffer(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let output = snap
        .output
        .clone()
        .with_context(|| format!("buffer node {} has no output", snap.name))?;
    if ctx.table_early_exit(&output, &snap.name).await? {
        return Ok(true);
    }

    let Some(metres) = snap.prop_num("buffer_value") else {
        error!(node = %snap.name, "missing buffer_value, buffering failed");
        return Ok(false);
    };
    let input = input_table(snap)?;

    info!(node = %snap.name, metres, input, output, "adding buffer");

    let statements = sql::buffer_statements(
        &input,
        &output,
        metres,
        buffers_polygons_as_lines(&snap.name),
    )?;
    ctx.db.execute_batch(&statements).await?;
    ctx.db.add_table_comment(&output, &snap.name).await?;

    ctx.mark_complete(&output, &snap.name).await
}

/// Preprocess: dump to singletons, validate, filter to polygons, split
/// against the clipping master, then aggregate per processing-grid square.
pub async fn preprocess(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let output = snap
        .output
        .clone()
        .with_context(|| format!("preprocess node {} has no output", snap.name))?;
    if ctx.table_early_exit(&output, &snap.name).await? {
        return Ok(true);
    }

    if !grid::ensure_processing_grid(&ctx.db, &ctx.settings).await? {
        error!(node = %snap.name, "processing grid unavailable");
        return Ok(false);
    }

    let input = input_table(snap)?;
    let snap_to_grid = snap
        .props
        .get("snapgrid")
        .and_then(crate::node::PropValue::as_bool)
        .unwrap_or(false);
    let scratch1 = format!("_s1_{output}");
    let scratch2 = format!("_s2_{output}");
    let scratch3 = format!("_s3_{output}");

    for scratch in [&scratch1, &scratch2, &scratch3] {
        ctx.db.drop_table(scratch).await?;
    }

    info!(node = %snap.name, "preprocess: dump, validate, and filter to polygons");
    ctx.db
        .execute_batch(&sql::preprocess_dump_statements(
            &input, &scratch1, &scratch2, snap_to_grid,
        )?)
        .await?;

    info!(node = %snap.name, "preprocess: splitting against the clipping master");
    ctx.db
        .execute_batch(&sql::preprocess_clip_statements(&scratch2, &scratch3)?)
        .await?;

    info!(node = %snap.name, output, "preprocess: dissolving into grid squares");
    ctx.db
        .execute(&sql::partitioned_output_create(&output, constants::CRS_DEFAULT)?)
        .await?;
    ctx.db.add_table_comment(&output, &snap.name).await?;

    let square_ids = grid::grid_square_ids(&ctx.db).await?;
    let total = square_ids.len();
    let mut last_log = Instant::now();

    for (index, square_id) in square_ids.iter().enumerate() {
        let position = index + 1;
        if position == 1
            || position == total
            || last_log.elapsed() >= Duration::from_secs(constants::PROGRESS_INTERVAL_SECS)
        {
            info!(node = %snap.name, "processing grid square {position}/{total}");
            last_log = Instant::now();
        }

        ctx.db
            .execute(&sql::union_square_insert(&output, &scratch3, *square_id)?)
            .await?;
    }

    ctx.db.execute(&sql::gist_index(&output)?).await?;
    for scratch in [&scratch1, &scratch2, &scratch3] {
        ctx.db.drop_table(scratch).await?;
    }

    ctx.mark_complete(&output, &snap.name).await
}

/// Amalgamate N grid-partitioned child tables into one. A single child is
/// copied directly; several children pour into an unlogged staging table
/// and union square by square.
pub async fn amalgamate(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let output = snap
        .output
        .clone()
        .with_context(|| format!("amalgamate node {} has no output", snap.name))?;
    if ctx.table_early_exit(&output, &snap.name).await? {
        return Ok(true);
    }

    let children: Vec<String> = snap
        .prop_list("children")
        .map(|c| c.to_vec())
        .unwrap_or_default();
    if children.is_empty() {
        error!(node = %snap.name, "amalgamate has no child tables");
        return Ok(false);
    }

    if !grid::ensure_processing_grid(&ctx.db, &ctx.settings).await? {
        error!(node = %snap.name, "processing grid unavailable");
        return Ok(false);
    }

    info!(node = %snap.name, count = children.len(), "amalgamating child tables");

    ctx.db
        .execute(&sql::unlogged_partitioned_create(&output, constants::CRS_DEFAULT)?)
        .await?;
    ctx.db.add_table_comment(&output, &snap.name).await?;

    if children.len() == 1 {
        info!(node = %snap.name, child = %children[0], "single child, copying directly");
        ctx.db
            .execute(&sql::amalgamate_copy(&output, &children[0])?)
            .await?;
        ctx.db.execute(&sql::gist_index(&output)?).await?;
        return ctx.mark_complete(&output, &snap.name).await;
    }

    let staging = format!("_s1_{output}");
    ctx.db.drop_table(&staging).await?;
    ctx.db
        .execute(&sql::unlogged_partitioned_create(&staging, constants::CRS_DEFAULT)?)
        .await?;

    for (index, child) in children.iter().enumerate() {
        info!(
            node = %snap.name,
            "amalgamating child table {}/{}",
            index + 1,
            children.len()
        );
        ctx.db.execute(&sql::amalgamate_pour(&staging, child)?).await?;
    }
    ctx.db.execute(&sql::gist_index(&staging)?).await?;

    let square_ids = grid::grid_square_ids(&ctx.db).await?;
    let total = square_ids.len();
    let mut last_log = Instant::now();

    for (index, square_id) in square_ids.iter().enumerate() {
        let position = index + 1;
        if position == 1
            || position == total
            || last_log.elapsed() >= Duration::from_secs(constants::PROGRESS_INTERVAL_SECS)
        {
            info!(node = %snap.name, "unioning amalgamated grid square {position}/{total}");
            last_log = Instant::now();
        }
        ctx.db
            .execute(&sql::union_square_insert(&output, &staging, *square_id)?)
            .await?;
    }

    ctx.db.execute(&sql::gist_index(&output)?).await?;
    ctx.db.drop_table(&staging).await?;

    ctx.mark_complete(&output, &snap.name).await
}

/// Postprocess: weld seams across grid squares, leave islands untouched.
pub async fn postprocess(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let output = snap
        .output
        .clone()
        .with_context(|| format!("postprocess node {} has no output", snap.name))?;
    if ctx.table_early_exit(&output, &snap.name).await? {
        return Ok(true);
    }

    if !grid::ensure_buffered_edges(&ctx.db).await? {
        error!(node = %snap.name, "buffered grid edges unavailable");
        return Ok(false);
    }

    let input = input_table(snap)?;
    let seams = format!("_w1_{output}");
    let islands = format!("_w2_{output}");
    let welded = format!("_w3_{output}");
    let accumulator = format!("_wa_{output}");
    let acc_next = format!("_wb_{output}");

    for scratch in [&seams, &islands, &welded, &accumulator, &acc_next] {
        ctx.db.drop_table(scratch).await?;
    }

    info!(node = %snap.name, "postprocess: splitting seams from islands");
    ctx.db.execute_batch(&sql::seams_create(&input, &seams)?).await?;
    ctx.db.execute(&sql::islands_create(&input, &islands)?).await?;

    let seam_count = ctx.db.count_rows(&seams).await?;
    info!(node = %snap.name, seam_count, "postprocess: seam set sized");

    if seam_count == 0 {
        // Boundary case: the output is exactly the island set.
        ctx.db
            .execute_batch(&sql::weld_output_degraded(
                &seams,
                &islands,
                &output,
                constants::CRS_DEFAULT,
            )?)
            .await?;
    } else {
        let welded_ok = match ctx.db.execute(&sql::weld_conventional(&seams, &welded)?).await {
            Ok(_) => true,
            Err(err) => {
                let message = format!("{err:#}");
                if !is_complexity_error(&message) {
                    error!(node = %snap.name, error = %message, "seam weld failed");
                    return Ok(false);
                }
                warn!(
                    node = %snap.name,
                    "conventional weld failed on geometry complexity, \
                     falling back to iterative weld"
                );
                iterative_weld(snap, ctx, &seams, &accumulator, &acc_next, &welded)
                    .await?
            }
        };

        if welded_ok {
            ctx.db
                .execute_batch(&sql::weld_output_create(
                    &welded,
                    &islands,
                    &output,
                    constants::CRS_DEFAULT,
                )?)
                .await?;
        } else {
            // Degrade gracefully: keep grid-partitioned seams.
            warn!(node = %snap.name, "both weld strategies failed, keeping partitioned seams");
            ctx.db
                .execute_batch(&sql::weld_output_degraded(
                    &seams,
                    &islands,
                    &output,
                    constants::CRS_DEFAULT,
                )?)
                .await?;
        }
    }

    ctx.db.execute(&sql::gist_index(&output)?).await?;
    ctx.db.add_table_comment(&output, &snap.name).await?;

    for scratch in [&seams, &islands, &welded, &accumulator, &acc_next] {
        ctx.db.drop_table(scratch).await?;
    }

    ctx.mark_complete(&output, &snap.name).await
}

/// Iterative weld: seed with the first seam, then union batches of
/// [`WELD_BATCH_SIZE`] into the accumulator, collapsing and periodically
/// reclaiming space. Returns whether the weld succeeded; the accumulator
/// is renamed to the welded table on success.
async fn iterative_weld(
    snap: &NodeSnapshot,
    ctx: &ExecContext,
    seams: &str,
    accumulator: &str,
    acc_next: &str,
    welded: &str,
) -> Result<bool> {
    let max_row = ctx
        .db
        .query(
            &format!(
                "SELECT COALESCE(MAX(seam_id), 0) FROM {}",
                quote_ident(seams)?
            ),
            &[],
        )
        .await?
        .first()
        .map(|r| r.get::<_, i64>(0))
        .unwrap_or(0);

    let result: Result<()> = async {
        ctx.db.execute(&sql::weld_seed(seams, accumulator)?).await?;

        let mut lo = 1i64;
        let mut batch_index = 0usize;
        while lo < max_row {
            let hi = (lo + WELD_BATCH_SIZE).min(max_row);
            ctx.db
                .execute(&sql::weld_batch_insert(seams, accumulator, lo, hi)?)
                .await?;
            ctx.db
                .execute_batch(&sql::weld_collapse(accumulator, acc_next)?)
                .await?;

            batch_index += 1;
            if batch_index % WELD_MAINTENANCE_EVERY == 0 {
                // Collapse churns dead tuples quickly; reclaim as we go.
                ctx.db
                    .execute(&format!("VACUUM {}", quote_ident(accumulator)?))
                    .await
                    .ok();
                info!(
                    node = %snap.name,
                    progress = format!("{hi}/{max_row}"),
                    "iterative weld maintenance pass"
                );
            }
            lo = hi;
        }

        ctx.db
            .execute(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(accumulator)?,
                quote_ident(welded)?
            ))
            .await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok(true),
        Err(err) => {
            error!(node = %snap.name, error = %format!("{err:#}"), "iterative weld failed");
            Ok(false)
        }
    }
}

/// Clip against a named administrative area and project to the output CRS.
/// The output handle is derived from the input table and area name, and
/// published under the node's global urn for downstream consumers.
pub async fn clip(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let input = input_table(snap)?;
    let area = snap
        .prop_str("clip")
        .with_context(|| format!("clip node {} has no clip property", snap.name))?
        .to_string();

    let output = clip_handle(&input, &area);
    ctx.vars.publish_output(snap.global_urn, output.clone());

    if ctx.table_early_exit(&output, &snap.name).await? {
        return Ok(true);
    }

    // Dynamic handles register at execution time, stamped with the owning
    // branch like any static row.
    let branch = snap.prop_str("branch").unwrap_or_default().to_string();
    let hash = snap.prop_str("hash").unwrap_or_default().to_string();
    ctx.registry
        .register_node_output(&output, &snap.name, &branch, &hash)
        .await?;

    // Canonical-name mapping widens the match set for country slugs.
    let mut areas = vec![area.clone()];
    if let Some(converted) = constants::osm_name_convert().get(area.as_str()) {
        areas.push((*converted).to_string());
    }

    info!(node = %snap.name, area, output, "clipping to administrative area");

    ctx.db.execute(&sql::clip_create(&input, &output, &areas)?).await?;
    ctx.db.execute(&sql::gist_index(&output)?).await?;
    ctx.db.add_table_comment(&output, &snap.name).await?;

    ctx.mark_complete(&output, &snap.name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hedgerows_buffer_as_lines() {
        assert!(buffers_polygons_as_lines("hedgerows--england"));
        assert!(!buffers_polygons_as_lines("railway-lines--england"));
    }

    #[test]
    fn complexity_classification_matches_resource_errors() {
        assert!(is_complexity_error("ERROR: out of memory"));
        assert!(is_complexity_error("GEOS error: TopologyException"));
        assert!(is_complexity_error("canceling due to statement timeout"));
        assert!(!is_complexity_error("connection refused"));
        assert!(!is_complexity_error("relation does not exist"));
    }

    #[test]
    fn clip_handles_are_stable_and_managed() {
        let a = clip_handle("opensite_transport_welded", "england");
        let b = clip_handle("opensite_transport_welded", "england");
        let c = clip_handle("opensite_transport_welded", "scotland");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("opensite_clip_"));
        assert_eq!(a.len(), "opensite_clip_".len() + 16);
        crate::postgis::validate_identifier(&a).expect("valid identifier");
    }
}
