//! Extract (unzip) executor.
//!
//! Extracts the archive into a work directory named after the target,
//! locates the single largest member whose extension matches, and
//! atomically renames it into place. A target older than its archive is
//! re-extracted; anything else skips.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::node::{InputRef, NodeSnapshot};

use super::ExecContext;

pub async fn run(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let InputRef::File(archive_name) = &snap.input else {
        anyhow::bail!("unzip node {} has no archive input", snap.name);
    };
    let target_name = snap
        .output
        .clone()
        .with_context(|| format!("unzip node {} has no output", snap.name))?;

    let dir = ctx.download_dir(snap.format.as_deref());
    let archive = dir.join(archive_name);
    let target = dir.join(&target_name);

    if target.exists() && !ctx.overwrite {
        let archive_mtime = archive.metadata().and_then(|m| m.modified()).ok();
        let target_mtime = target.metadata().and_then(|m| m.modified()).ok();
        match (archive_mtime, target_mtime) {
            (Some(a), Some(t)) if t > a => {
                info!(file = %target_name, "skipping, already extracted and up to date");
                return Ok(true);
            }
            _ => info!(file = %target_name, "re-extracting, source archive is newer"),
        }
    }

    if !archive.exists() {
        error!(archive = %archive.display(), "source zip not found");
        return Ok(false);
    }

    let target_ext = match target.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_lowercase(),
        None => {
            error!(target = %target.display(), "output path has no extension");
            return Ok(false);
        }
    };

    info!(archive = %archive_name, "unzipping");

    let result = tokio::task::spawn_blocking(move || {
        extract_largest_member(&archive, &target, &target_ext)
    })
    .await
    .context("unzip task panicked")?;

    match result {
        Ok(()) => {
            info!(file = %target_name, "extraction finalized");
            Ok(true)
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "unzip failed");
            Ok(false)
        }
    }
}

/// Extract everything into a work directory, pick the largest member with
/// the wanted extension, and rename it to the target.
fn extract_largest_member(archive: &Path, target: &Path, target_ext: &str) -> Result<()> {
    // The work directory reuses the target path, so clean up debris from
    // previous failed runs first.
    let work_dir = target.to_path_buf();
    if work_dir.exists() {
        if work_dir.is_dir() {
            fs::remove_dir_all(&work_dir)?;
        } else {
            fs::remove_file(&work_dir)?;
        }
    }
    fs::create_dir_all(&work_dir)?;

    let file = fs::File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("malformed archive {}", archive.display()))?;
    zip.extract(&work_dir)
        .with_context(|| format!("failed to extract {}", archive.display()))?;

    let best = largest_with_extension(&work_dir, target_ext)?;
    let Some(source) = best else {
        fs::remove_dir_all(&work_dir).ok();
        anyhow::bail!(
            "no member with extension .{target_ext} found in {}",
            archive.display()
        );
    };

    let temp_final = target.with_file_name(format!(
        "{}.tmp_final",
        target.file_name().and_then(|n| n.to_str()).unwrap_or("out")
    ));
    fs::rename(&source, &temp_final)?;
    fs::remove_dir_all(&work_dir)?;
    fs::rename(&temp_final, target)?;
    Ok(())
}

fn largest_with_extension(dir: &Path, ext: &str) -> Result<Option<PathBuf>> {
    let mut best: Option<(u64, PathBuf)> = None;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ext));
            if !matches {
                continue;
            }
            let size = entry.metadata()?.len();
            if best.as_ref().is_none_or(|(s, _)| size > *s) {
                best = Some((size, path));
            }
        }
    }

    Ok(best.map(|(_, p)| p))
}
