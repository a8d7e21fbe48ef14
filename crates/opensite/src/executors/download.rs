//! Download executor.
//!
//! Streams the remote resource to a sibling `.tmp` file and renames on
//! full success, so a partially transferred file is never visible under
//! the final name. Finalized files are reused on rerun unless the format
//! is in the always-download set or `--overwrite` forces a refetch.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::constants;
use crate::node::NodeSnapshot;

use super::ExecContext;

pub async fn run(snap: &NodeSnapshot, ctx: &ExecContext) -> Result<bool> {
    let Some(url) = snap.input.as_remote() else {
        anyhow::bail!("download node {} has no remote input", snap.name);
    };

    let filename = match &snap.output {
        Some(name) => name.clone(),
        None => basename_from_url(url),
    };

    let dir = ctx.download_dir(snap.format.as_deref());
    let destination = dir.join(&filename);

    let always = snap
        .format
        .as_deref()
        .is_some_and(|f| constants::ALWAYS_DOWNLOAD.contains(&f));
    if destination.exists() && !ctx.overwrite && !always {
        warn!(file = %filename, "file exists, skipping download");
        return Ok(true);
    }

    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let tmp_path = dir.join(format!("{filename}.tmp"));

    match fetch_to_tmp(url, &tmp_path, &filename).await {
        Ok(bytes) => {
            tokio::fs::rename(&tmp_path, &destination)
                .await
                .with_context(|| format!("failed to finalize {}", destination.display()))?;
            info!(
                file = %filename,
                mb = format!("{:.1}", bytes as f64 / (1024.0 * 1024.0)),
                "download complete"
            );
            Ok(true)
        }
        Err(err) => {
            // Never leave a partial artifact behind.
            let _ = tokio::fs::remove_file(&tmp_path).await;
            warn!(url, error = %format!("{err:#}"), "download failed");
            Ok(false)
        }
    }
}

async fn fetch_to_tmp(url: &str, tmp_path: &Path, filename: &str) -> Result<u64> {
    let client = reqwest::Client::new();
    let mut response = client
        .get(url)
        .timeout(Duration::from_secs(24 * 60 * 60))
        .send()
        .await
        .with_context(|| format!("request failed: {url}"))?
        .error_for_status()
        .with_context(|| format!("bad status from {url}"))?;

    let total = response.content_length().unwrap_or(0);
    let mut file = tokio::fs::File::create(tmp_path)
        .await
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    info!(url, "downloading");

    let mut downloaded: u64 = 0;
    let mut last_log = Instant::now();

    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("read failed from {url}"))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("write failed to {}", tmp_path.display()))?;
        downloaded += chunk.len() as u64;

        // Periodic byte-progress, throttled so concurrent downloads stay
        // readable.
        if last_log.elapsed() >= Duration::from_secs(constants::PROGRESS_INTERVAL_SECS) {
            let mb_done = downloaded as f64 / (1024.0 * 1024.0);
            if total > 0 {
                let percent = (downloaded as f64 / total as f64) * 100.0;
                info!(file = %filename, "progress: {percent:.1}% ({mb_done:.1} MB)");
            } else {
                info!(file = %filename, "progress: {mb_done:.1} MB (unknown total)");
            }
            last_log = Instant::now();
        }
    }

    file.flush().await.ok();
    file.sync_all().await.ok();
    Ok(downloaded)
}

fn basename_from_url(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use super::*;
    use crate::config::{PgSettings, Settings};
    use crate::node::{Action, InputRef};
    use crate::postgis::Db;
    use crate::registry::Registry;
    use crate::vars::SharedVars;

    fn test_ctx(build_root: &Path, overwrite: bool) -> ExecContext {
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
            overwrite,
        }
    }

    fn download_snapshot(url: &str, output: &str) -> NodeSnapshot {
        NodeSnapshot {
            urn: 1,
            global_urn: 1,
            name: "dataset".to_string(),
            title: "Dataset".to_string(),
            action: Action::Download,
            format: Some("GPKG".to_string()),
            input: InputRef::Remote(url.to_string()),
            output: Some(output.to_string()),
            props: BTreeMap::new(),
        }
    }

    fn spawn_file_server(body: &'static [u8], status: u16) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let base_url = format!("http://{}", server.server_addr());

        thread::spawn(move || {
            while let Ok(request) = server.recv() {
                let response = tiny_http::Response::from_data(body.to_vec())
                    .with_status_code(tiny_http::StatusCode(status));
                let _ = request.respond(response);
            }
        });

        format!("{base_url}/data.gpkg")
    }

    #[tokio::test]
    async fn downloads_to_tmp_then_renames() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path(), false);
        let url = spawn_file_server(b"spatial-bytes", 200);

        let snap = download_snapshot(&url, "dataset.gpkg");
        let ok = run(&snap, &ctx).await.expect("run");
        assert!(ok);

        let dest = td.path().join("downloads").join("dataset.gpkg");
        assert_eq!(std::fs::read(&dest).expect("read"), b"spatial-bytes");
        assert!(!td.path().join("downloads").join("dataset.gpkg.tmp").exists());
    }

    #[tokio::test]
    async fn reuses_finalized_file_on_rerun() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path(), false);
        let dir = td.path().join("downloads");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("dataset.gpkg"), b"existing").expect("write");

        // URL is unreachable; success proves the cached file was reused.
        let snap = download_snapshot("http://127.0.0.1:1/unreachable.gpkg", "dataset.gpkg");
        let ok = run(&snap, &ctx).await.expect("run");
        assert!(ok);
        assert_eq!(
            std::fs::read(dir.join("dataset.gpkg")).expect("read"),
            b"existing"
        );
    }

    #[tokio::test]
    async fn http_error_fails_the_node_without_partial_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path(), false);
        let url = spawn_file_server(b"not found", 404);

        let snap = download_snapshot(&url, "dataset.gpkg");
        let ok = run(&snap, &ctx).await.expect("run");
        assert!(!ok);

        let dir = td.path().join("downloads");
        assert!(!dir.join("dataset.gpkg").exists());
        assert!(!dir.join("dataset.gpkg.tmp").exists());
    }

    #[tokio::test]
    async fn overwrite_refetches_existing_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(td.path(), true);
        let dir = td.path().join("downloads");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("dataset.gpkg"), b"stale").expect("write");

        let url = spawn_file_server(b"fresh-bytes", 200);
        let snap = download_snapshot(&url, "dataset.gpkg");
        let ok = run(&snap, &ctx).await.expect("run");
        assert!(ok);
        assert_eq!(
            std::fs::read(dir.join("dataset.gpkg")).expect("read"),
            b"fresh-bytes"
        );
    }

    #[test]
    fn basename_from_url_strips_query() {
        assert_eq!(
            basename_from_url("https://example.org/a/b/extract.osm.pbf?v=2"),
            "extract.osm.pbf"
        );
        assert_eq!(basename_from_url("file.zip"), "file.zip");
    }
}
