//! Environment-driven settings.
//!
//! The engine is configured entirely from the environment: PostgreSQL
//! connection parameters, the build-folder root, the tile-server URL, an
//! optional Python override for the QGIS project-file builder, and the
//! server-mode secret key (generated and persisted to `.env` on first run).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::RngExt;
use serde::{Deserialize, Serialize};

pub const ENV_PG_HOST: &str = "OPENSITE_POSTGRES_HOST";
pub const ENV_PG_DATABASE: &str = "OPENSITE_POSTGRES_DB";
pub const ENV_PG_USER: &str = "OPENSITE_POSTGRES_USER";
pub const ENV_PG_PASSWORD: &str = "OPENSITE_POSTGRES_PASSWORD";
pub const ENV_BUILD_FOLDER: &str = "BUILD_FOLDER";
pub const ENV_TILESERVER_URL: &str = "OPENSITE_TILESERVER_URL";
pub const ENV_QGIS_PYTHON: &str = "OPENSITE_QGIS_PYTHON";
pub const ENV_SECRET_KEY: &str = "OPENSITE_SECRET_KEY";

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgSettings {
    pub host: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl PgSettings {
    /// Connection string in the `PG:` form ogr2ogr expects.
    pub fn ogr_connection_string(&self) -> String {
        format!(
            "PG:host={} dbname={} user={} password={}",
            self.host, self.database, self.user, self.password
        )
    }
}

/// Complete engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub pg: PgSettings,
    /// Root build directory; all artifacts live beneath it.
    pub build_root: PathBuf,
    pub tileserver_url: String,
    /// Optional Python interpreter override for the QGIS project builder.
    pub qgis_python: Option<PathBuf>,
    /// Secret key for server mode; generated on first run.
    pub secret_key: Option<String>,
}

impl Settings {
    /// Read settings from the environment, applying defaults where the
    /// variable is absent.
    pub fn from_env() -> Self {
        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        Self {
            pg: PgSettings {
                host: env(ENV_PG_HOST, "localhost"),
                database: env(ENV_PG_DATABASE, "opensite"),
                user: env(ENV_PG_USER, "postgres"),
                password: env(ENV_PG_PASSWORD, "postgres"),
            },
            build_root: PathBuf::from(env(ENV_BUILD_FOLDER, "build")),
            tileserver_url: env(ENV_TILESERVER_URL, "http://localhost:8080"),
            qgis_python: std::env::var(ENV_QGIS_PYTHON).ok().map(PathBuf::from),
            secret_key: std::env::var(ENV_SECRET_KEY).ok(),
        }
    }

    pub fn downloads_folder(&self) -> PathBuf {
        self.build_root.join("downloads")
    }

    pub fn osm_downloads_folder(&self) -> PathBuf {
        self.downloads_folder().join("osm")
    }

    pub fn cache_folder(&self) -> PathBuf {
        self.build_root.join("cache")
    }

    pub fn logs_folder(&self) -> PathBuf {
        self.build_root.join("logs")
    }

    pub fn output_folder(&self) -> PathBuf {
        self.build_root.join("output")
    }

    pub fn output_layers_folder(&self) -> PathBuf {
        self.output_folder().join("layers")
    }

    pub fn tileserver_folder(&self) -> PathBuf {
        self.build_root.join("tileserver")
    }

    pub fn install_folder(&self) -> PathBuf {
        self.build_root.join("install")
    }

    /// Every folder the engine expects to exist.
    pub fn all_folders(&self) -> Vec<PathBuf> {
        vec![
            self.build_root.clone(),
            self.downloads_folder(),
            self.osm_downloads_folder(),
            self.cache_folder(),
            self.logs_folder(),
            self.output_folder(),
            self.output_layers_folder(),
            self.tileserver_folder(),
            self.install_folder(),
        ]
    }

    pub fn ensure_folders(&self) -> Result<()> {
        for folder in self.all_folders() {
            fs::create_dir_all(&folder)
                .with_context(|| format!("failed to create folder {}", folder.display()))?;
        }
        Ok(())
    }

    /// Ensure a secret key exists, generating one and appending it to the
    /// given `.env` file when missing.
    pub fn ensure_secret_key(&mut self, env_path: &Path) -> Result<&str> {
        if self.secret_key.is_none() {
            let key = generate_secret_key();
            persist_env_var(env_path, ENV_SECRET_KEY, &key)?;
            self.secret_key = Some(key);
        }
        Ok(self.secret_key.as_deref().expect("secret key set above"))
    }
}

fn generate_secret_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Append `KEY=value` to an env file, creating it if needed and keeping the
/// file newline-terminated.
fn persist_env_var(env_path: &Path, key: &str, value: &str) -> Result<()> {
    let mut content = if env_path.exists() {
        fs::read_to_string(env_path)
            .with_context(|| format!("failed to read {}", env_path.display()))?
    } else {
        String::new()
    };

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!("{key}={value}\n"));

    fs::write(env_path, content)
        .with_context(|| format!("failed to write {}", env_path.display()))?;
    Ok(())
}
