//! Durable registry of managed tables.
//!
//! Two bookkeeping tables track every spatial table the engine produces:
//! the branch table maps configuration hashes to full branch configs, and
//! the registry maps each output handle to its logical name, producing
//! branch, configuration hash, and completion flag. Completion is only
//! flipped after the artifact write succeeds, which makes reruns and crash
//! recovery idempotent.

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::constants;
use crate::graph::Graph;
use crate::postgis::{Db, quote_ident};

/// Outcome of the startup synchronization pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub incomplete_rows_dropped: usize,
    pub orphaned_rows_dropped: usize,
    pub untracked_tables_dropped: usize,
    pub orphaned_branches_dropped: usize,
}

#[derive(Clone, Debug)]
pub struct Registry {
    db: Db,
}

impl Registry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Create the bookkeeping tables if they do not exist.
    pub async fn ensure_tables(&self) -> Result<()> {
        debug!("creating {} table", constants::TABLE_BRANCH);
        self.db
            .execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    yml_hash TEXT PRIMARY KEY,
                    branch_name TEXT NOT NULL,
                    config_json JSONB NOT NULL,
                    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )",
                constants::TABLE_BRANCH
            ))
            .await?;

        debug!("creating {} table", constants::TABLE_REGISTRY);
        self.db
            .execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    completed BOOLEAN DEFAULT FALSE,
                    table_id TEXT PRIMARY KEY,
                    human_name TEXT NOT NULL,
                    branch_name TEXT NOT NULL,
                    yml_hash TEXT NOT NULL,
                    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )",
                constants::TABLE_REGISTRY
            ))
            .await?;

        Ok(())
    }

    /// Startup synchronization: repair the registry, the physical tables,
    /// and the branch metadata so the scheduler starts from a consistent
    /// state. All four steps are idempotent.
    pub async fn sync(&self) -> Result<SyncReport> {
        info!("starting registry synchronization");
        self.ensure_tables().await?;

        let mut report = SyncReport::default();

        let rows = self
            .db
            .query(
                &format!(
                    "SELECT table_id, completed FROM {}",
                    constants::TABLE_REGISTRY
                ),
                &[],
            )
            .await?;

        let physical: Vec<String> = self
            .db
            .table_names()
            .await?
            .into_iter()
            .filter(|t| !constants::protected_tables().contains(&t.as_str()))
            .collect();

        let mut tracked: Vec<String> = Vec::new();

        // Steps A and B: drop interrupted rows, then rows whose table has
        // vanished.
        for row in &rows {
            let table_id: String = row.get(0);
            let completed: bool = row.get(1);

            if !completed {
                debug!(table_id, "removing incomplete registry entry");
                self.delete_registry_row(&table_id).await?;
                report.incomplete_rows_dropped += 1;
                continue;
            }

            if !physical.contains(&table_id) {
                debug!(table_id, "removing orphaned registry entry");
                self.delete_registry_row(&table_id).await?;
                report.orphaned_rows_dropped += 1;
                continue;
            }

            tracked.push(table_id);
        }

        // Step C: drop untracked managed tables.
        for table in &physical {
            let managed = table.starts_with(constants::DATABASE_GENERAL_PREFIX)
                || table.starts_with(constants::DATABASE_BASE);
            if managed && !tracked.contains(table) {
                warn!(table, "dropping untracked table");
                self.db.drop_table(table).await?;
                report.untracked_tables_dropped += 1;
            }
        }

        // Step D: drop branch rows no registry row references.
        let orphaned = self
            .db
            .query(
                &format!(
                    "SELECT b.yml_hash FROM {branch} b
                     LEFT JOIN {registry} r ON b.yml_hash = r.yml_hash
                     WHERE r.yml_hash IS NULL",
                    branch = constants::TABLE_BRANCH,
                    registry = constants::TABLE_REGISTRY
                ),
                &[],
            )
            .await?;

        for row in &orphaned {
            let hash: String = row.get(0);
            warn!(hash, "removing orphaned branch metadata");
            self.db
                .execute_params(
                    &format!(
                        "DELETE FROM {} WHERE yml_hash = $1",
                        constants::TABLE_BRANCH
                    ),
                    &[&hash],
                )
                .await?;
            report.orphaned_branches_dropped += 1;
        }

        info!(?report, "registry synchronization complete");
        Ok(report)
    }

    async fn delete_registry_row(&self, table_id: &str) -> Result<()> {
        self.db
            .execute_params(
                &format!(
                    "DELETE FROM {} WHERE table_id = $1",
                    constants::TABLE_REGISTRY
                ),
                &[&table_id],
            )
            .await?;
        Ok(())
    }

    /// Store the full configuration JSON for a branch hash.
    pub async fn register_branch(
        &self,
        branch_name: &str,
        yml_hash: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        debug!(branch_name, yml_hash, "registering branch");
        self.db
            .execute_params(
                &format!(
                    "INSERT INTO {} (yml_hash, branch_name, config_json)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (yml_hash) DO UPDATE SET
                         config_json = EXCLUDED.config_json,
                         updated_at = CURRENT_TIMESTAMP",
                    constants::TABLE_BRANCH
                ),
                &[&yml_hash, &branch_name, config],
            )
            .await?;
        Ok(())
    }

    /// Insert or refresh a node's output-handle mapping. Completion is
    /// never set here; that happens through [`Registry::set_completed`].
    pub async fn register_node_output(
        &self,
        table_id: &str,
        human_name: &str,
        branch_name: &str,
        yml_hash: &str,
    ) -> Result<()> {
        debug!(table_id, human_name, branch_name, "registering node");
        self.db
            .execute_params(
                &format!(
                    "INSERT INTO {} (table_id, human_name, branch_name, yml_hash)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (table_id) DO UPDATE SET
                         human_name = EXCLUDED.human_name,
                         branch_name = EXCLUDED.branch_name",
                    constants::TABLE_REGISTRY
                ),
                &[&table_id, &human_name, &branch_name, &yml_hash],
            )
            .await?;
        Ok(())
    }

    /// Flip `completed` for a handle. Returns false when no row was
    /// registered for it, which callers treat as a soft failure.
    pub async fn set_completed(&self, table_id: &str) -> Result<bool> {
        let updated = self
            .db
            .execute_params(
                &format!(
                    "UPDATE {} SET completed = true, updated_at = CURRENT_TIMESTAMP
                     WHERE table_id = $1",
                    constants::TABLE_REGISTRY
                ),
                &[&table_id],
            )
            .await?;
        Ok(updated > 0)
    }

    pub async fn is_completed(&self, table_id: &str) -> Result<bool> {
        let rows = self
            .db
            .query(
                &format!(
                    "SELECT completed FROM {} WHERE table_id = $1",
                    constants::TABLE_REGISTRY
                ),
                &[&table_id],
            )
            .await?;
        Ok(rows.first().map(|r| r.get::<_, bool>(0)).unwrap_or(false))
    }

    /// Register every branch and table-producing node of a built graph.
    pub async fn register_graph(&self, graph: &Graph) -> Result<usize> {
        let mut registered = 0;

        for branch_urn in graph.branches() {
            let Some(branch) = graph.node(branch_urn) else {
                continue;
            };
            let Some(hash) = branch.prop_str("hash").map(str::to_string) else {
                continue;
            };

            let short_hash = &hash[..8.min(hash.len())];
            info!(branch = %branch.name, hash = %short_hash, "syncing branch");

            let config = json!(branch.props);
            self.register_branch(&branch.name, &hash, &config).await?;

            for urn in graph.subtree(branch_urn) {
                let Some(node) = graph.node(urn) else {
                    continue;
                };
                let Some(output) = node.output.as_deref() else {
                    continue;
                };
                // Only table handles belong in the registry; file artifacts
                // are tracked by their presence on disk.
                if !output.starts_with(constants::DATABASE_GENERAL_PREFIX) {
                    continue;
                }
                self.register_node_output(output, &node.name, &branch.name, &hash)
                    .await?;
                registered += 1;
            }
        }

        Ok(registered)
    }

    /// Drop every managed table, bookkeeping included.
    pub async fn purge(&self) -> Result<usize> {
        let tables = self.db.table_names().await?;
        let mut dropped = 0;

        for table in tables {
            let managed = table.starts_with(constants::DATABASE_GENERAL_PREFIX)
                || table.starts_with(constants::DATABASE_BASE);
            if !managed {
                continue;
            }
            // quote_ident re-validates; skip anything that fails rather
            // than aborting a purge midway.
            if quote_ident(&table).is_ok() {
                warn!(table, "purging table");
                self.db.drop_table(&table).await?;
                dropped += 1;
            }
        }

        info!(dropped, "database purge complete");
        Ok(dropped)
    }
}
