//! # Opensite
//!
//! Core library for the opensite constraint-layer build engine.
//!
//! Opensite ingests declarative site descriptions (YAML), resolves each one
//! into a processing graph over PostGIS, and drives that graph to
//! completion: downloading raw spatial datasources, transforming them into
//! a shared projection, buffering, clipping, amalgamating across
//! administrative areas, and exporting consolidated layers.
//!
//! ## Pipeline
//!
//! The core flow is **build → register → schedule → execute**:
//!
//! 1. [`builder::Builder`] parses site YAML into branches, enriches them
//!    (defaults, per-branch arithmetic, buffer and style folding), merges
//!    catalogue metadata, and explodes the tree into an executable DAG of
//!    download, extract, concatenate, run, import, buffer, preprocess,
//!    amalgamate, postprocess, clip and output nodes.
//! 2. [`registry::Registry`] records every table-producing node; startup
//!    sync repairs interrupted state so reruns are idempotent.
//! 3. [`scheduler::Scheduler`] sweeps the ready set across an I/O pool and
//!    a CPU pool, serializing work per global urn and propagating terminal
//!    statuses to clone nodes.
//! 4. [`executors`] perform the actual work against the filesystem,
//!    PostGIS, and external tools, marking registry rows complete only
//!    after the artifact write succeeds.
//!
//! ## Key types
//!
//! - [`node::Node`] — unit of work: identity, action, inputs, status
//! - [`graph::Graph`] — node arena with lineage/sibling/terminal queries
//! - [`scheduler::QueueOutcome`] — completed, stalled, or interrupted
//! - [`app::Application`] — lifecycle, environment bootstrap, purge modes
//!
//! ## Concurrency model
//!
//! Single-host, two-pool parallelism on tokio: downloads, extraction and
//! concatenation run many-way concurrent in the I/O pool; PostGIS and
//! subprocess work is bounded by a core-count semaphore in the CPU pool.
//! Dynamic outputs flow between tasks through [`vars::SharedVars`], keyed
//! by global urn; dependency ordering provides the happens-before.

/// Application lifecycle: environment preparation, run and purge modes.
pub mod app;

/// Declarative graph builder: YAML to executable DAG.
pub mod builder;

/// Environment-driven settings.
pub mod config;

/// Application constants: formats, table names, CRS, grid spacings.
pub mod constants;

/// Per-action executors and their shared context.
pub mod executors;

/// Node arena and structural queries.
pub mod graph;

/// Clipping-master and grid bootstrap.
pub mod grid;

/// Stable content fingerprints.
pub mod hashing;

/// Per-branch arithmetic resolution.
pub mod math;

/// Node model: actions, statuses, inputs, snapshots.
pub mod node;

/// Pooled PostGIS access and identifier validation.
pub mod postgis;

/// Durable registry of managed tables.
pub mod registry;

/// Hybrid two-pool scheduler.
pub mod scheduler;

/// Process-wide shared metadata map.
pub mod vars;
