//! Hybrid execution scheduler.
//!
//! Dispatches ready nodes to two bounded pools (I/O-bound and CPU-bound),
//! enforces at-most-one execution per global urn, and incrementally
//! rebuilds the runnable set as dependencies clear. The main loop is a
//! continuous sweep: submit whatever is ready, wait briefly for any
//! in-flight task, propagate its terminal status to every clone, repeat.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::constants;
use crate::graph::Graph;
use crate::node::{Action, NodeSnapshot, NodeStatus, PoolKind, Urn};

/// Executor entry point: the scheduler hands over a node snapshot and gets
/// back the node's terminal status. The closure seam keeps the scheduler
/// testable without a database or network.
pub type ExecFn = Arc<dyn Fn(NodeSnapshot) -> BoxFuture<'static, NodeStatus> + Send + Sync>;

/// How a scheduling run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Every node reached a terminal status.
    Completed,
    /// Nothing in flight but non-terminal nodes remained; they were marked
    /// skipped and are listed here by name.
    Stalled { unreachable: Vec<String> },
    /// A stop signal arrived; in-flight work was drained or aborted.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// CPU pool width. Defaults to the core count.
    pub cpu_workers: usize,
    /// I/O pool width. Defaults to four tasks per core.
    pub io_workers: usize,
    /// Probe remote sizes before scheduling so large downloads start first.
    pub probe_sizes: bool,
    /// How long to wait for in-flight tasks after a stop signal.
    pub grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpu_workers: cpus,
            io_workers: cpus * 4,
            probe_sizes: false,
            grace: Duration::from_secs(5),
        }
    }
}

pub struct Scheduler {
    graph: Graph,
    exec: ExecFn,
    opts: SchedulerOptions,
    stop: Arc<AtomicBool>,
    /// Remote sizes cached by the pre-submission probe, in bytes.
    remote_sizes: BTreeMap<Urn, i64>,
}

impl Scheduler {
    pub fn new(graph: Graph, exec: ExecFn, opts: SchedulerOptions) -> Self {
        info!(
            cpu_workers = opts.cpu_workers,
            io_workers = opts.io_workers,
            "processor ready"
        );
        Self {
            graph,
            exec,
            opts,
            stop: Arc::new(AtomicBool::new(false)),
            remote_sizes: BTreeMap::new(),
        }
    }

    /// Shared stop flag; setting it makes the loop stop submitting and
    /// drain within the grace window.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Nodes ready for execution: not terminal, every dependency processed,
    /// and at most one node per global urn across the batch and the
    /// in-flight set.
    fn runnable_nodes(
        &self,
        active_urns: &BTreeSet<Urn>,
        active_gurns: &BTreeSet<Urn>,
    ) -> Vec<Urn> {
        let mut runnable = Vec::new();
        let mut seen_gurns: BTreeSet<Urn> = active_gurns.clone();

        for node in self.graph.nodes() {
            if node.action.is_none()
                || node.status.is_terminal()
                || active_urns.contains(&node.urn)
                || seen_gurns.contains(&node.global_urn)
            {
                continue;
            }

            let deps_ready = node.children.iter().all(|c| {
                self.graph
                    .node(*c)
                    .is_some_and(|child| child.status == NodeStatus::Processed)
            });
            if !deps_ready {
                continue;
            }

            runnable.push(node.urn);
            seen_gurns.insert(node.global_urn);
        }

        runnable.sort_by_key(|urn| self.priority_weight(*urn));
        runnable
    }

    /// Sort key: downloads first, then by format priority, then largest
    /// remote size first. Ordering is an optimization only; correctness
    /// comes from dependency edges.
    fn priority_weight(&self, urn: Urn) -> (u8, usize, i64, Urn) {
        let Some(node) = self.graph.node(urn) else {
            return (u8::MAX, usize::MAX, 0, urn);
        };

        let action_weight = if node.action == Some(Action::Download) { 0 } else { 1 };
        let format_weight = node
            .format
            .as_deref()
            .and_then(|f| constants::DOWNLOADS_PRIORITY.iter().position(|p| *p == f))
            .unwrap_or(constants::DOWNLOADS_PRIORITY.len() + 1);
        let size_weight = -self.remote_sizes.get(&urn).copied().unwrap_or(0);

        (action_weight, format_weight, size_weight, urn)
    }

    /// Fetch remote sizes for all download nodes in parallel HEAD requests
    /// (identity encoding forces a Content-Length). Failures leave the node
    /// unsized; this never gates correctness.
    pub async fn probe_remote_sizes(&mut self) {
        let targets: Vec<(Urn, String)> = self
            .graph
            .nodes()
            .filter(|n| n.action == Some(Action::Download))
            .filter_map(|n| n.input.as_remote().map(|u| (n.urn, u.to_string())))
            .collect();

        if targets.is_empty() {
            return;
        }

        let client = reqwest::Client::new();
        // A small cap avoids tripping rate limits on shared servers.
        let limiter = Arc::new(Semaphore::new(20));
        let mut probes: JoinSet<(Urn, Option<i64>)> = JoinSet::new();

        for (urn, url) in targets {
            let client = client.clone();
            let limiter = Arc::clone(&limiter);
            probes.spawn(async move {
                let _permit = limiter.acquire_owned().await;
                debug!(url, "probing remote size");
                (urn, fetch_remote_size(&client, &url).await)
            });
        }

        while let Some(result) = probes.join_next().await {
            if let Ok((urn, Some(size))) = result {
                self.remote_sizes.insert(urn, size);
            }
        }

        info!(probed = self.remote_sizes.len(), "remote size probe complete");
    }

    /// Main orchestration loop. Returns when every node is terminal, the
    /// queue stalls, or a stop signal drains the in-flight set.
    pub async fn run(&mut self) -> Result<QueueOutcome> {
        if self.opts.probe_sizes {
            self.probe_remote_sizes().await;
        }

        let io_sem = Arc::new(Semaphore::new(self.opts.io_workers.max(1)));
        let cpu_sem = Arc::new(Semaphore::new(self.opts.cpu_workers.max(1)));

        let mut inflight: JoinSet<(Urn, NodeStatus)> = JoinSet::new();
        let mut active_urns: BTreeSet<Urn> = BTreeSet::new();
        let mut stop_deadline: Option<Instant> = None;

        loop {
            let stopping = self.stop.load(Ordering::SeqCst);

            if stopping && stop_deadline.is_none() {
                warn!("stop requested; draining in-flight tasks");
                stop_deadline = Some(Instant::now() + self.opts.grace);
            }

            if let Some(deadline) = stop_deadline
                && Instant::now() >= deadline
            {
                warn!(aborted = inflight.len(), "grace window elapsed");
                inflight.abort_all();
                while inflight.join_next().await.is_some() {}
                return Ok(QueueOutcome::Interrupted);
            }

            // 1. Submit everything newly ready, unless stopping.
            if !stopping {
                let active_gurns: BTreeSet<Urn> = active_urns
                    .iter()
                    .filter_map(|u| self.graph.node(*u).map(|n| n.global_urn))
                    .collect();

                for urn in self.runnable_nodes(&active_urns, &active_gurns) {
                    let Some(snapshot) = self.graph.node(urn).and_then(crate::node::NodeSnapshot::capture)
                    else {
                        continue;
                    };

                    let sem = match snapshot.action.pool() {
                        PoolKind::Io => Arc::clone(&io_sem),
                        PoolKind::Cpu => Arc::clone(&cpu_sem),
                    };
                    let exec = Arc::clone(&self.exec);

                    debug!(
                        urn,
                        action = snapshot.action.as_str(),
                        name = %snapshot.name,
                        "submitting task"
                    );
                    active_urns.insert(urn);
                    inflight.spawn(async move {
                        let _permit = sem.acquire_owned().await;
                        let status = match std::panic::AssertUnwindSafe(exec(snapshot))
                            .catch_unwind()
                            .await
                        {
                            Ok(status) => status,
                            Err(_) => NodeStatus::Failed,
                        };
                        (urn, status)
                    });
                }
            }

            // 2. Nothing running: either done, stalled, or cleanly stopped.
            if inflight.is_empty() {
                if stopping {
                    return Ok(QueueOutcome::Interrupted);
                }

                let unreachable: Vec<Urn> = self
                    .graph
                    .nodes()
                    .filter(|n| n.action.is_some() && !n.status.is_terminal())
                    .map(|n| n.urn)
                    .collect();

                if unreachable.is_empty() {
                    info!("processing complete");
                    return Ok(QueueOutcome::Completed);
                }

                let names: Vec<String> = unreachable
                    .iter()
                    .filter_map(|u| self.graph.node(*u).map(|n| n.name.clone()))
                    .collect();
                error!(
                    count = unreachable.len(),
                    nodes = ?names,
                    "queue stalled; blocked nodes are unreachable"
                );
                for urn in unreachable {
                    self.graph.set_status_with_clones(urn, NodeStatus::Skipped);
                }
                return Ok(QueueOutcome::Stalled { unreachable: names });
            }

            // 3. Wait for any completion, bounded so newly-unblocked nodes
            // are picked up promptly.
            match tokio::time::timeout(Duration::from_secs(1), inflight.join_next()).await {
                Ok(Some(Ok((urn, status)))) => {
                    active_urns.remove(&urn);
                    debug!(urn, ?status, "task finished");
                    self.graph.set_status_with_clones(urn, status);
                }
                Ok(Some(Err(join_err))) => {
                    // Only reachable through abort; the task's urn stays
                    // unresolved and the stop path tears everything down.
                    warn!(error = %join_err, "in-flight task aborted");
                }
                Ok(None) | Err(_) => {}
            }
        }
    }
}

async fn fetch_remote_size(client: &reqwest::Client, url: &str) -> Option<i64> {
    let head = client
        .head(url)
        .header(reqwest::header::ACCEPT_ENCODING, "identity")
        .timeout(Duration::from_secs(10))
        .send()
        .await;

    if let Ok(resp) = head
        && resp.status().is_success()
        && let Some(len) = resp.content_length()
    {
        return Some(len as i64);
    }

    // Some servers reject HEAD; fall back to a streaming GET for headers.
    let get = client
        .get(url)
        .header(reqwest::header::ACCEPT_ENCODING, "identity")
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .ok()?;
    get.content_length().map(|len| len as i64)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::node::InputRef;

    fn action_node(graph: &mut Graph, parent: Urn, name: &str, action: Action) -> Urn {
        let urn = graph.add_child(parent, name).expect("add child");
        graph.node_mut(urn).expect("node").action = Some(action);
        urn
    }

    fn recording_exec(log: Arc<Mutex<Vec<String>>>) -> ExecFn {
        Arc::new(move |snap: NodeSnapshot| {
            let log = Arc::clone(&log);
            async move {
                log.lock().expect("log").push(snap.name.clone());
                NodeStatus::Processed
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn children_complete_before_parents() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        graph.node_mut(branch).expect("branch").status = NodeStatus::Processed;
        let parent = action_node(&mut graph, branch, "import", Action::Import);
        let child = action_node(&mut graph, parent, "download", Action::Download);
        let _ = child;

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = Scheduler::new(
            graph,
            recording_exec(Arc::clone(&log)),
            SchedulerOptions::default(),
        );

        let outcome = scheduler.run().await.expect("run");
        assert_eq!(outcome, QueueOutcome::Completed);
        assert_eq!(*log.lock().expect("log"), vec!["download", "import"]);
        assert!(scheduler.graph().all_terminal());
    }

    #[tokio::test]
    async fn one_execution_per_global_urn() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        graph.node_mut(branch).expect("branch").status = NodeStatus::Processed;
        let a = action_node(&mut graph, branch, "runner", Action::Run);
        let b = action_node(&mut graph, branch, "runner", Action::Run);
        let shared = graph.new_global_urn();
        graph.node_mut(a).expect("a").global_urn = shared;
        graph.node_mut(b).expect("b").global_urn = shared;

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = Scheduler::new(
            graph,
            recording_exec(Arc::clone(&log)),
            SchedulerOptions::default(),
        );

        let outcome = scheduler.run().await.expect("run");
        assert_eq!(outcome, QueueOutcome::Completed);
        assert_eq!(log.lock().expect("log").len(), 1, "clones run once");

        // Both clones carry the primary's terminal status.
        assert_eq!(
            scheduler.graph().node(a).expect("a").status,
            NodeStatus::Processed
        );
        assert_eq!(
            scheduler.graph().node(b).expect("b").status,
            NodeStatus::Processed
        );
    }

    #[tokio::test]
    async fn cpu_pool_width_is_respected() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        graph.node_mut(branch).expect("branch").status = NodeStatus::Processed;
        for i in 0..6 {
            action_node(&mut graph, branch, &format!("import-{i}"), Action::Import);
        }

        let concurrent = Arc::new(Mutex::new((0usize, 0usize))); // (current, max)
        let tracker = Arc::clone(&concurrent);
        let exec: ExecFn = Arc::new(move |_snap| {
            let tracker = Arc::clone(&tracker);
            async move {
                {
                    let mut state = tracker.lock().expect("tracker");
                    state.0 += 1;
                    state.1 = state.1.max(state.0);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                tracker.lock().expect("tracker").0 -= 1;
                NodeStatus::Processed
            }
            .boxed()
        });

        let opts = SchedulerOptions {
            cpu_workers: 2,
            io_workers: 8,
            probe_sizes: false,
            grace: Duration::from_secs(1),
        };
        let mut scheduler = Scheduler::new(graph, exec, opts);
        let outcome = scheduler.run().await.expect("run");

        assert_eq!(outcome, QueueOutcome::Completed);
        let max = concurrent.lock().expect("tracker").1;
        assert!(max <= 2, "cpu pool exceeded its width: {max}");
    }

    #[tokio::test]
    async fn failed_child_stalls_dependents() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        graph.node_mut(branch).expect("branch").status = NodeStatus::Processed;
        let import = action_node(&mut graph, branch, "import", Action::Import);
        let download = action_node(&mut graph, import, "broken-download", Action::Download);
        let _ = download;

        let exec: ExecFn = Arc::new(|snap: NodeSnapshot| {
            async move {
                if snap.action == Action::Download {
                    NodeStatus::Failed
                } else {
                    NodeStatus::Processed
                }
            }
            .boxed()
        });

        let mut scheduler = Scheduler::new(graph, exec, SchedulerOptions::default());
        let outcome = scheduler.run().await.expect("run");

        match outcome {
            QueueOutcome::Stalled { unreachable } => {
                assert_eq!(unreachable, vec!["import".to_string()]);
            }
            other => panic!("expected stall, got {other:?}"),
        }

        assert_eq!(
            scheduler.graph().node(import).expect("import").status,
            NodeStatus::Skipped
        );
        assert!(scheduler.graph().all_terminal());
    }

    #[tokio::test]
    async fn empty_graph_completes_immediately() {
        let exec: ExecFn = Arc::new(|_| async { NodeStatus::Processed }.boxed());
        let mut scheduler = Scheduler::new(Graph::new(), exec, SchedulerOptions::default());
        assert_eq!(scheduler.run().await.expect("run"), QueueOutcome::Completed);
    }

    #[tokio::test]
    async fn stop_flag_interrupts_the_queue() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        graph.node_mut(branch).expect("branch").status = NodeStatus::Processed;
        for i in 0..4 {
            action_node(&mut graph, branch, &format!("dl-{i}"), Action::Download);
        }

        let exec: ExecFn = Arc::new(|_| {
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                NodeStatus::Processed
            }
            .boxed()
        });

        let opts = SchedulerOptions {
            cpu_workers: 1,
            io_workers: 1,
            probe_sizes: false,
            grace: Duration::from_secs(5),
        };
        let mut scheduler = Scheduler::new(graph, exec, opts);
        let stop = scheduler.stop_flag();
        stop.store(true, Ordering::SeqCst);

        let outcome = scheduler.run().await.expect("run");
        assert_eq!(outcome, QueueOutcome::Interrupted);
    }

    #[test]
    fn priority_orders_downloads_first_and_largest_first() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        graph.node_mut(branch).expect("branch").status = NodeStatus::Processed;

        let small = action_node(&mut graph, branch, "small", Action::Download);
        let large = action_node(&mut graph, branch, "large", Action::Download);
        let import = action_node(&mut graph, branch, "import", Action::Import);
        for urn in [small, large] {
            graph.node_mut(urn).expect("node").input =
                InputRef::Remote("https://example.org/x".to_string());
        }

        let exec: ExecFn = Arc::new(|_| async { NodeStatus::Processed }.boxed());
        let mut scheduler = Scheduler::new(graph, exec, SchedulerOptions::default());
        scheduler.remote_sizes.insert(small, 10);
        scheduler.remote_sizes.insert(large, 1_000_000);

        let ready = scheduler.runnable_nodes(&BTreeSet::new(), &BTreeSet::new());
        assert_eq!(ready, vec![large, small, import]);
    }

    #[test]
    fn runnable_skips_nodes_with_pending_dependencies() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        graph.node_mut(branch).expect("branch").status = NodeStatus::Processed;
        let parent = action_node(&mut graph, branch, "parent", Action::Import);
        let child = action_node(&mut graph, parent, "child", Action::Download);

        let exec: ExecFn = Arc::new(|_| async { NodeStatus::Processed }.boxed());
        let scheduler = Scheduler::new(graph, exec, SchedulerOptions::default());

        let ready = scheduler.runnable_nodes(&BTreeSet::new(), &BTreeSet::new());
        assert_eq!(ready, vec![child]);

        // A node already in flight keeps its global resource out of the set.
        let mut active = BTreeSet::new();
        active.insert(child);
        let gurns: BTreeSet<Urn> = [scheduler.graph().node(child).expect("child").global_urn]
            .into_iter()
            .collect();
        assert!(scheduler.runnable_nodes(&active, &gurns).is_empty());
    }

    #[test]
    fn node_without_action_is_never_runnable() {
        let mut graph = Graph::new();
        let branch = graph.add_child(graph.root(), "site").expect("branch");
        let structural = graph.add_child(branch, "structural").expect("structural");
        let _ = structural;

        let exec: ExecFn = Arc::new(|_| async { NodeStatus::Processed }.boxed());
        let scheduler = Scheduler::new(graph, exec, SchedulerOptions::default());
        assert!(
            scheduler
                .runnable_nodes(&BTreeSet::new(), &BTreeSet::new())
                .is_empty()
        );
    }
}
