//! Integration of builder and scheduler: a full site description is
//! exploded into an executable DAG and driven to completion with stub
//! executors, checking dependency ordering, handle stability across
//! rebuilds, and stall behavior.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;

use opensite::builder::Builder;
use opensite::graph::Graph;
use opensite::node::{Action, NodeSnapshot, NodeStatus};
use opensite::scheduler::{ExecFn, QueueOutcome, Scheduler, SchedulerOptions};

use opensite_catalogue::{
    CatalogueDataset, CatalogueGroup, CatalogueModel, CatalogueResource,
};

const SITE_YAML: &str = r#"
title: Integration Site
height-to-tip: 120
blade-radius: 55
osm: https://example.org/extracts/uk-latest.osm.pbf
structure:
  transport:
    railway-lines--england:
    railway-lines--scotland:
  nature:
    national-parks--england:
buffers:
  railway-lines--england: "height-to-tip * 2"
"#;

fn catalogue_model() -> CatalogueModel {
    let mut model = CatalogueModel::new();
    model.insert(
        "transport".to_string(),
        CatalogueGroup {
            group_title: "Transport".to_string(),
            datasets: vec![
                CatalogueDataset {
                    package_name: "railway-lines--england".to_string(),
                    title: "Railway Lines - England".to_string(),
                    resources: vec![CatalogueResource {
                        format: "GPKG".to_string(),
                        url: "https://example.org/rail-en.gpkg".to_string(),
                    }],
                },
                CatalogueDataset {
                    package_name: "railway-lines--scotland".to_string(),
                    title: "Railway Lines - Scotland".to_string(),
                    resources: vec![CatalogueResource {
                        format: "GPKG".to_string(),
                        url: "https://example.org/rail-sc.gpkg.zip".to_string(),
                    }],
                },
            ],
        },
    );
    model.insert(
        "nature".to_string(),
        CatalogueGroup {
            group_title: "Nature".to_string(),
            datasets: vec![CatalogueDataset {
                package_name: "national-parks--england".to_string(),
                title: "National Parks - England".to_string(),
                resources: vec![CatalogueResource {
                    format: opensite::constants::OSM_YML_FORMAT.to_string(),
                    url: "https://example.org/parks.yml".to_string(),
                }],
            }],
        },
    );
    model
}

fn build_graph() -> Graph {
    let mut builder = Builder::new(
        BTreeMap::new(),
        vec!["gpkg".to_string()],
        None,
        false,
    );
    builder
        .add_site_yaml("site--integration", SITE_YAML)
        .expect("site yaml");
    builder.merge_catalogue(&catalogue_model());
    builder.explode().expect("explode");
    builder.into_graph()
}

fn recording_exec(log: Arc<Mutex<Vec<(Action, String)>>>) -> ExecFn {
    Arc::new(move |snap: NodeSnapshot| {
        let log = Arc::clone(&log);
        async move {
            log.lock().expect("log").push((snap.action, snap.name.clone()));
            NodeStatus::Processed
        }
        .boxed()
    })
}

fn position_of(log: &[(Action, String)], action: Action, name: &str) -> usize {
    log.iter()
        .position(|(a, n)| *a == action && n == name)
        .unwrap_or_else(|| panic!("{action:?} {name} never executed"))
}

#[tokio::test]
async fn full_pipeline_executes_in_dependency_order() {
    let graph = build_graph();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = Scheduler::new(
        graph,
        recording_exec(Arc::clone(&log)),
        SchedulerOptions::default(),
    );

    let outcome = scheduler.run().await.expect("run");
    assert_eq!(outcome, QueueOutcome::Completed);
    assert!(scheduler.graph().all_terminal());

    let log = log.lock().expect("log").clone();

    // Per-dataset chain: download -> import -> buffer -> preprocess.
    let download = position_of(&log, Action::Download, "railway-lines--england");
    let import = position_of(&log, Action::Import, "railway-lines--england");
    let buffer = position_of(&log, Action::Buffer, "railway-lines--england--buffer");
    let preprocess = position_of(
        &log,
        Action::Preprocess,
        "railway-lines--england--preprocess",
    );
    assert!(download < import);
    assert!(import < buffer);
    assert!(buffer < preprocess);

    // Amalgamate waits for every preprocessed child, weld for the group,
    // output for the weld.
    let group = position_of(&log, Action::Amalgamate, "railway-lines");
    let category = position_of(&log, Action::Amalgamate, "transport");
    let weld = position_of(&log, Action::Postprocess, "transport--postprocess");
    let output = position_of(&log, Action::Output, "transport--output-gpkg");
    assert!(preprocess < group);
    assert!(group < category);
    assert!(category < weld);
    assert!(weld < output);

    // Zip chain: fetcher before unzipper before import.
    let fetch = position_of(&log, Action::Download, "railway-lines--scotland-file");
    let unzip = position_of(&log, Action::Unzip, "railway-lines--scotland");
    let import_sc = position_of(&log, Action::Import, "railway-lines--scotland");
    assert!(fetch < unzip);
    assert!(unzip < import_sc);

    // OSM stack: concatenator and downloader before the runner.
    let concat = log
        .iter()
        .position(|(a, _)| *a == Action::Concatenate)
        .expect("concatenate ran");
    let runner = log
        .iter()
        .position(|(a, _)| *a == Action::Run)
        .expect("runner ran");
    assert!(concat < runner);
}

#[tokio::test]
async fn rebuilding_the_same_inputs_yields_identical_output_handles() {
    let first = build_graph();
    let second = build_graph();

    let handles = |graph: &Graph| -> Vec<String> {
        let mut outputs: Vec<String> = graph
            .nodes()
            .filter_map(|n| n.output.clone())
            .collect();
        outputs.sort();
        outputs
    };

    assert_eq!(handles(&first), handles(&second));

    // Branch configuration hashes are stable too.
    let hash = |graph: &Graph| -> Vec<String> {
        graph
            .branches()
            .into_iter()
            .filter_map(|b| {
                graph
                    .node(b)
                    .and_then(|n| n.prop_str("hash"))
                    .map(str::to_string)
            })
            .collect()
    };
    assert_eq!(hash(&first), hash(&second));
}

#[tokio::test]
async fn failed_download_stalls_every_dependent() {
    let graph = build_graph();

    let exec: ExecFn = Arc::new(|snap: NodeSnapshot| {
        async move {
            // Simulate a 404 on one specific source file.
            if snap.action == Action::Download && snap.name == "railway-lines--england" {
                NodeStatus::Failed
            } else {
                NodeStatus::Processed
            }
        }
        .boxed()
    });

    let mut scheduler = Scheduler::new(graph, exec, SchedulerOptions::default());
    let outcome = scheduler.run().await.expect("run");

    let QueueOutcome::Stalled { unreachable } = outcome else {
        panic!("expected a stalled queue, got {outcome:?}");
    };

    // The import above the broken download and the whole chain over it
    // never become ready.
    assert!(unreachable.contains(&"railway-lines--england".to_string()));
    assert!(unreachable.contains(&"railway-lines--england--buffer".to_string()));
    assert!(unreachable.contains(&"transport--output-gpkg".to_string()));

    // But the independent nature branch completed.
    let parks = scheduler
        .graph()
        .find_urns(|n| n.name == "nature--postprocess");
    assert_eq!(
        scheduler
            .graph()
            .node(parks[0])
            .expect("nature weld")
            .status,
        NodeStatus::Processed
    );

    // Skipped is terminal: nothing is left pending.
    assert!(scheduler.graph().all_terminal());
}
