//! Node model: the unit of work in the processing graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Node identifier, unique within a graph.
pub type Urn = u64;

/// Structural role of a node.
///
/// `Property` only appears in freshly parsed site descriptions; enrichment
/// deletes or retypes every property node before the graph is exploded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Property,
    Source,
    Group,
    Download,
    Extract,
    Concatenate,
    Run,
    Import,
    Process,
    Output,
}

/// Which scheduler pool an action runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Network/disk bound: many-way concurrent.
    Io,
    /// PostGIS/subprocess bound: parallelism bounded by cores.
    Cpu,
}

/// Closed enumeration of executable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Download,
    Unzip,
    Concatenate,
    Run,
    Import,
    Buffer,
    Preprocess,
    Amalgamate,
    Postprocess,
    Clip,
    Output,
}

impl Action {
    /// Pool classification drives which semaphore bounds the action.
    pub fn pool(self) -> PoolKind {
        match self {
            Action::Download | Action::Unzip | Action::Concatenate => PoolKind::Io,
            Action::Run
            | Action::Import
            | Action::Buffer
            | Action::Preprocess
            | Action::Amalgamate
            | Action::Postprocess
            | Action::Clip
            | Action::Output => PoolKind::Cpu,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Download => "download",
            Action::Unzip => "unzip",
            Action::Concatenate => "concatenate",
            Action::Run => "run",
            Action::Import => "import",
            Action::Buffer => "buffer",
            Action::Preprocess => "preprocess",
            Action::Amalgamate => "amalgamate",
            Action::Postprocess => "postprocess",
            Action::Clip => "clip",
            Action::Output => "output",
        }
    }
}

/// Execution status. Terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Processed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Processed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// What a node consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    #[default]
    None,
    /// An HTTP(S) URL.
    Remote(String),
    /// A path relative to the downloads folder.
    File(String),
    /// A registry output handle (database table id).
    Table(String),
    /// A runtime-published value, `VAR:global_output_<gurn>`.
    Variable(String),
    /// Several local files (concatenate).
    FileSet(Vec<String>),
}

impl InputRef {
    /// Classify a raw string: URLs become `Remote`, anything else `File`.
    pub fn classify(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            InputRef::Remote(raw.to_string())
        } else {
            InputRef::File(raw.to_string())
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, InputRef::Remote(_))
    }

    pub fn as_remote(&self) -> Option<&str> {
        match self {
            InputRef::Remote(url) => Some(url),
            _ => None,
        }
    }
}

/// Shared-metadata key for a dynamic output, `VAR:global_output_<gurn>`.
pub fn global_output_key(global_urn: Urn) -> String {
    format!("VAR:global_output_{global_urn}")
}

/// A custom property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<String>),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            PropValue::Num(n) => Some(*n),
            PropValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            PropValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub urn: Urn,
    /// Nodes cloned to serve multiple consumers share one global urn;
    /// exactly one instance per global urn executes.
    pub global_urn: Urn,
    /// Logical slug, stable across reruns (`railway-lines--england`).
    pub name: String,
    /// Human-readable title, populated from the catalogue.
    pub title: String,
    pub node_type: NodeType,
    pub action: Option<Action>,
    /// Raw-dataset format label, or output format for encoder nodes.
    pub format: Option<String>,
    pub input: InputRef,
    /// Local path or database table identifier. Dynamic outputs are
    /// assigned at execution time and published keyed by global urn.
    pub output: Option<String>,
    pub props: BTreeMap<String, PropValue>,
    pub status: NodeStatus,
    /// Dependencies: children must reach `Processed` first.
    pub children: Vec<Urn>,
    pub parent: Option<Urn>,
    /// Style attributes folded onto group nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<BTreeMap<String, String>>,
}

impl Node {
    pub fn new(urn: Urn, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            urn,
            global_urn: urn,
            title: name.clone(),
            name,
            node_type: NodeType::Property,
            action: None,
            format: None,
            input: InputRef::None,
            output: None,
            props: BTreeMap::new(),
            status: NodeStatus::Pending,
            children: Vec::new(),
            parent: None,
            style: None,
        }
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(PropValue::as_str)
    }

    pub fn prop_num(&self, key: &str) -> Option<f64> {
        self.props.get(key).and_then(PropValue::as_num)
    }

    pub fn prop_list(&self, key: &str) -> Option<&[String]> {
        self.props.get(key).and_then(PropValue::as_list)
    }

    pub fn set_prop(&mut self, key: impl Into<String>, value: PropValue) {
        self.props.insert(key.into(), value);
    }
}

/// The immutable slice of a node handed to executors. Executors never see
/// the graph; dynamic results flow back through the shared metadata map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub urn: Urn,
    pub global_urn: Urn,
    pub name: String,
    pub title: String,
    pub action: Action,
    pub format: Option<String>,
    pub input: InputRef,
    pub output: Option<String>,
    pub props: BTreeMap<String, PropValue>,
}

impl NodeSnapshot {
    /// Capture the executable slice of a node. Returns `None` for nodes
    /// without an action (structural remnants are never scheduled).
    pub fn capture(node: &Node) -> Option<Self> {
        Some(Self {
            urn: node.urn,
            global_urn: node.global_urn,
            name: node.name.clone(),
            title: node.title.clone(),
            action: node.action?,
            format: node.format.clone(),
            input: node.input.clone(),
            output: node.output.clone(),
            props: node.props.clone(),
        })
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(PropValue::as_str)
    }

    pub fn prop_num(&self, key: &str) -> Option<f64> {
        self.props.get(key).and_then(PropValue::as_num)
    }

    pub fn prop_list(&self, key: &str) -> Option<&[String]> {
        self.props.get(key).and_then(PropValue::as_list)
    }
}
