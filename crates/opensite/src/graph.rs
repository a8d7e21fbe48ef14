//! Graph: owns all nodes, enforces urn uniqueness, and provides the
//! structural queries and splices the builder and scheduler depend on.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use serde_json::json;

use crate::node::{Node, NodeStatus, PropValue, Urn};

/// The processing graph. Nodes live in an arena keyed by urn; edges are
/// parent -> children, where children are dependencies that must complete
/// first. The synthetic root (urn 0) holds one child per site branch.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<Urn, Node>,
    root: Urn,
    next_urn: Urn,
    next_global_urn: Urn,
    /// Deep snapshot of the enriched tree taken before explosion, kept for
    /// output encoders and graph introspection.
    core_structure: Option<serde_json::Value>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        let mut root = Node::new(0, "root");
        root.node_type = crate::node::NodeType::Root;
        // The root is structural only; it never executes.
        root.status = NodeStatus::Processed;
        nodes.insert(0, root);

        Self {
            nodes,
            root: 0,
            next_urn: 1,
            // Global urns share the urn number space but are allocated from
            // a high base so shared resources are easy to spot in previews.
            next_global_urn: 1_000_000,
            core_structure: None,
        }
    }

    pub fn root(&self) -> Urn {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, urn: Urn) -> Option<&Node> {
        self.nodes.get(&urn)
    }

    pub fn node_mut(&mut self, urn: Urn) -> Option<&mut Node> {
        self.nodes.get_mut(&urn)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    fn alloc_urn(&mut self) -> Urn {
        let urn = self.next_urn;
        self.next_urn += 1;
        urn
    }

    /// Allocate a fresh global urn for work shared between clone nodes.
    pub fn new_global_urn(&mut self) -> Urn {
        let urn = self.next_global_urn;
        self.next_global_urn += 1;
        urn
    }

    /// Create a node attached under `parent`.
    pub fn add_child(&mut self, parent: Urn, name: impl Into<String>) -> Result<Urn> {
        if !self.nodes.contains_key(&parent) {
            bail!("parent urn {parent} not in graph");
        }
        let urn = self.alloc_urn();
        let mut node = Node::new(urn, name);
        node.parent = Some(parent);
        self.nodes.insert(urn, node);
        self.nodes
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .push(urn);
        Ok(urn)
    }

    /// Create a detached node; callers splice it in with [`Graph::insert_parent`]
    /// or [`Graph::attach`].
    pub fn add_detached(&mut self, name: impl Into<String>) -> Urn {
        let urn = self.alloc_urn();
        self.nodes.insert(urn, Node::new(urn, name));
        urn
    }

    /// Attach an existing detached node under `parent`.
    pub fn attach(&mut self, parent: Urn, child: Urn) -> Result<()> {
        if !self.nodes.contains_key(&parent) {
            bail!("parent urn {parent} not in graph");
        }
        let node = self
            .nodes
            .get_mut(&child)
            .with_context(|| format!("child urn {child} not in graph"))?;
        node.parent = Some(parent);
        let parent_node = self.nodes.get_mut(&parent).expect("parent checked above");
        if !parent_node.children.contains(&child) {
            parent_node.children.push(child);
        }
        Ok(())
    }

    /// Branches are the direct children of the synthetic root.
    pub fn branches(&self) -> Vec<Urn> {
        self.nodes
            .get(&self.root)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn children_of(&self, urn: Urn) -> Vec<Urn> {
        self.nodes
            .get(&urn)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn parent_of(&self, urn: Urn) -> Option<Urn> {
        self.nodes.get(&urn).and_then(|n| n.parent)
    }

    /// Direct child of `parent` with the given name.
    pub fn find_child(&self, parent: Urn, name: &str) -> Option<Urn> {
        self.children_of(parent)
            .into_iter()
            .find(|c| self.nodes.get(c).is_some_and(|n| n.name == name))
    }

    /// All urns matching a predicate, in deterministic urn order.
    pub fn find_urns(&self, pred: impl Fn(&Node) -> bool) -> Vec<Urn> {
        self.nodes
            .values()
            .filter(|n| pred(n))
            .map(|n| n.urn)
            .collect()
    }

    /// Siblings of a node (other children of its parent).
    pub fn siblings(&self, urn: Urn) -> Vec<Urn> {
        match self.parent_of(urn) {
            Some(parent) => self
                .children_of(parent)
                .into_iter()
                .filter(|c| *c != urn)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Terminal (leaf) nodes of the whole graph, excluding the root.
    pub fn terminal_nodes(&self) -> Vec<Urn> {
        self.nodes
            .values()
            .filter(|n| n.urn != self.root && n.children.is_empty())
            .map(|n| n.urn)
            .collect()
    }

    /// Nearest value of a property on the node itself or any ancestor.
    pub fn lineage_prop(&self, urn: Urn, key: &str) -> Option<&PropValue> {
        let mut cursor = Some(urn);
        while let Some(current) = cursor {
            let node = self.nodes.get(&current)?;
            if let Some(value) = node.props.get(key) {
                return Some(value);
            }
            cursor = node.parent;
        }
        None
    }

    /// All descendants of a node, including itself.
    pub fn subtree(&self, urn: Urn) -> Vec<Urn> {
        let mut out = Vec::new();
        let mut stack = vec![urn];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                out.push(current);
                stack.extend(node.children.iter().copied());
            }
        }
        out
    }

    /// Delete a node and its whole subtree.
    pub fn delete_subtree(&mut self, urn: Urn) {
        if urn == self.root {
            return;
        }
        if let Some(parent) = self.parent_of(urn)
            && let Some(parent_node) = self.nodes.get_mut(&parent)
        {
            parent_node.children.retain(|c| *c != urn);
        }
        for descendant in self.subtree(urn) {
            self.nodes.remove(&descendant);
        }
    }

    /// Splice a detached node between `child` and its current parent:
    /// the new node takes the child's slot and the child becomes its
    /// dependency.
    pub fn insert_parent(&mut self, child: Urn, new_parent: Urn) -> Result<()> {
        let old_parent = self
            .parent_of(child)
            .with_context(|| format!("urn {child} has no parent to splice above"))?;

        let slot = self
            .nodes
            .get(&old_parent)
            .and_then(|n| n.children.iter().position(|c| *c == child))
            .context("child missing from parent's children")?;

        {
            let old_parent_node = self.nodes.get_mut(&old_parent).expect("parent exists");
            old_parent_node.children[slot] = new_parent;
        }
        {
            let new_parent_node = self
                .nodes
                .get_mut(&new_parent)
                .context("new parent not in graph")?;
            new_parent_node.parent = Some(old_parent);
            new_parent_node.children.push(child);
        }
        {
            let child_node = self.nodes.get_mut(&child).expect("child exists");
            child_node.parent = Some(new_parent);
        }
        Ok(())
    }

    /// Wrap `child_urns` (children of `parent`) in a new group node and
    /// return the group's urn.
    pub fn wrap_group(
        &mut self,
        parent: Urn,
        child_urns: &[Urn],
        group_name: &str,
        group_title: &str,
    ) -> Result<Urn> {
        let group = self.add_child(parent, group_name)?;
        {
            let node = self.nodes.get_mut(&group).expect("group exists");
            node.title = group_title.to_string();
        }
        {
            let parent_node = self
                .nodes
                .get_mut(&parent)
                .context("group parent not in graph")?;
            parent_node.children.retain(|c| !child_urns.contains(c));
        }
        for child in child_urns {
            let child_node = self
                .nodes
                .get_mut(child)
                .with_context(|| format!("grouped child urn {child} not in graph"))?;
            child_node.parent = Some(group);
            let group_node = self.nodes.get_mut(&group).expect("group exists");
            group_node.children.push(*child);
        }
        Ok(group)
    }

    /// All nodes sharing a global urn.
    pub fn clones_of(&self, global_urn: Urn) -> Vec<Urn> {
        self.find_urns(|n| n.global_urn == global_urn)
    }

    /// Set a node's status and mirror it onto every clone.
    pub fn set_status_with_clones(&mut self, urn: Urn, status: NodeStatus) {
        let Some(global_urn) = self.nodes.get(&urn).map(|n| n.global_urn) else {
            return;
        };
        for clone in self.clones_of(global_urn) {
            if let Some(node) = self.nodes.get_mut(&clone) {
                node.status = status;
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }

    pub fn non_terminal_urns(&self) -> Vec<Urn> {
        self.find_urns(|n| !n.status.is_terminal())
    }

    /// Sanity check: the graph is a tree rooted at the synthetic root, so
    /// every node is reachable exactly once and no cycles are possible.
    pub fn verify_integrity(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.root];
        while let Some(urn) = stack.pop() {
            if !seen.insert(urn) {
                bail!("urn {urn} reachable via more than one path");
            }
            let node = self
                .nodes
                .get(&urn)
                .with_context(|| format!("dangling child urn {urn}"))?;
            stack.extend(node.children.iter().copied());
        }
        if seen.len() != self.nodes.len() {
            bail!(
                "{} nodes unreachable from root",
                self.nodes.len() - seen.len()
            );
        }
        Ok(())
    }

    /// Take the pre-explosion snapshot of the whole tree.
    pub fn snapshot_core_structure(&mut self) {
        self.core_structure = Some(self.preview_value());
    }

    pub fn core_structure(&self) -> Option<&serde_json::Value> {
        self.core_structure.as_ref()
    }

    /// JSON rendering of the tree for previews and the wrapper daemon.
    pub fn preview_value(&self) -> serde_json::Value {
        self.render_node(self.root)
    }

    fn render_node(&self, urn: Urn) -> serde_json::Value {
        let Some(node) = self.nodes.get(&urn) else {
            return serde_json::Value::Null;
        };
        json!({
            "urn": node.urn,
            "global_urn": node.global_urn,
            "name": node.name,
            "title": node.title,
            "node_type": node.node_type,
            "action": node.action.map(|a| a.as_str()),
            "format": node.format,
            "input": node.input,
            "output": node.output,
            "status": node.status,
            "props": node.props,
            "children": node.children.iter().map(|c| self.render_node(*c)).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Action, InputRef, NodeType};

    fn graph_with_branch() -> (Graph, Urn) {
        let mut g = Graph::new();
        let branch = g.add_child(g.root(), "site-a").expect("branch");
        (g, branch)
    }

    #[test]
    fn urns_are_unique_and_monotonic() {
        let (mut g, branch) = graph_with_branch();
        let a = g.add_child(branch, "a").expect("a");
        let b = g.add_child(branch, "b").expect("b");
        assert!(a < b);
        assert_eq!(g.node(a).expect("a").urn, a);
        g.verify_integrity().expect("integrity");
    }

    #[test]
    fn add_child_rejects_unknown_parent() {
        let mut g = Graph::new();
        assert!(g.add_child(999, "x").is_err());
    }

    #[test]
    fn lineage_prop_walks_ancestors() {
        let (mut g, branch) = graph_with_branch();
        g.node_mut(branch)
            .expect("branch")
            .set_prop("osm", PropValue::Str("https://example.org/e.pbf".to_string()));
        let child = g.add_child(branch, "child").expect("child");
        let grandchild = g.add_child(child, "grandchild").expect("grandchild");

        let value = g.lineage_prop(grandchild, "osm").expect("lineage");
        assert_eq!(value.as_str(), Some("https://example.org/e.pbf"));
        assert!(g.lineage_prop(grandchild, "missing").is_none());
    }

    #[test]
    fn insert_parent_splices_between() {
        let (mut g, branch) = graph_with_branch();
        let child = g.add_child(branch, "dataset").expect("child");

        let splice = g.add_detached("unzipper");
        g.insert_parent(child, splice).expect("splice");

        assert_eq!(g.parent_of(child), Some(splice));
        assert_eq!(g.parent_of(splice), Some(branch));
        assert_eq!(g.children_of(branch), vec![splice]);
        assert_eq!(g.children_of(splice), vec![child]);
        g.verify_integrity().expect("integrity");
    }

    #[test]
    fn wrap_group_rewires_children() {
        let (mut g, branch) = graph_with_branch();
        let a = g.add_child(branch, "parks--england").expect("a");
        let b = g.add_child(branch, "parks--scotland").expect("b");
        let c = g.add_child(branch, "railways").expect("c");

        let group = g
            .wrap_group(branch, &[a, b], "parks", "Parks")
            .expect("group");

        assert_eq!(g.parent_of(a), Some(group));
        assert_eq!(g.parent_of(b), Some(group));
        assert_eq!(g.parent_of(c), Some(branch));
        let mut branch_children = g.children_of(branch);
        branch_children.sort_unstable();
        let mut expected = vec![c, group];
        expected.sort_unstable();
        assert_eq!(branch_children, expected);
        g.verify_integrity().expect("integrity");
    }

    #[test]
    fn delete_subtree_removes_descendants() {
        let (mut g, branch) = graph_with_branch();
        let child = g.add_child(branch, "child").expect("child");
        let grandchild = g.add_child(child, "grandchild").expect("grandchild");

        g.delete_subtree(child);

        assert!(g.node(child).is_none());
        assert!(g.node(grandchild).is_none());
        assert!(g.children_of(branch).is_empty());
        g.verify_integrity().expect("integrity");
    }

    #[test]
    fn status_propagates_to_clones() {
        let (mut g, branch) = graph_with_branch();
        let a = g.add_child(branch, "runner").expect("a");
        let b = g.add_child(branch, "runner").expect("b");
        let shared = g.new_global_urn();
        g.node_mut(a).expect("a").global_urn = shared;
        g.node_mut(b).expect("b").global_urn = shared;

        g.set_status_with_clones(a, NodeStatus::Processed);

        assert_eq!(g.node(a).expect("a").status, NodeStatus::Processed);
        assert_eq!(g.node(b).expect("b").status, NodeStatus::Processed);
    }

    #[test]
    fn terminal_nodes_are_leaves() {
        let (mut g, branch) = graph_with_branch();
        let child = g.add_child(branch, "child").expect("child");
        let leaf = g.add_child(child, "leaf").expect("leaf");

        assert_eq!(g.terminal_nodes(), vec![leaf]);
    }

    #[test]
    fn preview_renders_tree() {
        let (mut g, branch) = graph_with_branch();
        let child = g.add_child(branch, "dataset").expect("child");
        {
            let node = g.node_mut(child).expect("child");
            node.node_type = NodeType::Source;
            node.action = Some(Action::Import);
            node.input = InputRef::classify("https://example.org/a.gpkg");
        }

        let preview = g.preview_value();
        let branch_json = &preview["children"][0];
        assert_eq!(branch_json["name"], "site-a");
        assert_eq!(branch_json["children"][0]["action"], "import");
    }

    #[test]
    fn snapshot_preserves_pre_explosion_tree() {
        let (mut g, branch) = graph_with_branch();
        g.snapshot_core_structure();
        g.delete_subtree(branch);

        let snapshot = g.core_structure().expect("snapshot");
        assert_eq!(snapshot["children"][0]["name"], "site-a");
        assert!(g.children_of(g.root()).is_empty());
    }
}
