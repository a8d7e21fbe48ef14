//! Declarative graph builder.
//!
//! Transforms raw site descriptions into an executable DAG through a fixed
//! sequence of rewrites: parse and attach, enrichment, math resolution,
//! buffer/style folding, structural promotion, catalogue merge, snapshot,
//! and finally the explosion that splices in download, extract,
//! concatenate, run, import and processing nodes.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{debug, info};

use opensite_catalogue::{CatalogueModel, FORMAT_PRIORITY, choose_priority_resource};

use crate::constants;
use crate::graph::Graph;
use crate::hashing::hash16;
use crate::math::{MathContext, resolve_math};
use crate::node::{Action, InputRef, NodeStatus, NodeType, PropValue, Urn, global_output_key};

/// Managed table handle for a logical slug:
/// `railway-lines--england` -> `opensite_railway_lines__england`.
pub fn table_slug(name: &str) -> String {
    format!(
        "{}{}",
        constants::DATABASE_GENERAL_PREFIX,
        name.replace('-', "_")
    )
}

/// Fallback title derivation for nodes the catalogue does not cover:
/// `railway-lines--uk` -> `Railway Lines`.
pub fn convert_name_to_title(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }

    let delete_area = ["uk", "gb", "eu"];
    let mut cleaned_parts = Vec::new();

    for part in name.split("--") {
        if delete_area.contains(&part.to_lowercase().as_str()) {
            continue;
        }
        let words: Vec<String> = part
            .split('-')
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect();
        cleaned_parts.push(words.join(" "));
    }

    let mut title = cleaned_parts.join(" - ");
    for joining in [" And ", " Of ", " From "] {
        title = title.replace(joining, &joining.to_lowercase());
    }
    title
}

/// Graph builder: owns the graph while it is being assembled.
#[derive(Debug)]
pub struct Builder {
    graph: Graph,
    /// Global defaults merged under each branch's local values.
    defaults: BTreeMap<String, PropValue>,
    output_formats: Vec<String>,
    clip: Option<String>,
    snapgrid: bool,
}

impl Builder {
    pub fn new(
        defaults: BTreeMap<String, PropValue>,
        output_formats: Vec<String>,
        clip: Option<String>,
        snapgrid: bool,
    ) -> Self {
        Self {
            graph: Graph::new(),
            defaults,
            output_formats,
            clip,
            snapgrid,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Parse one site description and attach it as a branch under the root,
    /// then run the enrichment pipeline on it.
    pub fn add_site_yaml(&mut self, site_name: &str, text: &str) -> Result<Urn> {
        let value: serde_yml::Value = serde_yml::from_str(text)
            .with_context(|| format!("failed to parse site YAML: {site_name}"))?;

        let branch = self.graph.add_child(self.graph.root(), site_name)?;
        self.attach_yaml_value(branch, &value)?;

        // Configuration fingerprint, stamped on every registry row the
        // branch produces.
        let hash = hash16(text);
        self.graph
            .node_mut(branch)
            .expect("branch exists")
            .set_prop("hash", PropValue::Str(hash));

        self.enrich_branch(branch)?;

        info!(site = site_name, "site description attached");
        Ok(branch)
    }

    fn attach_yaml_value(&mut self, parent: Urn, value: &serde_yml::Value) -> Result<()> {
        match value {
            serde_yml::Value::Mapping(mapping) => {
                for (key, child_value) in mapping {
                    let Some(key) = key.as_str() else { continue };
                    let child = self.graph.add_child(parent, key)?;
                    self.attach_yaml_value(child, child_value)?;
                }
            }
            serde_yml::Value::Sequence(items) => {
                for item in items {
                    if let Some(name) = item.as_str() {
                        self.graph.add_child(parent, name)?;
                    } else {
                        self.attach_yaml_value(parent, item)?;
                    }
                }
            }
            serde_yml::Value::Null => {}
            scalar => {
                let prop = yaml_scalar_to_prop(scalar);
                self.graph
                    .node_mut(parent)
                    .expect("parent exists")
                    .set_prop("value", prop);
            }
        }
        Ok(())
    }

    fn branch_math_context(&self, branch: Urn) -> MathContext {
        let mut ctx = MathContext::new();
        if let Some(node) = self.graph.node(branch) {
            for key in constants::BRANCH_FUNCTION_KEYS {
                if let Some(value) = node.prop_num(key) {
                    ctx.insert((*key).to_string(), value);
                }
            }
        }
        ctx
    }

    /// Merge file data with global defaults, fold buffers and styles, then
    /// promote the structure subtree to become the branch's children.
    fn enrich_branch(&mut self, branch: Urn) -> Result<()> {
        debug!(branch, "enriching branch");

        // 1. Hoist recognised top-level keys: local value beats default.
        let all_keys = constants::BRANCH_FUNCTION_KEYS
            .iter()
            .chain(constants::BRANCH_DEFAULT_KEYS);
        for key in all_keys {
            let local = self
                .graph
                .find_child(branch, key)
                .and_then(|urn| self.graph.node(urn))
                .and_then(|n| n.props.get("value").cloned());
            let value = local.or_else(|| self.defaults.get(*key).cloned());

            if let Some(value) = value {
                let node = self.graph.node_mut(branch).expect("branch exists");
                if *key == "title" {
                    if let Some(title) = value.as_str() {
                        node.title = title.to_string();
                    }
                } else {
                    node.set_prop(*key, value);
                }
            }
        }

        let ctx = self.branch_math_context(branch);

        let struct_root = self.graph.find_child(branch, "structure");
        let style_root = self.graph.find_child(branch, "style");
        let buffer_root = self.graph.find_child(branch, "buffers");

        let Some(struct_root) = struct_root else {
            // No structure: the branch carries nothing schedulable.
            for child in self.graph.children_of(branch) {
                self.graph.delete_subtree(child);
            }
            return Ok(());
        };

        // 2. Walk categories and datasets: typing, parents, styles, buffers.
        for category in self.graph.children_of(struct_root) {
            self.graph
                .node_mut(category)
                .expect("category exists")
                .node_type = NodeType::Group;

            let category_name = self.graph.node(category).expect("category").name.clone();
            if let Some(style_root) = style_root
                && let Some(style_match) = self.graph.find_child(style_root, &category_name)
            {
                let style: BTreeMap<String, String> = self
                    .graph
                    .children_of(style_match)
                    .into_iter()
                    .filter_map(|urn| {
                        let node = self.graph.node(urn)?;
                        let value = node.prop_str("value")?.to_string();
                        Some((node.name.clone(), value))
                    })
                    .collect();
                self.graph.node_mut(category).expect("category").style = Some(style);
            }

            for dataset in self.graph.children_of(category) {
                let name = self.graph.node(dataset).expect("dataset").name.clone();
                {
                    let node = self.graph.node_mut(dataset).expect("dataset");
                    node.node_type = NodeType::Source;
                    if let Some(prefix) = name.split_once("--").map(|(p, _)| p) {
                        node.set_prop("parent", PropValue::Str(prefix.to_string()));
                    }
                }

                if let Some(buffer_root) = buffer_root
                    && let Some(buf_node) = self.graph.find_child(buffer_root, &name)
                {
                    let raw = self
                        .graph
                        .node(buf_node)
                        .and_then(|n| n.props.get("value").cloned());
                    let resolved = match raw {
                        Some(PropValue::Str(expr)) => resolve_math(&expr, &ctx),
                        Some(PropValue::Num(n)) => Some(n),
                        _ => None,
                    };
                    if let Some(metres) = resolved {
                        self.graph
                            .node_mut(dataset)
                            .expect("dataset")
                            .set_prop("buffer_value", PropValue::Num(metres));
                    }
                }
            }
        }

        // 3. Delete the original YAML siblings of the structure subtree.
        for sibling in self.graph.siblings(struct_root) {
            self.graph.delete_subtree(sibling);
        }

        // 4. Promote structure children onto the branch, drop the container.
        for category in self.graph.children_of(struct_root) {
            self.graph.node_mut(category).expect("category").parent = Some(branch);
            self.graph
                .node_mut(branch)
                .expect("branch")
                .children
                .push(category);
        }
        self.graph
            .node_mut(struct_root)
            .expect("struct root")
            .children
            .clear();
        self.graph.delete_subtree(struct_root);

        // 5. Resolve arithmetic everywhere under the branch.
        self.resolve_branch_math(branch, &ctx);

        // 6. Fallback titles for anything still carrying its raw slug.
        self.apply_titles(branch);

        Ok(())
    }

    fn resolve_branch_math(&mut self, branch: Urn, ctx: &MathContext) {
        for urn in self.graph.subtree(branch) {
            let Some(node) = self.graph.node_mut(urn) else {
                continue;
            };
            for value in node.props.values_mut() {
                if let PropValue::Str(raw) = value
                    && let Some(resolved) = resolve_math(raw, ctx)
                {
                    *value = PropValue::Num(resolved);
                }
            }
        }
    }

    fn apply_titles(&mut self, branch: Urn) {
        for urn in self.graph.subtree(branch) {
            let Some(node) = self.graph.node_mut(urn) else {
                continue;
            };
            if node.title.is_empty() || node.title == node.name {
                node.title = convert_name_to_title(&node.name);
            }
        }
    }

    /// Overwrite titles, inputs, and formats from the catalogue. Among
    /// multiple resources the priority list decides; the first encountered
    /// wins between equals.
    pub fn merge_catalogue(&mut self, model: &CatalogueModel) {
        info!("synchronizing node metadata with the catalogue");

        struct Meta {
            title: String,
            input: Option<String>,
            format: Option<String>,
        }

        let mut lookup: BTreeMap<String, Meta> = BTreeMap::new();

        for (group_name, data) in model {
            if group_name != "default" {
                lookup.insert(
                    group_name.clone(),
                    Meta {
                        title: data.group_title.trim().to_string(),
                        input: None,
                        format: None,
                    },
                );
            }

            for dataset in &data.datasets {
                let Some(resource) = choose_priority_resource(&dataset.resources, FORMAT_PRIORITY)
                else {
                    continue;
                };
                lookup.insert(
                    dataset.package_name.clone(),
                    Meta {
                        title: dataset.title.trim().to_string(),
                        input: Some(resource.url.trim().to_string()),
                        format: Some(resource.format.trim().to_string()),
                    },
                );
            }
        }

        let mut matches = 0usize;
        let urns: Vec<Urn> = self.graph.find_urns(|_| true);
        for urn in urns {
            let Some(node) = self.graph.node_mut(urn) else {
                continue;
            };
            if let Some(meta) = lookup.get(&node.name) {
                node.title = meta.title.clone();
                if let Some(url) = &meta.input {
                    node.input = InputRef::classify(url);
                }
                if let Some(format) = &meta.format {
                    node.format = Some(format.clone());
                }
                matches += 1;
            }
        }

        info!(matches, "catalogue metadata merged");
    }

    /// Rewrite the enriched tree into the executable graph.
    pub fn explode(&mut self) -> Result<()> {
        self.graph.snapshot_core_structure();

        self.add_parents();
        self.add_processing_chain()?;
        self.finalize_amalgamates();
        self.add_downloads()?;
        self.add_unzips()?;
        self.add_osm_stack()?;
        self.unify_global_resources();
        self.settle_structural_nodes();

        self.graph.verify_integrity()
    }

    /// Nodes duplicated across branch contexts that produce the same
    /// artifact are clones of one physical task: give them a shared global
    /// urn so the scheduler runs exactly one and mirrors its status onto
    /// the rest. Dynamic-output nodes keep the urns the OSM splice
    /// assigned, since their metadata keys embed them.
    fn unify_global_resources(&mut self) {
        let mut by_artifact: BTreeMap<(Action, String), Vec<Urn>> = BTreeMap::new();
        for node in self.graph.nodes() {
            if let (Some(action), Some(output)) = (node.action, node.output.clone()) {
                by_artifact.entry((action, output)).or_default().push(node.urn);
            }
        }

        for ((action, output), urns) in by_artifact {
            if urns.len() < 2 {
                continue;
            }
            let shared = self.graph.new_global_urn();
            debug!(
                action = action.as_str(),
                output,
                clones = urns.len(),
                "unifying clone nodes under one global urn"
            );
            for urn in urns {
                self.graph
                    .node_mut(urn)
                    .expect("clone urn exists")
                    .global_urn = shared;
            }
        }
    }

    /// Group siblings sharing a `parent` property under a new amalgamate
    /// node whose title is the common prefix of the children's titles.
    fn add_parents(&mut self) {
        info!("grouping datasets by parent slug");

        // Post-order so nested groups settle before their parents.
        let mut order = self.graph.subtree(self.graph.root());
        order.reverse();

        for current in order {
            if self.graph.node(current).is_none() {
                continue;
            }

            let mut group_map: BTreeMap<String, Vec<Urn>> = BTreeMap::new();
            for child in self.graph.children_of(current) {
                if let Some(parent_val) = self
                    .graph
                    .node(child)
                    .and_then(|n| n.prop_str("parent"))
                    .map(str::to_string)
                {
                    group_map.entry(parent_val).or_default().push(child);
                }
            }

            for (group_name, siblings) in group_map {
                let ref_child = self.graph.node(siblings[0]).expect("sibling exists");
                let original_title = if ref_child.title.is_empty() {
                    ref_child.name.clone()
                } else {
                    ref_child.title.clone()
                };

                let group_title = if let Some((prefix, _)) = original_title.rsplit_once(" - ") {
                    prefix.to_string()
                } else {
                    convert_name_to_title(&group_name)
                };

                let group = self
                    .graph
                    .wrap_group(current, &siblings, &group_name, &group_title)
                    .expect("group children are valid");
                {
                    let node = self.graph.node_mut(group).expect("group exists");
                    node.node_type = NodeType::Group;
                    node.action = Some(Action::Amalgamate);
                }
                debug!(group = group_name, urn = group, "created amalgamate group");
            }
        }
    }

    /// Retype data sources as imports and splice the spatial processing
    /// chain above them: optional buffer, then preprocess per dataset;
    /// amalgamate on groups; postprocess, optional clip, and one output
    /// node per requested format above each top-level group.
    fn add_processing_chain(&mut self) -> Result<()> {
        info!("splicing spatial processing chain");

        for branch in self.graph.branches() {
            // Datasets: import -> (buffer) -> preprocess.
            for urn in self.graph.subtree(branch) {
                let Some(node) = self.graph.node(urn) else {
                    continue;
                };
                if node.node_type != NodeType::Source {
                    continue;
                }
                let name = node.name.clone();
                let import_table = table_slug(&name);
                let buffer_value = node.prop_num("buffer_value");

                {
                    let node = self.graph.node_mut(urn).expect("source exists");
                    node.node_type = NodeType::Import;
                    node.action = Some(Action::Import);
                    node.output = Some(import_table.clone());
                }

                let mut last_table = import_table;
                if let Some(metres) = buffer_value {
                    let buffered_table = format!("{last_table}_buffered");
                    let buffer = self.graph.add_detached(format!("{name}--buffer"));
                    {
                        let bnode = self.graph.node_mut(buffer).expect("buffer exists");
                        bnode.title = format!("Buffer - {name}");
                        bnode.node_type = NodeType::Process;
                        bnode.action = Some(Action::Buffer);
                        bnode.input = InputRef::Table(last_table.clone());
                        bnode.output = Some(buffered_table.clone());
                        bnode.set_prop("buffer_value", PropValue::Num(metres));
                    }
                    self.graph.insert_parent(urn, buffer)?;
                    last_table = buffered_table;
                }

                let processed_table = format!("{last_table}_processed");
                let preprocess = self.graph.add_detached(format!("{name}--preprocess"));
                {
                    let pnode = self.graph.node_mut(preprocess).expect("preprocess exists");
                    pnode.title = format!("Preprocess - {name}");
                    pnode.node_type = NodeType::Process;
                    pnode.action = Some(Action::Preprocess);
                    pnode.input = InputRef::Table(last_table.clone());
                    pnode.output = Some(processed_table);
                    if self.snapgrid {
                        pnode.set_prop("snapgrid", PropValue::Bool(true));
                    }
                }
                let chain_top = if buffer_value.is_some() {
                    self.graph.parent_of(urn).expect("buffer was spliced")
                } else {
                    urn
                };
                self.graph.insert_parent(chain_top, preprocess)?;
            }

            // Groups: every group amalgamates its children's outputs.
            let branch_name = self.graph.node(branch).expect("branch").name.clone();
            for urn in self.graph.subtree(branch) {
                let Some(node) = self.graph.node(urn) else {
                    continue;
                };
                if node.node_type != NodeType::Group {
                    continue;
                }
                let group_name = node.name.clone();
                let output = if self.graph.parent_of(urn) == Some(branch) {
                    // Top-level groups are branch-qualified so two sites can
                    // both declare a 'transport' layer.
                    format!("{}__{}", table_slug(&branch_name), group_name.replace('-', "_"))
                } else {
                    table_slug(&group_name)
                };
                let node = self.graph.node_mut(urn).expect("group exists");
                node.action = Some(Action::Amalgamate);
                node.output = Some(output);
            }

            // Top-level groups: postprocess -> (clip) -> outputs.
            let branch_hash = self
                .graph
                .node(branch)
                .and_then(|n| n.prop_str("hash"))
                .unwrap_or_default()
                .to_string();
            for group in self.graph.children_of(branch) {
                let Some(node) = self.graph.node(group) else {
                    continue;
                };
                if node.node_type != NodeType::Group {
                    continue;
                }
                let group_name = node.name.clone();
                let group_table = node.output.clone().context("group output set above")?;

                let welded_table = format!("{group_table}_welded");
                let postprocess = self.graph.add_detached(format!("{group_name}--postprocess"));
                {
                    let pnode = self.graph.node_mut(postprocess).expect("postprocess");
                    pnode.title = format!("Weld - {group_name}");
                    pnode.node_type = NodeType::Process;
                    pnode.action = Some(Action::Postprocess);
                    pnode.input = InputRef::Table(group_table.clone());
                    pnode.output = Some(welded_table.clone());
                }
                self.graph.insert_parent(group, postprocess)?;

                let mut chain_top = postprocess;
                let mut last_table = welded_table;

                if let Some(area) = self.clip.clone() {
                    let clip = self.graph.add_detached(format!("{group_name}--clip"));
                    let clip_gurn = self.graph.new_global_urn();
                    {
                        let cnode = self.graph.node_mut(clip).expect("clip");
                        cnode.title = format!("Clip - {group_name}");
                        cnode.node_type = NodeType::Process;
                        cnode.action = Some(Action::Clip);
                        cnode.global_urn = clip_gurn;
                        cnode.input = InputRef::Table(last_table.clone());
                        // Output handle is derived at execution time and
                        // published under the clip node's global urn.
                        cnode.output = None;
                        cnode.set_prop("clip", PropValue::Str(area));
                        // Dynamic handles register at execution time and
                        // still need their branch context.
                        cnode.set_prop("branch", PropValue::Str(branch_name.clone()));
                        cnode.set_prop("hash", PropValue::Str(branch_hash.clone()));
                    }
                    self.graph.insert_parent(chain_top, clip)?;
                    chain_top = clip;
                    last_table = global_output_key(clip_gurn);
                }

                for format in self.output_formats.clone() {
                    let out = self
                        .graph
                        .add_detached(format!("{group_name}--output-{format}"));
                    {
                        let onode = self.graph.node_mut(out).expect("output");
                        onode.title = format!("Output - {group_name} ({format})");
                        onode.node_type = NodeType::Output;
                        onode.action = Some(Action::Output);
                        onode.format = Some(format.clone());
                        onode.input = if last_table.starts_with("VAR:") {
                            InputRef::Variable(last_table.clone())
                        } else {
                            InputRef::Table(last_table.clone())
                        };
                        // Branch-qualified so two sites can both emit a
                        // 'transport' layer file.
                        onode.output = Some(format!(
                            "{}--{}.{}",
                            branch_name,
                            group_name,
                            output_file_extension(&format)
                        ));
                    }
                    self.graph.insert_parent(chain_top, out)?;
                    chain_top = out;
                }
            }
        }

        Ok(())
    }

    /// Record each amalgamate node's input handles in its `children` prop.
    fn finalize_amalgamates(&mut self) {
        let amalgamates = self
            .graph
            .find_urns(|n| n.action == Some(Action::Amalgamate));
        for urn in amalgamates {
            let outputs: Vec<String> = self
                .graph
                .children_of(urn)
                .into_iter()
                .filter_map(|c| self.graph.node(c).and_then(|n| n.output.clone()))
                .filter(|o| o.starts_with(constants::DATABASE_GENERAL_PREFIX))
                .collect();
            self.graph
                .node_mut(urn)
                .expect("amalgamate exists")
                .set_prop("children", PropValue::List(outputs));
        }
    }

    /// Insert a download child under every terminal node whose input is a
    /// URL, rewriting the parent's input to the local filename.
    fn add_downloads(&mut self) -> Result<()> {
        info!("adding download nodes for remote datasources");

        for urn in self.graph.terminal_nodes() {
            let Some(node) = self.graph.node(urn) else {
                continue;
            };
            let Some(url) = node.input.as_remote().map(str::to_string) else {
                continue;
            };

            let name = node.name.clone();
            let title = node.title.clone();
            let format = node.format.clone();
            let extension = format
                .as_deref()
                .and_then(constants::file_extension_for_format)
                .unwrap_or("dat");
            let local_file = format!("{name}.{extension}");

            let download = self.graph.add_child(urn, name.clone())?;
            {
                let dnode = self.graph.node_mut(download).expect("download exists");
                dnode.title = format!("Download - {title}");
                dnode.node_type = NodeType::Download;
                dnode.action = Some(Action::Download);
                dnode.input = InputRef::Remote(url);
                dnode.output = Some(local_file.clone());
                dnode.format = format;
            }

            self.graph.node_mut(urn).expect("parent exists").input = InputRef::File(local_file);
            debug!(urn = download, "added download node");
        }

        Ok(())
    }

    /// Split every download of a `.zip` URL into a fetcher child plus an
    /// unzip parent.
    fn add_unzips(&mut self) -> Result<()> {
        info!("checking for zip archives to extract");

        for urn in self.graph.terminal_nodes() {
            let Some(node) = self.graph.node(urn) else {
                continue;
            };
            let Some(url) = node.input.as_remote().map(str::to_string) else {
                continue;
            };
            let path_only = url.split('?').next().unwrap_or(&url).to_lowercase();
            if !path_only.ends_with(".zip") {
                continue;
            }

            let name = node.name.clone();
            let title = node.title.clone();
            let format = node.format.clone();
            let target = node
                .output
                .clone()
                .with_context(|| format!("download node {name} has no output"))?;
            let zip_file = format!("{target}.zip");

            let fetcher = self.graph.add_child(urn, format!("{name}-file"))?;
            {
                let fnode = self.graph.node_mut(fetcher).expect("fetcher exists");
                fnode.title = title.clone();
                fnode.node_type = NodeType::Download;
                fnode.action = Some(Action::Download);
                fnode.input = InputRef::Remote(url);
                fnode.output = Some(zip_file.clone());
                fnode.format = format;
            }

            {
                let unzipper = self.graph.node_mut(urn).expect("unzipper exists");
                unzipper.node_type = NodeType::Extract;
                unzipper.action = Some(Action::Unzip);
                unzipper.title = format!("Unzip - {title}");
                unzipper.input = InputRef::File(zip_file);
                // output stays as the extracted filename
            }
            debug!(urn, "inserted unzip step");
        }

        Ok(())
    }

    /// Rewrite OSM mapping downloads into the three-layer stack: a shared
    /// runner over a shared downloader and a shared concatenator, with the
    /// original dataset node retyped to import the runner's output.
    fn add_osm_stack(&mut self) -> Result<()> {
        info!("splicing OSM export stack");

        let yml_downloads = self.graph.find_urns(|n| {
            n.action == Some(Action::Download)
                && n.format.as_deref() == Some(constants::OSM_YML_FORMAT)
        });
        if yml_downloads.is_empty() {
            return Ok(());
        }

        // Group by the lineage-inherited upstream OSM extract URL.
        let mut groups: BTreeMap<String, Vec<Urn>> = BTreeMap::new();
        for urn in yml_downloads {
            let Some(osm_url) = self
                .graph
                .lineage_prop(urn, "osm")
                .and_then(PropValue::as_str)
                .map(str::to_string)
            else {
                continue;
            };
            groups.entry(osm_url).or_default().push(urn);
        }

        for (osm_url, group_nodes) in groups {
            let mut group_outputs: Vec<String> = group_nodes
                .iter()
                .filter_map(|urn| self.graph.node(*urn).and_then(|n| n.output.clone()))
                .collect();
            group_outputs.sort();
            group_outputs.dedup();

            let osm_basename = osm_url.rsplit('/').next().unwrap_or(&osm_url).to_string();

            let concat_gurn = self.graph.new_global_urn();
            let run_gurn = self.graph.new_global_urn();
            let down_gurn = self.graph.new_global_urn();

            for yml_download in group_nodes {
                let concat = self.graph.add_detached(format!("osm-consolidator--{osm_url}"));
                {
                    let cnode = self.graph.node_mut(concat).expect("concat");
                    cnode.title = format!("Concatenate OSM Configs - {osm_basename}");
                    cnode.node_type = NodeType::Concatenate;
                    cnode.action = Some(Action::Concatenate);
                    cnode.global_urn = concat_gurn;
                    cnode.input = InputRef::FileSet(group_outputs.clone());
                    cnode.set_prop("osm", PropValue::Str(osm_url.clone()));
                }

                let runner = self.graph.add_detached(format!("osm-runner--{osm_url}"));
                {
                    let rnode = self.graph.node_mut(runner).expect("runner");
                    rnode.title = format!("Run OSM Export Tool - {osm_basename}");
                    rnode.node_type = NodeType::Run;
                    rnode.action = Some(Action::Run);
                    rnode.global_urn = run_gurn;
                    rnode.input = InputRef::Variable(global_output_key(concat_gurn));
                    rnode.set_prop("osm", PropValue::Str(osm_url.clone()));
                }

                // Concatenator above the yml download, runner above that.
                self.graph.insert_parent(yml_download, concat)?;
                self.graph.insert_parent(concat, runner)?;

                // Downloader joins the runner as a sibling of the
                // concatenator.
                let downloader = self.graph.add_detached(format!("osm-downloader--{osm_url}"));
                {
                    let dnode = self.graph.node_mut(downloader).expect("downloader");
                    dnode.title = format!("Download OSM Source - {osm_basename}");
                    dnode.node_type = NodeType::Download;
                    dnode.action = Some(Action::Download);
                    dnode.global_urn = down_gurn;
                    dnode.format = Some("OSM".to_string());
                    dnode.input = InputRef::Remote(osm_url.clone());
                    dnode.output = Some(osm_basename.clone());
                    dnode.set_prop("osm", PropValue::Str(osm_url.clone()));
                }
                self.graph.attach(runner, downloader)?;

                // The original dataset node now imports the runner's output.
                let yml_file = self
                    .graph
                    .node(yml_download)
                    .and_then(|n| n.output.clone())
                    .context("yml download has an output")?;
                let import = self
                    .graph
                    .parent_of(runner)
                    .context("runner has an import parent")?;
                let inode = self.graph.node_mut(import).expect("import exists");
                inode.action = Some(Action::Import);
                inode.node_type = NodeType::Import;
                inode.input = InputRef::Variable(global_output_key(run_gurn));
                inode.set_prop("osm", PropValue::Str(osm_url.clone()));
                inode.set_prop("yml", PropValue::Str(yml_file));
            }
        }

        Ok(())
    }

    /// Structural nodes (root, branches, leftover property nodes) never
    /// execute; mark them processed so dependents are not blocked on them.
    fn settle_structural_nodes(&mut self) {
        let structural = self.graph.find_urns(|n| n.action.is_none());
        for urn in structural {
            if let Some(node) = self.graph.node_mut(urn) {
                node.status = NodeStatus::Processed;
            }
        }
    }
}

fn yaml_scalar_to_prop(value: &serde_yml::Value) -> PropValue {
    match value {
        serde_yml::Value::Bool(b) => PropValue::Bool(*b),
        serde_yml::Value::Number(n) => PropValue::Num(n.as_f64().unwrap_or(0.0)),
        serde_yml::Value::String(s) => PropValue::Str(s.clone()),
        other => PropValue::Str(format!("{other:?}")),
    }
}

fn output_file_extension(format: &str) -> &str {
    match format {
        "gpkg" => "gpkg",
        "geojson" => "geojson",
        other => other,
    }
}
