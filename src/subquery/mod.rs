//! SubQuery tree model
//!
//! One node per backend-bound fetch unit. Nodes live in an arena owned by
//! the tree; the parent link is a plain index used only for correlation
//! lookups, while ownership (and close cascades) flow parent to children
//! through the `children` lists.

pub mod relational;
pub mod text;

use tracing::warn;

use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::types::{ColumnInfo, Param, PosMapping, TypeMap, Value};

use relational::RelationalNode;
use text::TextNode;

/// Index of a node within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Backend variant of a subquery node, declared at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Relational,
    Text,
}

/// Backend connection state, a closed set of two live variants.
pub(crate) enum BackendState {
    Relational(RelationalNode),
    Text(TextNode),
}

/// Compile-time description of one subquery node, produced by the
/// external query compiler.
pub struct NodeSpec {
    /// Catalog name of the backend location this node fetches from.
    pub location: String,
    /// Dataset name within the location (opaque to the engine).
    pub dataset: String,
    pub kind: BackendKind,
    /// Compiled backend request: SQL text with positional placeholders for
    /// relational nodes, an opaque request template with `?` placeholders
    /// for text nodes. Placeholders are numbered by local parameter slot,
    /// in order of appearance.
    pub request: String,
    /// Local parameter slot -> engine-level parameter slot.
    pub parameter_mapping: PosMapping,
    /// Local output column -> engine-level output column.
    pub result_mapping: PosMapping,
    /// Local parameter slot -> position in the parent's exported tuple.
    pub importable_mapping: PosMapping,
    /// Local output column -> position in this node's exported tuple.
    pub exportable_mapping: PosMapping,
    /// Declared per-column metadata, if the compiler resolved any.
    pub columns: Vec<ColumnInfo>,
}

/// One backend-bound fetch unit with its declared mappings.
pub struct SubQueryNode {
    pub(crate) location: String,
    pub(crate) dataset: String,
    pub(crate) parameter_mapping: PosMapping,
    pub(crate) result_mapping: PosMapping,
    pub(crate) importable_mapping: PosMapping,
    pub(crate) exportable_mapping: PosMapping,
    pub(crate) columns: Vec<ColumnInfo>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    backend: BackendState,
    closed: bool,
}

impl SubQueryNode {
    fn from_spec(spec: NodeSpec, parent: Option<NodeId>) -> Self {
        let backend = match spec.kind {
            BackendKind::Relational => {
                BackendState::Relational(RelationalNode::new(spec.request))
            }
            BackendKind::Text => BackendState::Text(TextNode::new(spec.request)),
        };
        Self {
            location: spec.location,
            dataset: spec.dataset,
            parameter_mapping: spec.parameter_mapping,
            result_mapping: spec.result_mapping,
            importable_mapping: spec.importable_mapping,
            exportable_mapping: spec.exportable_mapping,
            columns: spec.columns,
            parent,
            children: Vec::new(),
            backend,
            closed: false,
        }
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self.backend {
            BackendState::Relational(_) => BackendKind::Relational,
            BackendState::Text(_) => BackendKind::Text,
        }
    }

    /// Acquires the backend connection. Idempotent while live; a node is
    /// never reopened after close.
    pub(crate) async fn open(&mut self, catalog: &Catalog) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::closed("subquery"));
        }
        match &mut self.backend {
            BackendState::Relational(node) => node.open(catalog, &self.location).await,
            BackendState::Text(node) => node.open(catalog, &self.location),
        }
    }

    /// Caps the number of rows this node will report. 0 means unlimited.
    /// The engine only ever applies this to the root node.
    pub(crate) fn set_max_rows(&mut self, rows: u64) {
        match &mut self.backend {
            BackendState::Relational(node) => node.set_max_rows(rows),
            BackendState::Text(node) => node.set_max_rows(rows),
        }
    }

    /// Binds one local parameter slot. Relational nodes keep the typed
    /// parameter for native binding; text nodes keep its text form.
    pub(crate) fn bind_param(&mut self, local: usize, param: &Param) {
        match &mut self.backend {
            BackendState::Relational(node) => node.bind_param(local, param.clone()),
            BackendState::Text(node) => node.set_parameter(local, param.text_form()),
        }
    }

    /// Binds one local parameter slot from a correlation value.
    pub(crate) fn bind_import(&mut self, local: usize, value: &Value) {
        match &mut self.backend {
            BackendState::Relational(node) => node.bind_param(local, Param::inferred(value.clone())),
            BackendState::Text(node) => node.set_parameter(local, value.text_form()),
        }
    }

    /// Session-wide settings; meaningful for relational nodes only.
    pub(crate) fn apply_session_settings(&mut self, type_map: &TypeMap, max_field_size: usize) {
        if let BackendState::Relational(node) = &mut self.backend {
            node.set_type_map(type_map.clone());
            node.set_max_field_size(max_field_size);
        }
    }

    /// Lazily triggers execution on first call; reports whether at least
    /// one more unread row exists, bounded by any max-rows limit.
    pub(crate) async fn has_next_row(&mut self) -> EngineResult<bool> {
        if self.closed {
            return Err(EngineError::closed("subquery"));
        }
        match &mut self.backend {
            BackendState::Relational(node) => node.has_next_row().await,
            BackendState::Text(node) => node.has_next_row().await,
        }
    }

    /// Returns exactly one node-local row and advances; an empty vec when
    /// exhausted, never an error.
    pub(crate) async fn next_row(&mut self) -> EngineResult<Vec<Value>> {
        if self.closed {
            return Err(EngineError::closed("subquery"));
        }
        match &mut self.backend {
            BackendState::Relational(node) => node.next_row().await,
            BackendState::Text(node) => node.next_row().await,
        }
    }

    /// Discards the current execution so the next `has_next_row` submits
    /// the request again with the currently bound parameters. Used by the
    /// engine to drain a child once per distinct correlation key.
    pub(crate) fn reset_execution(&mut self) {
        match &mut self.backend {
            BackendState::Relational(node) => node.reset_execution(),
            BackendState::Text(node) => node.reset_execution(),
        }
    }

    /// Releases this node's own backend resources. Best-effort: failures
    /// are logged and swallowed; already-closed is a no-op.
    pub(crate) async fn close_node(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let result = match &mut self.backend {
            BackendState::Relational(node) => node.close().await,
            BackendState::Text(node) => node.close(),
        };
        if let Err(err) = result {
            warn!(location = %self.location, dataset = %self.dataset, %err, "error closing subquery node");
        }
    }
}

/// The compiled subquery tree handed to the engine.
pub struct QueryTree {
    pub(crate) nodes: Vec<SubQueryNode>,
    pub(crate) param_count: usize,
    pub(crate) output_columns: Vec<String>,
}

impl QueryTree {
    pub(crate) fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub(crate) fn node(&self, id: NodeId) -> &SubQueryNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut SubQueryNode {
        &mut self.nodes[id.0]
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn output_columns(&self) -> &[String] {
        &self.output_columns
    }

    /// Breadth-first node order starting at the root.
    pub(crate) fn bfs_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self.root());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in &self.node(id).children {
                queue.push_back(*child);
            }
        }
        order
    }
}

/// Assembles a valid subquery tree on behalf of the external compiler.
/// The builder enforces the structural invariants the engine relies on:
/// exactly one root, children attached to existing nodes, mappings fixed
/// at build time.
pub struct TreeBuilder {
    nodes: Vec<SubQueryNode>,
    param_count: usize,
    output_columns: Vec<String>,
}

impl TreeBuilder {
    pub fn new(param_count: usize, output_columns: Vec<String>) -> Self {
        Self {
            nodes: Vec::new(),
            param_count,
            output_columns,
        }
    }

    /// Places the root node. Must be called exactly once, first.
    pub fn root(&mut self, spec: NodeSpec) -> NodeId {
        assert!(self.nodes.is_empty(), "tree already has a root");
        self.nodes.push(SubQueryNode::from_spec(spec, None));
        NodeId(0)
    }

    /// Attaches a child node under an existing parent.
    pub fn child(&mut self, parent: NodeId, spec: NodeSpec) -> NodeId {
        assert!(parent.0 < self.nodes.len(), "parent node does not exist");
        let id = NodeId(self.nodes.len());
        self.nodes.push(SubQueryNode::from_spec(spec, Some(parent)));
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn build(self) -> QueryTree {
        assert!(!self.nodes.is_empty(), "tree has no root");
        QueryTree {
            nodes: self.nodes,
            param_count: self.param_count,
            output_columns: self.output_columns,
        }
    }
}
