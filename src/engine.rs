//! Query engine
//!
//! Drives one execution of a compiled subquery tree. Each call to
//! [`QueryEngine::get_next_row`] consumes exactly one root row and fans it
//! out through every descendant node, producing zero or more fully merged
//! logical rows. Child executions are memoized per call by correlation
//! key, so a child runs once per distinct imported tuple, not once per
//! parent row.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::subquery::{NodeId, QueryTree};
use crate::types::{ColumnInfo, CorrelationKey, Param, PosMapping, Row, TypeMap, Value};

pub struct QueryEngine {
    tree: QueryTree,
    catalog: Arc<Catalog>,
    params: BTreeMap<usize, Param>,
    type_map: TypeMap,
    max_field_size: usize,
    max_rows: u64,
    columns: Vec<ColumnInfo>,
    initialized: bool,
    closed: bool,
}

impl QueryEngine {
    pub fn new(tree: QueryTree, catalog: Arc<Catalog>) -> Self {
        Self {
            tree,
            catalog,
            params: BTreeMap::new(),
            type_map: TypeMap::new(),
            max_field_size: 0,
            max_rows: 0,
            columns: Vec::new(),
            initialized: false,
            closed: false,
        }
    }

    /// Binds one engine-level parameter slot (1-based).
    pub fn set_param(&mut self, index: usize, param: Param) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::closed("query"));
        }
        if index == 0 || index > self.tree.param_count() {
            return Err(EngineError::ParamIndexOutOfRange {
                index,
                count: self.tree.param_count(),
            });
        }
        self.params.insert(index, param);
        Ok(())
    }

    pub fn clear_params(&mut self) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::closed("query"));
        }
        self.params.clear();
        Ok(())
    }

    pub fn set_type_map(&mut self, map: TypeMap) {
        self.type_map = map;
    }

    pub fn set_max_field_size(&mut self, size: usize) {
        self.max_field_size = size;
    }

    /// Caps the number of root rows this execution will consume. 0 means
    /// unlimited. Because every logical row descends from exactly one root
    /// row, this bounds the result without bounding any inner fan-out.
    pub fn set_max_rows(&mut self, rows: u64) {
        self.max_rows = rows;
    }

    /// Column metadata for the logical result, merged across the tree.
    /// Triggers initialization if the query has not started yet.
    pub async fn metadata(&mut self) -> EngineResult<&[ColumnInfo]> {
        if self.closed {
            return Err(EngineError::closed("query"));
        }
        self.ensure_initialized().await?;
        Ok(&self.columns)
    }

    /// Reports whether at least one more logical row can be produced.
    /// Governed by root cardinality: a pending root row may still fan out
    /// to zero logical rows.
    pub async fn has_more_rows(&mut self) -> EngineResult<bool> {
        if self.closed {
            return Err(EngineError::closed("query"));
        }
        self.ensure_initialized().await?;
        let root = self.tree.root();
        self.tree.node_mut(root).has_next_row().await
    }

    /// Consumes one root row and returns every logical row derived from
    /// it. An empty vec means the root row joined to nothing (or the root
    /// is exhausted); call [`Self::has_more_rows`] to tell the two apart.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_next_row(&mut self) -> EngineResult<Vec<Row>> {
        if self.closed {
            return Err(EngineError::closed("query"));
        }
        self.ensure_initialized().await?;

        let width = self.tree.output_columns().len();
        let order = self.tree.bfs_order();
        let root = self.tree.root();

        if !self.tree.node_mut(root).has_next_row().await? {
            return Ok(Vec::new());
        }
        let root_local = self.tree.node_mut(root).next_row().await?;

        let mut rows = vec![{
            let mut row = Row::new(vec![Value::Null; width]);
            merge_local(&mut row, &root_local, &self.tree.node(root).result_mapping);
            row
        }];
        // Per-node exported tuple lists, kept entry-aligned with `rows` so
        // any later node can correlate against any ancestor it imports from.
        let mut exports: Vec<Vec<Vec<Value>>> = vec![Vec::new(); order.len()];
        exports[root.0] = vec![export_tuple(
            &root_local,
            &self.tree.node(root).exportable_mapping,
        )];
        let mut processed: Vec<NodeId> = vec![root];

        for &id in order.iter().skip(1) {
            let node = self.tree.node(id);
            let parent = match node.parent {
                Some(p) => p,
                None => continue,
            };
            let importable = node.importable_mapping.clone();
            let result_mapping = node.result_mapping.clone();
            let exportable = node.exportable_mapping.clone();

            // One child execution per distinct imported tuple this call.
            let mut memo: HashMap<CorrelationKey, Vec<Vec<Value>>> = HashMap::new();
            let mut new_rows = Vec::new();
            let mut new_exports: Vec<Vec<Vec<Value>>> = vec![Vec::new(); order.len()];

            for (i, row) in rows.iter().enumerate() {
                let imported: Vec<Value> = importable
                    .iter()
                    .map(|(_, pos)| {
                        exports[parent.0][i]
                            .get(pos - 1)
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                let key = CorrelationKey::from_values(&imported);

                if !memo.contains_key(&key) {
                    let node = self.tree.node_mut(id);
                    node.reset_execution();
                    for ((local, _), value) in importable.iter().zip(imported.iter()) {
                        node.bind_import(local, value);
                    }
                    let mut fetched = Vec::new();
                    while node.has_next_row().await? {
                        fetched.push(node.next_row().await?);
                    }
                    debug!(rows = fetched.len(), "child subquery drained");
                    memo.insert(key.clone(), fetched);
                }

                // Zero child rows drops the parent row entirely.
                for local_row in &memo[&key] {
                    let mut merged = row.clone();
                    merge_local(&mut merged, local_row, &result_mapping);
                    new_rows.push(merged);
                    for &prev in &processed {
                        new_exports[prev.0].push(exports[prev.0][i].clone());
                    }
                    new_exports[id.0].push(export_tuple(local_row, &exportable));
                }
            }

            rows = new_rows;
            for &prev in &processed {
                exports[prev.0] = std::mem::take(&mut new_exports[prev.0]);
            }
            exports[id.0] = std::mem::take(&mut new_exports[id.0]);
            processed.push(id);
        }

        Ok(rows)
    }

    /// Tears down every node in the tree, leaves first. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut order = self.tree.bfs_order();
        order.reverse();
        for id in order {
            self.tree.node_mut(id).close_node().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Recovers the tree from an engine that failed to initialize, so the
    /// owner can retry with corrected parameters.
    pub(crate) fn into_tree(self) -> QueryTree {
        self.tree
    }

    async fn ensure_initialized(&mut self) -> EngineResult<()> {
        if self.initialized {
            return Ok(());
        }

        // Every engine-level slot must be bound before any backend is
        // touched, mapped into a node or not.
        for slot in 1..=self.tree.param_count() {
            if !self.params.contains_key(&slot) {
                return Err(EngineError::ParamMissing { index: slot });
            }
        }

        let order = self.tree.bfs_order();
        for &id in &order {
            let catalog = Arc::clone(&self.catalog);
            let node = self.tree.node_mut(id);
            node.open(&catalog).await?;
            node.apply_session_settings(&self.type_map, self.max_field_size);
            let slots: Vec<(usize, usize)> = node.parameter_mapping.iter().collect();
            for (local, engine_slot) in slots {
                if let Some(param) = self.params.get(&engine_slot) {
                    self.tree.node_mut(id).bind_param(local, param);
                }
            }
        }

        let root = self.tree.root();
        self.tree.node_mut(root).set_max_rows(self.max_rows);

        self.columns = self.merge_metadata();
        self.initialized = true;
        Ok(())
    }

    /// Folds per-node declared column metadata into one logical set, in
    /// breadth-first order so ancestors win naming and descendants fill
    /// gaps. Columns no node declares fall back to generic text.
    fn merge_metadata(&self) -> Vec<ColumnInfo> {
        let names = self.tree.output_columns();
        let mut columns: Vec<ColumnInfo> = names
            .iter()
            .map(|n| ColumnInfo::generic_string(n.clone()))
            .collect();
        let mut resolved = vec![false; names.len()];

        for id in self.tree.bfs_order() {
            let node = self.tree.node(id);
            for (local, global) in node.result_mapping.iter() {
                if global == 0 || global > columns.len() || resolved[global - 1] {
                    continue;
                }
                if let Some(info) = node.columns.get(local - 1) {
                    let mut info = info.clone();
                    info.name = names[global - 1].clone();
                    info.location = Some(node.location.clone());
                    info.dataset = Some(node.dataset.clone());
                    columns[global - 1] = info;
                    resolved[global - 1] = true;
                }
            }
        }
        columns
    }
}

/// Null-preserving merge of a node-local row into a logical row: non-null
/// values overwrite, nulls never erase what another node supplied.
fn merge_local(row: &mut Row, local: &[Value], mapping: &PosMapping) {
    for (local_col, global_col) in mapping.iter() {
        if global_col == 0 || global_col > row.values.len() {
            continue;
        }
        let value = local.get(local_col - 1).cloned().unwrap_or(Value::Null);
        if !value.is_null() {
            row.values[global_col - 1] = value;
        }
    }
}

/// Extracts a node's exported tuple from one of its local rows.
fn export_tuple(local: &[Value], mapping: &PosMapping) -> Vec<Value> {
    let mut tuple = vec![Value::Null; mapping.remote_width()];
    for (local_col, pos) in mapping.iter() {
        if pos == 0 || pos > tuple.len() {
            continue;
        }
        tuple[pos - 1] = local.get(local_col - 1).cloned().unwrap_or(Value::Null);
    }
    tuple
}
