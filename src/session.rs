//! Session and statement lifecycle
//!
//! The ownership chain is data source -> session -> statement -> cursor.
//! Every owner tracks its live children and closing an owner closes the
//! whole subtree beneath it; a child that is closed directly unregisters
//! itself from its owner, so an object is only ever torn down once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::catalog::Catalog;
use crate::cursor::{DEFAULT_BATCH_SIZE, QueryCursor};
use crate::engine::QueryEngine;
use crate::error::{EngineError, EngineResult};
use crate::subquery::QueryTree;
use crate::types::{Param, SessionId, StatementId, TypeMap};

/// Entry point of the resource hierarchy. Holds the backend catalog and
/// the set of sessions opened through it.
pub struct DataSource {
    catalog: Arc<Catalog>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    closed: AtomicBool,
}

impl DataSource {
    pub fn new(catalog: Catalog) -> Arc<Self> {
        Arc::new(Self {
            catalog: Arc::new(catalog),
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn open_session(self: &Arc<Self>) -> EngineResult<Arc<Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::closed("data source"));
        }
        let session = Arc::new(Session {
            id: SessionId::new(),
            catalog: Arc::clone(&self.catalog),
            parent: Arc::downgrade(self),
            statements: Mutex::new(HashMap::new()),
            type_map: Mutex::new(TypeMap::new()),
            closed: AtomicBool::new(false),
        });
        debug!(session_id = %session.id.0, "session opened");
        self.sessions
            .lock()
            .await
            .insert(session.id, Arc::clone(&session));
        Ok(session)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Closes every live session and refuses further opens. Idempotent.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close_inner(false).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn forget_session(&self, id: SessionId) {
        self.sessions.lock().await.remove(&id);
    }
}

/// One logical connection to the federated system. Tracks the statements
/// created through it.
pub struct Session {
    id: SessionId,
    catalog: Arc<Catalog>,
    parent: Weak<DataSource>,
    statements: Mutex<HashMap<StatementId, Arc<Statement>>>,
    type_map: Mutex<TypeMap>,
    closed: AtomicBool,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Sets the session-wide type map. Statements prepared afterwards
    /// inherit it as their default; existing statements are unaffected.
    pub async fn set_type_map(&self, map: TypeMap) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::closed("session"));
        }
        *self.type_map.lock().await = map;
        Ok(())
    }

    /// Prepares a compiled subquery tree for execution. The tree supports
    /// exactly one execution; rebinding parameters before the first
    /// successful execution is allowed.
    pub async fn prepare(self: &Arc<Self>, tree: QueryTree) -> EngineResult<Arc<Statement>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::closed("session"));
        }
        let default_type_map = self.type_map.lock().await.clone();
        let statement = Arc::new(Statement {
            id: StatementId::new(),
            catalog: Arc::clone(&self.catalog),
            parent: Arc::downgrade(self),
            state: Mutex::new(StatementState {
                tree: Some(tree),
                params: HashMap::new(),
                type_map: default_type_map,
                max_field_size: 0,
                max_rows: 0,
                batch_size: DEFAULT_BATCH_SIZE,
                cursor: None,
            }),
            closed: AtomicBool::new(false),
        });
        self.statements
            .lock()
            .await
            .insert(statement.id, Arc::clone(&statement));
        Ok(statement)
    }

    pub async fn statement_count(&self) -> usize {
        self.statements.lock().await.len()
    }

    pub async fn close(&self) {
        self.close_inner(true).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close_inner(&self, notify_parent: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session_id = %self.id.0, "session closing");
        let statements: Vec<Arc<Statement>> = self
            .statements
            .lock()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        for statement in statements {
            statement.close_inner(false).await;
        }
        if notify_parent {
            if let Some(parent) = self.parent.upgrade() {
                parent.forget_session(self.id).await;
            }
        }
    }

    async fn forget_statement(&self, id: StatementId) {
        self.statements.lock().await.remove(&id);
    }
}

struct StatementState {
    tree: Option<QueryTree>,
    params: HashMap<usize, Param>,
    type_map: TypeMap,
    max_field_size: usize,
    max_rows: u64,
    batch_size: usize,
    cursor: Option<Arc<Mutex<QueryCursor>>>,
}

/// A prepared query plus its execution settings. Settings are snapshotted
/// when the cursor opens; changing them afterwards does not affect a
/// running cursor.
pub struct Statement {
    id: StatementId,
    catalog: Arc<Catalog>,
    parent: Weak<Session>,
    state: Mutex<StatementState>,
    closed: AtomicBool,
}

impl Statement {
    pub fn id(&self) -> StatementId {
        self.id
    }

    /// Binds one engine-level parameter slot (1-based).
    pub async fn set_param(&self, index: usize, param: Param) -> EngineResult<()> {
        let mut state = self.checked_state().await?;
        let count = match &state.tree {
            Some(tree) => tree.param_count(),
            None => return Err(EngineError::closed("statement")),
        };
        if index == 0 || index > count {
            return Err(EngineError::ParamIndexOutOfRange { index, count });
        }
        state.params.insert(index, param);
        Ok(())
    }

    pub async fn clear_params(&self) -> EngineResult<()> {
        self.checked_state().await?.params.clear();
        Ok(())
    }

    pub async fn set_type_map(&self, map: TypeMap) -> EngineResult<()> {
        self.checked_state().await?.type_map = map;
        Ok(())
    }

    /// Caps text and binary column values, 0 for unlimited.
    pub async fn set_max_field_size(&self, size: usize) -> EngineResult<()> {
        self.checked_state().await?.max_field_size = size;
        Ok(())
    }

    /// Caps the number of root rows consumed, 0 for unlimited.
    pub async fn set_max_rows(&self, rows: u64) -> EngineResult<()> {
        self.checked_state().await?.max_rows = rows;
        Ok(())
    }

    pub async fn set_batch_size(&self, size: usize) -> EngineResult<()> {
        if size == 0 {
            return Err(EngineError::InvalidBatchSize { size });
        }
        self.checked_state().await?.batch_size = size;
        Ok(())
    }

    /// Executes the prepared query and returns its cursor. At most one
    /// open cursor per statement; a failed execution (for example an
    /// unset parameter) leaves the statement reusable.
    #[instrument(skip(self), fields(statement_id = %self.id.0))]
    pub async fn open_cursor(self: &Arc<Self>) -> EngineResult<Arc<Mutex<QueryCursor>>> {
        let mut state = self.checked_state().await?;
        // A closing cursor unregisters itself, so a recorded cursor is a
        // live one.
        if state.cursor.is_some() {
            return Err(EngineError::CursorAlreadyOpen);
        }
        let tree = state
            .tree
            .take()
            .ok_or_else(|| EngineError::closed("statement"))?;

        let mut engine = QueryEngine::new(tree, Arc::clone(&self.catalog));
        engine.set_type_map(state.type_map.clone());
        engine.set_max_field_size(state.max_field_size);
        engine.set_max_rows(state.max_rows);
        for (index, param) in &state.params {
            engine.set_param(*index, param.clone())?;
        }

        // Initialize before handing the tree to the cursor so a failure
        // here can put it back for a retry.
        if let Err(err) = engine.metadata().await {
            state.tree = Some(engine.into_tree());
            return Err(err);
        }

        let cursor = Arc::new(Mutex::new(
            QueryCursor::open(engine, state.batch_size, Arc::downgrade(self)).await?,
        ));
        state.cursor = Some(Arc::clone(&cursor));
        Ok(cursor)
    }

    pub async fn close(&self) {
        self.close_inner(true).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close_inner(&self, notify_parent: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cursor = {
            let mut state = self.state.lock().await;
            state.tree = None;
            state.cursor.take()
        };
        if let Some(cursor) = cursor {
            cursor.lock().await.close_inner(false).await;
        }
        if notify_parent {
            if let Some(parent) = self.parent.upgrade() {
                parent.forget_statement(self.id).await;
            }
        }
    }

    pub(crate) async fn forget_cursor(&self) {
        self.state.lock().await.cursor = None;
    }

    async fn checked_state(&self) -> EngineResult<tokio::sync::MutexGuard<'_, StatementState>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::closed("statement"));
        }
        Ok(self.state.lock().await)
    }
}
