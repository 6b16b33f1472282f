//! rowloom - federated query engine
//!
//! Executes one logical query against a tree of heterogeneous
//! sub-sources and reassembles the partial results into a single flat
//! result. Relational sub-sources run parameterized SQL through sqlx;
//! text sub-sources stream tab-delimited rows over HTTP. Rows from
//! child subqueries join back onto their parent rows by correlated
//! fan-out, with child executions memoized per distinct correlation.
//!
//! The public surface follows a session model: a [`session::DataSource`]
//! opens [`session::Session`]s, a session prepares compiled query trees
//! into [`session::Statement`]s, and executing a statement yields a
//! forward-only [`cursor::QueryCursor`]. Closing any owner closes
//! everything beneath it.

pub mod catalog;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod session;
pub mod subquery;
pub mod types;

pub use catalog::{BackendLocation, Catalog, SqlFlavor};
pub use cursor::{DEFAULT_BATCH_SIZE, QueryCursor};
pub use engine::QueryEngine;
pub use error::{EngineError, EngineResult};
pub use session::{DataSource, Session, Statement};
pub use subquery::{BackendKind, NodeId, NodeSpec, QueryTree, TreeBuilder};
pub use types::{
    ColumnInfo, CursorId, Param, ParamHint, ParamKind, PosMapping, Row, SessionId, StatementId,
    TargetKind, TypeMap, Value,
};
