//! Resource hierarchy lifecycle: cascading close, idempotent teardown,
//! closed-object guards, parameter binding rules, and the one-cursor-
//! per-statement rule.

mod common;

use std::sync::Arc;

use common::{text_spec, TsvServer};
use rowloom::{
    BackendLocation, Catalog, DataSource, EngineError, Param, ParamKind, QueryEngine, TreeBuilder,
    Value,
};

fn source_for(server: &TsvServer) -> Arc<DataSource> {
    let mut catalog = Catalog::new();
    catalog.register(
        "root",
        BackendLocation::Text {
            endpoint: server.endpoint.clone(),
        },
    );
    DataSource::new(catalog)
}

fn plain_tree() -> rowloom::QueryTree {
    let mut builder = TreeBuilder::new(0, vec!["n".into()]);
    builder.root(text_spec("root", "rows", &[], &[(1, 1)], &[], &[]));
    builder.build()
}

fn parameterized_tree() -> rowloom::QueryTree {
    let mut builder = TreeBuilder::new(1, vec!["n".into()]);
    builder.root(text_spec("root", "p:?", &[(1, 1)], &[(1, 1)], &[], &[]));
    builder.build()
}

#[tokio::test]
async fn closing_a_session_closes_its_statements() {
    let server = TsvServer::start(|_| "x\n".to_string()).await;
    let source = source_for(&server);

    let session = source.open_session().await.unwrap();
    let statement = session.prepare(plain_tree()).await.unwrap();
    assert_eq!(source.session_count().await, 1);
    assert_eq!(session.statement_count().await, 1);

    session.close().await;
    assert!(session.is_closed());
    assert!(statement.is_closed());
    assert_eq!(source.session_count().await, 0);

    // Closed objects refuse further work.
    assert!(matches!(
        session.prepare(plain_tree()).await,
        Err(EngineError::Closed { .. })
    ));
    assert!(matches!(
        statement.open_cursor().await,
        Err(EngineError::Closed { .. })
    ));
}

#[tokio::test]
async fn closing_the_data_source_closes_everything() {
    let server = TsvServer::start(|_| "x\n".to_string()).await;
    let source = source_for(&server);

    let session = source.open_session().await.unwrap();
    let statement = session.prepare(plain_tree()).await.unwrap();
    let cursor = statement.open_cursor().await.unwrap();

    source.close().await;
    assert!(source.is_closed());
    assert!(session.is_closed());
    assert!(statement.is_closed());
    assert!(cursor.lock().await.is_closed());

    assert!(matches!(
        source.open_session().await,
        Err(EngineError::Closed { .. })
    ));
}

#[tokio::test]
async fn close_is_idempotent_at_every_level() {
    let server = TsvServer::start(|_| "x\n".to_string()).await;
    let source = source_for(&server);

    let session = source.open_session().await.unwrap();
    let statement = session.prepare(plain_tree()).await.unwrap();
    let cursor = statement.open_cursor().await.unwrap();

    cursor.lock().await.close().await;
    cursor.lock().await.close().await;
    statement.close().await;
    statement.close().await;
    session.close().await;
    session.close().await;
    source.close().await;
    source.close().await;
}

#[tokio::test]
async fn a_closed_engine_stays_closed() {
    let server = TsvServer::start(|_| "x\n".to_string()).await;
    let mut catalog = Catalog::new();
    catalog.register(
        "root",
        BackendLocation::Text {
            endpoint: server.endpoint.clone(),
        },
    );
    let mut engine = QueryEngine::new(plain_tree(), Arc::new(catalog));

    engine.close().await;
    assert!(engine.is_closed());
    assert!(matches!(
        engine.metadata().await,
        Err(EngineError::Closed { .. })
    ));
    assert!(matches!(
        engine.has_more_rows().await,
        Err(EngineError::Closed { .. })
    ));
    assert!(matches!(
        engine.set_param(1, Param::inferred(Value::Int(1))),
        Err(EngineError::Closed { .. })
    ));
    assert!(matches!(
        engine.clear_params(),
        Err(EngineError::Closed { .. })
    ));
    // Nothing above reopened a backend.
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn unset_parameter_fails_then_succeeds_after_binding() {
    let server = TsvServer::start(|body| {
        assert_eq!(body, "p:val");
        "ok\n".to_string()
    })
    .await;
    let source = source_for(&server);

    let session = source.open_session().await.unwrap();
    let statement = session.prepare(parameterized_tree()).await.unwrap();

    assert!(matches!(
        statement.open_cursor().await,
        Err(EngineError::ParamMissing { index: 1 })
    ));
    // No backend was touched by the failed attempt.
    assert_eq!(server.hits(), 0);

    statement
        .set_param(1, Param::new(Value::Text("val".into()), ParamKind::Text))
        .await
        .unwrap();
    let cursor = statement.open_cursor().await.unwrap();
    let mut cursor = cursor.lock().await;
    assert!(cursor.next().await.unwrap());
    assert_eq!(cursor.get_string(1).unwrap(), Some("ok".to_string()));
    cursor.close().await;
    drop(cursor);
    source.close().await;
}

#[tokio::test]
async fn every_declared_slot_must_be_bound() {
    let server = TsvServer::start(|_| "x\n".to_string()).await;
    let source = source_for(&server);
    let session = source.open_session().await.unwrap();
    // Two declared slots, only slot 1 wired into the tree.
    let mut builder = TreeBuilder::new(2, vec!["n".into()]);
    builder.root(text_spec("root", "p:?", &[(1, 1)], &[(1, 1)], &[], &[]));
    let statement = session.prepare(builder.build()).await.unwrap();

    statement
        .set_param(1, Param::new(Value::Text("a".into()), ParamKind::Text))
        .await
        .unwrap();
    assert!(matches!(
        statement.open_cursor().await,
        Err(EngineError::ParamMissing { index: 2 })
    ));
    assert_eq!(server.hits(), 0);

    statement
        .set_param(2, Param::new(Value::Text("b".into()), ParamKind::Text))
        .await
        .unwrap();
    let cursor = statement.open_cursor().await.unwrap();
    let mut cursor = cursor.lock().await;
    assert!(cursor.next().await.unwrap());
    cursor.close().await;
    drop(cursor);
    source.close().await;
}

#[tokio::test]
async fn parameter_index_bounds_are_enforced() {
    let server = TsvServer::start(|_| String::new()).await;
    let source = source_for(&server);
    let session = source.open_session().await.unwrap();
    let statement = session.prepare(parameterized_tree()).await.unwrap();

    let param = Param::inferred(Value::Int(1));
    assert!(matches!(
        statement.set_param(0, param.clone()).await,
        Err(EngineError::ParamIndexOutOfRange { index: 0, count: 1 })
    ));
    assert!(matches!(
        statement.set_param(2, param.clone()).await,
        Err(EngineError::ParamIndexOutOfRange { index: 2, count: 1 })
    ));
    statement.set_param(1, param).await.unwrap();
    source.close().await;
}

#[tokio::test]
async fn one_open_cursor_per_statement() {
    let server = TsvServer::start(|_| "x\n".to_string()).await;
    let source = source_for(&server);
    let session = source.open_session().await.unwrap();
    let statement = session.prepare(plain_tree()).await.unwrap();

    let cursor = statement.open_cursor().await.unwrap();
    assert!(matches!(
        statement.open_cursor().await,
        Err(EngineError::CursorAlreadyOpen)
    ));

    // The execution is one-shot: once the cursor is closed the statement
    // has nothing left to run.
    cursor.lock().await.close().await;
    assert!(matches!(
        statement.open_cursor().await,
        Err(EngineError::Closed { .. })
    ));
    source.close().await;
}

#[tokio::test]
async fn closing_a_cursor_unregisters_it_from_its_statement() {
    let server = TsvServer::start(|_| "x\n".to_string()).await;
    let source = source_for(&server);
    let session = source.open_session().await.unwrap();
    let statement = session.prepare(plain_tree()).await.unwrap();

    let cursor = statement.open_cursor().await.unwrap();
    cursor.lock().await.close().await;

    // The statement dropped its record of the closed cursor: the reopen
    // attempt reports the consumed execution, not a cursor still open.
    assert!(matches!(
        statement.open_cursor().await,
        Err(EngineError::Closed { .. })
    ));
    statement.close().await;
    source.close().await;
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let server = TsvServer::start(|_| String::new()).await;
    let source = source_for(&server);
    let session = source.open_session().await.unwrap();
    let statement = session.prepare(plain_tree()).await.unwrap();

    assert!(matches!(
        statement.set_batch_size(0).await,
        Err(EngineError::InvalidBatchSize { size: 0 })
    ));
    source.close().await;
}

#[tokio::test]
async fn unknown_location_fails_initialization() {
    let catalog = Catalog::new();
    let source = DataSource::new(catalog);
    let session = source.open_session().await.unwrap();
    let statement = session.prepare(plain_tree()).await.unwrap();

    assert!(matches!(
        statement.open_cursor().await,
        Err(EngineError::LocationNotFound { .. })
    ));
    source.close().await;
}
