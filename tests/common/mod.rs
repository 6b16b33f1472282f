//! Shared test fixtures: a tab-delimited-over-HTTP test server and
//! helpers for building subquery trees and seeding SQLite files.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use rowloom::{BackendKind, NodeSpec, PosMapping};

static TRACING: Once = Once::new();

/// Installs a fmt subscriber honoring RUST_LOG, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Minimal HTTP server that answers each POST with a tab-delimited body
/// computed from the request body. Counts requests so tests can assert
/// how many times a subquery actually executed.
pub struct TsvServer {
    pub endpoint: Url,
    hits: Arc<AtomicUsize>,
}

impl TsvServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let server_hits = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let hits = Arc::clone(&server_hits);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let Some(request_body) = read_request(&mut stream).await else {
                        return;
                    };
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = handler(&request_body);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            endpoint: Url::parse(&format!("http://{addr}/")).unwrap(),
            hits,
        }
    }

    /// Number of requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(String::from_utf8_lossy(&buf[body_start..]).into_owned())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub fn mapping(pairs: &[(usize, usize)]) -> PosMapping {
    PosMapping::from_pairs(pairs.iter().copied())
}

/// Builds a text node spec with the given request template and mappings.
pub fn text_spec(
    location: &str,
    request: &str,
    parameter: &[(usize, usize)],
    result: &[(usize, usize)],
    importable: &[(usize, usize)],
    exportable: &[(usize, usize)],
) -> NodeSpec {
    NodeSpec {
        location: location.to_string(),
        dataset: "test".to_string(),
        kind: BackendKind::Text,
        request: request.to_string(),
        parameter_mapping: mapping(parameter),
        result_mapping: mapping(result),
        importable_mapping: mapping(importable),
        exportable_mapping: mapping(exportable),
        columns: Vec::new(),
    }
}

/// Builds a relational node spec with the given SQL and mappings.
pub fn sql_spec(
    location: &str,
    sql: &str,
    parameter: &[(usize, usize)],
    result: &[(usize, usize)],
    importable: &[(usize, usize)],
    exportable: &[(usize, usize)],
) -> NodeSpec {
    NodeSpec {
        location: location.to_string(),
        dataset: "test".to_string(),
        kind: BackendKind::Relational,
        request: sql.to_string(),
        parameter_mapping: mapping(parameter),
        result_mapping: mapping(result),
        importable_mapping: mapping(importable),
        exportable_mapping: mapping(exportable),
        columns: Vec::new(),
    }
}

/// Creates an on-disk SQLite database and runs the given statements
/// against it. Returns the tempfile guard and the sqlite URL.
pub async fn seed_sqlite(statements: &[&str]) -> (tempfile::NamedTempFile, String) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}", file.path().display());
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .unwrap();
    for statement in statements {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    pool.close().await;
    (file, url)
}
