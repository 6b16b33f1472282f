//! Text backend adapter
//!
//! Sends a filter request to an HTTP endpoint and streams the response
//! back as tab-delimited rows, one row per line. Placeholders in the
//! request template are substituted textually before submission, so the
//! request is rebuilt from scratch on every execution.

use std::collections::BTreeMap;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;
use url::Url;

use crate::catalog::{BackendLocation, Catalog};
use crate::error::{EngineError, EngineResult};
use crate::types::Value;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Incremental line reader over a chunked response body. Lines are
/// `\n`-terminated; a trailing unterminated line still counts.
struct LineStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    done: bool,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            done: false,
        }
    }

    async fn next_line(&mut self) -> EngineResult<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.done {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                return Ok(Some(line));
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    return Err(EngineError::malformed_response(err.to_string()))
                }
                None => self.done = true,
            }
        }
    }
}

pub(crate) struct TextNode {
    template: String,
    client: reqwest::Client,
    endpoint: Option<Url>,
    params: BTreeMap<usize, String>,
    max_rows: u64,
    rows_returned: u64,
    executed: bool,
    stream: Option<LineStream>,
    pending: Option<Vec<Value>>,
}

impl TextNode {
    pub(crate) fn new(template: String) -> Self {
        Self {
            template,
            client: reqwest::Client::new(),
            endpoint: None,
            params: BTreeMap::new(),
            max_rows: 0,
            rows_returned: 0,
            executed: false,
            stream: None,
            pending: None,
        }
    }

    pub(crate) fn open(&mut self, catalog: &Catalog, location: &str) -> EngineResult<()> {
        if self.endpoint.is_some() {
            return Ok(());
        }
        match catalog.get(location) {
            Some(BackendLocation::Text { endpoint }) => {
                self.endpoint = Some(endpoint.clone());
                Ok(())
            }
            Some(BackendLocation::Relational { .. }) => {
                Err(EngineError::kind_mismatch(location, "text"))
            }
            None => Err(EngineError::location_not_found(location)),
        }
    }

    pub(crate) fn set_max_rows(&mut self, rows: u64) {
        self.max_rows = rows;
    }

    pub(crate) fn set_parameter(&mut self, local: usize, text: String) {
        self.params.insert(local, text);
    }

    pub(crate) async fn has_next_row(&mut self) -> EngineResult<bool> {
        if !self.executed {
            self.execute().await?;
        }
        if self.max_rows != 0 && self.rows_returned >= self.max_rows {
            return Ok(false);
        }
        if self.pending.is_none() {
            self.pending = self.fetch_row().await?;
        }
        Ok(self.pending.is_some())
    }

    pub(crate) async fn next_row(&mut self) -> EngineResult<Vec<Value>> {
        if !self.has_next_row().await? {
            return Ok(Vec::new());
        }
        match self.pending.take() {
            Some(row) => {
                self.rows_returned += 1;
                Ok(row)
            }
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn reset_execution(&mut self) {
        self.executed = false;
        self.stream = None;
        self.pending = None;
        self.rows_returned = 0;
    }

    pub(crate) fn close(&mut self) -> EngineResult<()> {
        self.stream = None;
        self.pending = None;
        self.endpoint.take();
        Ok(())
    }

    async fn execute(&mut self) -> EngineResult<()> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| EngineError::closed("subquery"))?;
        let body = self.render_request()?;
        debug!(endpoint = %endpoint, "submitting text subquery");
        let response = self
            .client
            .post(endpoint.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::execution_error(format!(
                "endpoint returned status {}",
                response.status()
            )));
        }
        self.stream = Some(LineStream::new(Box::pin(response.bytes_stream())));
        self.pending = None;
        self.executed = true;
        self.rows_returned = 0;
        Ok(())
    }

    /// Substitutes each `?` placeholder in the request template with the
    /// bound parameter texts in ascending slot order.
    fn render_request(&self) -> EngineResult<String> {
        let mut out = String::with_capacity(self.template.len());
        let mut values = self.params.values();
        let mut slot = 0usize;
        for ch in self.template.chars() {
            if ch == '?' {
                slot += 1;
                let text = values
                    .next()
                    .ok_or(EngineError::ParamMissing { index: slot })?;
                out.push_str(text);
            } else {
                out.push(ch);
            }
        }
        Ok(out)
    }

    async fn fetch_row(&mut self) -> EngineResult<Option<Vec<Value>>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::closed("subquery"))?;
        loop {
            match stream.next_line().await? {
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    let row = line
                        .split('\t')
                        .map(|cell| {
                            if cell.is_empty() {
                                Value::Null
                            } else {
                                Value::Text(cell.to_owned())
                            }
                        })
                        .collect();
                    return Ok(Some(row));
                }
                None => return Ok(None),
            }
        }
    }
}
