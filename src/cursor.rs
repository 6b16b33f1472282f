//! Cursor and batch reader
//!
//! Forward-only view over an engine execution. Rows are pulled from the
//! engine in batches; because one engine call can yield several logical
//! rows, a batch may overshoot the configured size, never undershoot it
//! while rows remain. Exhaustion is detected at refill time, so the
//! caller can ask "is this the last row" without a separate look-ahead.

use std::sync::Weak;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::engine::QueryEngine;
use crate::error::{EngineError, EngineResult};
use crate::session::Statement;
use crate::types::{ColumnInfo, CursorId, Row, Value};

/// Default number of rows fetched from the engine per refill.
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub struct QueryCursor {
    id: CursorId,
    parent: Weak<Statement>,
    engine: QueryEngine,
    columns: Vec<ColumnInfo>,
    batch: Vec<Row>,
    batch_pos: usize,
    batch_size: usize,
    row_number: u64,
    before_first: bool,
    after_last: bool,
    no_more: bool,
    last_was_null: bool,
    closed: bool,
}

impl QueryCursor {
    pub fn id(&self) -> CursorId {
        self.id
    }

    /// Opens a cursor over a prepared engine. Fails fast on a zero batch
    /// size and on any initialization error (unset parameters included).
    pub(crate) async fn open(
        mut engine: QueryEngine,
        batch_size: usize,
        parent: Weak<Statement>,
    ) -> EngineResult<Self> {
        if batch_size == 0 {
            return Err(EngineError::InvalidBatchSize { size: batch_size });
        }
        let columns = engine.metadata().await?.to_vec();
        let id = CursorId::new();
        debug!(cursor_id = %id.0, batch_size, "cursor opened");
        Ok(Self {
            id,
            parent,
            engine,
            columns,
            batch: Vec::new(),
            batch_pos: 0,
            batch_size,
            row_number: 0,
            before_first: true,
            after_last: false,
            no_more: false,
            last_was_null: false,
            closed: false,
        })
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Advances to the next row. Returns false once the result is
    /// exhausted, after which the cursor sits after-last permanently.
    pub async fn next(&mut self) -> EngineResult<bool> {
        if self.closed {
            return Err(EngineError::closed("cursor"));
        }
        if self.after_last {
            return Ok(false);
        }
        self.last_was_null = false;

        if !self.before_first && self.batch_pos + 1 < self.batch.len() {
            self.batch_pos += 1;
            self.row_number += 1;
            return Ok(true);
        }

        if self.no_more {
            self.before_first = false;
            self.after_last = true;
            return Ok(false);
        }

        self.refill().await?;
        if self.batch.is_empty() {
            self.before_first = false;
            self.after_last = true;
            return Ok(false);
        }
        self.before_first = false;
        self.batch_pos = 0;
        self.row_number += 1;
        Ok(true)
    }

    /// 1-based number of the current row; 0 when not positioned on one.
    pub fn row_number(&self) -> u64 {
        if self.before_first || self.after_last {
            0
        } else {
            self.row_number
        }
    }

    pub fn is_before_first(&self) -> bool {
        !self.closed && self.before_first
    }

    pub fn is_after_last(&self) -> bool {
        !self.closed && self.after_last
    }

    pub fn is_first(&self) -> bool {
        !self.before_first && !self.after_last && self.row_number == 1
    }

    /// True when positioned on the final row of the whole result.
    pub fn is_last(&self) -> bool {
        !self.before_first
            && !self.after_last
            && self.no_more
            && self.batch_pos + 1 == self.batch.len()
    }

    /// Whether the most recently read column value was NULL.
    pub fn was_null(&self) -> bool {
        self.last_was_null
    }

    /// Resolves a column label to its 1-based index, case-insensitively.
    pub fn find_column(&self, name: &str) -> EngineResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .map(|i| i + 1)
            .ok_or_else(|| EngineError::UnknownColumn {
                name: name.to_string(),
            })
    }

    /// Reads the raw value at a 1-based column index.
    pub fn get_value(&mut self, index: usize) -> EngineResult<Value> {
        let row = self.current()?;
        if index == 0 || index > row.width() {
            return Err(EngineError::ColumnIndexOutOfRange {
                index,
                count: row.width(),
            });
        }
        let value = row.values[index - 1].clone();
        self.last_was_null = value.is_null();
        Ok(value)
    }

    pub fn get_string(&mut self, index: usize) -> EngineResult<Option<String>> {
        match self.get_value(index)? {
            Value::Null => Ok(None),
            value => Ok(Some(value.text_form())),
        }
    }

    pub fn get_i64(&mut self, index: usize) -> EngineResult<Option<i64>> {
        let value = self.get_value(index)?;
        match value {
            Value::Null => Ok(None),
            Value::Int(i) => Ok(Some(i)),
            Value::Float(f) => Ok(Some(f.trunc() as i64)),
            Value::Decimal(d) => d
                .to_i64()
                .map(Some)
                .ok_or_else(|| EngineError::conversion("DECIMAL", "BIGINT")),
            Value::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| EngineError::conversion("VARCHAR", "BIGINT")),
            other => Err(EngineError::conversion(other.kind_name(), "BIGINT")),
        }
    }

    pub fn get_f64(&mut self, index: usize) -> EngineResult<Option<f64>> {
        let value = self.get_value(index)?;
        match value {
            Value::Null => Ok(None),
            Value::Float(f) => Ok(Some(f)),
            Value::Int(i) => Ok(Some(i as f64)),
            Value::Decimal(d) => d
                .to_f64()
                .map(Some)
                .ok_or_else(|| EngineError::conversion("DECIMAL", "DOUBLE")),
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| EngineError::conversion("VARCHAR", "DOUBLE")),
            other => Err(EngineError::conversion(other.kind_name(), "DOUBLE")),
        }
    }

    pub fn get_bool(&mut self, index: usize) -> EngineResult<Option<bool>> {
        let value = self.get_value(index)?;
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(b)),
            Value::Int(i) => Ok(Some(i != 0)),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(EngineError::conversion("VARCHAR", "BOOLEAN")),
            },
            other => Err(EngineError::conversion(other.kind_name(), "BOOLEAN")),
        }
    }

    pub fn get_decimal(&mut self, index: usize) -> EngineResult<Option<Decimal>> {
        let value = self.get_value(index)?;
        match value {
            Value::Null => Ok(None),
            Value::Decimal(d) => Ok(Some(d)),
            Value::Int(i) => Ok(Some(Decimal::from(i))),
            Value::Float(f) => Decimal::from_f64_retain(f)
                .map(Some)
                .ok_or_else(|| EngineError::conversion("DOUBLE", "DECIMAL")),
            Value::Text(s) => s
                .trim()
                .parse::<Decimal>()
                .map(Some)
                .map_err(|_| EngineError::conversion("VARCHAR", "DECIMAL")),
            other => Err(EngineError::conversion(other.kind_name(), "DECIMAL")),
        }
    }

    pub fn get_bytes(&mut self, index: usize) -> EngineResult<Option<Vec<u8>>> {
        let value = self.get_value(index)?;
        match value {
            Value::Null => Ok(None),
            Value::Bytes(b) => Ok(Some(b)),
            Value::Text(s) => Ok(Some(s.into_bytes())),
            other => Err(EngineError::conversion(other.kind_name(), "VARBINARY")),
        }
    }

    /// Closes the cursor and its engine, and unregisters from the owning
    /// statement. Idempotent.
    pub async fn close(&mut self) {
        self.close_inner(true).await;
    }

    pub(crate) async fn close_inner(&mut self, notify_parent: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.batch.clear();
        self.engine.close().await;
        if notify_parent {
            if let Some(parent) = self.parent.upgrade() {
                parent.forget_cursor().await;
            }
        }
        debug!(cursor_id = %self.id.0, "cursor closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn current(&self) -> EngineResult<&Row> {
        if self.closed {
            return Err(EngineError::closed("cursor"));
        }
        if self.before_first || self.after_last {
            return Err(EngineError::CursorNotPositioned);
        }
        Ok(&self.batch[self.batch_pos])
    }

    async fn refill(&mut self) -> EngineResult<()> {
        self.batch.clear();
        self.batch_pos = 0;
        while self.batch.len() < self.batch_size {
            if !self.engine.has_more_rows().await? {
                self.no_more = true;
                debug!(rows = self.batch.len(), "final batch fetched");
                return Ok(());
            }
            let rows = self.engine.get_next_row().await?;
            self.batch.extend(rows);
        }
        // Probe ahead so the final row of an exactly-full batch still
        // reports as last.
        if !self.engine.has_more_rows().await? {
            self.no_more = true;
        }
        debug!(rows = self.batch.len(), "batch fetched");
        Ok(())
    }
}
