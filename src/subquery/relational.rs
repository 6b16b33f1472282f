//! Relational backend adapter
//!
//! Executes one compiled SQL request against a Postgres, MySQL or SQLite
//! location through sqlx. Parameters bind natively; result rows buffer on
//! execution and iterate forward-only, honoring the session-wide type map
//! and max-field-size settings at extraction time.

use std::collections::{BTreeMap, VecDeque};

use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo};
use tracing::debug;

use crate::catalog::{BackendLocation, Catalog, SqlFlavor};
use crate::error::{EngineError, EngineResult};
use crate::types::{Param, TypeMap, Value};

enum SqlPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

pub(crate) struct RelationalNode {
    sql: String,
    pool: Option<SqlPool>,
    params: BTreeMap<usize, Param>,
    type_map: TypeMap,
    max_field_size: usize,
    max_rows: u64,
    rows: VecDeque<Vec<Value>>,
    executed: bool,
    rows_returned: u64,
}

impl RelationalNode {
    pub(crate) fn new(sql: String) -> Self {
        Self {
            sql,
            pool: None,
            params: BTreeMap::new(),
            type_map: TypeMap::new(),
            max_field_size: 0,
            max_rows: 0,
            rows: VecDeque::new(),
            executed: false,
            rows_returned: 0,
        }
    }

    pub(crate) async fn open(&mut self, catalog: &Catalog, location: &str) -> EngineResult<()> {
        if self.pool.is_some() {
            return Ok(());
        }
        let (url, flavor) = match catalog.get(location) {
            Some(BackendLocation::Relational { url, flavor }) => (url.clone(), *flavor),
            Some(BackendLocation::Text { .. }) => {
                return Err(EngineError::kind_mismatch(location, "relational"))
            }
            None => return Err(EngineError::location_not_found(location)),
        };
        debug!(location, flavor = ?flavor, "opening relational subquery");
        let pool = match flavor {
            SqlFlavor::Postgres => SqlPool::Postgres(
                PgPoolOptions::new()
                    .max_connections(2)
                    .connect(&url)
                    .await
                    .map_err(|e| EngineError::connection_failed(e.to_string()))?,
            ),
            SqlFlavor::MySql => SqlPool::MySql(
                MySqlPoolOptions::new()
                    .max_connections(2)
                    .connect(&url)
                    .await
                    .map_err(|e| EngineError::connection_failed(e.to_string()))?,
            ),
            SqlFlavor::Sqlite => SqlPool::Sqlite(
                SqlitePoolOptions::new()
                    .max_connections(2)
                    .connect(&url)
                    .await
                    .map_err(|e| EngineError::connection_failed(e.to_string()))?,
            ),
        };
        self.pool = Some(pool);
        Ok(())
    }

    pub(crate) fn set_max_rows(&mut self, rows: u64) {
        self.max_rows = rows;
    }

    pub(crate) fn set_type_map(&mut self, map: TypeMap) {
        self.type_map = map;
    }

    pub(crate) fn set_max_field_size(&mut self, size: usize) {
        self.max_field_size = size;
    }

    pub(crate) fn bind_param(&mut self, local: usize, param: Param) {
        self.params.insert(local, param);
    }

    pub(crate) async fn has_next_row(&mut self) -> EngineResult<bool> {
        if !self.executed {
            self.execute().await?;
        }
        Ok(!self.rows.is_empty() && (self.max_rows == 0 || self.rows_returned < self.max_rows))
    }

    pub(crate) async fn next_row(&mut self) -> EngineResult<Vec<Value>> {
        if !self.has_next_row().await? {
            return Ok(Vec::new());
        }
        match self.rows.pop_front() {
            Some(row) => {
                self.rows_returned += 1;
                Ok(row)
            }
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn reset_execution(&mut self) {
        self.executed = false;
        self.rows.clear();
        self.rows_returned = 0;
    }

    pub(crate) async fn close(&mut self) -> EngineResult<()> {
        self.rows.clear();
        if let Some(pool) = self.pool.take() {
            match pool {
                SqlPool::Postgres(pool) => pool.close().await,
                SqlPool::MySql(pool) => pool.close().await,
                SqlPool::Sqlite(pool) => pool.close().await,
            }
        }
        Ok(())
    }

    async fn execute(&mut self) -> EngineResult<()> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| EngineError::closed("subquery"))?;
        let bound: Vec<Value> = self.params.values().map(Param::bind_value).collect();

        let rows = match pool {
            SqlPool::Postgres(pool) => {
                let mut query = sqlx::query(&self.sql);
                for value in &bound {
                    query = Self::bind_pg(query, value);
                }
                let pg_rows = query
                    .fetch_all(pool)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
                pg_rows.iter().map(|r| self.convert_pg(r)).collect()
            }
            SqlPool::MySql(pool) => {
                let mut query = sqlx::query(&self.sql);
                for value in &bound {
                    query = Self::bind_mysql(query, value);
                }
                let my_rows = query
                    .fetch_all(pool)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
                my_rows.iter().map(|r| self.convert_mysql(r)).collect()
            }
            SqlPool::Sqlite(pool) => {
                let mut query = sqlx::query(&self.sql);
                for value in &bound {
                    query = Self::bind_sqlite(query, value);
                }
                let lite_rows = query
                    .fetch_all(pool)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
                lite_rows.iter().map(|r| self.convert_sqlite(r)).collect()
            }
        };

        self.rows = rows;
        self.executed = true;
        self.rows_returned = 0;
        Ok(())
    }

    fn bind_pg<'q>(
        query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        value: &Value,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Decimal(d) => query.bind(*d),
            Value::Date(d) => query.bind(*d),
            Value::Time(t) => query.bind(*t),
            Value::Timestamp(ts) => query.bind(*ts),
            Value::Uuid(u) => query.bind(*u),
            Value::Text(s) => query.bind(s.clone()),
            Value::Bytes(b) => query.bind(b.clone()),
            Value::Json(j) => query.bind(j.clone()),
        }
    }

    fn bind_mysql<'q>(
        query: sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>,
        value: &Value,
    ) -> sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Decimal(d) => query.bind(*d),
            Value::Date(d) => query.bind(*d),
            Value::Time(t) => query.bind(*t),
            Value::Timestamp(ts) => query.bind(*ts),
            Value::Uuid(u) => query.bind(u.to_string()),
            Value::Text(s) => query.bind(s.clone()),
            Value::Bytes(b) => query.bind(b.clone()),
            Value::Json(j) => query.bind(j.clone()),
        }
    }

    fn bind_sqlite<'q>(
        query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        value: &Value,
    ) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Decimal(d) => query.bind(d.to_string()),
            Value::Date(d) => query.bind(*d),
            Value::Time(t) => query.bind(*t),
            Value::Timestamp(ts) => query.bind(*ts),
            Value::Uuid(u) => query.bind(u.to_string()),
            Value::Text(s) => query.bind(s.clone()),
            Value::Bytes(b) => query.bind(b.clone()),
            Value::Json(j) => query.bind(j.to_string()),
        }
    }

    fn convert_pg(&self, row: &PgRow) -> Vec<Value> {
        row.columns()
            .iter()
            .map(|col| {
                let value = Self::extract_pg(row, col.ordinal());
                let value = self.type_map.apply(col.type_info().name(), value);
                self.truncate(value)
            })
            .collect()
    }

    /// Tries decoders in order of specificity; `Option<T>` keeps NULLs
    /// from reading as decode failures.
    fn extract_pg(row: &PgRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(Value::Decimal).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
            return v.map(Value::Uuid).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(Value::Timestamp).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Timestamp(dt.and_utc()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v.map(Value::Date).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v.map(Value::Time).unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn convert_mysql(&self, row: &MySqlRow) -> Vec<Value> {
        row.columns()
            .iter()
            .map(|col| {
                let value = Self::extract_mysql(row, col.ordinal());
                let value = self.type_map.apply(col.type_info().name(), value);
                self.truncate(value)
            })
            .collect()
    }

    fn extract_mysql(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(Value::Decimal).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(Value::Timestamp).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Timestamp(dt.and_utc()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v.map(Value::Date).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v.map(Value::Time).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn convert_sqlite(&self, row: &SqliteRow) -> Vec<Value> {
        row.columns()
            .iter()
            .map(|col| {
                let value = Self::extract_sqlite(row, col.ordinal());
                let value = self.type_map.apply(col.type_info().name(), value);
                self.truncate(value)
            })
            .collect()
    }

    fn extract_sqlite(row: &SqliteRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        Value::Null
    }

    /// Applies the max-field-size cap to text and binary payloads. The cap
    /// is byte-oriented; text is cut back to the nearest char boundary so
    /// the result never exceeds the cap or splits a code point.
    fn truncate(&self, value: Value) -> Value {
        if self.max_field_size == 0 {
            return value;
        }
        match value {
            Value::Text(mut s) if s.len() > self.max_field_size => {
                let mut cut = self.max_field_size;
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                s.truncate(cut);
                Value::Text(s)
            }
            Value::Bytes(mut b) if b.len() > self.max_field_size => {
                b.truncate(self.max_field_size);
                Value::Bytes(b)
            }
            other => other,
        }
    }
}
