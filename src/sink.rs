//! Warehouse write path.
//!
//! A [`Sink`] accepts flat JSON rows per table and reports per-row
//! failures instead of failing the whole call, mirroring a streaming
//! insert API. [`insert_with_fallback`] adds the one recovery the pipeline
//! relies on: when rows carry fields the table does not know yet, drop
//! those fields and retry once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePool;
use sqlx::Row as _;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};

/// One flat row: column name → value.
pub type Row = Map<String, Value>;

/// Marker substring identifying unknown-column errors.
pub const NO_SUCH_FIELD: &str = "no such field";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub index: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl RowError {
    pub fn no_such_field(index: usize, field: &str) -> Self {
        Self {
            index,
            message: format!("{}: {}", NO_SUCH_FIELD, field),
            location: Some(field.to_string()),
        }
    }

    /// The unknown column this error names, if it is that kind of error.
    pub fn unknown_field(&self) -> Option<&str> {
        let location = self.location.as_deref().filter(|l| !l.is_empty())?;
        self.message
            .to_ascii_lowercase()
            .contains(NO_SUCH_FIELD)
            .then_some(location)
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Insert `rows` into `table`. An empty vec means every row landed;
    /// otherwise nothing was written.
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> PipelineResult<Vec<RowError>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InsertReport {
    pub table: String,
    pub inserted: usize,
    pub errors: Vec<RowError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallback_dropped_fields: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub first_errors: Vec<RowError>,
}

impl InsertReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert a failed report into [`PipelineError::SinkWrite`].
    pub fn into_result(self) -> PipelineResult<Self> {
        if self.is_ok() {
            return Ok(self);
        }
        let errors = self
            .errors
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();
        Err(PipelineError::SinkWrite {
            table: self.table,
            errors,
        })
    }
}

/// Insert, and on unknown-field errors retry once without those fields.
///
/// With `allow_drop_fields = false` the first set of errors is returned
/// as-is.
pub async fn insert_with_fallback(
    sink: &dyn Sink,
    table: &str,
    rows: Vec<Row>,
    allow_drop_fields: bool,
) -> PipelineResult<InsertReport> {
    let mut report = InsertReport {
        table: table.to_string(),
        ..InsertReport::default()
    };
    if rows.is_empty() {
        return Ok(report);
    }

    let errors = sink.insert_rows(table, &rows).await?;
    if errors.is_empty() {
        report.inserted = rows.len();
        info!(table, inserted = report.inserted, "sink insert");
        return Ok(report);
    }

    let unknown: BTreeSet<String> = errors
        .iter()
        .filter_map(RowError::unknown_field)
        .map(str::to_string)
        .collect();
    if !allow_drop_fields || unknown.is_empty() {
        warn!(table, errors = errors.len(), "sink insert rejected");
        report.errors = errors;
        return Ok(report);
    }

    warn!(table, dropped = ?unknown, "retrying insert without unknown fields");
    let trimmed: Vec<Row> = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .filter(|(k, _)| !unknown.contains(k))
                .collect()
        })
        .collect();
    let retry_errors = sink.insert_rows(table, &trimmed).await?;

    report.inserted = if retry_errors.is_empty() {
        trimmed.len()
    } else {
        0
    };
    report.errors = retry_errors;
    report.fallback_dropped_fields = unknown.into_iter().collect();
    report.first_errors = errors.into_iter().take(3).collect();
    Ok(report)
}

fn validate_identifier(name: &str) -> PipelineResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PipelineError::Storage(format!(
            "invalid table name: '{}'",
            name
        )));
    }
    Ok(())
}

/// SQLite-backed sink. Tables must already exist (see [`crate::migrate`]).
#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn columns(&self, table: &str) -> PipelineResult<BTreeSet<String>> {
        let rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        rows.iter()
            .map(|r| {
                r.try_get::<String, _>("name")
                    .map_err(|e| PipelineError::Storage(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl Sink for SqliteSink {
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> PipelineResult<Vec<RowError>> {
        validate_identifier(table)?;
        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Err(PipelineError::Storage(format!("no such table: {}", table)));
        }

        let known = &columns;
        let errors: Vec<RowError> = rows
            .iter()
            .enumerate()
            .flat_map(|(i, row)| {
                row.keys()
                    .filter(move |k| !known.contains(*k))
                    .map(move |k| RowError::no_such_field(i, k))
            })
            .collect();
        if !errors.is_empty() {
            return Ok(errors);
        }

        let storage = |e: sqlx::Error| PipelineError::Storage(e.to_string());
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for row in rows {
            let names: Vec<&str> = row.keys().map(String::as_str).collect();
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                table,
                names
                    .iter()
                    .map(|n| format!("\"{}\"", n))
                    .collect::<Vec<_>>()
                    .join(", "),
                vec!["?"; names.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for value in row.values() {
                query = match value {
                    Value::Null => query.bind(None::<String>),
                    Value::Bool(b) => query.bind(*b),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => query.bind(i),
                        None => query.bind(n.as_f64().unwrap_or_default()),
                    },
                    Value::String(s) => query.bind(s.clone()),
                    other => query.bind(other.to_string()),
                };
            }
            query.execute(&mut *tx).await.map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(Vec::new())
    }
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: RwLock<BTreeMap<String, Vec<Row>>>,
    rejected_fields: RwLock<BTreeMap<String, BTreeSet<String>>>,
    failing_tables: RwLock<BTreeMap<String, String>>,
    calls: RwLock<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `field` as unknown for every row inserted into `table`.
    pub fn reject_field(&self, table: &str, field: &str) {
        self.rejected_fields
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .insert(field.to_string());
    }

    /// Fail every row inserted into `table` with `message`.
    pub fn fail_table(&self, table: &str, message: &str) {
        self.failing_tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string(), message.to_string());
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Table names in call order, one entry per `insert_rows` call.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> PipelineResult<Vec<RowError>> {
        self.calls
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(table.to_string());

        if let Some(message) = self
            .failing_tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
        {
            return Ok((0..rows.len())
                .map(|index| RowError {
                    index,
                    message: message.clone(),
                    location: None,
                })
                .collect());
        }

        let rejected = self
            .rejected_fields
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned()
            .unwrap_or_default();
        let errors: Vec<RowError> = rows
            .iter()
            .enumerate()
            .flat_map(|(i, row)| {
                row.keys()
                    .filter(|k| rejected.contains(*k))
                    .map(move |k| RowError::no_such_field(i, k))
                    .collect::<Vec<_>>()
            })
            .collect();
        if !errors.is_empty() {
            return Ok(errors);
        }

        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(Vec::new())
    }
}
