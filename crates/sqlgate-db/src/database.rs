//! Database descriptors and the driver glue shared by scripts and tables.
//!
//! Every configured database is reached through the sqlx `Any` driver. The
//! pool is opened on first use and lives for the rest of the process.

use std::env;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::TryStreamExt;
use serde_json::{Map, Value};
use sqlx::{
    any::{AnyArguments, AnyPoolOptions, AnyQueryResult, AnyRow},
    query::Query,
    Any, AnyConnection, AnyPool, Column as _, Executor, Row as _, TypeInfo as _, ValueRef as _,
};
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::dialect::Dialect;
use crate::value::ParamValue;

/// A result row keyed by lower-cased column name.
pub type JsonRow = Map<String, Value>;

#[derive(Debug)]
pub struct Database {
    id: String,
    url: String,
    max_connections: u32,
    dialect: Dialect,
    pool: OnceCell<AnyPool>,
}

impl Database {
    pub fn new(id: impl Into<String>, config: &DatabaseConfig) -> Self {
        Self {
            id: id.into(),
            url: config.url.clone(),
            max_connections: config.max_connections.max(1),
            dialect: Dialect::from_kind(&resolve_env(&config.kind)),
            pool: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Returns the pool, opening it on the first call.
    pub async fn pool(&self) -> Result<&AnyPool, sqlx::Error> {
        self.pool
            .get_or_try_init(|| async {
                sqlx::any::install_default_drivers();
                let url = connection_url(self.dialect, &resolve_env(&self.url));
                info!(database = %self.id, dialect = %self.dialect, "opening connection pool");
                AnyPoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect(&url)
                    .await
            })
            .await
    }
}

/// Resolves the `env:NAME` indirection used in configuration values.
pub fn resolve_env(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(name) => env::var(name).unwrap_or_default(),
        None => value.to_string(),
    }
}

fn connection_url(dialect: Dialect, url: &str) -> String {
    if dialect == Dialect::Sqlite && !url.starts_with("sqlite:") {
        let path = url.strip_prefix("file:").unwrap_or(url);
        format!("sqlite://{path}")
    } else {
        url.to_string()
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

impl WriteSummary {
    pub fn to_json(self) -> Value {
        let mut out = Map::new();
        out.insert("rows_affected".into(), Value::from(self.rows_affected));
        if let Some(id) = self.last_insert_id {
            out.insert("last_insert_id".into(), Value::from(id));
        }
        Value::Object(out)
    }
}

impl From<AnyQueryResult> for WriteSummary {
    fn from(result: AnyQueryResult) -> Self {
        Self {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        }
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &'q [ParamValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            ParamValue::Null => query.bind(Option::<String>::None),
            ParamValue::Bool(value) => query.bind(*value),
            ParamValue::Int(value) => query.bind(*value),
            ParamValue::Float(value) => query.bind(*value),
            ParamValue::Text(value) => query.bind(value.as_str()),
        };
    }
    query
}

/// Runs a row-returning statement with positional parameters.
pub async fn fetch_rows<'c, E>(
    executor: E,
    sql: &str,
    params: &[ParamValue],
) -> Result<Vec<JsonRow>, sqlx::Error>
where
    E: Executor<'c, Database = Any>,
{
    let mut rows = bind_all(sqlx::query(sql), params).fetch(executor);
    let mut out = Vec::new();
    while let Some(row) = rows.try_next().await? {
        out.push(decode_row(&row)?);
    }
    Ok(out)
}

/// Runs a write statement with positional parameters.
///
/// The SQLite driver does not report the inserted row id through `Any`, so
/// it is read back with `last_insert_rowid()` on the same connection.
pub async fn execute(
    conn: &mut AnyConnection,
    dialect: Dialect,
    sql: &str,
    params: &[ParamValue],
) -> Result<WriteSummary, sqlx::Error> {
    let result = bind_all(sqlx::query(sql), params).execute(&mut *conn).await?;
    let mut summary = WriteSummary::from(result);

    if summary.last_insert_id.is_none()
        && summary.rows_affected > 0
        && dialect == Dialect::Sqlite
        && is_insert(sql)
    {
        let id: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
            .fetch_one(&mut *conn)
            .await?;
        summary.last_insert_id = Some(id);
    }
    Ok(summary)
}

fn is_insert(sql: &str) -> bool {
    let head: String = sql
        .trim_start()
        .chars()
        .take_while(|ch| ch.is_ascii_alphabetic())
        .collect();
    head.eq_ignore_ascii_case("insert") || head.eq_ignore_ascii_case("replace")
}

fn decode_row(row: &AnyRow) -> Result<JsonRow, sqlx::Error> {
    let mut out = JsonRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_lowercase(), decode_value(row, index)?);
    }
    Ok(out)
}

fn decode_value(row: &AnyRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    let type_name = raw.type_info().name().to_ascii_uppercase();
    // SQLite reports NULL cells as the NULL type rather than a null value.
    if raw.is_null() || raw.type_info().is_null() || type_name == "NULL" {
        return Ok(Value::Null);
    }

    let typed = match type_name.as_str() {
        "BOOLEAN" | "BOOL" => row.try_get::<bool, _>(index).map(Value::from),
        "SMALLINT" | "INTEGER" | "BIGINT" | "INT" => row.try_get::<i64, _>(index).map(Value::from),
        "REAL" | "DOUBLE" | "FLOAT" => row.try_get::<f64, _>(index).map(Value::from),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| Value::String(STANDARD.encode(bytes))),
        _ => row.try_get::<String, _>(index).map(Value::String),
    };
    typed.or_else(|_| decode_untyped(row, index))
}

/// Tries each supported Rust type in turn when the reported column type
/// did not decode directly.
fn decode_untyped(row: &AnyRow, index: usize) -> Result<Value, sqlx::Error> {
    if let Ok(value) = row.try_get::<String, _>(index) {
        return Ok(Value::String(value));
    }
    if let Ok(value) = row.try_get::<i64, _>(index) {
        return Ok(Value::from(value));
    }
    if let Ok(value) = row.try_get::<i32, _>(index) {
        return Ok(Value::from(value));
    }
    if let Ok(value) = row.try_get::<f64, _>(index) {
        return Ok(Value::from(value));
    }
    if let Ok(value) = row.try_get::<bool, _>(index) {
        return Ok(Value::from(value));
    }
    row.try_get::<Vec<u8>, _>(index)
        .map(|bytes| Value::String(STANDARD.encode(bytes)))
}
