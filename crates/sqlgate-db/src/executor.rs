//! Transactional execution of compiled scripts.

use std::collections::HashMap;

use serde_json::{Map, Value};
use sqlx::AnyPool;
use tracing::{debug, instrument, warn};

use crate::compiler::{sql_safe, Statement};
use crate::database::{execute, fetch_rows};
use crate::dialect::Dialect;
use crate::error::{GateError, GateResult};
use crate::value::{ParamMap, ParamValue};

/// Request facts available to `!key!` substitution.
///
/// Recognised keys are `host`, `remote_addr`, `method`, `path`, `query`,
/// `user_agent` and `referer`; any other key is looked up as a header.
pub trait RequestMetadata: Send + Sync {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Owned snapshot of the request facts.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub host: String,
    pub remote_addr: String,
    pub method: String,
    pub path: String,
    pub query: String,
    /// Header values keyed by lower-cased name.
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl RequestMetadata for RequestContext {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "host" => Some(self.host.clone()),
            "remote_addr" => Some(self.remote_addr.clone()),
            "method" => Some(self.method.clone()),
            "path" => Some(self.path.clone()),
            "query" => Some(self.query.clone()),
            "user_agent" => self.header("user-agent").map(str::to_string),
            "referer" => self.header("referer").map(str::to_string),
            other => self.header(other).map(str::to_string),
        }
    }
}

/// Script response, shaped by the number of exported labels.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutput {
    Empty,
    Single(Value),
    Labeled(Map<String, Value>),
}

impl ScriptOutput {
    fn from_exports(exports: Map<String, Value>) -> Self {
        match exports.len() {
            0 => ScriptOutput::Empty,
            1 => match exports.into_iter().next() {
                Some((_, value)) => ScriptOutput::Single(value),
                None => ScriptOutput::Empty,
            },
            _ => ScriptOutput::Labeled(exports),
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            ScriptOutput::Empty => None,
            ScriptOutput::Single(value) => Some(value),
            ScriptOutput::Labeled(map) => Some(Value::Object(map)),
        }
    }
}

/// Runs `statements` inside one transaction. Any failure rolls the whole
/// transaction back; nothing is committed unless every statement succeeds.
#[instrument(skip_all, fields(script = statements.first().map(|s| s.script.as_str()).unwrap_or_default()))]
pub async fn run_script(
    pool: &AnyPool,
    dialect: Dialect,
    statements: &[Statement],
    params: &ParamMap,
    metadata: &dyn RequestMetadata,
) -> GateResult<ScriptOutput> {
    let mut tx = pool.begin().await?;
    let mut exports = Map::new();

    for statement in statements {
        let outcome = match bind_values(statement, params) {
            Ok(values) => {
                let sql = substitute_metadata(&statement.sql, metadata);
                run_statement(&mut tx, dialect, statement, &sql, &values).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(output) => {
                debug!(index = statement.index, label = %statement.label, "statement executed");
                if statement.is_exported {
                    exports.insert(statement.label.clone(), output);
                }
            }
            Err(err) => {
                warn!(index = statement.index, label = %statement.label, error = %err, "rolling back script");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        }
    }

    tx.commit().await?;
    Ok(ScriptOutput::from_exports(exports))
}

async fn run_statement(
    tx: &mut sqlx::Transaction<'static, sqlx::Any>,
    dialect: Dialect,
    statement: &Statement,
    sql: &str,
    values: &[ParamValue],
) -> GateResult<Value> {
    if statement.is_query {
        let rows = fetch_rows(&mut **tx, sql, values).await?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    } else {
        Ok(execute(&mut **tx, dialect, sql, values).await?.to_json())
    }
}

/// Resolves the statement's named parameters, in order.
pub fn bind_values(statement: &Statement, params: &ParamMap) -> GateResult<Vec<ParamValue>> {
    statement
        .params
        .iter()
        .map(|name| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| GateError::MissingParameter(name.clone()))
        })
        .collect()
}

fn is_metadata_key_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

/// Splices `!key!` tokens as escaped, quoted literals. Keys are limited to
/// `[A-Za-z0-9_.-]` so operators such as `!=` are left alone.
pub fn substitute_metadata(sql: &str, metadata: &dyn RequestMetadata) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(start) = rest.find('!') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let key_len = after
            .find(|ch: char| !is_metadata_key_char(ch))
            .unwrap_or(after.len());
        if key_len > 0 && after[key_len..].starts_with('!') {
            let value = metadata.lookup(&after[..key_len]).unwrap_or_default();
            out.push('\'');
            out.push_str(&sql_safe(&value));
            out.push('\'');
            rest = &after[key_len + 1..];
        } else {
            out.push('!');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}
