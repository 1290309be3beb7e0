//! Declarative configuration: databases, exposed tables, scripts and tokens.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{GateError, GateResult};

pub const DEFAULT_PRIMARY_KEY: &str = "ID";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
    #[serde(default)]
    pub scripts: HashMap<String, ScriptConfig>,
    /// Static token → grants table.
    #[serde(default)]
    pub tokens: HashMap<String, Vec<AccessGrant>>,
    #[serde(default)]
    pub managed_tokens: Option<ManagedTokens>,
    #[serde(default)]
    pub cache_tokens: bool,
    /// Page size used when neither the request nor the table sets one.
    #[serde(default)]
    pub default_page_size: u64,
}

impl GateConfig {
    pub fn from_slice(bytes: &[u8]) -> GateResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| GateError::Config(format!("invalid configuration: {err}")))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub http_addr: Option<String>,
    #[serde(default)]
    pub cors: bool,
    /// Extra headers attached to every response.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Engine kind (`sqlite`, `pgx`, `mysql`, ...). Accepts `env:NAME`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Connection locator. Accepts `env:NAME`.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableConfig {
    /// Owning database id; empty means shared across all databases.
    #[serde(default)]
    pub database: String,
    /// Physical table name; defaults to the table id.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Columns returned by list queries; empty means all.
    #[serde(default)]
    pub exported_columns: Vec<String>,
    #[serde(default)]
    pub public_read: bool,
    #[serde(default)]
    pub public_write: bool,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default)]
    pub order_by: String,
    #[serde(default)]
    pub show_total: bool,
}

fn default_primary_key() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub sql: String,
    /// File holding the script body; wins over `sql` when set.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub public_exec: bool,
}

/// Authorizes a token for operations on objects of one database (or `*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub target_database: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub target_objects: Vec<String>,
    /// Host patterns the request origin or referer must match. Empty allows any.
    #[serde(default, deserialize_with = "string_or_list")]
    pub allowed_origins: Vec<String>,
    #[serde(default, rename = "read_private")]
    pub read: bool,
    #[serde(default, rename = "write_private")]
    pub write: bool,
    #[serde(default, rename = "exec_private")]
    pub exec: bool,
}

/// Accepts either a JSON array or a space-delimited string.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(raw) => split_fields(&raw),
        StringOrList::Many(items) => items,
    })
}

pub(crate) fn split_fields(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Grants sourced from a table in one of the configured databases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagedTokens {
    pub database: String,
    #[serde(default)]
    pub table_name: String,
    /// Explicit grant query using `?token?`; replaces the built-in template.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub query_path: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub target_database: String,
    #[serde(default)]
    pub target_objects: String,
    #[serde(default)]
    pub allowed_origins: String,
    #[serde(default)]
    pub read_private: String,
    #[serde(default)]
    pub write_private: String,
    #[serde(default)]
    pub exec_private: String,
}
