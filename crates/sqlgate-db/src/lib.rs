//! SQL-over-REST engine.
//!
//! Turns configured tables and labeled SQL scripts into callable objects:
//! tables get row-level CRUD, scripts run transactionally as one call. Every
//! call first passes [`SqlGate::authorize`], which combines object visibility
//! flags with static or database-backed token grants.

pub mod auth;
pub mod compiler;
pub mod config;
pub mod database;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod query_builder;
pub mod script;
pub mod table;
pub mod value;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

pub use auth::{extract_bearer, AccessRequest, Authorizer, GrantSource, ManagedGrants, Operation};
pub use config::{AccessGrant, GateConfig, WebConfig};
pub use database::{Database, WriteSummary};
pub use dialect::Dialect;
pub use error::{ErrorKind, GateError, GateResult};
pub use executor::{RequestContext, RequestMetadata, ScriptOutput};
pub use script::Script;
pub use table::Table;
pub use value::{merge_params, ParamMap, ParamValue};

/// First path segment that addresses the token cache instead of a database.
pub const CLEAR_TOKENS_OBJECT: &str = ".clear-tokens";

/// Row-level action on a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableAction<'a> {
    List,
    Get(&'a str),
    Insert,
    Update(&'a str),
    Delete(&'a str),
}

impl TableAction<'_> {
    pub fn operation(self) -> Operation {
        match self {
            TableAction::List | TableAction::Get(_) => Operation::Read,
            TableAction::Insert | TableAction::Update(_) | TableAction::Delete(_) => Operation::Write,
        }
    }
}

pub struct SqlGate {
    databases: HashMap<String, Arc<Database>>,
    tables: HashMap<String, Table>,
    scripts: HashMap<String, Script>,
    authorizer: Authorizer,
    default_page_size: u64,
    recompile: bool,
}

impl SqlGate {
    /// Builds the engine from configuration. With `recompile` set, scripts
    /// are recompiled on every call instead of once.
    pub async fn new(config: GateConfig, recompile: bool) -> GateResult<Self> {
        let databases: HashMap<_, _> = config
            .databases
            .iter()
            .map(|(id, db)| (id.clone(), Arc::new(Database::new(id.clone(), db))))
            .collect();

        let managed: Option<Arc<dyn GrantSource>> = match &config.managed_tokens {
            Some(managed) => {
                let database = databases.get(managed.database.trim()).cloned().ok_or_else(|| {
                    GateError::Config(format!(
                        "managed tokens database {} is not configured",
                        managed.database
                    ))
                })?;
                let source: Arc<dyn GrantSource> = Arc::new(ManagedGrants::load(managed, database).await?);
                Some(source)
            }
            None => None,
        };

        let tables = config
            .tables
            .iter()
            .map(|(id, table)| (id.clone(), Table::new(id.clone(), table)))
            .collect();
        let scripts = config
            .scripts
            .iter()
            .map(|(id, script)| (id.clone(), Script::new(id.clone(), script)))
            .collect();

        info!(
            databases = databases.len(),
            managed_tokens = managed.is_some(),
            cache_tokens = config.cache_tokens,
            "sqlgate configured"
        );

        Ok(Self {
            databases,
            tables,
            scripts,
            authorizer: Authorizer::new(config.tokens, managed, config.cache_tokens),
            default_page_size: config.default_page_size,
            recompile,
        })
    }

    pub fn database(&self, id: &str) -> GateResult<&Arc<Database>> {
        self.databases
            .get(id)
            .ok_or_else(|| GateError::NotFound(format!("database {id} not found")))
    }

    /// Whether the token cache side channel is active.
    pub fn caches_tokens(&self) -> bool {
        self.authorizer.caches_tokens()
    }

    pub fn clear_token(&self, token: &str) -> bool {
        self.authorizer.clear_token(token)
    }

    /// Object lookup and public flags first; the token is consulted only for
    /// objects that are not public for the requested operation.
    #[instrument(skip_all, fields(database = request.database, object = request.object, operation = ?request.operation))]
    pub async fn authorize(&self, request: &AccessRequest<'_>) -> GateResult<()> {
        self.database(request.database)?;

        let public = match request.operation {
            Operation::Exec => {
                let script = self
                    .scripts
                    .get(request.object)
                    .filter(|script| script.visible_in(request.database))
                    .ok_or_else(|| GateError::denied(format!("script {} not found", request.object)))?;
                script.public_exec()
            }
            operation => {
                let table = self
                    .tables
                    .get(request.object)
                    .filter(|table| table.visible_in(request.database))
                    .ok_or_else(|| GateError::denied(format!("table {} not found", request.object)))?;
                match operation {
                    Operation::Read => table.public_read(),
                    _ => table.public_write(),
                }
            }
        };
        if public {
            return Ok(());
        }
        self.authorizer.check(request).await
    }

    #[instrument(skip(self, params, metadata))]
    pub async fn execute_script(
        &self,
        database: &str,
        script: &str,
        params: &ParamMap,
        metadata: &dyn RequestMetadata,
    ) -> GateResult<ScriptOutput> {
        let db = self.database(database)?;
        let script = self
            .scripts
            .get(script)
            .filter(|s| s.visible_in(database))
            .ok_or_else(|| GateError::NotFound(format!("script {script} not found")))?;

        let statements = script.statements(db.dialect(), self.recompile).await?;
        let pool = db.pool().await?;
        executor::run_script(pool, db.dialect(), &statements, params, metadata).await
    }

    #[instrument(skip(self, params))]
    pub async fn run_table(
        &self,
        database: &str,
        table: &str,
        action: TableAction<'_>,
        params: &ParamMap,
    ) -> GateResult<Value> {
        let db = self.database(database)?;
        let table = self
            .tables
            .get(table)
            .filter(|t| t.visible_in(database))
            .ok_or_else(|| GateError::NotFound(format!("table {table} not found")))?;
        let dialect = db.dialect();
        let pool = db.pool().await?;

        Ok(match action {
            TableAction::List => table.list(pool, dialect, params, self.default_page_size).await?,
            TableAction::Get(key) => Value::Object(table.get(pool, dialect, key).await?),
            TableAction::Insert => table.insert(pool, dialect, params).await?.to_json(),
            TableAction::Update(key) => table.update(pool, dialect, key, params).await?.to_json(),
            TableAction::Delete(key) => table.delete(pool, dialect, key).await?.to_json(),
        })
    }
}
