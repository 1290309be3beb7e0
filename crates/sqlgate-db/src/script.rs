//! Script descriptors and their lazily compiled statement lists.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::Mutex;
use tracing::debug;

use crate::compiler::{self, Statement};
use crate::config::ScriptConfig;
use crate::dialect::Dialect;
use crate::error::{GateError, GateResult};

#[derive(Debug)]
pub struct Script {
    id: String,
    database: String,
    sql: String,
    path: Option<PathBuf>,
    public_exec: bool,
    compiled: Mutex<Option<CompiledScript>>,
}

#[derive(Debug)]
struct CompiledScript {
    dialect: Dialect,
    statements: Arc<[Statement]>,
}

impl Script {
    pub fn new(id: impl Into<String>, config: &ScriptConfig) -> Self {
        let path = config.path.trim();
        Self {
            id: id.into(),
            database: config.database.trim().to_string(),
            sql: config.sql.trim().to_string(),
            path: (!path.is_empty()).then(|| PathBuf::from(path)),
            public_exec: config.public_exec,
            compiled: Mutex::new(None),
        }
    }

    pub fn public_exec(&self) -> bool {
        self.public_exec
    }

    /// A script that names an owning database is invisible to every other one.
    pub fn visible_in(&self, database: &str) -> bool {
        self.database.is_empty() || self.database == database
    }

    pub async fn is_compiled(&self) -> bool {
        self.compiled.lock().await.is_some()
    }

    /// Returns the compiled statements for `dialect`, compiling on first use
    /// or when `recompile` is set. The lock covers the whole
    /// check-compile-store sequence, and a failed attempt leaves nothing cached.
    pub async fn statements(&self, dialect: Dialect, recompile: bool) -> GateResult<Arc<[Statement]>> {
        let mut compiled = self.compiled.lock().await;
        if !recompile {
            if let Some(cached) = compiled.as_ref().filter(|cached| cached.dialect == dialect) {
                return Ok(cached.statements.clone());
            }
        }
        *compiled = None;

        let source = self.source().await?;
        let statements: Arc<[Statement]> = compiler::compile(&self.id, &source, dialect)
            .map_err(|source| GateError::Compile {
                script: self.id.clone(),
                source,
            })?
            .into();
        debug!(script = %self.id, %dialect, statements = statements.len(), "script compiled");

        *compiled = Some(CompiledScript {
            dialect,
            statements: statements.clone(),
        });
        Ok(statements)
    }

    async fn source(&self) -> GateResult<String> {
        if let Some(path) = &self.path {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|source| GateError::Io {
                    path: path.display().to_string(),
                    source,
                });
        }
        if self.sql.is_empty() {
            return Err(GateError::Config(format!("script {} is empty", self.id)));
        }
        Ok(self.sql.clone())
    }
}
