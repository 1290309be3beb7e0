//! Placeholder and pagination syntax per SQL engine.

use std::fmt;

/// SQL engine family a database descriptor resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
    SqlServer,
    Oracle,
    /// Any kind we do not recognise. Uses `?` placeholders and has no
    /// pagination clause.
    Unknown,
}

impl Dialect {
    /// Resolves a configured database kind (`pgx`, `sqlite3`, ...) to a dialect.
    pub fn from_kind(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "pgx" | "postgres" | "postgresql" => Dialect::Postgres,
            "mysql" | "mariadb" => Dialect::MySql,
            "sqlite" | "sqlite3" => Dialect::Sqlite,
            "sqlserver" | "mssql" => Dialect::SqlServer,
            "oracle" => Dialect::Oracle,
            _ => Dialect::Unknown,
        }
    }

    /// Positional placeholder for the 0-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index + 1),
            Dialect::SqlServer => format!("@p{}", index + 1),
            Dialect::Oracle => format!(":{}", index + 1),
            Dialect::MySql | Dialect::Sqlite | Dialect::Unknown => "?".to_string(),
        }
    }

    /// Pagination clause, or an empty string when the dialect has none.
    pub fn pagination_clause(self, limit: u64, offset: u64) -> String {
        match self {
            Dialect::Postgres | Dialect::MySql | Dialect::Sqlite => {
                format!("LIMIT {limit} OFFSET {offset}")
            }
            Dialect::SqlServer | Dialect::Oracle => {
                format!("OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY")
            }
            Dialect::Unknown => String::new(),
        }
    }

    /// SQL Server rejects `OFFSET ... FETCH` without an `ORDER BY`.
    pub fn requires_explicit_order_when_paginating(self) -> bool {
        matches!(self, Dialect::SqlServer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
            Dialect::SqlServer => "sqlserver",
            Dialect::Oracle => "oracle",
            Dialect::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
