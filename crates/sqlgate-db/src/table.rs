//! Table descriptors and execution of the built CRUD shapes.

use serde_json::{Map, Value};
use sqlx::AnyPool;
use tracing::debug;

use crate::config::{TableConfig, DEFAULT_PRIMARY_KEY};
use crate::database::{execute, fetch_rows, JsonRow, WriteSummary};
use crate::dialect::Dialect;
use crate::error::{GateError, GateResult};
use crate::query_builder::{ListDefaults, ListOptions, QueryBuilder};
use crate::value::ParamMap;

#[derive(Debug, Clone)]
pub struct Table {
    id: String,
    database: String,
    name: String,
    primary_key: String,
    exported_columns: Vec<String>,
    public_read: bool,
    public_write: bool,
    page_size: u64,
    order_by: String,
    show_total: bool,
}

impl Table {
    pub fn new(id: impl Into<String>, config: &TableConfig) -> Self {
        let id = id.into();
        let name = match config.name.trim() {
            "" => id.clone(),
            name => name.to_string(),
        };
        let primary_key = match config.primary_key.trim() {
            "" => DEFAULT_PRIMARY_KEY.to_string(),
            key => key.to_string(),
        };
        Self {
            id,
            database: config.database.trim().to_string(),
            name,
            primary_key,
            exported_columns: config.exported_columns.clone(),
            public_read: config.public_read,
            public_write: config.public_write,
            page_size: config.page_size,
            order_by: config.order_by.clone(),
            show_total: config.show_total,
        }
    }

    pub fn public_read(&self) -> bool {
        self.public_read
    }

    pub fn public_write(&self) -> bool {
        self.public_write
    }

    pub fn visible_in(&self, database: &str) -> bool {
        self.database.is_empty() || self.database == database
    }

    pub fn builder(&self, dialect: Dialect) -> QueryBuilder<'_> {
        QueryBuilder {
            dialect,
            table: &self.name,
            primary_key: &self.primary_key,
            columns: &self.exported_columns,
        }
    }

    pub fn list_options(&self, params: &ParamMap, global_page_size: u64) -> GateResult<ListOptions> {
        ListOptions::resolve(
            params,
            ListDefaults {
                page_size: self.page_size,
                order_by: &self.order_by,
                show_total: self.show_total,
                global_page_size,
            },
        )
    }

    /// Lists rows. With a total requested the result is
    /// `{total, page_size, offset, data}`, otherwise the bare row array.
    pub async fn list(
        &self,
        pool: &AnyPool,
        dialect: Dialect,
        params: &ParamMap,
        global_page_size: u64,
    ) -> GateResult<Value> {
        let options = self.list_options(params, global_page_size)?;
        let query = self.builder(dialect).list(params, &options);
        debug!(table = %self.id, sql = %query.rows.sql, "list");

        let rows = rows_to_json(fetch_rows(pool, &query.rows.sql, &query.rows.params).await?);
        let Some(count) = query.count else {
            return Ok(rows);
        };

        let counted = fetch_rows(pool, &count.sql, &count.params).await?;
        let total = counted
            .first()
            .and_then(|row| row.get("total"))
            .cloned()
            .unwrap_or(Value::from(0));

        let mut page = Map::new();
        page.insert("total".into(), total);
        page.insert("page_size".into(), Value::from(options.page_size));
        page.insert("offset".into(), Value::from(options.offset));
        page.insert("data".into(), rows);
        Ok(Value::Object(page))
    }

    pub async fn get(&self, pool: &AnyPool, dialect: Dialect, key: &str) -> GateResult<JsonRow> {
        let query = self.builder(dialect).get(key);
        fetch_rows(pool, &query.sql, &query.params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| self.row_not_found(key))
    }

    pub async fn insert(&self, pool: &AnyPool, dialect: Dialect, params: &ParamMap) -> GateResult<WriteSummary> {
        let query = self.builder(dialect).insert(params)?;
        let mut conn = pool.acquire().await?;
        let summary = execute(&mut conn, dialect, &query.sql, &query.params).await?;
        debug!(table = %self.id, rows_affected = summary.rows_affected, "insert");
        if summary.rows_affected == 0 {
            return Err(GateError::NotFound(format!("no row inserted into {}", self.id)));
        }
        Ok(summary)
    }

    pub async fn update(
        &self,
        pool: &AnyPool,
        dialect: Dialect,
        key: &str,
        params: &ParamMap,
    ) -> GateResult<WriteSummary> {
        let query = self.builder(dialect).update(key, params)?;
        let mut conn = pool.acquire().await?;
        let summary = execute(&mut conn, dialect, &query.sql, &query.params).await?;
        self.require_affected(summary, key)
    }

    pub async fn delete(&self, pool: &AnyPool, dialect: Dialect, key: &str) -> GateResult<WriteSummary> {
        let query = self.builder(dialect).delete(key);
        let mut conn = pool.acquire().await?;
        let summary = execute(&mut conn, dialect, &query.sql, &query.params).await?;
        self.require_affected(summary, key)
    }

    fn require_affected(&self, summary: WriteSummary, key: &str) -> GateResult<WriteSummary> {
        if summary.rows_affected == 0 {
            return Err(self.row_not_found(key));
        }
        Ok(summary)
    }

    fn row_not_found(&self, key: &str) -> GateError {
        GateError::NotFound(format!("row {key} not found in {}", self.id))
    }
}

fn rows_to_json(rows: Vec<JsonRow>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_and_key_defaults() {
        let table = Table::new(
            "test_table",
            &TableConfig {
                primary_key: " ".into(),
                ..TableConfig::default()
            },
        );
        assert_eq!(table.builder(Dialect::Sqlite).get("1").sql, "SELECT * FROM test_table WHERE ID=?");
        assert!(table.visible_in("anything"));
    }

    #[test]
    fn owned_tables_are_scoped() {
        let table = Table::new(
            "t",
            &TableConfig {
                database: "test_db".into(),
                name: "TEST_TABLE".into(),
                ..TableConfig::default()
            },
        );
        assert!(table.visible_in("test_db"));
        assert!(!table.visible_in("other"));
    }

    #[test]
    fn table_defaults_feed_list_options() {
        let table = Table::new(
            "t",
            &TableConfig {
                page_size: 25,
                order_by: "NAME".into(),
                show_total: true,
                ..TableConfig::default()
            },
        );
        let options = table.list_options(&ParamMap::new(), 100).unwrap();
        assert_eq!(options.page_size, 25);
        assert_eq!(options.order_by.as_deref(), Some("NAME"));
        assert!(options.show_total);
    }
}
