//! Parameterized SQL for the table endpoints.
//!
//! Identifiers are concatenated into the text after structural escaping;
//! every caller value is bound positionally.

use crate::compiler::sql_safe;
use crate::dialect::Dialect;
use crate::error::{GateError, GateResult};
use crate::value::{data_entries, ParamMap, ParamValue, OFFSET_KEY, ORDER_BY_KEY, PAGE_SIZE_KEY, SHOW_TOTAL_KEY};

/// Page size used when nothing else configures one.
pub const FALLBACK_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<ParamValue>,
}

/// Resolved paging controls for a list request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    pub page_size: u64,
    pub offset: u64,
    pub order_by: Option<String>,
    pub show_total: bool,
}

/// Table-level defaults consulted when the request leaves a control unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListDefaults<'a> {
    pub page_size: u64,
    pub order_by: &'a str,
    pub show_total: bool,
    pub global_page_size: u64,
}

impl ListOptions {
    pub fn resolve(params: &ParamMap, defaults: ListDefaults<'_>) -> GateResult<Self> {
        let requested_size = match params.get(PAGE_SIZE_KEY) {
            Some(value) => value.to_count(PAGE_SIZE_KEY)?,
            None => None,
        };
        let page_size = [requested_size.unwrap_or(0), defaults.page_size, defaults.global_page_size]
            .into_iter()
            .find(|size| *size > 0)
            .unwrap_or(FALLBACK_PAGE_SIZE);

        let offset = match params.get(OFFSET_KEY) {
            Some(value) => value.to_count(OFFSET_KEY)?.unwrap_or(0),
            None => 0,
        };

        let order_by = params
            .get(ORDER_BY_KEY)
            .and_then(ParamValue::as_text)
            .map(str::trim)
            .filter(|order| !order.is_empty())
            .or_else(|| Some(defaults.order_by.trim()).filter(|order| !order.is_empty()))
            .map(sql_safe);

        let show_total = params
            .get(SHOW_TOTAL_KEY)
            .and_then(ParamValue::to_flag)
            .unwrap_or(defaults.show_total);

        Ok(Self {
            page_size,
            offset,
            order_by,
            show_total,
        })
    }
}

/// Row query plus the optional total-count query sharing its filter.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub rows: BuiltQuery,
    pub count: Option<BuiltQuery>,
}

/// SQL builder bound to one physical table.
#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder<'a> {
    pub dialect: Dialect,
    pub table: &'a str,
    pub primary_key: &'a str,
    /// Columns returned by list queries; empty selects all.
    pub columns: &'a [String],
}

impl<'a> QueryBuilder<'a> {
    fn table_name(&self) -> String {
        sql_safe(self.table)
    }

    fn key_predicate(&self, index: usize) -> String {
        format!("{}={}", sql_safe(self.primary_key), self.dialect.placeholder(index))
    }

    pub fn list(&self, params: &ParamMap, options: &ListOptions) -> ListQuery {
        let mut predicate = String::from("1=1");
        let mut values = Vec::new();
        for (column, value) in data_entries(params) {
            predicate.push_str(&format!(
                " AND {}={}",
                sql_safe(column),
                self.dialect.placeholder(values.len())
            ));
            values.push(value.clone());
        }

        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.iter().map(|c| sql_safe(c)).collect::<Vec<_>>().join(", ")
        };

        let mut sql = format!("SELECT {columns} FROM {} WHERE {predicate}", self.table_name());
        let pagination = self.dialect.pagination_clause(options.page_size, options.offset);
        match &options.order_by {
            Some(order) => sql.push_str(&format!(" ORDER BY {order}")),
            None if !pagination.is_empty() && self.dialect.requires_explicit_order_when_paginating() => {
                sql.push_str(" ORDER BY (SELECT NULL)")
            }
            None => {}
        }
        if !pagination.is_empty() {
            sql.push(' ');
            sql.push_str(&pagination);
        }

        let count = options.show_total.then(|| BuiltQuery {
            sql: format!("SELECT COUNT(*) AS total FROM {} WHERE {predicate}", self.table_name()),
            params: values.clone(),
        });

        ListQuery {
            rows: BuiltQuery { sql, params: values },
            count,
        }
    }

    pub fn get(&self, key: &str) -> BuiltQuery {
        BuiltQuery {
            sql: format!("SELECT * FROM {} WHERE {}", self.table_name(), self.key_predicate(0)),
            params: vec![ParamValue::from(key)],
        }
    }

    pub fn insert(&self, params: &ParamMap) -> GateResult<BuiltQuery> {
        let (columns, values): (Vec<_>, Vec<_>) = data_entries(params)
            .map(|(column, value)| (sql_safe(column), value.clone()))
            .unzip();
        if columns.is_empty() {
            return Err(GateError::bad_request("nothing to insert"));
        }
        let placeholders: Vec<_> = (0..values.len()).map(|i| self.dialect.placeholder(i)).collect();
        Ok(BuiltQuery {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table_name(),
                columns.join(", "),
                placeholders.join(", ")
            ),
            params: values,
        })
    }

    pub fn update(&self, key: &str, params: &ParamMap) -> GateResult<BuiltQuery> {
        let mut assignments = Vec::new();
        let mut values = Vec::new();
        for (column, value) in data_entries(params) {
            assignments.push(format!("{}={}", sql_safe(column), self.dialect.placeholder(values.len())));
            values.push(value.clone());
        }
        if assignments.is_empty() {
            return Err(GateError::bad_request("nothing to update"));
        }
        let predicate = self.key_predicate(values.len());
        values.push(ParamValue::from(key));
        Ok(BuiltQuery {
            sql: format!(
                "UPDATE {} SET {} WHERE {predicate}",
                self.table_name(),
                assignments.join(", ")
            ),
            params: values,
        })
    }

    pub fn delete(&self, key: &str) -> BuiltQuery {
        BuiltQuery {
            sql: format!("DELETE FROM {} WHERE {}", self.table_name(), self.key_predicate(0)),
            params: vec![ParamValue::from(key)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::merge_params;

    fn builder(dialect: Dialect) -> QueryBuilder<'static> {
        QueryBuilder {
            dialect,
            table: "TEST_TABLE",
            primary_key: "ID",
            columns: &[],
        }
    }

    #[test]
    fn page_size_fallback_chain() {
        let none = ParamMap::new();
        let defaults = ListDefaults::default();
        assert_eq!(ListOptions::resolve(&none, defaults).unwrap().page_size, FALLBACK_PAGE_SIZE);

        let global = ListDefaults { global_page_size: 50, ..defaults };
        assert_eq!(ListOptions::resolve(&none, global).unwrap().page_size, 50);

        let table = ListDefaults { page_size: 20, ..global };
        assert_eq!(ListOptions::resolve(&none, table).unwrap().page_size, 20);

        let requested = merge_params(vec![(".page_size", "5")], None);
        assert_eq!(ListOptions::resolve(&requested, table).unwrap().page_size, 5);
    }

    #[test]
    fn controls_resolve_from_request_then_table() {
        let params = merge_params(vec![(".offset", "4"), (".show_total", "yes")], None);
        let options = ListOptions::resolve(
            &params,
            ListDefaults {
                order_by: "NAME DESC",
                ..ListDefaults::default()
            },
        )
        .unwrap();
        assert_eq!(options.offset, 4);
        assert!(options.show_total);
        assert_eq!(options.order_by.as_deref(), Some("NAME DESC"));

        let params = merge_params(vec![(".order_by", "ID")], None);
        let options = ListOptions::resolve(&params, ListDefaults::default()).unwrap();
        assert_eq!(options.order_by.as_deref(), Some("ID"));
        assert!(!options.show_total);
    }

    #[test]
    fn invalid_offset_is_rejected() {
        let params = merge_params(vec![(".offset", "-3")], None);
        let err = ListOptions::resolve(&params, ListDefaults::default()).unwrap_err();
        assert!(matches!(err, GateError::BadRequest(_)));
    }

    #[test]
    fn list_with_filters_and_total() {
        let params = merge_params(vec![("NAME", "Alpha"), ("KIND", "x"), (".page_size", "2")], None);
        let options = ListOptions {
            page_size: 2,
            offset: 1,
            order_by: Some("ID".into()),
            show_total: true,
        };
        let query = builder(Dialect::Postgres).list(&params, &options);
        assert_eq!(
            query.rows.sql,
            "SELECT * FROM TEST_TABLE WHERE 1=1 AND KIND=$1 AND NAME=$2 ORDER BY ID LIMIT 2 OFFSET 1"
        );
        assert_eq!(query.rows.params, vec![ParamValue::from("x"), ParamValue::from("Alpha")]);
        let count = query.count.unwrap();
        assert_eq!(count.sql, "SELECT COUNT(*) AS total FROM TEST_TABLE WHERE 1=1 AND KIND=$1 AND NAME=$2");
        assert_eq!(count.params, query.rows.params);
    }

    #[test]
    fn sqlserver_gets_a_placeholder_order() {
        let columns = vec!["ID".to_string(), "NAME".to_string()];
        let builder = QueryBuilder {
            columns: &columns,
            ..builder(Dialect::SqlServer)
        };
        let options = ListOptions {
            page_size: 10,
            offset: 0,
            order_by: None,
            show_total: false,
        };
        let query = builder.list(&ParamMap::new(), &options);
        assert_eq!(
            query.rows.sql,
            "SELECT ID, NAME FROM TEST_TABLE WHERE 1=1 ORDER BY (SELECT NULL) OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        assert!(query.count.is_none());
    }

    #[test]
    fn writes_bind_key_last() {
        let params = merge_params(vec![("NAME", "Beta"), (".offset", "1")], None);
        let update = builder(Dialect::Oracle).update("7", &params).unwrap();
        assert_eq!(update.sql, "UPDATE TEST_TABLE SET NAME=:1 WHERE ID=:2");
        assert_eq!(update.params, vec![ParamValue::from("Beta"), ParamValue::from("7")]);

        let insert = builder(Dialect::Sqlite).insert(&params).unwrap();
        assert_eq!(insert.sql, "INSERT INTO TEST_TABLE (NAME) VALUES (?)");

        let delete = builder(Dialect::SqlServer).delete("7");
        assert_eq!(delete.sql, "DELETE FROM TEST_TABLE WHERE ID=@p1");
        assert_eq!(builder(Dialect::MySql).get("7").sql, "SELECT * FROM TEST_TABLE WHERE ID=?");
    }

    #[test]
    fn empty_writes_are_caller_errors() {
        let only_controls = merge_params(vec![(".page_size", "1")], None);
        let insert = builder(Dialect::Sqlite).insert(&only_controls).unwrap_err();
        assert_eq!(insert.to_string(), "nothing to insert");
        let update = builder(Dialect::Sqlite).update("1", &only_controls).unwrap_err();
        assert!(matches!(update, GateError::BadRequest(_)));
    }

    #[test]
    fn identifiers_are_escaped() {
        let params = merge_params(vec![("NAME--", "x")], None);
        let query = QueryBuilder {
            table: "it's",
            ..builder(Dialect::Sqlite)
        }
        .insert(&params)
        .unwrap();
        assert_eq!(query.sql, "INSERT INTO it''s (NAME) VALUES (?)");
    }
}
