//! SQL parsing and table extraction.

use opal_core::Dialect;
use sqlparser::ast::{Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use crate::error::CensorError;

/// Analyzes SQL statements to extract table references.
pub struct SqlAnalyzer {
    dialect: Dialect,
}

impl SqlAnalyzer {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Parse a SQL string into statements.
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>, CensorError> {
        let result = match self.dialect {
            Dialect::Postgresql => Parser::parse_sql(&PostgreSqlDialect {}, sql),
            Dialect::Mysql => Parser::parse_sql(&MySqlDialect {}, sql),
        };
        result.map_err(|e| CensorError::ParseError(e.to_string()))
    }

    /// Extract referenced table names from a statement.
    pub fn extract_tables(&self, stmt: &Statement) -> Vec<String> {
        let mut tables = Vec::new();
        self.visit_statement(stmt, &mut tables);
        tables
    }

    fn visit_statement(&self, stmt: &Statement, tables: &mut Vec<String>) {
        match stmt {
            Statement::Query(query) => {
                if let Some(body) = query.body.as_select() {
                    for table_with_joins in &body.from {
                        self.visit_table_with_joins(table_with_joins, tables);
                    }
                }
            }
            Statement::Insert(insert) => {
                tables.push(insert.table.to_string());
            }
            Statement::Update { table, .. } => {
                self.visit_table_with_joins(table, tables);
            }
            Statement::Delete(delete) => {
                self.visit_from_table(&delete.from, tables);
            }
            Statement::Drop { names, .. } => {
                for name in names {
                    tables.push(name.to_string());
                }
            }
            Statement::Truncate { table_names, .. } => {
                for name in table_names {
                    tables.push(name.name.to_string());
                }
            }
            _ => {}
        }
    }

    fn visit_from_table(&self, from_table: &sqlparser::ast::FromTable, tables: &mut Vec<String>) {
        match from_table {
            sqlparser::ast::FromTable::WithFromKeyword(tables_with_joins)
            | sqlparser::ast::FromTable::WithoutKeyword(tables_with_joins) => {
                for twj in tables_with_joins {
                    self.visit_table_with_joins(twj, tables);
                }
            }
        }
    }

    fn visit_table_with_joins(&self, table_with_joins: &TableWithJoins, tables: &mut Vec<String>) {
        if let Some(name) = extract_table_name(&table_with_joins.relation) {
            tables.push(name);
        }
        for join in &table_with_joins.joins {
            if let Some(name) = extract_table_name(&join.relation) {
                tables.push(name);
            }
        }
    }
}

fn extract_table_name(relation: &TableFactor) -> Option<String> {
    match relation {
        TableFactor::Table { name, .. } => Some(name.to_string()),
        _ => None,
    }
}
