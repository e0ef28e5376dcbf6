//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

// Lightweight fallback planner for the fast-path statement prefixes:
// DDL (CREATE / DROP / ALTER), transaction control (BEGIN / COMMIT /
// ROLLBACK and the explicit EXECUTE command forms), and TRUNCATE.
//
// Produced plans are cached by (table-space, query) when caching is allowed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sqlparser::ast::{ColumnOption, ObjectType, Statement as AstStatement, TableConstraint};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::model::{Column, ColumnType, SqlValue, Table};
use crate::sql::plan::{
    AlterOperation, AlterTableStatement, CreateTableStatement, DropTableStatement,
    EvaluationContext, ExecutionPlan, Statement, TruncateTableStatement,
};
use crate::sql::planner::map_data_type;
use crate::sql::{PlannerError, TranslatedQuery};

/// Statement-cache counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct FallbackPlanner {
    cache: Mutex<HashMap<String, Arc<ExecutionPlan>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FallbackPlanner {
    pub fn new() -> FallbackPlanner {
        FallbackPlanner {
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Plan a fast-path statement, consulting the cache when allowed.
    pub fn plan(
        &self,
        default_table_space: &str,
        query: &str,
        params: Vec<SqlValue>,
        allow_cache: bool,
    ) -> Result<TranslatedQuery, PlannerError> {
        let context = EvaluationContext::new(query, params);
        let key = format!("{default_table_space}\u{1}{query}");

        if allow_cache {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(plan) = cache.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(TranslatedQuery {
                    plan: plan.clone(),
                    context,
                });
            }
        }

        let statement = self.parse_statement(default_table_space, query)?;
        let plan = Arc::new(ExecutionPlan::simple(statement));
        if allow_cache {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(key, plan.clone());
        }
        Ok(TranslatedQuery { plan, context })
    }

    fn parse_statement(
        &self,
        default_ts: &str,
        query: &str,
    ) -> Result<Statement, PlannerError> {
        let trimmed = query.trim();
        let upper = trimmed.to_uppercase();

        if upper.starts_with("BEGIN") {
            return Ok(Statement::BeginTransaction {
                table_space: default_ts.to_lowercase(),
            });
        }
        if upper.starts_with("COMMIT") {
            return Ok(Statement::CommitTransaction {
                table_space: default_ts.to_lowercase(),
                tx: 0,
            });
        }
        if upper.starts_with("ROLLBACK") {
            return Ok(Statement::RollbackTransaction {
                table_space: default_ts.to_lowercase(),
                tx: 0,
            });
        }
        if upper.starts_with("TRUNCATE") {
            return parse_truncate(default_ts, trimmed);
        }
        if upper.starts_with("EXECUTE") {
            return parse_execute(default_ts, trimmed);
        }
        if upper.starts_with("ALTER") {
            return parse_alter(default_ts, trimmed);
        }
        if upper.starts_with("CREATE") || upper.starts_with("DROP") {
            return parse_ddl(default_ts, trimmed);
        }
        Err(PlannerError::Statement(format!(
            "unsupported statement: {trimmed}"
        )))
    }
}

impl Default for FallbackPlanner {
    fn default() -> Self {
        FallbackPlanner::new()
    }
}

// ---------------------------------------------------------------------------
// CREATE / DROP via sqlparser
// ---------------------------------------------------------------------------

fn parse_ddl(default_ts: &str, query: &str) -> Result<Statement, PlannerError> {
    let statements = Parser::parse_sql(&MySqlDialect {}, query)
        .map_err(|e| PlannerError::Parse(e.to_string()))?;
    let stmt = statements
        .into_iter()
        .next()
        .ok_or_else(|| PlannerError::Statement("empty statement".into()))?;

    match stmt {
        AstStatement::CreateTable(create) => {
            let (table_space, name) = split_table_name(
                default_ts,
                &create
                    .name
                    .0
                    .iter()
                    .map(|i| i.value.clone())
                    .collect::<Vec<_>>()
                    .join("."),
            );
            if create.columns.is_empty() {
                return Err(PlannerError::Statement(
                    "CREATE TABLE requires column definitions".into(),
                ));
            }

            let mut columns = Vec::with_capacity(create.columns.len());
            let mut primary_key: Vec<String> = Vec::new();
            for def in &create.columns {
                let column_name = def.name.value.to_lowercase();
                let ctype = map_data_type(&def.data_type)?;
                for option in &def.options {
                    if let ColumnOption::Unique {
                        is_primary: true, ..
                    } = option.option
                    {
                        primary_key.push(column_name.clone());
                    }
                }
                columns.push(Column::new(column_name, ctype));
            }
            for constraint in &create.constraints {
                if let TableConstraint::PrimaryKey { columns: pk, .. } = constraint {
                    for ident in pk {
                        primary_key.push(ident.value.to_lowercase());
                    }
                }
            }
            // Without a declared key the first column serves as the key.
            if primary_key.is_empty() {
                primary_key.push(columns[0].name.clone());
            }

            Ok(Statement::CreateTable(CreateTableStatement {
                table: Table {
                    table_space,
                    name,
                    columns,
                    primary_key,
                },
            }))
        }

        AstStatement::Drop {
            object_type: ObjectType::Table,
            names,
            if_exists,
            ..
        } => {
            let raw = names
                .first()
                .map(|n| {
                    n.0.iter()
                        .map(|i| i.value.clone())
                        .collect::<Vec<_>>()
                        .join(".")
                })
                .ok_or_else(|| PlannerError::Statement("DROP TABLE without a name".into()))?;
            let (table_space, table) = split_table_name(default_ts, &raw);
            Ok(Statement::DropTable(DropTableStatement {
                table_space,
                table,
                if_exists,
            }))
        }

        other => Err(PlannerError::Statement(format!(
            "unsupported DDL statement: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Hand-parsed command forms
// ---------------------------------------------------------------------------

fn parse_truncate(default_ts: &str, query: &str) -> Result<Statement, PlannerError> {
    let mut tokens = query.split_whitespace();
    tokens.next(); // TRUNCATE
    let mut name = tokens
        .next()
        .ok_or_else(|| PlannerError::Statement("TRUNCATE without a table name".into()))?;
    if name.eq_ignore_ascii_case("table") {
        name = tokens
            .next()
            .ok_or_else(|| PlannerError::Statement("TRUNCATE TABLE without a table name".into()))?;
    }
    let (table_space, table) = split_table_name(default_ts, name.trim_end_matches(';'));
    Ok(Statement::TruncateTable(TruncateTableStatement {
        table_space,
        table,
    }))
}

/// `EXECUTE <command> [args]` transaction-control forms:
///   EXECUTE BEGINTRANSACTION 'ts'
///   EXECUTE COMMITTRANSACTION 'ts', txid
///   EXECUTE ROLLBACKTRANSACTION 'ts', txid
fn parse_execute(default_ts: &str, query: &str) -> Result<Statement, PlannerError> {
    let rest = query["EXECUTE".len()..].trim();
    let (command, args_raw) = match rest.find(char::is_whitespace) {
        Some(i) => (&rest[..i], rest[i..].trim()),
        None => (rest, ""),
    };
    let args: Vec<String> = if args_raw.is_empty() {
        Vec::new()
    } else {
        args_raw
            .trim_end_matches(';')
            .split(',')
            .map(|a| a.trim().trim_matches('\'').to_string())
            .collect()
    };

    let table_space = args
        .first()
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| default_ts.to_lowercase());
    let tx = match args.get(1) {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            PlannerError::Statement(format!("invalid transaction id '{raw}'"))
        })?,
        None => 0,
    };

    match command.to_uppercase().as_str() {
        "BEGINTRANSACTION" => Ok(Statement::BeginTransaction { table_space }),
        "COMMITTRANSACTION" => Ok(Statement::CommitTransaction { table_space, tx }),
        "ROLLBACKTRANSACTION" => Ok(Statement::RollbackTransaction { table_space, tx }),
        other => Err(PlannerError::Statement(format!(
            "unknown EXECUTE command '{other}'"
        ))),
    }
}

/// `ALTER TABLE t ADD [COLUMN] name TYPE` / `ALTER TABLE t DROP [COLUMN] name`.
fn parse_alter(default_ts: &str, query: &str) -> Result<Statement, PlannerError> {
    let tokens: Vec<&str> = query.trim_end_matches(';').split_whitespace().collect();
    if tokens.len() < 4 || !tokens[1].eq_ignore_ascii_case("table") {
        return Err(PlannerError::Statement(format!(
            "unsupported ALTER statement: {query}"
        )));
    }
    let (table_space, table) = split_table_name(default_ts, tokens[2]);
    let mut rest = &tokens[3..];
    let verb = rest[0].to_uppercase();
    rest = &rest[1..];
    if rest.first().map(|t| t.eq_ignore_ascii_case("column")) == Some(true) {
        rest = &rest[1..];
    }

    let operation = match verb.as_str() {
        "ADD" => {
            let (name, type_name) = match rest {
                [name, type_name, ..] => (name.to_lowercase(), *type_name),
                _ => {
                    return Err(PlannerError::Statement(
                        "ALTER TABLE ADD requires a column name and type".into(),
                    ))
                }
            };
            AlterOperation::AddColumn(Column::new(name, parse_type_name(type_name)?))
        }
        "DROP" => match rest {
            [name, ..] => AlterOperation::DropColumn(name.to_lowercase()),
            _ => {
                return Err(PlannerError::Statement(
                    "ALTER TABLE DROP requires a column name".into(),
                ))
            }
        },
        other => {
            return Err(PlannerError::Statement(format!(
                "unsupported ALTER TABLE operation '{other}'"
            )))
        }
    };

    Ok(Statement::AlterTable(AlterTableStatement {
        table_space,
        table,
        operation,
    }))
}

fn parse_type_name(raw: &str) -> Result<ColumnType, PlannerError> {
    // Strip a length suffix such as VARCHAR(64).
    let base = raw.split('(').next().unwrap_or(raw);
    match base.to_uppercase().as_str() {
        "VARCHAR" | "STRING" | "TEXT" => Ok(ColumnType::String),
        "BOOLEAN" | "BOOL" => Ok(ColumnType::Boolean),
        "INT" | "INTEGER" => Ok(ColumnType::Integer),
        "BIGINT" | "LONG" => Ok(ColumnType::Long),
        "VARBINARY" | "BLOB" => Ok(ColumnType::Bytearray),
        "TIMESTAMP" => Ok(ColumnType::Timestamp),
        other => Err(PlannerError::Statement(format!(
            "unsupported SQL type {other}"
        ))),
    }
}

fn split_table_name(default_ts: &str, raw: &str) -> (String, String) {
    let cleaned = raw.trim_matches('`');
    match cleaned.split_once('.') {
        Some((space, table)) => (space.to_lowercase(), table.to_lowercase()),
        None => (default_ts.to_lowercase(), cleaned.to_lowercase()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_one(query: &str) -> Statement {
        let fb = FallbackPlanner::new();
        let tq = fb.plan("ts1", query, vec![], true).unwrap();
        tq.plan.main.clone()
    }

    #[test]
    fn create_table_with_primary_key() {
        let stmt = plan_one("CREATE TABLE t (id int primary key, name varchar(32))");
        match stmt {
            Statement::CreateTable(create) => {
                assert_eq!(create.table.table_space, "ts1");
                assert_eq!(create.table.name, "t");
                assert_eq!(create.table.primary_key, vec!["id".to_string()]);
                assert_eq!(create.table.columns[0].ctype, ColumnType::Integer);
                assert_eq!(create.table.columns[1].ctype, ColumnType::String);
            }
            other => panic!("expected CreateTable, got {other:?}"),
        }
    }

    #[test]
    fn create_table_defaults_key_to_first_column() {
        let stmt = plan_one("CREATE TABLE ts2.t (a bigint, b boolean)");
        match stmt {
            Statement::CreateTable(create) => {
                assert_eq!(create.table.table_space, "ts2");
                assert_eq!(create.table.primary_key, vec!["a".to_string()]);
            }
            other => panic!("expected CreateTable, got {other:?}"),
        }
    }

    #[test]
    fn create_table_rejects_unknown_type() {
        let fb = FallbackPlanner::new();
        assert!(fb
            .plan("ts1", "CREATE TABLE t (a GEOMETRY)", vec![], true)
            .is_err());
    }

    #[test]
    fn transaction_control_forms() {
        assert!(matches!(
            plan_one("BEGIN"),
            Statement::BeginTransaction { .. }
        ));
        assert!(matches!(
            plan_one("COMMIT"),
            Statement::CommitTransaction { tx: 0, .. }
        ));
        assert!(matches!(
            plan_one("ROLLBACK"),
            Statement::RollbackTransaction { tx: 0, .. }
        ));
    }

    #[test]
    fn execute_command_forms() {
        match plan_one("EXECUTE BEGINTRANSACTION 'ts9'") {
            Statement::BeginTransaction { table_space } => assert_eq!(table_space, "ts9"),
            other => panic!("unexpected {other:?}"),
        }
        match plan_one("EXECUTE COMMITTRANSACTION 'ts9', 42") {
            Statement::CommitTransaction { table_space, tx } => {
                assert_eq!(table_space, "ts9");
                assert_eq!(tx, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
        match plan_one("EXECUTE ROLLBACKTRANSACTION 'ts9',7") {
            Statement::RollbackTransaction { table_space, tx } => {
                assert_eq!(table_space, "ts9");
                assert_eq!(tx, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
        let fb = FallbackPlanner::new();
        assert!(fb.plan("ts1", "EXECUTE FROBNICATE 'x'", vec![], true).is_err());
    }

    #[test]
    fn truncate_and_alter() {
        assert!(matches!(
            plan_one("TRUNCATE TABLE ts1.t"),
            Statement::TruncateTable(TruncateTableStatement { .. })
        ));
        match plan_one("ALTER TABLE t ADD COLUMN extra bigint") {
            Statement::AlterTable(alter) => match alter.operation {
                AlterOperation::AddColumn(col) => {
                    assert_eq!(col.name, "extra");
                    assert_eq!(col.ctype, ColumnType::Long);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
        match plan_one("ALTER TABLE t DROP COLUMN extra") {
            Statement::AlterTable(alter) => {
                assert!(matches!(alter.operation, AlterOperation::DropColumn(ref c) if c == "extra"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cache_counts_hits_and_misses() {
        let fb = FallbackPlanner::new();
        fb.plan("ts1", "BEGIN", vec![], true).unwrap();
        fb.plan("ts1", "BEGIN", vec![], true).unwrap();
        fb.plan("ts1", "BEGIN", vec![], false).unwrap();
        let stats = fb.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn cached_plans_are_shared() {
        let fb = FallbackPlanner::new();
        let a = fb.plan("ts1", "BEGIN", vec![], true).unwrap();
        let b = fb.plan("ts1", "BEGIN", vec![], true).unwrap();
        assert!(Arc::ptr_eq(&a.plan, &b.plan));
    }
}
