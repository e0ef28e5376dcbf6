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

//! In-memory engine: a compact `Engine` implementation that interprets
//! operator trees over table-space registries. Backs the demo server and
//! the integration tests; transactional isolation stays with real storage
//! engines behind the trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::engine::{
    DataScanner, Engine, EngineError, ExecutionResult, TransactionContext,
};
use crate::model::{encode_key, ColumnType, SqlValue, Table, Tuple};
use crate::server::channel::Channel;
use crate::server::message::{Message, WireValue, P_DUMP_ID, P_TABLE};
use crate::sql::plan::{
    AlterOperation, EvaluationContext, ExecutionPlan, PlanOp, Statement, UpdateStatement,
};
use crate::sql::PlannerMetadata;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

struct MemTable {
    schema: Table,
    fields: Arc<Vec<String>>,
    rows: BTreeMap<Vec<u8>, Vec<SqlValue>>,
}

impl MemTable {
    fn new(schema: Table) -> MemTable {
        let fields = Arc::new(schema.column_names());
        MemTable {
            schema,
            fields,
            rows: BTreeMap::new(),
        }
    }

    fn key_of(&self, values: &[SqlValue]) -> Result<Vec<u8>, EngineError> {
        let row = Tuple::new(self.fields.clone(), values.to_vec());
        encode_key(&self.schema, &row).map_err(|e| EngineError::Statement(e.to_string()))
    }
}

struct SpaceData {
    leader: bool,
    tables: HashMap<String, MemTable>,
}

// ---------------------------------------------------------------------------
// MemEngine
// ---------------------------------------------------------------------------

pub struct MemEngine {
    node_id: String,
    spaces: DashMap<String, SpaceData>,
    next_tx: AtomicU64,
}

impl MemEngine {
    pub fn new(node_id: &str) -> Arc<MemEngine> {
        Arc::new(MemEngine {
            node_id: node_id.to_string(),
            spaces: DashMap::new(),
            next_tx: AtomicU64::new(1),
        })
    }

    pub fn add_table_space(&self, name: &str) {
        self.spaces.insert(
            name.to_lowercase(),
            SpaceData {
                leader: true,
                tables: HashMap::new(),
            },
        );
    }

    /// Flip the leadership flag of a table-space; a follower answers every
    /// statement with the not-leader signal.
    pub fn set_leader(&self, name: &str, leader: bool) {
        if let Some(mut space) = self.spaces.get_mut(&name.to_lowercase()) {
            space.leader = leader;
        }
    }

    fn space(
        &self,
        table_space: &str,
    ) -> Result<dashmap::mapref::one::Ref<'_, String, SpaceData>, EngineError> {
        let space = self
            .spaces
            .get(&table_space.to_lowercase())
            .ok_or_else(|| {
                EngineError::Statement(format!("table-space '{table_space}' not found"))
            })?;
        if !space.leader {
            return Err(EngineError::NotLeader {
                table_space: table_space.to_string(),
            });
        }
        Ok(space)
    }

    fn space_mut(
        &self,
        table_space: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, SpaceData>, EngineError> {
        let space = self
            .spaces
            .get_mut(&table_space.to_lowercase())
            .ok_or_else(|| {
                EngineError::Statement(format!("table-space '{table_space}' not found"))
            })?;
        if !space.leader {
            return Err(EngineError::NotLeader {
                table_space: table_space.to_string(),
            });
        }
        Ok(space)
    }

    fn check_leader(&self, table_space: &str) -> Result<(), EngineError> {
        self.space(table_space).map(|_| ())
    }

    fn with_table<R>(
        &self,
        table_space: &str,
        table: &str,
        f: impl FnOnce(&MemTable) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let space = self.space(table_space)?;
        let t = space.tables.get(&table.to_lowercase()).ok_or_else(|| {
            EngineError::Statement(format!("table '{table}' not found in '{table_space}'"))
        })?;
        f(t)
    }

    fn with_table_mut<R>(
        &self,
        table_space: &str,
        table: &str,
        f: impl FnOnce(&mut MemTable) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let mut space = self.space_mut(table_space)?;
        let t = space.tables.get_mut(&table.to_lowercase()).ok_or_else(|| {
            EngineError::Statement(format!("table '{table}' not found in '{table_space}'"))
        })?;
        f(t)
    }

    // -----------------------------------------------------------------------
    // Statement execution (transaction control, DDL, gets)
    // -----------------------------------------------------------------------

    fn execute_control(
        &self,
        statement: &Statement,
        ctx: &EvaluationContext,
        tx: TransactionContext,
    ) -> Option<Result<ExecutionResult, EngineError>> {
        match statement {
            Statement::BeginTransaction { table_space } => Some(
                self.check_leader(table_space).map(|_| ExecutionResult::Transaction {
                    tx_id: self.next_tx.fetch_add(1, Ordering::Relaxed),
                }),
            ),
            Statement::CommitTransaction { table_space, tx: stmt_tx }
            | Statement::RollbackTransaction { table_space, tx: stmt_tx } => {
                let resolved = if *stmt_tx != 0 { *stmt_tx } else { tx.tx_id };
                if resolved == 0 {
                    return Some(Err(EngineError::Statement(
                        "no transaction to complete".into(),
                    )));
                }
                Some(
                    self.check_leader(table_space)
                        .map(|_| ExecutionResult::Transaction { tx_id: resolved }),
                )
            }
            Statement::CreateTable(create) => Some(self.create_table(&create.table)),
            Statement::DropTable(drop) => {
                Some(self.drop_table(&drop.table_space, &drop.table, drop.if_exists))
            }
            Statement::AlterTable(alter) => {
                Some(self.alter_table(&alter.table_space, &alter.table, &alter.operation))
            }
            Statement::TruncateTable(truncate) => Some(
                self.with_table_mut(&truncate.table_space, &truncate.table, |t| {
                    t.rows.clear();
                    Ok(ExecutionResult::Ddl)
                }),
            ),
            Statement::Get(get) => Some(self.execute_get(get, ctx)),
            _ => None,
        }
    }

    fn create_table(&self, table: &Table) -> Result<ExecutionResult, EngineError> {
        let mut space = self.space_mut(&table.table_space)?;
        let name = table.name.to_lowercase();
        if space.tables.contains_key(&name) {
            return Err(EngineError::Statement(format!(
                "table '{}' already exists",
                table.name
            )));
        }
        for pk in &table.primary_key {
            if table.column(pk).is_none() {
                return Err(EngineError::Statement(format!(
                    "primary key column '{pk}' not defined"
                )));
            }
        }
        space.tables.insert(name, MemTable::new(table.clone()));
        Ok(ExecutionResult::Ddl)
    }

    fn drop_table(
        &self,
        table_space: &str,
        table: &str,
        if_exists: bool,
    ) -> Result<ExecutionResult, EngineError> {
        let mut space = self.space_mut(table_space)?;
        if space.tables.remove(&table.to_lowercase()).is_none() && !if_exists {
            return Err(EngineError::Statement(format!(
                "table '{table}' not found in '{table_space}'"
            )));
        }
        Ok(ExecutionResult::Ddl)
    }

    fn alter_table(
        &self,
        table_space: &str,
        table: &str,
        operation: &AlterOperation,
    ) -> Result<ExecutionResult, EngineError> {
        self.with_table_mut(table_space, table, |t| {
            match operation {
                AlterOperation::AddColumn(column) => {
                    if t.schema.column(&column.name).is_some() {
                        return Err(EngineError::Statement(format!(
                            "column '{}' already exists",
                            column.name
                        )));
                    }
                    t.schema.columns.push(column.clone());
                    for row in t.rows.values_mut() {
                        row.push(SqlValue::Null);
                    }
                }
                AlterOperation::DropColumn(name) => {
                    if t.schema.primary_key.iter().any(|pk| pk == name) {
                        return Err(EngineError::Statement(format!(
                            "cannot drop primary key column '{name}'"
                        )));
                    }
                    let index = t.schema.column_index(name).ok_or_else(|| {
                        EngineError::Statement(format!("column '{name}' not found"))
                    })?;
                    t.schema.columns.remove(index);
                    for row in t.rows.values_mut() {
                        row.remove(index);
                    }
                }
            }
            t.fields = Arc::new(t.schema.column_names());
            Ok(ExecutionResult::Ddl)
        })
    }

    fn execute_get(
        &self,
        get: &crate::sql::plan::GetStatement,
        ctx: &EvaluationContext,
    ) -> Result<ExecutionResult, EngineError> {
        let key_value = get.key.evaluate(&[], ctx)?;
        self.with_table(&get.table_space, &get.table, |t| {
            let pk = t.schema.primary_key.first().ok_or_else(|| {
                EngineError::Statement(format!("table '{}' has no primary key", get.table))
            })?;
            let pk_type = t
                .schema
                .column(pk)
                .map(|c| c.ctype)
                .unwrap_or(ColumnType::Any);
            let coerced = coerce(key_value.clone(), pk_type)?;
            let probe = Tuple::new(Arc::new(vec![pk.clone()]), vec![coerced]);
            let blob = encode_key(
                &Table {
                    table_space: t.schema.table_space.clone(),
                    name: t.schema.name.clone(),
                    columns: t.schema.columns.clone(),
                    primary_key: vec![pk.clone()],
                },
                &probe,
            )
            .map_err(|e| EngineError::Statement(e.to_string()))?;
            let record = t
                .rows
                .get(&blob)
                .map(|values| Tuple::new(t.fields.clone(), values.clone()));
            Ok(ExecutionResult::Get { record })
        })
    }

    // -----------------------------------------------------------------------
    // Operator interpretation
    // -----------------------------------------------------------------------

    fn execute_root(
        &self,
        root: &PlanOp,
        ctx: &EvaluationContext,
    ) -> Result<ExecutionResult, EngineError> {
        match root {
            PlanOp::Insert {
                table_space,
                table,
                input,
                return_values,
            } => {
                let (in_fields, rows) = self.eval_rows(input, ctx)?;
                self.insert_rows(table_space, table, &in_fields, rows, *return_values)
            }
            PlanOp::Update { statement } => self.update_rows(statement, ctx),
            PlanOp::Delete { statement } => {
                let (count, _) = self.delete_rows(statement, ctx)?;
                Ok(ExecutionResult::Dml {
                    update_count: count,
                    key: None,
                })
            }
            scan => {
                let (fields, rows) = self.eval_rows(scan, ctx)?;
                Ok(ExecutionResult::Scan(Box::new(MemScanner::new(
                    fields, rows,
                ))))
            }
        }
    }

    /// Evaluate a row-producing subtree into (fields, rows).
    fn eval_rows(
        &self,
        op: &PlanOp,
        ctx: &EvaluationContext,
    ) -> Result<(Arc<Vec<String>>, Vec<Vec<SqlValue>>), EngineError> {
        match op {
            PlanOp::TableScan {
                table_space, table, ..
            } => self.with_table(table_space, table, |t| {
                Ok((t.fields.clone(), t.rows.values().cloned().collect()))
            }),

            PlanOp::FilteredTableScan {
                table_space,
                table,
                predicate,
                ..
            } => self.with_table(table_space, table, |t| {
                let mut out = Vec::new();
                for row in t.rows.values() {
                    if predicate.evaluate(row, ctx)?.is_true() {
                        out.push(row.clone());
                    }
                }
                Ok((t.fields.clone(), out))
            }),

            PlanOp::Filter { input, condition } => {
                let (fields, rows) = self.eval_rows(input, ctx)?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    if condition.evaluate(&row, ctx)?.is_true() {
                        out.push(row);
                    }
                }
                Ok((fields, out))
            }

            PlanOp::Project {
                input,
                field_names,
                exprs,
                ..
            } => {
                let (_, rows) = self.eval_rows(input, ctx)?;
                let fields = Arc::new(field_names.clone());
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut values = Vec::with_capacity(exprs.len());
                    for expr in exprs {
                        values.push(expr.evaluate(&row, ctx)?);
                    }
                    out.push(values);
                }
                Ok((fields, out))
            }

            PlanOp::Sort {
                input,
                directions,
                fields: sort_fields,
            } => {
                let (fields, mut rows) = self.eval_rows(input, ctx)?;
                rows.sort_by(|a, b| {
                    for (index, asc) in sort_fields.iter().zip(directions.iter()) {
                        let ord = a[*index].compare(&b[*index]);
                        let ord = if *asc { ord } else { ord.reverse() };
                        if ord != std::cmp::Ordering::Equal {
                            return ord;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                Ok((fields, rows))
            }

            PlanOp::Limit {
                input,
                fetch,
                offset,
            } => {
                let (fields, rows) = self.eval_rows(input, ctx)?;
                let offset = eval_limit_value(offset.as_ref(), ctx)?.unwrap_or(0);
                let fetch = eval_limit_value(fetch.as_ref(), ctx)?;
                let iter = rows.into_iter().skip(offset as usize);
                let rows = match fetch {
                    Some(n) => iter.take(n as usize).collect(),
                    None => iter.collect(),
                };
                Ok((fields, rows))
            }

            PlanOp::Aggregate {
                input,
                field_names,
                functions,
                arguments,
                group_fields,
                ..
            } => {
                let (_, rows) = self.eval_rows(input, ctx)?;
                let out_fields = Arc::new(field_names.clone());
                let out = aggregate_rows(rows, functions, arguments, group_fields)?;
                Ok((out_fields, out))
            }

            PlanOp::Values {
                field_names, rows, ..
            } => {
                let fields = Arc::new(field_names.clone());
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut values = Vec::with_capacity(row.len());
                    for expr in row {
                        values.push(expr.evaluate(&[], ctx)?);
                    }
                    out.push(values);
                }
                Ok((fields, out))
            }

            PlanOp::Insert { .. } | PlanOp::Update { .. } | PlanOp::Delete { .. } => Err(
                EngineError::Statement("data-modification node in a scan pipeline".into()),
            ),
        }
    }

    fn insert_rows(
        &self,
        table_space: &str,
        table: &str,
        in_fields: &[String],
        rows: Vec<Vec<SqlValue>>,
        return_values: bool,
    ) -> Result<ExecutionResult, EngineError> {
        self.with_table_mut(table_space, table, |t| {
            let mut last_key = None;
            let mut count = 0u64;
            for row in rows {
                // Rearrange the input row into full table column order.
                let mut full = vec![SqlValue::Null; t.schema.columns.len()];
                for (value, name) in row.into_iter().zip(in_fields.iter()) {
                    let index = t.schema.column_index(name).ok_or_else(|| {
                        EngineError::Statement(format!("column '{name}' not found"))
                    })?;
                    full[index] = coerce(value, t.schema.columns[index].ctype)?;
                }
                let key = t.key_of(&full)?;
                if t.rows.contains_key(&key) {
                    return Err(EngineError::Statement(format!(
                        "duplicate primary key in table '{table}'"
                    )));
                }
                t.rows.insert(key.clone(), full);
                last_key = Some(key);
                count += 1;
            }
            Ok(ExecutionResult::Dml {
                update_count: count,
                key: if return_values { last_key } else { None },
            })
        })
    }

    fn update_rows(
        &self,
        statement: &UpdateStatement,
        ctx: &EvaluationContext,
    ) -> Result<ExecutionResult, EngineError> {
        self.with_table_mut(&statement.table_space, &statement.table, |t| {
            let mut column_indices = Vec::with_capacity(statement.columns.len());
            for name in &statement.columns {
                let index = t.schema.column_index(name).ok_or_else(|| {
                    EngineError::Statement(format!("column '{name}' not found"))
                })?;
                column_indices.push(index);
            }

            let mut updates: Vec<(Vec<u8>, Vec<SqlValue>)> = Vec::new();
            for (key, row) in t.rows.iter() {
                let matches = match &statement.predicate {
                    Some(p) => p.evaluate(row, ctx)?.is_true(),
                    None => true,
                };
                if !matches {
                    continue;
                }
                let mut updated = row.clone();
                for (index, expr) in column_indices.iter().zip(statement.expressions.iter()) {
                    let value = expr.evaluate(row, ctx)?;
                    updated[*index] = coerce(value, t.schema.columns[*index].ctype)?;
                }
                updates.push((key.clone(), updated));
            }

            let count = updates.len() as u64;
            for (old_key, updated) in updates {
                let new_key = t.key_of(&updated)?;
                t.rows.remove(&old_key);
                t.rows.insert(new_key, updated);
            }
            Ok(ExecutionResult::Dml {
                update_count: count,
                key: None,
            })
        })
    }

    fn delete_rows(
        &self,
        statement: &crate::sql::plan::DeleteStatement,
        ctx: &EvaluationContext,
    ) -> Result<(u64, ()), EngineError> {
        self.with_table_mut(&statement.table_space, &statement.table, |t| {
            let mut doomed = Vec::new();
            for (key, row) in t.rows.iter() {
                let matches = match &statement.predicate {
                    Some(p) => p.evaluate(row, ctx)?.is_true(),
                    None => true,
                };
                if matches {
                    doomed.push(key.clone());
                }
            }
            for key in &doomed {
                t.rows.remove(key);
            }
            Ok((doomed.len() as u64, ()))
        })
    }
}

// ---------------------------------------------------------------------------
// Engine + PlannerMetadata impls
// ---------------------------------------------------------------------------

impl PlannerMetadata for MemEngine {
    fn local_table_spaces(&self) -> Vec<String> {
        self.spaces.iter().map(|e| e.key().clone()).collect()
    }

    fn tables_for_planner(&self, table_space: &str) -> Vec<Table> {
        self.spaces
            .get(&table_space.to_lowercase())
            .map(|space| space.tables.values().map(|t| t.schema.clone()).collect())
            .unwrap_or_default()
    }

    fn node_id(&self) -> String {
        self.node_id.clone()
    }
}

impl Engine for MemEngine {
    fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        ctx: &EvaluationContext,
        tx: TransactionContext,
    ) -> Result<ExecutionResult, EngineError> {
        if let Some(result) = self.execute_control(&plan.main, ctx, tx) {
            return result;
        }
        match &plan.root {
            Some(root) => self.execute_root(root, ctx),
            None => Err(EngineError::Statement(
                "plan has no operator tree".into(),
            )),
        }
    }

    fn execute_statement(
        &self,
        statement: &Statement,
        ctx: &EvaluationContext,
        tx: TransactionContext,
    ) -> Result<ExecutionResult, EngineError> {
        match self.execute_control(statement, ctx, tx) {
            Some(result) => result,
            None => Err(EngineError::Statement(
                "statement requires a planned operator tree".into(),
            )),
        }
    }

    fn table_schema(&self, table_space: &str, table: &str) -> Option<Table> {
        self.spaces
            .get(&table_space.to_lowercase())
            .and_then(|space| space.tables.get(&table.to_lowercase()).map(|t| t.schema.clone()))
    }

    fn dump_table_space(
        &self,
        table_space: &str,
        dump_id: &str,
        request: &Message,
        channel: &dyn Channel,
        fetch_size: usize,
    ) -> Result<(), EngineError> {
        let space = self.space(table_space)?;
        debug!(table_space, dump_id, "streaming table-space dump");

        // Snapshot (name, fields, rows) per table so chunking happens
        // without holding the registry entry.
        let mut tables: Vec<(String, Vec<String>, Vec<Vec<SqlValue>>)> = space
            .tables
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    t.fields.as_ref().clone(),
                    t.rows.values().cloned().collect(),
                )
            })
            .collect();
        drop(space);
        tables.sort_by(|a, b| a.0.cmp(&b.0));

        if tables.is_empty() {
            let chunk = Message::resultset_chunk(request, dump_id, &[], Vec::new(), true, None)
                .with(P_DUMP_ID, WireValue::Str(dump_id.into()));
            channel.send_reply(chunk);
            return Ok(());
        }

        let last_table = tables.len() - 1;
        for (table_index, (name, fields, rows)) in tables.into_iter().enumerate() {
            let shared = Arc::new(fields.clone());
            let chunks: Vec<&[Vec<SqlValue>]> = if rows.is_empty() {
                vec![&[]]
            } else {
                rows.chunks(fetch_size.max(1)).collect()
            };
            let last_chunk = chunks.len() - 1;
            for (chunk_index, chunk) in chunks.iter().enumerate() {
                let records = chunk
                    .iter()
                    .map(|values| {
                        let row = Tuple::new(shared.clone(), values.clone());
                        WireValue::Map(
                            row.fields()
                                .iter()
                                .zip(row.values().iter())
                                .map(|(f, v)| (f.clone(), WireValue::from_sql(v)))
                                .collect(),
                        )
                    })
                    .collect();
                let last = table_index == last_table && chunk_index == last_chunk;
                let message =
                    Message::resultset_chunk(request, dump_id, &fields, records, last, None)
                        .with(P_DUMP_ID, WireValue::Str(dump_id.into()))
                        .with(P_TABLE, WireValue::Str(name.clone()));
                channel.send_reply(message);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

struct MemScanner {
    fields: Arc<Vec<String>>,
    schema: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    pos: usize,
}

impl MemScanner {
    fn new(fields: Arc<Vec<String>>, rows: Vec<Vec<SqlValue>>) -> MemScanner {
        let schema = fields.as_ref().clone();
        MemScanner {
            fields,
            schema,
            rows,
            pos: 0,
        }
    }
}

impl DataScanner for MemScanner {
    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn next_row(&mut self) -> Result<Option<Tuple>, EngineError> {
        match self.rows.get(self.pos) {
            Some(values) => {
                self.pos += 1;
                Ok(Some(Tuple::new(self.fields.clone(), values.clone())))
            }
            None => Ok(None),
        }
    }

    fn is_finished(&self) -> bool {
        self.pos >= self.rows.len()
    }

    fn close(&mut self) {
        self.pos = self.rows.len();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Coerce an evaluated value to a column type on write.
fn coerce(value: SqlValue, ctype: ColumnType) -> Result<SqlValue, EngineError> {
    match (value, ctype) {
        (SqlValue::Null, _) => Ok(SqlValue::Null),
        (v, ColumnType::Any) => Ok(v),
        (SqlValue::Integer(i), ColumnType::Integer) => Ok(SqlValue::Integer(i)),
        (SqlValue::Long(i), ColumnType::Integer) => i32::try_from(i)
            .map(SqlValue::Integer)
            .map_err(|_| EngineError::Statement(format!("integer overflow: {i}"))),
        (SqlValue::Integer(i), ColumnType::Long) => Ok(SqlValue::Long(i as i64)),
        (SqlValue::Long(i), ColumnType::Long) => Ok(SqlValue::Long(i)),
        (SqlValue::Integer(i), ColumnType::Timestamp) => Ok(SqlValue::Timestamp(i as i64)),
        (SqlValue::Long(i), ColumnType::Timestamp) | (SqlValue::Timestamp(i), ColumnType::Timestamp) => {
            Ok(SqlValue::Timestamp(i))
        }
        (SqlValue::Timestamp(i), ColumnType::Long) => Ok(SqlValue::Long(i)),
        (SqlValue::Boolean(b), ColumnType::Boolean) => Ok(SqlValue::Boolean(b)),
        (SqlValue::String(s), ColumnType::String) => Ok(SqlValue::String(s)),
        (SqlValue::Bytes(b), ColumnType::Bytearray) => Ok(SqlValue::Bytes(b)),
        (v, t) => Err(EngineError::Statement(format!(
            "cannot store {v} into a {t} column"
        ))),
    }
}

fn eval_limit_value(
    expr: Option<&crate::sql::expr::CompiledExpr>,
    ctx: &EvaluationContext,
) -> Result<Option<i64>, EngineError> {
    match expr {
        None => Ok(None),
        Some(e) => {
            let v = e.evaluate(&[], ctx)?;
            let n = v.as_i64().ok_or_else(|| {
                EngineError::Statement(format!("limit/offset is not an integer: {v}"))
            })?;
            if n < 0 {
                return Err(EngineError::Statement(
                    "limit/offset must be non-negative".into(),
                ));
            }
            Ok(Some(n))
        }
    }
}

fn aggregate_rows(
    rows: Vec<Vec<SqlValue>>,
    functions: &[String],
    arguments: &[Vec<usize>],
    group_fields: &[usize],
) -> Result<Vec<Vec<SqlValue>>, EngineError> {
    // Group preserving first-seen key order, then emit keys + aggregates.
    let mut groups: Vec<(Vec<SqlValue>, Vec<Vec<SqlValue>>)> = Vec::new();
    if group_fields.is_empty() {
        groups.push((Vec::new(), rows));
    } else {
        for row in rows {
            let key: Vec<SqlValue> = group_fields.iter().map(|i| row[*i].clone()).collect();
            match groups.iter_mut().find(|(k, _)| {
                k.iter()
                    .zip(key.iter())
                    .all(|(a, b)| a.compare(b) == std::cmp::Ordering::Equal)
            }) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut result = key;
        for (function, args) in functions.iter().zip(arguments.iter()) {
            result.push(apply_aggregate(function, args, &members)?);
        }
        out.push(result);
    }
    Ok(out)
}

fn apply_aggregate(
    function: &str,
    args: &[usize],
    rows: &[Vec<SqlValue>],
) -> Result<SqlValue, EngineError> {
    match function {
        "count" => {
            let n = match args.first() {
                None => rows.len() as i64,
                Some(i) => rows.iter().filter(|r| !r[*i].is_null()).count() as i64,
            };
            Ok(SqlValue::Long(n))
        }
        "sum" => {
            let index = args
                .first()
                .ok_or_else(|| EngineError::Statement("sum without an argument".into()))?;
            let mut acc = 0i64;
            let mut any = false;
            for row in rows {
                if let Some(v) = row[*index].as_i64() {
                    acc += v;
                    any = true;
                } else if !row[*index].is_null() {
                    return Err(EngineError::Statement(format!(
                        "sum over non-numeric value {}",
                        row[*index]
                    )));
                }
            }
            Ok(if any { SqlValue::Long(acc) } else { SqlValue::Null })
        }
        "min" | "max" => {
            let index = args
                .first()
                .ok_or_else(|| EngineError::Statement("min/max without an argument".into()))?;
            let mut best: Option<SqlValue> = None;
            for row in rows {
                let v = &row[*index];
                if v.is_null() {
                    continue;
                }
                best = Some(match best {
                    None => v.clone(),
                    Some(b) => {
                        let keep_new = match function {
                            "min" => v.compare(&b) == std::cmp::Ordering::Less,
                            _ => v.compare(&b) == std::cmp::Ordering::Greater,
                        };
                        if keep_new {
                            v.clone()
                        } else {
                            b
                        }
                    }
                });
            }
            Ok(best.unwrap_or(SqlValue::Null))
        }
        other => Err(EngineError::Statement(format!(
            "unsupported aggregate function '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Column;
    use crate::sql::plan::CreateTableStatement;
    use crate::sql::Planner;

    fn engine_with_table() -> (Arc<MemEngine>, Planner) {
        let engine = MemEngine::new("node-mem");
        engine.add_table_space("ts1");
        let table = Table {
            table_space: "ts1".into(),
            name: "t".into(),
            columns: vec![
                Column::new("id", ColumnType::Integer),
                Column::new("grp", ColumnType::String),
                Column::new("v", ColumnType::Long),
            ],
            primary_key: vec!["id".into()],
        };
        engine
            .execute_statement(
                &Statement::CreateTable(CreateTableStatement { table }),
                &EvaluationContext::default(),
                TransactionContext::NO_TRANSACTION,
            )
            .unwrap();
        let planner = Planner::new(engine.clone());
        (engine, planner)
    }

    fn run(
        engine: &Arc<MemEngine>,
        planner: &Planner,
        query: &str,
        params: Vec<SqlValue>,
    ) -> ExecutionResult {
        let tq = planner
            .translate("ts1", query, params, true, true, true, 0)
            .unwrap();
        engine
            .execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION)
            .unwrap()
    }

    fn rows_of(result: ExecutionResult) -> Vec<Vec<SqlValue>> {
        match result {
            ExecutionResult::Scan(mut scanner) => {
                let mut rows = Vec::new();
                while let Some(row) = scanner.next_row().unwrap() {
                    rows.push(row.into_values());
                }
                rows
            }
            _ => panic!("expected a scan result"),
        }
    }

    fn seed(engine: &Arc<MemEngine>, planner: &Planner) {
        for (id, grp, v) in [
            (1, "a", 10),
            (2, "a", 20),
            (3, "b", 30),
            (4, "b", 40),
            (5, "b", 50),
        ] {
            run(
                engine,
                planner,
                "INSERT INTO t(id, grp, v) VALUES (?, ?, ?)",
                vec![
                    SqlValue::Long(id),
                    SqlValue::String(grp.into()),
                    SqlValue::Long(v),
                ],
            );
        }
    }

    #[test]
    fn insert_then_filtered_scan() {
        let (engine, planner) = engine_with_table();
        seed(&engine, &planner);
        let rows = rows_of(run(
            &engine,
            &planner,
            "SELECT id FROM t WHERE v >= 30 ORDER BY id",
            vec![],
        ));
        let ids: Vec<SqlValue> = rows.into_iter().map(|mut r| r.remove(0)).collect();
        assert_eq!(
            ids,
            vec![SqlValue::Integer(3), SqlValue::Integer(4), SqlValue::Integer(5)]
        );
    }

    #[test]
    fn insert_returns_encoded_primary_key() {
        let (engine, planner) = engine_with_table();
        let tq = planner
            .translate(
                "ts1",
                "INSERT INTO t(id, grp, v) VALUES (9, 'z', 1)",
                vec![],
                false,
                true,
                true,
                0,
            )
            .unwrap();
        let result = engine
            .execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION)
            .unwrap();
        match result {
            ExecutionResult::Dml { update_count, key } => {
                assert_eq!(update_count, 1);
                let schema = engine.table_schema("ts1", "t").unwrap();
                let decoded = crate::model::decode_key(&schema, &key.unwrap()).unwrap();
                assert_eq!(decoded, vec![("id".to_string(), SqlValue::Integer(9))]);
            }
            _ => panic!("expected a DML result"),
        }
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let (engine, planner) = engine_with_table();
        seed(&engine, &planner);
        let tq = planner
            .translate(
                "ts1",
                "INSERT INTO t(id) VALUES (1)",
                vec![],
                false,
                true,
                true,
                0,
            )
            .unwrap();
        let result =
            engine.execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION);
        assert!(result.is_err());
    }

    #[test]
    fn group_by_aggregates_compute() {
        let (engine, planner) = engine_with_table();
        seed(&engine, &planner);
        let mut rows = rows_of(run(
            &engine,
            &planner,
            "SELECT grp, count(*), sum(v), min(v), max(v) FROM t GROUP BY grp",
            vec![],
        ));
        rows.sort_by(|a, b| a[0].compare(&b[0]));
        assert_eq!(
            rows[0],
            vec![
                SqlValue::String("a".into()),
                SqlValue::Long(2),
                SqlValue::Long(30),
                SqlValue::Long(10),
                SqlValue::Long(20),
            ]
        );
        assert_eq!(
            rows[1],
            vec![
                SqlValue::String("b".into()),
                SqlValue::Long(3),
                SqlValue::Long(120),
                SqlValue::Long(30),
                SqlValue::Long(50),
            ]
        );
    }

    #[test]
    fn update_and_delete_mutate_rows() {
        let (engine, planner) = engine_with_table();
        seed(&engine, &planner);

        let tq = planner
            .translate(
                "ts1",
                "UPDATE t SET v = v + 1 WHERE grp = 'a'",
                vec![],
                false,
                true,
                true,
                0,
            )
            .unwrap();
        match engine
            .execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION)
            .unwrap()
        {
            ExecutionResult::Dml { update_count, .. } => assert_eq!(update_count, 2),
            _ => panic!("expected a DML result"),
        }
        let rows = rows_of(run(
            &engine,
            &planner,
            "SELECT v FROM t WHERE grp = 'a' ORDER BY v",
            vec![],
        ));
        assert_eq!(rows, vec![vec![SqlValue::Long(11)], vec![SqlValue::Long(21)]]);

        let tq = planner
            .translate(
                "ts1",
                "DELETE FROM t WHERE v > ?",
                vec![SqlValue::Long(30)],
                false,
                true,
                true,
                0,
            )
            .unwrap();
        match engine
            .execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION)
            .unwrap()
        {
            ExecutionResult::Dml { update_count, .. } => assert_eq!(update_count, 2),
            _ => panic!("expected a DML result"),
        }
        let rows = rows_of(run(&engine, &planner, "SELECT id FROM t", vec![]));
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn alter_add_column_pads_existing_rows() {
        let (engine, planner) = engine_with_table();
        seed(&engine, &planner);
        let tq = planner
            .translate(
                "ts1",
                "ALTER TABLE t ADD COLUMN extra bigint",
                vec![],
                false,
                true,
                true,
                0,
            )
            .unwrap();
        engine
            .execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION)
            .unwrap();
        let rows = rows_of(run(&engine, &planner, "SELECT extra FROM t", vec![]));
        assert!(rows.iter().all(|r| r[0].is_null()));
    }

    #[test]
    fn truncate_clears_rows() {
        let (engine, planner) = engine_with_table();
        seed(&engine, &planner);
        let tq = planner
            .translate("ts1", "TRUNCATE TABLE t", vec![], false, true, true, 0)
            .unwrap();
        engine
            .execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION)
            .unwrap();
        let rows = rows_of(run(&engine, &planner, "SELECT * FROM t", vec![]));
        assert!(rows.is_empty());
    }

    #[test]
    fn follower_answers_with_not_leader() {
        let (engine, planner) = engine_with_table();
        engine.set_leader("ts1", false);
        let tq = planner
            .translate("ts1", "BEGIN", vec![], false, true, true, 0)
            .unwrap();
        let result =
            engine.execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION);
        assert!(matches!(result, Err(EngineError::NotLeader { .. })));
    }

    #[test]
    fn get_statement_finds_a_record() {
        let (engine, planner) = engine_with_table();
        seed(&engine, &planner);
        let tq = planner
            .translate(
                "ts1",
                "SELECT * FROM t WHERE id = ?",
                vec![SqlValue::Long(3)],
                false,
                true,
                true,
                0,
            )
            .unwrap();
        assert!(tq.plan.root.is_none());
        match engine
            .execute_plan(&tq.plan, &tq.context, TransactionContext::NO_TRANSACTION)
            .unwrap()
        {
            ExecutionResult::Get { record } => {
                let record = record.unwrap();
                assert_eq!(record.get("grp"), Some(&SqlValue::String("b".into())));
            }
            _ => panic!("expected a get result"),
        }
    }
}
