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

// Full planning pipeline: root schema from engine metadata, parse with the
// MySQL dialect, validate names and types, build the physical tree, and
// lower it recursively into the internal operator algebra.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    Assignment, AssignmentTarget, Expr, Function, FunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, ObjectName, Query, Select, SelectItem, SetExpr,
    Statement as AstStatement, TableFactor, TableWithJoins, Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::model::{Column, ColumnType, SqlValue, Table};
use crate::sql::expr::{CompiledExpr, ExprCompiler};
use crate::sql::fallback::FallbackPlanner;
use crate::sql::plan::{
    DeleteStatement, EvaluationContext, ExecutionPlan, GetStatement, InsertStatement, PlanOp,
    ScanStatement, Statement, UpdateStatement,
};
use crate::sql::{CacheStats, PlannerError, PlannerMetadata, TranslatedQuery};

// ---------------------------------------------------------------------------
// Fast-path routing
// ---------------------------------------------------------------------------

const FAST_PATH_PREFIXES: &[&str] = &[
    "CREATE", "DROP", "EXECUTE", "ALTER", "BEGIN", "COMMIT", "ROLLBACK", "TRUNCATE",
];

/// Static prefix check routing DDL, transaction control, EXECUTE, and
/// TRUNCATE to the fallback planner. Case-sensitive uppercase on the raw
/// query, matching the incoming convention; no trimming.
pub fn is_fast_path(query: &str) -> bool {
    FAST_PATH_PREFIXES.iter().any(|p| query.starts_with(p))
}

// ---------------------------------------------------------------------------
// Logical SQL types and the type mapping
// ---------------------------------------------------------------------------

/// Logical SQL types the planner works with during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    Varchar,
    Boolean,
    Integer,
    Bigint,
    Varbinary,
    Timestamp,
    Null,
    Any,
    /// Any SQL type outside the supported set; naming it keeps rejection
    /// messages useful.
    Other(String),
}

/// Forward mapping: planner SQL type → engine type code. Total on the
/// enumerated set, a planning failure outside it (TIMESTAMP included: it
/// only round-trips on exposure).
pub fn logical_to_code(t: &SqlType) -> Result<ColumnType, PlannerError> {
    match t {
        SqlType::Varchar => Ok(ColumnType::String),
        SqlType::Boolean => Ok(ColumnType::Boolean),
        SqlType::Integer => Ok(ColumnType::Integer),
        SqlType::Bigint => Ok(ColumnType::Long),
        SqlType::Varbinary => Ok(ColumnType::Bytearray),
        SqlType::Null => Ok(ColumnType::Null),
        SqlType::Any => Ok(ColumnType::Any),
        SqlType::Timestamp => Err(PlannerError::Statement(
            "unsupported SQL type TIMESTAMP".into(),
        )),
        SqlType::Other(name) => Err(PlannerError::Statement(format!(
            "unsupported SQL type {name}"
        ))),
    }
}

/// Reverse mapping for schema exposure: engine type code → planner SQL type.
/// Same table plus TIMESTAMP; unknown codes are exposed as ANY.
pub fn expose_type(code: u8) -> SqlType {
    match ColumnType::from_code(code) {
        Some(ColumnType::String) => SqlType::Varchar,
        Some(ColumnType::Boolean) => SqlType::Boolean,
        Some(ColumnType::Integer) => SqlType::Integer,
        Some(ColumnType::Long) => SqlType::Bigint,
        Some(ColumnType::Bytearray) => SqlType::Varbinary,
        Some(ColumnType::Timestamp) => SqlType::Timestamp,
        Some(ColumnType::Null) => SqlType::Null,
        Some(ColumnType::Any) | None => SqlType::Any,
    }
}

/// Map a parsed SQL column type (CREATE TABLE, ALTER TABLE) to an engine
/// type code. Anything outside the supported set is a planning failure.
pub fn map_data_type(dt: &sqlparser::ast::DataType) -> Result<ColumnType, PlannerError> {
    use sqlparser::ast::DataType;
    match dt {
        DataType::Varchar(_)
        | DataType::CharVarying(_)
        | DataType::Text
        | DataType::String(_) => Ok(ColumnType::String),
        DataType::Boolean => Ok(ColumnType::Boolean),
        DataType::Int(_) | DataType::Integer(_) => Ok(ColumnType::Integer),
        DataType::BigInt(_) => Ok(ColumnType::Long),
        DataType::Varbinary(_) | DataType::Blob(_) => Ok(ColumnType::Bytearray),
        DataType::Timestamp(_, _) => Ok(ColumnType::Timestamp),
        other => Err(PlannerError::Statement(format!(
            "unsupported SQL type {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Schema catalog
// ---------------------------------------------------------------------------

/// One table as the planner sees it: the engine schema plus the logical
/// type of each column.
#[derive(Debug, Clone)]
struct CatalogTable {
    table: Table,
    logical: Vec<SqlType>,
}

impl CatalogTable {
    fn schema_map(&self) -> HashMap<String, usize> {
        self.table.schema_map()
    }

    fn logical_of(&self, index: usize) -> SqlType {
        self.logical
            .get(index)
            .cloned()
            .unwrap_or(SqlType::Any)
    }
}

/// Root schema built from the engine's current local table-spaces; one
/// child schema per table-space, tables exposed by name.
struct SchemaCatalog {
    spaces: HashMap<String, HashMap<String, CatalogTable>>,
}

impl SchemaCatalog {
    fn resolve(
        &self,
        default_table_space: &str,
        name: &ObjectName,
    ) -> Result<&CatalogTable, PlannerError> {
        let parts: Vec<String> = name.0.iter().map(|i| i.value.to_lowercase()).collect();
        let (space, table) = match parts.as_slice() {
            [table] => (default_table_space.to_lowercase(), table.clone()),
            [space, table] => (space.clone(), table.clone()),
            _ => {
                return Err(PlannerError::Statement(format!(
                    "invalid table reference '{name}'"
                )))
            }
        };
        let tables = self.spaces.get(&space).ok_or_else(|| {
            PlannerError::Statement(format!("table-space '{space}' not found"))
        })?;
        tables.get(&table).ok_or_else(|| {
            PlannerError::Statement(format!(
                "table '{table}' not found in table-space '{space}'"
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Physical plan
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AggCall {
    function: String,
    /// Input field indices the function consumes; empty for COUNT(*).
    args: Vec<usize>,
    name: String,
    out_type: SqlType,
}

#[derive(Debug)]
enum ModifyKind {
    Insert,
    Update {
        columns: Vec<String>,
        exprs: Vec<Expr>,
    },
    Delete,
}

/// Physical operator tree produced by validation; the lowering step
/// translates it into the internal algebra so no physical node survives.
#[derive(Debug)]
enum PhysNode {
    TableScan {
        table: CatalogTable,
    },
    Filter {
        input: Box<PhysNode>,
        predicate: Expr,
    },
    Project {
        input: Box<PhysNode>,
        items: Vec<(Expr, String, SqlType)>,
    },
    Sort {
        input: Box<PhysNode>,
        /// (input field index, ascending)
        keys: Vec<(usize, bool)>,
    },
    Limit {
        input: Box<PhysNode>,
        fetch: Option<Expr>,
        offset: Option<Expr>,
    },
    Aggregate {
        input: Box<PhysNode>,
        group_fields: Vec<usize>,
        calls: Vec<AggCall>,
    },
    Values {
        columns: Vec<Column>,
        rows: Vec<Vec<Expr>>,
    },
    TableModify {
        table: CatalogTable,
        kind: ModifyKind,
        input: Box<PhysNode>,
        return_values: bool,
    },
    /// Engine-interpreted wrapper; lowering passes through to the child.
    #[allow(dead_code)]
    Interpreter {
        input: Box<PhysNode>,
    },
}

impl PhysNode {
    /// Output fields as (name, logical type) pairs.
    fn output_fields(&self) -> Vec<(String, SqlType)> {
        match self {
            PhysNode::TableScan { table } => table
                .table
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| (c.name.to_lowercase(), table.logical_of(i)))
                .collect(),
            PhysNode::Filter { input, .. } => input.output_fields(),
            PhysNode::Project { items, .. } => items
                .iter()
                .map(|(_, name, t)| (name.clone(), t.clone()))
                .collect(),
            PhysNode::Sort { input, .. } => input.output_fields(),
            PhysNode::Limit { input, .. } => input.output_fields(),
            PhysNode::Aggregate {
                input,
                group_fields,
                calls,
            } => {
                let in_fields = input.output_fields();
                let mut out: Vec<(String, SqlType)> = group_fields
                    .iter()
                    .map(|i| in_fields[*i].clone())
                    .collect();
                for call in calls {
                    out.push((call.name.clone(), call.out_type.clone()));
                }
                out
            }
            PhysNode::Values { columns, .. } => columns
                .iter()
                .map(|c| (c.name.clone(), expose_type(c.ctype.code())))
                .collect(),
            PhysNode::TableModify { .. } => Vec::new(),
            PhysNode::Interpreter { input } => input.output_fields(),
        }
    }

    fn shape_name(&self) -> &'static str {
        match self {
            PhysNode::TableScan { .. } => "TableScan",
            PhysNode::Filter { .. } => "Filter",
            PhysNode::Project { .. } => "Project",
            PhysNode::Sort { .. } => "Sort",
            PhysNode::Limit { .. } => "Limit",
            PhysNode::Aggregate { .. } => "Aggregate",
            PhysNode::Values { .. } => "Values",
            PhysNode::TableModify { .. } => "TableModify",
            PhysNode::Interpreter { .. } => "Interpreter",
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Stateless per-query SQL → plan translator. Holds engine metadata for
/// schema resolution and the fallback planner with its statement cache.
pub struct Planner {
    metadata: Arc<dyn PlannerMetadata>,
    fallback: FallbackPlanner,
}

impl Planner {
    pub fn new(metadata: Arc<dyn PlannerMetadata>) -> Planner {
        Planner {
            metadata,
            fallback: FallbackPlanner::new(),
        }
    }

    /// Aggregated statement-cache counters, including the fallback's cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.fallback.cache_stats()
    }

    /// Translate SQL text into a `TranslatedQuery`.
    ///
    /// Queries beginning with a DDL / transaction-control / EXECUTE /
    /// TRUNCATE prefix are delegated to the fallback planner unchanged;
    /// everything else runs the full pipeline.
    pub fn translate(
        &self,
        default_table_space: &str,
        query: &str,
        params: Vec<SqlValue>,
        wants_scan: bool,
        allow_cache: bool,
        return_values: bool,
        max_rows: i64,
    ) -> Result<TranslatedQuery, PlannerError> {
        if is_fast_path(query) {
            return self
                .fallback
                .plan(default_table_space, query, params, allow_cache);
        }

        let catalog = self.build_catalog();
        let stmt = parse_single(query)?;

        let (main, root) = match &stmt {
            AstStatement::Query(q) => {
                let phys = self.build_query(&catalog, default_table_space, q)?;
                let root = self.lower(&phys, return_values)?;
                let main = scan_statement_for(&root).ok_or_else(|| {
                    PlannerError::UnsupportedPlan(phys.shape_name().to_string())
                })?;
                (Statement::Scan(main), root)
            }
            AstStatement::Insert(insert) => {
                let phys = self.build_insert(&catalog, default_table_space, insert)?;
                let root = self.lower(&phys, return_values)?;
                let main = match &root {
                    PlanOp::Insert {
                        table_space,
                        table,
                        return_values,
                        ..
                    } => Statement::Insert(InsertStatement {
                        table_space: table_space.clone(),
                        table: table.clone(),
                        return_values: *return_values,
                    }),
                    _ => unreachable!("insert lowering produced a non-insert root"),
                };
                (main, root)
            }
            AstStatement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                let phys =
                    self.build_update(&catalog, default_table_space, table, assignments, selection)?;
                let root = self.lower(&phys, return_values)?;
                let main = match &root {
                    PlanOp::Update { statement } => Statement::Update(statement.clone()),
                    _ => unreachable!("update lowering produced a non-update root"),
                };
                (main, root)
            }
            AstStatement::Delete(delete) => {
                let phys = self.build_delete(&catalog, default_table_space, delete)?;
                let root = self.lower(&phys, return_values)?;
                let main = match &root {
                    PlanOp::Delete { statement } => Statement::Delete(statement.clone()),
                    _ => unreachable!("delete lowering produced a non-delete root"),
                };
                (main, root)
            }
            other => {
                return Err(PlannerError::Statement(format!(
                    "unsupported statement: {other}"
                )))
            }
        };

        let root = if max_rows > 0 && main.is_scan() {
            PlanOp::Limit {
                input: Box::new(root),
                fetch: Some(CompiledExpr::Constant(SqlValue::Long(max_rows))),
                offset: None,
            }
        } else {
            root
        };

        root.validate()?;
        let plan = ExecutionPlan::planned(main, root).optimize();
        let plan = if wants_scan {
            plan
        } else {
            try_rewrite_get(plan, &catalog)
        };

        Ok(TranslatedQuery {
            plan: Arc::new(plan),
            context: EvaluationContext::new(query, params),
        })
    }

    /// Build the root schema from the engine's local table-spaces.
    fn build_catalog(&self) -> SchemaCatalog {
        let mut spaces = HashMap::new();
        for space in self.metadata.local_table_spaces() {
            let mut tables = HashMap::new();
            for table in self.metadata.tables_for_planner(&space) {
                let logical = table
                    .columns
                    .iter()
                    .map(|c| expose_type(c.ctype.code()))
                    .collect();
                tables.insert(
                    table.name.to_lowercase(),
                    CatalogTable { table, logical },
                );
            }
            spaces.insert(space.to_lowercase(), tables);
        }
        SchemaCatalog { spaces }
    }

    // -----------------------------------------------------------------------
    // Physical tree construction (parse results → validated tree)
    // -----------------------------------------------------------------------

    fn build_query(
        &self,
        catalog: &SchemaCatalog,
        default_ts: &str,
        query: &Query,
    ) -> Result<PhysNode, PlannerError> {
        if query.with.is_some() {
            return Err(PlannerError::UnsupportedPlan("WITH".into()));
        }
        let select = match query.body.as_ref() {
            SetExpr::Select(s) => s,
            other => {
                return Err(PlannerError::UnsupportedPlan(format!(
                    "query body {other}"
                )))
            }
        };

        let mut node = self.build_select(catalog, default_ts, select)?;

        // ORDER BY resolves against the node's output fields.
        if let Some(order_by) = &query.order_by {
            let fields = node.output_fields();
            let mut keys = Vec::with_capacity(order_by.exprs.len());
            for ob in &order_by.exprs {
                let index = match &ob.expr {
                    Expr::Identifier(ident) => {
                        let name = ident.value.to_lowercase();
                        fields.iter().position(|(f, _)| *f == name).ok_or_else(|| {
                            PlannerError::Statement(format!(
                                "ORDER BY column '{name}' not found"
                            ))
                        })?
                    }
                    Expr::Value(Value::Number(n, _)) => {
                        let pos = n.parse::<usize>().map_err(|_| {
                            PlannerError::Statement(format!("invalid ORDER BY position {n}"))
                        })?;
                        if pos == 0 || pos > fields.len() {
                            return Err(PlannerError::Statement(format!(
                                "ORDER BY position {pos} out of range (1-{})",
                                fields.len()
                            )));
                        }
                        pos - 1
                    }
                    other => {
                        return Err(PlannerError::Statement(format!(
                            "unsupported ORDER BY expression: {other}"
                        )))
                    }
                };
                keys.push((index, ob.asc.unwrap_or(true)));
            }
            node = PhysNode::Sort {
                input: Box::new(node),
                keys,
            };
        }

        if query.limit.is_some() || query.offset.is_some() {
            node = PhysNode::Limit {
                input: Box::new(node),
                fetch: query.limit.clone(),
                offset: query.offset.as_ref().map(|o| o.value.clone()),
            };
        }

        Ok(node)
    }

    fn build_select(
        &self,
        catalog: &SchemaCatalog,
        default_ts: &str,
        select: &Select,
    ) -> Result<PhysNode, PlannerError> {
        if select.distinct.is_some() {
            return Err(PlannerError::UnsupportedPlan("DISTINCT".into()));
        }
        let table = resolve_from(catalog, default_ts, &select.from)?;
        let mut node = PhysNode::TableScan {
            table: table.clone(),
        };
        let schema = table.schema_map();

        if let Some(predicate) = &select.selection {
            let cond_type = infer_sql_type(predicate, &node)?;
            if !matches!(cond_type, SqlType::Boolean | SqlType::Any) {
                return Err(PlannerError::Statement(
                    "WHERE clause is not a condition".into(),
                ));
            }
            node = PhysNode::Filter {
                input: Box::new(node),
                predicate: predicate.clone(),
            };
        }

        let group_fields = self.group_fields(&select.group_by, &schema)?;
        let has_aggregates = select.projection.iter().any(|item| match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                is_aggregate(e)
            }
            _ => false,
        });

        if !group_fields.is_empty() || has_aggregates {
            return self.build_aggregate(node, select, group_fields);
        }

        if select.having.is_some() {
            return Err(PlannerError::Statement(
                "HAVING requires GROUP BY or aggregates".into(),
            ));
        }

        // Identity projection (`SELECT *`) keeps the scan output as-is.
        if is_identity_projection(&select.projection) {
            return Ok(node);
        }

        let mut items = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            let (expr, name) = projection_item(item)?;
            let out_type = infer_sql_type(&expr, &node)?;
            items.push((expr, name, out_type));
        }
        Ok(PhysNode::Project {
            input: Box::new(node),
            items,
        })
    }

    /// GROUP BY + aggregates. Output convention of the aggregate node:
    /// group-key fields first (in GROUP BY order), then one field per call.
    /// A reordering projection is added when the SELECT order differs.
    fn build_aggregate(
        &self,
        input: PhysNode,
        select: &Select,
        group_fields: Vec<usize>,
    ) -> Result<PhysNode, PlannerError> {
        if select.having.is_some() {
            return Err(PlannerError::UnsupportedPlan("Aggregate with HAVING".into()));
        }

        let in_fields = input.output_fields();
        let mut calls: Vec<AggCall> = Vec::new();
        // For each SELECT item: Err(key position in group_fields) is a key
        // reference, Ok(call position) an aggregate output.
        let mut select_slots: Vec<(usize, bool)> = Vec::new(); // (slot, is_key)

        for item in &select.projection {
            let (expr, name) = projection_item(item)?;
            match &expr {
                Expr::Function(func) if is_aggregate_fn(func) => {
                    let (function, args, out_type) = self.aggregate_call(func, &in_fields)?;
                    calls.push(AggCall {
                        function,
                        args,
                        name,
                        out_type,
                    });
                    select_slots.push((calls.len() - 1, false));
                }
                Expr::Identifier(ident) => {
                    let lower = ident.value.to_lowercase();
                    let index = in_fields
                        .iter()
                        .position(|(f, _)| *f == lower)
                        .ok_or_else(|| {
                            PlannerError::Statement(format!("column '{lower}' not found"))
                        })?;
                    let key_pos =
                        group_fields.iter().position(|g| *g == index).ok_or_else(|| {
                            PlannerError::Statement(format!(
                                "column '{lower}' must appear in GROUP BY or an aggregate"
                            ))
                        })?;
                    select_slots.push((key_pos, true));
                }
                other => {
                    return Err(PlannerError::Statement(format!(
                        "unsupported expression with GROUP BY: {other}"
                    )))
                }
            }
        }

        let key_count = group_fields.len();
        let agg = PhysNode::Aggregate {
            input: Box::new(input),
            group_fields,
            calls,
        };

        // Aggregate output order is keys-then-calls; reproject if SELECT
        // order differs.
        let natural: Vec<(usize, bool)> = (0..key_count)
            .map(|i| (i, true))
            .chain((0..agg_call_count(&agg)).map(|i| (i, false)))
            .collect();
        if select_slots == natural {
            return Ok(agg);
        }

        let agg_fields = agg.output_fields();
        let items = select_slots
            .iter()
            .map(|(slot, is_key)| {
                let index = if *is_key { *slot } else { key_count + *slot };
                let (name, t) = agg_fields[index].clone();
                (
                    Expr::Identifier(sqlparser::ast::Ident::new(name.clone())),
                    name,
                    t,
                )
            })
            .collect();
        Ok(PhysNode::Project {
            input: Box::new(agg),
            items,
        })
    }

    fn aggregate_call(
        &self,
        func: &Function,
        in_fields: &[(String, SqlType)],
    ) -> Result<(String, Vec<usize>, SqlType), PlannerError> {
        let name = function_name(func);
        let args = aggregate_args(func)?;
        let mut indices = Vec::with_capacity(args.len());
        for arg in &args {
            match arg {
                Expr::Identifier(ident) => {
                    let lower = ident.value.to_lowercase();
                    let index = in_fields
                        .iter()
                        .position(|(f, _)| *f == lower)
                        .ok_or_else(|| {
                            PlannerError::Statement(format!("column '{lower}' not found"))
                        })?;
                    indices.push(index);
                }
                other => {
                    return Err(PlannerError::Statement(format!(
                        "unsupported aggregate argument: {other}"
                    )))
                }
            }
        }
        let out_type = match name.as_str() {
            "count" => SqlType::Bigint,
            "sum" => SqlType::Bigint,
            "min" | "max" => indices
                .first()
                .map(|i| in_fields[*i].1.clone())
                .unwrap_or(SqlType::Any),
            other => {
                return Err(PlannerError::Statement(format!(
                    "unsupported aggregate function '{other}'"
                )))
            }
        };
        if name != "count" && indices.is_empty() {
            return Err(PlannerError::Statement(format!(
                "aggregate '{name}' requires a column argument"
            )));
        }
        Ok((name, indices, out_type))
    }

    fn group_fields(
        &self,
        group_by: &GroupByExpr,
        schema: &HashMap<String, usize>,
    ) -> Result<Vec<usize>, PlannerError> {
        match group_by {
            GroupByExpr::All(_) => Err(PlannerError::Statement("GROUP BY ALL not supported".into())),
            GroupByExpr::Expressions(exprs, _) => {
                let mut fields = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    match expr {
                        Expr::Identifier(ident) => {
                            let lower = ident.value.to_lowercase();
                            let index = schema.get(&lower).ok_or_else(|| {
                                PlannerError::Statement(format!(
                                    "GROUP BY column '{lower}' not found"
                                ))
                            })?;
                            fields.push(*index);
                        }
                        other => {
                            return Err(PlannerError::Statement(format!(
                                "unsupported GROUP BY expression: {other}"
                            )))
                        }
                    }
                }
                Ok(fields)
            }
        }
    }

    fn build_insert(
        &self,
        catalog: &SchemaCatalog,
        default_ts: &str,
        insert: &sqlparser::ast::Insert,
    ) -> Result<PhysNode, PlannerError> {
        let table = catalog.resolve(default_ts, &insert.table_name)?.clone();

        // Target column list: explicit subset, or the full schema.
        let columns: Vec<Column> = if insert.columns.is_empty() {
            table.table.columns.clone()
        } else {
            insert
                .columns
                .iter()
                .map(|ident| {
                    let lower = ident.value.to_lowercase();
                    table
                        .table
                        .columns
                        .iter()
                        .find(|c| c.name.to_lowercase() == lower)
                        .cloned()
                        .ok_or_else(|| {
                            PlannerError::Statement(format!(
                                "column '{lower}' not found in table '{}'",
                                table.table.name
                            ))
                        })
                })
                .collect::<Result<_, _>>()?
        };

        let source = insert.source.as_ref().ok_or_else(|| {
            PlannerError::Statement("INSERT requires a VALUES source".into())
        })?;
        let rows = match source.body.as_ref() {
            SetExpr::Values(values) => {
                for (i, row) in values.rows.iter().enumerate() {
                    if row.len() != columns.len() {
                        return Err(PlannerError::Statement(format!(
                            "INSERT row #{i} has {} values, expected {}",
                            row.len(),
                            columns.len()
                        )));
                    }
                }
                values.rows.clone()
            }
            other => {
                return Err(PlannerError::UnsupportedPlan(format!(
                    "INSERT from {other}"
                )))
            }
        };

        Ok(PhysNode::TableModify {
            table,
            kind: ModifyKind::Insert,
            input: Box::new(PhysNode::Values { columns, rows }),
            return_values: false, // filled at lowering from the translate flag
        })
    }

    fn build_update(
        &self,
        catalog: &SchemaCatalog,
        default_ts: &str,
        table: &TableWithJoins,
        assignments: &[Assignment],
        selection: &Option<Expr>,
    ) -> Result<PhysNode, PlannerError> {
        if !table.joins.is_empty() {
            return Err(PlannerError::UnsupportedPlan("UPDATE with JOIN".into()));
        }
        let table = match &table.relation {
            TableFactor::Table { name, .. } => catalog.resolve(default_ts, name)?.clone(),
            other => {
                return Err(PlannerError::UnsupportedPlan(format!(
                    "UPDATE target {other}"
                )))
            }
        };

        let mut columns = Vec::with_capacity(assignments.len());
        let mut exprs = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let name = assignment_column(&assignment.target)?;
            if table.table.column_index(&name).is_none() {
                return Err(PlannerError::Statement(format!(
                    "column '{name}' not found in table '{}'",
                    table.table.name
                )));
            }
            columns.push(name);
            exprs.push(assignment.value.clone());
        }

        let scan = PhysNode::TableScan {
            table: table.clone(),
        };
        let input = match selection {
            Some(predicate) => PhysNode::Filter {
                input: Box::new(scan),
                predicate: predicate.clone(),
            },
            None => scan,
        };
        Ok(PhysNode::TableModify {
            table,
            kind: ModifyKind::Update { columns, exprs },
            input: Box::new(input),
            return_values: false,
        })
    }

    fn build_delete(
        &self,
        catalog: &SchemaCatalog,
        default_ts: &str,
        delete: &sqlparser::ast::Delete,
    ) -> Result<PhysNode, PlannerError> {
        use sqlparser::ast::FromTable;
        let from = match &delete.from {
            FromTable::WithFromKeyword(v) | FromTable::WithoutKeyword(v) => v,
        };
        let table = resolve_from(catalog, default_ts, from)?;
        let scan = PhysNode::TableScan {
            table: table.clone(),
        };
        let input = match &delete.selection {
            Some(predicate) => PhysNode::Filter {
                input: Box::new(scan),
                predicate: predicate.clone(),
            },
            None => scan,
        };
        Ok(PhysNode::TableModify {
            table,
            kind: ModifyKind::Delete,
            input: Box::new(input),
            return_values: false,
        })
    }

    // -----------------------------------------------------------------------
    // Lowering: physical tree → internal operator algebra
    // -----------------------------------------------------------------------

    /// Recursive total function over the physical tree, with an explicit
    /// rejection arm per unsupported shape. Parameter numbering is threaded
    /// through `params` in textual order.
    fn lower(&self, node: &PhysNode, return_values: bool) -> Result<PlanOp, PlannerError> {
        let mut params = 0usize;
        self.lower_node(node, return_values, &mut params)
    }

    fn lower_node(
        &self,
        node: &PhysNode,
        return_values: bool,
        params: &mut usize,
    ) -> Result<PlanOp, PlannerError> {
        match node {
            PhysNode::TableScan { table } => Ok(lower_scan(table)),

            PhysNode::Filter { input, predicate } => {
                let schema = fields_map(&input.output_fields());
                let lowered = self.lower_node(input, return_values, params)?;
                let condition = compile_with(&schema, params, predicate)?;
                Ok(PlanOp::Filter {
                    input: Box::new(lowered),
                    condition,
                })
            }

            PhysNode::Project { input, items } => {
                // Projection items precede the WHERE clause in statement
                // text, so they claim their parameter positions first.
                let schema = fields_map(&input.output_fields());
                let mut field_names = Vec::with_capacity(items.len());
                let mut columns = Vec::with_capacity(items.len());
                let mut exprs = Vec::with_capacity(items.len());
                for (expr, name, out_type) in items {
                    let code = logical_to_code(out_type)?;
                    field_names.push(name.clone());
                    columns.push(Column::new(name.clone(), code));
                    exprs.push(compile_with(&schema, params, expr)?);
                }
                let lowered = self.lower_node(input, return_values, params)?;
                Ok(PlanOp::Project {
                    input: Box::new(lowered),
                    field_names,
                    columns,
                    exprs,
                })
            }

            PhysNode::Sort { input, keys } => {
                let lowered = self.lower_node(input, return_values, params)?;
                Ok(PlanOp::Sort {
                    input: Box::new(lowered),
                    directions: keys.iter().map(|(_, asc)| *asc).collect(),
                    fields: keys.iter().map(|(i, _)| *i).collect(),
                })
            }

            PhysNode::Limit {
                input,
                fetch,
                offset,
            } => {
                let schema = fields_map(&input.output_fields());
                let lowered = self.lower_node(input, return_values, params)?;
                let fetch = fetch
                    .as_ref()
                    .map(|e| compile_with(&schema, params, e))
                    .transpose()?;
                let offset = offset
                    .as_ref()
                    .map(|e| compile_with(&schema, params, e))
                    .transpose()?;
                Ok(PlanOp::Limit {
                    input: Box::new(lowered),
                    fetch,
                    offset,
                })
            }

            PhysNode::Aggregate {
                input,
                group_fields,
                calls,
            } => {
                let in_fields = input.output_fields();
                let lowered = self.lower_node(input, return_values, params)?;
                let mut field_names: Vec<String> = group_fields
                    .iter()
                    .map(|i| in_fields[*i].0.clone())
                    .collect();
                let mut columns: Vec<Column> = Vec::with_capacity(field_names.len() + calls.len());
                for i in group_fields {
                    columns.push(Column::new(
                        in_fields[*i].0.clone(),
                        logical_to_code(&in_fields[*i].1)?,
                    ));
                }
                let mut functions = Vec::with_capacity(calls.len());
                let mut arguments = Vec::with_capacity(calls.len());
                for call in calls {
                    field_names.push(call.name.clone());
                    columns.push(Column::new(call.name.clone(), logical_to_code(&call.out_type)?));
                    functions.push(call.function.clone());
                    arguments.push(call.args.clone());
                }
                Ok(PlanOp::Aggregate {
                    input: Box::new(lowered),
                    field_names,
                    columns,
                    functions,
                    arguments,
                    group_fields: group_fields.clone(),
                })
            }

            PhysNode::Values { columns, rows } => {
                // VALUES rows reference no input fields; only literals and
                // parameters are meaningful here.
                let empty = HashMap::new();
                let mut compiled_rows = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut compiled = Vec::with_capacity(row.len());
                    for expr in row {
                        compiled.push(compile_with(&empty, params, expr)?);
                    }
                    compiled_rows.push(compiled);
                }
                Ok(PlanOp::Values {
                    node_id: self.metadata.node_id(),
                    field_names: columns.iter().map(|c| c.name.clone()).collect(),
                    columns: columns.clone(),
                    rows: compiled_rows,
                })
            }

            PhysNode::TableModify {
                table,
                kind,
                input,
                return_values: _,
            } => self.lower_modify(table, kind, input, return_values, params),

            PhysNode::Interpreter { input } => self.lower_node(input, return_values, params),
        }
    }

    fn lower_modify(
        &self,
        table: &CatalogTable,
        kind: &ModifyKind,
        input: &PhysNode,
        return_values: bool,
        params: &mut usize,
    ) -> Result<PlanOp, PlannerError> {
        let table_space = table.table.table_space.clone();
        let table_name = table.table.name.clone();
        match kind {
            ModifyKind::Insert => {
                let lowered = self.lower_node(input, return_values, params)?;
                Ok(PlanOp::Insert {
                    table_space,
                    table: table_name,
                    input: Box::new(lowered),
                    return_values,
                })
            }

            ModifyKind::Delete => {
                let predicate = self.modify_predicate(table, input, params, false)?;
                Ok(PlanOp::Delete {
                    statement: DeleteStatement {
                        table_space,
                        table: table_name,
                        predicate,
                    },
                })
            }

            ModifyKind::Update { columns, exprs } => {
                // SET expressions precede the WHERE clause in statement
                // text; compile them first for parameter numbering.
                let schema = table.schema_map();
                let mut compiled = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    compiled.push(compile_with(&schema, params, expr)?);
                }
                let predicate = self.modify_predicate(table, input, params, true)?;
                Ok(PlanOp::Update {
                    statement: UpdateStatement {
                        table_space,
                        table: table_name,
                        columns: columns.clone(),
                        expressions: compiled,
                        predicate,
                    },
                })
            }
        }
    }

    /// Extract the predicate from the allowed DML input shapes.
    ///
    /// DELETE accepts `TableScan` and `Filter(TableScan)`. UPDATE also
    /// accepts `Project` over those (and over a filtered scan), since an
    /// update's new-value computation may be modeled as a projection.
    fn modify_predicate(
        &self,
        table: &CatalogTable,
        input: &PhysNode,
        params: &mut usize,
        allow_project: bool,
    ) -> Result<Option<CompiledExpr>, PlannerError> {
        let schema = table.schema_map();
        match input {
            PhysNode::TableScan { .. } => Ok(None),
            PhysNode::Filter {
                input: inner,
                predicate,
            } => match inner.as_ref() {
                PhysNode::TableScan { .. } => {
                    Ok(Some(compile_with(&schema, params, predicate)?))
                }
                other => Err(PlannerError::UnsupportedPlan(format!(
                    "Filter({})",
                    other.shape_name()
                ))),
            },
            PhysNode::Project { input: inner, .. } if allow_project => {
                self.modify_predicate(table, inner, params, false)
            }
            other => Err(PlannerError::UnsupportedPlan(other.shape_name().to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_single(query: &str) -> Result<AstStatement, PlannerError> {
    let statements = Parser::parse_sql(&MySqlDialect {}, query)
        .map_err(|e| PlannerError::Parse(e.to_string()))?;
    statements
        .into_iter()
        .next()
        .ok_or_else(|| PlannerError::Statement("empty query".into()))
}

fn lower_scan(table: &CatalogTable) -> PlanOp {
    PlanOp::TableScan {
        table_space: table.table.table_space.clone(),
        table: table.table.name.clone(),
        columns: table.table.columns.clone(),
    }
}

/// Derive the scan main statement from a lowered SELECT tree.
fn scan_statement_for(root: &PlanOp) -> Option<ScanStatement> {
    fn find_scan(op: &PlanOp) -> Option<(String, String)> {
        match op {
            PlanOp::TableScan {
                table_space, table, ..
            }
            | PlanOp::FilteredTableScan {
                table_space, table, ..
            } => Some((table_space.clone(), table.clone())),
            PlanOp::Filter { input, .. }
            | PlanOp::Project { input, .. }
            | PlanOp::Sort { input, .. }
            | PlanOp::Limit { input, .. }
            | PlanOp::Aggregate { input, .. } => find_scan(input),
            _ => None,
        }
    }
    find_scan(root).map(|(table_space, table)| ScanStatement {
        table_space,
        table,
        predicate: None,
    })
}

fn fields_map(fields: &[(String, SqlType)]) -> HashMap<String, usize> {
    fields
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.clone(), i))
        .collect()
}

fn compile_with(
    schema: &HashMap<String, usize>,
    params: &mut usize,
    expr: &Expr,
) -> Result<CompiledExpr, PlannerError> {
    let mut compiler = ExprCompiler::with_start(schema, *params);
    let compiled = compiler.compile(expr)?;
    *params = compiler.params_used();
    Ok(compiled)
}

fn resolve_from(
    catalog: &SchemaCatalog,
    default_ts: &str,
    from: &[TableWithJoins],
) -> Result<CatalogTable, PlannerError> {
    if from.is_empty() {
        return Err(PlannerError::Statement("missing FROM clause".into()));
    }
    if from.len() > 1 {
        return Err(PlannerError::UnsupportedPlan("cross join".into()));
    }
    let twj = &from[0];
    if !twj.joins.is_empty() {
        return Err(PlannerError::UnsupportedPlan("JOIN".into()));
    }
    match &twj.relation {
        TableFactor::Table { name, .. } => Ok(catalog.resolve(default_ts, name)?.clone()),
        TableFactor::Derived { .. } => Err(PlannerError::UnsupportedPlan("derived table".into())),
        other => Err(PlannerError::UnsupportedPlan(format!("{other}"))),
    }
}

fn is_identity_projection(items: &[SelectItem]) -> bool {
    items.len() == 1 && matches!(items[0], SelectItem::Wildcard(_))
}

fn projection_item(item: &SelectItem) -> Result<(Expr, String), PlannerError> {
    match item {
        SelectItem::UnnamedExpr(e) => Ok((e.clone(), expr_default_name(e))),
        SelectItem::ExprWithAlias { expr, alias } => {
            Ok((expr.clone(), alias.value.to_lowercase()))
        }
        SelectItem::Wildcard(_) => Err(PlannerError::Statement(
            "SELECT * cannot be mixed with other items".into(),
        )),
        other => Err(PlannerError::Statement(format!(
            "unsupported SELECT item: {other}"
        ))),
    }
}

fn expr_default_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.to_lowercase(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|i| i.value.to_lowercase())
            .unwrap_or_default(),
        other => other.to_string().to_lowercase(),
    }
}

fn assignment_column(target: &AssignmentTarget) -> Result<String, PlannerError> {
    match target {
        AssignmentTarget::ColumnName(name) => name
            .0
            .last()
            .map(|i| i.value.to_lowercase())
            .ok_or_else(|| PlannerError::Statement("empty assignment target".into())),
        AssignmentTarget::Tuple(_) => Err(PlannerError::Statement(
            "tuple assignment targets are not supported".into(),
        )),
    }
}

fn function_name(func: &Function) -> String {
    func.name
        .0
        .iter()
        .map(|i| i.value.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

const AGGREGATE_NAMES: &[&str] = &["count", "sum", "min", "max", "avg"];

fn is_aggregate_fn(func: &Function) -> bool {
    AGGREGATE_NAMES.contains(&function_name(func).as_str())
}

fn is_aggregate(expr: &Expr) -> bool {
    matches!(expr, Expr::Function(f) if is_aggregate_fn(f))
}

/// Arguments of an aggregate call; `COUNT(*)` yields an empty list.
fn aggregate_args(func: &Function) -> Result<Vec<Expr>, PlannerError> {
    match &func.args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::List(list) => {
            let mut out = Vec::new();
            for arg in &list.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => {}
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => out.push(e.clone()),
                    other => {
                        return Err(PlannerError::Statement(format!(
                            "unsupported aggregate argument: {other}"
                        )))
                    }
                }
            }
            Ok(out)
        }
        FunctionArguments::Subquery(_) => Err(PlannerError::Statement(
            "subquery aggregate arguments are not supported".into(),
        )),
    }
}

fn agg_call_count(node: &PhysNode) -> usize {
    match node {
        PhysNode::Aggregate { calls, .. } => calls.len(),
        _ => 0,
    }
}

/// Minimal type inference for validation and projection typing.
fn infer_sql_type(expr: &Expr, input: &PhysNode) -> Result<SqlType, PlannerError> {
    use sqlparser::ast::BinaryOperator;
    let fields = input.output_fields();
    fn of_column(fields: &[(String, SqlType)], name: &str) -> SqlType {
        let lower = name.to_lowercase();
        fields
            .iter()
            .find(|(f, _)| *f == lower)
            .map(|(_, t)| t.clone())
            .unwrap_or(SqlType::Any)
    }
    let t = match expr {
        Expr::Identifier(ident) => of_column(&fields, &ident.value),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|i| of_column(&fields, &i.value))
            .unwrap_or(SqlType::Any),
        Expr::Value(Value::Number(n, _)) => {
            if n.parse::<i64>().is_ok() {
                SqlType::Bigint
            } else {
                SqlType::Other("DOUBLE".into())
            }
        }
        Expr::Value(Value::SingleQuotedString(_)) | Expr::Value(Value::DoubleQuotedString(_)) => {
            SqlType::Varchar
        }
        Expr::Value(Value::Boolean(_)) => SqlType::Boolean,
        Expr::Value(Value::Null) => SqlType::Null,
        Expr::Value(Value::Placeholder(_)) => SqlType::Any,
        Expr::BinaryOp { op, left, .. } => match op {
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::And
            | BinaryOperator::Or => SqlType::Boolean,
            _ => infer_sql_type(left, input)?,
        },
        Expr::UnaryOp { op, expr: inner } => match op {
            sqlparser::ast::UnaryOperator::Not => SqlType::Boolean,
            _ => infer_sql_type(inner, input)?,
        },
        Expr::IsNull(_) | Expr::IsNotNull(_) | Expr::Between { .. } | Expr::InList { .. }
        | Expr::Like { .. } => SqlType::Boolean,
        Expr::Nested(inner) => infer_sql_type(inner, input)?,
        Expr::Case {
            results,
            else_result,
            ..
        } => match results.first() {
            Some(r) => infer_sql_type(r, input)?,
            None => else_result
                .as_ref()
                .map(|e| infer_sql_type(e, input))
                .transpose()?
                .unwrap_or(SqlType::Null),
        },
        Expr::Function(func) => match function_name(func).as_str() {
            "lower" | "upper" => SqlType::Varchar,
            "abs" => SqlType::Bigint,
            "coalesce" => SqlType::Any,
            "current_timestamp" | "now" => SqlType::Timestamp,
            _ => SqlType::Any,
        },
        _ => SqlType::Any,
    };
    Ok(t)
}

/// Rewrite a non-scan SELECT plan into a primary-key Get when the tree is a
/// single filtered scan whose predicate pins the whole (single-column)
/// primary key with an equality against a literal or parameter.
fn try_rewrite_get(plan: ExecutionPlan, catalog: &SchemaCatalog) -> ExecutionPlan {
    use crate::sql::expr::BinOp;
    let root = match &plan.root {
        Some(root) => root,
        None => return plan,
    };
    let (table_space, table_name, predicate) = match root {
        PlanOp::FilteredTableScan {
            table_space,
            table,
            predicate,
            ..
        } => (table_space, table, predicate),
        _ => return plan,
    };
    let table = match catalog
        .spaces
        .get(&table_space.to_lowercase())
        .and_then(|tables| tables.get(&table_name.to_lowercase()))
    {
        Some(t) => t,
        None => return plan,
    };
    if table.table.primary_key.len() != 1 {
        return plan;
    }
    let pk_index = match table.table.column_index(&table.table.primary_key[0]) {
        Some(i) => i,
        None => return plan,
    };

    let key = match predicate {
        CompiledExpr::Binary {
            op: BinOp::Eq,
            left,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (CompiledExpr::Field(i), value) if *i == pk_index && is_key_expr(value) => {
                Some(value.clone())
            }
            (value, CompiledExpr::Field(i)) if *i == pk_index && is_key_expr(value) => {
                Some(value.clone())
            }
            _ => None,
        },
        _ => None,
    };

    match key {
        Some(key) => ExecutionPlan::simple(Statement::Get(GetStatement {
            table_space: table_space.clone(),
            table: table_name.clone(),
            key,
        })),
        None => plan,
    }
}

fn is_key_expr(expr: &CompiledExpr) -> bool {
    matches!(expr, CompiledExpr::Constant(_) | CompiledExpr::Parameter(_))
}
