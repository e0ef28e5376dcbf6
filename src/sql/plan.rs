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

//! The internal operator algebra: statements, operator trees, execution
//! plans, and the per-execution evaluation context.
//!
//! Operators are a tagged variant with owned children. Trees are immutable
//! once produced by the planner; the engine walks them to execute.

use crate::model::{Column, SqlValue, Table};
use crate::sql::expr::CompiledExpr;
use crate::sql::PlannerError;

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// Everything an execution needs beside the plan itself: the original query
/// text (for diagnostics) and the positional parameters.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub query: String,
    pub params: Vec<SqlValue>,
}

impl EvaluationContext {
    pub fn new(query: impl Into<String>, params: Vec<SqlValue>) -> EvaluationContext {
        EvaluationContext {
            query: query.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScanStatement {
    pub table_space: String,
    pub table: String,
    pub predicate: Option<CompiledExpr>,
}

#[derive(Debug, Clone)]
pub struct GetStatement {
    pub table_space: String,
    pub table: String,
    /// Compiled expression producing the primary-key value.
    pub key: CompiledExpr,
}

#[derive(Debug, Clone)]
pub struct InsertStatement {
    pub table_space: String,
    pub table: String,
    pub return_values: bool,
}

#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub table_space: String,
    pub table: String,
    /// Update function: target columns paired with source expressions in
    /// parallel order.
    pub columns: Vec<String>,
    pub expressions: Vec<CompiledExpr>,
    pub predicate: Option<CompiledExpr>,
}

#[derive(Debug, Clone)]
pub struct DeleteStatement {
    pub table_space: String,
    pub table: String,
    pub predicate: Option<CompiledExpr>,
}

#[derive(Debug, Clone)]
pub struct CreateTableStatement {
    pub table: Table,
}

#[derive(Debug, Clone)]
pub struct DropTableStatement {
    pub table_space: String,
    pub table: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone)]
pub enum AlterOperation {
    AddColumn(Column),
    DropColumn(String),
}

#[derive(Debug, Clone)]
pub struct AlterTableStatement {
    pub table_space: String,
    pub table: String,
    pub operation: AlterOperation,
}

#[derive(Debug, Clone)]
pub struct TruncateTableStatement {
    pub table_space: String,
    pub table: String,
}

/// The main statement of an execution plan. The session matches on this to
/// shape replies and to maintain its tracked-transaction set.
#[derive(Debug, Clone)]
pub enum Statement {
    Scan(ScanStatement),
    Get(GetStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    CreateTable(CreateTableStatement),
    DropTable(DropTableStatement),
    AlterTable(AlterTableStatement),
    TruncateTable(TruncateTableStatement),
    BeginTransaction { table_space: String },
    CommitTransaction { table_space: String, tx: u64 },
    RollbackTransaction { table_space: String, tx: u64 },
}

impl Statement {
    pub fn is_scan(&self) -> bool {
        matches!(self, Statement::Scan(_))
    }

    /// Target (table-space, table) of the statement, when it has one.
    pub fn table_ref(&self) -> Option<(&str, &str)> {
        match self {
            Statement::Scan(s) => Some((&s.table_space, &s.table)),
            Statement::Get(s) => Some((&s.table_space, &s.table)),
            Statement::Insert(s) => Some((&s.table_space, &s.table)),
            Statement::Update(s) => Some((&s.table_space, &s.table)),
            Statement::Delete(s) => Some((&s.table_space, &s.table)),
            Statement::CreateTable(s) => Some((&s.table.table_space, &s.table.name)),
            Statement::DropTable(s) => Some((&s.table_space, &s.table)),
            Statement::AlterTable(s) => Some((&s.table_space, &s.table)),
            Statement::TruncateTable(s) => Some((&s.table_space, &s.table)),
            Statement::BeginTransaction { .. }
            | Statement::CommitTransaction { .. }
            | Statement::RollbackTransaction { .. } => None,
        }
    }

    /// Table-space a transaction-control statement applies to.
    pub fn transaction_table_space(&self) -> Option<&str> {
        match self {
            Statement::BeginTransaction { table_space }
            | Statement::CommitTransaction { table_space, .. }
            | Statement::RollbackTransaction { table_space, .. } => Some(table_space),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Operator tree
// ---------------------------------------------------------------------------

/// A node of the internal operator algebra. Composite nodes own their
/// children; every node declares its output schema.
#[derive(Debug, Clone)]
pub enum PlanOp {
    TableScan {
        table_space: String,
        table: String,
        columns: Vec<Column>,
    },
    /// A table scan with the predicate pushed into the access path. Produced
    /// by the optimizer from `Filter(TableScan)`.
    FilteredTableScan {
        table_space: String,
        table: String,
        columns: Vec<Column>,
        predicate: CompiledExpr,
    },
    Filter {
        input: Box<PlanOp>,
        condition: CompiledExpr,
    },
    Project {
        input: Box<PlanOp>,
        field_names: Vec<String>,
        columns: Vec<Column>,
        exprs: Vec<CompiledExpr>,
    },
    Sort {
        input: Box<PlanOp>,
        /// true = ascending.
        directions: Vec<bool>,
        /// Input field indices to sort by, in significance order.
        fields: Vec<usize>,
    },
    Limit {
        input: Box<PlanOp>,
        fetch: Option<CompiledExpr>,
        offset: Option<CompiledExpr>,
    },
    Aggregate {
        input: Box<PlanOp>,
        field_names: Vec<String>,
        columns: Vec<Column>,
        /// Aggregation functions by name, parallel to the non-key output
        /// fields (which follow the group-key fields).
        functions: Vec<String>,
        /// Input field indices consumed by each function.
        arguments: Vec<Vec<usize>>,
        /// Input field indices forming the group key.
        group_fields: Vec<usize>,
    },
    Values {
        node_id: String,
        field_names: Vec<String>,
        columns: Vec<Column>,
        rows: Vec<Vec<CompiledExpr>>,
    },
    Insert {
        table_space: String,
        table: String,
        input: Box<PlanOp>,
        return_values: bool,
    },
    Update {
        statement: UpdateStatement,
    },
    Delete {
        statement: DeleteStatement,
    },
}

impl PlanOp {
    /// Declared output schema of this node. Terminal DML nodes produce no
    /// rows and declare an empty schema.
    pub fn output_columns(&self) -> &[Column] {
        match self {
            PlanOp::TableScan { columns, .. } => columns,
            PlanOp::FilteredTableScan { columns, .. } => columns,
            PlanOp::Filter { input, .. } => input.output_columns(),
            PlanOp::Project { columns, .. } => columns,
            PlanOp::Sort { input, .. } => input.output_columns(),
            PlanOp::Limit { input, .. } => input.output_columns(),
            PlanOp::Aggregate { columns, .. } => columns,
            PlanOp::Values { columns, .. } => columns,
            PlanOp::Insert { .. } | PlanOp::Update { .. } | PlanOp::Delete { .. } => &[],
        }
    }

    /// Validate the row-type arity invariant: every composite node's declared
    /// schema must be consistent with its child's, and every field index must
    /// be in range.
    pub fn validate(&self) -> Result<(), PlannerError> {
        match self {
            PlanOp::TableScan { columns, .. } | PlanOp::FilteredTableScan { columns, .. } => {
                if columns.is_empty() {
                    return Err(PlannerError::Statement("scan with empty schema".into()));
                }
                Ok(())
            }
            PlanOp::Filter { input, .. } => input.validate(),
            PlanOp::Project {
                input,
                field_names,
                columns,
                exprs,
            } => {
                if field_names.len() != columns.len() || columns.len() != exprs.len() {
                    return Err(PlannerError::Statement(format!(
                        "projection arity mismatch: {} names, {} columns, {} expressions",
                        field_names.len(),
                        columns.len(),
                        exprs.len()
                    )));
                }
                input.validate()
            }
            PlanOp::Sort {
                input,
                directions,
                fields,
            } => {
                if directions.len() != fields.len() {
                    return Err(PlannerError::Statement(
                        "sort directions and fields differ in length".into(),
                    ));
                }
                let arity = input.output_columns().len();
                for f in fields {
                    if *f >= arity {
                        return Err(PlannerError::Statement(format!(
                            "sort field #{f} out of range (input arity {arity})"
                        )));
                    }
                }
                input.validate()
            }
            PlanOp::Limit { input, .. } => input.validate(),
            PlanOp::Aggregate {
                input,
                field_names,
                columns,
                functions,
                arguments,
                group_fields,
            } => {
                if field_names.len() != columns.len() {
                    return Err(PlannerError::Statement(
                        "aggregate names and columns differ in length".into(),
                    ));
                }
                if functions.len() != arguments.len() {
                    return Err(PlannerError::Statement(
                        "aggregate functions and argument lists differ in length".into(),
                    ));
                }
                if field_names.len() != group_fields.len() + functions.len() {
                    return Err(PlannerError::Statement(format!(
                        "aggregate output arity {} != {} keys + {} functions",
                        field_names.len(),
                        group_fields.len(),
                        functions.len()
                    )));
                }
                let arity = input.output_columns().len();
                for f in group_fields.iter().chain(arguments.iter().flatten()) {
                    if *f >= arity {
                        return Err(PlannerError::Statement(format!(
                            "aggregate field #{f} out of range (input arity {arity})"
                        )));
                    }
                }
                input.validate()
            }
            PlanOp::Values {
                field_names,
                columns,
                rows,
                ..
            } => {
                if field_names.len() != columns.len() {
                    return Err(PlannerError::Statement(
                        "values names and columns differ in length".into(),
                    ));
                }
                for (i, row) in rows.iter().enumerate() {
                    if row.len() != columns.len() {
                        return Err(PlannerError::Statement(format!(
                            "values row #{i} has {} expressions, schema has {}",
                            row.len(),
                            columns.len()
                        )));
                    }
                }
                Ok(())
            }
            PlanOp::Insert { input, .. } => input.validate(),
            PlanOp::Update { .. } | PlanOp::Delete { .. } => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// The product of planning: a main statement plus, for planned queries, the
/// optimized operator tree. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub main: Statement,
    pub root: Option<PlanOp>,
}

impl ExecutionPlan {
    /// A plan with no operator tree (fallback statements, primary-key gets).
    pub fn simple(main: Statement) -> ExecutionPlan {
        ExecutionPlan { main, root: None }
    }

    pub fn planned(main: Statement, root: PlanOp) -> ExecutionPlan {
        ExecutionPlan {
            main,
            root: Some(root),
        }
    }

    /// Optimization pass over the operator tree. Currently fuses
    /// `Filter(TableScan)` into `FilteredTableScan` so the access path can
    /// evaluate the predicate while scanning.
    pub fn optimize(mut self) -> ExecutionPlan {
        if let Some(root) = self.root.take() {
            self.root = Some(fuse_filtered_scans(root));
        }
        self
    }
}

fn fuse_filtered_scans(op: PlanOp) -> PlanOp {
    match op {
        PlanOp::Filter { input, condition } => {
            let input = fuse_filtered_scans(*input);
            match input {
                PlanOp::TableScan {
                    table_space,
                    table,
                    columns,
                } => PlanOp::FilteredTableScan {
                    table_space,
                    table,
                    columns,
                    predicate: condition,
                },
                other => PlanOp::Filter {
                    input: Box::new(other),
                    condition,
                },
            }
        }
        PlanOp::Project {
            input,
            field_names,
            columns,
            exprs,
        } => PlanOp::Project {
            input: Box::new(fuse_filtered_scans(*input)),
            field_names,
            columns,
            exprs,
        },
        PlanOp::Sort {
            input,
            directions,
            fields,
        } => PlanOp::Sort {
            input: Box::new(fuse_filtered_scans(*input)),
            directions,
            fields,
        },
        PlanOp::Limit {
            input,
            fetch,
            offset,
        } => PlanOp::Limit {
            input: Box::new(fuse_filtered_scans(*input)),
            fetch,
            offset,
        },
        PlanOp::Aggregate {
            input,
            field_names,
            columns,
            functions,
            arguments,
            group_fields,
        } => PlanOp::Aggregate {
            input: Box::new(fuse_filtered_scans(*input)),
            field_names,
            columns,
            functions,
            arguments,
            group_fields,
        },
        PlanOp::Insert {
            table_space,
            table,
            input,
            return_values,
        } => PlanOp::Insert {
            table_space,
            table,
            input: Box::new(fuse_filtered_scans(*input)),
            return_values,
        },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
