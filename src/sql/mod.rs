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

// SQL front-end: translates SQL text into execution plans for the engine.
//
// Statements with DDL / transaction-control / EXECUTE / TRUNCATE prefixes go
// through a lightweight fallback planner; everything else runs the full
// parse → validate → lower pipeline.

pub mod expr;
pub mod fallback;
pub mod plan;
pub mod planner;

use std::sync::Arc;

use crate::model::Table;
use plan::{EvaluationContext, ExecutionPlan};

/// Errors produced by the SQL layer.
#[derive(Debug)]
pub enum PlannerError {
    /// SQL syntax error from the parser.
    Parse(String),
    /// Planning error: name resolution, type inference, or conversion.
    Statement(String),
    /// The planner met an operator shape it cannot lower.
    UnsupportedPlan(String),
}

impl std::fmt::Display for PlannerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerError::Parse(msg) => write!(f, "statement execution error: parse: {msg}"),
            PlannerError::Statement(msg) => write!(f, "statement execution error: {msg}"),
            PlannerError::UnsupportedPlan(shape) => {
                write!(f, "statement execution error: unsupported plan shape: {shape}")
            }
        }
    }
}

impl std::error::Error for PlannerError {}

/// The pair handed to the engine for one execution.
#[derive(Debug, Clone)]
pub struct TranslatedQuery {
    pub plan: Arc<ExecutionPlan>,
    pub context: EvaluationContext,
}

/// Engine metadata the planner consumes to build its root schema and to
/// stamp generated nodes. Implemented by the engine.
pub trait PlannerMetadata: Send + Sync {
    /// Table-spaces served locally by this node.
    fn local_table_spaces(&self) -> Vec<String>;

    /// Schemas of every table in a table-space, for name resolution.
    fn tables_for_planner(&self, table_space: &str) -> Vec<Table>;

    /// Identity of this node, stamped into generated Values nodes.
    fn node_id(&self) -> String;
}

pub use fallback::CacheStats;
pub use planner::Planner;
