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

//! The storage-engine contract consumed by the session peer and the planner.
//!
//! The engine itself (storage, WAL, replication) lives behind these traits;
//! `mem` provides a compact in-memory implementation for the demo server and
//! the integration tests.

pub mod mem;

use crate::model::{Table, Tuple};
use crate::server::channel::Channel;
use crate::server::message::Message;
use crate::sql::plan::{EvaluationContext, ExecutionPlan, Statement};
use crate::sql::PlannerMetadata;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine. `NotLeader` is the redirect signal the
/// session forwards to clients as a marker on the error reply.
#[derive(Debug)]
pub enum EngineError {
    /// Leadership for the table-space moved to another node.
    NotLeader { table_space: String },
    /// Statement execution failure (planning input, missing objects,
    /// constraint violations, evaluation errors).
    Statement(String),
    /// Failure while draining a scanner.
    Scan(String),
}

impl EngineError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, EngineError::NotLeader { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotLeader { table_space } => {
                write!(f, "not leader for table-space '{table_space}'")
            }
            EngineError::Statement(msg) => write!(f, "statement execution error: {msg}"),
            EngineError::Scan(msg) => write!(f, "scan error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<crate::sql::expr::EvalError> for EngineError {
    fn from(err: crate::sql::expr::EvalError) -> Self {
        EngineError::Statement(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Transaction context
// ---------------------------------------------------------------------------

/// Transaction a statement executes under; id 0 means none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionContext {
    pub tx_id: u64,
}

impl TransactionContext {
    pub const NO_TRANSACTION: TransactionContext = TransactionContext { tx_id: 0 };

    pub fn new(tx_id: u64) -> TransactionContext {
        TransactionContext { tx_id }
    }
}

// ---------------------------------------------------------------------------
// Scanners
// ---------------------------------------------------------------------------

/// A resumable stream of tuples with a declared schema.
///
/// `is_finished` becomes true as soon as the underlying stream is exhausted,
/// including when exhaustion coincides with delivering the final row.
pub trait DataScanner: Send {
    /// Ordered column names of the produced tuples.
    fn schema(&self) -> &[String];

    fn next_row(&mut self) -> Result<Option<Tuple>, EngineError>;

    fn is_finished(&self) -> bool;

    /// Release engine-side resources. Idempotent.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

/// Tagged result of a plan execution; the session matches on the tag to
/// shape its reply.
pub enum ExecutionResult {
    Dml {
        update_count: u64,
        /// Primary key of the affected row, when the statement asked for it.
        key: Option<Vec<u8>>,
    },
    Get {
        record: Option<Tuple>,
    },
    Transaction {
        tx_id: u64,
    },
    Ddl,
    Scan(Box<dyn DataScanner>),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The engine contract consumed by the session peer. Implementations must be
/// safe under concurrent access from many sessions.
pub trait Engine: PlannerMetadata + Send + Sync {
    /// Execute a translated plan.
    fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        ctx: &EvaluationContext,
        tx: TransactionContext,
    ) -> Result<ExecutionResult, EngineError>;

    /// Execute a bare statement; used by session teardown for rollbacks.
    fn execute_statement(
        &self,
        statement: &Statement,
        ctx: &EvaluationContext,
        tx: TransactionContext,
    ) -> Result<ExecutionResult, EngineError>;

    /// Schema of a table, for primary-key decoding.
    fn table_schema(&self, table_space: &str, table: &str) -> Option<Table>;

    /// Stream a table-space dump directly on the given channel. The session
    /// delegates entirely; the engine owns the dump state.
    fn dump_table_space(
        &self,
        table_space: &str,
        dump_id: &str,
        request: &Message,
        channel: &dyn Channel,
        fetch_size: usize,
    ) -> Result<(), EngineError>;
}
