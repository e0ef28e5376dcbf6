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

//! Corral: a distributed SQL database server.
//!
//! Two cooperating cores: the per-connection session peer (`server`) that
//! multiplexes authentication, statement execution, transactions, and
//! streaming result-set cursors over one channel; and the SQL planner
//! (`sql`) that parses, validates, and lowers SQL into the internal
//! operator algebra executed by the engine (`engine`).

pub mod buffer;
pub mod engine;
pub mod model;
pub mod server;
pub mod sql;

pub use engine::{DataScanner, Engine, EngineError, ExecutionResult, TransactionContext};
pub use model::{Column, ColumnType, SqlValue, Table, Tuple};
pub use server::{Channel, Message, MessageType, SessionPeer, UserRegistry, WireValue};
pub use sql::{Planner, PlannerError, PlannerMetadata, TranslatedQuery};
