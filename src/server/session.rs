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

//! The session peer: per-connection coordinator multiplexing authentication,
//! statement execution, table-space dumps, and cursor lifecycle over one
//! channel.
//!
//! State machine: Unauthenticated → (SASL in progress) → Authenticated →
//! Closed. The only legal pre-auth messages are the two SASL types. Message
//! handling within a session is sequential; the cursor and transaction maps
//! tolerate the concurrent teardown reader.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::engine::{Engine, ExecutionResult, TransactionContext};
use crate::model::{decode_key, SqlValue, Tuple};
use crate::server::channel::Channel;
use crate::server::message::{
    Message, MessageType, WireValue, P_CAUSE, P_DUMP_ID, P_FETCH_SIZE, P_KEY, P_MAX_ROWS, P_MECH,
    P_NOT_LEADER, P_PARAMS, P_QUERY, P_SCANNER_ID, P_TABLE_SPACE, P_TOKEN, P_TX,
};
use crate::server::sasl::{SaslError, SaslServerContext, UserRegistry};
use crate::server::scanner::ServerSideScanner;
use crate::sql::plan::{EvaluationContext, Statement};
use crate::sql::Planner;

const DEFAULT_FETCH_SIZE: usize = 10;
const AUTH_REQUIRED: &str = "authentication required";
const AUTH_FAILED: &str = "authentication failed";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// SessionPeer
// ---------------------------------------------------------------------------

pub struct SessionPeer {
    id: u64,
    address: String,
    connected_at: SystemTime,
    engine: Arc<dyn Engine>,
    planner: Arc<Planner>,
    channel: Arc<dyn Channel>,
    users: Arc<UserRegistry>,
    authenticated: AtomicBool,
    username: OnceLock<String>,
    authenticator: Mutex<Option<SaslServerContext>>,
    scanners: DashMap<String, ServerSideScanner>,
    transactions: DashMap<String, BTreeSet<u64>>,
    closed: AtomicBool,
}

impl SessionPeer {
    pub fn new(
        engine: Arc<dyn Engine>,
        planner: Arc<Planner>,
        channel: Arc<dyn Channel>,
        users: Arc<UserRegistry>,
        address: &str,
    ) -> SessionPeer {
        SessionPeer {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            address: address.to_string(),
            connected_at: SystemTime::now(),
            engine,
            planner,
            channel,
            users,
            authenticated: AtomicBool::new(false),
            username: OnceLock::new(),
            authenticator: Mutex::new(None),
            scanners: DashMap::new(),
            transactions: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    pub fn has_scanner(&self, id: &str) -> bool {
        self.scanners.contains_key(id)
    }

    pub fn tracked_transactions(&self, table_space: &str) -> Vec<u64> {
        self.transactions
            .get(table_space)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// React to one inbound message. Called sequentially in channel receive
    /// order.
    pub fn handle_message(&self, message: Message) {
        if self.closed.load(Ordering::Acquire) {
            // Closed is terminal; late messages have nowhere to reply to.
            return;
        }
        match message.mtype {
            MessageType::SaslTokenRequest => self.handle_sasl_token_request(&message),
            MessageType::SaslTokenStep => self.handle_sasl_token_step(&message),
            _ if !self.is_authenticated() => {
                self.send_error(&message, AUTH_REQUIRED, Vec::new());
            }
            MessageType::ExecuteStatement => self.handle_execute_statement(&message),
            MessageType::RequestTableSpaceDump => self.handle_table_space_dump(&message),
            MessageType::OpenScanner => self.handle_open_scanner(&message),
            MessageType::FetchScannerData => self.handle_fetch_scanner_data(&message),
            MessageType::CloseScanner => self.handle_close_scanner(&message),
            other => {
                self.send_error(&message, &format!("unknown message type {other:?}"), Vec::new());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    fn handle_sasl_token_request(&self, message: &Message) {
        let mech = message.get_str(P_MECH).unwrap_or_default();
        let mut guard = self.authenticator.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            match SaslServerContext::new(self.users.clone(), mech) {
                Ok(ctx) => *guard = Some(ctx),
                Err(e) => {
                    warn!(session = self.id, peer = %self.address, error = %e, "sasl setup failed");
                    drop(guard);
                    self.send_error(message, "authentication error", Vec::new());
                    return;
                }
            }
        }
        let challenge = guard
            .as_ref()
            .map(|ctx| ctx.initial_challenge())
            .unwrap_or_default();
        drop(guard);
        self.channel
            .send_reply(Message::sasl_server_response(message, &challenge));
    }

    fn handle_sasl_token_step(&self, message: &Message) {
        let token = message.get_bytes(P_TOKEN).unwrap_or_default();
        let mut guard = self.authenticator.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = match guard.as_mut() {
            Some(ctx) => ctx,
            None => {
                drop(guard);
                self.send_error(message, AUTH_REQUIRED, Vec::new());
                return;
            }
        };
        match ctx.response(token) {
            Ok(next_token) => {
                if ctx.is_complete() {
                    let username = ctx.username().unwrap_or_default().to_string();
                    let _ = self.username.set(username.clone());
                    self.authenticated.store(true, Ordering::Release);
                    // Completed: the authenticator is discarded for good.
                    *guard = None;
                    debug!(session = self.id, peer = %self.address, user = %username, "authenticated");
                }
                drop(guard);
                self.channel
                    .send_reply(Message::sasl_server_response(message, &next_token));
            }
            Err(SaslError::AuthenticationFailed) => {
                *guard = None;
                drop(guard);
                warn!(session = self.id, peer = %self.address, "authentication failed");
                self.send_error(message, AUTH_FAILED, Vec::new());
            }
            Err(e) => {
                *guard = None;
                drop(guard);
                warn!(session = self.id, peer = %self.address, error = %e, "sasl exchange error");
                self.send_error(message, "authentication error", Vec::new());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Statement execution
    // -----------------------------------------------------------------------

    fn handle_execute_statement(&self, message: &Message) {
        let query = match message.get_str(P_QUERY) {
            Some(q) => q,
            None => return self.send_error(message, "missing query", Vec::new()),
        };
        let table_space = match message.get_str(P_TABLE_SPACE) {
            Some(ts) => ts,
            None => return self.send_error(message, "missing tableSpace", Vec::new()),
        };
        let tx = message.get_int(P_TX).unwrap_or(0).max(0) as u64;
        let params = wire_params(message);

        let translated =
            match self
                .planner
                .translate(table_space, query, params, false, true, true, 0)
            {
                Ok(tq) => tq,
                Err(e) => return self.send_error(message, &e.to_string(), Vec::new()),
            };

        let result = self.engine.execute_plan(
            &translated.plan,
            &translated.context,
            TransactionContext::new(tx),
        );

        match result {
            Ok(ExecutionResult::Dml { update_count, key }) => {
                let other = key.and_then(|blob| self.key_data(&translated.plan.main, &blob));
                self.channel.send_reply(Message::execute_statement_result(
                    message,
                    update_count,
                    other,
                ));
            }
            Ok(ExecutionResult::Get { record }) => match record {
                Some(row) => {
                    self.channel.send_reply(Message::execute_statement_result(
                        message,
                        1,
                        Some(record_map(&row)),
                    ));
                }
                None => {
                    self.channel
                        .send_reply(Message::execute_statement_result(message, 0, None));
                }
            },
            Ok(ExecutionResult::Transaction { tx_id }) => {
                self.track_transaction(&translated.plan.main, tx_id);
                let mut data = BTreeMap::new();
                data.insert(P_TX.to_string(), WireValue::Int(tx_id as i64));
                self.channel.send_reply(Message::execute_statement_result(
                    message,
                    1,
                    Some(WireValue::Map(data)),
                ));
            }
            Ok(ExecutionResult::Ddl) => {
                self.channel
                    .send_reply(Message::execute_statement_result(message, 1, None));
            }
            Ok(ExecutionResult::Scan(_)) => {
                self.send_error(
                    message,
                    "unexpected result kind for execute-statement",
                    Vec::new(),
                );
            }
            Err(e) => {
                let extras = not_leader_extras(&e);
                self.send_error(message, &e.to_string(), extras);
            }
        }
    }

    /// Decode a DML primary-key blob against the target table's schema and
    /// shape it for the `key` reply field.
    fn key_data(&self, main: &Statement, blob: &[u8]) -> Option<WireValue> {
        let (table_space, table) = main.table_ref()?;
        let schema = self.engine.table_schema(table_space, table)?;
        match decode_key(&schema, blob) {
            Ok(pairs) => {
                let key_value = if pairs.len() == 1 {
                    WireValue::from_sql(&pairs[0].1)
                } else {
                    WireValue::Map(
                        pairs
                            .iter()
                            .map(|(name, value)| (name.clone(), WireValue::from_sql(value)))
                            .collect(),
                    )
                };
                let mut data = BTreeMap::new();
                data.insert(P_KEY.to_string(), key_value);
                Some(WireValue::Map(data))
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "primary-key decode failed");
                None
            }
        }
    }

    /// Mutate the tracked-transaction set according to an observed
    /// transaction outcome: BEGIN adds, COMMIT/ROLLBACK removes.
    fn track_transaction(&self, main: &Statement, tx_id: u64) {
        match main {
            Statement::BeginTransaction { table_space } => {
                self.transactions
                    .entry(table_space.clone())
                    .or_default()
                    .insert(tx_id);
            }
            Statement::CommitTransaction { table_space, .. }
            | Statement::RollbackTransaction { table_space, .. } => {
                if let Some(mut set) = self.transactions.get_mut(table_space) {
                    set.remove(&tx_id);
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Table-space dump
    // -----------------------------------------------------------------------

    fn handle_table_space_dump(&self, message: &Message) {
        let dump_id = match message.get_str(P_DUMP_ID) {
            Some(id) => id.to_string(),
            None => return self.send_error(message, "missing dumpId", Vec::new()),
        };
        let table_space = match message.get_str(P_TABLE_SPACE) {
            Some(ts) => ts.to_string(),
            None => return self.send_error(message, "missing tableSpace", Vec::new()),
        };
        let fetch_size = message
            .get_int(P_FETCH_SIZE)
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_FETCH_SIZE as i64) as usize;

        // The engine owns the dump state and streams frames directly.
        if let Err(e) = self.engine.dump_table_space(
            &table_space,
            &dump_id,
            message,
            self.channel.as_ref(),
            fetch_size,
        ) {
            let extras = not_leader_extras(&e);
            self.send_error(message, &e.to_string(), extras);
        }
    }

    // -----------------------------------------------------------------------
    // Cursor lifecycle
    // -----------------------------------------------------------------------

    fn handle_open_scanner(&self, message: &Message) {
        let scanner_id = match message.get_str(P_SCANNER_ID) {
            Some(id) => id.to_string(),
            None => return self.send_error(message, "missing scannerId", Vec::new()),
        };
        let query = match message.get_str(P_QUERY) {
            Some(q) => q,
            None => return self.send_error(message, "missing query", Vec::new()),
        };
        let table_space = match message.get_str(P_TABLE_SPACE) {
            Some(ts) => ts,
            None => return self.send_error(message, "missing tableSpace", Vec::new()),
        };
        let tx = message.get_int(P_TX).unwrap_or(0).max(0) as u64;
        let fetch_size = message
            .get_int(P_FETCH_SIZE)
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_FETCH_SIZE as i64) as usize;
        let max_rows = message.get_int(P_MAX_ROWS).unwrap_or(0).max(0) as u64;
        let params = wire_params(message);

        if self.scanners.contains_key(&scanner_id) {
            return self.send_error(
                message,
                &format!("scanner '{scanner_id}' already open"),
                vec![(P_SCANNER_ID, WireValue::Str(scanner_id.clone()))],
            );
        }

        let translated =
            match self
                .planner
                .translate(table_space, query, params, true, true, true, 0)
            {
                Ok(tq) => tq,
                Err(e) => return self.send_error(message, &e.to_string(), Vec::new()),
            };
        if !translated.plan.main.is_scan() {
            return self.send_error(message, "not a scan statement", Vec::new());
        }

        let scan = match self.engine.execute_plan(
            &translated.plan,
            &translated.context,
            TransactionContext::new(tx),
        ) {
            Ok(ExecutionResult::Scan(s)) => s,
            Ok(_) => return self.send_error(message, "expected a scan result", Vec::new()),
            Err(e) => {
                let extras = not_leader_extras(&e);
                return self.send_error(message, &e.to_string(), extras);
            }
        };

        let mut scanner = ServerSideScanner::new(&scanner_id, scan, max_rows);
        match scanner.fetch(fetch_size) {
            Ok(rows) => {
                let columns = scanner.schema().to_vec();
                let last = scanner.is_finished();
                if last {
                    scanner.close();
                } else {
                    self.scanners.insert(scanner_id.clone(), scanner);
                }
                let records = rows.iter().map(record_map).collect();
                self.channel.send_reply(Message::resultset_chunk(
                    message,
                    &scanner_id,
                    &columns,
                    records,
                    last,
                    (tx != 0).then_some(tx),
                ));
            }
            Err(e) => {
                // Nothing was registered; make sure of it before replying.
                self.scanners.remove(&scanner_id);
                let extras = not_leader_extras(&e);
                self.send_error(message, &e.to_string(), extras);
            }
        }
    }

    fn handle_fetch_scanner_data(&self, message: &Message) {
        let scanner_id = match message.get_str(P_SCANNER_ID) {
            Some(id) => id.to_string(),
            None => return self.send_error(message, "missing scannerId", Vec::new()),
        };
        let fetch_size = message
            .get_int(P_FETCH_SIZE)
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_FETCH_SIZE as i64) as usize;

        let outcome = match self.scanners.get_mut(&scanner_id) {
            None => {
                let known: Vec<String> = self.scanners.iter().map(|e| e.key().clone()).collect();
                self.send_error(
                    message,
                    &format!(
                        "unknown scanner '{scanner_id}', known scanners: [{}]",
                        known.join(", ")
                    ),
                    vec![(P_SCANNER_ID, WireValue::Str(scanner_id))],
                );
                return;
            }
            Some(mut scanner) => match scanner.fetch(fetch_size) {
                Ok(rows) => {
                    let columns = scanner.schema().to_vec();
                    let last = scanner.is_finished();
                    Ok((rows, columns, last))
                }
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok((rows, columns, last)) => {
                if last {
                    if let Some((_, mut scanner)) = self.scanners.remove(&scanner_id) {
                        scanner.close();
                    }
                }
                let records = rows.iter().map(record_map).collect();
                self.channel.send_reply(Message::resultset_chunk(
                    message,
                    &scanner_id,
                    &columns,
                    records,
                    last,
                    None,
                ));
            }
            Err(e) => {
                // Unregister before replying with the scan error.
                if let Some((_, mut scanner)) = self.scanners.remove(&scanner_id) {
                    scanner.close();
                }
                let extras = not_leader_extras(&e);
                self.send_error(message, &e.to_string(), extras);
            }
        }
    }

    fn handle_close_scanner(&self, message: &Message) {
        let scanner_id = match message.get_str(P_SCANNER_ID) {
            Some(id) => id.to_string(),
            None => return self.send_error(message, "missing scannerId", Vec::new()),
        };
        match self.scanners.remove(&scanner_id) {
            Some((_, mut scanner)) => {
                scanner.close();
                self.channel.send_reply(Message::ack(message));
            }
            None => self.send_error(
                message,
                &format!("unknown scanner '{scanner_id}'"),
                vec![(P_SCANNER_ID, WireValue::Str(scanner_id))],
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Channel closed: terminal. Rolls back every tracked transaction,
    /// closes every cursor, clears all tracking structures.
    pub fn channel_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.transactions.iter() {
            let table_space = entry.key().clone();
            for tx in entry.value().iter() {
                let statement = Statement::RollbackTransaction {
                    table_space: table_space.clone(),
                    tx: *tx,
                };
                if let Err(e) = self.engine.execute_statement(
                    &statement,
                    &EvaluationContext::default(),
                    TransactionContext::NO_TRANSACTION,
                ) {
                    error!(
                        session = self.id,
                        table_space = %table_space,
                        tx = *tx,
                        error = %e,
                        "rollback on session close failed"
                    );
                }
            }
        }
        self.transactions.clear();

        let ids: Vec<String> = self.scanners.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, mut scanner)) = self.scanners.remove(&id) {
                scanner.close();
            }
        }
        debug!(session = self.id, peer = %self.address, "session closed");
    }

    // -----------------------------------------------------------------------
    // Replies
    // -----------------------------------------------------------------------

    fn send_error(&self, request: &Message, cause: &str, extras: Vec<(&str, WireValue)>) {
        let mut reply = Message::error(request, cause);
        for (key, value) in extras {
            reply = reply.with(key, value);
        }
        debug_assert!(reply.get_str(P_CAUSE).is_some());
        self.channel.send_reply(reply);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn wire_params(message: &Message) -> Vec<SqlValue> {
    message
        .get_list(P_PARAMS)
        .map(|list| list.iter().map(|v| v.to_sql()).collect())
        .unwrap_or_default()
}

fn record_map(row: &Tuple) -> WireValue {
    WireValue::Map(
        row.fields()
            .iter()
            .zip(row.values().iter())
            .map(|(name, value)| (name.clone(), WireValue::from_sql(value)))
            .collect(),
    )
}

fn not_leader_extras(err: &crate::engine::EngineError) -> Vec<(&'static str, WireValue)> {
    if err.is_not_leader() {
        vec![(P_NOT_LEADER, WireValue::Bool(true))]
    } else {
        Vec::new()
    }
}
