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

//! Session peer scenarios over a recording channel: the authentication state
//! machine, result shaping, cursor lifecycle, transaction tracking, and
//! teardown.

use std::sync::{Arc, Mutex};

use corral::engine::mem::MemEngine;
use corral::engine::{Engine, EngineError, ExecutionResult, TransactionContext};
use corral::model::{Column, ColumnType, SqlValue, Table};
use corral::server::channel::Channel;
use corral::server::message::{
    Message, MessageType, WireValue, P_CAUSE, P_DATA, P_DUMP_ID, P_LAST, P_NOT_LEADER, P_RECORDS,
    P_SCANNER_ID, P_TOKEN, P_TX, P_UPDATE_COUNT,
};
use corral::server::sasl::UserRegistry;
use corral::server::session::SessionPeer;
use corral::sql::plan::{
    CreateTableStatement, EvaluationContext, ExecutionPlan, Statement,
};
use corral::sql::Planner;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<Message>>,
}

impl RecordingChannel {
    fn new() -> Arc<RecordingChannel> {
        Arc::new(RecordingChannel::default())
    }

    fn take(&self) -> Vec<Message> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    fn last(&self) -> Message {
        self.sent
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no reply recorded")
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Channel for RecordingChannel {
    fn send_reply(&self, message: Message) {
        self.sent.lock().unwrap().push(message);
    }
}

/// Engine wrapper that records teardown rollbacks and every call made on
/// behalf of the session after it closed.
struct SpyEngine {
    inner: Arc<MemEngine>,
    rollbacks: Mutex<Vec<(String, u64)>>,
    statements: Mutex<u64>,
}

impl SpyEngine {
    fn new(inner: Arc<MemEngine>) -> Arc<SpyEngine> {
        Arc::new(SpyEngine {
            inner,
            rollbacks: Mutex::new(Vec::new()),
            statements: Mutex::new(0),
        })
    }

    fn rollbacks(&self) -> Vec<(String, u64)> {
        self.rollbacks.lock().unwrap().clone()
    }

    fn statement_calls(&self) -> u64 {
        *self.statements.lock().unwrap()
    }
}

impl corral::sql::PlannerMetadata for SpyEngine {
    fn local_table_spaces(&self) -> Vec<String> {
        self.inner.local_table_spaces()
    }

    fn tables_for_planner(&self, table_space: &str) -> Vec<Table> {
        self.inner.tables_for_planner(table_space)
    }

    fn node_id(&self) -> String {
        self.inner.node_id()
    }
}

impl Engine for SpyEngine {
    fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        ctx: &EvaluationContext,
        tx: TransactionContext,
    ) -> Result<ExecutionResult, EngineError> {
        self.inner.execute_plan(plan, ctx, tx)
    }

    fn execute_statement(
        &self,
        statement: &Statement,
        ctx: &EvaluationContext,
        tx: TransactionContext,
    ) -> Result<ExecutionResult, EngineError> {
        *self.statements.lock().unwrap() += 1;
        if let Statement::RollbackTransaction { table_space, tx } = statement {
            self.rollbacks
                .lock()
                .unwrap()
                .push((table_space.clone(), *tx));
        }
        self.inner.execute_statement(statement, ctx, tx)
    }

    fn table_schema(&self, table_space: &str, table: &str) -> Option<Table> {
        self.inner.table_schema(table_space, table)
    }

    fn dump_table_space(
        &self,
        table_space: &str,
        dump_id: &str,
        request: &Message,
        channel: &dyn Channel,
        fetch_size: usize,
    ) -> Result<(), EngineError> {
        self.inner
            .dump_table_space(table_space, dump_id, request, channel, fetch_size)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    engine: Arc<MemEngine>,
    spy: Arc<SpyEngine>,
    channel: Arc<RecordingChannel>,
    session: SessionPeer,
}

fn table_t() -> Table {
    Table {
        table_space: "ts1".into(),
        name: "t".into(),
        columns: vec![
            Column::new("a", ColumnType::Long),
            Column::new("name", ColumnType::String),
        ],
        primary_key: vec!["a".into()],
    }
}

fn fixture() -> Fixture {
    let engine = MemEngine::new("node-test");
    engine.add_table_space("ts1");
    engine
        .execute_statement(
            &Statement::CreateTable(CreateTableStatement { table: table_t() }),
            &EvaluationContext::default(),
            TransactionContext::NO_TRANSACTION,
        )
        .unwrap();
    let spy = SpyEngine::new(engine.clone());
    let planner = Arc::new(Planner::new(spy.clone()));
    let channel = RecordingChannel::new();
    let mut users = UserRegistry::new();
    users.add_user("alice", "secret");
    let session = SessionPeer::new(
        spy.clone(),
        planner,
        channel.clone(),
        Arc::new(users),
        "127.0.0.1:9",
    );
    Fixture {
        engine,
        spy,
        channel,
        session,
    }
}

fn authenticate(f: &Fixture) {
    f.session
        .handle_message(Message::sasl_token_request("PLAIN"));
    let challenge = f.channel.last();
    assert_eq!(challenge.mtype, MessageType::SaslServerResponse);
    assert!(!challenge.get_bytes(P_TOKEN).unwrap().is_empty());

    f.session
        .handle_message(Message::sasl_token_step(b"\0alice\0secret"));
    let done = f.channel.last();
    assert_eq!(done.mtype, MessageType::SaslServerResponse);
    assert!(done.get_bytes(P_TOKEN).unwrap().is_empty());
    assert!(f.session.is_authenticated());
    f.channel.take();
}

fn execute(f: &Fixture, tx: u64, query: &str, params: &[SqlValue]) -> Message {
    f.session
        .handle_message(Message::execute_statement(tx, "ts1", query, params));
    f.channel.last()
}

fn data_map(reply: &Message) -> std::collections::BTreeMap<String, WireValue> {
    match reply.get(P_DATA) {
        Some(WireValue::Map(m)) => m.clone(),
        other => panic!("expected map data, got {other:?}"),
    }
}

fn begin_tx(f: &Fixture) -> u64 {
    let reply = execute(f, 0, "BEGIN", &[]);
    assert_eq!(reply.mtype, MessageType::ExecuteStatementResult);
    match data_map(&reply).get(P_TX) {
        Some(WireValue::Int(tx)) => *tx as u64,
        other => panic!("expected tx in reply, got {other:?}"),
    }
}

fn insert_rows(f: &Fixture, n: i64) {
    for i in 0..n {
        let reply = execute(
            f,
            0,
            "INSERT INTO t(a, name) VALUES (?, ?)",
            &[SqlValue::Long(i), SqlValue::String(format!("row-{i}"))],
        );
        assert_eq!(reply.mtype, MessageType::ExecuteStatementResult, "{reply:?}");
    }
    f.channel.take();
}

// ---------------------------------------------------------------------------
// Authentication state machine
// ---------------------------------------------------------------------------

#[test]
fn non_sasl_messages_require_authentication() {
    let f = fixture();
    let requests = vec![
        Message::execute_statement(0, "ts1", "BEGIN", &[]),
        Message::open_scanner("s1", "ts1", "SELECT * FROM t", 0, &[], None, None),
        Message::fetch_scanner_data("s1", 10),
        Message::close_scanner("s1"),
        Message::request_table_space_dump("d1", "ts1", None),
    ];
    for request in requests {
        f.session.handle_message(request);
        let reply = f.channel.last();
        assert_eq!(reply.mtype, MessageType::Error);
        assert_eq!(reply.get_str(P_CAUSE), Some("authentication required"));
    }
    // No side effects: no statements hit the engine.
    assert_eq!(f.spy.statement_calls(), 0);
    assert!(!f.session.is_authenticated());
}

#[test]
fn sasl_plain_handshake_latches_username() {
    let f = fixture();
    authenticate(&f);
    assert_eq!(f.session.username(), Some("alice"));

    // The username is stable for the rest of the session.
    execute(&f, 0, "BEGIN", &[]);
    assert_eq!(f.session.username(), Some("alice"));
}

#[test]
fn failed_authentication_has_a_fixed_cause() {
    let f = fixture();
    f.session
        .handle_message(Message::sasl_token_request("PLAIN"));
    f.session
        .handle_message(Message::sasl_token_step(b"\0alice\0wrong"));
    let reply = f.channel.last();
    assert_eq!(reply.mtype, MessageType::Error);
    assert_eq!(reply.get_str(P_CAUSE), Some("authentication failed"));
    assert!(!f.session.is_authenticated());
}

#[test]
fn unknown_mechanism_gets_a_generic_error() {
    let f = fixture();
    f.session
        .handle_message(Message::sasl_token_request("SCRAM-SHA-256"));
    let reply = f.channel.last();
    assert_eq!(reply.mtype, MessageType::Error);
    // No mechanism detail leaks.
    assert_eq!(reply.get_str(P_CAUSE), Some("authentication error"));
}

// ---------------------------------------------------------------------------
// Statement execution and transaction tracking
// ---------------------------------------------------------------------------

#[test]
fn begin_insert_commit_roundtrip() {
    let f = fixture();
    authenticate(&f);

    let tx = begin_tx(&f);
    assert_eq!(f.session.tracked_transactions("ts1"), vec![tx]);

    let reply = execute(
        &f,
        tx,
        "INSERT INTO t(a) VALUES (?)",
        &[SqlValue::Long(1)],
    );
    assert_eq!(reply.mtype, MessageType::ExecuteStatementResult);
    assert_eq!(reply.get_int(P_UPDATE_COUNT), Some(1));
    // The engine's primary-key blob comes back decoded against the schema.
    assert_eq!(data_map(&reply).get("key"), Some(&WireValue::Int(1)));

    let reply = execute(&f, tx, "COMMIT", &[]);
    assert_eq!(reply.mtype, MessageType::ExecuteStatementResult);
    assert!(f.session.tracked_transactions("ts1").is_empty());
}

#[test]
fn ddl_replies_one_and_null() {
    let f = fixture();
    authenticate(&f);
    let reply = execute(
        &f,
        0,
        "CREATE TABLE u (id int primary key, v bigint)",
        &[],
    );
    assert_eq!(reply.mtype, MessageType::ExecuteStatementResult);
    assert_eq!(reply.get_int(P_UPDATE_COUNT), Some(1));
    assert_eq!(reply.get(P_DATA), Some(&WireValue::Null));
}

#[test]
fn get_by_primary_key_shapes_found_and_missing() {
    let f = fixture();
    authenticate(&f);
    insert_rows(&f, 1);

    let reply = execute(&f, 0, "SELECT * FROM t WHERE a = 0", &[]);
    assert_eq!(reply.get_int(P_UPDATE_COUNT), Some(1));
    let record = data_map(&reply);
    assert_eq!(record.get("a"), Some(&WireValue::Int(0)));
    assert_eq!(record.get("name"), Some(&WireValue::Str("row-0".into())));

    let reply = execute(&f, 0, "SELECT * FROM t WHERE a = 99", &[]);
    assert_eq!(reply.get_int(P_UPDATE_COUNT), Some(0));
    assert_eq!(reply.get(P_DATA), Some(&WireValue::Null));
}

#[test]
fn not_leader_failures_attach_the_redirect_marker() {
    let f = fixture();
    authenticate(&f);
    f.engine.set_leader("ts1", false);
    let reply = execute(&f, 0, "INSERT INTO t(a) VALUES (1)", &[]);
    assert_eq!(reply.mtype, MessageType::Error);
    assert_eq!(reply.get_bool(P_NOT_LEADER), Some(true));
}

#[test]
fn planning_failures_reply_with_the_error_message() {
    let f = fixture();
    authenticate(&f);
    let reply = execute(&f, 0, "SELECT * FROM missing", &[]);
    assert_eq!(reply.mtype, MessageType::Error);
    assert!(reply.get_str(P_CAUSE).unwrap().contains("missing"));
    assert_eq!(reply.get_bool(P_NOT_LEADER), None);
}

#[test]
fn unexpected_message_type_is_an_error() {
    let f = fixture();
    authenticate(&f);
    f.session.handle_message(Message::new(MessageType::Ack));
    let reply = f.channel.last();
    assert_eq!(reply.mtype, MessageType::Error);
    assert!(reply.get_str(P_CAUSE).unwrap().contains("unknown message type"));
}

// ---------------------------------------------------------------------------
// Cursor lifecycle
// ---------------------------------------------------------------------------

#[test]
fn scanner_chunked_fetch_until_exhaustion() {
    let f = fixture();
    authenticate(&f);
    insert_rows(&f, 5);

    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "SELECT a FROM t",
        0,
        &[],
        Some(2),
        None,
    ));
    let first = f.channel.last();
    assert_eq!(first.mtype, MessageType::ResultSetChunk);
    assert_eq!(first.get_list(P_RECORDS).unwrap().len(), 2);
    assert_eq!(first.get_bool(P_LAST), Some(false));
    assert!(f.session.has_scanner("c1"));

    f.session
        .handle_message(Message::fetch_scanner_data("c1", 2));
    let second = f.channel.last();
    assert_eq!(second.get_list(P_RECORDS).unwrap().len(), 2);
    assert_eq!(second.get_bool(P_LAST), Some(false));

    f.session
        .handle_message(Message::fetch_scanner_data("c1", 2));
    let third = f.channel.last();
    assert_eq!(third.get_list(P_RECORDS).unwrap().len(), 1);
    assert_eq!(third.get_bool(P_LAST), Some(true));
    assert!(!f.session.has_scanner("c1"));

    // The cursor is gone: a further fetch is an unknown-cursor error
    // carrying the scanner id.
    f.session
        .handle_message(Message::fetch_scanner_data("c1", 2));
    let gone = f.channel.last();
    assert_eq!(gone.mtype, MessageType::Error);
    assert_eq!(gone.get_str(P_SCANNER_ID), Some("c1"));
}

#[test]
fn empty_scan_never_registers_a_cursor() {
    let f = fixture();
    authenticate(&f);
    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "SELECT a FROM t",
        0,
        &[],
        Some(10),
        None,
    ));
    let reply = f.channel.last();
    assert_eq!(reply.mtype, MessageType::ResultSetChunk);
    assert_eq!(reply.get_list(P_RECORDS).unwrap().len(), 0);
    assert_eq!(reply.get_bool(P_LAST), Some(true));
    assert!(!f.session.has_scanner("c1"));
}

#[test]
fn open_scanner_rejects_non_scan_statements() {
    let f = fixture();
    authenticate(&f);
    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "INSERT INTO t(a) VALUES (1)",
        0,
        &[],
        None,
        None,
    ));
    let reply = f.channel.last();
    assert_eq!(reply.mtype, MessageType::Error);
    assert!(!f.session.has_scanner("c1"));
}

#[test]
fn duplicate_scanner_id_is_rejected() {
    let f = fixture();
    authenticate(&f);
    insert_rows(&f, 5);
    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "SELECT a FROM t",
        0,
        &[],
        Some(2),
        None,
    ));
    f.channel.take();
    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "SELECT a FROM t",
        0,
        &[],
        Some(2),
        None,
    ));
    let reply = f.channel.last();
    assert_eq!(reply.mtype, MessageType::Error);
    assert!(f.session.has_scanner("c1"));
}

#[test]
fn max_rows_bounds_the_scanner() {
    let f = fixture();
    authenticate(&f);
    insert_rows(&f, 10);
    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "SELECT a FROM t",
        0,
        &[],
        Some(2),
        Some(3),
    ));
    assert_eq!(f.channel.last().get_bool(P_LAST), Some(false));
    f.session
        .handle_message(Message::fetch_scanner_data("c1", 5));
    let reply = f.channel.last();
    assert_eq!(reply.get_list(P_RECORDS).unwrap().len(), 1);
    assert_eq!(reply.get_bool(P_LAST), Some(true));
    assert!(!f.session.has_scanner("c1"));
}

#[test]
fn close_scanner_acknowledges_and_unknown_close_errors() {
    let f = fixture();
    authenticate(&f);
    insert_rows(&f, 5);
    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "SELECT a FROM t",
        0,
        &[],
        Some(2),
        None,
    ));
    f.channel.take();

    f.session.handle_message(Message::close_scanner("c1"));
    assert_eq!(f.channel.last().mtype, MessageType::Ack);
    assert!(!f.session.has_scanner("c1"));

    f.session.handle_message(Message::close_scanner("c1"));
    let reply = f.channel.last();
    assert_eq!(reply.mtype, MessageType::Error);
    assert_eq!(reply.get_str(P_SCANNER_ID), Some("c1"));
}

// ---------------------------------------------------------------------------
// Table-space dump
// ---------------------------------------------------------------------------

#[test]
fn dump_streams_chunks_on_the_channel() {
    let f = fixture();
    authenticate(&f);
    insert_rows(&f, 5);
    f.session
        .handle_message(Message::request_table_space_dump("d1", "ts1", Some(2)));
    let frames = f.channel.take();
    assert!(!frames.is_empty());
    for frame in &frames {
        assert_eq!(frame.mtype, MessageType::ResultSetChunk);
        assert_eq!(frame.get_str(P_DUMP_ID), Some("d1"));
    }
    assert_eq!(frames.last().unwrap().get_bool(P_LAST), Some(true));
    let rows: usize = frames
        .iter()
        .map(|m| m.get_list(P_RECORDS).map(<[WireValue]>::len).unwrap_or(0))
        .sum();
    assert_eq!(rows, 5);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn channel_close_rolls_back_and_closes_cursors() {
    let f = fixture();
    authenticate(&f);
    insert_rows(&f, 5);

    let tx = begin_tx(&f);
    f.session.handle_message(Message::open_scanner(
        "c1",
        "ts1",
        "SELECT a FROM t",
        0,
        &[],
        Some(2),
        None,
    ));
    f.channel.take();
    assert!(f.session.has_scanner("c1"));

    let calls_before = f.spy.statement_calls();
    f.session.channel_closed();

    assert_eq!(f.spy.rollbacks(), vec![("ts1".to_string(), tx)]);
    assert!(!f.session.has_scanner("c1"));
    assert!(f.session.tracked_transactions("ts1").is_empty());
    assert_eq!(f.spy.statement_calls(), calls_before + 1);

    // Closed is terminal: no further replies, no further engine calls.
    f.session
        .handle_message(Message::execute_statement(0, "ts1", "BEGIN", &[]));
    assert_eq!(f.channel.count(), 0);
    assert_eq!(f.spy.statement_calls(), calls_before + 1);
}

#[test]
fn commit_and_rollback_shrink_the_tracked_set() {
    let f = fixture();
    authenticate(&f);
    let tx1 = begin_tx(&f);
    let tx2 = begin_tx(&f);
    assert_eq!(f.session.tracked_transactions("ts1").len(), 2);

    execute(&f, tx1, "COMMIT", &[]);
    assert_eq!(f.session.tracked_transactions("ts1"), vec![tx2]);

    execute(&f, tx2, "ROLLBACK", &[]);
    assert!(f.session.tracked_transactions("ts1").is_empty());

    // Nothing tracked: teardown issues no rollbacks.
    f.session.channel_closed();
    assert!(f.spy.rollbacks().is_empty());
}
