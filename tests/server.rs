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

//! End-to-end tests: start corral-server as a child process, speak the
//! framed protocol over TCP, and run the full handshake / execute / scan
//! flows against the in-memory engine.

#![cfg(feature = "server")]

use std::io::Write;
use std::process::{Child, Command};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use corral::buffer::BufferPool;
use corral::model::SqlValue;
use corral::server::channel::{decode_message, encode_message};
use corral::server::message::{
    Message, MessageType, WireValue, P_CAUSE, P_DATA, P_LAST, P_RECORDS, P_TOKEN, P_TX,
    P_UPDATE_COUNT,
};

/// RAII guard that kills the server child process on drop.
struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

fn start_server(port: u16, init_sql: &str) -> (ServerGuard, tempfile::NamedTempFile) {
    let mut init = tempfile::NamedTempFile::with_suffix(".sql").unwrap();
    write!(init, "{init_sql}").unwrap();
    init.flush().unwrap();

    let binary = env!("CARGO_BIN_EXE_corral-server");
    let child = Command::new(binary)
        .arg("--port")
        .arg(port.to_string())
        .arg("--table-space")
        .arg("ts1")
        .arg("--user")
        .arg("alice")
        .arg("--password")
        .arg("secret")
        .arg("--init")
        .arg(init.path())
        .spawn()
        .expect("failed to start corral-server");
    (ServerGuard(child), init)
}

struct Client {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    pool: std::sync::Arc<BufferPool>,
}

impl Client {
    async fn connect(port: u16) -> Client {
        // The server needs a moment to come up; retry the connect.
        for _ in 0..50 {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    return Client {
                        framed: Framed::new(stream, LengthDelimitedCodec::new()),
                        pool: BufferPool::new(),
                    }
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
        panic!("server did not come up on port {port}");
    }

    async fn roundtrip(&mut self, request: Message) -> Message {
        let frame = encode_message(&self.pool, &request).unwrap();
        self.framed.send(frame).await.unwrap();
        let payload = self
            .framed
            .next()
            .await
            .expect("connection closed")
            .expect("read failed");
        let reply = decode_message(&payload).unwrap();
        assert_eq!(reply.reply_to, request.id, "reply must correlate");
        reply
    }

    async fn authenticate(&mut self) {
        let challenge = self.roundtrip(Message::sasl_token_request("PLAIN")).await;
        assert_eq!(challenge.mtype, MessageType::SaslServerResponse);
        assert!(!challenge.get_bytes(P_TOKEN).unwrap().is_empty());
        let done = self
            .roundtrip(Message::sasl_token_step(b"\0alice\0secret"))
            .await;
        assert_eq!(done.mtype, MessageType::SaslServerResponse);
        assert!(done.get_bytes(P_TOKEN).unwrap().is_empty());
    }
}

const INIT_SQL: &str = "CREATE TABLE t (a bigint primary key, name varchar(32))";

#[tokio::test]
async fn unauthenticated_requests_are_refused() {
    let (_server, _init) = start_server(17501, INIT_SQL);
    let mut client = Client::connect(17501).await;
    let reply = client
        .roundtrip(Message::execute_statement(0, "ts1", "BEGIN", &[]))
        .await;
    assert_eq!(reply.mtype, MessageType::Error);
    assert_eq!(reply.get_str(P_CAUSE), Some("authentication required"));
}

#[tokio::test]
async fn wrong_credentials_are_refused() {
    let (_server, _init) = start_server(17502, INIT_SQL);
    let mut client = Client::connect(17502).await;
    client.roundtrip(Message::sasl_token_request("PLAIN")).await;
    let reply = client
        .roundtrip(Message::sasl_token_step(b"\0mallory\0nope"))
        .await;
    assert_eq!(reply.mtype, MessageType::Error);
    assert_eq!(reply.get_str(P_CAUSE), Some("authentication failed"));
}

#[tokio::test]
async fn transaction_insert_select_over_the_wire() {
    let (_server, _init) = start_server(17503, INIT_SQL);
    let mut client = Client::connect(17503).await;
    client.authenticate().await;

    // BEGIN
    let begin = client
        .roundtrip(Message::execute_statement(0, "ts1", "BEGIN", &[]))
        .await;
    assert_eq!(begin.mtype, MessageType::ExecuteStatementResult);
    let tx = match begin.get(P_DATA) {
        Some(WireValue::Map(m)) => match m.get(P_TX) {
            Some(WireValue::Int(tx)) => *tx as u64,
            other => panic!("expected tx, got {other:?}"),
        },
        other => panic!("expected map, got {other:?}"),
    };

    // INSERT under the transaction, with parameters.
    let insert = client
        .roundtrip(Message::execute_statement(
            tx,
            "ts1",
            "INSERT INTO t(a, name) VALUES (?, ?)",
            &[SqlValue::Long(7), SqlValue::String("bessie".into())],
        ))
        .await;
    assert_eq!(insert.mtype, MessageType::ExecuteStatementResult);
    assert_eq!(insert.get_int(P_UPDATE_COUNT), Some(1));
    match insert.get(P_DATA) {
        Some(WireValue::Map(m)) => assert_eq!(m.get("key"), Some(&WireValue::Int(7))),
        other => panic!("expected key data, got {other:?}"),
    }

    // COMMIT
    let commit = client
        .roundtrip(Message::execute_statement(tx, "ts1", "COMMIT", &[]))
        .await;
    assert_eq!(commit.mtype, MessageType::ExecuteStatementResult);

    // Point lookup by primary key.
    let get = client
        .roundtrip(Message::execute_statement(
            0,
            "ts1",
            "SELECT * FROM t WHERE a = 7",
            &[],
        ))
        .await;
    assert_eq!(get.get_int(P_UPDATE_COUNT), Some(1));
    match get.get(P_DATA) {
        Some(WireValue::Map(m)) => {
            assert_eq!(m.get("name"), Some(&WireValue::Str("bessie".into())))
        }
        other => panic!("expected record, got {other:?}"),
    }
}

#[tokio::test]
async fn scanner_lifecycle_over_the_wire() {
    let (_server, _init) = start_server(17504, INIT_SQL);
    let mut client = Client::connect(17504).await;
    client.authenticate().await;

    for i in 0..5i64 {
        let reply = client
            .roundtrip(Message::execute_statement(
                0,
                "ts1",
                "INSERT INTO t(a, name) VALUES (?, ?)",
                &[SqlValue::Long(i), SqlValue::String(format!("n{i}"))],
            ))
            .await;
        assert_eq!(reply.mtype, MessageType::ExecuteStatementResult);
    }

    let first = client
        .roundtrip(Message::open_scanner(
            "c1",
            "ts1",
            "SELECT a FROM t ORDER BY a",
            0,
            &[],
            Some(2),
            None,
        ))
        .await;
    assert_eq!(first.mtype, MessageType::ResultSetChunk);
    assert_eq!(first.get_list(P_RECORDS).unwrap().len(), 2);
    assert_eq!(first.get_bool(P_LAST), Some(false));

    let mut total = 2;
    loop {
        let chunk = client
            .roundtrip(Message::fetch_scanner_data("c1", 2))
            .await;
        assert_eq!(chunk.mtype, MessageType::ResultSetChunk);
        total += chunk.get_list(P_RECORDS).unwrap().len();
        if chunk.get_bool(P_LAST) == Some(true) {
            break;
        }
    }
    assert_eq!(total, 5);

    // The cursor is gone after the last chunk.
    let reply = client
        .roundtrip(Message::fetch_scanner_data("c1", 2))
        .await;
    assert_eq!(reply.mtype, MessageType::Error);
}

#[tokio::test]
async fn close_scanner_is_acknowledged() {
    let (_server, _init) = start_server(17505, INIT_SQL);
    let mut client = Client::connect(17505).await;
    client.authenticate().await;

    for i in 0..5i64 {
        client
            .roundtrip(Message::execute_statement(
                0,
                "ts1",
                "INSERT INTO t(a) VALUES (?)",
                &[SqlValue::Long(i)],
            ))
            .await;
    }
    let first = client
        .roundtrip(Message::open_scanner(
            "c9",
            "ts1",
            "SELECT a FROM t",
            0,
            &[],
            Some(2),
            None,
        ))
        .await;
    assert_eq!(first.get_bool(P_LAST), Some(false));

    let closed = client.roundtrip(Message::close_scanner("c9")).await;
    assert_eq!(closed.mtype, MessageType::Ack);

    let reply = client.roundtrip(Message::fetch_scanner_data("c9", 2)).await;
    assert_eq!(reply.mtype, MessageType::Error);
}
