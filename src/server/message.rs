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

//! Framed message model: a type tag plus a keyed parameter bag, correlated
//! request → reply by id.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::model::SqlValue;

// ---------------------------------------------------------------------------
// Parameter keys
// ---------------------------------------------------------------------------

pub const P_MECH: &str = "mech";
pub const P_TOKEN: &str = "token";
pub const P_TX: &str = "tx";
pub const P_QUERY: &str = "query";
pub const P_TABLE_SPACE: &str = "tableSpace";
pub const P_PARAMS: &str = "params";
pub const P_DUMP_ID: &str = "dumpId";
pub const P_FETCH_SIZE: &str = "fetchSize";
pub const P_MAX_ROWS: &str = "maxRows";
pub const P_SCANNER_ID: &str = "scannerId";
pub const P_KEY: &str = "key";
pub const P_NOT_LEADER: &str = "notLeader";
pub const P_UPDATE_COUNT: &str = "updateCount";
pub const P_DATA: &str = "data";
pub const P_COLUMNS: &str = "columns";
pub const P_RECORDS: &str = "records";
pub const P_LAST: &str = "last";
pub const P_CAUSE: &str = "cause";
pub const P_TABLE: &str = "table";

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    // Requests
    SaslTokenRequest,
    SaslTokenStep,
    ExecuteStatement,
    RequestTableSpaceDump,
    OpenScanner,
    FetchScannerData,
    CloseScanner,
    // Replies
    SaslServerResponse,
    ExecuteStatementResult,
    ResultSetChunk,
    Ack,
    Error,
}

// ---------------------------------------------------------------------------
// Wire values
// ---------------------------------------------------------------------------

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A value in the keyed parameter bag. Bytes travel base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Bytes(#[serde(with = "b64")] Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
}

impl WireValue {
    pub fn from_sql(value: &SqlValue) -> WireValue {
        match value {
            SqlValue::Null => WireValue::Null,
            SqlValue::Boolean(b) => WireValue::Bool(*b),
            SqlValue::Integer(i) => WireValue::Int(*i as i64),
            SqlValue::Long(i) | SqlValue::Timestamp(i) => WireValue::Int(*i),
            SqlValue::Double(d) => WireValue::Double(*d),
            SqlValue::String(s) => WireValue::Str(s.clone()),
            SqlValue::Bytes(b) => WireValue::Bytes(b.clone()),
        }
    }

    pub fn to_sql(&self) -> SqlValue {
        match self {
            WireValue::Null => SqlValue::Null,
            WireValue::Bool(b) => SqlValue::Boolean(*b),
            WireValue::Int(i) => SqlValue::Long(*i),
            WireValue::Double(d) => SqlValue::Double(*d),
            WireValue::Str(s) => SqlValue::String(s.clone()),
            WireValue::Bytes(b) => SqlValue::Bytes(b.clone()),
            // Structured values have no scalar counterpart; treat as NULL.
            WireValue::List(_) | WireValue::Map(_) => SqlValue::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// One framed message. `reply_to` is 0 on requests and carries the request
/// id on replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub reply_to: u64,
    pub mtype: MessageType,
    pub params: BTreeMap<String, WireValue>,
}

impl Message {
    pub fn new(mtype: MessageType) -> Message {
        Message {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            reply_to: 0,
            mtype,
            params: BTreeMap::new(),
        }
    }

    /// A reply correlated to `request`.
    pub fn reply_to(request: &Message, mtype: MessageType) -> Message {
        let mut m = Message::new(mtype);
        m.reply_to = request.id;
        m
    }

    pub fn with(mut self, key: &str, value: WireValue) -> Message {
        self.params.insert(key.to_string(), value);
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<&WireValue> {
        self.params.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.params.get(key) {
            Some(WireValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.params.get(key) {
            Some(WireValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.params.get(key) {
            Some(WireValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.params.get(key) {
            Some(WireValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[WireValue]> {
        match self.params.get(key) {
            Some(WireValue::List(l)) => Some(l),
            _ => None,
        }
    }

    // -- request constructors ----------------------------------------------

    pub fn sasl_token_request(mech: &str) -> Message {
        Message::new(MessageType::SaslTokenRequest).with(P_MECH, WireValue::Str(mech.into()))
    }

    pub fn sasl_token_step(token: &[u8]) -> Message {
        Message::new(MessageType::SaslTokenStep).with(P_TOKEN, WireValue::Bytes(token.to_vec()))
    }

    pub fn execute_statement(
        tx: u64,
        table_space: &str,
        query: &str,
        params: &[SqlValue],
    ) -> Message {
        Message::new(MessageType::ExecuteStatement)
            .with(P_TX, WireValue::Int(tx as i64))
            .with(P_TABLE_SPACE, WireValue::Str(table_space.into()))
            .with(P_QUERY, WireValue::Str(query.into()))
            .with(
                P_PARAMS,
                WireValue::List(params.iter().map(WireValue::from_sql).collect()),
            )
    }

    pub fn request_table_space_dump(
        dump_id: &str,
        table_space: &str,
        fetch_size: Option<i64>,
    ) -> Message {
        let mut m = Message::new(MessageType::RequestTableSpaceDump)
            .with(P_DUMP_ID, WireValue::Str(dump_id.into()))
            .with(P_TABLE_SPACE, WireValue::Str(table_space.into()));
        if let Some(n) = fetch_size {
            m = m.with(P_FETCH_SIZE, WireValue::Int(n));
        }
        m
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_scanner(
        scanner_id: &str,
        table_space: &str,
        query: &str,
        tx: u64,
        params: &[SqlValue],
        fetch_size: Option<i64>,
        max_rows: Option<i64>,
    ) -> Message {
        let mut m = Message::new(MessageType::OpenScanner)
            .with(P_SCANNER_ID, WireValue::Str(scanner_id.into()))
            .with(P_TABLE_SPACE, WireValue::Str(table_space.into()))
            .with(P_QUERY, WireValue::Str(query.into()))
            .with(P_TX, WireValue::Int(tx as i64))
            .with(
                P_PARAMS,
                WireValue::List(params.iter().map(WireValue::from_sql).collect()),
            );
        if let Some(n) = fetch_size {
            m = m.with(P_FETCH_SIZE, WireValue::Int(n));
        }
        if let Some(n) = max_rows {
            m = m.with(P_MAX_ROWS, WireValue::Int(n));
        }
        m
    }

    pub fn fetch_scanner_data(scanner_id: &str, fetch_size: i64) -> Message {
        Message::new(MessageType::FetchScannerData)
            .with(P_SCANNER_ID, WireValue::Str(scanner_id.into()))
            .with(P_FETCH_SIZE, WireValue::Int(fetch_size))
    }

    pub fn close_scanner(scanner_id: &str) -> Message {
        Message::new(MessageType::CloseScanner)
            .with(P_SCANNER_ID, WireValue::Str(scanner_id.into()))
    }

    // -- reply constructors -------------------------------------------------

    pub fn sasl_server_response(request: &Message, token: &[u8]) -> Message {
        Message::reply_to(request, MessageType::SaslServerResponse)
            .with(P_TOKEN, WireValue::Bytes(token.to_vec()))
    }

    pub fn execute_statement_result(
        request: &Message,
        update_count: u64,
        other_data: Option<WireValue>,
    ) -> Message {
        let mut m = Message::reply_to(request, MessageType::ExecuteStatementResult)
            .with(P_UPDATE_COUNT, WireValue::Int(update_count as i64));
        m = m.with(P_DATA, other_data.unwrap_or(WireValue::Null));
        m
    }

    pub fn resultset_chunk(
        request: &Message,
        scanner_id: &str,
        columns: &[String],
        records: Vec<WireValue>,
        last: bool,
        tx: Option<u64>,
    ) -> Message {
        let mut m = Message::reply_to(request, MessageType::ResultSetChunk)
            .with(P_SCANNER_ID, WireValue::Str(scanner_id.into()))
            .with(
                P_COLUMNS,
                WireValue::List(columns.iter().map(|c| WireValue::Str(c.clone())).collect()),
            )
            .with(P_RECORDS, WireValue::List(records))
            .with(P_LAST, WireValue::Bool(last));
        if let Some(tx) = tx {
            m = m.with(P_TX, WireValue::Int(tx as i64));
        }
        m
    }

    pub fn ack(request: &Message) -> Message {
        Message::reply_to(request, MessageType::Ack)
    }

    pub fn error(request: &Message, cause: &str) -> Message {
        Message::reply_to(request, MessageType::Error)
            .with(P_CAUSE, WireValue::Str(cause.into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
