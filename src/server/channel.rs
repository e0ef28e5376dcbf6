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

//! Reply channel abstraction and the frame codec.
//!
//! The session peer only sees decoded `Message`s and a `Channel`; the wire
//! below is a 4-byte length prefix followed by the JSON encoding of the
//! message, built in pooled buffers.

use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::{BufferPool, FrameBuilder};
use crate::server::message::Message;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Outbound half of a client connection. `send_reply` is non-blocking at
/// this layer; replies to a closed channel are dropped silently.
pub trait Channel: Send + Sync {
    fn send_reply(&self, message: Message);
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Errors from the frame codec.
#[derive(Debug)]
pub enum WireError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Encode(msg) => write!(f, "frame encode error: {msg}"),
            WireError::Decode(msg) => write!(f, "frame decode error: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Serialize a message into a pooled frame payload (without the length
/// prefix, which the framed transport adds).
pub fn encode_message(pool: &Arc<BufferPool>, message: &Message) -> Result<Bytes, WireError> {
    let mut builder = FrameBuilder::new(pool.clone());
    serde_json::to_writer(&mut builder, message).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(builder.finish())
}

/// Decode one frame payload into a message.
pub fn decode_message(payload: &[u8]) -> Result<Message, WireError> {
    serde_json::from_slice(payload).map_err(|e| WireError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// TCP channel (server runtime)
// ---------------------------------------------------------------------------

#[cfg(feature = "server")]
pub use tcp::{spawn_writer, TcpChannel};

#[cfg(feature = "server")]
mod tcp {
    use std::sync::Arc;

    use futures::SinkExt;
    use tokio::net::tcp::OwnedWriteHalf;
    use tokio::sync::mpsc;
    use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
    use tracing::debug;

    use super::{encode_message, Channel};
    use crate::buffer::BufferPool;
    use crate::server::message::Message;

    /// Channel backed by an unbounded queue drained by a writer task.
    /// Sending never blocks; once the writer is gone, replies are dropped.
    pub struct TcpChannel {
        out: mpsc::UnboundedSender<Message>,
    }

    impl TcpChannel {
        pub fn new(out: mpsc::UnboundedSender<Message>) -> TcpChannel {
            TcpChannel { out }
        }
    }

    impl Channel for TcpChannel {
        fn send_reply(&self, message: Message) {
            let _ = self.out.send(message);
        }
    }

    /// Spawn the writer task for one connection: drains the reply queue,
    /// serializes each message into a pooled frame, and writes it out
    /// length-prefixed.
    pub fn spawn_writer(
        write_half: OwnedWriteHalf,
        mut replies: mpsc::UnboundedReceiver<Message>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let pool = BufferPool::new();
            let mut framed = FramedWrite::new(write_half, LengthDelimitedCodec::new());
            while let Some(message) = replies.recv().await {
                let frame = match encode_message(&pool, &message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "dropping unencodable reply");
                        continue;
                    }
                };
                if let Err(e) = framed.send(frame).await {
                    debug!(error = %e, "reply write failed, stopping writer");
                    break;
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::message::{MessageType, P_QUERY};

    #[test]
    fn codec_roundtrip() {
        let pool = BufferPool::new();
        let m = Message::execute_statement(3, "ts1", "SELECT a FROM t", &[]);
        let frame = encode_message(&pool, &m).unwrap();
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.mtype, MessageType::ExecuteStatement);
        assert_eq!(decoded.get_str(P_QUERY), Some("SELECT a FROM t"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_message(b"{not json").is_err());
    }
}
