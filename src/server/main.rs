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

//! Corral server binary.
//!
//! Usage:
//!     corral-server [OPTIONS]
//!
//! Options:
//!     --host <HOST>           Listen address (default: 127.0.0.1)
//!     --port <PORT>           Listen port (default: 7501)
//!     --table-space <NAME>    Table-space served by this node (default: default)
//!     --user <USER>           Username accepted by SASL PLAIN (default: admin)
//!     --password <PASSWORD>   Password for --user (default: admin)
//!     --init <FILE>           Execute a SQL init script at startup

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use corral::engine::mem::MemEngine;
use corral::engine::{Engine, TransactionContext};
use corral::server::channel::{decode_message, spawn_writer, Channel, TcpChannel};
use corral::server::sasl::UserRegistry;
use corral::server::session::SessionPeer;
use corral::sql::Planner;

#[derive(Parser)]
#[command(
    name = "corral-server",
    version,
    about = "Distributed SQL database server node"
)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = 7501)]
    port: u16,

    /// Table-space served by this node
    #[arg(long = "table-space", default_value = "default")]
    table_space: String,

    /// Username accepted by SASL PLAIN
    #[arg(long, default_value = "admin")]
    user: String,

    /// Password for --user
    #[arg(long, default_value = "admin")]
    password: String,

    /// Execute a SQL init script at startup
    #[arg(long)]
    init: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let engine = MemEngine::new(&format!("{}:{}", args.host, args.port));
    engine.add_table_space(&args.table_space);
    let planner = Arc::new(Planner::new(engine.clone()));

    let mut users = UserRegistry::new();
    users.add_user(&args.user, &args.password);
    let users = Arc::new(users);

    if let Some(ref path) = args.init {
        if let Err(e) = run_init_script(&engine, &planner, &args.table_space, path) {
            error!(path, error = %e, "init script failed");
            std::process::exit(1);
        }
    }

    let listen = format!("{}:{}", args.host, args.port);
    let listener = match TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(listen, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    info!(listen, table_space = %args.table_space, "corral-server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let engine = engine.clone();
                        let planner = planner.clone();
                        let users = users.clone();
                        tokio::spawn(async move {
                            serve_connection(socket, addr, engine, planner, users).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
}

/// Drive one client connection: decode frames, feed the session peer in
/// arrival order, and tear the session down when the channel closes.
async fn serve_connection(
    socket: TcpStream,
    addr: SocketAddr,
    engine: Arc<MemEngine>,
    planner: Arc<Planner>,
    users: Arc<UserRegistry>,
) {
    let (read_half, write_half) = socket.into_split();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(write_half, reply_rx);
    let channel: Arc<dyn Channel> = Arc::new(TcpChannel::new(reply_tx));

    let session = SessionPeer::new(
        engine as Arc<dyn Engine>,
        planner,
        channel,
        users,
        &addr.to_string(),
    );
    info!(session = session.id(), peer = %addr, "connection accepted");

    let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => match decode_message(&bytes) {
                Ok(message) => session.handle_message(message),
                Err(e) => {
                    warn!(session = session.id(), error = %e, "undecodable frame, closing");
                    break;
                }
            },
            Err(e) => {
                warn!(session = session.id(), error = %e, "channel read failed");
                break;
            }
        }
    }

    session.channel_closed();
    drop(session);
    let _ = writer.await;
}

/// Execute a `;`-separated SQL script against the engine at startup.
fn run_init_script(
    engine: &Arc<MemEngine>,
    planner: &Arc<Planner>,
    table_space: &str,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let script = std::fs::read_to_string(path)?;
    for statement in script.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        let translated = planner.translate(table_space, statement, vec![], false, true, true, 0)?;
        engine.execute_plan(
            &translated.plan,
            &translated.context,
            TransactionContext::NO_TRANSACTION,
        )?;
        info!(statement, "init");
    }
    Ok(())
}
