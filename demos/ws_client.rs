//! WebSocket client against a local toy backend.
//!
//! Demonstrates:
//! - Building a connection with the lobby preset
//! - Session open handshake and stored credential
//! - Request/response and push notifications
//! - Pause/resume buffering
//! - Graceful close with the close command
//!
//! Usage:
//!   cargo run --example ws_client
//!   RUST_LOG=command_link=debug cargo run --example ws_client

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use command_link::{
    Command, CommandKind, Connection, ConnectionOptions, FrameCodec, JsonCodec, Operation,
    SessionHandshake,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("command_link=info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    println!("=== WebSocket Client ===\n");

    // ========================================================================
    // Backend
    // ========================================================================

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/", listener.local_addr()?);
    tokio::spawn(serve(listener));
    println!("[1] Toy backend listening on {url}\n");

    // ========================================================================
    // Connect
    // ========================================================================

    let connection = Connection::builder()
        .endpoint(&url)
        .options(ConnectionOptions::lobby())
        .handshake(SessionHandshake::new("demo-app", "alice").with_user_agent("ws_client/0.1"))
        .build()?;

    connection.set_notification_handler(|command| println!("    <- push {command} {}", command.body));
    connection.set_event_handler(|event| println!("    <- event {event:?}"));

    println!("[2] Connecting...");
    connection.connect().await?;
    let credential = connection.credential().context("server issued no credential")?;
    println!("    ✓ {} ({} byte credential)\n", connection.state(), credential.token().len());

    // ========================================================================
    // Request / Response
    // ========================================================================

    println!("[3] Starting a conversation...");
    let reply = connection
        .send_request(CommandKind::Conv, Operation::Start, json!({"m": ["bob"]}))
        .await?;
    println!("    ✓ {reply} cid={}\n", reply.get_str("cid"));

    // ========================================================================
    // Pause / Resume
    // ========================================================================

    println!("[4] Pausing and asking for pushes...");
    connection.pause()?;
    connection
        .send_command(CommandKind::Events, Operation::Add, json!({"count": 3}))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("    {} notifications buffered", connection.buffered_notifications());

    connection.resume()?;
    println!("    ✓ resumed\n");

    // ========================================================================
    // Close
    // ========================================================================

    println!("[5] Closing...");
    connection.close().await?;
    println!("    ✓ {}", connection.state());

    Ok(())
}

// ============================================================================
// Toy Backend
// ============================================================================

async fn serve(listener: TcpListener) -> anyhow::Result<()> {
    let (stream, _) = listener.accept().await?;
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    while let Some(message) = ws.next().await {
        let frame = match message? {
            Message::Binary(data) => data.to_vec(),
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Close(_) => break,
            _ => continue,
        };
        let request = JsonCodec.decode(&frame)?;

        let replies = match (request.kind, request.op) {
            (CommandKind::Echo, _) => vec![Command::bare(CommandKind::Echo)],
            (CommandKind::Session, Some(Operation::Open)) => vec![reply(
                &request,
                Operation::Opened,
                json!({"st": STANDARD.encode(b"demo-session"), "stTtl": 3600}),
            )],
            (CommandKind::Conv, Some(Operation::Start)) => {
                vec![reply(&request, Operation::Started, json!({"cid": "c-42"}))]
            }
            (CommandKind::Events, Some(Operation::Add)) => (1..=request.get_i64("count"))
                .map(|n| Command::new(CommandKind::Events, Operation::Added, json!({"n": n})))
                .collect(),
            _ => Vec::new(),
        };

        for command in replies {
            ws.send(Message::Binary(JsonCodec.encode(&command)?.into())).await?;
        }
    }

    Ok(())
}

fn reply(request: &Command, op: Operation, body: serde_json::Value) -> Command {
    let mut response = Command::new(request.kind, op, body);
    response.request_id = request.request_id;
    response
}
