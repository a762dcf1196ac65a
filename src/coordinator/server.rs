//! Agent channel server
//!
//! Accepts WebSocket links from forwarder agents. Each link must open with
//! an `auth` message inside a short window; a valid one admits the link to
//! the node pool. After that the reader feeds pool dispatch in arrival
//! order and a writer task drains the node's ordered outbound queue.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::coordinator::pool::{LinkCommand, NodePool};
use crate::wire::{AgentMessage, CoordinatorMessage};

/// Window for the mandatory first `auth` message
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind and serve the agent channel forever.
pub async fn run(pool: NodePool, config: CoordinatorConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding agent channel on {}", config.listen_addr))?;
    run_on(listener, pool, config).await
}

/// Serve the agent channel on an already-bound listener.
pub async fn run_on(
    listener: TcpListener,
    pool: NodePool,
    config: CoordinatorConfig,
) -> anyhow::Result<()> {
    info!("agent channel listening on {}", listener.local_addr()?);
    if !config.auth_enabled() {
        warn!("authentication disabled; any token is accepted");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle_link(stream, peer, pool.clone(), config.clone()));
    }
}

async fn handle_link(stream: TcpStream, peer: SocketAddr, pool: NodePool, config: CoordinatorConfig) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("{peer}: WebSocket handshake failed: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    // Unauthenticated phase: exactly one message, inside the window,
    // and it must be a valid auth.
    let first = tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await;
    let auth = match first {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AgentMessage>(&text).ok(),
        Ok(_) => None,
        Err(_) => {
            debug!("{peer}: no auth within {AUTH_TIMEOUT:?}");
            None
        }
    };
    let node_id = match auth {
        Some(AgentMessage::Auth { token, node_id })
            if !config.auth_enabled() || token == config.token =>
        {
            node_id.unwrap_or_else(|| Uuid::new_v4().to_string())
        }
        _ => {
            warn!("{peer}: authentication failed");
            send_auth_result(&mut sink, false).await;
            let _ = sink.close().await;
            return;
        }
    };
    send_auth_result(&mut sink, true).await;
    info!("{peer} authenticated as {node_id}");

    // Writer task: the node's totally-ordered outbound queue.
    let (tx, mut rx) = mpsc::unbounded_channel::<LinkCommand>();
    let writer = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let result = match command {
                LinkCommand::Send(message) => match serde_json::to_string(&message) {
                    Ok(json) => sink.send(Message::Text(json)).await,
                    Err(e) => {
                        warn!("outbound message not encodable: {e}");
                        continue;
                    }
                },
                LinkCommand::Ping => sink.send(Message::Ping(Vec::new())).await,
                LinkCommand::Close => {
                    let _ = sink.close().await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    pool.add_node(&node_id, tx.clone());

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(parsed) => pool.handle_message(&node_id, parsed),
                Err(e) => debug!("{node_id}: malformed message discarded: {e}"),
            },
            Ok(Message::Pong(_)) => pool.handle_pong(&node_id),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("{node_id}: link error: {e}");
                break;
            }
        }
    }

    // Only tear down the entry if it is still ours; a replacement link
    // under the same id stays untouched.
    pool.remove_link(&node_id, &tx);
    drop(tx);
    let _ = writer.await;
    debug!("{node_id}: link closed");
}

async fn send_auth_result<S>(sink: &mut S, success: bool)
where
    S: SinkExt<Message> + Unpin,
{
    if let Ok(json) = serde_json::to_string(&CoordinatorMessage::AuthResult { success }) {
        let _ = sink.send(Message::Text(json)).await;
    }
}
