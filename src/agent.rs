//! Forwarder agent runtime
//!
//! A long-lived process that owns one BLE endpoint and executes coordinator
//! instructions against it. The endpoint is never brought up on its own:
//! connecting is coordinator-gated, because the device accepts only one
//! link and the coordinator decides who holds it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use collarlink_ble::{BleEndpoint, EndpointEvent, Frame};

use crate::config::Config;
use crate::wire::{AgentMessage, CoordinatorMessage, ScanDevice};

/// Period of the unsolicited status report
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Reconnect backoff bounds
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Delay before echoing the battery level after `get_battery`. The BLE
/// round-trip is not awaited; the echoed level is the last known one.
const BATTERY_ECHO_DELAY: Duration = Duration::from_secs(1);

/// Outbound traffic of one coordinator session
enum Outbound {
    Message(AgentMessage),
    Pong(Vec<u8>),
}

/// Run the forwarder agent forever.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let endpoint = Arc::new(BleEndpoint::new(config.device.endpoint_config()).await?);
    info!(
        "forwarder agent starting; coordinator at {}",
        config.agent.server_url
    );

    let mut backoff = BACKOFF_MIN;
    loop {
        match session(&config, &endpoint).await {
            Ok(true) => backoff = BACKOFF_MIN,
            Ok(false) => warn!("coordinator rejected authentication"),
            Err(e) => warn!("coordinator link failed: {e}"),
        }
        info!("reconnecting in {backoff:?}");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// One link to the coordinator, from dial to close.
///
/// Returns whether authentication succeeded during the session.
async fn session(config: &Config, endpoint: &Arc<BleEndpoint>) -> anyhow::Result<bool> {
    let (ws, _) = connect_async(config.agent.server_url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();
    debug!("link to coordinator open");

    let auth = AgentMessage::Auth {
        token: config.agent.token.clone(),
        node_id: config.agent.node_id.clone(),
    };
    sink.send(Message::Text(serde_json::to_string(&auth)?)).await?;

    let authed = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<CoordinatorMessage>(&text) {
                    Ok(CoordinatorMessage::AuthResult { success }) => break success,
                    Ok(other) => debug!("message before auth_result ignored: {other:?}"),
                    Err(e) => debug!("malformed message discarded: {e}"),
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = sink.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => anyhow::bail!("link closed before auth_result"),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };
    if !authed {
        let _ = sink.close().await;
        return Ok(false);
    }
    info!("authenticated with coordinator");

    // Writer task keeps outbound sends totally ordered.
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Message(message) => match serde_json::to_string(&message) {
                    Ok(json) => sink.send(Message::Text(json)).await,
                    Err(e) => {
                        warn!("outbound message not encodable: {e}");
                        continue;
                    }
                },
                Outbound::Pong(payload) => sink.send(Message::Pong(payload)).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    let mut events = endpoint.subscribe();
    // First tick fires immediately: the coordinator learns our state right
    // after authentication.
    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<CoordinatorMessage>(&text) {
                        Ok(instruction) => handle_instruction(instruction, endpoint, &tx).await,
                        Err(e) => debug!("malformed message discarded: {e}"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = tx.send(Outbound::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("link error: {e}");
                    break;
                }
            },
            _ = status_tick.tick() => send_status(endpoint, &tx),
            event = events.recv() => match event {
                Ok(EndpointEvent::Connected) | Ok(EndpointEvent::Disconnected) => {
                    send_status(endpoint, &tx);
                }
                Ok(EndpointEvent::Battery(level)) => {
                    let _ = tx.send(Outbound::Message(AgentMessage::Battery { level }));
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {}
            },
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(true)
}

fn send_status(endpoint: &BleEndpoint, tx: &mpsc::UnboundedSender<Outbound>) {
    let _ = tx.send(Outbound::Message(AgentMessage::Status {
        ble_connected: endpoint.is_ready(),
        battery: endpoint.last_battery(),
    }));
}

async fn handle_instruction(
    instruction: CoordinatorMessage,
    endpoint: &Arc<BleEndpoint>,
    tx: &mpsc::UnboundedSender<Outbound>,
) {
    match instruction {
        CoordinatorMessage::AuthResult { .. } => {}
        CoordinatorMessage::Command { id, data } => {
            let success = match hex::decode(&data) {
                Ok(frame_bytes) => endpoint.write(&Frame::from_bytes(frame_bytes)).await,
                Err(e) => {
                    warn!("command {id}: undecodable payload: {e}");
                    false
                }
            };
            let _ = tx.send(Outbound::Message(AgentMessage::CommandResult { id, success }));
        }
        CoordinatorMessage::GetBattery => {
            endpoint.request_battery().await;
            let endpoint = Arc::clone(endpoint);
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(BATTERY_ECHO_DELAY).await;
                if let Some(level) = endpoint.last_battery() {
                    let _ = tx.send(Outbound::Message(AgentMessage::Battery { level }));
                }
            });
        }
        CoordinatorMessage::GetRssi => {
            // Stays silent when no reading is available
            if let Some(value) = endpoint.read_rssi().await {
                let _ = tx.send(Outbound::Message(AgentMessage::Rssi { value }));
            }
        }
        CoordinatorMessage::Scan { duration } => {
            let endpoint = Arc::clone(endpoint);
            let tx = tx.clone();
            tokio::spawn(async move {
                let devices = match endpoint.scan(Duration::from_millis(duration)).await {
                    Ok(found) => found.into_iter().map(ScanDevice::from).collect(),
                    Err(e) => {
                        warn!("scan failed: {e}");
                        Vec::new()
                    }
                };
                let _ = tx.send(Outbound::Message(AgentMessage::ScanResult { devices }));
            });
        }
        CoordinatorMessage::Connect => endpoint.connect(),
        CoordinatorMessage::DisconnectBle => {
            endpoint.disconnect().await;
            send_status(endpoint, tx);
        }
    }
}
