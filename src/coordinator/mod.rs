//! Coordinator core: node pool, agent channel server, and routing
//!
//! The coordinator guarantees that exactly one endpoint — its own radio or
//! one remote agent — holds the collar link at a time, and routes each
//! submitted frame to whichever path is available. The local endpoint is
//! preferred whenever it is ready.

pub mod pool;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use collarlink_ble::{BleEndpoint, EndpointEvent, Frame};

use crate::config::Config;
use crate::wire::CoordinatorMessage;

pub use pool::{NodePool, NodeSnapshot, PoolConfig, PoolEvent};

/// Gap between the two writes of a command-kind frame
const REPEAT_GAP: Duration = Duration::from_millis(300);

/// Patience for battery/RSSI round-trips
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Routing layer over the local endpoint and the agent pool
///
/// The local endpoint is optional: a coordinator host without a usable
/// radio still arbitrates the agent pool.
pub struct Coordinator {
    pool: NodePool,
    endpoint: Option<Arc<BleEndpoint>>,
}

impl Coordinator {
    pub fn new(pool: NodePool, endpoint: Option<Arc<BleEndpoint>>) -> Self {
        Self { pool, endpoint }
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn endpoint(&self) -> Option<&Arc<BleEndpoint>> {
        self.endpoint.as_ref()
    }

    fn local_ready(&self) -> Option<&Arc<BleEndpoint>> {
        self.endpoint.as_ref().filter(|endpoint| endpoint.is_ready())
    }

    /// Route one frame to the device.
    ///
    /// Command-kind frames are written twice, 300 ms apart, on the chosen
    /// path; the return value reflects the first write. Returns false when
    /// no path exists.
    pub async fn submit(&self, frame: Frame) -> bool {
        if let Some(endpoint) = self.local_ready() {
            let ok = endpoint.write(&frame).await;
            if ok && frame.is_repeated() {
                let endpoint = Arc::clone(endpoint);
                tokio::spawn(async move {
                    tokio::time::sleep(REPEAT_GAP).await;
                    endpoint.write(&frame).await;
                });
            }
            ok
        } else if self.pool.active_node().is_some() {
            let ok = self.pool.send_command(&frame).await;
            if ok && frame.is_repeated() {
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(REPEAT_GAP).await;
                    pool.send_command(&frame).await;
                });
            }
            ok
        } else {
            debug!("submit dropped: no path to the device");
            false
        }
    }

    /// Current battery level, local endpoint preferred.
    ///
    /// Falls back to the last level the chosen path reported when no fresh
    /// reading arrives inside the patience window.
    pub async fn request_battery(&self) -> Option<u8> {
        if let Some(endpoint) = self.local_ready() {
            let mut events = endpoint.subscribe();
            if !endpoint.request_battery().await {
                return endpoint.last_battery();
            }
            let deadline = tokio::time::sleep(QUERY_TIMEOUT);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => return endpoint.last_battery(),
                    event = events.recv() => match event {
                        Ok(EndpointEvent::Battery(level)) => return Some(level),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return endpoint.last_battery(),
                    },
                }
            }
        } else if self.pool.active_node().is_some() {
            let mut events = self.pool.subscribe();
            if !self.pool.send_to_active(CoordinatorMessage::GetBattery) {
                return None;
            }
            let deadline = tokio::time::sleep(QUERY_TIMEOUT);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => return self.pool.active_last_battery(),
                    event = events.recv() => match event {
                        Ok(PoolEvent::Battery(level)) => return Some(level),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return self.pool.active_last_battery(),
                    },
                }
            }
        } else {
            None
        }
    }

    /// Live signal strength of whichever endpoint holds the device.
    pub async fn request_rssi(&self) -> Option<i16> {
        if let Some(endpoint) = self.local_ready() {
            endpoint.read_rssi().await
        } else if self.pool.active_node().is_some() {
            let mut events = self.pool.subscribe();
            if !self.pool.send_to_active(CoordinatorMessage::GetRssi) {
                return None;
            }
            let deadline = tokio::time::sleep(QUERY_TIMEOUT);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => return None,
                    event = events.recv() => match event {
                        Ok(PoolEvent::Rssi(value)) => return Some(value),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return None,
                    },
                }
            }
        } else {
            None
        }
    }
}

/// Run the coordinator daemon until interrupted.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let pool = NodePool::new(PoolConfig {
        ping_interval: Duration::from_millis(config.coordinator.ping_interval_ms),
        stale_timeout: Duration::from_millis(config.coordinator.stale_timeout_ms),
        scan_duration: config.device.scan_duration(),
        handoff_timeout: Duration::from_millis(config.coordinator.handoff_timeout_ms),
    });

    // A host without a usable radio still coordinates the agent pool.
    let endpoint = match BleEndpoint::new(config.device.endpoint_config()).await {
        Ok(endpoint) => Some(Arc::new(endpoint)),
        Err(e) => {
            warn!("local radio unavailable: {e}; relying on the agent pool");
            None
        }
    };

    if let Some(endpoint) = &endpoint {
        if config.coordinator.scan_on_start {
            endpoint.connect();
        } else {
            info!("local radio held down (scan_on_start = false)");
        }

        // Local endpoint edges steer arbitration: the radio coming up
        // supersedes any pending election, losing it starts one.
        let pool = pool.clone();
        let mut events = endpoint.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EndpointEvent::Connected) => pool.cancel_handoff(),
                    Ok(EndpointEvent::Disconnected) => pool.trigger_handoff(),
                    Ok(EndpointEvent::Battery(_)) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // A freshly joined agent is the only chance to gain a writer when the
    // local radio is down and nothing is active yet.
    {
        let pool = pool.clone();
        let endpoint = endpoint.clone();
        let mut events = pool.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PoolEvent::NodeConnected(_)) => {
                        let local_up =
                            endpoint.as_ref().is_some_and(|endpoint| endpoint.is_ready());
                        if !local_up && pool.active_node().is_none() {
                            pool.trigger_handoff();
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let server = tokio::spawn(server::run(pool.clone(), config.coordinator.clone()));

    tokio::select! {
        result = server => result??,
        _ = tokio::signal::ctrl_c() => info!("interrupt received; shutting down"),
    }
    if let Some(endpoint) = &endpoint {
        endpoint.disconnect().await;
    }
    Ok(())
}
