//! Node pool: registry and arbiter of forwarder agents
//!
//! The pool is the single mutation domain for agent state. Every event
//! source — inbound link messages, ping timers, the routing layer — funnels
//! through methods here, which serialize on one mutex and communicate
//! outward via per-link mpsc senders and a broadcast event channel.
//!
//! Arbitration invariants:
//! - at most one node is active at a time, and an active node holds the
//!   device (`is_active ⇒ ble_connected`)
//! - at most one handoff is in progress; concurrent triggers coalesce
//! - a node that connects while another is active is told to yield

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use collarlink_ble::Frame;

use crate::wire::{AgentMessage, CoordinatorMessage, ScanDevice};

/// Pool event broadcast buffer size
const POOL_CHANNEL_SIZE: usize = 32;

/// Grace added to the scan window for replies still in flight
const SCAN_REPLY_SLACK: Duration = Duration::from_secs(3);

/// How long a remote command may wait for its `command_result`
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool timing configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub ping_interval: Duration,
    pub stale_timeout: Duration,
    pub scan_duration: Duration,
    pub handoff_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(60),
            scan_duration: Duration::from_secs(10),
            handoff_timeout: Duration::from_secs(30),
        }
    }
}

/// Instructions for a link's writer task
#[derive(Debug)]
pub enum LinkCommand {
    /// Serialize and send a protocol message
    Send(CoordinatorMessage),
    /// Transport-level ping
    Ping,
    /// Close the socket and stop the writer
    Close,
}

/// Events published to pool subscribers
#[derive(Debug, Clone)]
pub enum PoolEvent {
    NodeConnected(String),
    NodeRemoved(String),
    /// The active node changed; `None` means no node is active
    ActiveChanged(Option<String>),
    /// A handoff was requested but the pool is empty
    NoActive,
    /// Battery level relayed from the active node
    Battery(u8),
    /// RSSI relayed from the active node
    Rssi(i16),
    Snapshot(Vec<NodeSnapshot>),
}

/// Point-in-time view of one registered node
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub node_id: String,
    pub ble_connected: bool,
    pub battery: Option<u8>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandoffState {
    Idle,
    Scanning,
    AwaitingConnect,
}

struct NodeEntry {
    tx: mpsc::UnboundedSender<LinkCommand>,
    ble_connected: bool,
    last_battery: Option<u8>,
    last_seen: Instant,
    is_active: bool,
    awaiting_pong: bool,
    ping_task: JoinHandle<()>,
}

struct PoolInner {
    nodes: HashMap<String, NodeEntry>,
    active_node: Option<String>,
    handoff: HandoffState,
    /// Bumped whenever a handoff starts or is superseded; scheduled
    /// election and retry steps no-op when their epoch is stale.
    handoff_epoch: u64,
    /// Scan reports gathered during the current window, in arrival order.
    /// Arrival order breaks RSSI ties.
    pending_scans: Vec<(String, Vec<ScanDevice>)>,
    pending_commands: HashMap<u64, oneshot::Sender<bool>>,
    command_counter: u64,
}

/// The coordinator-side registry of authenticated agents
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<Mutex<PoolInner>>,
    events: broadcast::Sender<PoolEvent>,
    config: Arc<PoolConfig>,
}

impl NodePool {
    pub fn new(config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(POOL_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                nodes: HashMap::new(),
                active_node: None,
                handoff: HandoffState::Idle,
                handoff_epoch: 0,
                pending_scans: Vec::new(),
                pending_commands: HashMap::new(),
                command_counter: 0,
            })),
            events,
            config: Arc::new(config),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn active_node(&self) -> Option<String> {
        self.inner.lock().unwrap().active_node.clone()
    }

    pub fn active_last_battery(&self) -> Option<u8> {
        let guard = self.inner.lock().unwrap();
        let active = guard.active_node.as_ref()?;
        guard.nodes.get(active)?.last_battery
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let guard = self.inner.lock().unwrap();
        guard
            .nodes
            .iter()
            .map(|(node_id, entry)| NodeSnapshot {
                node_id: node_id.clone(),
                ble_connected: entry.ble_connected,
                battery: entry.last_battery,
                is_active: entry.is_active,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Registration and liveness
    // ------------------------------------------------------------------

    /// Admit an authenticated link.
    ///
    /// A node re-registering under an existing id evicts the prior entry
    /// first.
    pub fn add_node(&self, node_id: &str, tx: mpsc::UnboundedSender<LinkCommand>) {
        let mut need_handoff = false;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if let Some(prev) = inner.nodes.remove(node_id) {
                info!("{node_id} re-registered; evicting previous link");
                prev.ping_task.abort();
                let _ = prev.tx.send(LinkCommand::Close);
                if inner.active_node.as_deref() == Some(node_id) {
                    inner.active_node = None;
                    need_handoff = true;
                }
            }
            inner.nodes.insert(
                node_id.to_string(),
                NodeEntry {
                    tx,
                    ble_connected: false,
                    last_battery: None,
                    last_seen: Instant::now(),
                    is_active: false,
                    awaiting_pong: false,
                    ping_task: self.spawn_ping(node_id.to_string()),
                },
            );
        }
        info!("{node_id} joined the pool");
        let _ = self.events.send(PoolEvent::NodeConnected(node_id.to_string()));
        self.emit_snapshot();
        if need_handoff {
            let _ = self.events.send(PoolEvent::ActiveChanged(None));
            self.trigger_handoff();
        }
    }

    /// Remove a node and, if it was the active writer, start a handoff.
    pub fn remove_node(&self, node_id: &str) {
        let was_active;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let Some(entry) = inner.nodes.remove(node_id) else {
                return;
            };
            entry.ping_task.abort();
            let _ = entry.tx.send(LinkCommand::Close);
            was_active =
                entry.is_active || inner.active_node.as_deref() == Some(node_id);
            if was_active {
                inner.active_node = None;
            }
        }
        info!("{node_id} left the pool");
        let _ = self.events.send(PoolEvent::NodeRemoved(node_id.to_string()));
        self.emit_snapshot();
        if was_active {
            let _ = self.events.send(PoolEvent::ActiveChanged(None));
            self.trigger_handoff();
        }
    }

    /// Remove a node only if it is still backed by the given link.
    ///
    /// A reader task calls this on link close; if the node was already
    /// replaced by a newer link under the same id, the newer entry stays.
    pub fn remove_link(&self, node_id: &str, link: &mpsc::UnboundedSender<LinkCommand>) {
        let same = {
            let guard = self.inner.lock().unwrap();
            guard
                .nodes
                .get(node_id)
                .is_some_and(|entry| entry.tx.same_channel(link))
        };
        if same {
            self.remove_node(node_id);
        }
    }

    /// Transport-level pong from a node.
    pub fn handle_pong(&self, node_id: &str) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(entry) = guard.nodes.get_mut(node_id) {
            entry.awaiting_pong = false;
            entry.last_seen = Instant::now();
        }
    }

    fn spawn_ping(&self, node_id: String) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if !pool.ping_tick(&node_id) {
                    break;
                }
            }
        })
    }

    /// One liveness tick: an unanswered ping or an absolute silence beyond
    /// the stale timeout evicts the node; otherwise a fresh ping goes out.
    fn ping_tick(&self, node_id: &str) -> bool {
        let stale = {
            let mut guard = self.inner.lock().unwrap();
            let Some(entry) = guard.nodes.get_mut(node_id) else {
                return false;
            };
            if entry.awaiting_pong || entry.last_seen.elapsed() >= self.config.stale_timeout {
                true
            } else {
                entry.awaiting_pong = true;
                let _ = entry.tx.send(LinkCommand::Ping);
                false
            }
        };
        if stale {
            warn!("{node_id} failed liveness check; removing");
            self.remove_node(node_id);
            false
        } else {
            true
        }
    }

    // ------------------------------------------------------------------
    // Inbound message dispatch
    // ------------------------------------------------------------------

    pub fn handle_message(&self, node_id: &str, message: AgentMessage) {
        self.touch(node_id);
        match message {
            AgentMessage::Auth { .. } => {
                debug!("{node_id}: auth after registration ignored");
            }
            AgentMessage::Status {
                ble_connected,
                battery,
            } => self.handle_status(node_id, ble_connected, battery),
            AgentMessage::ScanResult { devices } => self.handle_scan_result(node_id, devices),
            AgentMessage::Battery { level } => {
                let from_active = {
                    let mut guard = self.inner.lock().unwrap();
                    let Some(entry) = guard.nodes.get_mut(node_id) else {
                        return;
                    };
                    entry.last_battery = Some(level);
                    entry.is_active
                };
                if from_active {
                    let _ = self.events.send(PoolEvent::Battery(level));
                }
            }
            AgentMessage::Rssi { value } => {
                let from_active = {
                    let guard = self.inner.lock().unwrap();
                    guard.nodes.get(node_id).is_some_and(|e| e.is_active)
                };
                if from_active {
                    let _ = self.events.send(PoolEvent::Rssi(value));
                }
            }
            AgentMessage::CommandResult { id, success } => {
                let waiter = self.inner.lock().unwrap().pending_commands.remove(&id);
                match waiter {
                    Some(done) => {
                        let _ = done.send(success);
                    }
                    None => debug!("{node_id}: command_result for unknown id {id}"),
                }
            }
        }
    }

    fn touch(&self, node_id: &str) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(entry) = guard.nodes.get_mut(node_id) {
            entry.last_seen = Instant::now();
        }
    }

    fn handle_status(&self, node_id: &str, ble_connected: bool, battery: Option<u8>) {
        let (came_up, active_went_down) = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let Some(entry) = inner.nodes.get_mut(node_id) else {
                return;
            };
            let prev = entry.ble_connected;
            entry.ble_connected = ble_connected;
            if battery.is_some() {
                entry.last_battery = battery;
            }
            let came_up = !prev && ble_connected;
            let mut active_went_down = false;
            if prev && !ble_connected && entry.is_active {
                entry.is_active = false;
                inner.active_node = None;
                active_went_down = true;
            }
            (came_up, active_went_down)
        };
        self.emit_snapshot();
        if came_up {
            self.try_promote(node_id);
        }
        if active_went_down {
            info!("{node_id} lost the device while active; demoting");
            let _ = self.events.send(PoolEvent::ActiveChanged(None));
            self.trigger_handoff();
        }
    }

    fn handle_scan_result(&self, node_id: &str, devices: Vec<ScanDevice>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.handoff != HandoffState::Scanning {
            debug!("{node_id}: scan_result outside a scan window discarded");
            return;
        }
        debug!("{node_id}: {} scan candidates recorded", devices.len());
        match inner
            .pending_scans
            .iter_mut()
            .find(|(id, _)| id == node_id)
        {
            Some(slot) => slot.1 = devices,
            None => inner.pending_scans.push((node_id.to_string(), devices)),
        }
    }

    // ------------------------------------------------------------------
    // Arbitration
    // ------------------------------------------------------------------

    /// Promote a node to active writer if the slot is free.
    ///
    /// The device accepts a single link, so a node that connected while
    /// another is active is instructed to yield.
    pub fn try_promote(&self, node_id: &str) {
        enum Outcome {
            Promoted,
            Yielded,
            Unchanged,
        }
        let outcome = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let Some(entry) = inner.nodes.get_mut(node_id) else {
                return;
            };
            if !entry.ble_connected {
                return;
            }
            match inner.active_node.as_deref() {
                None => {
                    entry.is_active = true;
                    inner.active_node = Some(node_id.to_string());
                    inner.handoff = HandoffState::Idle;
                    inner.handoff_epoch += 1;
                    inner.pending_scans.clear();
                    Outcome::Promoted
                }
                Some(current) if current == node_id => Outcome::Unchanged,
                Some(_) => {
                    let _ = entry
                        .tx
                        .send(LinkCommand::Send(CoordinatorMessage::DisconnectBle));
                    Outcome::Yielded
                }
            }
        };
        match outcome {
            Outcome::Promoted => {
                info!("{node_id} promoted to active");
                let _ = self
                    .events
                    .send(PoolEvent::ActiveChanged(Some(node_id.to_string())));
                self.emit_snapshot();
            }
            Outcome::Yielded => {
                info!("{node_id} holds the device while another node is active; told to yield");
            }
            Outcome::Unchanged => {}
        }
    }

    /// Start the scan-and-elect cycle that selects a new active node.
    ///
    /// Coalesces with an in-progress handoff. On an empty pool this only
    /// announces that no writer exists.
    pub fn trigger_handoff(&self) {
        let scan_ms = self.config.scan_duration.as_millis() as u64;
        let epoch = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.handoff != HandoffState::Idle {
                debug!("handoff already in progress; trigger coalesced");
                return;
            }
            if inner.nodes.is_empty() {
                None
            } else {
                inner.handoff = HandoffState::Scanning;
                inner.handoff_epoch += 1;
                inner.pending_scans.clear();
                for entry in inner.nodes.values() {
                    let _ = entry.tx.send(LinkCommand::Send(CoordinatorMessage::Scan {
                        duration: scan_ms,
                    }));
                }
                Some(inner.handoff_epoch)
            }
        };
        let Some(epoch) = epoch else {
            info!("handoff requested with an empty pool; no active node");
            let _ = self.events.send(PoolEvent::NoActive);
            return;
        };
        info!("handoff started: pool scanning for {scan_ms} ms");

        let window = self.config.scan_duration + SCAN_REPLY_SLACK;
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            pool.elect_node(epoch);
        });

        let retry_after = self.config.handoff_timeout + window;
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retry_after).await;
            pool.retry_handoff(epoch);
        });
    }

    /// Abandon any pending election, e.g. because the local endpoint took
    /// over as the writer. In-flight scans on agents are not aborted;
    /// their late results are discarded.
    pub fn cancel_handoff(&self) {
        let mut guard = self.inner.lock().unwrap();
        if guard.handoff != HandoffState::Idle {
            debug!("pending handoff superseded");
            guard.handoff = HandoffState::Idle;
            guard.handoff_epoch += 1;
            guard.pending_scans.clear();
        }
    }

    /// Close the scan window and instruct the strongest candidate to
    /// connect. Promotion happens when its `status{bleConnected:true}`
    /// arrives.
    fn elect_node(&self, epoch: u64) {
        let elected = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.handoff_epoch != epoch || inner.handoff != HandoffState::Scanning {
                return;
            }
            // Largest RSSI wins (values are negative dBm); ties go to the
            // earliest reporter.
            let mut best: Option<(&str, i16)> = None;
            for (node_id, devices) in &inner.pending_scans {
                if !inner.nodes.contains_key(node_id) {
                    continue;
                }
                for device in devices {
                    if best.map_or(true, |(_, rssi)| device.rssi > rssi) {
                        best = Some((node_id.as_str(), device.rssi));
                    }
                }
            }
            let best = best.map(|(node_id, rssi)| (node_id.to_string(), rssi));
            inner.pending_scans.clear();
            let Some((node_id, rssi)) = best else {
                info!("election found no candidates; the retry timer will rescan");
                return;
            };
            if let Some(entry) = inner.nodes.get(&node_id) {
                let _ = entry.tx.send(LinkCommand::Send(CoordinatorMessage::Connect));
            }
            inner.handoff = HandoffState::AwaitingConnect;
            (node_id, rssi)
        };
        info!("elected {} at {} dBm; awaiting connect", elected.0, elected.1);
    }

    /// Re-run the cycle if the handoff that started at `epoch` produced no
    /// active node.
    fn retry_handoff(&self, epoch: u64) {
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.handoff_epoch != epoch {
                return;
            }
            if guard.active_node.is_some() || guard.nodes.is_empty() {
                return;
            }
            guard.handoff = HandoffState::Idle;
        }
        info!("handoff made no progress; retrying");
        self.trigger_handoff();
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send an instruction to the active node, if any.
    pub fn send_to_active(&self, message: CoordinatorMessage) -> bool {
        let guard = self.inner.lock().unwrap();
        let Some(active) = guard.active_node.as_ref() else {
            return false;
        };
        let Some(entry) = guard.nodes.get(active) else {
            return false;
        };
        entry.tx.send(LinkCommand::Send(message)).is_ok()
    }

    /// Relay a frame to the active node and wait for its `command_result`.
    ///
    /// Exactly one of resolve or timeout settles each command id.
    pub async fn send_command(&self, frame: &Frame) -> bool {
        let (id, done_rx) = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let Some(active) = inner.active_node.clone() else {
                debug!("command dropped: no active node");
                return false;
            };
            let Some(entry) = inner.nodes.get(&active) else {
                return false;
            };
            inner.command_counter += 1;
            let id = inner.command_counter;
            let sent = entry
                .tx
                .send(LinkCommand::Send(CoordinatorMessage::Command {
                    id,
                    data: hex::encode(frame.as_bytes()),
                }))
                .is_ok();
            if !sent {
                return false;
            }
            let (done_tx, done_rx) = oneshot::channel();
            inner.pending_commands.insert(id, done_tx);
            (id, done_rx)
        };
        match tokio::time::timeout(COMMAND_TIMEOUT, done_rx).await {
            Ok(Ok(success)) => success,
            Ok(Err(_)) => false,
            Err(_) => {
                debug!("command {id} timed out");
                self.inner.lock().unwrap().pending_commands.remove(&id);
                false
            }
        }
    }

    fn emit_snapshot(&self) {
        let _ = self.events.send(PoolEvent::Snapshot(self.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collarlink_ble::encode_command;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn pool() -> NodePool {
        NodePool::new(PoolConfig::default())
    }

    fn join(pool: &NodePool, node_id: &str) -> UnboundedReceiver<LinkCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        pool.add_node(node_id, tx);
        rx
    }

    fn report_status(pool: &NodePool, node_id: &str, connected: bool) {
        pool.handle_message(
            node_id,
            AgentMessage::Status {
                ble_connected: connected,
                battery: None,
            },
        );
    }

    fn report_scan(pool: &NodePool, node_id: &str, rssi: i16) {
        pool.handle_message(
            node_id,
            AgentMessage::ScanResult {
                devices: vec![ScanDevice {
                    address: "AA:BB:CC:DD:EE:FF".into(),
                    name: "collar".into(),
                    rssi,
                    detection_method: collarlink_ble::DetectionMethod::ServiceUuid,
                }],
            },
        );
    }

    fn drain(rx: &mut UnboundedReceiver<LinkCommand>) -> Vec<LinkCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    fn sent_messages(rx: &mut UnboundedReceiver<LinkCommand>) -> Vec<CoordinatorMessage> {
        drain(rx)
            .into_iter()
            .filter_map(|cmd| match cmd {
                LinkCommand::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    /// Let spawned timer tasks run after a time advance.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connected_node_becomes_active() {
        let pool = pool();
        let _rx = join(&pool, "garage");
        assert_eq!(pool.active_node(), None);

        report_status(&pool, "garage", true);
        assert_eq!(pool.active_node(), Some("garage".into()));
        let snapshot = pool.snapshot();
        assert!(snapshot.iter().any(|n| n.node_id == "garage" && n.is_active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_connection_yields_to_incumbent() {
        let pool = pool();
        let mut rx_a = join(&pool, "a");
        let mut rx_b = join(&pool, "b");

        report_status(&pool, "a", true);
        drain(&mut rx_a);
        drain(&mut rx_b);

        // b autonomously grabs the device while a is active
        report_status(&pool, "b", true);
        assert_eq!(pool.active_node(), Some("a".into()));
        assert_eq!(
            sent_messages(&mut rx_b),
            vec![CoordinatorMessage::DisconnectBle]
        );
        assert!(sent_messages(&mut rx_a).is_empty());

        // b yields; a stays active throughout
        report_status(&pool, "b", false);
        assert_eq!(pool.active_node(), Some("a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_loss_broadcasts_scan_to_all_nodes() {
        let pool = pool();
        let mut rx_a = join(&pool, "a");
        let mut rx_b = join(&pool, "b");
        report_status(&pool, "a", true);
        drain(&mut rx_a);
        drain(&mut rx_b);

        report_status(&pool, "a", false);
        assert_eq!(pool.active_node(), None);
        assert_eq!(
            sent_messages(&mut rx_a),
            vec![CoordinatorMessage::Scan { duration: 10_000 }]
        );
        assert_eq!(
            sent_messages(&mut rx_b),
            vec![CoordinatorMessage::Scan { duration: 10_000 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_prefers_strongest_rssi() {
        let pool = pool();
        let mut rx_a = join(&pool, "a");
        let mut rx_b = join(&pool, "b");
        report_status(&pool, "a", true);
        report_status(&pool, "a", false); // demote → handoff starts
        drain(&mut rx_a);
        drain(&mut rx_b);

        report_scan(&pool, "a", -70);
        report_scan(&pool, "b", -50);

        // Past the scan window plus slack the election runs
        tokio::time::advance(Duration::from_secs(14)).await;
        settle().await;

        assert_eq!(sent_messages(&mut rx_b), vec![CoordinatorMessage::Connect]);
        assert!(sent_messages(&mut rx_a).is_empty());

        // Promotion lands with the winner's status report
        report_status(&pool, "b", true);
        assert_eq!(pool.active_node(), Some("b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_tie_goes_to_earliest_reporter() {
        let pool = pool();
        let mut rx_a = join(&pool, "a");
        let mut rx_b = join(&pool, "b");
        pool.trigger_handoff();
        drain(&mut rx_a);
        drain(&mut rx_b);

        // b reports first; equal signal strength
        report_scan(&pool, "b", -60);
        report_scan(&pool, "a", -60);

        tokio::time::advance(Duration::from_secs(14)).await;
        settle().await;

        assert_eq!(sent_messages(&mut rx_b), vec![CoordinatorMessage::Connect]);
        assert!(sent_messages(&mut rx_a).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_on_empty_pool_emits_no_active() {
        let pool = pool();
        let mut events = pool.subscribe();
        pool.trigger_handoff();
        assert!(matches!(events.try_recv(), Ok(PoolEvent::NoActive)));
        assert_eq!(pool.active_node(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_scan_result_is_discarded() {
        let pool = pool();
        let mut rx_a = join(&pool, "a");
        report_status(&pool, "a", true);
        drain(&mut rx_a);

        // No handoff in progress: the report must not linger anywhere
        report_scan(&pool, "a", -40);
        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert!(sent_messages(&mut rx_a)
            .iter()
            .all(|m| !matches!(m, CoordinatorMessage::Connect)));
        assert_eq!(pool.active_node(), Some("a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_result_completes_pending_command() {
        let pool = pool();
        let mut rx = join(&pool, "a");
        report_status(&pool, "a", true);
        drain(&mut rx);

        let frame = encode_command(50.0, 0.0, 0.0);
        let submit = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.send_command(&frame).await })
        };
        settle().await;

        let sent = sent_messages(&mut rx);
        let (id, data) = match &sent[..] {
            [CoordinatorMessage::Command { id, data }] => (*id, data.clone()),
            other => panic!("expected one command, got {other:?}"),
        };
        assert_eq!(data, "aa07320000bb");

        pool.handle_message("a", AgentMessage::CommandResult { id, success: true });
        assert!(submit.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_times_out_without_result() {
        let pool = pool();
        let mut rx = join(&pool, "a");
        report_status(&pool, "a", true);
        drain(&mut rx);

        let frame = encode_command(10.0, 0.0, 0.0);
        let submit = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.send_command(&frame).await })
        };
        settle().await;
        tokio::time::advance(COMMAND_TIMEOUT).await;
        assert!(!submit.await.unwrap());

        // The pending entry is gone; a late result is a no-op
        pool.handle_message("a", AgentMessage::CommandResult { id: 1, success: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_ids_are_unique_and_monotonic() {
        let pool = pool();
        let mut rx = join(&pool, "a");
        report_status(&pool, "a", true);
        drain(&mut rx);

        for _ in 0..3 {
            let frame = encode_command(1.0, 0.0, 0.0);
            let pool2 = pool.clone();
            tokio::spawn(async move { pool2.send_command(&frame).await });
        }
        settle().await;

        let ids: Vec<u64> = sent_messages(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                CoordinatorMessage::Command { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_evicts_node() {
        let pool = pool();
        let mut rx = join(&pool, "a");

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(drain(&mut rx)
            .iter()
            .any(|c| matches!(c, LinkCommand::Ping)));
        assert_eq!(pool.node_count(), 1);

        // No pong before the next tick
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(pool.node_count(), 0);
        assert!(drain(&mut rx)
            .iter()
            .any(|c| matches!(c, LinkCommand::Close)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_node_alive() {
        let pool = pool();
        let mut rx = join(&pool, "a");

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(30)).await;
            settle().await;
            assert!(drain(&mut rx)
                .iter()
                .any(|c| matches!(c, LinkCommand::Ping)));
            pool.handle_pong("a");
        }
        assert_eq!(pool.node_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_eviction_triggers_handoff() {
        let pool = pool();
        let _rx_a = join(&pool, "a");
        let mut rx_b = join(&pool, "b");
        report_status(&pool, "a", true);
        drain(&mut rx_b);

        // a goes silent; after one ping tick plus one unanswered tick it
        // is evicted and the survivors are asked to scan
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        pool.handle_pong("b");
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(pool.node_count(), 1);
        assert_eq!(pool.active_node(), None);
        assert!(sent_messages(&mut rx_b)
            .iter()
            .any(|m| matches!(m, CoordinatorMessage::Scan { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_evicts_previous_link() {
        let pool = pool();
        let mut rx_old = join(&pool, "a");
        let mut rx_new = join(&pool, "a");

        assert_eq!(pool.node_count(), 1);
        assert!(drain(&mut rx_old)
            .iter()
            .any(|c| matches!(c, LinkCommand::Close)));

        // The stale link closing must not tear down the fresh entry
        let (stale_tx, _stale_rx) = mpsc::unbounded_channel();
        pool.remove_link("a", &stale_tx);
        assert_eq!(pool.node_count(), 1);

        report_status(&pool, "a", true);
        assert_eq!(pool.active_node(), Some("a".into()));
        assert!(drain(&mut rx_new).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rescans_when_no_candidates() {
        let pool = pool();
        let mut rx = join(&pool, "a");
        pool.trigger_handoff();
        assert!(sent_messages(&mut rx)
            .iter()
            .any(|m| matches!(m, CoordinatorMessage::Scan { .. })));

        // Election at +13 s finds nothing; retry at +43 s rescans
        tokio::time::advance(Duration::from_secs(14)).await;
        settle().await;
        assert!(sent_messages(&mut rx).is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(sent_messages(&mut rx)
            .iter()
            .any(|m| matches!(m, CoordinatorMessage::Scan { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_handoff_discards_election() {
        let pool = pool();
        let mut rx = join(&pool, "a");
        pool.trigger_handoff();
        drain(&mut rx);

        pool.cancel_handoff();
        report_scan(&pool, "a", -30);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        // Neither the election nor the retry acts on the stale epoch
        assert!(sent_messages(&mut rx)
            .iter()
            .all(|m| !matches!(m, CoordinatorMessage::Connect)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_relayed_only_from_active_node() {
        let pool = pool();
        let _rx_a = join(&pool, "a");
        let _rx_b = join(&pool, "b");
        report_status(&pool, "a", true);

        let mut events = pool.subscribe();
        pool.handle_message("b", AgentMessage::Battery { level: 12 });
        pool.handle_message("a", AgentMessage::Battery { level: 87 });

        let mut relayed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::Battery(level) = event {
                relayed.push(level);
            }
        }
        assert_eq!(relayed, vec![87]);
        // The inactive node's level is still recorded on its entry
        assert!(pool
            .snapshot()
            .iter()
            .any(|n| n.node_id == "b" && n.battery == Some(12)));
    }
}
