//! Connection manager with heartbeat supervision and automatic reconnection
//!
//! A single task owns the state machine, the current session slot and every
//! timer. Caller requests, session events and timer expiries are all
//! serialized through that task, so state is always read at the moment an
//! event is handled rather than when it was scheduled.

use super::config::ConnectionConfig;
use super::error::ClientError;
use super::network::Connectivity;
use super::session::SessionSlot;
use crate::transport::{TransportConnector, WsConnector};
use feed_shared::codec;
use feed_shared::envelope::{FeedUpdate, Outbound};
use feed_shared::{
    ConnectionMachine, ConnectionStatus, Effect, Lifecycle, MachineEvent, PendingUpdates,
    SessionId,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

/// Capacity of the update broadcast; slow subscribers see `Lagged`
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Snapshot of the manager's internal bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub lifecycle: Lifecycle,
    /// Reconnect attempts since the last successful connection
    pub attempts: u32,
    /// Pings sent without any traffic in return
    pub missed_heartbeats: u32,
}

impl Progress {
    fn of(machine: &ConnectionMachine) -> Self {
        Self {
            lifecycle: machine.lifecycle(),
            attempts: machine.attempts(),
            missed_heartbeats: machine.missed_heartbeats(),
        }
    }
}

/// Requests from handles to the manager task
enum Command {
    Send {
        message: Value,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Shutdown,
}

/// Manages one persistent channel with heartbeat and reconnection
pub struct ConnectionManager {
    address: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    progress: watch::Receiver<Progress>,
    updates_tx: broadcast::Sender<FeedUpdate>,
    pending: Arc<RwLock<PendingUpdates>>,
    connectivity: Connectivity,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a manager over WebSocket and start connecting
    pub fn new(config: ConnectionConfig) -> Self {
        let connector = WsConnector::new(config.address.clone());
        Self::with_connector(config, connector)
    }

    /// Create a manager over any transport and start connecting
    pub fn with_connector<C: TransportConnector>(config: ConnectionConfig, connector: C) -> Self {
        Self::with_connectivity(config, connector, Connectivity::default())
    }

    /// Like [`with_connector`](Self::with_connector) with a caller-owned network signal
    pub fn with_connectivity<C: TransportConnector>(
        config: ConnectionConfig,
        connector: C,
        connectivity: Connectivity,
    ) -> Self {
        let machine = ConnectionMachine::new(config.policy());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(machine.status());
        let (progress_tx, progress) = watch::channel(Progress::of(&machine));
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let pending = Arc::new(RwLock::new(PendingUpdates::new()));

        let driver = Driver {
            machine,
            connector: Arc::new(connector),
            close_timeout: config.close_timeout,
            slot: None,
            timers: Timers::default(),
            events_tx,
            status_tx,
            progress_tx,
            updates_tx: updates_tx.clone(),
            pending: pending.clone(),
        };

        let online = connectivity.watch();
        let task = tokio::spawn(driver.run(commands_rx, events_rx, online));

        Self {
            address: config.address,
            commands,
            status,
            progress,
            updates_tx,
            pending,
            connectivity,
            task,
        }
    }

    /// The configured server address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status transition
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Life cycle phase and counters
    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    /// Receiver notified whenever the bookkeeping changes
    pub fn progress_watch(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Subscribe to keyed updates as they arrive
    pub fn subscribe(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates_tx.subscribe()
    }

    /// Snapshot of the latest payload per unique key
    pub async fn updates(&self) -> PendingUpdates {
        self.pending.read().await.clone()
    }

    /// Network signal consulted before scheduling a reconnect
    pub fn connectivity(&self) -> Connectivity {
        self.connectivity.clone()
    }

    /// Send an application message on the open session.
    ///
    /// Fails with [`ClientError::ChannelNotReady`] when no session is open;
    /// nothing is buffered for later.
    pub async fn send(&self, message: Value) -> Result<(), ClientError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send { message, reply })
            .map_err(|_| ClientError::ManagerStopped)?;
        reply_rx.await.map_err(|_| ClientError::ManagerStopped)?
    }

    /// Close the channel and never reconnect. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Wait for the manager task to finish after [`shutdown`](Self::shutdown)
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Connection manager task failed: {}", e);
        }
    }
}

/// The single outstanding instance of each timer
#[derive(Debug, Default)]
struct Timers {
    heartbeat: Option<(SessionId, Instant)>,
    grace: Option<(SessionId, Instant)>,
    reconnect: Option<Instant>,
}

/// State owned by the manager task
struct Driver<C: TransportConnector> {
    machine: ConnectionMachine,
    connector: Arc<C>,
    close_timeout: Duration,
    slot: Option<SessionSlot>,
    timers: Timers,
    events_tx: mpsc::UnboundedSender<MachineEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    progress_tx: watch::Sender<Progress>,
    updates_tx: broadcast::Sender<FeedUpdate>,
    pending: Arc<RwLock<PendingUpdates>>,
}

impl<C: TransportConnector> Driver<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<MachineEvent>,
        mut online: watch::Receiver<bool>,
    ) {
        let initially_online = *online.borrow_and_update();
        self.dispatch(MachineEvent::NetworkChanged {
            online: initially_online,
        })
        .await;
        self.dispatch(MachineEvent::Start).await;

        let mut watching_network = true;
        loop {
            let heartbeat_at = self.timers.heartbeat.map(|(_, at)| at);
            let grace_at = self.timers.grace.map(|(_, at)| at);
            let reconnect_at = self.timers.reconnect;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { message, reply }) => {
                        let _ = reply.send(self.send(message));
                    }
                    Some(Command::Shutdown) | None => {
                        self.dispatch(MachineEvent::Shutdown).await;
                        break;
                    }
                },
                Some(event) = events.recv() => {
                    if let MachineEvent::Opened(id) = &event {
                        if let Some(slot) = self.slot.as_mut().filter(|s| s.id() == *id) {
                            slot.mark_opened();
                        }
                    }
                    self.dispatch(event).await;
                }
                changed = online.changed(), if watching_network => match changed {
                    Ok(()) => {
                        let now_online = *online.borrow_and_update();
                        self.dispatch(MachineEvent::NetworkChanged { online: now_online }).await;
                    }
                    Err(_) => watching_network = false,
                },
                _ = sleep_until(heartbeat_at.unwrap_or_else(Instant::now)), if heartbeat_at.is_some() => {
                    if let Some((id, at)) = self.timers.heartbeat {
                        let interval = self.machine.policy().heartbeat_interval;
                        self.timers.heartbeat = Some((id, at + interval));
                        self.dispatch(MachineEvent::HeartbeatTick(id)).await;
                    }
                }
                _ = sleep_until(grace_at.unwrap_or_else(Instant::now)), if grace_at.is_some() => {
                    if let Some((id, _)) = self.timers.grace.take() {
                        self.dispatch(MachineEvent::GraceExpired(id)).await;
                    }
                }
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.timers.reconnect = None;
                    self.dispatch(MachineEvent::ReconnectDue).await;
                }
            }
        }

        debug!("Connection manager stopped");
    }

    /// Feed one event through the machine and carry out its effects
    async fn dispatch(&mut self, event: MachineEvent) {
        let effects = self.machine.handle(event);
        for effect in effects {
            self.apply(effect).await;
        }
        let progress = Progress::of(&self.machine);
        self.progress_tx.send_if_modified(|current| {
            if *current == progress {
                false
            } else {
                *current = progress;
                true
            }
        });
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Status(status) => {
                info!(%status, "Connection status changed");
                self.status_tx.send_replace(status);
            }
            Effect::OpenSession(id) => {
                if let Some(previous) = self.slot.take() {
                    previous.detach();
                }
                self.slot = Some(SessionSlot::spawn(
                    self.connector.clone(),
                    id,
                    self.events_tx.clone(),
                    self.close_timeout,
                ));
            }
            Effect::Transmit(id, outbound) => {
                if let Err(e) = self.transmit(id, &outbound) {
                    debug!(session = %id, "Dropping outbound frame: {}", e);
                }
            }
            Effect::CloseSession(id) => {
                if let Some(slot) = self.slot.as_ref().filter(|s| s.id() == id) {
                    slot.close();
                }
            }
            Effect::ReleaseSession => {
                if let Some(slot) = self.slot.take() {
                    slot.detach();
                }
            }
            Effect::StartHeartbeat(id) => {
                let interval = self.machine.policy().heartbeat_interval;
                self.timers.heartbeat = Some((id, Instant::now() + interval));
            }
            Effect::StopHeartbeat => self.timers.heartbeat = None,
            Effect::StartGrace(id, after) => {
                self.timers.grace = Some((id, Instant::now() + after));
            }
            Effect::CancelGrace => self.timers.grace = None,
            Effect::ScheduleReconnect { delay, attempt } => {
                info!(attempt, "Reconnecting in {:.1}s", delay.as_secs_f64());
                self.timers.reconnect = Some(Instant::now() + delay);
            }
            Effect::CancelReconnect => self.timers.reconnect = None,
            Effect::Deliver(update) => {
                self.pending.write().await.insert(update.clone());
                // No subscribers is fine; the snapshot still has it
                let _ = self.updates_tx.send(update);
            }
            Effect::RetriesExhausted { attempts } => {
                error!(attempts, "Giving up on reconnection");
            }
        }
    }

    fn send(&self, message: Value) -> Result<(), ClientError> {
        let id = self
            .machine
            .writable_session()
            .ok_or(ClientError::ChannelNotReady)?;
        self.transmit(id, &Outbound::Message(message))
    }

    fn transmit(&self, id: SessionId, outbound: &Outbound) -> Result<(), ClientError> {
        let slot = self
            .slot
            .as_ref()
            .filter(|s| s.id() == id)
            .ok_or(ClientError::ChannelNotReady)?;
        let text = codec::encode(outbound)?;
        if slot.send(text) {
            Ok(())
        } else {
            Err(ClientError::ChannelNotReady)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{memory_transport, ConnectMode};
    use feed_shared::CloseInfo;
    use serde_json::json;

    const PING: &str = r#"{"type":"ping"}"#;
    const PONG: &str = r#"{"type":"pong"}"#;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            address: "memory://feed".into(),
            ..Default::default()
        }
    }

    async fn wait_status(manager: &ConnectionManager, expected: ConnectionStatus) {
        let mut status = manager.status_watch();
        let reached = status.wait_for(|s| *s == expected).await.is_ok();
        assert!(reached, "manager stopped before reaching {}", expected);
    }

    async fn wait_lifecycle(manager: &ConnectionManager, expected: Lifecycle) {
        let mut progress = manager.progress_watch();
        let reached = progress.wait_for(|p| p.lifecycle == expected).await.is_ok();
        assert!(reached, "manager stopped before reaching {:?}", expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_are_delivered_and_recorded() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);
        let mut updates = manager.subscribe();

        let peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;

        peer.push_text(r#"{"event":"update","data":{"unique_reference":"2025-9-USHNS=ECI","actual":61.0}}"#);
        peer.push_text(r#"{"event":"update","data":{"actual":3.0}}"#);
        peer.push_text("not json");
        peer.push_text(r#"{"event":"update","data":{"unique_reference":"2025-9-USHNS=ECI","actual":64.5}}"#);

        let first = updates.recv().await.expect("first update");
        assert_eq!(first.key, "2025-9-USHNS=ECI");
        let second = updates.recv().await.expect("second update");
        assert_eq!(second.data["actual"], json!(64.5));

        let snapshot = manager.updates().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("2025-9-USHNS=ECI").unwrap()["actual"], json!(64.5));
        assert_eq!(manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ping_gets_pong() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);

        let mut peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;

        peer.push_text(PING);
        assert_eq!(peer.next_sent().await.as_deref(), Some(PONG));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_session() {
        let (connector, mut server) = memory_transport();
        server.set_mode(ConnectMode::Hang);
        let manager = ConnectionManager::with_connector(config(), connector);

        let result = manager.send(json!({"action": "subscribe"})).await;
        assert!(matches!(result, Err(ClientError::ChannelNotReady)));
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_on_open_session() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);

        let mut peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;

        manager
            .send(json!({"action": "subscribe"}))
            .await
            .expect("send on open session");
        assert_eq!(
            peer.next_sent().await.as_deref(),
            Some(r#"{"action":"subscribe"}"#)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_within_grace_keeps_connection() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);

        let mut peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;
        let start = Instant::now();

        // Five unanswered pings, then the sixth interval opens the grace window
        wait_status(&manager, ConnectionStatus::Disconnected).await;
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        let sent = peer.drain();
        assert_eq!(sent.len(), 5);
        assert!(sent.iter().all(|frame| frame == PING));
        assert_eq!(manager.progress().missed_heartbeats, 5);

        tokio::time::sleep(Duration::from_secs(10)).await;
        peer.push_text(PONG);
        wait_status(&manager, ConnectionStatus::Connected).await;

        // Past the point where the grace timer would have fired
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(manager.progress().missed_heartbeats, 0);
        assert_eq!(manager.progress().lifecycle, Lifecycle::Open);
        assert!(!peer.client_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_closes_and_reconnects() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);

        let first = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;
        let start = Instant::now();

        // 180s to the grace window, 15s of grace, 3s of backoff
        let second = server.accept().await;
        assert_eq!(start.elapsed(), Duration::from_secs(198));
        assert!(first.client_closed());
        assert!(!second.client_closed());

        wait_status(&manager, ConnectionStatus::Connected).await;
        assert_eq!(manager.progress().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_retry_ceiling() {
        let (connector, server) = memory_transport();
        server.set_mode(ConnectMode::Refuse);
        let config = ConnectionConfig {
            max_retries: 3,
            ..config()
        };
        let start = Instant::now();
        let manager = ConnectionManager::with_connector(config, connector);

        wait_lifecycle(&manager, Lifecycle::Exhausted).await;
        let offsets: Vec<u64> = server
            .attempt_times()
            .iter()
            .map(|t| (*t - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 3, 8, 13]);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        // Nothing further is scheduled
        server.set_mode(ConnectMode::Accept);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempt_times().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_origin_rejection_is_terminal() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);

        let peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;
        peer.close(CloseInfo {
            code: 4003,
            reason: "Origin not allowed".into(),
            clean: true,
        });

        wait_status(&manager, ConnectionStatus::Error).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempt_times().len(), 1);
        assert_eq!(manager.progress().lifecycle, Lifecycle::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_handshake_is_terminal() {
        let (connector, server) = memory_transport();
        server.set_mode(ConnectMode::Reject);
        let manager = ConnectionManager::with_connector(config(), connector);

        wait_status(&manager, ConnectionStatus::Error).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempt_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_stops() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);

        let peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;
        peer.close(CloseInfo {
            code: 1000,
            reason: "server going away".into(),
            clean: true,
        });

        wait_lifecycle(&manager, Lifecycle::Stopped).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(peer.close_replied());
        assert!(!peer.client_closed());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempt_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_pauses_reconnect() {
        let (connector, mut server) = memory_transport();
        let connectivity = Connectivity::new(true);
        let manager =
            ConnectionManager::with_connectivity(config(), connector, connectivity.clone());

        let peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;

        connectivity.set_online(false);
        // Paused clock: this only returns once the manager has gone idle
        tokio::time::sleep(Duration::from_millis(1)).await;
        peer.close(CloseInfo::abnormal("network unreachable"));
        wait_lifecycle(&manager, Lifecycle::Offline).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempt_times().len(), 1);

        let resumed_at = Instant::now();
        connectivity.set_online(true);
        let _second = server.accept().await;
        assert_eq!(resumed_at.elapsed(), Duration::ZERO);
        wait_status(&manager, ConnectionStatus::Connected).await;
        assert_eq!(manager.progress().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_handle_from_manager() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);
        let connectivity = manager.connectivity();
        assert!(connectivity.is_online());

        let peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;

        manager.connectivity().set_online(false);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!connectivity.is_online());

        peer.close(CloseInfo::abnormal("network unreachable"));
        wait_lifecycle(&manager, Lifecycle::Offline).await;
        assert_eq!(server.attempt_times().len(), 1);

        connectivity.set_online(true);
        let _second = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_connecting() {
        let (connector, server) = memory_transport();
        server.set_mode(ConnectMode::Hang);
        let manager = ConnectionManager::with_connector(config(), connector);

        // Let the first attempt start
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.attempt_times().len(), 1);

        manager.shutdown();
        manager.shutdown();
        wait_lifecycle(&manager, Lifecycle::Closed).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        server.set_mode(ConnectMode::Accept);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempt_times().len(), 1);

        let result = manager.send(json!({"action": "subscribe"})).await;
        assert!(matches!(result, Err(ClientError::ManagerStopped)));
        manager.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_open_session() {
        let (connector, mut server) = memory_transport();
        let manager = ConnectionManager::with_connector(config(), connector);

        let peer = server.accept().await;
        wait_status(&manager, ConnectionStatus::Connected).await;

        manager.shutdown();
        manager.join().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(peer.client_closed());
    }

    #[tokio::test]
    async fn test_websocket_loopback() {
        use futures::{SinkExt, StreamExt};
        use tokio::net::TcpListener;
        use tokio::time::timeout;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        use tokio_tungstenite::tungstenite::Message;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"event":"update","data":{"id":7,"actual":1.5}}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4003),
                reason: "Origin not allowed".into(),
            }))
            .await
            .unwrap();
            // The client must answer the close before dropping the socket
            while let Some(message) = ws.next().await {
                message.expect("close handshake completed");
            }
        });

        let manager = ConnectionManager::new(ConnectionConfig {
            address: format!("ws://{}", addr),
            ..Default::default()
        });
        let mut updates = manager.subscribe();

        let update = timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("timed out waiting for update")
            .expect("update");
        assert_eq!(update.key, "7");
        assert_eq!(update.data["actual"], json!(1.5));

        let mut status = manager.status_watch();
        let rejected = timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ConnectionStatus::Error),
        )
        .await
        .expect("timed out waiting for rejection")
        .is_ok();
        assert!(rejected);

        server.await.unwrap();
        manager.shutdown();
        manager.join().await;
    }
}
