//! Connection State Machine
//!
//! Pure transition logic for one persistent channel: heartbeat accounting,
//! grace window, backoff reconnection and shutdown. The runtime feeds in
//! [`MachineEvent`]s and executes the returned [`Effect`]s; no timers or
//! sockets live here.
//!
//! Every session-scoped event carries the [`SessionId`] it was produced
//! under. Events whose id is not the current session are dropped, so a
//! superseded connection can never mutate the state of its replacement.

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec;
use crate::envelope::{FeedUpdate, HeartbeatFrame, Inbound, Outbound};
use crate::{policy, Policy};

/// Identity of one channel session; strictly increasing per machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection status as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// More than one ping outstanding; alive but degraded
    Unstable,
    Disconnected,
    /// Rejected by server policy; terminal
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Unstable => "unstable",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal life cycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, not yet started
    Idle,
    /// Open requested, waiting for the session to come up
    Connecting,
    /// Session up, heartbeat running
    Open,
    /// Missed-heartbeat ceiling reached, grace timer running
    GraceWait,
    /// Grace expired, forced close issued
    Closing,
    /// Backoff timer running
    ReconnectPending,
    /// Reconnect suspended until the network comes back
    Offline,
    /// Closed cleanly by the peer; no reconnect
    Stopped,
    /// Retry ceiling reached; terminal
    Exhausted,
    /// Rejected by server policy; terminal
    Rejected,
    /// Shut down by the caller; terminal
    Closed,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Stopped | Lifecycle::Exhausted | Lifecycle::Rejected | Lifecycle::Closed
        )
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// A close handshake completed
    pub clean: bool,
}

impl CloseInfo {
    /// Termination without a close handshake (transport error, dropped stream)
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: policy::CLOSE_ABNORMAL,
            reason: reason.into(),
            clean: false,
        }
    }

    pub fn is_origin_rejected(&self) -> bool {
        self.code == policy::CLOSE_ORIGIN_REJECTED
    }

    /// Close reason left behind when the fronting proxy restarts
    pub fn is_proxy_restart(&self) -> bool {
        self.reason.contains("CloudFlare") && self.reason.contains("proxy")
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    /// Open the first session
    Start,
    /// Session finished its handshake
    Opened(SessionId),
    /// Text frame received on a session
    Message(SessionId, String),
    /// Session terminated
    Closed(SessionId, CloseInfo),
    /// Heartbeat interval elapsed for a session
    HeartbeatTick(SessionId),
    /// Grace timer fired for a session
    GraceExpired(SessionId),
    /// Backoff timer fired
    ReconnectDue,
    /// Host network availability changed
    NetworkChanged { online: bool },
    /// Caller requested shutdown
    Shutdown,
}

/// Side effects the runtime must carry out, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish a new status value
    Status(ConnectionStatus),
    /// Detach whatever session is held and open a new one under this id
    OpenSession(SessionId),
    /// Write a frame to a session
    Transmit(SessionId, Outbound),
    /// Close a session
    CloseSession(SessionId),
    /// Drop the reference to the held session
    ReleaseSession,
    StartHeartbeat(SessionId),
    StopHeartbeat,
    StartGrace(SessionId, Duration),
    CancelGrace,
    /// Replace any pending reconnect timer with one firing after `delay`
    ScheduleReconnect { delay: Duration, attempt: u32 },
    CancelReconnect,
    /// Surface a keyed update to subscribers
    Deliver(FeedUpdate),
    /// Retry ceiling hit; no further reconnects
    RetriesExhausted { attempts: u32 },
}

/// The connection state machine
#[derive(Debug)]
pub struct ConnectionMachine {
    policy: Policy,
    lifecycle: Lifecycle,
    status: ConnectionStatus,
    current: Option<SessionId>,
    next_session: u64,
    missed_heartbeats: u32,
    attempts: u32,
    manual_close: bool,
    online: bool,
}

impl ConnectionMachine {
    /// Create an idle machine; feed [`MachineEvent::Start`] to connect
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            lifecycle: Lifecycle::Idle,
            status: ConnectionStatus::Connecting,
            current: None,
            next_session: 1,
            missed_heartbeats: 0,
            attempts: 0,
            manual_close: false,
            online: true,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.current
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_manually_closed(&self) -> bool {
        self.manual_close
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Session that may carry application frames right now
    pub fn writable_session(&self) -> Option<SessionId> {
        match self.lifecycle {
            Lifecycle::Open | Lifecycle::GraceWait => self.current,
            _ => None,
        }
    }

    /// Process an event and return the effects to execute
    pub fn handle(&mut self, event: MachineEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            MachineEvent::Start => self.on_start(&mut effects),
            MachineEvent::Opened(id) => self.on_opened(id, &mut effects),
            MachineEvent::Message(id, text) => self.on_message(id, &text, &mut effects),
            MachineEvent::Closed(id, info) => self.on_closed(id, info, &mut effects),
            MachineEvent::HeartbeatTick(id) => self.on_heartbeat_tick(id, &mut effects),
            MachineEvent::GraceExpired(id) => self.on_grace_expired(id, &mut effects),
            MachineEvent::ReconnectDue => self.on_reconnect_due(&mut effects),
            MachineEvent::NetworkChanged { online } => self.on_network_changed(online, &mut effects),
            MachineEvent::Shutdown => self.on_shutdown(&mut effects),
        }

        effects
    }

    fn is_current(&self, id: SessionId) -> bool {
        if self.current == Some(id) {
            true
        } else {
            debug!(session = %id, "Discarding event from superseded session");
            false
        }
    }

    fn set_status(&mut self, status: ConnectionStatus, effects: &mut Vec<Effect>) {
        if self.status != status {
            self.status = status;
            effects.push(Effect::Status(status));
        }
    }

    fn open_session(&mut self, effects: &mut Vec<Effect>) {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.current = Some(id);
        self.lifecycle = Lifecycle::Connecting;

        info!(session = %id, "Opening channel session");
        effects.push(Effect::OpenSession(id));
        self.set_status(ConnectionStatus::Connecting, effects);
    }

    fn on_start(&mut self, effects: &mut Vec<Effect>) {
        if self.lifecycle != Lifecycle::Idle {
            return;
        }
        // Status starts as connecting, so force the first publication
        effects.push(Effect::Status(ConnectionStatus::Connecting));
        self.open_session(effects);
    }

    fn on_opened(&mut self, id: SessionId, effects: &mut Vec<Effect>) {
        if !self.is_current(id) || self.lifecycle != Lifecycle::Connecting {
            return;
        }

        info!(session = %id, "Channel connected");
        self.lifecycle = Lifecycle::Open;
        self.attempts = 0;
        self.missed_heartbeats = 0;
        effects.push(Effect::StartHeartbeat(id));
        self.set_status(ConnectionStatus::Connected, effects);
    }

    fn on_message(&mut self, id: SessionId, text: &str, effects: &mut Vec<Effect>) {
        if !self.is_current(id) {
            return;
        }
        if !matches!(self.lifecycle, Lifecycle::Open | Lifecycle::GraceWait) {
            debug!(session = %id, lifecycle = ?self.lifecycle, "Ignoring frame on closing session");
            return;
        }

        let inbound = match codec::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                error!(session = %id, "Dropping malformed payload: {}", e);
                return;
            }
        };

        // Any decodable traffic proves the peer is alive
        self.missed_heartbeats = 0;
        if self.lifecycle == Lifecycle::GraceWait {
            info!(session = %id, "Traffic received within grace period; cancelling forced close");
            self.lifecycle = Lifecycle::Open;
            effects.push(Effect::CancelGrace);
        }
        self.set_status(ConnectionStatus::Connected, effects);

        match inbound {
            Inbound::Pong => {
                debug!(session = %id, "Pong received");
            }
            Inbound::Ping => {
                debug!(session = %id, "Server sent a ping; replying with pong");
                effects.push(Effect::Transmit(id, Outbound::Heartbeat(HeartbeatFrame::Pong)));
            }
            Inbound::Update(update) => {
                debug!(session = %id, key = %update.key, "Update received");
                effects.push(Effect::Deliver(update));
            }
            Inbound::UnkeyedUpdate(payload) => {
                warn!(session = %id, "Received update with no unique key: {}", payload);
            }
            Inbound::Other(payload) => {
                debug!(session = %id, "Ignoring unrecognized payload: {}", payload);
            }
        }
    }

    fn on_heartbeat_tick(&mut self, id: SessionId, effects: &mut Vec<Effect>) {
        if !self.is_current(id) || self.lifecycle != Lifecycle::Open {
            return;
        }

        let ceiling = self.policy.max_missed_heartbeats;
        if self.missed_heartbeats >= ceiling {
            warn!(
                session = %id,
                "No pong received after {} tries; waiting {}s before closing",
                ceiling,
                self.policy.grace_period.as_secs()
            );
            self.lifecycle = Lifecycle::GraceWait;
            self.set_status(ConnectionStatus::Disconnected, effects);
            effects.push(Effect::StartGrace(id, self.policy.grace_period));
            return;
        }

        debug!(session = %id, missed = self.missed_heartbeats, "Sending ping");
        effects.push(Effect::Transmit(id, Outbound::Heartbeat(HeartbeatFrame::Ping)));
        self.missed_heartbeats += 1;
        if self.missed_heartbeats > 1 {
            self.set_status(ConnectionStatus::Unstable, effects);
        }
    }

    fn on_grace_expired(&mut self, id: SessionId, effects: &mut Vec<Effect>) {
        if !self.is_current(id) || self.lifecycle != Lifecycle::GraceWait {
            return;
        }
        if self.missed_heartbeats < self.policy.max_missed_heartbeats {
            return;
        }

        warn!(session = %id, "No pong after grace period; closing channel");
        self.lifecycle = Lifecycle::Closing;
        effects.push(Effect::StopHeartbeat);
        effects.push(Effect::CloseSession(id));
    }

    fn on_closed(&mut self, id: SessionId, info: CloseInfo, effects: &mut Vec<Effect>) {
        if !self.is_current(id) {
            return;
        }

        let forced = self.lifecycle == Lifecycle::Closing;
        effects.push(Effect::StopHeartbeat);
        if self.lifecycle == Lifecycle::GraceWait {
            effects.push(Effect::CancelGrace);
        }
        self.current = None;
        effects.push(Effect::ReleaseSession);

        if info.is_origin_rejected() {
            error!(session = %id, code = info.code, "Connection rejected: origin not allowed");
            self.manual_close = true;
            self.lifecycle = Lifecycle::Rejected;
            self.set_status(ConnectionStatus::Error, effects);
            return;
        }

        warn!(
            session = %id,
            code = info.code,
            reason = %info.reason,
            clean = info.clean,
            manual_close = self.manual_close,
            attempts = self.attempts,
            "Channel disconnected"
        );
        self.set_status(ConnectionStatus::Disconnected, effects);

        if self.manual_close {
            self.lifecycle = Lifecycle::Closed;
            return;
        }

        if info.clean && !info.is_proxy_restart() && !forced {
            info!(session = %id, "Channel closed cleanly; no reconnection necessary");
            self.lifecycle = Lifecycle::Stopped;
            return;
        }

        self.schedule_reconnect(effects);
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        if !self.online {
            warn!("Host is offline; pausing reconnection until the network returns");
            self.lifecycle = Lifecycle::Offline;
            return;
        }

        if self.attempts >= self.policy.max_retries {
            error!(attempts = self.attempts, "Max reconnect attempts reached; stopping retries");
            self.lifecycle = Lifecycle::Exhausted;
            effects.push(Effect::RetriesExhausted {
                attempts: self.attempts,
            });
            return;
        }

        let delay = self.policy.backoff(self.attempts);
        self.attempts += 1;
        warn!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.lifecycle = Lifecycle::ReconnectPending;
        effects.push(Effect::CancelReconnect);
        effects.push(Effect::ScheduleReconnect {
            delay,
            attempt: self.attempts,
        });
    }

    fn on_reconnect_due(&mut self, effects: &mut Vec<Effect>) {
        if self.lifecycle != Lifecycle::ReconnectPending || self.manual_close {
            return;
        }
        info!(attempt = self.attempts, "Triggering reconnection");
        self.open_session(effects);
    }

    fn on_network_changed(&mut self, online: bool, effects: &mut Vec<Effect>) {
        if self.online == online {
            return;
        }
        self.online = online;

        if online && self.lifecycle == Lifecycle::Offline && !self.manual_close {
            info!("Network is back; reconnecting");
            self.open_session(effects);
        }
    }

    fn on_shutdown(&mut self, effects: &mut Vec<Effect>) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }

        info!("Shutting down connection");
        self.manual_close = true;
        self.lifecycle = Lifecycle::Closed;
        effects.push(Effect::CancelReconnect);
        effects.push(Effect::StopHeartbeat);
        effects.push(Effect::CancelGrace);
        if let Some(id) = self.current.take() {
            effects.push(Effect::CloseSession(id));
            effects.push(Effect::ReleaseSession);
        }
        if self.status != ConnectionStatus::Error {
            self.set_status(ConnectionStatus::Disconnected, effects);
        }
    }
}
