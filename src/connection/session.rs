//! Channel session task
//!
//! Each session runs in its own task and reports back to the manager through
//! the shared event channel, tagging every event with its [`SessionId`].

use crate::transport::{Frame, TransportConnector, TransportSink, TransportSource};
use feed_shared::{CloseInfo, MachineEvent, SessionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

/// Requests from the manager to a session task
#[derive(Debug)]
enum SessionCommand {
    Send(String),
    Close,
}

/// The manager's handle on the current session
pub(crate) struct SessionSlot {
    id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
    opened: bool,
}

impl SessionSlot {
    /// Spawn a task that connects and then pumps frames both ways
    pub(crate) fn spawn<C: TransportConnector>(
        connector: Arc<C>,
        id: SessionId,
        events: mpsc::UnboundedSender<MachineEvent>,
        close_timeout: Duration,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(connector, id, commands_rx, events, close_timeout));

        Self {
            id,
            commands,
            task,
            opened: false,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn mark_opened(&mut self) {
        self.opened = true;
    }

    /// Queue a text frame; fails if the session task is gone
    pub(crate) fn send(&self, text: String) -> bool {
        self.commands.send(SessionCommand::Send(text)).is_ok()
    }

    pub(crate) fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    /// Let go of the session. An attempt still connecting is aborted; an open
    /// one closes itself once it sees the command channel drop.
    pub(crate) fn detach(self) {
        if !self.opened {
            self.task.abort();
        }
    }
}

async fn run_session<C: TransportConnector>(
    connector: Arc<C>,
    id: SessionId,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<MachineEvent>,
    close_timeout: Duration,
) {
    debug!(session = %id, transport = connector.name(), "Connecting");
    let (mut sink, mut source) = match connector.connect().await {
        Ok(halves) => halves,
        Err(e) => {
            warn!(session = %id, "Connection attempt failed: {}", e);
            let _ = events.send(MachineEvent::Closed(id, e.close_info()));
            return;
        }
    };
    let _ = events.send(MachineEvent::Opened(id));

    let mut close_deadline: Option<Instant> = None;
    loop {
        let deadline = close_deadline;
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Send(text)) => {
                    if let Err(e) = sink.send_text(text).await {
                        let _ = events.send(MachineEvent::Closed(id, CloseInfo::abnormal(e.to_string())));
                        return;
                    }
                }
                Some(SessionCommand::Close) => {
                    if close_deadline.is_some() {
                        continue;
                    }
                    if let Err(e) = sink.close().await {
                        let _ = events.send(MachineEvent::Closed(id, CloseInfo::abnormal(e.to_string())));
                        return;
                    }
                    close_deadline = Some(Instant::now() + close_timeout);
                }
                None => {
                    // Detached by the manager; nobody listens any more
                    if close_deadline.is_none() {
                        let _ = sink.close().await;
                    }
                    return;
                }
            },
            frame = source.next_frame() => match frame {
                Frame::Text(text) => {
                    let _ = events.send(MachineEvent::Message(id, text));
                }
                Frame::Closed(info) => {
                    // Send our half of the close handshake before dropping the socket
                    if close_deadline.is_none() {
                        match timeout(close_timeout, sink.flush()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(session = %id, "Close reply not sent: {}", e),
                            Err(_) => debug!(session = %id, "Close reply timed out"),
                        }
                    }
                    let _ = events.send(MachineEvent::Closed(id, info));
                    return;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(session = %id, "Peer did not answer close; dropping connection");
                let _ = events.send(MachineEvent::Closed(
                    id,
                    CloseInfo::abnormal("close handshake timed out"),
                ));
                return;
            }
        }
    }
}
