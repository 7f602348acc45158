//! In-memory transport driven by tests

use crate::transport::traits::{
    ConnectError, Frame, TransportConnector, TransportSink, TransportSource,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use feed_shared::CloseInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What the next connection attempt does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    /// Fail like a refused TCP connect
    Refuse,
    /// Fail the handshake with HTTP 403
    Reject,
    /// Never complete
    Hang,
}

#[derive(Debug)]
struct Shared {
    mode: Mutex<ConnectMode>,
    attempts: Mutex<Vec<Instant>>,
}

/// Client side connector
pub struct MemoryConnector {
    shared: Arc<Shared>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

/// Test side: accepts connections and controls how attempts behave
pub struct MemoryServer {
    shared: Arc<Shared>,
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

pub fn memory_transport() -> (MemoryConnector, MemoryServer) {
    let shared = Arc::new(Shared {
        mode: Mutex::new(ConnectMode::Accept),
        attempts: Mutex::new(Vec::new()),
    });
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            shared: shared.clone(),
            accepted: accepted_tx,
        },
        MemoryServer {
            shared,
            accepted: accepted_rx,
        },
    )
}

impl MemoryServer {
    pub async fn accept(&mut self) -> MemoryPeer {
        self.accepted.recv().await.expect("connector dropped")
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.shared.mode.lock().unwrap() = mode;
    }

    /// When each connection attempt started
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.shared.attempts.lock().unwrap().clone()
    }
}

/// Server end of one accepted connection
pub struct MemoryPeer {
    received: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Frame>,
    client_closed: Arc<AtomicBool>,
    close_replied: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Frame::Text(text.into()));
    }

    pub fn close(&self, info: CloseInfo) {
        let _ = self.to_client.send(Frame::Closed(info));
    }

    /// Next frame the client sent
    pub async fn next_sent(&mut self) -> Option<String> {
        self.received.recv().await
    }

    /// Everything the client has sent so far
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(text) = self.received.try_recv() {
            frames.push(text);
        }
        frames
    }

    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }

    /// Whether the client flushed its reply after this peer closed
    pub fn close_replied(&self) -> bool {
        self.close_replied.load(Ordering::SeqCst)
    }
}

pub struct MemorySink {
    to_peer: mpsc::UnboundedSender<String>,
    echo: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
    replied: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.to_peer.send(text).map_err(|_| anyhow!("peer gone"))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // The peer always completes the close handshake
        let _ = self.echo.send(Frame::Closed(CloseInfo {
            code: 1000,
            reason: String::new(),
            clean: true,
        }));
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.replied.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemorySource {
    from_peer: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl TransportSource for MemorySource {
    async fn next_frame(&mut self) -> Frame {
        self.from_peer
            .recv()
            .await
            .unwrap_or_else(|| Frame::Closed(CloseInfo::abnormal("peer dropped")))
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    type Sink = MemorySink;
    type Source = MemorySource;

    async fn connect(&self) -> Result<(MemorySink, MemorySource), ConnectError> {
        self.shared.attempts.lock().unwrap().push(Instant::now());
        let mode = *self.shared.mode.lock().unwrap();

        match mode {
            ConnectMode::Accept => {}
            ConnectMode::Refuse => return Err(ConnectError::Failed(anyhow!("connection refused"))),
            ConnectMode::Reject => return Err(ConnectError::Rejected(403)),
            ConnectMode::Hang => return std::future::pending().await,
        }

        let (to_peer, received) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let client_closed = Arc::new(AtomicBool::new(false));
        let close_replied = Arc::new(AtomicBool::new(false));

        let _ = self.accepted.send(MemoryPeer {
            received,
            to_client: to_client.clone(),
            client_closed: client_closed.clone(),
            close_replied: close_replied.clone(),
        });

        Ok((
            MemorySink {
                to_peer,
                echo: to_client,
                closed: client_closed,
                replied: close_replied,
            },
            MemorySource { from_peer },
        ))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
