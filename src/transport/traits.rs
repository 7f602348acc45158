//! Transport trait abstraction for pluggable channel backends

use anyhow::Result;
use async_trait::async_trait;
use feed_shared::{policy, CloseInfo};
use thiserror::Error;

/// One inbound unit from a transport
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Text payload
    Text(String),
    /// The channel has ended; no frames follow
    Closed(CloseInfo),
}

/// Why a connection attempt failed
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The server refused the handshake on policy grounds (e.g. origin)
    #[error("Handshake rejected by server policy (HTTP {0})")]
    Rejected(u16),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ConnectError {
    /// How the failed attempt is reported to the state machine
    pub fn close_info(&self) -> CloseInfo {
        match self {
            ConnectError::Rejected(status) => CloseInfo {
                code: policy::CLOSE_ORIGIN_REJECTED,
                reason: format!("handshake rejected with HTTP {}", status),
                clean: true,
            },
            ConnectError::Failed(e) => CloseInfo::abnormal(e.to_string()),
        }
    }
}

/// Write half of a connected channel
#[async_trait]
pub trait TransportSink: Send + 'static {
    /// Send one text frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Start a graceful close; the peer's reply arrives as [`Frame::Closed`]
    async fn close(&mut self) -> Result<()>;

    /// Write out anything the transport queued on its own, such as the reply
    /// to a close the peer started
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Read half of a connected channel
#[async_trait]
pub trait TransportSource: Send + 'static {
    /// Wait for the next frame. Must be cancel safe.
    async fn next_frame(&mut self) -> Frame;
}

/// Factory for creating channel connections
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    type Sink: TransportSink;
    type Source: TransportSource;

    /// Attempt to connect, returning both halves on success
    async fn connect(&self) -> Result<(Self::Sink, Self::Source), ConnectError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
