use feed_shared::codec::CodecError;
use thiserror::Error;

/// Errors reported to callers of the connection manager
#[derive(Error, Debug)]
pub enum ClientError {
    /// No open session to write to; messages are not queued
    #[error("Channel not ready: no open session")]
    ChannelNotReady,

    #[error("Connection manager has stopped")]
    ManagerStopped,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] CodecError),
}
