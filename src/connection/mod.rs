//! Connection management for the live feed channel
//!
//! This module handles:
//! - One persistent channel session at a time, replaced wholesale on reconnect
//! - Application-level heartbeat with a grace window before forced close
//! - Bounded exponential backoff reconnection, paused while offline
//! - Status, update subscription and send surface for callers

mod config;
mod error;
mod manager;
mod network;
mod session;

pub use config::ConnectionConfig;
pub use error::ClientError;
pub use manager::{ConnectionManager, Progress};
pub use network::Connectivity;
