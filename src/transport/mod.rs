#[cfg(test)]
pub mod memory;
pub mod traits;
pub mod websocket;

pub use traits::{ConnectError, Frame, TransportConnector, TransportSink, TransportSource};
pub use websocket::WsConnector;
