//! WebSocket transport over tokio-tungstenite

use crate::transport::traits::{
    ConnectError, Frame, TransportConnector, TransportSink, TransportSource,
};
use anyhow::Result;
use async_trait::async_trait;
use feed_shared::CloseInfo;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer's close frame carried no status
const CLOSE_NO_STATUS: u16 = 1005;

/// HTTP status a server uses to refuse a disallowed origin
const HTTP_FORBIDDEN: u16 = 403;

/// Write half of a WebSocket connection
pub struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.inner.send(Message::Close(Some(frame))).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        // tungstenite queues the close reply while reading; writing it needs a flush
        self.inner.flush().await?;
        Ok(())
    }
}

/// Read half of a WebSocket connection
pub struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl TransportSource for WsSource {
    async fn next_frame(&mut self) -> Frame {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Frame::Text(text),
                Some(Ok(Message::Binary(data))) => {
                    return Frame::Text(String::from_utf8_lossy(&data).into_owned())
                }
                Some(Ok(Message::Close(frame))) => return Frame::Closed(close_info(frame)),
                // Transport-level ping/pong is answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Frame::Closed(CloseInfo::abnormal(e.to_string())),
                None => return Frame::Closed(CloseInfo::abnormal("stream ended without close frame")),
            }
        }
    }
}

fn close_info(frame: Option<CloseFrame<'_>>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
            clean: true,
        },
        None => CloseInfo {
            code: CLOSE_NO_STATUS,
            reason: String::new(),
            clean: true,
        },
    }
}

/// WebSocket connector for a fixed server address
pub struct WsConnector {
    address: String,
}

impl WsConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    type Sink = WsSink;
    type Source = WsSource;

    async fn connect(&self) -> Result<(WsSink, WsSource), ConnectError> {
        debug!(address = %self.address, "Opening WebSocket");
        match tokio_tungstenite::connect_async(self.address.as_str()).await {
            Ok((stream, _response)) => {
                let (sink, source) = stream.split();
                Ok((WsSink { inner: sink }, WsSource { inner: source }))
            }
            Err(tungstenite::Error::Http(response))
                if response.status().as_u16() == HTTP_FORBIDDEN =>
            {
                Err(ConnectError::Rejected(HTTP_FORBIDDEN))
            }
            Err(e) => Err(ConnectError::Failed(e.into())),
        }
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }
}
