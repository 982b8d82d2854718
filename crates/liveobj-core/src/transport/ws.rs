//! WebSocket client transport over `tokio-tungstenite`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Channel, Connector, Frame};
use crate::config::ClientConfig;
use crate::error::{LiveObjError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `url` (e.g. `ws://127.0.0.1:4000/liveobj`) on every connect.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Channel> {
        let (stream, _response) = tokio::time::timeout(
            ClientConfig::CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| LiveObjError::Timeout(ClientConfig::CONNECT_TIMEOUT))??;

        info!("WebSocket connected to {}", self.url);
        Ok(spawn_pumps(stream))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Bridge a WebSocket stream to a [`Channel`] with one read and one write task.
fn spawn_pumps(stream: WsStream) -> Channel {
    let (mut ws_write, mut ws_read) = stream.split();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(bytes) => Message::Binary(bytes.to_vec().into()),
            };
            if ws_write.send(msg).await.is_err() {
                warn!("WebSocket write failed, closing write loop");
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    tokio::spawn(async move {
        while let Some(result) = ws_read.next().await {
            let frame = match result {
                Ok(Message::Text(text)) => Frame::Text(text.to_string()),
                Ok(Message::Binary(bytes)) => Frame::Binary(Bytes::from(bytes)),
                Ok(Message::Close(_)) => {
                    debug!("WebSocket received close frame");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket read error: {}", e);
                    break;
                }
            };
            if in_tx.send(frame).is_err() {
                break;
            }
        }
    });

    Channel::new(in_rx, out_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // nothing listens on port 1
        let connector = WsConnector::new("ws://127.0.0.1:1/liveobj");
        assert_eq!(connector.describe(), "ws://127.0.0.1:1/liveobj");
        assert!(connector.connect().await.is_err());
    }
}
