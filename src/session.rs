//! Live WebSocket session with the relay.
//!
//! Incoming frames are decrypted on blocking threads, one at a time in
//! arrival order, and surfaced as [`SessionEvent`]s. A decrypt that has
//! started always runs to completion even if the receiver has gone away.

use std::sync::Arc;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::client::{decrypt_delivered, ViewEntry};
use crate::crypto::KeyMaterial;
use crate::logging::peer_id;
use crate::protocol::{DeliveredFrame, OutboundFrame};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("relay refused the handshake with HTTP {0}")]
    Rejected(u16),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("could not encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub enum SessionEvent {
    Message(ViewEntry),
    /// The relay closed the connection or the transport failed.
    Closed,
}

pub struct LiveSession {
    sink: Arc<Mutex<WsSink>>,
    reader: JoinHandle<()>,
}

impl LiveSession {
    /// Open `ws_url?token=…`. On success, events arrive on the returned
    /// receiver until [`SessionEvent::Closed`].
    pub async fn connect(
        ws_url: &str,
        token: &str,
        keys: KeyMaterial,
        self_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let url = format!("{ws_url}?token={token}");
        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| match e {
            tungstenite::Error::Http(response) => SessionError::Rejected(response.status().as_u16()),
            other => SessionError::WebSocket(other),
        })?;
        tracing::info!("session: connected to {ws_url} as {}", peer_id(self_id));

        let (sink, mut read) = stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let keys = Arc::new(keys);
        let self_id = self_id.to_string();

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let frame: DeliveredFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::warn!("session: ignoring unreadable frame: {e}");
                                continue;
                            }
                        };
                        let keys = Arc::clone(&keys);
                        let me = self_id.clone();
                        let decrypted = tokio::task::spawn_blocking(move || {
                            decrypt_delivered(&keys, &frame, &me)
                        })
                        .await;
                        match decrypted {
                            Ok(entry) => {
                                let _ = events_tx.send(SessionEvent::Message(entry));
                            }
                            Err(e) => tracing::error!("session: decrypt task failed: {e}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::debug!("session: websocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            tracing::info!("session: disconnected");
            let _ = events_tx.send(SessionEvent::Closed);
        });

        Ok((
            Self {
                sink: Arc::new(Mutex::new(sink)),
                reader,
            },
            events_rx,
        ))
    }

    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), SessionError> {
        let text = serde_json::to_string(frame)?;
        self.sink.lock().await.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Close the socket. The reader task finishes once the relay acknowledges.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.sink.lock().await.close().await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
