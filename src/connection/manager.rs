//! Push channel with automatic reconnection

use crate::transport::ResponseSink;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use udpu_shared::codec;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events emitted by the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// Successfully connected to the control plane
    Connected,
    /// Connection lost; a reconnect follows unless shutting down
    Disconnected { reason: String },
    /// Text message received from the control plane
    Received(String),
}

/// Configuration for the push channel
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// `ws://host:port/api/v1.0/pubsub?channel=<subscriber>`
    pub url: Url,
    /// Fixed delay between connection attempts
    pub reconnect_delay: Duration,
}

/// Persistent push-channel connection owned by the session supervisor
pub struct PushChannel {
    /// Channel to send text frames to the server
    outbound_tx: mpsc::Sender<String>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<PushEvent>,
}

impl PushChannel {
    /// Create the channel and start the connection loop on `tracker`
    pub fn start(config: PushConfig, token: CancellationToken, tracker: &TaskTracker) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(100);
        let (event_tx, event_rx) = mpsc::channel::<PushEvent>(100);

        tracker.spawn(async move {
            connection_loop(config, outbound_rx, event_tx, token).await;
        });

        Self {
            outbound_tx,
            event_rx,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.event_rx.recv().await
    }

    /// Send-only handle for response messages
    pub fn sender(&self) -> PushSender {
        PushSender {
            tx: self.outbound_tx.clone(),
        }
    }
}

/// Response capability handed to the job engine
#[derive(Debug, Clone)]
pub struct PushSender {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl ResponseSink for PushSender {
    async fn send_response(&self, output: &str) -> Result<()> {
        let text = codec::encode_response(output)?;
        self.tx
            .send(text)
            .await
            .map_err(|_| anyhow!("Push channel closed"))
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: PushConfig,
    mut outbound_rx: mpsc::Receiver<String>,
    event_tx: mpsc::Sender<PushEvent>,
    token: CancellationToken,
) {
    loop {
        let connect = tokio::select! {
            _ = token.cancelled() => break,
            result = tokio_tungstenite::connect_async(config.url.as_str()) => result,
        };

        match connect {
            Ok((stream, _response)) => {
                info!("Push channel connected");
                let _ = event_tx.send(PushEvent::Connected).await;

                match handle_connection(stream, &mut outbound_rx, &event_tx, &token).await {
                    Ok(()) => break,
                    Err(reason) => {
                        info!(
                            "Push channel error: {}. Reconnecting in {:?}...",
                            reason, config.reconnect_delay
                        );
                        let _ = event_tx
                            .send(PushEvent::Disconnected {
                                reason: reason.to_string(),
                            })
                            .await;
                    }
                }
            }
            Err(e) => {
                info!(
                    "Push channel connection error: {}. Retrying in {:?}...",
                    e, config.reconnect_delay
                );
            }
        }

        // Wait before reconnecting
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    info!("Shutting down push channel");
}

/// Handle an active connection; `Ok` means shutdown closed it
async fn handle_connection(
    stream: WsStream,
    outbound_rx: &mut mpsc::Receiver<String>,
    event_tx: &mpsc::Sender<PushEvent>,
    token: &CancellationToken,
) -> Result<()> {
    let (mut writer, mut reader) = stream.split();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Closing push channel connection");
                let _ = writer.send(Message::Close(None)).await;
                return Ok(());
            }

            // Send outbound messages
            Some(text) = outbound_rx.recv() => {
                writer.send(Message::Text(text.into())).await?;
            }

            // Read incoming messages
            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(PushEvent::Received(text.to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(anyhow!("Server closed connection"));
                    }
                    Some(Ok(other)) => {
                        debug!("Ignoring non-text frame ({} bytes)", other.len());
                    }
                    Some(Err(e)) => {
                        warn!("Push channel read error: {}", e);
                        return Err(anyhow!("Read error: {}", e));
                    }
                }
            }
        }
    }
}
