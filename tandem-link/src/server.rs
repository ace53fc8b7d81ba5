//! WebSocket front end for the rendezvous hub.
//!
//! ```text
//! Participant A ──ws──┐                          ┌──ws── Participant B
//!                     ├── handle_connection ─────┤
//!                     │     text   ⇄ control     │
//!                     │     binary ⇄ media       │
//!                     └────────► RendezvousHub ◄─┘
//! ```
//!
//! Each socket becomes one hub session. Closing the socket releases the
//! identity that session claimed.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{HubStats, RendezvousHub};
use crate::protocol::{ClientFrame, Encoded};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
        }
    }
}

/// The rendezvous server.
pub struct RendezvousServer {
    config: ServerConfig,
    hub: RendezvousHub,
}

impl RendezvousServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            hub: RendezvousHub::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Accept WebSocket connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Rendezvous server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: RendezvousHub,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut pipe = hub.attach();

        log::info!("WebSocket connection established from {addr}");

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let encoded = match msg {
                        Some(Ok(Message::Text(text))) => Encoded::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(data))) => Encoded::Binary(data.to_vec()),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };
                    match ClientFrame::decode(encoded) {
                        Ok(frame) => {
                            if pipe.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                    }
                }

                frame = pipe.recv() => {
                    let Some(frame) = frame else { break };
                    let msg = match frame.encode()? {
                        Encoded::Text(text) => Message::Text(text.into()),
                        Encoded::Binary(bytes) => Message::Binary(bytes.into()),
                    };
                    ws_sender.send(msg).await?;
                }
            }
        }

        Ok(())
    }

    pub fn stats(&self) -> HubStats {
        self.hub.stats()
    }

    /// The hub behind this server, for in-process participants.
    pub fn hub(&self) -> &RendezvousHub {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
