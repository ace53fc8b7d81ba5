//! Signaling client side: how a participant reaches the rendezvous service.
//!
//! Every identity lives on its own [`FramePipe`]. Dropping the pipe is how
//! an identity is given up; the service then tells the other side.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::LinkError;
use crate::hub::RendezvousHub;
use crate::protocol::{ClientFrame, Encoded, ServerFrame};

/// One session with the rendezvous service.
pub struct FramePipe {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

impl FramePipe {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientFrame>,
        inbound: mpsc::UnboundedReceiver<ServerFrame>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn send(&self, frame: ClientFrame) -> Result<(), LinkError> {
        self.outbound
            .send(frame)
            .map_err(|_| LinkError::SignalingClosed)
    }

    /// Next frame from the service; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.inbound.recv().await
    }

    /// A sender usable from other tasks for as long as the session lives.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientFrame> {
        self.outbound.clone()
    }
}

/// A rendezvous service a participant can open sessions against.
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    async fn open(&self) -> Result<FramePipe, LinkError>;
}

#[async_trait]
impl Rendezvous for RendezvousHub {
    async fn open(&self) -> Result<FramePipe, LinkError> {
        Ok(self.attach())
    }
}

/// Rendezvous over a WebSocket served by [`crate::server::RendezvousServer`].
#[derive(Debug, Clone)]
pub struct WsRendezvous {
    url: String,
}

impl WsRendezvous {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Rendezvous for WsRendezvous {
    async fn open(&self) -> Result<FramePipe, LinkError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerFrame>();

        // Writer task: forward outgoing frames; close the socket once the
        // pipe's last sender is gone.
        tokio::spawn(async move {
            while let Some(frame) = client_rx.recv().await {
                let msg = match frame.encode() {
                    Ok(Encoded::Text(text)) => Message::Text(text.into()),
                    Ok(Encoded::Binary(bytes)) => Message::Binary(bytes.into()),
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode incoming frames until the socket ends.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let encoded = match msg {
                    Ok(Message::Text(text)) => Encoded::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(bytes)) => Encoded::Binary(bytes.to_vec()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match ServerFrame::decode(encoded) {
                    Ok(frame) => {
                        if server_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring malformed server frame: {e}"),
                }
            }
            log::debug!("Signaling socket closed");
        });

        Ok(FramePipe::new(client_tx, server_rx))
    }
}
