//! WebSocket client for the canvas server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - `change_color` requests
//! - An event stream of snapshots, deltas and rejections
//!
//! Used by the integration tests and by anything that wants to drive the
//! board without a browser (bots, load generators).
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    CellUpdate, ChangeColorRequest, ClientMessage, Grid, ProtocolError, Rejection, ServerMessage,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the canvas client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Full board, on connect and after a resync
    InitialBoard(Grid),
    /// A mutation accepted by the server (including our own)
    ColorChanged(CellUpdate),
    /// One of our requests was refused
    Rejected(Rejection),
    /// Connection lost
    Disconnected,
}

/// The canvas client.
pub struct CanvasClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Server URL
    server_url: String,
}

impl CanvasClient {
    /// Create a client for `server_url` (`ws://host:port`).
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. The
    /// first event delivered is the server's `initial_board`.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;

        // Reader task: decode server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            let event = match server_msg {
                                ServerMessage::InitialBoard(grid) => ClientEvent::InitialBoard(grid),
                                ServerMessage::ChangeColor(update) => ClientEvent::ColorChanged(update),
                                ServerMessage::Rejected(rejection) => ClientEvent::Rejected(rejection),
                            };
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Ask the server to set `(x, y)` to `color`.
    ///
    /// The change is not applied locally; it arrives back as
    /// [`ClientEvent::ColorChanged`] once the server accepts it.
    pub async fn change_color(
        &self,
        x: i64,
        y: i64,
        color: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let msg = ClientMessage::ChangeColor(ChangeColorRequest::new(x, y, color));
        self.send_raw(msg.encode()?).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(Message::text(text.into())).await
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.send(Message::Close(None)).await
    }

    async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        match self.outgoing_tx {
            Some(ref tx) => tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
