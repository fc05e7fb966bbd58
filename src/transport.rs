//! Client-side transport channel.
//!
//! One duplex WebSocket per session: the config message first, then binary
//! audio frames in strict production order, then the `END` sentinel before a
//! graceful close. Inbound text messages are provider-tagged JSON events,
//! forwarded in arrival order on a channel.
//!
//! The channel tracks its own open state: a send attempted after close is
//! dropped quietly instead of surfacing as a fault, and an unexpected close
//! is reported exactly once through the event channel.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::protocol::{ServerEvent, SessionConfig, END_SENTINEL};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the transport delivered from the server side.
#[derive(Debug)]
pub enum TransportEvent {
    /// A provider-tagged transcript or error event.
    Server(ServerEvent),
    /// The channel closed. `clean` is false for unexpected closures, which
    /// must tear the session down.
    Closed { clean: bool },
}

/// Duplex channel seam; the controller is written against this so tests can
/// substitute an in-memory transport.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Send the one-time configuration message. Must be the first send.
    async fn send_config(&mut self, config: &SessionConfig) -> Result<(), SessionError>;

    /// Send one binary audio frame. Dropped (not an error) after close.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SessionError>;

    /// Send the end-of-stream sentinel once; later calls are no-ops.
    async fn send_end(&mut self);

    /// Close the channel. Idempotent.
    async fn close(&mut self);

    /// Take the inbound event channel. Yields `None` after taken once.
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Production transport over tokio-tungstenite.
pub struct WsTransport {
    write: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    events: Option<mpsc::Receiver<TransportEvent>>,
    open: Arc<AtomicBool>,
    sent_end: bool,
    reader_task: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connect and start the inbound reader. No message is sent yet; the
    /// caller must send the config message before any frame.
    pub async fn connect(url: &str) -> Result<Self, SessionError> {
        info!("connecting transport to {}", url);

        let (stream, _response) = timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| SessionError::Transport("connection timeout".into()))?
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let (write, mut read) = stream.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let open = Arc::new(AtomicBool::new(true));
        let reader_open = Arc::clone(&open);

        let reader_task = tokio::spawn(async move {
            let clean = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if event_tx.send(TransportEvent::Server(event)).await.is_err() {
                                    break true;
                                }
                            }
                            Err(e) => warn!("unparseable server event: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) => break !reader_open.load(Ordering::SeqCst),
                    Some(Ok(_)) => {} // ping/pong/binary ignored
                    Some(Err(e)) => {
                        warn!("transport read error: {}", e);
                        break false;
                    }
                    None => break !reader_open.load(Ordering::SeqCst),
                }
            };
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(TransportEvent::Closed { clean }).await;
        });

        Ok(Self {
            write,
            events: Some(event_rx),
            open,
            sent_end: false,
            reader_task,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send_config(&mut self, config: &SessionConfig) -> Result<(), SessionError> {
        let msg = crate::protocol::ClientMessage::Config {
            config: config.clone(),
        };
        let json = serde_json::to_string(&msg)
            .map_err(|e| SessionError::Transport(format!("config serialization: {e}")))?;
        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::Transport(format!("config send failed: {e}")))
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SessionError> {
        if !self.is_open() {
            debug!("dropping frame: transport closed");
            return Ok(());
        }
        if let Err(e) = self.write.send(Message::Binary(frame)).await {
            // The reader reports the closure; sends just stop.
            debug!("frame send failed, treating transport as closed: {}", e);
            self.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn send_end(&mut self) {
        if self.sent_end || !self.is_open() {
            return;
        }
        self.sent_end = true;
        if let Err(e) = self
            .write
            .send(Message::Text(END_SENTINEL.to_string()))
            .await
        {
            debug!("end sentinel send failed: {}", e);
        }
    }

    async fn close(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.write.close().await {
                debug!("transport close: {}", e);
            }
            info!("transport closed");
        }
        self.reader_task.abort();
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
