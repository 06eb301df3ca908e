//! WebSocket client channel
//!
//! Connects to the relay and splits the stream into a writer task fed by an
//! unbounded queue and a reader task that dispatches parsed frames to subscribers.

use super::channel::{Channel, HandlerRegistry, MessageHandler};
use super::ChannelError;
use crate::webrtc::signaling::{ClientMessage, EventName, ServerMessage};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Named-event channel over a tokio-tungstenite client connection
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    handlers: Arc<HandlerRegistry>,
    connected: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
}

impl WsChannel {
    /// Open a connection to `url` (`ws://` or `wss://`)
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChannelError::ConnectFailed(format!("{}: {}", url, e)))?;
        info!("Connected to signaling relay at {}", url);

        let (mut write, mut read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let handlers = Arc::new(HandlerRegistry::new());
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let frame = match item {
                    Outbound::Message(message) => match message.to_json() {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => {
                            error!("Failed to encode {}: {}", message.event(), e);
                            continue;
                        }
                    },
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = write.send(frame).await {
                    warn!("Signaling send failed: {}", e);
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        let reader_handlers = handlers.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(text.as_str()) {
                        Ok(message) => {
                            reader_handlers.dispatch(message);
                        }
                        Err(e) => warn!("Dropping malformed frame: {}", e),
                    },
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring binary frame of {} bytes", data.len());
                    }
                    Ok(Message::Close(_)) => {
                        info!("Signaling relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling connection error: {}", e);
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            outbound,
            handlers,
            connected,
            writer: Mutex::new(Some(writer)),
            reader,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flush queued frames, send a close frame and wait up to `grace` for the writer
    pub async fn close(&self, grace: Duration) {
        let _ = self.outbound.send(Outbound::Close);
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if tokio::time::timeout(grace, writer).await.is_err() {
                debug!("Signaling writer did not finish within {:?}", grace);
            }
        }
        self.reader.abort();
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Channel for WsChannel {
    fn send(&self, message: ClientMessage) {
        if self.outbound.send(Outbound::Message(message)).is_err() {
            debug!("Signaling connection closed, dropping outbound message");
        }
    }

    fn subscribe(&self, event: EventName, handler: MessageHandler) {
        self.handlers.subscribe(event, handler);
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
