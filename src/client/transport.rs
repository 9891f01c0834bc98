//! Terminal transport
//!
//! The client half of the gateway protocol. One transport owns one persistent
//! socket for one terminal; `ensure_open` is idempotent and guarded against
//! the duplicate-open churn a UI can produce when it remounts. Input is
//! forwarded immediately, output surfaces in arrival order, and an abnormal
//! close hands the decision to the [`ReconnectController`].
//!
//! There is no polling fallback for a shell; when the controller gives up the
//! transport surfaces [`TerminalEvent::GaveUp`] and waits for the user's
//! explicit [`TerminalTransport::reconnect`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::reconnect::{CloseKind, ReconnectController, ReconnectDecision, ReconnectPolicy};
use crate::gateway::protocol::{decode_server_frame, ClientFrame, ServerFrame};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where a terminal connects, and as whom.
#[derive(Debug, Clone)]
pub struct TerminalEndpoint {
    /// e.g. `ws://relay.internal:8022`
    pub base_url: String,
    pub resource_id: i64,
    pub credential_id: i64,
    pub token: String,
}

impl TerminalEndpoint {
    pub fn url(&self) -> String {
        format!(
            "{}/terminal?resource_id={}&credential_id={}&token={}",
            self.base_url.trim_end_matches('/'),
            self.resource_id,
            self.credential_id,
            self.token
        )
    }
}

/// What the rendering layer consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Connected { banner: String },
    /// Shell bytes, in arrival order.
    Output { data: String },
    /// Fatal, session-ending; render as an inline banner.
    Error { message: String },
    /// An automatic retry is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted or close was terminal; waiting for manual reconnect.
    GaveUp,
    /// Clean end (user disconnect or server normal close).
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    Connect(String),
}

pub struct TerminalTransport {
    endpoint: TerminalEndpoint,
    controller: ReconnectController,
    writer: Mutex<Option<WsSink>>,
    events_tx: mpsc::Sender<TerminalEvent>,
    events_rx: Mutex<mpsc::Receiver<TerminalEvent>>,
    connected: AtomicBool,
    /// Re-entrancy guard: only one open may be in flight.
    opening: AtomicBool,
    user_closed: AtomicBool,
    last_size: parking_lot::Mutex<Option<(u16, u16)>>,
}

impl TerminalTransport {
    pub fn new(endpoint: TerminalEndpoint, policy: ReconnectPolicy) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            endpoint,
            controller: ReconnectController::new(policy),
            writer: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            connected: AtomicBool::new(false),
            opening: AtomicBool::new(false),
            user_closed: AtomicBool::new(false),
            last_size: parking_lot::Mutex::new(None),
        })
    }

    /// Open the socket if it is not open already. Safe to call from mount
    /// churn: a second call while connected or mid-open is a no-op.
    pub async fn ensure_open(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self
            .opening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.open_socket().await;
        self.opening.store(false, Ordering::SeqCst);
        result
    }

    /// Manual reconnect after `gave-up`: resets the controller and opens.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), TransportError> {
        self.user_closed.store(false, Ordering::SeqCst);
        self.controller.reset();
        self.ensure_open().await
    }

    /// Forward keystrokes immediately; no buffering or coalescing.
    pub async fn send_input(&self, data: &str) -> Result<(), TransportError> {
        let frame = ClientFrame::Input {
            data: data.to_string(),
        };
        self.send_frame(frame).await
    }

    /// Send new viewport dimensions. Unchanged dimensions are skipped; the
    /// UI may call this on every layout pass.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), TransportError> {
        if !self.note_size(rows, cols) {
            return Ok(());
        }
        self.send_frame(ClientFrame::Resize { rows, cols }).await
    }

    /// Next event for the renderer, in arrival order.
    pub async fn next_event(&self) -> Option<TerminalEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Explicit user disconnect: clean close, no retry.
    pub async fn close(&self) {
        self.user_closed.store(true, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn gave_up(&self) -> bool {
        self.controller.gave_up()
    }

    /// Record the size; true when it changed and must be sent.
    fn note_size(&self, rows: u16, cols: u16) -> bool {
        let mut last = self.last_size.lock();
        if *last == Some((rows, cols)) {
            return false;
        }
        *last = Some((rows, cols));
        true
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(frame.encode()))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    fn open_socket(
        self: &Arc<Self>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + '_>,
    > {
        let this = self.clone();
        Box::pin(async move {
            let url = this.endpoint.url();
            debug!(resource = this.endpoint.resource_id, "opening terminal socket");

            let (ws, _) = connect_async(&url)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let (sink, stream) = ws.split();
            *this.writer.lock().await = Some(sink);
            this.connected.store(true, Ordering::SeqCst);
            this.controller.on_connected();

            let transport = this.clone();
            tokio::spawn(async move {
                transport.read_loop(stream).await;
            });

            Ok(())
        })
    }

    async fn read_loop(
        self: Arc<Self>,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ) {
        let mut close_kind = CloseKind::Abnormal;

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match decode_server_frame(&text) {
                    Ok(ServerFrame::Connected { message }) => {
                        info!("terminal connected: {message}");
                        self.emit(TerminalEvent::Connected { banner: message }).await;
                        // Re-sync the PTY with the current viewport; the
                        // pooled shell may carry another tab's dimensions.
                        let size = *self.last_size.lock();
                        if let Some((rows, cols)) = size {
                            let _ = self.send_frame(ClientFrame::Resize { rows, cols }).await;
                        }
                    }
                    Ok(ServerFrame::Output { data }) => {
                        self.emit(TerminalEvent::Output { data }).await;
                    }
                    Ok(ServerFrame::Error { message }) => {
                        warn!("terminal error frame: {message}");
                        self.emit(TerminalEvent::Error { message }).await;
                    }
                    Err(e) => {
                        warn!("dropping malformed server frame: {e}");
                    }
                },
                Ok(Message::Close(frame)) => {
                    close_kind =
                        CloseKind::from_close_code(frame.map(|f| u16::from(f.code)));
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("terminal socket error: {e}");
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().await = None;

        if self.user_closed.load(Ordering::SeqCst) {
            self.emit(TerminalEvent::Closed).await;
            return;
        }

        match self.controller.on_close(close_kind) {
            ReconnectDecision::Stop => self.emit(TerminalEvent::Closed).await,
            ReconnectDecision::GiveUp => self.emit(TerminalEvent::GaveUp).await,
            ReconnectDecision::RetryAfter(delay) => {
                self.emit(TerminalEvent::Reconnecting {
                    attempt: self.controller.attempts(),
                    delay,
                })
                .await;
                let transport = self.clone();
                tokio::spawn(async move {
                    transport.retry_after(delay).await;
                });
            }
        }
    }

    async fn retry_after(self: Arc<Self>, mut delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;
            if self.user_closed.load(Ordering::SeqCst) {
                return;
            }
            match self.open_socket().await {
                Ok(()) => return,
                Err(e) => {
                    debug!("reconnect attempt failed: {e}");
                    match self.controller.on_close(CloseKind::Abnormal) {
                        ReconnectDecision::RetryAfter(next) => {
                            self.emit(TerminalEvent::Reconnecting {
                                attempt: self.controller.attempts(),
                                delay: next,
                            })
                            .await;
                            delay = next;
                        }
                        _ => {
                            self.emit(TerminalEvent::GaveUp).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn emit(&self, event: TerminalEvent) {
        let _ = self.events_tx.send(event).await;
    }
}
