//! Per-tab relay session
//!
//! One session owns one websocket and exactly one pooled channel. After the
//! `connected` frame, two pumps run until either side ends: socket to channel
//! (keystrokes, resizes) and channel to socket (shell output), joined by a
//! consolidated frame-sender task so output, errors, and the close frame
//! leave in order.
//!
//! State machine: `Connecting -> Authenticating -> Active <-> Backpressured
//! -> Closing -> Closed`, with a direct `Connecting -> Closed` edge when
//! validation fails before any channel work.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::protocol::{decode_client_frame, ClientFrame, ServerFrame};
use super::{Gateway, GatewayError};
use crate::auth::CallerIdentity;
use crate::directory::ResourceRecord;
use crate::pool::{PoolError, PooledChannel};
use crate::vault::VaultError;

/// Outgoing frame capacity; filling it briefly backpressures the output pump.
const FRAME_CHANNEL_CAPACITY: usize = 4096;
/// Dead-client detection on sends.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters carried in the upgrade request query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub resource_id: i64,
    pub credential_id: i64,
    pub token: String,
}

impl SessionParams {
    /// Parse `resource_id=..&credential_id=..&token=..`. Anything missing or
    /// non-numeric closes the session before any channel work.
    pub fn from_query(query: &str) -> Result<Self, GatewayError> {
        let mut resource_id = None;
        let mut credential_id = None;
        let mut token = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "resource_id" => resource_id = value.parse::<i64>().ok(),
                "credential_id" => credential_id = value.parse::<i64>().ok(),
                "token" => token = (!value.is_empty()).then(|| value.to_string()),
                _ => {}
            }
        }

        match (resource_id, credential_id, token) {
            (Some(resource_id), Some(credential_id), Some(token)) => Ok(Self {
                resource_id,
                credential_id,
                token,
            }),
            (None, _, _) => Err(GatewayError::ParameterInvalid(
                "missing or invalid resource_id".to_string(),
            )),
            (_, None, _) => Err(GatewayError::ParameterInvalid(
                "missing or invalid credential_id".to_string(),
            )),
            (_, _, None) => Err(GatewayError::ParameterInvalid(
                "missing token".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Authenticating = 1,
    Active = 2,
    Backpressured = 3,
    Closing = 4,
    Closed = 5,
}

/// Shared state cell; transitions are logged, not acted upon - the pumps and
/// the select below drive the actual control flow.
struct StateCell {
    session_id: String,
    state: AtomicU8,
}

impl StateCell {
    fn new(session_id: String) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            state: AtomicU8::new(SessionState::Connecting as u8),
        })
    }

    fn set(&self, next: SessionState) {
        let prev = self.state.swap(next as u8, Ordering::SeqCst);
        if prev != next as u8 {
            debug!(session = %self.session_id, from = prev, to = next as u8, "session state");
        }
    }
}

/// Why the pump phase ended.
enum SessionEnd {
    ClientClosed,
    ShellClosed,
    ChannelBroken(String),
    Protocol(String),
    SocketError(String),
}

enum Outbound {
    Frame(ServerFrame),
    Close(Option<CloseFrame<'static>>),
}

/// Run one relay session to completion. The websocket is already upgraded;
/// the params are already parsed.
pub async fn run_session<S>(gateway: Arc<Gateway>, ws: WebSocketStream<S>, params: SessionParams)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = uuid::Uuid::new_v4().to_string();
    let state = StateCell::new(session_id.clone());
    state.set(SessionState::Authenticating);

    let (caller, resource, channel) = match establish(&gateway, &params).await {
        Ok(bound) => bound,
        Err(e) => {
            warn!(session = %session_id, error = %e, "session establishment failed");
            state.set(SessionState::Closed);
            reject(ws, e.to_string(), close_code_for(&e)).await;
            return;
        }
    };

    info!(
        session = %session_id,
        caller = %caller.username,
        resource = resource.id,
        channel = channel.handle().id(),
        "session active"
    );
    state.set(SessionState::Active);

    let shell = channel.handle().clone();
    let mut output_rx = shell.subscribe_output();
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let (frame_tx, mut frame_rx) = mpsc::channel::<Outbound>(FRAME_CHANNEL_CAPACITY);

    // Task: frame sender - consolidates all outgoing traffic so ordering is
    // a property of the queue, not of task scheduling.
    let sender_task = tokio::spawn(async move {
        while let Some(outbound) = frame_rx.recv().await {
            let message = match outbound {
                Outbound::Frame(frame) => Message::Text(frame.encode()),
                Outbound::Close(frame) => {
                    let _ = ws_sender.send(Message::Close(frame)).await;
                    break;
                }
            };
            match tokio::time::timeout(SEND_TIMEOUT, ws_sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("websocket send failed: {e}");
                    break;
                }
                Err(_) => {
                    warn!("websocket send timeout - client unresponsive, disconnecting");
                    break;
                }
            }
        }
        debug!("frame sender stopped");
    });

    let banner = format!(
        "Connected to {} as {}",
        resource.name, caller.username
    );
    if frame_tx
        .send(Outbound::Frame(ServerFrame::Connected { message: banner }))
        .await
        .is_err()
    {
        state.set(SessionState::Closed);
        gateway.pool.release(channel).await;
        return;
    }

    // Task: channel -> socket. Bytes leave in the exact order the shell
    // produced them; a full queue briefly backpressures, never reorders.
    let out_tx = frame_tx.clone();
    let out_state = state.clone();
    let mut output_task = tokio::spawn(async move {
        loop {
            match output_rx.recv().await {
                Ok(bytes) => {
                    let frame = ServerFrame::Output {
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    };
                    match out_tx.try_send(Outbound::Frame(frame)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(frame)) => {
                            out_state.set(SessionState::Backpressured);
                            if out_tx.send(frame).await.is_err() {
                                return SessionEnd::SocketError("sender gone".to_string());
                            }
                            out_state.set(SessionState::Active);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            return SessionEnd::SocketError("sender gone".to_string());
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return SessionEnd::ShellClosed;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // Skipping output would silently corrupt the byte stream.
                    return SessionEnd::ChannelBroken(format!("output lagged by {n} chunks"));
                }
            }
        }
    });

    // Task: socket -> channel. Input and resize share the shell's command
    // queue, so keystroke order is preserved end to end.
    let input_shell = shell.clone();
    let mut input_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => return SessionEnd::Protocol("non-UTF-8 frame".to_string()),
                },
                Ok(Message::Close(_)) => return SessionEnd::ClientClosed,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return SessionEnd::SocketError(e.to_string()),
            };

            match decode_client_frame(&text) {
                Ok(ClientFrame::Input { data }) => {
                    if input_shell.send(data.into_bytes()).await.is_err() {
                        return SessionEnd::ChannelBroken("shell input closed".to_string());
                    }
                }
                Ok(ClientFrame::Resize { rows, cols }) => {
                    if input_shell.resize(rows, cols).await.is_err() {
                        return SessionEnd::ChannelBroken("shell input closed".to_string());
                    }
                }
                Err(e) => return SessionEnd::Protocol(e.to_string()),
            }
        }
        SessionEnd::ClientClosed
    });

    let end = tokio::select! {
        end = &mut output_task => {
            input_task.abort();
            end.unwrap_or(SessionEnd::ShellClosed)
        }
        end = &mut input_task => {
            output_task.abort();
            end.unwrap_or(SessionEnd::ClientClosed)
        }
    };
    // Closing the session cancels the surviving pump; other sessions on the
    // same key are untouched.
    state.set(SessionState::Closing);

    match end {
        SessionEnd::ClientClosed => {
            info!(session = %session_id, "client closed, releasing channel");
            gateway.pool.release(channel).await;
            let _ = frame_tx
                .send(Outbound::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })))
                .await;
        }
        SessionEnd::ShellClosed => {
            info!(session = %session_id, "shell channel ended");
            gateway.pool.invalidate(channel).await;
            send_error_and_close(
                &frame_tx,
                "shell channel closed".to_string(),
                CloseCode::Error,
            )
            .await;
        }
        SessionEnd::ChannelBroken(reason) => {
            warn!(session = %session_id, %reason, "channel broken");
            gateway.pool.invalidate(channel).await;
            send_error_and_close(&frame_tx, reason, CloseCode::Error).await;
        }
        SessionEnd::Protocol(reason) => {
            // The channel itself is healthy; only this client misbehaved.
            warn!(session = %session_id, %reason, "protocol violation");
            gateway.pool.release(channel).await;
            send_error_and_close(&frame_tx, reason, CloseCode::Policy).await;
        }
        SessionEnd::SocketError(reason) => {
            debug!(session = %session_id, %reason, "socket error");
            gateway.pool.release(channel).await;
        }
    }

    drop(frame_tx);
    let _ = tokio::time::timeout(SEND_TIMEOUT, sender_task).await;
    state.set(SessionState::Closed);
    info!(session = %session_id, "session closed");
}

async fn send_error_and_close(
    frame_tx: &mpsc::Sender<Outbound>,
    message: String,
    code: CloseCode,
) {
    let _ = frame_tx
        .send(Outbound::Frame(ServerFrame::Error { message }))
        .await;
    let _ = frame_tx
        .send(Outbound::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

/// Refuse a session before any channel work: one structured error frame,
/// then a non-normal close.
pub(crate) async fn reject<S>(mut ws: WebSocketStream<S>, message: String, code: CloseCode)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = ServerFrame::Error {
        message: message.clone(),
    };
    let _ = ws.send(Message::Text(frame.encode())).await;
    let _ = ws
        .close(Some(CloseFrame {
            code,
            reason: "".into(),
        }))
        .await;
    info!(%message, "session rejected");
}

/// Validate the caller, resolve the target, and bind the one channel this
/// session will ever own.
async fn establish(
    gateway: &Gateway,
    params: &SessionParams,
) -> Result<(CallerIdentity, ResourceRecord, PooledChannel), GatewayError> {
    let caller = gateway.authenticator.authenticate(&params.token).await?;
    let resource = gateway.directory.lookup(params.resource_id).await?;
    let channel = gateway
        .pool
        .acquire(&resource, params.credential_id, &caller)
        .await?;
    Ok((caller, resource, channel))
}

/// Auth and authorization failures use the policy-violation code, which the
/// client-side controller treats as terminal. Retryable and internal
/// failures use the generic error code.
fn close_code_for(err: &GatewayError) -> CloseCode {
    match err {
        GatewayError::ParameterInvalid(_)
        | GatewayError::Auth(_)
        | GatewayError::Directory(_) => CloseCode::Policy,
        GatewayError::Pool(pool_err) => close_code_for_pool(pool_err),
    }
}

fn close_code_for_pool(err: &PoolError) -> CloseCode {
    match err {
        PoolError::AuthFailed(_) => CloseCode::Policy,
        PoolError::Vault(VaultError::Forbidden)
        | PoolError::Vault(VaultError::NotFound(_))
        | PoolError::Vault(VaultError::Disabled(_)) => CloseCode::Policy,
        _ => CloseCode::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_accepts_complete_params() {
        let params =
            SessionParams::from_query("resource_id=3&credential_id=9&token=abc123").unwrap();
        assert_eq!(
            params,
            SessionParams {
                resource_id: 3,
                credential_id: 9,
                token: "abc123".to_string(),
            }
        );
    }

    #[test]
    fn query_parsing_rejects_missing_or_invalid_params() {
        for query in [
            "",
            "credential_id=9&token=abc",
            "resource_id=3&token=abc",
            "resource_id=3&credential_id=9",
            "resource_id=x&credential_id=9&token=abc",
            "resource_id=3&credential_id=9&token=",
        ] {
            assert!(
                matches!(
                    SessionParams::from_query(query),
                    Err(GatewayError::ParameterInvalid(_))
                ),
                "query {query:?} should be rejected"
            );
        }
    }

    #[test]
    fn unknown_query_params_are_ignored() {
        let params = SessionParams::from_query(
            "resource_id=1&credential_id=2&token=t&theme=dark",
        )
        .unwrap();
        assert_eq!(params.resource_id, 1);
    }

    #[test]
    fn establishment_failures_map_to_close_codes() {
        assert_eq!(
            close_code_for(&GatewayError::ParameterInvalid("missing token".to_string())),
            CloseCode::Policy
        );
        assert_eq!(
            close_code_for(&GatewayError::Auth(crate::auth::AuthError::InvalidToken)),
            CloseCode::Policy
        );
        assert_eq!(
            close_code_for_pool(&PoolError::AuthFailed("no".to_string())),
            CloseCode::Policy
        );
        assert_eq!(
            close_code_for_pool(&PoolError::Vault(VaultError::Forbidden)),
            CloseCode::Policy
        );
        assert_eq!(
            close_code_for_pool(&PoolError::ConnectTimeout),
            CloseCode::Error
        );
        assert_eq!(
            close_code_for_pool(&PoolError::Vault(VaultError::Decryption(1))),
            CloseCode::Error
        );
    }
}
