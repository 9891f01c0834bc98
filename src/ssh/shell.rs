//! Interactive shell channel
//!
//! One task owns the authenticated SSH `Handle` and its PTY channel; everyone
//! else talks to it through a cloneable [`ShellHandle`]. This keeps the
//! russh handle out of locks and makes "who may write to the shell" a matter
//! of who holds the handle.
//!
//! Output goes through a broadcast channel so a later gateway session can
//! reattach to a pooled shell without reopening it - the shell, and its
//! working directory, survive between tabs.

use bytes::Bytes;
use russh::client::Handle;
use russh::ChannelMsg;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::client::RelayHandler;
use super::error::SshError;

const CMD_CHANNEL_CAPACITY: usize = 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Commands accepted by the shell owner task.
#[derive(Debug)]
pub enum ShellCommand {
    /// Bytes for the shell's stdin.
    Data(Vec<u8>),
    /// Resize the PTY.
    Resize { rows: u16, cols: u16 },
    /// Liveness probe: SSH keepalive with want_reply, bounded by a timeout.
    Probe { reply_tx: oneshot::Sender<bool> },
    /// Close the channel and disconnect.
    Close,
}

/// Cloneable handle to a running shell channel.
#[derive(Clone, Debug)]
pub struct ShellHandle {
    id: String,
    cmd_tx: mpsc::Sender<ShellCommand>,
    output_tx: broadcast::Sender<Bytes>,
}

impl ShellHandle {
    /// Assemble a handle from raw channels. Production code goes through
    /// [`open_shell`]; this exists for fakes in tests.
    pub fn from_parts(
        id: String,
        cmd_tx: mpsc::Sender<ShellCommand>,
        output_tx: broadcast::Sender<Bytes>,
    ) -> Self {
        Self {
            id,
            cmd_tx,
            output_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe to shell output from this point on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    /// Forward input bytes to the shell, in order.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), SshError> {
        self.cmd_tx
            .send(ShellCommand::Data(data))
            .await
            .map_err(|_| SshError::Disconnected)
    }

    /// Apply new PTY dimensions. Never interrupts in-flight output.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SshError> {
        self.cmd_tx
            .send(ShellCommand::Resize { rows, cols })
            .await
            .map_err(|_| SshError::Disconnected)
    }

    /// Cheap channel-alive probe. `false` means the channel should be
    /// evicted, not that the caller saw an error.
    pub async fn probe(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ShellCommand::Probe { reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ShellCommand::Close).await;
    }

    /// Whether the owner task is still running.
    pub fn is_open(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Request a PTY + shell on an authenticated connection and spawn the owner
/// task. Consumes the `Handle`; the returned [`ShellHandle`] is the only way
/// to reach the channel afterwards.
pub async fn open_shell(
    handle: Handle<RelayHandler>,
    cols: u16,
    rows: u16,
) -> Result<ShellHandle, SshError> {
    let channel_id = uuid::Uuid::new_v4().to_string();

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SshError::ChannelError(e.to_string()))?;

    debug!("Channel opened for shell {}, requesting PTY", channel_id);

    channel
        .request_pty(false, "xterm-256color", cols as u32, rows as u32, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {e}")))?;

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("shell request failed: {e}")))?;

    info!("Interactive shell {} started", channel_id);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(CMD_CHANNEL_CAPACITY);
    let (output_tx, _) = broadcast::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);

    let output_tx_task = output_tx.clone();
    let sid = channel_id.clone();
    tokio::spawn(async move {
        let mut handle = handle;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to shell {}: {}", sid, e);
                                break;
                            }
                        }
                        Some(ShellCommand::Resize { rows, cols }) => {
                            if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                                // A failed resize is not fatal to the session
                                warn!("Failed to resize PTY for shell {}: {}", sid, e);
                            } else {
                                debug!("PTY resized to {}x{} for shell {}", cols, rows, sid);
                            }
                        }
                        Some(ShellCommand::Probe { reply_tx }) => {
                            let alive = matches!(
                                tokio::time::timeout(PROBE_TIMEOUT, handle.send_keepalive(true)).await,
                                Ok(Ok(()))
                            );
                            let _ = reply_tx.send(alive);
                        }
                        Some(ShellCommand::Close) | None => {
                            info!("Close requested for shell {}", sid);
                            let _ = channel.eof().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            // No subscribers is fine; the pool may hold an
                            // idle shell with no session attached.
                            let _ = output_tx_task.send(Bytes::from(data.to_vec()));
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                            let _ = output_tx_task.send(Bytes::from(data.to_vec()));
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            info!("Shell channel {} closed by remote", sid);
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Shell {} exit status {}", sid, exit_status);
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await;
        info!("Shell owner task terminated for {}", sid);
    });

    Ok(ShellHandle {
        id: channel_id,
        cmd_tx,
        output_tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake owner task: echoes stdin to the output broadcast, answers probes.
    fn spawn_echo_shell() -> ShellHandle {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(64);
        let (output_tx, _) = broadcast::channel::<Bytes>(64);
        let output = output_tx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ShellCommand::Data(data) => {
                        let _ = output.send(Bytes::from(data));
                    }
                    ShellCommand::Probe { reply_tx } => {
                        let _ = reply_tx.send(true);
                    }
                    ShellCommand::Resize { .. } => {}
                    ShellCommand::Close => break,
                }
            }
        });
        ShellHandle::from_parts("echo".to_string(), cmd_tx, output_tx)
    }

    #[tokio::test]
    async fn input_reaches_subscribers_in_order() {
        let shell = spawn_echo_shell();
        let mut output = shell.subscribe_output();

        shell.send(b"ls\n".to_vec()).await.unwrap();
        shell.send(vec![0x1b, b'[', b'A']).await.unwrap();

        assert_eq!(output.recv().await.unwrap(), Bytes::from_static(b"ls\n"));
        assert_eq!(
            output.recv().await.unwrap(),
            Bytes::from_static(&[0x1b, b'[', b'A'])
        );
    }

    #[tokio::test]
    async fn probe_and_close_lifecycle() {
        let shell = spawn_echo_shell();
        assert!(shell.probe().await);
        assert!(shell.is_open());

        shell.close().await;
        // Owner task drops the receiver; further sends fail.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!shell.is_open());
        assert!(!shell.probe().await);
        assert!(matches!(
            shell.send(b"x".to_vec()).await,
            Err(SshError::Disconnected)
        ));
    }
}
