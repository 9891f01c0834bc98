//! SSH error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("connection timed out")]
    ConnectTimeout,

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("key error: {0}")]
    KeyError(String),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
