//! Stateful socket gateway between browser terminals and pooled channels.

pub mod protocol;
mod server;
mod session;

use std::sync::Arc;

use crate::auth::{AuthError, Authenticator};
use crate::directory::{DirectoryError, ResourceDirectory};
use crate::pool::{ChannelPool, PoolError};

pub use server::GatewayServer;
pub use session::{run_session, SessionParams, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing/invalid upgrade parameters; fatal before any channel work.
    #[error("invalid parameters: {0}")]
    ParameterInvalid(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Shared collaborators of every session; owned once, passed by handle.
pub struct Gateway {
    pub pool: Arc<ChannelPool>,
    pub directory: Arc<dyn ResourceDirectory>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Gateway {
    pub fn new(
        pool: Arc<ChannelPool>,
        directory: Arc<dyn ResourceDirectory>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            pool,
            directory,
            authenticator,
        }
    }
}
