//! SSH client connect + authenticate, built on russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info};

use super::error::SshError;
use crate::directory::ResourceRecord;
use crate::vault::{DecryptedSecret, SecretMaterial};

/// Open an authenticated SSH connection to a resource.
///
/// The secret is consumed here and nowhere else; once the handshake finishes
/// only the authenticated `Handle` survives.
pub async fn connect(
    resource: &ResourceRecord,
    secret: &DecryptedSecret,
    connect_timeout: Duration,
) -> Result<client::Handle<RelayHandler>, SshError> {
    let addr = resource.addr();

    info!("Connecting to SSH server at {}", addr);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SshError::Unreachable(format!("failed to resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| SshError::Unreachable(format!("no address found for {addr}")))?;

    // Transport-level keepalive backs up the pool's explicit liveness probe.
    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = RelayHandler;

    let mut handle = tokio::time::timeout(
        connect_timeout,
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::ConnectTimeout)?
    .map_err(|e| SshError::Unreachable(e.to_string()))?;

    debug!("SSH handshake completed with {}", addr);

    let authenticated = match &secret.material {
        SecretMaterial::Password(password) => handle
            .authenticate_password(&secret.username, password.as_str())
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        SecretMaterial::PrivateKey { pem, passphrase } => {
            let key = russh::keys::decode_secret_key(
                pem.as_str(),
                passphrase.as_ref().map(|p| p.as_str()),
            )
            .map_err(|e| SshError::KeyError(e.to_string()))?;

            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            handle
                .authenticate_publickey(&secret.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(
            "authentication rejected by server".to_string(),
        ));
    }

    info!("SSH authentication successful for {}@{}", secret.username, addr);

    Ok(handle)
}

/// Client handler for russh callbacks.
///
/// Hosts are records in the operator's own inventory reached from the
/// backend's network, so server keys are accepted without a known_hosts
/// lookup. Key pinning, if wanted, belongs on the resource record.
pub struct RelayHandler;

impl client::Handler for RelayHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
