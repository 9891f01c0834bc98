//! Standalone relay binary: inventory-file directory, static-token auth,
//! and the websocket gateway in front of the pool.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use shellgate::audit::TracingAccessLog;
use shellgate::auth::{CallerIdentity, PermitAll, StaticTokenAuthenticator};
use shellgate::config::{Inventory, RelayConfig};
use shellgate::directory::StaticDirectory;
use shellgate::pool::SshOpener;
use shellgate::vault::StaticCredentialStore;
use shellgate::{ChannelPool, Gateway, GatewayServer, Vault};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellgate=info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("shellgate: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => RelayConfig::load(&PathBuf::from(path))?,
        None => RelayConfig::default(),
    };

    let master_key = config.master_key()?;
    let token = config.auth_token()?;

    let inventory = match &config.inventory_path {
        Some(path) => Inventory::load(path)?,
        None => Inventory::default(),
    };
    info!(
        resources = inventory.resources.len(),
        credentials = inventory.credentials.len(),
        "inventory loaded"
    );

    let directory = Arc::new(StaticDirectory::new(inventory.resources));
    let store = Arc::new(StaticCredentialStore::new(inventory.credentials));

    let vault = Arc::new(Vault::new(
        master_key,
        store,
        Arc::new(PermitAll),
        Arc::new(TracingAccessLog),
    ));

    let pool_config = config.pool_config();
    let opener = Arc::new(SshOpener::new(pool_config.connect_timeout));
    let pool = ChannelPool::new(vault, opener, pool_config);

    let authenticator = Arc::new(StaticTokenAuthenticator::new(
        token,
        CallerIdentity {
            user_id: 0,
            username: "operator".to_string(),
        },
    ));

    let server = GatewayServer::new(Gateway::new(pool, directory, authenticator));
    server.serve(&config.bind_addr).await?;
    Ok(())
}
