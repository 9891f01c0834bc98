//! Shellgate - browser-to-SSH terminal relay
//!
//! The relay lets an operator open a live interactive shell on a remote host
//! from a browser tab. The browser speaks a small JSON frame protocol over a
//! persistent websocket; the backend holds the SSH connection, the decrypted
//! credentials, and the pool of warm shell channels. The browser never sees a
//! secret and never has a direct network route to the host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   gateway frames   ┌──────────────┐  acquire/release  ┌──────────────┐
//! │ Terminal │ ◄────websocket───► │ SocketGateway│ ◄───────────────► │ ChannelPool  │
//! │ Transport│                    │ (per tab)    │                   │ (per key)    │
//! └──────────┘                    └──────────────┘                   └──────┬───────┘
//!       ▲                                                          decrypt  │  ssh
//!       │ ReconnectController                                               ▼
//!       └── also drives the metrics client                          ┌──────────────┐
//!                                                                   │ Vault + russh│
//!                                                                   └──────────────┘
//! ```
//!
//! Record CRUD, metrics storage, audit persistence, and user management are
//! external collaborators reached through the traits in [`auth`], [`audit`],
//! [`directory`], and [`vault`].

pub mod audit;
pub mod auth;
pub mod client;
pub mod config;
pub mod directory;
pub mod gateway;
pub mod pool;
pub mod ssh;
pub mod vault;

pub use config::RelayConfig;
pub use gateway::{Gateway, GatewayServer};
pub use pool::{ChannelPool, PoolError};
pub use vault::{Vault, VaultError};
