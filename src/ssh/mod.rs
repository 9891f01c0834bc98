//! SSH transport: connect, authenticate, and drive an interactive shell.

mod client;
mod error;
mod shell;

pub use client::{connect, RelayHandler};
pub use error::SshError;
pub use shell::{open_shell, ShellCommand, ShellHandle};
