//! # fixgw-server
//!
//! Netfix TCP server and client for the fixgw gateway, on the tokio runtime.
//!
//! - [`NetfixServer`] serves the netfix line protocol over an [`ItemStore`]
//! - [`NetfixClient`] talks to a remote netfix server
//! - [`EchoGuard`] is shared with replication to stop values bouncing
//!   between peers
//! - [`spawn_sweeper`] runs the periodic staleness sweep

mod client;
mod connection;
mod echo;
mod error;
mod server;
mod shutdown;
mod status;
mod sweep;

pub use client::{NetfixClient, RemoteValue};
pub use echo::{EchoGuard, DEFAULT_BLOCK_TTL};
pub use error::{ClientError, ServerError};
pub use server::{NetfixServer, ServerConfig};
pub use shutdown::Shutdown;
pub use status::{
    ConnectionStats, ConnectionStatus, Performance, StatusCollector, StatusProvider, StatusReport,
};
pub use sweep::spawn_sweeper;

pub use fixgw_core::ItemStore;
