//! Embeddable Raft consensus engine.
//!
//! The engine owns leader election, log replication, snapshot transfer,
//! single-server membership changes and request auto-forwarding, and
//! talks to the host application only through the collaborator traits in
//! [`traits`] (`StateMachine`, `LogStore`, `StateManager`, `RpcClient`,
//! `RpcClientFactory`, `RpcListener`). [`server::RaftServer`] is the
//! entry point most consumers embed.

pub mod config;
pub mod election;
pub mod error;
pub mod log_entry;
pub mod membership;
pub mod message;
pub mod notification;
pub mod forwarding;
pub mod replication;
pub mod scheduler;
pub mod server;
pub mod snapshot;
pub mod snapshot_transfer;
pub mod srv_config;
pub mod state;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;

pub use error::{Error, Result};
pub use server::{CallbackEvent, RaftServer};
