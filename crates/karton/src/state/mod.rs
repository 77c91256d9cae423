//! State replication: one canonical value on the server, one replica per client.

pub mod client;
pub mod diff;
pub mod server;

pub use client::ClientStateManager;
pub use diff::{apply_patch, diff};
pub use server::StateManager;
