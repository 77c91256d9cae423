//! # Karton - Real-time RPC and State Replication
//!
//! A bidirectional RPC and state replication framework for Rust servers and
//! clients connected over WebSockets.
//!
//! A [`KartonServer`] owns one canonical state value and a tree of procedures.
//! Every accepted connection becomes a session that can call the server's
//! procedures, be called back by the server, and receives a full state sync
//! followed by minimal patches for every mutation. A [`KartonClient`] keeps a
//! replica of that state and reconnects on its own when the connection drops.

pub mod client;
pub mod config;
pub mod error;
pub mod procedures;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod state;
pub mod transport;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use client::{Connector, KartonClient, KartonClientBuilder};
pub use config::{KartonClientConfig, KartonServerConfig};
pub use error::{KartonError, KartonResult};
pub use procedures::{procedure, ProcedureTree, RemoteProcedures};
pub use protocol::{ErrorObject, Message, PatchOperation, PathSegment, Value};
pub use rpc::{CallOptions, RpcManager};
pub use server::{ClientSession, KartonServer};
pub use state::{ClientStateManager, StateManager};
pub use transport::{ConnectionState, Transport};

#[cfg(feature = "client")]
pub use client::WebSocketConnector;

#[cfg(feature = "axum")]
pub use axum::{router, WebSocketHandler};
