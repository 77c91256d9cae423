//! Client side orchestration.
//!
//! A [`KartonClient`] owns one connection at a time. A supervisor task
//! builds a fresh transport and RPC manager for every connection attempt,
//! keeps the state replica fed from it and reconnects at a fixed interval
//! after the connection drops, until [`KartonClient::close`] is called or the
//! last client handle is dropped.

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::KartonClientConfig;
use crate::procedures::{Invoker, ProcedureTree, RemoteProcedures};
use crate::protocol::{Frame, Value};
use crate::rpc::{CallOptions, RpcManager};
use crate::state::ClientStateManager;
use crate::transport::Transport;
use crate::{KartonError, KartonResult};

#[cfg(feature = "client")]
pub mod websocket;

#[cfg(feature = "client")]
pub use websocket::WebSocketConnector;

pub type SocketSink = Pin<Box<dyn Sink<Frame, Error = KartonError> + Send>>;
pub type SocketStream = Pin<Box<dyn Stream<Item = KartonResult<Frame>> + Send>>;

/// Opens one outbound socket per call
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>>;
}

impl<F> Connector for F
where
    F: Fn() -> BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>> + Send + Sync + 'static,
{
    fn connect(&self) -> BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>> {
        self()
    }
}

type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct ClientInner {
    config: KartonClientConfig,
    procedures: ProcedureTree,
    state: Arc<ClientStateManager>,
    /// RPC manager of the current connection attempt
    current: Mutex<Option<RpcManager>>,
    connected_tx: watch::Sender<bool>,
    closing_tx: watch::Sender<bool>,
    on_connection_change: Option<ConnectionCallback>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn current(&self) -> Option<RpcManager> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_connected(&self, connected: bool) {
        let changed = self.connected_tx.send_replace(connected) != connected;
        if changed {
            if let Some(callback) = &self.on_connection_change {
                callback(connected);
            }
        }
    }
}

/// Configures and starts a [`KartonClient`]
pub struct KartonClientBuilder {
    connector: Arc<dyn Connector>,
    config: KartonClientConfig,
    procedures: ProcedureTree,
    fallback: Value,
    on_state_change: Option<Box<dyn Fn(&Value) + Send + Sync>>,
    on_connection_change: Option<ConnectionCallback>,
}

impl KartonClientBuilder {
    /// Set the client configuration
    pub fn config(mut self, config: KartonClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Procedures the server may call on this client
    pub fn procedures(mut self, procedures: ProcedureTree) -> Self {
        self.procedures = procedures;
        self
    }

    /// Replica value until the first sync arrives
    pub fn fallback_state(mut self, fallback: impl Into<Value>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Called with the new replica after every applied sync or patch
    pub fn on_state_change(mut self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Box::new(callback));
        self
    }

    /// Called with `true` when a connection opens and `false` when it drops
    pub fn on_connection_change(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_connection_change = Some(Arc::new(callback));
        self
    }

    /// Start the client. The first connection attempt begins immediately.
    pub fn build(self) -> KartonClient {
        let state = Arc::new(ClientStateManager::new(self.fallback));
        if let Some(callback) = self.on_state_change {
            state.on_change(callback);
        }

        let (connected_tx, _) = watch::channel(false);
        let (closing_tx, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            config: self.config,
            procedures: self.procedures,
            state,
            current: Mutex::new(None),
            connected_tx,
            closing_tx,
            on_connection_change: self.on_connection_change,
            supervisor: Mutex::new(None),
        });

        let supervisor = tokio::spawn(supervise(inner.clone(), self.connector));
        *inner.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        let close_on_drop = Arc::new(CloseOnDrop {
            inner: Arc::downgrade(&inner),
        });
        KartonClient {
            inner,
            _close_on_drop: close_on_drop,
        }
    }
}

/// Stops the supervisor once the last [`KartonClient`] handle is gone
struct CloseOnDrop {
    inner: Weak<ClientInner>,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if !inner.closing_tx.send_replace(true) {
                debug!("Last client handle dropped, closing");
            }
        }
    }
}

/// A connection to a karton server with a local state replica
#[derive(Clone)]
pub struct KartonClient {
    inner: Arc<ClientInner>,
    _close_on_drop: Arc<CloseOnDrop>,
}

impl KartonClient {
    /// Start configuring a client that opens its sockets through `connector`
    pub fn builder(connector: impl Connector) -> KartonClientBuilder {
        KartonClientBuilder {
            connector: Arc::new(connector),
            config: KartonClientConfig::default(),
            procedures: ProcedureTree::new(),
            fallback: Value::Undefined,
            on_state_change: None,
            on_connection_change: None,
        }
    }

    /// Current replica of the server state
    pub fn state(&self) -> Arc<Value> {
        self.inner.state.state()
    }

    /// True once the replica has received a full sync on the current connection
    pub fn is_synced(&self) -> bool {
        self.inner.state.is_synced()
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Wait until the client is connected or closed. Returns the connected flag.
    pub async fn wait_connected(&self) -> bool {
        let mut connected = self.inner.connected_tx.subscribe();
        let mut closing = self.inner.closing_tx.subscribe();
        tokio::select! {
            result = connected.wait_for(|connected| *connected) => result.is_ok(),
            _ = closing.wait_for(|closing| *closing) => false,
        }
    }

    /// Procedures exposed by the server.
    ///
    /// Calls made while reconnecting are queued on the pending connection and
    /// sent once it opens, subject to the call timeout.
    pub fn server(&self) -> RemoteProcedures {
        RemoteProcedures::new(Arc::new(ClientInvoker {
            inner: Arc::downgrade(&self.inner),
        }))
    }

    /// Stop reconnecting and close the current connection
    pub async fn close(&self) {
        if self.inner.closing_tx.send_replace(true) {
            return;
        }
        info!("Closing karton client");
        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }
}

impl fmt::Debug for KartonClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KartonClient")
            .field("connected", &self.is_connected())
            .field("synced", &self.is_synced())
            .finish()
    }
}

struct ClientInvoker {
    inner: Weak<ClientInner>,
}

impl Invoker for ClientInvoker {
    fn invoke(
        &self,
        path: Vec<String>,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> BoxFuture<'static, KartonResult<Value>> {
        let rpc = self.inner.upgrade().and_then(|inner| inner.current());
        Box::pin(async move {
            match rpc {
                Some(rpc) => rpc.call(path, parameters, options).await,
                None => Err(KartonError::ConnectionClosed),
            }
        })
    }
}

/// Drive connections until the client is closed
async fn supervise(inner: Arc<ClientInner>, connector: Arc<dyn Connector>) {
    let mut closing = inner.closing_tx.subscribe();
    let interval = inner.config.reconnect_interval();
    let mut first_attempt = true;

    'connections: loop {
        let transport = Transport::new();
        let rpc = RpcManager::new(transport.clone(), inner.config.call_timeout());
        rpc.register_tree(&inner.procedures);

        let state = inner.state.clone();
        let _ = transport.on_message(move |message| state.handle_message(message));
        let weak = Arc::downgrade(&inner);
        let _ = transport.on_open(move || {
            if let Some(inner) = weak.upgrade() {
                inner.set_connected(true);
            }
        });
        let _ = transport.on_error(|error| warn!("Connection error: {}", error));

        *inner.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(rpc.clone());

        loop {
            if !first_attempt {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = closing.wait_for(|closing| *closing) => {
                        transport.close("client closed");
                        rpc.cleanup();
                        break 'connections;
                    }
                }
            }
            first_attempt = false;

            debug!("Connecting transport {}", transport.id());
            let connected = tokio::select! {
                connected = connector.connect() => connected,
                _ = closing.wait_for(|closing| *closing) => {
                    transport.close("client closed");
                    rpc.cleanup();
                    break 'connections;
                }
            };

            match connected {
                Ok((sink, stream)) => match transport.attach(sink, stream) {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("Could not attach socket: {}", e);
                        continue 'connections;
                    }
                },
                Err(e) => warn!("Connection attempt failed: {}; retrying in {:?}", e, interval),
            }
        }

        let stop = tokio::select! {
            _ = transport.closed() => false,
            _ = closing.wait_for(|closing| *closing) => true,
        };

        transport.close(if stop { "client closed" } else { "connection lost" });
        rpc.cleanup();
        inner.state.mark_unsynced();
        inner.set_connected(false);

        if stop {
            break;
        }
        info!("Disconnected, reconnecting in {:?}", interval);
    }

    inner.current.lock().unwrap_or_else(PoisonError::into_inner).take();
    inner.set_connected(false);
    debug!("Client supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::KartonServer;
    use crate::transport::memory::duplex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::assert_err;

    fn memory_connector(server: KartonServer) -> impl Connector {
        move || {
            let server = server.clone();
            let connecting: BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>> =
                Box::pin(async move {
                    let (server_side, client_side) = duplex();
                    let (sink, stream) = server_side.split();
                    server.accept(sink, stream)?;
                    let (sink, stream) = client_side.split();
                    Ok((sink, stream))
                });
            connecting
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Condition should hold eventually");
    }

    #[tokio::test]
    async fn test_connects_and_replicates() {
        let server = KartonServer::new(Value::from(json!({"counter": 4})), ProcedureTree::new());
        let client = KartonClient::builder(memory_connector(server.clone()))
            .fallback_state(json!({"counter": 0}))
            .build();

        assert!(client.wait_connected().await);
        eventually(|| client.is_synced()).await;
        assert_eq!(*client.state(), Value::from(json!({"counter": 4})));

        server.mutate(|state| {
            state.set("counter", 5);
        });
        eventually(|| *client.state() == Value::from(json!({"counter": 5}))).await;

        client.close().await;
        assert!(!client.is_connected());
        eventually(|| server.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_failed_attempts_are_retried() {
        let server = KartonServer::new(Value::Null, ProcedureTree::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let inner = memory_connector(server);
        let connector = move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                let refused: BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>> =
                    Box::pin(async { Err(KartonError::WebSocket("refused".to_string())) });
                refused
            } else {
                inner.connect()
            }
        };

        let client = KartonClient::builder(connector)
            .config(KartonClientConfig::default().with_reconnect_interval(Duration::from_millis(10)))
            .build();
        assert!(client.wait_connected().await);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        client.close().await;
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let server = KartonServer::new(Value::Null, ProcedureTree::new());
        let client = KartonClient::builder(memory_connector(server)).build();
        assert!(client.wait_connected().await);
        client.close().await;

        let result = client.server().at("anything").call(vec![]).await;
        assert_err!(&result);
        assert!(!client.wait_connected().await);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_reconnecting() {
        let server = KartonServer::new(Value::Null, ProcedureTree::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let inner = memory_connector(server.clone());
        let connector = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            inner.connect()
        };

        let client = KartonClient::builder(connector)
            .config(KartonClientConfig::default().with_reconnect_interval(Duration::from_millis(10)))
            .build();
        assert!(client.wait_connected().await);
        let handle = client.clone();
        drop(client);
        // A clone keeps the client alive
        assert!(handle.is_connected());
        assert_eq!(server.session_count(), 1);

        drop(handle);
        eventually(|| server.session_count() == 0).await;
        let seen = attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), seen);
        assert_eq!(server.session_count(), 0);
    }
}
