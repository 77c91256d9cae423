//! Server side orchestration: one session per accepted connection, one
//! canonical state shared by all of them.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::config::KartonServerConfig;
use crate::procedures::{Invoker, ProcedureTree, RemoteProcedures};
use crate::protocol::{Frame, Message, PatchOperation, Value};
use crate::rpc::{CallOptions, RpcManager};
use crate::state::StateManager;
use crate::transport::Transport;
use crate::{KartonError, KartonResult};

type SessionCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

/// One connected client as seen by the server
#[derive(Clone)]
pub struct ClientSession {
    id: String,
    transport: Transport,
    rpc: RpcManager,
}

impl ClientSession {
    /// Session id, also the transport id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The transport of this session
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The RPC manager of this session
    pub fn rpc(&self) -> &RpcManager {
        &self.rpc
    }

    /// Procedures exposed by this client
    pub fn procedures(&self) -> RemoteProcedures {
        RemoteProcedures::new(Arc::new(SessionInvoker {
            session_id: self.id.clone(),
            rpc: self.rpc.clone(),
        }))
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("state", &self.transport.state())
            .finish()
    }
}

/// Tags calls with the session id and reports a vanished session as `ClientNotFound`
struct SessionInvoker {
    session_id: String,
    rpc: RpcManager,
}

impl Invoker for SessionInvoker {
    fn invoke(
        &self,
        path: Vec<String>,
        parameters: Vec<Value>,
        mut options: CallOptions,
    ) -> BoxFuture<'static, KartonResult<Value>> {
        let rpc = self.rpc.clone();
        let session_id = self.session_id.clone();
        options
            .correlation_id
            .get_or_insert_with(|| session_id.clone());
        Box::pin(async move {
            match rpc.call(path, parameters, options).await {
                Err(KartonError::ConnectionClosed) => {
                    Err(KartonError::ClientNotFound { session_id })
                }
                result => result,
            }
        })
    }
}

struct ServerInner {
    config: KartonServerConfig,
    state: Arc<StateManager>,
    procedures: ProcedureTree,
    sessions: DashMap<String, ClientSession>,
    session_listeners: Mutex<Vec<SessionCallback>>,
}

impl ServerInner {
    fn notify_sessions(&self) {
        let listeners = self
            .session_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if listeners.is_empty() {
            return;
        }
        let ids = session_ids(&self.sessions);
        for listener in listeners {
            listener(&ids);
        }
    }
}

fn session_ids(sessions: &DashMap<String, ClientSession>) -> Vec<String> {
    let mut ids: Vec<String> = sessions.iter().map(|entry| entry.key().clone()).collect();
    ids.sort();
    ids
}

/// Accepts connections, serves procedures and replicates state to every session
#[derive(Clone)]
pub struct KartonServer {
    inner: Arc<ServerInner>,
}

impl KartonServer {
    /// Create a server with default settings
    pub fn new(initial: Value, procedures: ProcedureTree) -> Self {
        Self::with_config(initial, procedures, KartonServerConfig::default())
    }

    /// Create a server with its own state manager
    pub fn with_config(initial: Value, procedures: ProcedureTree, config: KartonServerConfig) -> Self {
        let state = Arc::new(StateManager::new(initial, config.patch_buffer));
        Self::with_state(state, procedures, config)
    }

    /// Serve an existing state manager, e.g. one the procedures already hold.
    /// `config.patch_buffer` is ignored since the manager owns its channel.
    pub fn with_state(
        state: Arc<StateManager>,
        procedures: ProcedureTree,
        config: KartonServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                state,
                procedures,
                sessions: DashMap::new(),
                session_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get the server configuration
    pub fn config(&self) -> &KartonServerConfig {
        &self.inner.config
    }

    /// Take over a freshly accepted socket and start a session on it.
    ///
    /// The session receives a full state sync before anything else, then
    /// every patch committed after that sync.
    pub fn accept<Si, St, E>(&self, sink: Si, stream: St) -> KartonResult<ClientSession>
    where
        Si: Sink<Frame> + Send + 'static,
        Si::Error: fmt::Display + Send,
        St: Stream<Item = Result<Frame, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let transport = Transport::new();
        let id = transport.id().to_string();
        let rpc = RpcManager::for_session(
            transport.clone(),
            self.inner.config.call_timeout(),
            id.clone(),
        );
        rpc.register_tree(&self.inner.procedures);

        let session = ClientSession {
            id: id.clone(),
            transport: transport.clone(),
            rpc,
        };

        let weak: Weak<ServerInner> = Arc::downgrade(&self.inner);
        let close_id = id.clone();
        let _ = transport.on_close(move |reason| {
            if let Some(inner) = weak.upgrade() {
                if let Some((_, session)) = inner.sessions.remove(&close_id) {
                    session.rpc.cleanup();
                    info!("Session {} closed: {}", close_id, reason);
                    inner.notify_sessions();
                }
            }
        });

        // Snapshot and subscription are taken together so no patch falls between them
        let (snapshot, patches) = self.inner.state.subscribe();
        transport.send(&Message::StateSync {
            state: Value::clone(&snapshot),
        })?;

        self.inner.sessions.insert(id.clone(), session.clone());
        if let Err(e) = transport.attach(sink, stream) {
            self.inner.sessions.remove(&id);
            return Err(e);
        }

        tokio::spawn(forward_patches(
            transport,
            self.inner.state.clone(),
            patches,
        ));

        info!(
            "Session {} connected ({} sessions)",
            id,
            self.inner.sessions.len()
        );
        self.inner.notify_sessions();
        Ok(session)
    }

    /// Current canonical state
    pub fn state(&self) -> Arc<Value> {
        self.inner.state.state()
    }

    /// Change the canonical state and broadcast the difference
    pub fn mutate<F>(&self, recipe: F) -> Arc<Value>
    where
        F: FnOnce(&mut Value),
    {
        self.inner.state.mutate(recipe)
    }

    /// Get the shared state manager
    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.inner.state
    }

    /// Procedures of the client connected as `session_id`
    pub fn client(&self, session_id: &str) -> KartonResult<RemoteProcedures> {
        self.session(session_id).map(|session| session.procedures())
    }

    /// Get a connected session by id
    pub fn session(&self, session_id: &str) -> KartonResult<ClientSession> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KartonError::ClientNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Ids of all connected sessions, sorted
    pub fn session_ids(&self) -> Vec<String> {
        session_ids(&self.inner.sessions)
    }

    /// Number of connected sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Close a session's connection. Returns false if it was not connected.
    pub fn disconnect(&self, session_id: &str) -> bool {
        let transport = match self.inner.sessions.get(session_id) {
            Some(entry) => entry.value().transport.clone(),
            None => return false,
        };
        info!("Disconnecting session {}", session_id);
        transport.close("disconnected by server");
        true
    }

    /// Called with the sorted session ids whenever a session connects or leaves
    pub fn on_session_change(&self, callback: impl Fn(&[String]) + Send + Sync + 'static) {
        self.inner
            .session_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }
}

impl fmt::Debug for KartonServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KartonServer")
            .field("sessions", &self.session_ids())
            .finish()
    }
}

/// Relay committed patches to one session until its transport closes
async fn forward_patches(
    transport: Transport,
    state: Arc<StateManager>,
    mut patches: broadcast::Receiver<Arc<Vec<PatchOperation>>>,
) {
    loop {
        let received = tokio::select! {
            _ = transport.closed() => break,
            received = patches.recv() => received,
        };

        let message = match received {
            Ok(patch) => Message::StatePatch {
                patch: Vec::clone(&patch),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    "Session {} lagged by {} patches, resyncing",
                    transport.id(),
                    skipped
                );
                let (snapshot, fresh) = state.subscribe();
                patches = fresh;
                Message::StateSync {
                    state: Value::clone(&snapshot),
                }
            }
            Err(RecvError::Closed) => break,
        };

        if transport.send(&message).is_err() {
            break;
        }
    }
    debug!("Patch forwarder for session {} ended", transport.id());
}
