//! Bidirectional call/response multiplexing over one transport.
//!
//! Every [`RpcManager`] is both caller and callee. Outgoing calls get a fresh
//! call id and a pending entry with its own timeout timer; incoming calls are
//! dispatched to the manager's own [`ProcedureRegistry`] and answered with the
//! caller's call id. Calls are independent: responses may arrive in any order.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::procedures::{
    dotted_path, Invoker, Procedure, ProcedureRegistry, ProcedureTree,
};
use crate::protocol::{ErrorObject, Message, Value};
use crate::transport::{ListenerHandle, Transport};
use crate::{KartonError, KartonResult};

/// Timeout applied when neither the call nor the manager specify one
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call settings
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the manager-wide timeout
    pub timeout: Option<Duration>,
    /// Reported in `ConnectionLost` errors, e.g. the target session id
    pub correlation_id: Option<String>,
}

impl CallOptions {
    /// Override the call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tag the call for error reports
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

struct PendingCall {
    procedure: String,
    correlation_id: Option<String>,
    resolve: oneshot::Sender<KartonResult<Value>>,
    timer: JoinHandle<()>,
}

impl PendingCall {
    fn lost(self, reason: String) {
        self.timer.abort();
        let _ = self.resolve.send(Err(KartonError::ConnectionLost {
            procedure: self.procedure,
            correlation_id: self.correlation_id,
            reason,
        }));
    }
}

struct RpcInner {
    transport: Transport,
    default_timeout: Duration,
    /// Appended to the parameters of every inbound call
    caller_id: Option<String>,
    pending: Mutex<HashMap<String, PendingCall>>,
    registry: RwLock<ProcedureRegistry>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl RpcInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, path: &str) -> Option<Procedure> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
    }

    fn settle(&self, call_id: &str, result: KartonResult<Value>) {
        let pending = self.lock_pending().remove(call_id);
        match pending {
            Some(call) => {
                call.timer.abort();
                debug!("Call {} to '{}' settled", call_id, call.procedure);
                let _ = call.resolve.send(result);
            }
            None => {
                warn!(
                    "Ignoring response for unknown or expired call {}",
                    call_id
                );
            }
        }
    }

    fn expire(&self, call_id: &str, timeout: Duration) {
        let pending = self.lock_pending().remove(call_id);
        if let Some(call) = pending {
            warn!(
                "Call {} to '{}' timed out after {:?}",
                call_id, call.procedure, timeout
            );
            call.lost(format!("no response within {:?}", timeout));
        }
    }
}

/// Caller and callee side of RPC over one transport
#[derive(Clone)]
pub struct RpcManager {
    inner: Arc<RpcInner>,
}

impl RpcManager {
    /// Create a manager and start handling the transport's inbound messages
    pub fn new(transport: Transport, default_timeout: Duration) -> Self {
        Self::build(transport, default_timeout, None)
    }

    /// Create a server-side manager that appends `session_id` to the parameters
    /// of every inbound call
    pub fn for_session(
        transport: Transport,
        default_timeout: Duration,
        session_id: impl Into<String>,
    ) -> Self {
        Self::build(transport, default_timeout, Some(session_id.into()))
    }

    fn build(transport: Transport, default_timeout: Duration, caller_id: Option<String>) -> Self {
        let inner = Arc::new(RpcInner {
            transport: transport.clone(),
            default_timeout,
            caller_id,
            pending: Mutex::new(HashMap::new()),
            registry: RwLock::new(ProcedureRegistry::new()),
            listener: Mutex::new(None),
        });

        let weak: Weak<RpcInner> = Arc::downgrade(&inner);
        let handle = transport.on_message(move |message| {
            if let Some(inner) = weak.upgrade() {
                RpcManager { inner }.handle_message(message);
            }
        });
        *inner.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self { inner }
    }

    /// The transport this manager sends on
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Register a handler under a dotted path, replacing any previous one
    pub fn register_procedure(&self, path: impl Into<String>, handler: Procedure) {
        let path = path.into();
        debug!("Registering procedure '{}'", path);
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, handler);
    }

    /// Register every procedure of a tree
    pub fn register_tree(&self, tree: &ProcedureTree) {
        let incoming = ProcedureRegistry::from_tree(tree);
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for path in incoming.paths() {
            if let Some(handler) = incoming.get(&path) {
                registry.insert(path, handler);
            }
        }
    }

    /// Remove a procedure by dotted path. Returns false if it was not registered.
    pub fn unregister_procedure(&self, path: &str) -> bool {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
    }

    /// Swap the whole registry for the procedures of `tree`
    pub fn replace_procedures(&self, tree: &ProcedureTree) {
        *self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = ProcedureRegistry::from_tree(tree);
    }

    /// Registered procedure paths, sorted
    pub fn procedures(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .paths()
    }

    /// Call a procedure on the peer and wait for its result.
    ///
    /// Resolves with the returned value, the peer's exception, or
    /// `ConnectionLost` once the timeout elapses. A response arriving after
    /// the timeout is ignored.
    pub async fn call(
        &self,
        path: Vec<String>,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> KartonResult<Value> {
        let call_id = Uuid::new_v4().to_string();
        let procedure = dotted_path(&path);
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let (resolve, result) = oneshot::channel();

        {
            let mut pending = self.inner.lock_pending();
            // The timer takes the same lock, so it cannot fire before the entry exists
            let weak = Arc::downgrade(&self.inner);
            let timer_call_id = call_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&timer_call_id, timeout);
                }
            });
            pending.insert(
                call_id.clone(),
                PendingCall {
                    procedure: procedure.clone(),
                    correlation_id: options.correlation_id.clone(),
                    resolve,
                    timer,
                },
            );
        }

        debug!("Calling '{}' as {}", procedure, call_id);
        let message = Message::RpcCall {
            call_id: call_id.clone(),
            procedure_path: path,
            parameters,
        };
        if let Err(e) = self.inner.transport.send(&message) {
            let pending = self.inner.lock_pending().remove(&call_id);
            if let Some(call) = pending {
                call.timer.abort();
            }
            return Err(e);
        }

        match result.await {
            Ok(result) => result,
            Err(_) => Err(KartonError::ConnectionLost {
                procedure,
                correlation_id: options.correlation_id,
                reason: "pending call was dropped".to_string(),
            }),
        }
    }

    /// Route one inbound message. Non-RPC messages are ignored.
    pub fn handle_message(&self, message: &Message) {
        match message {
            Message::RpcCall {
                call_id,
                procedure_path,
                parameters,
            } => self.dispatch(call_id.clone(), procedure_path, parameters.clone()),
            Message::RpcReturn { call_id, value } => self.inner.settle(call_id, Ok(value.clone())),
            Message::RpcException { call_id, error } => {
                self.inner.settle(call_id, Err(remote_error(error.clone())))
            }
            Message::StateSync { .. } | Message::StatePatch { .. } => {}
        }
    }

    fn dispatch(&self, call_id: String, procedure_path: &[String], mut parameters: Vec<Value>) {
        let path = dotted_path(procedure_path);
        let Some(handler) = self.inner.lookup(&path) else {
            warn!("Rejecting call {} to unknown procedure '{}'", call_id, path);
            let error = ErrorObject::from(KartonError::ProcedureNotFound { path });
            self.reply(Message::RpcException { call_id, error });
            return;
        };

        if let Some(caller_id) = &self.inner.caller_id {
            parameters.push(Value::String(caller_id.clone()));
        }

        debug!("Dispatching call {} to '{}'", call_id, path);
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler(parameters)).catch_unwind().await;
            let reply = match outcome {
                Ok(Ok(value)) => Message::RpcReturn { call_id, value },
                Ok(Err(error)) => Message::RpcException { call_id, error },
                Err(_) => {
                    warn!("Procedure '{}' panicked", path);
                    Message::RpcException {
                        call_id,
                        error: ErrorObject::new(
                            "InternalError",
                            format!("procedure '{}' panicked", path),
                        ),
                    }
                }
            };
            manager.reply(reply);
        });
    }

    fn reply(&self, message: Message) {
        if let Err(e) = self.inner.transport.send(&message) {
            debug!(
                "Could not deliver {} for call {}: {}",
                message.kind(),
                message.call_id().unwrap_or_default(),
                e
            );
        }
    }

    /// Fail every pending call with `ConnectionLost` and clear the registry
    pub fn cleanup(&self) {
        let pending: Vec<(String, PendingCall)> = self.inner.lock_pending().drain().collect();
        let failed = pending.len();
        for (_, call) in pending {
            call.lost("connection cleaned up".to_string());
        }
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(
            "RPC manager on transport {} cleaned up ({} pending calls failed)",
            self.inner.transport.id(),
            failed
        );
    }
}

impl Invoker for RpcManager {
    fn invoke(
        &self,
        path: Vec<String>,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> BoxFuture<'static, KartonResult<Value>> {
        let manager = self.clone();
        Box::pin(async move { manager.call(path, parameters, options).await })
    }
}

/// Map a received exception back onto the local error taxonomy
fn remote_error(error: ErrorObject) -> KartonError {
    if error.name == "ProcedureNotFound" {
        let path = error
            .field("path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.message.clone());
        return KartonError::ProcedureNotFound { path };
    }
    KartonError::Remote(error)
}
