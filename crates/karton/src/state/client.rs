use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use super::diff::apply_patch;
use crate::protocol::{format_path, Message, Value};

type ChangeCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Replica {
    value: Arc<Value>,
    /// False until the first `StateSync`, and again after a patch fails
    synced: bool,
}

/// Local replica of the server's state.
///
/// A `StateSync` replaces the replica wholesale. A `StatePatch` is applied
/// all-or-nothing; patches that arrive while the replica is unsynced are
/// dropped until the next `StateSync`.
pub struct ClientStateManager {
    replica: RwLock<Replica>,
    on_change: Mutex<Option<ChangeCallback>>,
}

impl ClientStateManager {
    /// Start from `fallback` until the first sync arrives
    pub fn new(fallback: Value) -> Self {
        Self {
            replica: RwLock::new(Replica {
                value: Arc::new(fallback),
                synced: false,
            }),
            on_change: Mutex::new(None),
        }
    }

    /// Current replica
    pub fn state(&self) -> Arc<Value> {
        self.replica
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .value
            .clone()
    }

    /// Whether a full sync arrived and no patch has failed since
    pub fn is_synced(&self) -> bool {
        self.replica
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .synced
    }

    /// Called with the new replica after every applied sync or patch
    pub fn on_change(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        *self.on_change.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Mark the replica stale so patches are dropped until the next sync.
    /// Used when the connection drops.
    pub fn mark_unsynced(&self) {
        self.replica
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .synced = false;
    }

    /// Apply a state message; anything else is ignored
    pub fn handle_message(&self, message: &Message) {
        let changed = match message {
            Message::StateSync { state } => {
                let next = Arc::new(state.clone());
                let mut replica = self.replica.write().unwrap_or_else(PoisonError::into_inner);
                replica.value = next.clone();
                replica.synced = true;
                debug!("Replica replaced by full sync");
                next
            }
            Message::StatePatch { patch } => {
                let mut replica = self.replica.write().unwrap_or_else(PoisonError::into_inner);
                if !replica.synced {
                    warn!(
                        "Dropping state patch with {} operations received before a full sync",
                        patch.len()
                    );
                    return;
                }

                let mut draft = Value::clone(&replica.value);
                if let Err(e) = apply_patch(&mut draft, patch) {
                    let paths: Vec<String> = patch.iter().map(|op| format_path(op.path())).collect();
                    warn!(
                        "Failed to apply state patch {:?}: {}; waiting for the next full sync",
                        paths, e
                    );
                    replica.synced = false;
                    return;
                }

                let next = Arc::new(draft);
                replica.value = next.clone();
                next
            }
            _ => return,
        };

        let callback = self
            .on_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&changed);
        }
    }
}
