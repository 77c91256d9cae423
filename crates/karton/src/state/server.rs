use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::diff::diff;
use crate::protocol::{Message, PatchOperation, Value};

/// Owner of the canonical state.
///
/// Mutations are diffed against the previous value and the resulting
/// patch is broadcast to every subscriber. Reads never block on writers
/// for longer than the pointer swap.
pub struct StateManager {
    state: RwLock<Arc<Value>>,
    /// Serializes mutations; readers only wait for the pointer swap
    writer: Mutex<()>,
    patch_tx: broadcast::Sender<Arc<Vec<PatchOperation>>>,
}

impl StateManager {
    /// Create a manager holding `initial`. `buffer` bounds how many patches
    /// a slow subscriber may fall behind before it lags.
    pub fn new(initial: Value, buffer: usize) -> Self {
        let (patch_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            state: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(()),
            patch_tx,
        }
    }

    /// Current canonical state
    pub fn state(&self) -> Arc<Value> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `recipe` against a copy of the state and commit the result.
    ///
    /// Subscribers receive one patch if anything changed and nothing otherwise.
    /// Mutations run one at a time. Inside `recipe`, [`StateManager::state`]
    /// still returns the value being replaced; calling `mutate` on the same
    /// manager from `recipe` deadlocks.
    pub fn mutate<F>(&self, recipe: F) -> Arc<Value>
    where
        F: FnOnce(&mut Value),
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.state();
        let mut draft = Value::clone(&current);
        recipe(&mut draft);

        let patch = diff(&current, &draft);
        if patch.is_empty() {
            debug!("Mutation produced no changes");
            return current;
        }

        let next = Arc::new(draft);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = next.clone();
        debug!("Broadcasting state patch with {} operations", patch.len());
        // Sent under the write lock so `subscribe` never sees a gap.
        // No receivers just means no sessions yet
        let _ = self.patch_tx.send(Arc::new(patch));
        next
    }

    /// A `StateSync` carrying a copy of the current state
    pub fn full_sync_message(&self) -> Message {
        Message::StateSync {
            state: Value::clone(&self.state()),
        }
    }

    /// Snapshot plus a receiver for every patch committed after it
    pub fn subscribe(&self) -> (Arc<Value>, broadcast::Receiver<Arc<Vec<PatchOperation>>>) {
        // Holding the lock keeps the snapshot and the first received patch contiguous
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.clone(), self.patch_tx.subscribe())
    }

    /// Number of live patch receivers
    pub fn subscriber_count(&self) -> usize {
        self.patch_tx.receiver_count()
    }
}
