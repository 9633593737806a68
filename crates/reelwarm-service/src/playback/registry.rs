use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::PlaybackEngine;

/// Identifies an engine registered with a [`PlaybackRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineId(u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

#[derive(Default)]
struct RegistryState {
    engines: BTreeMap<EngineId, Weak<dyn PlaybackEngine>>,
    next_id: u64,
}

/// Makes sure only one engine plays at a time.
///
/// Engines are tracked through weak references, so being registered does not keep an engine
/// alive. Entries of engines that were dropped without unregistering are pruned on access.
#[derive(Default)]
pub struct PlaybackRegistry {
    state: Mutex<RegistryState>,
}

impl fmt::Debug for PlaybackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackRegistry")
            .field("engines", &self.lock().engines.len())
            .finish()
    }
}

impl PlaybackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, engine: &Arc<dyn PlaybackEngine>) -> EngineId {
        let mut state = self.lock();
        let id = EngineId(state.next_id);
        state.next_id += 1;
        state.engines.insert(id, Arc::downgrade(engine));
        id
    }

    pub fn unregister(&self, id: EngineId) {
        self.lock().engines.remove(&id);
    }

    /// Pauses every live engine except `id`.
    ///
    /// Returns the number of paused engines.
    pub fn pause_others(&self, id: EngineId) -> usize {
        let others: Vec<_> = {
            let mut state = self.lock();
            state.engines.retain(|_, engine| engine.strong_count() > 0);
            state
                .engines
                .iter()
                .filter(|(other, _)| **other != id)
                .filter_map(|(_, engine)| engine.upgrade())
                .collect()
        };
        for engine in &others {
            engine.pause();
        }
        others.len()
    }

    /// The number of live registered engines.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        state.engines.retain(|_, engine| engine.strong_count() > 0);
        state.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
