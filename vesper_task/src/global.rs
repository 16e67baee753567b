use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use vesper_core::{Engine, Resolve, RuntimeError};

/// Process-wide key/value store: one private heap plus a hash map behind a
/// single mutex. Keys are hashed by their serialized bytes; values are
/// deep-cloned on every access, so no live reference ever crosses the
/// boundary. The heap is created lazily on first use.
pub struct GlobalStore<E: Engine> {
    engine: Arc<E>,
    state: Mutex<Option<StoreState<E>>>,
}

struct StoreState<E: Engine> {
    heap: E::Heap,
    entries: HashMap<Vec<u8>, E::Value>,
}

impl<E: Engine> GlobalStore<E> {
    pub fn new(engine: Arc<E>) -> GlobalStore<E> {
        GlobalStore {
            engine,
            state: Mutex::new(None),
        }
    }

    fn ensure<'a>(
        &self,
        state: &'a mut Option<StoreState<E>>,
    ) -> Result<&'a mut StoreState<E>, RuntimeError> {
        if state.is_none() {
            *state = Some(StoreState {
                heap: self.engine.create_heap()?,
                entries: HashMap::new(),
            });
        }
        state
            .as_mut()
            .ok_or_else(RuntimeError::out_of_memory)
    }

    pub fn set(
        &self,
        heap: &E::Heap,
        key: &E::Value,
        value: &E::Value,
    ) -> Result<(), RuntimeError> {
        let key_bytes = self.engine.serialize(heap, key)?;
        let mut guard = self.state.lock();
        let store = self.ensure(&mut guard)?;
        let cloned = self
            .engine
            .clone_between(&store.heap, heap, value, Resolve::Existing)?;
        store.entries.insert(key_bytes, cloned);
        Ok(())
    }

    pub fn get(
        &self,
        heap: &E::Heap,
        key: &E::Value,
        resolve: Resolve,
    ) -> Result<Option<E::Value>, RuntimeError> {
        let key_bytes = self.engine.serialize(heap, key)?;
        let mut guard = self.state.lock();
        let store = self.ensure(&mut guard)?;
        match store.entries.get(&key_bytes) {
            Some(value) => Ok(Some(self.engine.clone_between(
                heap,
                &store.heap,
                value,
                resolve,
            )?)),
            None => Ok(None),
        }
    }

    /// Fetch-and-add on a 32-bit wraparound counter; a missing key counts
    /// as 0. Returns the previous value.
    pub fn add(&self, heap: &E::Heap, key: &E::Value, amount: i32) -> Result<i32, RuntimeError> {
        let key_bytes = self.engine.serialize(heap, key)?;
        let mut guard = self.state.lock();
        let store = self.ensure(&mut guard)?;
        let prev = store
            .entries
            .get(&key_bytes)
            .and_then(|value| self.engine.as_int(&store.heap, value))
            .unwrap_or(0);
        let next = (prev as u32).wrapping_add(amount as u32) as i32;
        let value = self.engine.make_int(&store.heap, next);
        store.entries.insert(key_bytes, value);
        Ok(prev)
    }
}
