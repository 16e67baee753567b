use std::sync::Arc;

use vesper_core::{Engine, Resolve, RuntimeError};

pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// How the runtime creates heaps for workers and how received values
/// resolve function references. The `create` hook lets hosts pre-load
/// support units into every new heap.
pub struct HeapConfig<E: Engine> {
    pub engine: Arc<E>,
    pub create: Arc<dyn Fn(&E) -> Result<E::Heap, RuntimeError> + Send + Sync>,
    pub resolve: Resolve,
    /// Mailbox cap per direction; senders block once a mailbox holds this
    /// many undelivered messages.
    pub max_messages: usize,
}

impl<E: Engine> HeapConfig<E> {
    pub fn new(engine: Arc<E>) -> HeapConfig<E> {
        HeapConfig {
            engine,
            create: Arc::new(|engine: &E| engine.create_heap()),
            resolve: Resolve::Load,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }

    pub fn create_heap(&self) -> Result<E::Heap, RuntimeError> {
        (self.create)(&self.engine)
    }
}

impl<E: Engine> Clone for HeapConfig<E> {
    fn clone(&self) -> Self {
        HeapConfig {
            engine: Arc::clone(&self.engine),
            create: Arc::clone(&self.create),
            resolve: self.resolve,
            max_messages: self.max_messages,
        }
    }
}
