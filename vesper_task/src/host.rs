use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use vesper_core::{Engine, RuntimeError};

use crate::barrier::Barrier;
use crate::channel::ChannelRef;
use crate::channel_set::ChannelSet;
use crate::compute::ComputePool;
use crate::config::HeapConfig;
use crate::global::GlobalStore;
use crate::task::Task;

/// Script-visible runtime object behind an integer handle.
pub enum Object<E: Engine> {
    Task(Arc<Task<E>>),
    Channel(ChannelRef<E>),
    ChannelSet(ChannelSet<E>),
    Barrier(Arc<Barrier<E>>),
}

/// Embedding context: maps integer handles to runtime objects and owns the
/// lazily created compute pool and global store.
pub struct Host<E: Engine> {
    config: HeapConfig<E>,
    objects: DashMap<u64, Object<E>>,
    next_id: AtomicU64,
    globals: GlobalStore<E>,
    compute: Mutex<Option<Arc<ComputePool<E>>>>,
}

impl<E: Engine> Host<E> {
    pub fn new(config: HeapConfig<E>) -> Arc<Host<E>> {
        let globals = GlobalStore::new(Arc::clone(&config.engine));
        Arc::new(Host {
            config,
            objects: DashMap::new(),
            next_id: AtomicU64::new(1),
            globals,
            compute: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.config.engine
    }

    pub fn config(&self) -> &HeapConfig<E> {
        &self.config
    }

    pub fn globals(&self) -> &GlobalStore<E> {
        &self.globals
    }

    pub fn register(&self, object: Object<E>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(id, object);
        id
    }

    pub fn release(&self, id: u64) -> Result<(), RuntimeError> {
        match self.objects.remove(&id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::invalid_handle("object")),
        }
    }

    pub fn task(&self, id: u64) -> Result<Arc<Task<E>>, RuntimeError> {
        match self.objects.get(&id) {
            Some(object) => match object.value() {
                Object::Task(task) => Ok(Arc::clone(task)),
                _ => Err(RuntimeError::invalid_handle("task")),
            },
            None => Err(RuntimeError::invalid_handle("task")),
        }
    }

    pub fn channel(&self, id: u64) -> Result<ChannelRef<E>, RuntimeError> {
        match self.objects.get(&id) {
            Some(object) => match object.value() {
                Object::Channel(channel) => Ok(channel.clone()),
                _ => Err(RuntimeError::invalid_handle("channel")),
            },
            None => Err(RuntimeError::invalid_handle("channel")),
        }
    }

    /// Runs `f` against the stored handle itself. Cloning a channel handle
    /// degrades the `Owned` role, so owner-only operations must go through
    /// here rather than through `channel`.
    pub fn with_channel<R>(
        &self,
        id: u64,
        f: impl FnOnce(&ChannelRef<E>) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        match self.objects.get(&id) {
            Some(object) => match object.value() {
                Object::Channel(channel) => f(channel),
                _ => Err(RuntimeError::invalid_handle("channel")),
            },
            None => Err(RuntimeError::invalid_handle("channel")),
        }
    }

    pub fn channel_set(&self, id: u64) -> Result<ChannelSet<E>, RuntimeError> {
        match self.objects.get(&id) {
            Some(object) => match object.value() {
                Object::ChannelSet(set) => Ok(set.clone()),
                _ => Err(RuntimeError::invalid_handle("channel set")),
            },
            None => Err(RuntimeError::invalid_handle("channel set")),
        }
    }

    pub fn barrier(&self, id: u64) -> Result<Arc<Barrier<E>>, RuntimeError> {
        match self.objects.get(&id) {
            Some(object) => match object.value() {
                Object::Barrier(barrier) => Ok(Arc::clone(barrier)),
                _ => Err(RuntimeError::invalid_handle("barrier")),
            },
            None => Err(RuntimeError::invalid_handle("barrier")),
        }
    }

    /// The host's compute pool, created on first use.
    pub fn compute(&self) -> Result<Arc<ComputePool<E>>, RuntimeError> {
        let mut slot = self.compute.lock();
        if slot.is_none() {
            *slot = Some(ComputePool::new(&self.config)?);
        }
        slot.as_ref()
            .map(Arc::clone)
            .ok_or_else(RuntimeError::out_of_memory)
    }
}
