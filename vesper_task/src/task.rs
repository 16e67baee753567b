use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use vesper_core::{CallError, Engine, Resolve, RuntimeError};

use crate::config::HeapConfig;
use crate::wait::{wait_on, Deadline, Wait};

/// An isolated-heap worker: a detached OS thread running one entry function,
/// reachable through two bounded mailboxes. The request mailbox carries
/// messages into the task, the reply mailbox carries messages out; both live
/// in a private comm heap that outlives the worker thread.
pub struct Task<E: Engine> {
    config: HeapConfig<E>,
    unit: String,
    entry: String,
    tag: AtomicU64,
    shared: Mutex<Mailboxes<E>>,
    cond: Condvar,
}

struct Mailboxes<E: Engine> {
    comm_heap: E::Heap,
    request: VecDeque<E::Value>,
    reply: VecDeque<E::Value>,
    start_params: Option<E::Value>,
    max_messages: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Dir {
    Request,
    Reply,
}

impl<E: Engine> Mailboxes<E> {
    fn queue(&self, dir: Dir) -> &VecDeque<E::Value> {
        match dir {
            Dir::Request => &self.request,
            Dir::Reply => &self.reply,
        }
    }

    fn queue_mut(&mut self, dir: Dir) -> &mut VecDeque<E::Value> {
        match dir {
            Dir::Request => &mut self.request,
            Dir::Reply => &mut self.reply,
        }
    }
}

impl<E: Engine> Task<E> {
    /// Spawns a worker thread that creates its own heap, loads `unit` and
    /// calls `entry` with a clone of `params`. Load and script failures
    /// inside the worker are asynchronous: they are logged, not returned.
    pub fn create(
        config: &HeapConfig<E>,
        unit: &str,
        entry: &str,
        src_heap: &E::Heap,
        params: &E::Value,
    ) -> Result<Arc<Task<E>>, RuntimeError> {
        let comm_heap = config.engine.create_heap()?;
        let start = config
            .engine
            .clone_between(&comm_heap, src_heap, params, Resolve::Existing)?;
        let task = Arc::new(Task {
            config: config.clone(),
            unit: unit.to_string(),
            entry: entry.to_string(),
            tag: AtomicU64::new(0),
            shared: Mutex::new(Mailboxes {
                comm_heap,
                request: VecDeque::new(),
                reply: VecDeque::new(),
                start_params: Some(start),
                max_messages: config.max_messages,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&task);
        thread::Builder::new()
            .name(format!("{}:{}", unit, entry))
            .spawn(move || worker.run())
            .map_err(|_| RuntimeError::out_of_memory())?;
        Ok(task)
    }

    /// The task whose worker thread owns `heap`, if any.
    pub fn current(engine: &E, heap: &E::Heap) -> Option<Arc<Task<E>>> {
        engine.context(heap)?.downcast::<Task<E>>().ok()
    }

    /// Host-assigned identifier, 0 until the host registers the task.
    pub fn tag(&self) -> u64 {
        self.tag.load(Ordering::Relaxed)
    }

    pub fn set_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Relaxed);
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Sends into the task. Returns false on timeout with a full mailbox.
    pub fn send_request(
        &self,
        from: &E::Heap,
        msg: &E::Value,
        wait: Wait,
    ) -> Result<bool, RuntimeError> {
        self.push(Dir::Request, from, msg, wait)
    }

    /// Sends out of the task; used by the worker itself.
    pub fn send_reply(
        &self,
        from: &E::Heap,
        msg: &E::Value,
        wait: Wait,
    ) -> Result<bool, RuntimeError> {
        self.push(Dir::Reply, from, msg, wait)
    }

    /// Pops the oldest message sent into the task; used by the worker.
    pub fn receive_request(
        &self,
        into: &E::Heap,
        wait: Wait,
    ) -> Result<Option<E::Value>, RuntimeError> {
        self.pop(Dir::Request, into, wait)
    }

    /// Pops the oldest message sent out of the task.
    pub fn receive_reply(
        &self,
        into: &E::Heap,
        wait: Wait,
    ) -> Result<Option<E::Value>, RuntimeError> {
        self.pop(Dir::Reply, into, wait)
    }

    fn push(
        &self,
        dir: Dir,
        from: &E::Heap,
        msg: &E::Value,
        wait: Wait,
    ) -> Result<bool, RuntimeError> {
        let deadline = Deadline::start(wait);
        let mut shared = self.shared.lock();
        while shared.queue(dir).len() >= shared.max_messages {
            if !wait_on(&self.cond, &mut shared, &deadline) {
                return Ok(false);
            }
        }
        let cloned =
            self.config
                .engine
                .clone_between(&shared.comm_heap, from, msg, Resolve::Existing)?;
        shared.queue_mut(dir).push_back(cloned);
        self.cond.notify_one();
        Ok(true)
    }

    fn pop(
        &self,
        dir: Dir,
        into: &E::Heap,
        wait: Wait,
    ) -> Result<Option<E::Value>, RuntimeError> {
        let deadline = Deadline::start(wait);
        let mut shared = self.shared.lock();
        loop {
            if let Some(msg) = shared.queue_mut(dir).pop_front() {
                let out = self.config.engine.clone_between(
                    into,
                    &shared.comm_heap,
                    &msg,
                    self.config.resolve,
                );
                self.config.engine.collect(&shared.comm_heap);
                self.cond.notify_one();
                return out.map(Some);
            }
            if !wait_on(&self.cond, &mut shared, &deadline) {
                return Ok(None);
            }
        }
    }

    fn run(self: Arc<Self>) {
        let engine = Arc::clone(&self.config.engine);
        let heap = match self.config.create_heap() {
            Ok(heap) => heap,
            Err(err) => {
                tracing::error!(unit = %self.unit, entry = %self.entry, error = %err,
                    "task heap creation failed");
                return;
            }
        };
        if let Err(err) = engine.load(&heap, &self.unit) {
            tracing::error!(unit = %self.unit, entry = %self.entry, error = %err,
                "task unit load failed");
            return;
        }
        let params = {
            let mut shared = self.shared.lock();
            let start = shared.start_params.take();
            match start {
                Some(value) => {
                    engine.clone_between(&heap, &shared.comm_heap, &value, self.config.resolve)
                }
                None => Err(RuntimeError::usage("task was already started")),
            }
        };
        let params = match params {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(unit = %self.unit, entry = %self.entry, error = %err,
                    "task parameter transfer failed");
                return;
            }
        };
        let func = match engine.get_function(&heap, &self.unit, &self.entry) {
            Ok(func) => func,
            Err(err) => {
                tracing::error!(unit = %self.unit, entry = %self.entry, error = %err,
                    "task entry function not found");
                return;
            }
        };
        engine.set_context(&heap, Some(Arc::clone(&self) as Arc<dyn Any + Send + Sync>));
        match engine.call(&heap, &func, &[params]) {
            Ok(_) => {}
            Err(CallError::Script(err)) => {
                tracing::error!(unit = %self.unit, entry = %self.entry,
                    error = %engine.describe(&heap, &err), "task failed");
            }
            Err(CallError::Engine(err)) => {
                tracing::error!(unit = %self.unit, entry = %self.entry, error = %err,
                    "task failed");
            }
        }
        engine.set_context(&heap, None);
    }
}

/// Puts the calling thread to sleep.
pub fn sleep(millis: u32) {
    thread::sleep(Duration::from_millis(millis as u64));
}
