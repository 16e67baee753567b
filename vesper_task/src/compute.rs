use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use vesper_core::{CallError, Engine, Resolve, RuntimeError};

use crate::config::HeapConfig;

/// A worker failure is either a script error value (already cloned into the
/// submitter's heap) or a runtime error.
pub enum ComputeError<E: Engine> {
    Script(E::Value),
    Runtime(RuntimeError),
}

impl<E: Engine> From<RuntimeError> for ComputeError<E> {
    fn from(err: RuntimeError) -> Self {
        ComputeError::Runtime(err)
    }
}

impl<E: Engine> fmt::Debug for ComputeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Script(_) => write!(f, "ComputeError::Script(..)"),
            ComputeError::Runtime(err) => f.debug_tuple("ComputeError::Runtime").field(err).finish(),
        }
    }
}

/// Fixed worker-thread pool with pre-created heaps. One spare heap beyond
/// the core count lets a submitter stage the next work item while every
/// worker is busy.
pub struct ComputePool<E: Engine> {
    config: HeapConfig<E>,
    num_cores: usize,
    num_heaps: usize,
    state: Mutex<PoolState<E>>,
    worker_conds: Box<[Condvar]>,
    /// Submitters wait here for finished or freed slots.
    done_cond: Condvar,
}

struct PoolState<E: Engine> {
    quit: bool,
    slots: Vec<Slot<E>>,
    active: VecDeque<usize>,
    inactive: Vec<usize>,
    finished: Vec<usize>,
}

struct Slot<E: Engine> {
    heap: E::Heap,
    job: Option<Job<E>>,
    finish: Option<Finish<E>>,
    outcome: Option<Outcome<E>>,
}

struct Job<E: Engine> {
    process: E::Value,
    data: E::Value,
    range: Option<Range>,
}

#[derive(Clone, Copy)]
struct Range {
    from: i32,
    to: i32,
    core_id: i32,
}

/// Finish callback, kept in the submitter's heap.
struct Finish<E: Engine> {
    func: E::Value,
    data: E::Value,
    heap: E::Heap,
}

enum Outcome<E: Engine> {
    Done(E::Value),
    ScriptError(E::Value),
    Failed(RuntimeError),
}

impl<E: Engine> ComputePool<E> {
    pub fn new(config: &HeapConfig<E>) -> Result<Arc<ComputePool<E>>, RuntimeError> {
        Self::with_cores(config, num_cpus::get())
    }

    pub fn with_cores(
        config: &HeapConfig<E>,
        num_cores: usize,
    ) -> Result<Arc<ComputePool<E>>, RuntimeError> {
        let num_cores = num_cores.max(1);
        let num_heaps = if num_cores > 1 { num_cores + 1 } else { 1 };
        let mut slots = Vec::with_capacity(num_heaps);
        let mut inactive = Vec::with_capacity(num_heaps);
        for index in 0..num_heaps {
            slots.push(Slot {
                heap: config.create_heap()?,
                job: None,
                finish: None,
                outcome: None,
            });
            inactive.push(index);
        }
        let pool = Arc::new(ComputePool {
            config: config.clone(),
            num_cores,
            num_heaps,
            state: Mutex::new(PoolState {
                quit: false,
                slots,
                active: VecDeque::new(),
                inactive,
                finished: Vec::new(),
            }),
            worker_conds: (0..num_cores).map(|_| Condvar::new()).collect(),
            done_cond: Condvar::new(),
        });
        for id in 0..num_cores {
            let worker = Arc::clone(&pool);
            thread::Builder::new()
                .name(format!("compute-{}", id))
                .spawn(move || worker.worker_main(id))
                .map_err(|_| RuntimeError::out_of_memory())?;
        }
        Ok(pool)
    }

    pub fn core_count(&self) -> usize {
        self.num_cores
    }

    /// Stops the workers once queued work drains. Submitted but unstarted
    /// work is discarded.
    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        st.quit = true;
        st.active.clear();
        drop(st);
        for cond in self.worker_conds.iter() {
            cond.notify_all();
        }
    }

    /// Submits `process(data)` to an idle slot, blocking while none is free
    /// and draining finished work in the meantime. The optional finish
    /// callback runs on a later drain in the submitter's thread.
    pub fn run(
        &self,
        caller: &E::Heap,
        process: &E::Value,
        data: &E::Value,
        finish: Option<(E::Value, E::Value)>,
    ) -> Result<(), ComputeError<E>> {
        self.run_inner(caller, process, data, finish, None)
    }

    fn run_inner(
        &self,
        caller: &E::Heap,
        process: &E::Value,
        data: &E::Value,
        finish: Option<(E::Value, E::Value)>,
        range: Option<Range>,
    ) -> Result<(), ComputeError<E>> {
        let engine = &self.config.engine;
        let mut st = self.state.lock();
        let index = loop {
            if !st.finished.is_empty() {
                self.drain_finished(&mut st, caller)?;
            }
            if let Some(index) = st.inactive.pop() {
                break index;
            }
            self.done_cond.wait(&mut st);
        };
        let slot_heap = st.slots[index].heap.clone();
        // the slot is reserved; clone without holding the pool lock
        let cloned = MutexGuard::unlocked(&mut st, || -> Result<_, RuntimeError> {
            let process = engine.clone_between(&slot_heap, caller, process, self.config.resolve)?;
            let data = engine.clone_between(&slot_heap, caller, data, self.config.resolve)?;
            Ok((process, data))
        });
        let (process, data) = match cloned {
            Ok(cloned) => cloned,
            Err(err) => {
                st.inactive.push(index);
                return Err(ComputeError::Runtime(err));
            }
        };
        st.slots[index].job = Some(Job {
            process,
            data,
            range,
        });
        st.slots[index].finish = finish.map(|(func, data)| Finish {
            func,
            data,
            heap: caller.clone(),
        });
        st.slots[index].outcome = None;
        st.active.push_back(index);
        for cond in self.worker_conds.iter() {
            cond.notify_one();
        }
        Ok(())
    }

    /// Drains finished work without submitting or blocking.
    pub fn check_finished(&self, caller: &E::Heap) -> Result<(), ComputeError<E>> {
        let mut st = self.state.lock();
        self.drain_finished(&mut st, caller)
    }

    /// Blocks until every slot is idle again, draining finished work and
    /// running finish callbacks along the way.
    pub fn finish_all(&self, caller: &E::Heap) -> Result<(), ComputeError<E>> {
        let mut st = self.state.lock();
        loop {
            self.drain_finished(&mut st, caller)?;
            if st.inactive.len() == self.num_heaps {
                return Ok(());
            }
            self.done_cond.wait(&mut st);
        }
    }

    /// Partitions `[from, to)` into contiguous sub-ranges and runs
    /// `process(data, from, to, core_id)` for each. Small ranges and
    /// single-core machines run synchronously in the caller with core 0;
    /// otherwise this blocks until every partition finished.
    pub fn run_parallel(
        &self,
        caller: &E::Heap,
        from: i32,
        to: i32,
        min_iters: i32,
        process: &E::Value,
        data: &E::Value,
    ) -> Result<(), ComputeError<E>> {
        if from >= to {
            return Ok(());
        }
        let engine = &self.config.engine;
        let min_iters = min_iters.max(1);
        let total = to - from;
        if total / 2 < min_iters || self.num_cores == 1 {
            let args = [
                data.clone(),
                engine.make_int(caller, from),
                engine.make_int(caller, to),
                engine.make_int(caller, 0),
            ];
            return match engine.call(caller, process, &args) {
                Ok(_) => Ok(()),
                Err(CallError::Script(err)) => Err(ComputeError::Script(err)),
                Err(CallError::Engine(err)) => Err(ComputeError::Runtime(err)),
            };
        }
        // pending finish callbacks must not interleave with the partitions
        self.finish_all(caller)?;
        let mut num_cores = self.num_cores as i32;
        if total < min_iters.saturating_mul(num_cores) {
            num_cores = (total / min_iters).max(1);
        }
        let iters_per_core = (total / num_cores).max(min_iters);
        let mut first_err = None;
        for core in 0..num_cores {
            let part_from = from + iters_per_core * core;
            let mut part_to = part_from.saturating_add(iters_per_core).min(to);
            if core == num_cores - 1 {
                part_to = to;
            }
            if part_from >= part_to {
                break;
            }
            let range = Range {
                from: part_from,
                to: part_to,
                core_id: core,
            };
            if let Err(err) = self.run_inner(caller, process, data, None, Some(range)) {
                first_err = Some(err);
                break;
            }
        }
        match self.finish_all(caller) {
            Ok(()) => match first_err {
                Some(err) => Err(err),
                None => Ok(()),
            },
            Err(err) => Err(first_err.unwrap_or(err)),
        }
    }

    /// Moves finished slots back to inactive, cloning results into finish
    /// callbacks and re-raising captured worker errors. Callbacks run with
    /// the pool unlocked.
    fn drain_finished(
        &self,
        st: &mut MutexGuard<'_, PoolState<E>>,
        caller: &E::Heap,
    ) -> Result<(), ComputeError<E>> {
        let engine = &self.config.engine;
        while let Some(index) = st.finished.pop() {
            let outcome = st.slots[index].outcome.take();
            let finish = st.slots[index].finish.take();
            let slot_heap = st.slots[index].heap.clone();
            st.inactive.push(index);
            self.done_cond.notify_all();
            match outcome {
                Some(Outcome::Done(value)) => {
                    if let Some(finish) = finish {
                        let result = engine
                            .clone_between(&finish.heap, &slot_heap, &value, self.config.resolve)
                            .map_err(ComputeError::Runtime)?;
                        engine.collect(&slot_heap);
                        let call = MutexGuard::unlocked(st, || {
                            engine.call(&finish.heap, &finish.func, &[finish.data.clone(), result])
                        });
                        match call {
                            Ok(_) => {}
                            Err(CallError::Script(err)) => return Err(ComputeError::Script(err)),
                            Err(CallError::Engine(err)) => return Err(ComputeError::Runtime(err)),
                        }
                    } else {
                        engine.collect(&slot_heap);
                    }
                }
                Some(Outcome::ScriptError(err)) => {
                    let cloned = engine
                        .clone_between(caller, &slot_heap, &err, Resolve::Existing)
                        .map_err(ComputeError::Runtime)?;
                    engine.collect(&slot_heap);
                    return Err(ComputeError::Script(cloned));
                }
                Some(Outcome::Failed(err)) => return Err(ComputeError::Runtime(err)),
                None => {}
            }
        }
        Ok(())
    }

    fn worker_main(self: Arc<Self>, id: usize) {
        let engine = Arc::clone(&self.config.engine);
        let mut st = self.state.lock();
        loop {
            while !st.quit && st.active.is_empty() {
                self.worker_conds[id].wait(&mut st);
            }
            if st.quit {
                break;
            }
            let index = match st.active.pop_front() {
                Some(index) => index,
                None => continue,
            };
            let job = match st.slots[index].job.take() {
                Some(job) => job,
                None => continue,
            };
            let heap = st.slots[index].heap.clone();
            drop(st);
            let args = match job.range {
                Some(range) => vec![
                    job.data.clone(),
                    engine.make_int(&heap, range.from),
                    engine.make_int(&heap, range.to),
                    engine.make_int(&heap, range.core_id),
                ],
                None => vec![job.data.clone()],
            };
            let result = engine.call(&heap, &job.process, &args);
            engine.collect(&heap);
            st = self.state.lock();
            st.slots[index].outcome = Some(match result {
                Ok(value) => Outcome::Done(value),
                Err(CallError::Script(err)) => Outcome::ScriptError(err),
                Err(CallError::Engine(err)) => Outcome::Failed(err),
            });
            st.finished.push(index);
            self.done_cond.notify_all();
        }
    }
}
