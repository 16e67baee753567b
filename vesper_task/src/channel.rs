use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use vesper_core::{Engine, Resolve, RuntimeError};

use crate::channel_set::{notify_entry, unnotify_entry, SetEntry};
use crate::wait::{wait_on, Deadline, Wait};

/// Capability baked into a channel handle. `Owned` is held only by the
/// creating handle; copying it yields `Both` so capacity changes stay with
/// the original owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owned,
    Both,
    Sender,
    Receiver,
}

impl Role {
    pub fn can_send(self) -> bool {
        self != Role::Receiver
    }

    pub fn can_receive(self) -> bool {
        self != Role::Sender
    }
}

pub(crate) struct Shared<E: Engine> {
    engine: Arc<E>,
    state: Mutex<State<E>>,
    /// Senders wait here for queue space or a free rendezvous slot.
    send_cond: Condvar,
    /// A publishing sender waits here for its handoff to be claimed.
    send_cond2: Condvar,
    receive_cond: Condvar,
}

struct State<E: Engine> {
    strong: u32,
    weak: u32,
    size: usize,
    /// Buffered mode only; released once the strong count reaches zero.
    queue: Option<Queue<E>>,
    /// Rendezvous mode only: the single in-flight handoff.
    slot: Option<Handoff<E>>,
    next_token: u64,
    entries: Vec<Arc<SetEntry<E>>>,
}

struct Queue<E: Engine> {
    heap: E::Heap,
    items: VecDeque<E::Value>,
}

struct Handoff<E: Engine> {
    token: u64,
    heap: E::Heap,
    value: E::Value,
    /// Set by a receiver whose clone failed; observed by the sender.
    error: Option<RuntimeError>,
}

/// Reference-counted channel handle. Strong handles keep the buffered queue
/// alive; weak handles only keep the structure itself around for pending
/// notification bookkeeping.
pub struct ChannelRef<E: Engine> {
    shared: Arc<Shared<E>>,
    role: Role,
    strong: bool,
}

impl<E: Engine> ChannelRef<E> {
    /// `size` 0 creates a synchronous rendezvous channel; a positive size
    /// creates a bounded FIFO backed by a private queue heap.
    pub fn create(engine: Arc<E>, size: usize) -> Result<ChannelRef<E>, RuntimeError> {
        let queue = if size > 0 {
            Some(Queue {
                heap: engine.create_heap()?,
                items: VecDeque::new(),
            })
        } else {
            None
        };
        let shared = Arc::new(Shared {
            engine,
            state: Mutex::new(State {
                strong: 1,
                weak: 0,
                size,
                queue,
                slot: None,
                next_token: 1,
                entries: Vec::new(),
            }),
            send_cond: Condvar::new(),
            send_cond2: Condvar::new(),
            receive_cond: Condvar::new(),
        });
        Ok(ChannelRef {
            shared,
            role: Role::Owned,
            strong: true,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Mints a send-only strong handle.
    pub fn sender(&self) -> Result<ChannelRef<E>, RuntimeError> {
        if !self.role.can_send() {
            return Err(RuntimeError::capability(
                "receive-only channel handle cannot provide a sender",
            ));
        }
        self.shared.state.lock().strong += 1;
        Ok(ChannelRef {
            shared: Arc::clone(&self.shared),
            role: Role::Sender,
            strong: true,
        })
    }

    /// Mints a receive-only strong handle.
    pub fn receiver(&self) -> Result<ChannelRef<E>, RuntimeError> {
        if !self.role.can_receive() {
            return Err(RuntimeError::capability(
                "send-only channel handle cannot provide a receiver",
            ));
        }
        self.shared.state.lock().strong += 1;
        Ok(ChannelRef {
            shared: Arc::clone(&self.shared),
            role: Role::Receiver,
            strong: true,
        })
    }

    /// Weak handle: keeps the structure alive without keeping the queue
    /// alive. Used when a channel handle is stored inside another channel's
    /// queue heap.
    pub fn downgrade(&self) -> ChannelRef<E> {
        self.shared.state.lock().weak += 1;
        let role = if self.role == Role::Owned {
            Role::Both
        } else {
            self.role
        };
        ChannelRef {
            shared: Arc::clone(&self.shared),
            role,
            strong: false,
        }
    }

    /// (strong, weak) handle counts.
    pub fn shared_count(&self) -> (u32, u32) {
        let st = self.shared.state.lock();
        (st.strong, st.weak)
    }

    pub fn same_channel(&self, other: &ChannelRef<E>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.shared) as *const () as usize
    }

    pub(crate) fn engine(&self) -> &Arc<E> {
        &self.shared.engine
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().size
    }

    /// Changes the queue capacity. Only the owning handle of a buffered
    /// channel may do this.
    pub fn set_size(&self, new_size: usize) -> Result<(), RuntimeError> {
        if self.role != Role::Owned {
            return Err(RuntimeError::capability(
                "channel capacity can only be changed through the owning handle",
            ));
        }
        let mut st = self.shared.state.lock();
        if st.size == 0 {
            return Err(RuntimeError::usage(
                "synchronous channel has no queue capacity",
            ));
        }
        if new_size == 0 {
            return Err(RuntimeError::usage("queue capacity must be at least 1"));
        }
        st.size = new_size;
        drop(st);
        // blocked senders may now have room
        self.shared.send_cond.notify_all();
        Ok(())
    }

    /// Sends a clone of `value`. Returns false if the deadline expired
    /// before the send completed; a receiver-side clone failure on a
    /// rendezvous channel comes back as the receiver's transfer error.
    pub fn send(&self, from: &E::Heap, value: &E::Value, wait: Wait) -> Result<bool, RuntimeError> {
        if !self.role.can_send() {
            return Err(RuntimeError::capability("channel handle cannot send"));
        }
        let deadline = Deadline::start(wait);
        let st = self.shared.state.lock();
        if st.size == 0 {
            self.send_rendezvous(st, from, value, deadline)
        } else {
            self.send_queued(st, from, value, deadline)
        }
    }

    fn send_rendezvous(
        &self,
        mut st: MutexGuard<'_, State<E>>,
        from: &E::Heap,
        value: &E::Value,
        deadline: Deadline,
    ) -> Result<bool, RuntimeError> {
        // one handoff at a time: wait for the previous slot to clear
        while st.slot.is_some() {
            if !wait_on(&self.shared.send_cond, &mut st, &deadline) {
                return Ok(false);
            }
        }
        let token = st.next_token;
        st.next_token += 1;
        st.slot = Some(Handoff {
            token,
            heap: from.clone(),
            value: value.clone(),
            error: None,
        });
        self.shared.receive_cond.notify_one();
        notify_sets(&mut st);
        loop {
            let mine = st.slot.as_ref().map_or(false, |h| h.token == token);
            if !mine {
                // a receiver claimed the handoff; let the next sender in
                self.shared.send_cond.notify_one();
                return Ok(true);
            }
            if st.slot.as_ref().map_or(false, |h| h.error.is_some()) {
                let err = st
                    .slot
                    .take()
                    .and_then(|h| h.error)
                    .unwrap_or_else(|| RuntimeError::transfer("handoff failed"));
                unnotify_sets(&mut st);
                self.shared.send_cond.notify_one();
                return Err(err);
            }
            if !wait_on(&self.shared.send_cond2, &mut st, &deadline) {
                if st.slot.as_ref().map_or(false, |h| h.token == token) {
                    // unclaimed at the deadline: retract the handoff
                    st.slot = None;
                    unnotify_sets(&mut st);
                    self.shared.send_cond.notify_one();
                    return Ok(false);
                }
                self.shared.send_cond.notify_one();
                return Ok(true);
            }
        }
    }

    fn send_queued(
        &self,
        mut st: MutexGuard<'_, State<E>>,
        from: &E::Heap,
        value: &E::Value,
        deadline: Deadline,
    ) -> Result<bool, RuntimeError> {
        loop {
            let cap = st.size;
            let len = match st.queue.as_ref() {
                Some(queue) => queue.items.len(),
                None => {
                    return Err(RuntimeError::usage("channel queue has been released"));
                }
            };
            if len < cap {
                break;
            }
            if !wait_on(&self.shared.send_cond, &mut st, &deadline) {
                return Ok(false);
            }
        }
        let engine = Arc::clone(&self.shared.engine);
        match st.queue.as_mut() {
            Some(queue) => {
                let cloned = engine.clone_between(&queue.heap, from, value, Resolve::Existing)?;
                queue.items.push_back(cloned);
            }
            None => {
                return Err(RuntimeError::usage("channel queue has been released"));
            }
        }
        self.shared.receive_cond.notify_one();
        notify_sets(&mut st);
        Ok(true)
    }

    /// Receives into the caller's heap. `Ok(None)` means the deadline
    /// expired with nothing available.
    pub fn receive(&self, into: &E::Heap, wait: Wait) -> Result<Option<E::Value>, RuntimeError> {
        if !self.role.can_receive() {
            return Err(RuntimeError::capability("channel handle cannot receive"));
        }
        let deadline = Deadline::start(wait);
        let st = self.shared.state.lock();
        if st.size == 0 {
            self.receive_rendezvous(st, into, deadline)
        } else {
            self.receive_queued(st, into, deadline)
        }
    }

    fn receive_rendezvous(
        &self,
        mut st: MutexGuard<'_, State<E>>,
        into: &E::Heap,
        deadline: Deadline,
    ) -> Result<Option<E::Value>, RuntimeError> {
        let engine = Arc::clone(&self.shared.engine);
        loop {
            let pending = match st.slot.as_ref() {
                Some(handoff) if handoff.error.is_none() => {
                    Some((handoff.heap.clone(), handoff.value.clone()))
                }
                _ => None,
            };
            let (src_heap, value) = match pending {
                Some(p) => p,
                None => {
                    if !wait_on(&self.shared.receive_cond, &mut st, &deadline) {
                        return Ok(None);
                    }
                    continue;
                }
            };
            // the sender is blocked on send_cond2, so its heap is quiescent
            match engine.clone_between(into, &src_heap, &value, Resolve::Existing) {
                Ok(cloned) => {
                    st.slot = None;
                    unnotify_sets(&mut st);
                    self.shared.send_cond2.notify_one();
                    return Ok(Some(cloned));
                }
                Err(err) => {
                    // the sender observes the failure through the slot; only
                    // a transfer error lets the receiver keep waiting for
                    // the next handoff
                    if let Some(handoff) = st.slot.as_mut() {
                        handoff.error = Some(err.clone());
                    }
                    self.shared.send_cond2.notify_one();
                    if !err.is_transfer() {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn receive_queued(
        &self,
        mut st: MutexGuard<'_, State<E>>,
        into: &E::Heap,
        deadline: Deadline,
    ) -> Result<Option<E::Value>, RuntimeError> {
        let engine = Arc::clone(&self.shared.engine);
        loop {
            let action = {
                let queue = match st.queue.as_mut() {
                    Some(queue) => queue,
                    None => {
                        return Err(RuntimeError::usage("channel queue has been released"));
                    }
                };
                match queue.items.pop_front() {
                    Some(item) => {
                        let out =
                            engine.clone_between(into, &queue.heap, &item, Resolve::Existing);
                        engine.collect(&queue.heap);
                        Some((out, queue.items.is_empty()))
                    }
                    None => None,
                }
            };
            match action {
                Some((out, drained)) => {
                    if drained {
                        unnotify_sets(&mut st);
                    }
                    self.shared.send_cond.notify_one();
                    return out.map(Some);
                }
                None => {
                    if !wait_on(&self.shared.receive_cond, &mut st, &deadline) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Whether a receive would find something right now.
    pub(crate) fn has_pending(&self) -> bool {
        let st = self.shared.state.lock();
        if st.size == 0 {
            st.slot.as_ref().map_or(false, |h| h.error.is_none())
        } else {
            st.queue.as_ref().map_or(false, |q| !q.items.is_empty())
        }
    }

    pub(crate) fn register_entry(&self, entry: &Arc<SetEntry<E>>) {
        let mut st = self.shared.state.lock();
        st.entries.push(Arc::clone(entry));
        let pending = if st.size == 0 {
            st.slot.as_ref().map_or(false, |h| h.error.is_none())
        } else {
            st.queue.as_ref().map_or(false, |q| !q.items.is_empty())
        };
        if pending {
            notify_entry(entry);
        }
    }

    pub(crate) fn unregister_entry(&self, entry: &Arc<SetEntry<E>>) {
        let mut st = self.shared.state.lock();
        st.entries.retain(|e| !Arc::ptr_eq(e, entry));
    }
}

fn notify_sets<E: Engine>(st: &mut State<E>) {
    for entry in &st.entries {
        notify_entry(entry);
    }
}

fn unnotify_sets<E: Engine>(st: &mut State<E>) {
    for entry in &st.entries {
        unnotify_entry(entry);
    }
}

impl<E: Engine> Clone for ChannelRef<E> {
    fn clone(&self) -> Self {
        let mut st = self.shared.state.lock();
        if self.strong {
            st.strong += 1;
        } else {
            st.weak += 1;
        }
        let role = if self.role == Role::Owned {
            Role::Both
        } else {
            self.role
        };
        ChannelRef {
            shared: Arc::clone(&self.shared),
            role,
            strong: self.strong,
        }
    }
}

impl<E: Engine> Drop for ChannelRef<E> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        if self.strong {
            st.strong -= 1;
            if st.strong == 0 {
                // last strong handle: release the queue and its heap; weak
                // handles keep only the structure itself alive
                st.queue = None;
            }
        } else {
            st.weak -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_set::{ChannelSet, SetReceive};
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};
    use vesper_core::{CallError, LocalEngine, LocalHeap, Value};

    /// Delegates to the reference engine but fails any clone of the marker
    /// string with a non-transfer error.
    struct PoisonEngine {
        inner: Arc<LocalEngine>,
    }

    impl Engine for PoisonEngine {
        type Heap = LocalHeap;
        type Value = Value;

        fn create_heap(&self) -> Result<LocalHeap, RuntimeError> {
            self.inner.create_heap()
        }

        fn load(&self, heap: &LocalHeap, unit: &str) -> Result<(), RuntimeError> {
            self.inner.load(heap, unit)
        }

        fn get_function(
            &self,
            heap: &LocalHeap,
            unit: &str,
            name: &str,
        ) -> Result<Value, RuntimeError> {
            self.inner.get_function(heap, unit, name)
        }

        fn call(
            &self,
            heap: &LocalHeap,
            func: &Value,
            args: &[Value],
        ) -> Result<Value, CallError<Value>> {
            self.inner.call(heap, func, args)
        }

        fn clone_between(
            &self,
            dst: &LocalHeap,
            src: &LocalHeap,
            value: &Value,
            resolve: Resolve,
        ) -> Result<Value, RuntimeError> {
            if value.as_str() == Some("poison") {
                return Err(RuntimeError::engine("clone failed"));
            }
            self.inner.clone_between(dst, src, value, resolve)
        }

        fn serialize(&self, heap: &LocalHeap, value: &Value) -> Result<Vec<u8>, RuntimeError> {
            self.inner.serialize(heap, value)
        }

        fn deserialize(&self, heap: &LocalHeap, bytes: &[u8]) -> Result<Value, RuntimeError> {
            self.inner.deserialize(heap, bytes)
        }

        fn equals(&self, heap_a: &LocalHeap, a: &Value, heap_b: &LocalHeap, b: &Value) -> bool {
            self.inner.equals(heap_a, a, heap_b, b)
        }

        fn describe(&self, heap: &LocalHeap, value: &Value) -> String {
            self.inner.describe(heap, value)
        }

        fn set_context(&self, heap: &LocalHeap, context: Option<Arc<dyn Any + Send + Sync>>) {
            self.inner.set_context(heap, context)
        }

        fn context(&self, heap: &LocalHeap) -> Option<Arc<dyn Any + Send + Sync>> {
            self.inner.context(heap)
        }

        fn make_int(&self, heap: &LocalHeap, value: i32) -> Value {
            self.inner.make_int(heap, value)
        }

        fn as_int(&self, heap: &LocalHeap, value: &Value) -> Option<i32> {
            self.inner.as_int(heap, value)
        }
    }

    #[test]
    fn buffered_channel_is_fifo() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 8).unwrap();
        for n in 0..8 {
            assert!(ch.send(&heap, &Value::Int(n), Wait::Poll).unwrap());
        }
        for n in 0..8 {
            assert_eq!(
                ch.receive(&heap, Wait::Poll).unwrap(),
                Some(Value::Int(n))
            );
        }
        assert_eq!(ch.receive(&heap, Wait::Poll).unwrap(), None);
    }

    #[test]
    fn buffered_send_blocks_at_capacity() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        assert!(ch.send(&heap, &Value::Int(1), Wait::Poll).unwrap());
        assert!(!ch.send(&heap, &Value::Int(2), Wait::Poll).unwrap());
        assert_eq!(ch.receive(&heap, Wait::Poll).unwrap(), Some(Value::Int(1)));
        assert!(ch.send(&heap, &Value::Int(2), Wait::Poll).unwrap());
    }

    #[test]
    fn rendezvous_send_completes_only_after_receive() {
        let engine = LocalEngine::new();
        let ch = ChannelRef::create(Arc::clone(&engine), 0).unwrap();
        let received = Arc::new(AtomicBool::new(false));

        let receiver_ch = ch.clone();
        let receiver_engine = Arc::clone(&engine);
        let receiver_flag = Arc::clone(&received);
        let receiver = thread::spawn(move || {
            let heap = receiver_engine.create_heap().unwrap();
            thread::sleep(Duration::from_millis(100));
            receiver_flag.store(true, Ordering::SeqCst);
            receiver_ch.receive(&heap, Wait::Forever).unwrap()
        });

        let heap = engine.create_heap().unwrap();
        assert!(ch.send(&heap, &Value::Int(7), Wait::Forever).unwrap());
        // happens-before: the receive observed the value before send returned
        assert!(received.load(Ordering::SeqCst));
        assert_eq!(receiver.join().unwrap(), Some(Value::Int(7)));
    }

    #[test]
    fn rendezvous_sends_serialize() {
        let engine = LocalEngine::new();
        let ch = ChannelRef::create(Arc::clone(&engine), 0).unwrap();

        let mut senders = Vec::new();
        for n in 0..2 {
            let sender_ch = ch.clone();
            let sender_engine = Arc::clone(&engine);
            senders.push(thread::spawn(move || {
                let heap = sender_engine.create_heap().unwrap();
                sender_ch.send(&heap, &Value::Int(n), Wait::Forever).unwrap()
            }));
        }

        let heap = engine.create_heap().unwrap();
        thread::sleep(Duration::from_millis(50));
        let first = ch.receive(&heap, Wait::Forever).unwrap();
        let second = ch.receive(&heap, Wait::Forever).unwrap();
        let mut got: Vec<i32> = [first, second]
            .into_iter()
            .map(|v| v.and_then(|v| v.as_int()).expect("int message"))
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1]);
        for sender in senders {
            assert!(sender.join().unwrap());
        }
    }

    #[test]
    fn receive_timeout_returns_none_in_window() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 0).unwrap();
        let started = Instant::now();
        assert_eq!(ch.receive(&heap, Wait::Millis(50)).unwrap(), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[test]
    fn clone_failure_reaches_the_sender() {
        let engine = LocalEngine::new();
        let ch = ChannelRef::create(Arc::clone(&engine), 0).unwrap();

        let receiver_ch = ch.clone();
        let receiver_engine = Arc::clone(&engine);
        let receiver = thread::spawn(move || {
            let heap = receiver_engine.create_heap().unwrap();
            // unresolvable function reference: clone into receiver heap fails
            receiver_ch.receive(&heap, Wait::Millis(500)).unwrap()
        });

        let heap = engine.create_heap().unwrap();
        let msg = Value::func("ghost", "f");
        let err = ch.send(&heap, &msg, Wait::Forever).unwrap_err();
        assert!(err.is_transfer());
        // the receiver keeps waiting and eventually times out
        assert_eq!(receiver.join().unwrap(), None);
    }

    #[test]
    fn timed_out_rendezvous_send_retracts_the_handoff() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 0).unwrap();
        let set = ChannelSet::new();
        set.add(&ch, &heap, &Value::str("k")).unwrap();

        assert!(!ch.send(&heap, &Value::Int(1), Wait::Millis(50)).unwrap());
        // the retracted handoff left nothing behind for the set
        match set.receive(&heap, Wait::Poll).unwrap() {
            SetReceive::TimedOut => {}
            _ => panic!("retracted handoff was still reported"),
        }
        assert_eq!(ch.receive(&heap, Wait::Poll).unwrap(), None);
    }

    #[test]
    fn engine_clone_failure_fails_both_sides() {
        let engine = Arc::new(PoisonEngine {
            inner: LocalEngine::new(),
        });
        let ch = ChannelRef::create(Arc::clone(&engine), 0).unwrap();

        let receiver_ch = ch.clone();
        let receiver_engine = Arc::clone(&engine);
        let receiver = thread::spawn(move || {
            let heap = receiver_engine.create_heap().unwrap();
            receiver_ch.receive(&heap, Wait::Forever)
        });

        let heap = engine.create_heap().unwrap();
        // the sender must not report success for an undelivered value
        let err = ch
            .send(&heap, &Value::str("poison"), Wait::Forever)
            .unwrap_err();
        assert!(!err.is_transfer());
        assert!(receiver.join().unwrap().is_err());
    }

    #[test]
    fn capability_views_reject_wrong_direction() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        let tx = ch.sender().unwrap();
        let rx = ch.receiver().unwrap();
        assert!(tx.receive(&heap, Wait::Poll).is_err());
        assert!(rx.send(&heap, &Value::Int(1), Wait::Poll).is_err());
        assert!(tx.send(&heap, &Value::Int(1), Wait::Poll).unwrap());
        assert_eq!(rx.receive(&heap, Wait::Poll).unwrap(), Some(Value::Int(1)));
        // a sender view cannot mint a receiver
        assert!(tx.receiver().is_err());
    }

    #[test]
    fn owned_degrades_to_both_on_copy() {
        let engine = LocalEngine::new();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        let copy = ch.clone();
        assert_eq!(ch.role(), Role::Owned);
        assert_eq!(copy.role(), Role::Both);
        assert!(copy.set_size(4).is_err());
        assert!(ch.set_size(4).is_ok());
        assert_eq!(ch.size(), 4);
    }

    #[test]
    fn set_size_rejects_rendezvous_channels() {
        let engine = LocalEngine::new();
        let ch = ChannelRef::create(Arc::clone(&engine), 0).unwrap();
        assert!(ch.set_size(4).is_err());
    }

    #[test]
    fn shared_counts_track_strong_and_weak() {
        let engine = LocalEngine::new();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        assert_eq!(ch.shared_count(), (1, 0));
        let tx = ch.sender().unwrap();
        let weak = ch.downgrade();
        assert_eq!(ch.shared_count(), (2, 1));
        drop(tx);
        drop(weak);
        assert_eq!(ch.shared_count(), (1, 0));
    }
}
