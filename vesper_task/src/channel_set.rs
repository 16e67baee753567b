use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use vesper_core::{Engine, Resolve, RuntimeError};

use crate::channel::ChannelRef;
use crate::wait::{wait_on, Deadline, Wait};

/// Registration of one channel in one set. Reachable from the set's table
/// and, while data is pending, from the set's notify list; the channel keeps
/// its own list of registered entries for signalling.
pub(crate) struct SetEntry<E: Engine> {
    set: Weak<SetInner<E>>,
    pub(crate) channel: ChannelRef<E>,
    key_heap: E::Heap,
    key: E::Value,
}

/// Marks the entry as having pending work. An entry appears in the notify
/// list at most once no matter how many times it is signalled.
///
/// Lock order: the caller may hold the channel mutex; the set mutex is
/// always taken second.
pub(crate) fn notify_entry<E: Engine>(entry: &Arc<SetEntry<E>>) {
    if let Some(set) = entry.set.upgrade() {
        let mut st = set.state.lock();
        if !st.notify.iter().any(|e| Arc::ptr_eq(e, entry)) {
            st.notify.push(Arc::clone(entry));
            set.cond.notify_one();
        }
    }
}

pub(crate) fn unnotify_entry<E: Engine>(entry: &Arc<SetEntry<E>>) {
    if let Some(set) = entry.set.upgrade() {
        let mut st = set.state.lock();
        st.notify.retain(|e| !Arc::ptr_eq(e, entry));
    }
}

/// Multiplexed receive across a dynamic set of channels ("select").
pub struct ChannelSet<E: Engine> {
    inner: Arc<SetInner<E>>,
}

pub(crate) struct SetInner<E: Engine> {
    state: Mutex<SetState<E>>,
    cond: Condvar,
}

struct SetState<E: Engine> {
    /// Registrations, keyed by channel identity.
    entries: HashMap<usize, Arc<SetEntry<E>>>,
    /// Entries with pending work, each present at most once.
    notify: Vec<Arc<SetEntry<E>>>,
}

/// Outcome of a multiplexed receive.
pub enum SetReceive<E: Engine> {
    Message { key: E::Value, value: E::Value },
    Error { key: E::Value, error: RuntimeError },
    TimedOut,
}

impl<E: Engine> ChannelSet<E> {
    pub fn new() -> ChannelSet<E> {
        ChannelSet {
            inner: Arc::new(SetInner {
                state: Mutex::new(SetState {
                    entries: HashMap::new(),
                    notify: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Registers a receive-capable channel under a caller-chosen key. If
    /// the channel already holds data the set is notified immediately.
    pub fn add(
        &self,
        channel: &ChannelRef<E>,
        key_heap: &E::Heap,
        key: &E::Value,
    ) -> Result<(), RuntimeError> {
        if !channel.role().can_receive() {
            return Err(RuntimeError::capability(
                "send-only channel cannot be added to a channel set",
            ));
        }
        let entry = Arc::new(SetEntry {
            set: Arc::downgrade(&self.inner),
            channel: channel.clone(),
            key_heap: key_heap.clone(),
            key: key.clone(),
        });
        {
            let mut st = self.inner.state.lock();
            if st.entries.contains_key(&channel.identity()) {
                return Err(RuntimeError::usage("channel is already added"));
            }
            st.entries.insert(channel.identity(), Arc::clone(&entry));
        }
        channel.register_entry(&entry);
        // a concurrent remove between the table insert and the channel-side
        // registration found nothing to unregister; undo it here
        let still_present = {
            let st = self.inner.state.lock();
            st.entries
                .get(&channel.identity())
                .map_or(false, |e| Arc::ptr_eq(e, &entry))
        };
        if !still_present {
            channel.unregister_entry(&entry);
            let mut st = self.inner.state.lock();
            st.notify.retain(|e| !Arc::ptr_eq(e, &entry));
        }
        Ok(())
    }

    pub fn remove(&self, channel: &ChannelRef<E>) -> Result<(), RuntimeError> {
        let entry = {
            let mut st = self.inner.state.lock();
            let entry = match st.entries.remove(&channel.identity()) {
                Some(entry) => entry,
                None => {
                    return Err(RuntimeError::usage("channel is not present in the set"));
                }
            };
            st.notify.retain(|e| !Arc::ptr_eq(e, &entry));
            entry
        };
        entry.channel.unregister_entry(&entry);
        Ok(())
    }

    /// Drains the notify list with non-blocking polls until one channel
    /// yields data or raises, then blocks on the set's condvar up to the
    /// deadline. Channels that turn out to be empty stay in the notify list
    /// and are skipped this pass.
    pub fn receive(&self, into: &E::Heap, wait: Wait) -> Result<SetReceive<E>, RuntimeError> {
        let deadline = Deadline::start(wait);
        let mut st = self.inner.state.lock();
        loop {
            let mut index = 0;
            loop {
                let entry = match st.notify.get(index) {
                    Some(entry) => Arc::clone(entry),
                    None => break,
                };
                index += 1;
                drop(st);
                let polled = entry.channel.receive(into, Wait::Poll);
                match polled {
                    Ok(Some(value)) => {
                        let key = self.clone_key(&entry, into)?;
                        return Ok(SetReceive::Message { key, value });
                    }
                    Err(error) => {
                        let key = self.clone_key(&entry, into)?;
                        return Ok(SetReceive::Error { key, error });
                    }
                    Ok(None) => {}
                }
                st = self.inner.state.lock();
            }
            if !wait_on(&self.inner.cond, &mut st, &deadline) {
                return Ok(SetReceive::TimedOut);
            }
        }
    }

    fn clone_key(
        &self,
        entry: &Arc<SetEntry<E>>,
        into: &E::Heap,
    ) -> Result<E::Value, RuntimeError> {
        entry
            .channel
            .engine()
            .clone_between(into, &entry.key_heap, &entry.key, Resolve::Existing)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }
}

impl<E: Engine> Clone for ChannelSet<E> {
    fn clone(&self) -> Self {
        ChannelSet {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Engine> Default for ChannelSet<E> {
    fn default() -> Self {
        ChannelSet::new()
    }
}

impl<E: Engine> Drop for SetInner<E> {
    fn drop(&mut self) {
        // deregister from every member channel so no channel keeps pushing
        // notifications for a dead set
        let st = self.state.get_mut();
        for entry in st.entries.values() {
            entry.channel.unregister_entry(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};
    use vesper_core::{LocalEngine, Value};

    #[test]
    fn returns_the_ready_channel_without_touching_others() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let a = ChannelRef::create(Arc::clone(&engine), 4).unwrap();
        let b = ChannelRef::create(Arc::clone(&engine), 4).unwrap();
        let set = ChannelSet::new();
        set.add(&a, &heap, &Value::str("a")).unwrap();
        set.add(&b, &heap, &Value::str("b")).unwrap();

        assert!(b.send(&heap, &Value::Int(9), Wait::Poll).unwrap());
        match set.receive(&heap, Wait::Millis(1000)).unwrap() {
            SetReceive::Message { key, value } => {
                assert_eq!(key, Value::str("b"));
                assert_eq!(value, Value::Int(9));
            }
            _ => panic!("expected a message from b"),
        }
    }

    #[test]
    fn duplicate_add_is_an_error() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        let set = ChannelSet::new();
        set.add(&ch, &heap, &Value::Int(1)).unwrap();
        assert!(set.add(&ch, &heap, &Value::Int(2)).is_err());
        // a second view of the same channel is still the same channel
        let rx = ch.receiver().unwrap();
        assert!(set.add(&rx, &heap, &Value::Int(3)).is_err());
    }

    #[test]
    fn sender_views_are_rejected() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        let tx = ch.sender().unwrap();
        let set = ChannelSet::new();
        assert!(set.add(&tx, &heap, &Value::Int(1)).is_err());
    }

    #[test]
    fn remove_absent_channel_is_an_error() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        let set = ChannelSet::new();
        assert!(set.remove(&ch).is_err());
        set.add(&ch, &heap, &Value::Int(1)).unwrap();
        assert!(set.remove(&ch).is_ok());
        assert!(set.remove(&ch).is_err());
    }

    #[test]
    fn add_notices_already_pending_data() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 2).unwrap();
        assert!(ch.send(&heap, &Value::Int(5), Wait::Poll).unwrap());
        let set = ChannelSet::new();
        set.add(&ch, &heap, &Value::str("k")).unwrap();
        match set.receive(&heap, Wait::Poll).unwrap() {
            SetReceive::Message { key, value } => {
                assert_eq!(key, Value::str("k"));
                assert_eq!(value, Value::Int(5));
            }
            _ => panic!("expected pending data"),
        }
    }

    #[test]
    fn blocks_until_a_member_delivers() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        let set = ChannelSet::new();
        set.add(&ch, &heap, &Value::str("k")).unwrap();

        let sender_ch = ch.clone();
        let sender_engine = Arc::clone(&engine);
        let sender = thread::spawn(move || {
            let heap = sender_engine.create_heap().unwrap();
            thread::sleep(Duration::from_millis(80));
            sender_ch.send(&heap, &Value::Int(1), Wait::Forever).unwrap()
        });

        match set.receive(&heap, Wait::Millis(2000)).unwrap() {
            SetReceive::Message { value, .. } => assert_eq!(value, Value::Int(1)),
            _ => panic!("expected a message"),
        }
        assert!(sender.join().unwrap());
    }

    #[test]
    fn concurrent_add_and_remove_leave_no_stale_registration() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let ch = ChannelRef::create(Arc::clone(&engine), 1).unwrap();
        let set = ChannelSet::new();

        let adder_set = set.clone();
        let adder_ch = ch.clone();
        let adder_engine = Arc::clone(&engine);
        let adder = thread::spawn(move || {
            let heap = adder_engine.create_heap().unwrap();
            for _ in 0..200 {
                let _ = adder_set.add(&adder_ch, &heap, &Value::Int(1));
            }
        });
        let remover_set = set.clone();
        let remover_ch = ch.clone();
        let remover = thread::spawn(move || {
            for _ in 0..200 {
                let _ = remover_set.remove(&remover_ch);
            }
        });
        adder.join().unwrap();
        remover.join().unwrap();

        // whatever the final state, a removed channel must not signal the set
        let _ = set.remove(&ch);
        assert!(ch.send(&heap, &Value::Int(9), Wait::Poll).unwrap());
        match set.receive(&heap, Wait::Poll).unwrap() {
            SetReceive::TimedOut => {}
            _ => panic!("stale registration delivered after removal"),
        }
    }

    #[test]
    fn empty_set_receive_times_out() {
        let engine = LocalEngine::new();
        let heap = engine.create_heap().unwrap();
        let set: ChannelSet<LocalEngine> = ChannelSet::new();
        let started = Instant::now();
        match set.receive(&heap, Wait::Millis(50)).unwrap() {
            SetReceive::TimedOut => {}
            _ => panic!("expected timeout"),
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
