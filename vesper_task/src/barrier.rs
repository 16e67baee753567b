use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use vesper_core::{Engine, RuntimeError};

/// Fixed-party rendezvous. The arrival that completes a round wakes every
/// waiting slot; the epoch counter keeps late wakeups from a previous round
/// from being mistaken for the current one.
pub struct Barrier<E: Engine> {
    engine: Arc<E>,
    state: Mutex<BarrierState<E>>,
    /// One wake slot per possible waiter (parties - 1).
    slots: Box<[Condvar]>,
}

struct BarrierState<E: Engine> {
    num_waiting: usize,
    epoch: u64,
    /// Marker supplied by the first arrival of the current round, with the
    /// heap it lives in.
    marker: Option<(E::Heap, E::Value)>,
}

impl<E: Engine> Barrier<E> {
    pub fn new(engine: Arc<E>, parties: usize) -> Result<Arc<Barrier<E>>, RuntimeError> {
        if parties < 1 {
            return Err(RuntimeError::usage("barrier needs at least one party"));
        }
        Ok(Arc::new(Barrier {
            engine,
            state: Mutex::new(BarrierState {
                num_waiting: 0,
                epoch: 0,
                marker: None,
            }),
            slots: (0..parties - 1).map(|_| Condvar::new()).collect(),
        }))
    }

    pub fn parties(&self) -> usize {
        self.slots.len() + 1
    }

    /// Completed rounds so far.
    pub fn counter(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Blocks until all parties have arrived. All arrivals of one round must
    /// agree on the marker discipline: either every party passes a value
    /// equal to the first arrival's, or none does. A mismatch is returned
    /// immediately without disturbing parties already waiting.
    pub fn wait(&self, heap: &E::Heap, marker: Option<&E::Value>) -> Result<(), RuntimeError> {
        let max_waiting = self.slots.len();
        let mut st = self.state.lock();
        if st.num_waiting > 0 {
            let matches = match (&st.marker, marker) {
                (None, None) => true,
                (Some((marker_heap, first)), Some(mine)) => {
                    self.engine.equals(marker_heap, first, heap, mine)
                }
                _ => false,
            };
            if !matches {
                return Err(RuntimeError::usage("marker mismatch"));
            }
        } else {
            st.marker = marker.map(|value| (heap.clone(), value.clone()));
        }
        if st.num_waiting == max_waiting {
            st.num_waiting = 0;
            st.marker = None;
            st.epoch = st.epoch.wrapping_add(1);
            for slot in self.slots.iter() {
                slot.notify_one();
            }
            return Ok(());
        }
        let slot = st.num_waiting;
        st.num_waiting += 1;
        let epoch = st.epoch;
        while st.epoch == epoch {
            self.slots[slot].wait(&mut st);
        }
        Ok(())
    }
}
