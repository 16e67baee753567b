use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

/// Blocking discipline shared by every suspension point. Raw script-level
/// timeouts map as: negative = block forever, zero = poll without blocking,
/// positive = millisecond deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Forever,
    Poll,
    Millis(u32),
}

impl Wait {
    pub fn from_raw(timeout: i32) -> Wait {
        if timeout < 0 {
            Wait::Forever
        } else if timeout == 0 {
            Wait::Poll
        } else {
            Wait::Millis(timeout as u32)
        }
    }
}

/// Deadline computed once at entry and re-checked on every wake, so spurious
/// wakeups never extend the wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    until: Option<Instant>,
    poll: bool,
}

pub(crate) enum Remaining {
    Infinite,
    Expired,
    For(Duration),
}

impl Deadline {
    pub fn start(wait: Wait) -> Deadline {
        match wait {
            Wait::Forever => Deadline {
                until: None,
                poll: false,
            },
            Wait::Poll => Deadline {
                until: None,
                poll: true,
            },
            Wait::Millis(ms) => Deadline {
                until: Some(Instant::now() + Duration::from_millis(ms as u64)),
                poll: false,
            },
        }
    }

    pub fn remaining(&self) -> Remaining {
        if self.poll {
            return Remaining::Expired;
        }
        match self.until {
            None => Remaining::Infinite,
            Some(until) => {
                let now = Instant::now();
                if now >= until {
                    Remaining::Expired
                } else {
                    Remaining::For(until - now)
                }
            }
        }
    }
}

/// Blocks on `cond` according to the deadline. Returns false once the
/// deadline has expired; the caller re-checks its predicate on true.
pub(crate) fn wait_on<T: ?Sized>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: &Deadline,
) -> bool {
    match deadline.remaining() {
        Remaining::Infinite => {
            cond.wait(guard);
            true
        }
        Remaining::Expired => false,
        Remaining::For(left) => !cond.wait_for(guard, left).timed_out(),
    }
}
