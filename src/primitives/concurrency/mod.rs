#![forbid(unsafe_code)]
//! Single-writer, multiple-reader lock protocol guarding a database handle.
//!
//! The lock is a counter: `0` is idle, `N > 0` means N read locks are held
//! and `-1` means the writer holds it. Readers that are blocked waiting for a
//! writer are counted separately so that a writer cannot slip in between a
//! writer release and the waiting readers being admitted.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::types::{NdError, Result};

const WRITE_LOCKED: i64 = -1;

/// Cooperative cancellation flag polled while waiting for the write lock.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, AtomicOrdering::Release);
    }

    /// Returns true once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(AtomicOrdering::Acquire)
    }
}

#[derive(Default, Debug)]
struct LockState {
    lock_count: i64,
    waiting_readers: u32,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Number of read locks currently held.
    pub readers: u32,
    /// Whether the write lock is held.
    pub writer: bool,
    /// Readers blocked while registering.
    pub waiting_readers: u32,
}

/// Outcome of a state transition, used by the caller to drive the store hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The lock went from idle to held.
    BecameLocked,
    /// The lock went from held to idle.
    BecameIdle,
    /// The lock stayed held (or stayed idle).
    Unchanged,
}

/// Counter-based read/write lock with cancellable writer acquisition.
pub struct NdLock {
    state: Mutex<LockState>,
    changed: Condvar,
    poll_interval: Duration,
    strict: bool,
}

impl NdLock {
    /// Creates an idle lock; writers waiting on it re-check cancellation every `poll_interval`.
    ///
    /// With `strict` set, releasing a lock that is not held or giving up more
    /// read locks than are held panics instead of being clamped.
    pub fn new(poll_interval: Duration, strict: bool) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
            poll_interval,
            strict,
        }
    }

    /// Blocks while a writer holds the lock, then registers one more reader.
    pub fn acquire_read(&self) -> Transition {
        let mut state = self.state.lock();
        state.waiting_readers += 1;
        while state.lock_count < 0 {
            self.changed.wait(&mut state);
        }
        state.waiting_readers -= 1;
        state.lock_count += 1;
        trace!(readers = state.lock_count, "lock.acquire_read");
        if state.lock_count == 1 {
            Transition::BecameLocked
        } else {
            Transition::Unchanged
        }
    }

    /// Drops one read lock.
    pub fn release_read(&self) -> Transition {
        let mut state = self.state.lock();
        if self.strict {
            assert!(state.lock_count > 0, "release_read without a read lock");
        }
        state.lock_count = state.lock_count.saturating_sub(1).max(0);
        trace!(readers = state.lock_count, "lock.release_read");
        if state.lock_count == 0 {
            self.changed.notify_all();
            Transition::BecameIdle
        } else {
            Transition::Unchanged
        }
    }

    /// Acquires the write lock after atomically giving up `give_up_read_locks`
    /// read locks held by the caller.
    ///
    /// Waits while any reader holds or is registering for the lock. When
    /// `cancel` fires during the wait, the given-up read locks are restored
    /// and [`NdError::OperationCancelled`] is returned.
    pub fn acquire_write(&self, give_up_read_locks: u32, cancel: &CancelToken) -> Result<()> {
        let mut state = self.state.lock();
        let give_up = i64::from(give_up_read_locks);
        if give_up > 0 {
            if self.strict {
                assert!(
                    state.lock_count >= give_up,
                    "writer gave up more read locks than are held"
                );
            }
            state.lock_count = (state.lock_count - give_up).max(0);
            self.changed.notify_all();
        }
        loop {
            if state.lock_count == 0 && state.waiting_readers == 0 {
                state.lock_count = WRITE_LOCKED;
                trace!("lock.acquire_write");
                return Ok(());
            }
            if cancel.is_cancelled() {
                while state.lock_count < 0 {
                    self.changed.wait(&mut state);
                }
                state.lock_count += give_up;
                trace!(restored = give_up, "lock.acquire_write cancelled");
                return Err(NdError::OperationCancelled);
            }
            self.changed.wait_for(&mut state, self.poll_interval);
        }
    }

    /// Releases the write lock, atomically converting it into
    /// `establish_read_locks` read locks.
    pub fn release_write(&self, establish_read_locks: u32) -> Transition {
        let mut state = self.state.lock();
        if self.strict {
            assert_eq!(state.lock_count, WRITE_LOCKED, "release_write without the write lock");
        }
        state.lock_count = i64::from(establish_read_locks);
        trace!(readers = state.lock_count, "lock.release_write");
        self.changed.notify_all();
        if establish_read_locks == 0 {
            Transition::BecameIdle
        } else {
            Transition::Unchanged
        }
    }

    /// Returns true while the write lock is held.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().lock_count == WRITE_LOCKED
    }

    /// Returns true while any lock is held.
    pub fn is_locked(&self) -> bool {
        self.state.lock().lock_count != 0
    }

    /// Returns a snapshot of the current lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            readers: u32::try_from(state.lock_count.max(0)).unwrap_or(u32::MAX),
            writer: state.lock_count == WRITE_LOCKED,
            waiting_readers: state.waiting_readers,
        }
    }
}
