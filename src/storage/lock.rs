//! Exclusive lock and per-op tokens.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ErrorCode, StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Locked,
    Blocklisted,
}

/// Single-writer lock over an image.
///
/// Writers take an op token with [`ExclusiveLock::start_op`] before sending a
/// mutation; the lock refuses to be released while tokens are outstanding.
#[derive(Debug)]
pub struct ExclusiveLock {
    state: Mutex<LockState>,
    in_flight: AtomicU64,
}

impl ExclusiveLock {
    /// Creates a lock that is already owned by this client.
    pub fn new_locked() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState::Locked),
            in_flight: AtomicU64::new(0),
        })
    }

    /// Creates a lock that is not owned yet.
    pub fn new_unlocked() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState::Unlocked),
            in_flight: AtomicU64::new(0),
        })
    }

    pub fn is_lock_owner(&self) -> bool {
        *self.state.lock() == LockState::Locked
    }

    /// Takes ownership of the lock.
    pub fn acquire(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        match *state {
            LockState::Blocklisted => Err(StorageError::new(ErrorCode::Blocklisted)),
            _ => {
                *state = LockState::Locked;
                Ok(())
            }
        }
    }

    /// Hands the lock off. Fails while ops are in flight.
    pub fn release(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        let in_flight = self.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            return Err(StorageError::with_message(
                ErrorCode::Busy,
                format!("{} ops in flight", in_flight),
            ));
        }
        if *state == LockState::Locked {
            *state = LockState::Unlocked;
        }
        Ok(())
    }

    /// Marks the client as blocklisted; the lock is lost in the background.
    pub fn blocklist(&self) {
        debug!("exclusive lock lost: client blocklisted");
        *self.state.lock() = LockState::Blocklisted;
    }

    /// Registers an in-flight op, or returns the error explaining why ops are
    /// not accepted.
    pub fn start_op(self: &Arc<Self>) -> StorageResult<LockOpGuard> {
        let state = self.state.lock();
        match *state {
            LockState::Locked => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                Ok(LockOpGuard {
                    lock: Some(self.clone()),
                })
            }
            LockState::Blocklisted => Err(StorageError::new(ErrorCode::Blocklisted)),
            LockState::Unlocked => Err(StorageError::new(ErrorCode::ReadOnly)),
        }
    }

    pub fn in_flight_ops(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Token held while one mutation is outstanding. Released on drop.
#[derive(Debug)]
#[must_use = "the op token is released as soon as it is dropped"]
pub struct LockOpGuard {
    lock: Option<Arc<ExclusiveLock>>,
}

impl LockOpGuard {
    /// Token for images without an exclusive lock.
    pub fn noop() -> Self {
        Self { lock: None }
    }
}

impl Drop for LockOpGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_tokens_block_release() {
        let lock = ExclusiveLock::new_locked();
        let guard = lock.start_op().unwrap();
        assert_eq!(lock.in_flight_ops(), 1);

        let err = lock.release().unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        assert!(lock.is_lock_owner());

        drop(guard);
        assert_eq!(lock.in_flight_ops(), 0);
        lock.release().unwrap();
        assert!(!lock.is_lock_owner());
    }

    #[test]
    fn test_start_op_without_lock() {
        let lock = ExclusiveLock::new_unlocked();
        assert_eq!(lock.start_op().unwrap_err().code, ErrorCode::ReadOnly);

        lock.acquire().unwrap();
        assert!(lock.start_op().is_ok());

        lock.blocklist();
        assert_eq!(lock.start_op().unwrap_err().code, ErrorCode::Blocklisted);
        assert_eq!(lock.acquire().unwrap_err().code, ErrorCode::Blocklisted);
    }

    #[test]
    fn test_noop_guard() {
        let guard = LockOpGuard::noop();
        drop(guard);
    }
}
