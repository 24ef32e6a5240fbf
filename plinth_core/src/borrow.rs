use crate::interner::InternedString;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Access counter for one record or storage: any number of concurrent
/// readers or exactly one writer, maintained with compare-and-swap so
/// accesses can be opened from worker threads without a lock.
pub struct AccessState {
    state: AtomicI32,
}

const WRITER: i32 = -1;

impl AccessState {
    pub const fn new() -> Self {
        AccessState {
            state: AtomicI32::new(0),
        }
    }

    pub fn try_read(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return false;
            }

            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn try_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    pub fn release_write(&self) {
        let previous = self.state.swap(0, Ordering::AcqRel);
        debug_assert_eq!(previous, WRITER);
    }

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }
}

impl Default for AccessState {
    fn default() -> Self {
        AccessState::new()
    }
}

/// Reports an access conflict once per storage site, so a hot loop hitting
/// the same conflict does not flood the log.
pub struct ConflictLatch {
    logged: AtomicBool,
}

impl ConflictLatch {
    pub const fn new() -> Self {
        ConflictLatch {
            logged: AtomicBool::new(false),
        }
    }

    pub fn report(&self, storage: InternedString, operation: &str) {
        if !self.logged.swap(true, Ordering::Relaxed) {
            tracing::error!(
                storage = storage.as_str(),
                operation,
                "access conflict: record already has an incompatible live access"
            );
        }
    }
}

impl Default for ConflictLatch {
    fn default() -> Self {
        ConflictLatch::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share() {
        let state = AccessState::new();
        assert!(state.try_read());
        assert!(state.try_read());
        assert!(!state.try_write());
        state.release_read();
        state.release_read();
        assert!(state.try_write());
    }

    #[test]
    fn writer_excludes_all() {
        let state = AccessState::new();
        assert!(state.try_write());
        assert!(!state.try_read());
        assert!(!state.try_write());
        state.release_write();
        assert!(state.try_read());
    }

    #[test]
    fn contended_single_writer() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let state = Arc::new(AccessState::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if state.try_write() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
