//! Salt replay cache
//!
//! One cache is shared by every port of the process. It remembers the most
//! recent `capacity` salts; inserting beyond that evicts the oldest one.
//! A capacity of zero disables replay protection entirely.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct ReplayState {
    seen: HashSet<Bytes>,
    order: VecDeque<Bytes>,
}

/// Bounded FIFO set of previously seen salts
#[derive(Debug)]
pub struct ReplayCache {
    capacity: usize,
    state: Mutex<ReplayState>,
}

impl ReplayCache {
    /// Create a cache that remembers up to `capacity` salts
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(ReplayState {
                seen: HashSet::with_capacity(capacity.min(1 << 16)),
                order: VecDeque::with_capacity(capacity.min(1 << 16)),
            }),
        }
    }

    /// Cache that never reports a replay
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Whether replay protection is on
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Configured history size
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `salt`, returning `true` if it was new and `false` on a replay
    pub fn check_and_record(&self, salt: &[u8]) -> bool {
        if self.capacity == 0 {
            return true;
        }

        let mut state = self.state.lock();
        if state.seen.contains(salt) {
            return false;
        }

        let salt = Bytes::copy_from_slice(salt);
        while state.order.len() >= self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }
        state.seen.insert(salt.clone());
        state.order.push_back(salt);
        true
    }

    /// Whether `salt` is currently remembered, without recording it
    #[must_use]
    pub fn contains(&self, salt: &[u8]) -> bool {
        self.capacity > 0 && self.state.lock().seen.contains(salt)
    }

    /// Number of salts currently remembered
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    /// Whether no salts are remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
