//! Bounded recently-seen nonce set for replay detection.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Remembers the last `capacity` `(scope, nonce)` pairs; the oldest entry is evicted first.
///
/// Safe to share between verifiers: [`NonceWindow::check_and_insert`] is a single atomic
/// insert-if-absent under one lock.
pub struct NonceWindow {
    capacity: usize,
    inner: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl NonceWindow {
    /// A zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Seen {
                keys: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Seen> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if the nonce was new in `scope` (and is now recorded), `false` on replay.
    pub fn check_and_insert(&self, scope: &str, nonce: &str) -> bool {
        let key = format!("{scope}:{nonce}");
        let mut seen = self.lock();
        if seen.keys.contains(&key) {
            return false;
        }

        while seen.order.len() >= self.capacity {
            match seen.order.pop_front() {
                Some(evicted) => {
                    seen.keys.remove(&evicted);
                }
                None => break,
            }
        }
        seen.keys.insert(key.clone());
        seen.order.push_back(key);
        true
    }

    pub fn contains(&self, scope: &str, nonce: &str) -> bool {
        self.lock().keys.contains(&format!("{scope}:{nonce}"))
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
