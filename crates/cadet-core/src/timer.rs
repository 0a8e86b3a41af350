//! Deadline queue with cancellation by token.
//!
//! Every retry, timeout and keepalive in a tunnel is an entry keyed by a
//! token. Scheduling a token that is already present moves it; cancelling
//! removes it. The dispatcher pops expired tokens in deadline order.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    time::Duration,
};

/// Upper bound for [`std_backoff`].
pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Standard exponential backoff: double, at least 1ms, at most 15 minutes.
pub fn std_backoff(delay: Duration) -> Duration {
    delay.saturating_mul(2).clamp(Duration::from_millis(1), MAX_BACKOFF)
}

/// Priority queue of `(deadline, token)` pairs.
#[derive(Debug, Clone)]
pub struct TimerQueue<I, T> {
    /// Ordered by deadline, then insertion sequence
    entries: BTreeMap<(I, u64), T>,
    /// Token to its key in `entries`
    index: HashMap<T, (I, u64)>,
    next_seq: u64,
}

impl<I, T> Default for TimerQueue<I, T> {
    fn default() -> Self {
        Self { entries: BTreeMap::new(), index: HashMap::new(), next_seq: 0 }
    }
}

impl<I, T> TimerQueue<I, T>
where
    I: Copy + Ord,
    T: Copy + Eq + Hash,
{
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `token` at `deadline`, replacing any earlier schedule.
    pub fn schedule(&mut self, token: T, deadline: I) {
        self.cancel(&token);
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, token);
        self.index.insert(token, key);
    }

    /// Schedule `token` unless it is already scheduled.
    pub fn schedule_if_absent(&mut self, token: T, deadline: I) {
        if !self.index.contains_key(&token) {
            self.schedule(token, deadline);
        }
    }

    /// Remove `token`. Returns whether it was scheduled.
    pub fn cancel(&mut self, token: &T) -> bool {
        let Some(key) = self.index.remove(token) else {
            return false;
        };
        self.entries.remove(&key);
        true
    }

    /// Remove every token matching `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&T) -> bool) {
        let doomed: Vec<T> = self.index.keys().filter(|t| predicate(t)).copied().collect();
        for token in doomed {
            self.cancel(&token);
        }
    }

    /// Earliest deadline in the queue.
    pub fn next_deadline(&self) -> Option<I> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest token whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: I) -> Option<T> {
        let (&key, &token) = self.entries.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key);
        self.index.remove(&token);
        Some(token)
    }

    /// Number of scheduled tokens.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
