//! Simulated environment: a virtual clock and seeded randomness.
//!
//! Every node of a simulation shares one [`SimClock`] but draws entropy from
//! its own ChaCha stream, so a run is fully determined by its seed.

use std::{
    ops::{Add, Sub},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use cadet_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Point on the virtual timeline, measured from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Start of the run.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Time since the start of the run.
    pub fn since_start(self) -> Duration {
        self.0
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Shared virtual clock. Only moves forward.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    nanos: Arc<AtomicU64>,
}

impl SimClock {
    /// Clock at [`SimInstant::ZERO`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> SimInstant {
        SimInstant(Duration::from_nanos(self.nanos.load(Ordering::SeqCst)))
    }

    /// Move to `to`; earlier instants are ignored.
    pub fn advance_to(&self, to: SimInstant) {
        let target = u64::try_from(to.0.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_max(target, Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.advance_to(self.now() + by);
    }
}

/// Environment backed by a [`SimClock`] and a seeded ChaCha8 stream.
#[derive(Debug, Clone)]
pub struct SimEnv {
    clock: SimClock,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Environment with its own clock.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_clock(SimClock::new(), seed)
    }

    /// Environment sharing `clock` with other nodes.
    pub fn with_clock(clock: SimClock, seed: u64) -> Self {
        Self { clock, rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))) }
    }

    /// The clock this environment reads.
    pub fn clock(&self) -> &SimClock {
        &self.clock
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        self.clock.now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_array::<32>(), b.random_array::<32>());
        assert_ne!(a.random_array::<32>(), SimEnv::with_seed(43).random_array::<32>());
    }

    #[test]
    fn clock_is_shared_and_monotonic() {
        let clock = SimClock::new();
        let env = SimEnv::with_clock(clock.clone(), 1);
        clock.advance(Duration::from_secs(5));
        assert_eq!(env.now().since_start(), Duration::from_secs(5));

        clock.advance_to(SimInstant::ZERO);
        assert_eq!(env.now().since_start(), Duration::from_secs(5));
        assert_eq!(env.now() - SimInstant::ZERO, Duration::from_secs(5));
        assert_eq!(SimInstant::ZERO - env.now(), Duration::ZERO);
    }
}
