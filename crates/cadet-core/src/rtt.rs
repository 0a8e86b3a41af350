//! Round-trip estimate feeding the retransmission timer.

use std::time::Duration;

/// Samples beyond this count stop reducing the weight of new ones.
const MAX_WEIGHT: u32 = 7;

/// Exponentially weighted moving average of round-trip times.
///
/// Early samples count fully; later ones are folded in with weight
/// `1 / (MAX_WEIGHT + 1)` so a single outlier cannot swing the estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttEstimator {
    aged: Option<Duration>,
    samples: u32,
}

impl RttEstimator {
    /// Fold in one sample.
    pub fn observe(&mut self, sample: Duration) {
        let weight = self.samples.min(MAX_WEIGHT);
        self.aged = Some(match self.aged {
            None => sample,
            Some(aged) => (aged * weight + sample) / (weight + 1),
        });
        self.samples = self.samples.saturating_add(1);
    }

    /// Current estimate, `None` before the first sample.
    pub fn estimate(&self) -> Option<Duration> {
        self.aged
    }

    /// Number of samples seen.
    pub fn samples(&self) -> u32 {
        self.samples
    }
}
