use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::LevelSource;

/// Root-mean-square of a buffer of samples in `-1.0..=1.0`.
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Latest input loudness, written from the audio callback and read by the sampler.
/// Stored as raw `f32` bits so neither side ever takes a lock.
#[derive(Debug, Default)]
pub struct LevelMeter {
    bits: AtomicU32,
}

impl LevelMeter {
    pub fn store(&self, rms: f32) {
        self.bits.store(rms.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.store(0.0);
    }
}

impl LevelSource for LevelMeter {
    fn current_rms(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// One reading of input energy, taken at a sampling tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioEnergySample {
    pub rms: f32,
    pub at: Instant,
}

/// Reads the live input level once per tick.
pub struct AudioLevelSampler {
    source: Arc<dyn LevelSource>,
    interval: Interval,
}

impl AudioLevelSampler {
    #[must_use]
    pub fn new(source: Arc<dyn LevelSource>, tick: Duration) -> Self {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { source, interval }
    }

    /// Wait for the next tick and read the level. The first call returns immediately.
    pub async fn next(&mut self) -> AudioEnergySample {
        let at = self.interval.tick().await;
        AudioEnergySample {
            rms: self.source.current_rms().clamp(0.0, 1.0),
            at,
        }
    }
}
