//! Decides when the user has finished speaking.
//!
//! The detector keeps a `silence_start` mark. Every energy sample below the
//! threshold starts (or continues) the silence timer, every sample at or above it
//! clears the timer. Once the timer has run for `silence_duration` the detector
//! reports [`SpeechEnd::Silence`]. Independently, a hard ceiling measured from the
//! start of listening reports [`SpeechEnd::Ceiling`] no matter what the input
//! sounds like. Either signal fires exactly once.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::level::{AudioEnergySample, AudioLevelSampler};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceConfig {
    pub threshold_rms: f32,
    /// `None` disables silence detection; only the ceiling ends the turn.
    pub silence_duration: Option<Duration>,
    pub max_duration: Duration,
}

/// Why listening ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEnd {
    Silence,
    Ceiling,
}

#[derive(Debug)]
pub struct SilenceDetector {
    config: SilenceConfig,
    started_at: Instant,
    silence_start: Option<Instant>,
    fired: bool,
}

impl SilenceDetector {
    #[must_use]
    pub const fn new(config: SilenceConfig, started_at: Instant) -> Self {
        Self {
            config,
            started_at,
            silence_start: None,
            fired: false,
        }
    }

    /// Feed one energy sample. Returns `Some` exactly once, on the sample that ends
    /// the utterance.
    pub fn observe(&mut self, sample: AudioEnergySample) -> Option<SpeechEnd> {
        if self.fired {
            return None;
        }

        if let Some(window) = self.config.silence_duration {
            if sample.rms < self.config.threshold_rms {
                let start = *self.silence_start.get_or_insert(sample.at);
                if sample.at.saturating_duration_since(start) >= window {
                    return self.fire(SpeechEnd::Silence);
                }
            } else {
                self.silence_start = None;
            }
        }

        if sample.at.saturating_duration_since(self.started_at) >= self.config.max_duration {
            return self.fire(SpeechEnd::Ceiling);
        }

        None
    }

    const fn fire(&mut self, end: SpeechEnd) -> Option<SpeechEnd> {
        self.fired = true;
        Some(end)
    }
}

/// Sample the input until the detector fires or the token is cancelled.
/// Returns `None` on cancellation.
pub async fn watch_for_speech_end(
    mut sampler: AudioLevelSampler,
    mut detector: SilenceDetector,
    cancel: CancellationToken,
) -> Option<SpeechEnd> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            sample = sampler.next() => {
                if let Some(end) = detector.observe(sample) {
                    tracing::debug!("speech ended: {end:?}");
                    return Some(end);
                }
            }
        }
    }
}
