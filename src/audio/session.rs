use std::sync::Arc;

use super::buffer::{AudioBlob, CaptureBuffer};
use super::{InputDevice, LevelSource, LiveInput};
use crate::error::{Result, VoxError};
use crate::gate::MediaGate;

/// Owns the microphone and the record/stop lifecycle.
///
/// The device handle stays acquired across record/stop cycles so the user is not
/// asked for permission every turn; `close()` releases it.
pub struct AudioCaptureSession {
    device: Box<dyn InputDevice>,
    live: Option<Box<dyn LiveInput>>,
    buffer: Option<CaptureBuffer>,
    gate: Arc<MediaGate>,
    min_blob_bytes: usize,
}

impl AudioCaptureSession {
    #[must_use]
    pub fn new(device: Box<dyn InputDevice>, gate: Arc<MediaGate>, min_blob_bytes: usize) -> Self {
        Self {
            device,
            live: None,
            buffer: None,
            gate,
            min_blob_bytes,
        }
    }

    /// Acquire the microphone if not already held, and hand back its level source.
    pub fn open(&mut self) -> Result<Arc<dyn LevelSource>> {
        if let Some(live) = &self.live {
            return Ok(live.level());
        }
        let live = self.device.open()?;
        let level = live.level();
        self.live = Some(live);
        Ok(level)
    }

    /// Begin recording. Returns `false` without doing anything if a recording is
    /// already running or if playback holds the speaker.
    pub fn start(&mut self) -> Result<bool> {
        if self.buffer.is_some() {
            tracing::debug!("capture: already recording");
            return Ok(false);
        }
        let Some(live) = self.live.as_mut() else {
            return Err(VoxError::DeviceUnavailable(
                "microphone has not been opened".to_string(),
            ));
        };
        if !self.gate.try_begin_recording() {
            tracing::debug!("capture: playback active, not recording");
            return Ok(false);
        }

        // Frames left over from a previous cycle do not belong to this recording.
        live.drain();
        if let Err(e) = live.resume() {
            self.gate.end_recording();
            return Err(e);
        }

        self.buffer = Some(CaptureBuffer::new(live.format()));
        tracing::debug!("capture: recording");
        Ok(true)
    }

    /// Finish the recording. `Ok(None)` when nothing was recording; `EmptyCapture`
    /// when the result is too small to hold speech.
    pub fn stop(&mut self) -> Result<Option<AudioBlob>> {
        let Some(mut buffer) = self.buffer.take() else {
            return Ok(None);
        };

        if let Some(live) = self.live.as_mut() {
            if let Err(e) = live.pause() {
                tracing::warn!("capture: pause failed: {e}");
            }
            for frame in live.drain() {
                buffer.push_interleaved(&frame);
            }
        }
        self.gate.end_recording();

        let blob = buffer.finish()?;
        if blob.len() < self.min_blob_bytes {
            tracing::debug!("capture: {} bytes is below the speech minimum", blob.len());
            return Err(VoxError::EmptyCapture { bytes: blob.len() });
        }

        tracing::info!(
            "capture: {:.1}s recorded ({} bytes)",
            blob.duration.as_secs_f32(),
            blob.len()
        );
        Ok(Some(blob))
    }

    /// Cancel a recording and throw its audio away.
    pub fn abort(&mut self) {
        if self.buffer.take().is_none() {
            return;
        }
        if let Some(live) = self.live.as_mut() {
            if let Err(e) = live.pause() {
                tracing::warn!("capture: pause failed: {e}");
            }
            live.drain();
        }
        self.gate.end_recording();
        tracing::debug!("capture: aborted");
    }

    /// Abort any recording and release the device.
    pub fn close(&mut self) {
        self.abort();
        if self.live.take().is_some() {
            tracing::debug!("capture: device closed");
        }
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.buffer.is_some()
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.live.is_some()
    }
}
