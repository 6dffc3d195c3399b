use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub recording: bool,
    pub playing: bool,
}

/// Shared record of who holds the audio hardware. Recording and playback are
/// never both on; both flags are checked and set under one lock.
#[derive(Debug, Default)]
pub struct MediaGate {
    state: Mutex<GateSnapshot>,
}

impl MediaGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, GateSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the microphone. Fails if already recording or if something is playing.
    pub fn try_begin_recording(&self) -> bool {
        let mut state = self.lock();
        if state.recording || state.playing {
            return false;
        }
        state.recording = true;
        true
    }

    pub fn end_recording(&self) {
        self.lock().recording = false;
    }

    /// Claim the speaker. Fails if already playing or if the microphone is recording.
    pub fn try_begin_playback(self: &Arc<Self>) -> Option<PlaybackLease> {
        let mut state = self.lock();
        if state.recording || state.playing {
            return None;
        }
        state.playing = true;
        Some(PlaybackLease {
            gate: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> GateSnapshot {
        *self.lock()
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.lock().recording
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }
}

/// Held for the duration of one playback; releases the speaker when dropped.
#[derive(Debug)]
pub struct PlaybackLease {
    gate: Arc<MediaGate>,
}

impl Drop for PlaybackLease {
    fn drop(&mut self) {
        self.gate.lock().playing = false;
    }
}
