//! Scripted stand-ins for the microphone, the speaker and the Conversation Service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::buffer::{AudioBlob, CaptureBuffer};
use crate::audio::{InputDevice, InputFormat, LevelSource, LiveInput};
use crate::error::{Result, VoxError};
use crate::gate::MediaGate;
use crate::playback::{AudioFetcher, AudioOutput, PlaybackOutcome};
use crate::round_trip::{ChatRequest, ConversationService};

pub const MONO_16K: InputFormat = InputFormat {
    sample_rate: 16_000,
    channels: 1,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A finished WAV blob holding `samples` mono samples at 16 kHz.
pub fn blob_of(samples: usize) -> AudioBlob {
    let mut buffer = CaptureBuffer::new(MONO_16K);
    buffer.push_interleaved(&vec![0.2; samples]);
    buffer.finish().unwrap_or_else(|e| panic!("{e}"))
}

type LevelFn = Arc<dyn Fn(Duration) -> f32 + Send + Sync>;

/// What a fake microphone hears on every recording: the frames it delivers and
/// its loudness as a function of time since recording started.
#[derive(Clone)]
pub struct FakeInputScript {
    frames: Vec<Vec<f32>>,
    level: LevelFn,
}

impl FakeInputScript {
    pub fn frames(frames: Vec<Vec<f32>>) -> Self {
        Self {
            frames,
            level: Arc::new(|_| 0.0),
        }
    }

    /// Loud for `speech`, silent afterwards, with a second of audio to upload.
    pub fn speech_then_silence(speech: Duration) -> Self {
        Self {
            frames: vec![vec![0.2; 16_000]],
            level: Arc::new(move |t| if t < speech { 0.3 } else { 0.0 }),
        }
    }

    /// Silent, and too short to count as speech.
    pub fn silent() -> Self {
        Self::frames(vec![vec![0.0; 10]])
    }
}

#[derive(Debug, Default)]
struct LatchState {
    waiting: bool,
    released: bool,
}

/// Keeps `open()` from returning until released, the way a permission prompt does.
#[derive(Default)]
pub struct OpenLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl OpenLatch {
    pub fn release(&self) {
        lock(&self.state).released = true;
        self.cond.notify_all();
    }

    /// True once some `open()` is blocked on the latch.
    pub fn is_waiting(&self) -> bool {
        lock(&self.state).waiting
    }

    fn wait(&self) {
        let mut state = lock(&self.state);
        state.waiting = true;
        while !state.released {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting = false;
    }
}

pub struct FakeInputDevice {
    script: FakeInputScript,
    failure: Option<fn() -> VoxError>,
    latch: Option<Arc<OpenLatch>>,
    opens: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl FakeInputDevice {
    pub fn new(script: FakeInputScript) -> Self {
        Self {
            script,
            failure: None,
            latch: None,
            opens: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every `open()` fails with the error `make` builds.
    #[must_use]
    pub fn failing_with(mut self, make: fn() -> VoxError) -> Self {
        self.failure = Some(make);
        self
    }

    /// Every `open()` blocks until the returned latch is released.
    #[must_use]
    pub fn waiting_for_permission(mut self) -> (Self, Arc<OpenLatch>) {
        let latch = Arc::new(OpenLatch::default());
        self.latch = Some(Arc::clone(&latch));
        (self, latch)
    }

    pub fn open_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }

    /// Set once the live input handed out by `open()` has been dropped.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

impl InputDevice for FakeInputDevice {
    fn open(&self) -> Result<Box<dyn LiveInput>> {
        if let Some(latch) = &self.latch {
            latch.wait();
        }
        if let Some(make) = self.failure {
            return Err(make());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);

        let resumed_at = Arc::new(Mutex::new(None));
        Ok(Box::new(FakeLiveInput {
            frames: self.script.frames.clone(),
            pending: Vec::new(),
            level: Arc::new(ScriptedLevel {
                resumed_at: Arc::clone(&resumed_at),
                level: Arc::clone(&self.script.level),
            }),
            resumed_at,
            released: Arc::clone(&self.released),
        }))
    }
}

struct ScriptedLevel {
    resumed_at: Arc<Mutex<Option<Instant>>>,
    level: LevelFn,
}

impl LevelSource for ScriptedLevel {
    fn current_rms(&self) -> f32 {
        lock(&self.resumed_at).map_or(0.0, |at| (self.level)(at.elapsed()))
    }
}

struct FakeLiveInput {
    frames: Vec<Vec<f32>>,
    pending: Vec<Vec<f32>>,
    level: Arc<ScriptedLevel>,
    resumed_at: Arc<Mutex<Option<Instant>>>,
    released: Arc<AtomicBool>,
}

impl LiveInput for FakeLiveInput {
    fn format(&self) -> InputFormat {
        MONO_16K
    }

    fn level(&self) -> Arc<dyn LevelSource> {
        Arc::clone(&self.level) as Arc<dyn LevelSource>
    }

    fn resume(&mut self) -> Result<()> {
        self.pending.clone_from(&self.frames);
        *lock(&self.resumed_at) = Some(Instant::now());
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        *lock(&self.resumed_at) = None;
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<f32>> {
        std::mem::take(&mut self.pending)
    }
}

impl Drop for FakeLiveInput {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

enum OutputBehaviour {
    FinishAfter(Duration),
    Fail,
}

/// Speaker that "plays" for a fixed time, or rejects everything.
pub struct FakeOutput {
    behaviour: OutputBehaviour,
    gate: Option<Arc<MediaGate>>,
    plays: AtomicUsize,
}

impl FakeOutput {
    pub fn finishing_after(duration: Duration) -> Self {
        Self {
            behaviour: OutputBehaviour::FinishAfter(duration),
            gate: None,
            plays: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            behaviour: OutputBehaviour::Fail,
            gate: None,
            plays: AtomicUsize::new(0),
        }
    }

    /// Assert on every play that nothing is recording at the same time.
    #[must_use]
    pub fn watching(mut self, gate: &Arc<MediaGate>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn play(&self, _audio: Vec<u8>, cancel: CancellationToken) -> Result<PlaybackOutcome> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            assert!(!gate.is_recording(), "playing while recording");
        }
        match self.behaviour {
            OutputBehaviour::Fail => Err(VoxError::Playback("decode failed".to_string())),
            OutputBehaviour::FinishAfter(duration) => Ok(tokio::select! {
                () = cancel.cancelled() => PlaybackOutcome::Interrupted,
                () = tokio::time::sleep(duration) => PlaybackOutcome::Finished,
            }),
        }
    }
}

pub struct FakeFetcher {
    fail: bool,
}

impl FakeFetcher {
    pub const fn ok() -> Self {
        Self { fail: false }
    }

    pub const fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl AudioFetcher for FakeFetcher {
    async fn fetch_audio(&self, audio_ref: &str) -> Result<Vec<u8>> {
        if self.fail {
            return Err(VoxError::Transport(format!("{audio_ref} returned 404")));
        }
        Ok(vec![0; 64])
    }
}

/// Conversation Service that answers from a script, then with a fixed reply.
pub struct FakeService {
    scripted: Mutex<VecDeque<Result<Value>>>,
    fallback: Value,
    requests: Mutex<Vec<ChatRequest>>,
    uploads: AtomicUsize,
    upload_failure: Mutex<Option<VoxError>>,
    healthy: AtomicBool,
    hold: Option<Arc<Notify>>,
}

impl FakeService {
    pub fn replying(fallback: Value) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            uploads: AtomicUsize::new(0),
            upload_failure: Mutex::new(None),
            healthy: AtomicBool::new(true),
            hold: None,
        }
    }

    /// Answer the next chat call with `reply` before falling back.
    pub fn push(&self, reply: Result<Value>) {
        lock(&self.scripted).push_back(reply);
    }

    pub fn fail_next_upload(&self, error: VoxError) {
        *lock(&self.upload_failure) = Some(error);
    }

    /// Make every chat call wait until the returned handle is notified.
    #[must_use]
    pub fn held(mut self) -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        self.hold = Some(Arc::clone(&notify));
        (self, notify)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationService for FakeService {
    async fn upload_audio(&self, blob: &AudioBlob) -> Result<String> {
        if let Some(error) = lock(&self.upload_failure).take() {
            return Err(error);
        }
        assert!(!blob.is_empty());
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("uploads/voice_{n}.wav"))
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Value> {
        lock(&self.requests).push(request.clone());
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        let scripted = lock(&self.scripted).pop_front();
        scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl AudioFetcher for FakeService {
    async fn fetch_audio(&self, _audio_ref: &str) -> Result<Vec<u8>> {
        Ok(vec![0; 64])
    }
}
