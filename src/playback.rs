//! Renders one assistant reply, either as audio or as a paced text display, and
//! lets the user cut it short.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink, Source};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VoxError};
use crate::gate::{MediaGate, PlaybackLease};

const SINK_POLL: Duration = Duration::from_millis(20);

/// How a playback ended. Callers branch on this, so interruption is never
/// reported as a normal finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Interrupted,
}

/// Display time for text replies: proportional to length, never below a floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextPacing {
    pub per_char: Duration,
    pub minimum: Duration,
}

impl Default for TextPacing {
    fn default() -> Self {
        Self {
            per_char: Duration::from_millis(50),
            minimum: Duration::from_millis(3000),
        }
    }
}

impl TextPacing {
    #[must_use]
    pub fn display_duration(&self, content: &str) -> Duration {
        let chars = u32::try_from(content.chars().count()).unwrap_or(u32::MAX);
        self.minimum.max(self.per_char.saturating_mul(chars))
    }
}

/// Plays decoded-on-the-fly audio bytes until done or cancelled.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<PlaybackOutcome>;
}

/// Turns an audio reference from the service into bytes.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch_audio(&self, audio_ref: &str) -> Result<Vec<u8>>;
}

pub struct PlaybackController {
    output: Arc<dyn AudioOutput>,
    fetcher: Arc<dyn AudioFetcher>,
    pacing: TextPacing,
    gate: Arc<MediaGate>,
    active: Mutex<Option<CancellationToken>>,
}

impl PlaybackController {
    #[must_use]
    pub fn new(
        output: Arc<dyn AudioOutput>,
        fetcher: Arc<dyn AudioFetcher>,
        pacing: TextPacing,
        gate: Arc<MediaGate>,
    ) -> Self {
        Self {
            output,
            fetcher,
            pacing,
            gate,
            active: Mutex::new(None),
        }
    }

    fn begin(&self, parent: &CancellationToken) -> Result<(CancellationToken, PlaybackLease)> {
        let lease = self
            .gate
            .try_begin_playback()
            .ok_or_else(|| VoxError::Playback("audio hardware is busy".to_string()))?;
        let token = parent.child_token();
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok((token, lease))
    }

    fn finish(&self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Fetch and play an audio reply. Cancelling `parent` interrupts it just like
    /// [`interrupt`](Self::interrupt) does.
    pub async fn play_audio(
        &self,
        audio_ref: &str,
        parent: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        let (token, _lease) = self.begin(parent)?;
        tracing::debug!("playback: audio {audio_ref}");

        let result = async {
            let audio = tokio::select! {
                () = token.cancelled() => return Ok(PlaybackOutcome::Interrupted),
                fetched = self.fetcher.fetch_audio(audio_ref) => fetched.map_err(|e| {
                    VoxError::Playback(format!("failed to fetch {audio_ref}: {e}"))
                })?,
            };
            self.output.play(audio, token.clone()).await
        }
        .await;

        self.finish();
        result
    }

    /// Hold a text reply on screen for its paced duration.
    pub async fn play_text(
        &self,
        content: &str,
        parent: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        let (token, _lease) = self.begin(parent)?;
        let hold = self.pacing.display_duration(content);
        tracing::debug!("playback: text for {}ms", hold.as_millis());

        let outcome = tokio::select! {
            () = token.cancelled() => PlaybackOutcome::Interrupted,
            () = tokio::time::sleep(hold) => PlaybackOutcome::Finished,
        };

        self.finish();
        Ok(outcome)
    }

    /// Stop whatever is playing. Returns `false` if nothing was.
    pub fn interrupt(&self) -> bool {
        let token = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        token.is_some_and(|token| {
            token.cancel();
            tracing::info!("playback: interrupted");
            true
        })
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Speaker output through rodio. Each playback opens the default output on its
/// own thread, since rodio streams cannot move between threads.
#[derive(Debug, Default)]
pub struct RodioOutput;

#[async_trait]
impl AudioOutput for RodioOutput {
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<PlaybackOutcome> {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();

        let thread_stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("voxloop-speaker".to_string())
            .spawn(move || {
                let _ = done_tx.send(play_blocking(audio, &thread_stop));
            })?;

        tokio::select! {
            result = &mut done_rx => {
                return result.map_err(|_| VoxError::Playback("speaker thread exited".to_string()))?;
            }
            () = cancel.cancelled() => {}
        }

        stop.store(true, Ordering::SeqCst);
        let _ = done_rx.await;
        Ok(PlaybackOutcome::Interrupted)
    }
}

fn play_blocking(audio: Vec<u8>, stop: &AtomicBool) -> Result<PlaybackOutcome> {
    let (_stream, handle) = OutputStream::try_default()
        .map_err(|e| VoxError::Playback(format!("no output device: {e}")))?;
    let sink =
        Sink::try_new(&handle).map_err(|e| VoxError::Playback(format!("sink failed: {e}")))?;
    let source = Decoder::new(Cursor::new(audio))
        .map_err(|e| VoxError::Playback(format!("decode failed: {e}")))?;
    sink.append(source.convert_samples::<f32>());

    loop {
        if stop.load(Ordering::SeqCst) {
            sink.stop();
            return Ok(PlaybackOutcome::Interrupted);
        }
        if sink.empty() {
            return Ok(PlaybackOutcome::Finished);
        }
        std::thread::sleep(SINK_POLL);
    }
}
