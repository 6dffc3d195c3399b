//! The voice conversation loop.
//!
//! One [`LoopOrchestrator`] task owns the capture session and is the only place
//! that decides what happens next. Everything slow (opening the microphone,
//! listening, the round trip, playback, retry timers) runs in spawned tasks that
//! report back with the turn number they were started for. A completion whose
//! turn is no longer current is dropped, so nothing started before a `stop()`
//! can move the loop afterwards.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::LevelSource;
use crate::audio::buffer::AudioBlob;
use crate::audio::level::AudioLevelSampler;
use crate::audio::session::AudioCaptureSession;
use crate::audio::silence::{SilenceConfig, SilenceDetector, SpeechEnd, watch_for_speech_end};
use crate::config::LoopPreset;
use crate::conversation::{Modality, Role, Session, Utterance};
use crate::error::{Result, VoxError};
use crate::history::HistoryStore;
use crate::playback::{PlaybackController, PlaybackOutcome};
use crate::round_trip::{ConversationRoundTrip, Reply, ReplyKind, VoiceExchange};

/// Consecutive failed round trips after which the loop gives up and goes idle.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Stands in for the user's words when the service sent no transcript.
pub const VOICE_INPUT_PLACEHOLDER: &str = "[Voice Input]";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Listening,
    AwaitingResponse,
    Speaking,
    Interrupted,
    Failed,
}

/// Where the loop goes once an interrupted reply has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterInterrupt {
    Listen,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    KeyPress,
    FocusLost,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    /// Hard ceiling on one listening window.
    pub max_listen: Duration,
    pub silence_threshold_rms: f32,
    /// `None` disables silence detection.
    pub silence_duration: Option<Duration>,
    /// Listen again after a reply finishes, rather than going idle.
    pub auto_continue: bool,
    pub after_interrupt: AfterInterrupt,
    /// First retry delay after a failed round trip; doubles per consecutive failure.
    pub retry_backoff: Duration,
    /// Record the user side of voice turns in history.
    pub record_transcripts: bool,
    pub sample_tick: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopPreset::Continuous.loop_config()
    }
}

impl LoopConfig {
    #[must_use]
    pub const fn silence(&self) -> SilenceConfig {
        SilenceConfig {
            threshold_rms: self.silence_threshold_rms,
            silence_duration: self.silence_duration,
            max_duration: self.max_listen,
        }
    }
}

/// Delay before retry number `failures`, doubling from `base` up to a ceiling.
#[must_use]
pub fn retry_delay(base: Duration, failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    base.saturating_mul(1 << doublings).min(MAX_RETRY_BACKOFF)
}

/// What the loop tells whoever is rendering it.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    State(LoopState),
    Status(String),
    /// The service's transcript of the user's recording.
    Heard(String),
    Reply(Reply),
}

#[derive(Debug)]
enum Command {
    Start,
    Stop { release_mic: bool },
    Interrupt(InterruptCause),
}

/// Cloneable remote control for a running [`LoopOrchestrator`].
#[derive(Clone)]
pub struct LoopHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LoopState>,
    events: broadcast::Sender<LoopEvent>,
}

impl LoopHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoxError::Other("conversation loop has shut down".to_string()))
    }

    /// Begin listening. Does nothing unless the loop is idle or failed.
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Cancel everything in flight and go idle; optionally release the microphone.
    pub fn stop(&self, release_mic: bool) -> Result<()> {
        self.send(Command::Stop { release_mic })
    }

    /// Cut a reply short. Does nothing unless the loop is speaking.
    pub fn interrupt(&self, cause: InterruptCause) -> Result<()> {
        self.send(Command::Interrupt(cause))
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }
}

/// Level source of a microphone that has started recording.
struct LiveLevel(Arc<dyn LevelSource>);

impl fmt::Debug for LiveLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LiveLevel")
    }
}

#[derive(Debug)]
enum TurnEvent {
    /// `Ok(None)`: the speaker was busy, or the turn was abandoned while opening.
    Armed(Result<Option<LiveLevel>>),
    SpeechEnded(SpeechEnd),
    Replied(Result<VoiceExchange>),
    Played(Result<PlaybackOutcome>),
    RetryElapsed,
}

#[derive(Debug)]
struct Completion {
    turn: u64,
    event: TurnEvent,
}

pub struct LoopOrchestrator {
    config: LoopConfig,
    capture: Arc<Mutex<AudioCaptureSession>>,
    round_trip: Arc<ConversationRoundTrip>,
    playback: Arc<PlaybackController>,
    session: Arc<Session>,
    history: Arc<dyn HistoryStore>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<LoopState>,
    events: broadcast::Sender<LoopEvent>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    turn: u64,
    work: CancellationToken,
    pending: Vec<Utterance>,
    failures: u32,
    speaker: Option<JoinHandle<()>>,
    /// A stop asked for the microphone while an arming task still held it.
    release_pending: bool,
}

impl LoopOrchestrator {
    #[must_use]
    pub fn new(
        config: LoopConfig,
        capture: AudioCaptureSession,
        round_trip: Arc<ConversationRoundTrip>,
        playback: Arc<PlaybackController>,
        session: Arc<Session>,
        history: Arc<dyn HistoryStore>,
    ) -> (Self, LoopHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(LoopState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let handle = LoopHandle {
            commands: command_tx,
            state: state_rx,
            events: events.clone(),
        };

        let orchestrator = Self {
            config,
            capture: Arc::new(Mutex::new(capture)),
            round_trip,
            playback,
            session,
            history,
            commands,
            state,
            events,
            done_tx,
            done_rx,
            turn: 0,
            work: CancellationToken::new(),
            pending: Vec::new(),
            failures: 0,
            speaker: None,
            release_pending: false,
        };
        (orchestrator, handle)
    }

    /// Drive the loop until every [`LoopHandle`] has been dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(done) = self.done_rx.recv() => self.handle_completion(done),
            }
        }

        self.work.cancel();
        self.playback.interrupt();
        self.settle_speaker().await;

        let capture = Arc::clone(&self.capture);
        let closed = tokio::task::spawn_blocking(move || {
            capture.lock().unwrap_or_else(PoisonError::into_inner).close();
        });
        if let Err(e) = closed.await {
            tracing::warn!("loop: failed to release the microphone: {e}");
        }
        tracing::debug!("loop: shut down");
    }

    fn current(&self) -> LoopState {
        *self.state.borrow()
    }

    fn set_state(&self, next: LoopState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!("loop: {prev:?} -> {next:?}");
            let _ = self.events.send(LoopEvent::State(next));
        }
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        let _ = self.events.send(LoopEvent::Status(message));
    }

    /// Abandon the current turn: cancel its tasks and make their completions stale.
    fn cancel_turn(&mut self) {
        self.work.cancel();
        self.work = CancellationToken::new();
        self.turn += 1;
    }

    /// Run `f` on the capture session, unless an arming task is holding it.
    fn with_capture<T>(&self, f: impl FnOnce(&mut AudioCaptureSession) -> T) -> Option<T> {
        match self.capture.try_lock() {
            Ok(mut capture) => Some(f(&mut capture)),
            Err(TryLockError::Poisoned(poisoned)) => Some(f(&mut poisoned.into_inner())),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    async fn settle_speaker(&mut self) {
        if let Some(speaker) = self.speaker.take()
            && let Err(e) = speaker.await
        {
            tracing::warn!("loop: playback task failed: {e}");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop { release_mic } => self.stop(release_mic).await,
            Command::Interrupt(cause) => self.interrupt(cause),
        }
    }

    fn start(&mut self) {
        match self.current() {
            LoopState::Idle => {
                self.failures = 0;
                self.listen();
            }
            LoopState::Failed => {
                tracing::info!("loop: retrying now");
                self.listen();
            }
            state => tracing::debug!("loop: start ignored while {state:?}"),
        }
    }

    async fn stop(&mut self, release_mic: bool) {
        if self.current() != LoopState::Idle {
            self.cancel_turn();
            // When arming holds the session it sees the cancellation and aborts itself.
            self.with_capture(AudioCaptureSession::abort);
            self.playback.interrupt();
            self.settle_speaker().await;
            self.pending.clear();
            self.set_state(LoopState::Idle);
            tracing::info!("loop: stopped");
        }
        if release_mic && self.with_capture(AudioCaptureSession::close).is_none() {
            tracing::debug!("loop: microphone still opening, releasing it once it answers");
            self.release_pending = true;
        }
    }

    fn interrupt(&mut self, cause: InterruptCause) {
        if self.current() != LoopState::Speaking {
            tracing::debug!("loop: nothing to interrupt ({cause:?})");
            return;
        }
        tracing::info!("loop: reply interrupted ({cause:?})");
        self.playback.interrupt();
        self.work.cancel();
        self.commit_turn();
        self.set_state(LoopState::Interrupted);
    }

    fn handle_completion(&mut self, done: Completion) {
        if done.turn != self.turn {
            let stale = VoxError::StaleCompletion(done.turn);
            tracing::debug!("loop: discarding {stale}");
            if matches!(done.event, TurnEvent::Armed(_)) {
                self.tidy_capture();
            }
            return;
        }

        match (self.current(), done.event) {
            (LoopState::Listening, TurnEvent::Armed(armed)) => self.armed(armed),
            (LoopState::Listening, TurnEvent::SpeechEnded(end)) => self.speech_ended(end),
            (LoopState::AwaitingResponse, TurnEvent::Replied(Ok(exchange))) => {
                self.reply_received(exchange);
            }
            (LoopState::AwaitingResponse, TurnEvent::Replied(Err(e))) => {
                if e.is_recoverable() {
                    self.round_trip_failed(&e);
                } else {
                    tracing::warn!("loop: round trip failed: {e}");
                    self.halt(&e);
                }
            }
            (LoopState::Speaking | LoopState::Interrupted, TurnEvent::Played(result)) => {
                self.playback_done(result);
            }
            (LoopState::Failed, TurnEvent::RetryElapsed) => {
                if self.config.auto_continue {
                    self.listen();
                } else {
                    self.set_state(LoopState::Idle);
                }
            }
            (state, event) => tracing::debug!("loop: ignoring {event:?} while {state:?}"),
        }
    }

    /// Enter `Listening` and open the microphone on the blocking pool, since
    /// opening can sit behind an OS permission prompt.
    fn listen(&mut self) {
        self.cancel_turn();
        self.release_pending = false;
        self.set_state(LoopState::Listening);

        let capture = Arc::clone(&self.capture);
        let cancel = self.work.clone();
        let done = self.done_tx.clone();
        let turn = self.turn;
        tokio::task::spawn_blocking(move || {
            let armed = arm(&capture, &cancel);
            let _ = done.send(Completion {
                turn,
                event: TurnEvent::Armed(armed),
            });
        });
    }

    fn armed(&mut self, armed: Result<Option<LiveLevel>>) {
        let level = match armed {
            Ok(Some(level)) => level,
            Ok(None) => {
                tracing::warn!("loop: audio hardware busy, not listening");
                self.set_state(LoopState::Idle);
                return;
            }
            Err(e) => return self.capture_failed(&e),
        };

        let sampler = AudioLevelSampler::new(level.0, self.config.sample_tick);
        let detector = SilenceDetector::new(self.config.silence(), Instant::now());
        let cancel = self.work.clone();
        let done = self.done_tx.clone();
        let turn = self.turn;
        tokio::spawn(async move {
            if let Some(end) = watch_for_speech_end(sampler, detector, cancel).await {
                let _ = done.send(Completion {
                    turn,
                    event: TurnEvent::SpeechEnded(end),
                });
            }
        });
    }

    /// An abandoned arming can leave the microphone recording, or still open
    /// after a stop asked for its release.
    fn tidy_capture(&mut self) {
        if self.current() == LoopState::Listening {
            return;
        }
        let release = self.release_pending;
        let tidied = self.with_capture(|capture| {
            if release {
                capture.close();
            } else {
                capture.abort();
            }
        });
        if tidied.is_some() {
            self.release_pending = false;
        }
    }

    /// Device trouble needs the user; park in Idle with the reason on screen.
    fn capture_failed(&mut self, error: &VoxError) {
        tracing::warn!("loop: capture failed: {error}");
        if error.is_device_error() {
            self.with_capture(AudioCaptureSession::close);
        } else {
            self.with_capture(AudioCaptureSession::abort);
        }
        self.halt(error);
    }

    fn halt(&self, error: &VoxError) {
        self.status(error.status_message());
        self.set_state(LoopState::Idle);
    }

    fn speech_ended(&mut self, end: SpeechEnd) {
        tracing::debug!("loop: listening ended by {end:?}");
        match self.with_capture(AudioCaptureSession::stop) {
            Some(Ok(Some(blob))) => self.send_voice(blob),
            Some(Ok(None)) | None => self.listen(),
            Some(Err(e)) if e.is_recoverable() => {
                tracing::debug!("loop: {e}, listening again");
                self.listen();
            }
            Some(Err(e)) => self.capture_failed(&e),
        }
    }

    fn send_voice(&mut self, blob: AudioBlob) {
        self.set_state(LoopState::AwaitingResponse);

        let history = self
            .history
            .chat_messages(self.session.id())
            .unwrap_or_else(|e| {
                tracing::warn!("history: could not read prior messages: {e}");
                Vec::new()
            });

        let round_trip = Arc::clone(&self.round_trip);
        let cancel = self.work.clone();
        let done = self.done_tx.clone();
        let turn = self.turn;
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = round_trip.voice_turn(&blob, history) => result,
            };
            let _ = done.send(Completion {
                turn,
                event: TurnEvent::Replied(result),
            });
        });
    }

    fn reply_received(&mut self, exchange: VoiceExchange) {
        self.failures = 0;
        let VoiceExchange { upload_ref, reply } = exchange;

        self.pending.clear();
        if let Some(transcript) = &reply.transcript {
            let _ = self.events.send(LoopEvent::Heard(transcript.clone()));
        }
        if self.config.record_transcripts {
            let heard = reply
                .transcript
                .clone()
                .unwrap_or_else(|| VOICE_INPUT_PLACEHOLDER.to_string());
            self.pending.push(self.session.utterance(
                Role::User,
                Modality::Voice,
                heard,
                Some(upload_ref),
            ));
        }
        let modality = match reply.kind {
            ReplyKind::Audio => Modality::Voice,
            ReplyKind::Text => Modality::Text,
        };
        self.pending.push(self.session.utterance(
            Role::Assistant,
            modality,
            reply.content.clone(),
            reply.audio_ref.clone(),
        ));
        let _ = self.events.send(LoopEvent::Reply(reply.clone()));

        self.speak(reply);
    }

    fn speak(&mut self, reply: Reply) {
        self.set_state(LoopState::Speaking);

        let playback = Arc::clone(&self.playback);
        let cancel = self.work.clone();
        let done = self.done_tx.clone();
        let turn = self.turn;
        self.speaker = Some(tokio::spawn(async move {
            let result = match (reply.kind, reply.audio_ref.as_deref()) {
                (ReplyKind::Audio, Some(audio_ref)) => {
                    playback.play_audio(audio_ref, &cancel).await
                }
                _ => playback.play_text(&reply.content, &cancel).await,
            };
            let _ = done.send(Completion {
                turn,
                event: TurnEvent::Played(result),
            });
        }));
    }

    fn playback_done(&mut self, result: Result<PlaybackOutcome>) {
        self.speaker = None;

        if self.current() == LoopState::Interrupted {
            return self.after_interrupt();
        }

        match result {
            Ok(PlaybackOutcome::Finished) => {
                self.commit_turn();
                if self.config.auto_continue {
                    self.listen();
                } else {
                    self.set_state(LoopState::Idle);
                }
            }
            Ok(PlaybackOutcome::Interrupted) => {
                self.commit_turn();
                self.set_state(LoopState::Interrupted);
                self.after_interrupt();
            }
            Err(e) => {
                tracing::warn!("loop: playback failed: {e}");
                self.pending.clear();
                self.status(e.status_message());
                if self.config.auto_continue {
                    self.listen();
                } else {
                    self.set_state(LoopState::Idle);
                }
            }
        }
    }

    fn after_interrupt(&mut self) {
        match self.config.after_interrupt {
            AfterInterrupt::Listen => self.listen(),
            AfterInterrupt::Idle => self.set_state(LoopState::Idle),
        }
    }

    fn round_trip_failed(&mut self, error: &VoxError) {
        self.failures += 1;
        tracing::warn!(
            "loop: round trip failed ({}/{MAX_CONSECUTIVE_FAILURES}): {error}",
            self.failures
        );
        self.status(error.status_message());
        self.set_state(LoopState::Failed);

        if self.failures >= MAX_CONSECUTIVE_FAILURES {
            self.status("Too many errors. Start again when the service is back.");
            self.set_state(LoopState::Idle);
            return;
        }

        let delay = retry_delay(self.config.retry_backoff, self.failures);
        tracing::debug!("loop: retrying in {}ms", delay.as_millis());
        let cancel = self.work.clone();
        let done = self.done_tx.clone();
        let turn = self.turn;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = done.send(Completion { turn, event: TurnEvent::RetryElapsed });
                }
            }
        });
    }

    /// Append the finished turn's utterances, user first.
    fn commit_turn(&mut self) {
        for utterance in self.pending.drain(..) {
            if let Err(e) = self.history.append(&utterance) {
                tracing::warn!("history: failed to record utterance: {e}");
            }
        }
    }
}

/// Open the microphone if needed and start recording. Blocks while the host
/// asks the user for permission.
fn arm(
    capture: &Mutex<AudioCaptureSession>,
    cancel: &CancellationToken,
) -> Result<Option<LiveLevel>> {
    let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
    if cancel.is_cancelled() {
        return Ok(None);
    }
    // A recording still running here belongs to an abandoned turn.
    capture.abort();

    let level = capture.open()?;
    if cancel.is_cancelled() || !capture.start()? {
        return Ok(None);
    }
    if cancel.is_cancelled() {
        capture.abort();
        return Ok(None);
    }
    Ok(Some(LiveLevel(level)))
}
