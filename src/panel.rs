//! Voice and text front ends over one shared conversation.
//!
//! Exactly one panel is active at a time. [`PanelSwitcher`] deactivates the
//! outgoing panel before activating the incoming one, and every panel works
//! against the [`PanelContext`] it is handed rather than any global mode.

use std::sync::Arc;

use async_trait::async_trait;

use crate::conversation::{Modality, Role, Session};
use crate::error::{Result, VoxError};
use crate::history::HistoryStore;
use crate::orchestrator::{InterruptCause, LoopHandle};
use crate::round_trip::{ConversationRoundTrip, Reply, ReplyKind};

/// Everything a panel needs to take part in the conversation.
#[derive(Clone)]
pub struct PanelContext {
    pub session: Arc<Session>,
    pub history: Arc<dyn HistoryStore>,
    pub round_trip: Arc<ConversationRoundTrip>,
}

#[async_trait]
pub trait Panel: Send {
    fn name(&self) -> &'static str;

    async fn activate(&mut self, ctx: &PanelContext) -> Result<()>;

    async fn deactivate(&mut self, ctx: &PanelContext) -> Result<()>;
}

/// Front end for the voice loop.
pub struct VoicePanel {
    handle: LoopHandle,
    auto_start: bool,
}

impl VoicePanel {
    /// `auto_start` begins listening as soon as the panel is shown.
    #[must_use]
    pub const fn new(handle: LoopHandle, auto_start: bool) -> Self {
        Self { handle, auto_start }
    }

    #[must_use]
    pub const fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

#[async_trait]
impl Panel for VoicePanel {
    fn name(&self) -> &'static str {
        "voice"
    }

    async fn activate(&mut self, _ctx: &PanelContext) -> Result<()> {
        if self.auto_start {
            self.handle.start()?;
        }
        Ok(())
    }

    /// Leaving the panel counts as losing focus: a reply in progress is cut short
    /// (and kept in history), then the loop stops and lets go of the microphone.
    async fn deactivate(&mut self, _ctx: &PanelContext) -> Result<()> {
        self.handle.interrupt(InterruptCause::FocusLost)?;
        self.handle.stop(true)
    }
}

/// Plain request/response text chat.
#[derive(Debug, Default)]
pub struct ChatPanel {
    active: bool,
}

impl ChatPanel {
    #[must_use]
    pub const fn new() -> Self {
        Self { active: false }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Send one typed message and record both sides once the reply is in.
    pub async fn send(&self, ctx: &PanelContext, text: &str) -> Result<Reply> {
        if !self.active {
            return Err(VoxError::Other("chat panel is not active".to_string()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(VoxError::Other("nothing to send".to_string()));
        }

        let history = ctx.history.chat_messages(ctx.session.id())?;
        let reply = ctx.round_trip.text_turn(text, history).await?;

        let user = ctx
            .session
            .utterance(Role::User, Modality::Text, text, None);
        let modality = match reply.kind {
            ReplyKind::Audio => Modality::Voice,
            ReplyKind::Text => Modality::Text,
        };
        let assistant = ctx.session.utterance(
            Role::Assistant,
            modality,
            reply.content.clone(),
            reply.audio_ref.clone(),
        );
        ctx.history.append(&user)?;
        ctx.history.append(&assistant)?;

        Ok(reply)
    }
}

#[async_trait]
impl Panel for ChatPanel {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn activate(&mut self, _ctx: &PanelContext) -> Result<()> {
        self.active = true;
        Ok(())
    }

    async fn deactivate(&mut self, _ctx: &PanelContext) -> Result<()> {
        self.active = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelKind {
    Landing,
    Voice,
    Chat,
}

pub struct PanelSwitcher {
    ctx: PanelContext,
    voice: VoicePanel,
    chat: ChatPanel,
    current: PanelKind,
}

impl PanelSwitcher {
    /// Starts on the landing view, with no panel active.
    #[must_use]
    pub const fn new(ctx: PanelContext, voice: VoicePanel, chat: ChatPanel) -> Self {
        Self {
            ctx,
            voice,
            chat,
            current: PanelKind::Landing,
        }
    }

    fn panel_mut(&mut self, kind: PanelKind) -> Option<&mut dyn Panel> {
        match kind {
            PanelKind::Landing => None,
            PanelKind::Voice => Some(&mut self.voice),
            PanelKind::Chat => Some(&mut self.chat),
        }
    }

    pub async fn switch_to(&mut self, next: PanelKind) -> Result<()> {
        if next == self.current {
            return Ok(());
        }

        let ctx = self.ctx.clone();
        if let Some(outgoing) = self.panel_mut(self.current) {
            tracing::debug!("panel: deactivating {}", outgoing.name());
            outgoing.deactivate(&ctx).await?;
        }
        self.current = PanelKind::Landing;

        if let Some(incoming) = self.panel_mut(next) {
            tracing::debug!("panel: activating {}", incoming.name());
            incoming.activate(&ctx).await?;
        }
        self.current = next;
        Ok(())
    }

    #[must_use]
    pub const fn current(&self) -> PanelKind {
        self.current
    }

    #[must_use]
    pub const fn context(&self) -> &PanelContext {
        &self.ctx
    }

    #[must_use]
    pub const fn voice(&self) -> &VoicePanel {
        &self.voice
    }

    #[must_use]
    pub const fn chat(&self) -> &ChatPanel {
        &self.chat
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::audio::session::AudioCaptureSession;
    use crate::conversation::SessionId;
    use crate::gate::MediaGate;
    use crate::history::MemoryHistoryStore;
    use crate::orchestrator::{LoopConfig, LoopOrchestrator, LoopState};
    use crate::playback::{AudioFetcher, PlaybackController, TextPacing};
    use crate::round_trip::ConversationService;
    use crate::testing::{FakeInputDevice, FakeInputScript, FakeOutput, FakeService};

    struct Setup {
        switcher: PanelSwitcher,
        service: Arc<FakeService>,
        gate: Arc<MediaGate>,
        released: Arc<std::sync::atomic::AtomicBool>,
    }

    /// Give blocking-pool work (opening the microphone) real time to land.
    async fn wait_until(done: impl Fn() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
            tokio::task::yield_now().await;
        }
    }

    fn setup() -> Setup {
        let gate = MediaGate::new();
        let device =
            FakeInputDevice::new(FakeInputScript::speech_then_silence(Duration::from_secs(60)));
        let released = device.released_flag();
        let service = Arc::new(FakeService::replying(json!({
            "type": "message",
            "content": "How does that make you feel?",
        })));
        let round_trip = Arc::new(ConversationRoundTrip::new(
            Arc::clone(&service) as Arc<dyn ConversationService>,
        ));
        let playback = Arc::new(PlaybackController::new(
            Arc::new(FakeOutput::finishing_after(Duration::ZERO)),
            Arc::clone(&service) as Arc<dyn AudioFetcher>,
            TextPacing::default(),
            Arc::clone(&gate),
        ));
        let session = Arc::new(Session::new(SessionId::from("panel_session")));
        let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());

        let (orchestrator, handle) = LoopOrchestrator::new(
            LoopConfig::default(),
            AudioCaptureSession::new(Box::new(device), Arc::clone(&gate), 1000),
            Arc::clone(&round_trip),
            playback,
            Arc::clone(&session),
            Arc::clone(&history),
        );
        tokio::spawn(orchestrator.run());

        let ctx = PanelContext {
            session,
            history,
            round_trip,
        };
        Setup {
            switcher: PanelSwitcher::new(ctx, VoicePanel::new(handle, true), ChatPanel::new()),
            service,
            gate,
            released,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn switching_panels_hands_over_cleanly() {
        let Setup {
            mut switcher,
            service,
            gate,
            released,
        } = setup();
        let mut state = switcher.voice().handle().watch_state();

        switcher
            .switch_to(PanelKind::Voice)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        state
            .wait_for(|s| *s == LoopState::Listening)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        wait_until(|| gate.is_recording()).await;

        switcher
            .switch_to(PanelKind::Chat)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        state
            .wait_for(|s| *s == LoopState::Idle)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        wait_until(|| released.load(Ordering::SeqCst)).await;
        assert!(released.load(Ordering::SeqCst), "voice panel released the microphone");
        assert!(!gate.is_recording());
        assert!(switcher.chat().is_active());

        let ctx = switcher.context().clone();
        let reply = switcher
            .chat()
            .send(&ctx, "I had a rough week")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(reply.content, "How does that make you feel?");

        let history = ctx
            .history
            .session_messages(ctx.session.id())
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].modality, Modality::Text);
        assert_eq!(history[0].content, "I had a rough week");
        assert_eq!(history[1].role, Role::Assistant);

        switcher
            .switch_to(PanelKind::Landing)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(!switcher.chat().is_active());
        assert!(switcher.chat().send(&ctx, "hello?").await.is_err());
        assert_eq!(service.requests().len(), 1);
    }

    #[tokio::test]
    async fn chat_sends_prior_messages() {
        let Setup {
            mut switcher,
            service,
            ..
        } = setup();
        switcher
            .switch_to(PanelKind::Chat)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        let ctx = switcher.context().clone();

        for text in ["first", "second"] {
            switcher
                .chat()
                .send(&ctx, text)
                .await
                .unwrap_or_else(|e| panic!("{e}"));
        }

        let requests = service.requests();
        assert_eq!(requests[0].messages, None);
        let prior = requests[1].messages.clone().unwrap_or_default();
        assert_eq!(prior.len(), 2);
        assert_eq!(prior[0].content, "first");
    }

    #[tokio::test]
    async fn chat_failure_records_nothing() {
        let Setup {
            mut switcher,
            service,
            ..
        } = setup();
        service.push(Err(VoxError::Transport("connection refused".to_string())));
        switcher
            .switch_to(PanelKind::Chat)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        let ctx = switcher.context().clone();

        let result = switcher.chat().send(&ctx, "anyone there?").await;
        assert!(matches!(result, Err(VoxError::Transport(_))));
        let history = ctx
            .history
            .session_messages(ctx.session.id())
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(history.is_empty());
    }
}
