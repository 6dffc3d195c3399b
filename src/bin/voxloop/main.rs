use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use voxloop::audio::capture::CpalInputDevice;
use voxloop::audio::session::AudioCaptureSession;
use voxloop::config::{Config, LoopPreset};
use voxloop::conversation::{Role, Session, SessionId};
use voxloop::error::VoxError;
use voxloop::gate::MediaGate;
use voxloop::history::{HistoryStore, JsonHistoryStore, MemoryHistoryStore, TranscriptExport};
use voxloop::orchestrator::{InterruptCause, LoopEvent, LoopOrchestrator, LoopState};
use voxloop::panel::{ChatPanel, Panel, PanelContext, PanelKind, PanelSwitcher, VoicePanel};
use voxloop::playback::{AudioFetcher, PlaybackController, RodioOutput};
use voxloop::round_trip::http::HttpConversationService;
use voxloop::round_trip::{ConversationRoundTrip, ConversationService, spawn_health_monitor};

#[derive(Parser)]
#[command(
    name = "voxloop",
    about = "Talk to a remote AI agent, hands free",
    long_about = "Voxloop runs a voice conversation with a remote AI agent. It listens on \
        the microphone until you stop speaking, sends the recording to the \
        conversation service, plays the reply, and starts listening again. \
        Replies can be cut short at any time, and a plain text chat shares \
        the same conversation history."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/voxloop/config.yaml if not specified. Built-in
    /// defaults are used when the default file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the voxloop crate, showing every loop
    /// state change, capture cycle, and round trip.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice conversation
    ///
    /// Listens, sends what you said when you go quiet, plays the reply, and
    /// listens again. Press Enter to interrupt a reply (or to start listening
    /// when idle), type /chat to switch to text, /voice to switch back, and
    /// q to quit.
    Talk {
        /// Loop behaviour, overriding the config file
        #[arg(long, value_enum)]
        preset: Option<LoopPreset>,

        /// Continue an existing session instead of starting a new one
        #[arg(long)]
        session: Option<String>,
    },

    /// Start a text conversation
    ///
    /// Same session and history as `talk`, but typed. /voice switches to the
    /// voice loop.
    Chat {
        /// Continue an existing session instead of starting a new one
        #[arg(long)]
        session: Option<String>,
    },

    /// Send a single text message and print the reply
    Say {
        /// Message to send
        text: String,

        /// Session to record the exchange under
        #[arg(long)]
        session: Option<String>,
    },

    /// Show, clear, or export a session transcript
    History {
        /// Session id, as printed when a conversation starts
        #[arg(long)]
        session: String,

        /// Delete every message in the session
        #[arg(long, conflicts_with = "export")]
        clear: bool,

        /// Write the transcript as JSON (default: voxloop_<session>.json)
        #[arg(long, num_args = 0..=1)]
        export: Option<Option<PathBuf>>,
    },

    /// Check whether the conversation service is reachable
    Health,

    /// List available audio input devices
    Devices,

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn load_config(cli: &Cli) -> Result<Config, VoxError> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("voxloop=debug,info")
    } else {
        EnvFilter::new("voxloop=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), VoxError> {
    match cli.command {
        Command::Devices => run_devices(),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "voxloop", &mut std::io::stdout());
            Ok(())
        }
        _ => run_with_config(cli),
    }
}

fn run_devices() -> Result<(), VoxError> {
    let devices = voxloop::audio::capture::list_input_devices()?;
    let default_name = voxloop::audio::capture::default_input_device_name();

    if devices.is_empty() {
        println!("No audio input devices found.");
        return Ok(());
    }

    for (i, name) in devices.iter().enumerate() {
        let marker = if default_name.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }
    Ok(())
}

fn run_with_config(cli: Cli) -> Result<(), VoxError> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Talk { preset, session } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_conversation(config, PanelKind::Voice, preset, session))
        }
        Command::Chat { session } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_conversation(config, PanelKind::Chat, None, session))
        }
        Command::Say { text, session } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_say(config, &text, session))
        }
        Command::History {
            session,
            clear,
            export,
        } => run_history(&config, &SessionId::from(session.as_str()), clear, export),
        Command::Health => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_health(&config))
        }
        Command::Devices | Command::Completions { .. } => unreachable!(),
    }
}

fn open_history(config: &Config) -> Result<Arc<dyn HistoryStore>, VoxError> {
    if !config.history.enabled {
        return Ok(Arc::new(MemoryHistoryStore::new()));
    }
    let path = Config::expand_path(&config.history.path);
    Ok(Arc::new(JsonHistoryStore::open(&path)?))
}

fn session_for(session: Option<String>) -> Arc<Session> {
    let id = session.map_or_else(SessionId::new, |s| SessionId::from(s.as_str()));
    Arc::new(Session::new(id))
}

async fn run_conversation(
    config: Config,
    start: PanelKind,
    preset: Option<LoopPreset>,
    session: Option<String>,
) -> Result<(), VoxError> {
    let session = session_for(session);
    let history = open_history(&config)?;
    let service = Arc::new(HttpConversationService::new(&config.service)?);
    let round_trip = Arc::new(ConversationRoundTrip::new(
        Arc::clone(&service) as Arc<dyn ConversationService>,
    ));
    let gate = MediaGate::new();

    let playback = Arc::new(PlaybackController::new(
        Arc::new(RodioOutput),
        Arc::clone(&service) as Arc<dyn AudioFetcher>,
        config.playback.pacing(),
        Arc::clone(&gate),
    ));
    let capture = AudioCaptureSession::new(
        Box::new(CpalInputDevice::new(&config.audio)),
        gate,
        config.audio.min_capture_bytes,
    );

    let mut conversation = config.conversation.clone();
    if let Some(preset) = preset {
        conversation.preset = preset;
    }
    let (orchestrator, handle) = LoopOrchestrator::new(
        conversation.loop_config(&config.audio),
        capture,
        Arc::clone(&round_trip),
        playback,
        Arc::clone(&session),
        Arc::clone(&history),
    );

    let printer = tokio::spawn(print_events(handle.subscribe()));
    let loop_task = tokio::spawn(orchestrator.run());
    let _online = spawn_health_monitor(
        round_trip.service(),
        Duration::from_secs(config.service.health_interval_secs.max(1)),
    );

    let ctx = PanelContext {
        session: Arc::clone(&session),
        history,
        round_trip,
    };
    let mut switcher = PanelSwitcher::new(
        ctx.clone(),
        VoicePanel::new(handle.clone(), true),
        ChatPanel::new(),
    );

    println!("Session {}", session.id());
    println!("Enter: interrupt or listen   /chat, /voice: switch   q: quit");
    switcher.switch_to(start).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        match line.trim() {
            "q" | "/quit" => break,
            "/voice" => switcher.switch_to(PanelKind::Voice).await?,
            "/chat" => switcher.switch_to(PanelKind::Chat).await?,
            "" if switcher.current() == PanelKind::Voice => {
                if handle.state() == LoopState::Speaking {
                    handle.interrupt(InterruptCause::KeyPress)?;
                } else {
                    handle.start()?;
                }
            }
            "" => {}
            text if switcher.current() == PanelKind::Chat => {
                match switcher.chat().send(&ctx, text).await {
                    Ok(reply) => println!("assistant: {}", reply.content),
                    Err(e) => {
                        tracing::warn!("chat: {e}");
                        println!("  {}", e.status_message());
                    }
                }
            }
            _ => println!("  Type /chat to send text."),
        }
    }

    switcher.switch_to(PanelKind::Landing).await?;
    drop(switcher);
    drop(handle);
    if let Err(e) = loop_task.await {
        tracing::warn!("conversation loop task failed: {e}");
    }
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<LoopEvent>) {
    loop {
        match events.recv().await {
            Ok(LoopEvent::State(state)) => println!("[{}]", state_label(state)),
            Ok(LoopEvent::Status(status)) => println!("  {status}"),
            Ok(LoopEvent::Heard(transcript)) => println!("you: {transcript}"),
            Ok(LoopEvent::Reply(reply)) => println!("assistant: {}", reply.content),
            Err(RecvError::Lagged(skipped)) => tracing::debug!("skipped {skipped} loop events"),
            Err(RecvError::Closed) => break,
        }
    }
}

const fn state_label(state: LoopState) -> &'static str {
    match state {
        LoopState::Idle => "idle",
        LoopState::Listening => "listening",
        LoopState::AwaitingResponse => "thinking",
        LoopState::Speaking => "speaking",
        LoopState::Interrupted => "interrupted",
        LoopState::Failed => "error",
    }
}

const fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

async fn run_say(config: Config, text: &str, session: Option<String>) -> Result<(), VoxError> {
    let service = Arc::new(HttpConversationService::new(&config.service)?);
    let ctx = PanelContext {
        session: session_for(session),
        history: open_history(&config)?,
        round_trip: Arc::new(ConversationRoundTrip::new(
            Arc::clone(&service) as Arc<dyn ConversationService>,
        )),
    };

    let mut chat = ChatPanel::new();
    chat.activate(&ctx).await?;
    let reply = chat.send(&ctx, text).await?;

    println!("{}", reply.content);
    if let Some(audio_ref) = reply.audio_ref {
        println!("(audio: {})", service.resolve(&audio_ref));
    }
    Ok(())
}

fn run_history(
    config: &Config,
    session: &SessionId,
    clear: bool,
    export: Option<Option<PathBuf>>,
) -> Result<(), VoxError> {
    let store = open_history(config)?;

    if clear {
        let removed = store.clear_session(session)?;
        println!("Cleared {removed} message(s) from {session}.");
        return Ok(());
    }

    if let Some(path) = export {
        let transcript = TranscriptExport::build(store.as_ref(), session)?;
        let path =
            path.unwrap_or_else(|| PathBuf::from(TranscriptExport::default_file_name(session)));
        transcript.write(&path)?;
        println!(
            "Exported {} message(s) to {}",
            transcript.message_count,
            path.display()
        );
        return Ok(());
    }

    let messages = store.session_messages(session)?;
    if messages.is_empty() {
        println!("No messages in {session}.");
    }
    for message in &messages {
        println!(
            "[{}] {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            role_label(message.role),
            message.content
        );
    }
    Ok(())
}

async fn run_health(config: &Config) -> Result<(), VoxError> {
    let service = HttpConversationService::new(&config.service)?;
    match service.health().await {
        Ok(true) => println!("{} is reachable", config.service.base_url),
        Ok(false) => println!("{} answered, but not healthy", config.service.base_url),
        Err(e) => println!("{} is unreachable: {e}", config.service.base_url),
    }
    Ok(())
}
