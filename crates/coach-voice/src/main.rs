//! Coach voice front end.
//!
//! Press Enter to toggle the microphone, type `stop` to go idle or `quit` to exit.
//! Configuration comes from `COACH_*` variables (see `config.rs`) and an optional `.env`.

use coach_voice::{
    classifier_factory, create_best_stt, hydrate_session, AudioConfig, Collaborators,
    CoachConfig, CpalFrameSource, Engine, EngineSettings, EngineState,
    EngineUpdate, FrameSource, GapRecognizer, HttpDialogueClient, HttpSynthesizer,
    MonitorSettings, MonitoredCapture, Notice, RodioSink, SegmenterSettings, Session, SessionId,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: coach-voice [--auto-start] [--list-devices]

  --auto-start     start listening immediately
  --list-devices   print input devices and exit

While running: Enter toggles the microphone, `stop` goes idle, `quit` exits.";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[coach-voice] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.iter().any(|a| a == "--list-devices") {
        for name in CpalFrameSource::list_input_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }
    let auto_start = args.iter().any(|a| a == "--auto-start");

    let config = CoachConfig::load()?;
    let session_id = config
        .session_id
        .clone()
        .map(SessionId::from)
        .unwrap_or_else(SessionId::generate);
    tracing::info!(
        session_id = %session_id,
        backend = %config.backend_url,
        classifier = ?config.classifier,
        block_ms = config.block_duration().as_millis() as u64,
        "Coach voice starting"
    );

    let dialogue = Arc::new(HttpDialogueClient::new(config.backend_url.clone()));
    let mut session = Session::new(session_id);
    if config.hydrate_history {
        let hydrate = hydrate_session(&*dialogue, &mut session);
        if tokio::time::timeout(config.request_timeout(), hydrate).await.is_err() {
            tracing::warn!("History request timed out; starting with an empty session");
        }
        for turn in session.turns() {
            println!("  [{:?}] {}", turn.role, turn.text);
        }
    }

    let (tap_tx, tap_rx) = mpsc::unbounded_channel();
    let source: Box<dyn FrameSource> = Box::new(CpalFrameSource::new(AudioConfig {
        sample_rate: config.sample_rate,
        block_size: config.block_size,
    }));
    let capture = MonitoredCapture::new(
        source,
        classifier_factory(config.classifier, config.vad_threshold),
        MonitorSettings {
            cooldown: config.barge_in_cooldown(),
            min_blocks: config.barge_in_min_blocks,
        },
        tap_tx,
    );
    let recognizer = GapRecognizer::spawn(
        tap_rx,
        create_best_stt(),
        SegmenterSettings {
            silence_gap: config.silence_gap(),
            min_speech: config.min_speech(),
            max_utterance: config.max_utterance(),
            listen_timeout: config.listen_timeout(),
            pre_roll: config.pre_roll(),
        },
        config.request_timeout(),
    );
    let sink = RodioSink::new()?;

    let (engine, handle, mut updates) = Engine::new(
        EngineSettings::from(&config),
        session,
        Collaborators {
            capture: Box::new(capture),
            recognizer: Box::new(recognizer),
            dialogue,
            synthesizer: Arc::new(HttpSynthesizer::new(config.backend_url.clone())),
            sink: Box::new(sink),
        },
    );
    let engine_task = tokio::spawn(engine.run());

    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update {
                EngineUpdate::StateChanged { to, .. } => println!("● {}", to),
                EngineUpdate::TurnAppended(turn) => {
                    let tags = match (&turn.emotion, &turn.intent) {
                        (Some(e), Some(i)) => format!(" ({}, {})", e, i),
                        (Some(e), None) => format!(" ({})", e),
                        (None, Some(i)) => format!(" ({})", i),
                        (None, None) => String::new(),
                    };
                    println!("  [{:?}] {}{}", turn.role, turn.text, tags);
                }
                EngineUpdate::Notice(notice) => match notice {
                    Notice::DeviceUnavailable(m) => println!("⚠ Microphone unavailable: {}", m),
                    Notice::TranscriptionFailed(m) => println!("⚠ Could not transcribe: {}", m),
                    Notice::DialogueUnavailable(m) => println!("⚠ Coach unavailable: {}", m),
                    Notice::SynthesisUnavailable(m) => println!("⚠ Could not speak reply: {}", m),
                },
                EngineUpdate::Interrupted { active: true } => println!("✋ interrupted"),
                EngineUpdate::Interrupted { active: false } => {}
            }
        }
    });

    if auto_start {
        handle.start()?;
    }
    println!("{}", USAGE.lines().last().unwrap_or_default());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {
                        if handle.state() == EngineState::Idle {
                            handle.start()?;
                        } else {
                            handle.stop()?;
                        }
                    }
                    "stop" => handle.stop()?,
                    "quit" | "exit" => break,
                    other => println!("unknown command '{}'", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    handle.shutdown()?;
    let session = engine_task.await?;
    tracing::info!(turns = session.len(), "Session closed");
    Ok(())
}
