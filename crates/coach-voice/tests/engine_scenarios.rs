//! End-to-end behaviour of the turn-taking engine against in-process collaborators.
//!
//! No audio hardware or network is touched: capture, recognition, dialogue, synthesis and
//! the output device are all fakes that record what the engine asked of them.

use coach_voice::{
    AudioBlock, AudioSink, BargeInMonitor, CaptureControl, ClassifiedBlock, Collaborators,
    DialogueFailurePolicy, DialogueReply, DialogueService, Engine, EngineEvent, EngineHandle,
    EngineSettings, EngineState, EngineUpdate, EventSender, GapRecognizer, HistoryEntry,
    MonitorSettings, Notice, PlaceholderStt, PlaybackHandle, PlaybackOutcome, Recognizer, Role,
    ScriptedClassifier, SegmenterSettings, Session, SessionId, SpeakingGate, Synthesizer,
    VoiceError, VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureLog {
    wiring: Mutex<Option<(EventSender, SpeakingGate)>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    /// Set by the test while a held `open` is waiting on it.
    released: AtomicBool,
}

impl CaptureLog {
    /// Run `blocks` blocks through a real monitor, as the capture thread would.
    fn speak(&self, monitor: &mut BargeInMonitor, blocks: usize) -> usize {
        let wiring = self.wiring.lock().unwrap();
        let (inbox, gate) = wiring.as_ref().expect("capture was never opened");
        let mut raised = 0;
        for _ in 0..blocks {
            let block = AudioBlock::new(vec![0.2; 2048], 44_100);
            if monitor.feed(&block, gate.is_speaking(), Instant::now()).interrupt {
                inbox.send(EngineEvent::BargeIn).unwrap();
                raised += 1;
            }
        }
        raised
    }

    fn inject(&self, event: EngineEvent) {
        let wiring = self.wiring.lock().unwrap();
        wiring.as_ref().unwrap().0.send(event).unwrap();
    }
}

struct FakeCapture {
    log: Arc<CaptureLog>,
    fail: bool,
    /// Block inside `open` until the test sets `released`, like a slow device thread.
    hold: bool,
    open: bool,
}

impl CaptureControl for FakeCapture {
    fn open(&mut self, inbox: EventSender, gate: SpeakingGate) -> VoiceResult<()> {
        if self.fail {
            return Err(VoiceError::DeviceUnavailable("permission denied".into()));
        }
        if self.hold {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !self.log.released.load(Ordering::SeqCst) {
                if Instant::now() > deadline {
                    return Err(VoiceError::DeviceUnavailable("device never came up".into()));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        *self.log.wiring.lock().unwrap() = Some((inbox, gate));
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Default)]
struct RecognizerLog {
    script: Mutex<VecDeque<VoiceResult<String>>>,
    begins: Mutex<Vec<u64>>,
    cancels: AtomicUsize,
}

impl RecognizerLog {
    /// Ticket of the listening session the engine opened last.
    fn current_ticket(&self) -> u64 {
        *self.begins.lock().unwrap().last().expect("no session opened")
    }
}

/// Answers each listening session with the next scripted transcript; stays silent once the
/// script runs out.
struct FakeRecognizer(Arc<RecognizerLog>);

impl Recognizer for FakeRecognizer {
    fn begin(&mut self, ticket: u64, sink: EventSender) -> VoiceResult<()> {
        self.0.begins.lock().unwrap().push(ticket);
        if let Some(result) = self.0.script.lock().unwrap().pop_front() {
            let _ = sink.send(EngineEvent::Transcript { ticket, result });
        }
        Ok(())
    }

    fn cancel(&mut self) {
        self.0.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeDialogue {
    reply: Option<DialogueReply>,
    stall: bool,
    release: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl DialogueService for FakeDialogue {
    async fn converse(&self, _session: &SessionId, _transcript: &str) -> VoiceResult<DialogueReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            std::future::pending::<()>().await;
        }
        if let Some(release) = &self.release {
            release.notified().await;
        }
        self.reply
            .clone()
            .ok_or_else(|| VoiceError::DialogueUnavailable("503 Service Unavailable".into()))
    }

    async fn history(&self, _session: &SessionId) -> VoiceResult<Vec<HistoryEntry>> {
        Ok(Vec::new())
    }
}

struct FakeSynth {
    result: Result<Vec<u8>, String>,
    stall: bool,
}

#[async_trait::async_trait]
impl Synthesizer for FakeSynth {
    async fn synthesize(&self, _text: &str, _emotion: Option<&str>) -> VoiceResult<Vec<u8>> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.result.clone().map_err(VoiceError::SynthesisUnavailable)
    }
}

#[derive(Default)]
struct SinkLog {
    plays: Mutex<Vec<(u64, EventSender)>>,
    stops: AtomicUsize,
}

impl SinkLog {
    fn end_last(&self, outcome: PlaybackOutcome) {
        let plays = self.plays.lock().unwrap();
        let (ticket, done) = plays.last().expect("nothing played");
        done.send(EngineEvent::PlaybackEnded {
            ticket: *ticket,
            outcome,
        })
        .unwrap();
    }

    fn play_count(&self) -> usize {
        self.plays.lock().unwrap().len()
    }
}

struct FakeSink(Arc<SinkLog>);

impl AudioSink for FakeSink {
    fn play(&mut self, ticket: u64, _audio: Vec<u8>, done: EventSender) -> VoiceResult<PlaybackHandle> {
        self.0.plays.lock().unwrap().push((ticket, done));
        let log = self.0.clone();
        Ok(PlaybackHandle::new(ticket, move || {
            log.stops.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Setup {
    transcripts: Vec<VoiceResult<String>>,
    dialogue: FakeDialogue,
    synth: Result<Vec<u8>, String>,
    synth_stalls: bool,
    capture_fails: bool,
    capture_holds: bool,
    policy: DialogueFailurePolicy,
    /// Replaces the scripted recognizer.
    recognizer: Option<Box<dyn Recognizer>>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            transcripts: vec![Ok("I feel stressed today".into())],
            dialogue: FakeDialogue {
                reply: Some(venting_reply()),
                ..Default::default()
            },
            synth: Ok(vec![0xFF, 0xFB, 0x90, 0x00]),
            synth_stalls: false,
            capture_fails: false,
            capture_holds: false,
            policy: DialogueFailurePolicy::Idle,
            recognizer: None,
        }
    }
}

fn venting_reply() -> DialogueReply {
    DialogueReply {
        response: "I hear you. That sounds like a lot to carry.".into(),
        detected_emotion: Some("sad".into()),
        intent: Some("venting".into()),
        confidence: None,
    }
}

struct Harness {
    handle: EngineHandle,
    updates: mpsc::UnboundedReceiver<EngineUpdate>,
    seen: Vec<EngineUpdate>,
    capture: Arc<CaptureLog>,
    recognizer: Arc<RecognizerLog>,
    dialogue: Arc<FakeDialogue>,
    sink: Arc<SinkLog>,
    task: JoinHandle<Session>,
}

fn launch(setup: Setup) -> Harness {
    let capture = Arc::new(CaptureLog::default());
    let recognizer = Arc::new(RecognizerLog {
        script: Mutex::new(setup.transcripts.into_iter().collect()),
        ..Default::default()
    });
    let dialogue = Arc::new(setup.dialogue);
    let sink = Arc::new(SinkLog::default());

    let settings = EngineSettings {
        on_dialogue_failure: setup.policy,
        ..Default::default()
    };
    let (engine, handle, updates) = Engine::new(
        settings,
        Session::new("session_test".into()),
        Collaborators {
            capture: Box::new(FakeCapture {
                log: capture.clone(),
                fail: setup.capture_fails,
                hold: setup.capture_holds,
                open: false,
            }),
            recognizer: setup
                .recognizer
                .unwrap_or_else(|| Box::new(FakeRecognizer(recognizer.clone()))),
            dialogue: dialogue.clone(),
            synthesizer: Arc::new(FakeSynth {
                result: setup.synth,
                stall: setup.synth_stalls,
            }),
            sink: Box::new(FakeSink(sink.clone())),
        },
    );
    Harness {
        handle,
        updates,
        seen: Vec::new(),
        capture,
        recognizer,
        dialogue,
        sink,
        task: tokio::spawn(engine.run()),
    }
}

impl Harness {
    async fn until(&mut self, pred: impl Fn(&EngineUpdate) -> bool) -> EngineUpdate {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let update = self.updates.recv().await.expect("engine stopped");
                self.seen.push(update.clone());
                if pred(&update) {
                    return update;
                }
            }
        })
        .await
        .expect("expected update never arrived")
    }

    async fn reach(&mut self, state: EngineState) {
        self.until(|u| matches!(u, EngineUpdate::StateChanged { to, .. } if *to == state))
            .await;
    }

    /// Shut the engine down and return the session plus every update it published.
    async fn finish(mut self) -> (Session, Vec<EngineUpdate>) {
        self.handle.shutdown().unwrap();
        let session = self.task.await.unwrap();
        while let Some(update) = self.updates.recv().await {
            self.seen.push(update);
        }
        (session, self.seen)
    }
}

fn transitions(updates: &[EngineUpdate]) -> Vec<(EngineState, EngineState)> {
    updates
        .iter()
        .filter_map(|u| match u {
            EngineUpdate::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

fn assert_speaking_only_from_processing(updates: &[EngineUpdate]) {
    for (from, to) in transitions(updates) {
        if to == EngineState::Speaking {
            assert_eq!(from, EngineState::Processing);
        }
    }
}

fn barge_in_monitor(min_blocks: u32) -> BargeInMonitor {
    BargeInMonitor::new(
        Box::new(ScriptedClassifier::new(vec![true; 64])),
        MonitorSettings {
            cooldown: Duration::from_secs(2),
            min_blocks,
        },
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reply_is_recorded_in_order_and_spoken() {
    let mut h = launch(Setup::default());
    h.handle.start().unwrap();
    h.reach(EngineState::Speaking).await;

    assert_eq!(
        transitions(&h.seen),
        vec![
            (EngineState::Idle, EngineState::Listening),
            (EngineState::Listening, EngineState::Processing),
            (EngineState::Processing, EngineState::Speaking),
        ]
    );
    assert_eq!(h.sink.play_count(), 1);
    assert!(h.capture.wiring.lock().unwrap().as_ref().unwrap().1.is_speaking());

    let (session, updates) = h.finish().await;
    let turns = session.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "I feel stressed today");
    assert_eq!(turns[1].role, Role::System);
    assert_eq!(turns[1].emotion.as_deref(), Some("sad"));
    assert_eq!(turns[1].intent.as_deref(), Some("venting"));

    let appended: Vec<Role> = updates
        .iter()
        .filter_map(|u| match u {
            EngineUpdate::TurnAppended(t) => Some(t.role),
            _ => None,
        })
        .collect();
    assert_eq!(appended, vec![Role::User, Role::System]);
}

#[tokio::test]
async fn completed_playback_reopens_listening() {
    let mut h = launch(Setup::default());
    h.handle.start().unwrap();
    h.reach(EngineState::Speaking).await;

    h.sink.end_last(PlaybackOutcome::Completed);
    h.reach(EngineState::Listening).await;

    assert_eq!(h.recognizer.begins.lock().unwrap().len(), 2);
    assert_eq!(h.sink.stops.load(Ordering::SeqCst), 0);
    assert_eq!(h.capture.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 0);
    let (_, updates) = h.finish().await;
    assert_speaking_only_from_processing(&updates);
}

#[tokio::test(start_paused = true)]
async fn barge_in_stops_playback_and_flags_interruption_for_two_seconds() {
    let mut h = launch(Setup::default());
    h.handle.start().unwrap();
    h.reach(EngineState::Speaking).await;

    let mut monitor = barge_in_monitor(3);
    assert_eq!(h.capture.speak(&mut monitor, 3), 1);
    h.reach(EngineState::Listening).await;
    let raised_at = tokio::time::Instant::now();

    assert_eq!(h.sink.stops.load(Ordering::SeqCst), 1);
    assert!(h.seen.contains(&EngineUpdate::Interrupted { active: true }));
    assert!(!h.capture.wiring.lock().unwrap().as_ref().unwrap().1.is_speaking());

    h.until(|u| *u == EngineUpdate::Interrupted { active: false }).await;
    assert!(raised_at.elapsed() >= Duration::from_secs(2));

    // the cancelled playback reporting in late changes nothing
    h.sink.end_last(PlaybackOutcome::Cancelled);
    let (_, updates) = h.finish().await;
    assert_speaking_only_from_processing(&updates);
    assert_eq!(
        transitions(&updates).last(),
        Some(&(EngineState::Listening, EngineState::Idle))
    );
}

#[tokio::test]
async fn continued_speech_raises_a_single_interruption() {
    let mut h = launch(Setup::default());
    h.handle.start().unwrap();
    h.reach(EngineState::Speaking).await;

    let mut monitor = barge_in_monitor(1);
    assert_eq!(h.capture.speak(&mut monitor, 40), 1);
    h.reach(EngineState::Listening).await;
    let (_, updates) = h.finish().await;
    let raised = updates
        .iter()
        .filter(|u| **u == EngineUpdate::Interrupted { active: true })
        .count();
    assert_eq!(raised, 1);
}

#[tokio::test]
async fn no_interruption_outside_speaking() {
    let mut h = launch(Setup {
        transcripts: vec![],
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.reach(EngineState::Listening).await;

    let mut monitor = barge_in_monitor(1);
    assert_eq!(h.capture.speak(&mut monitor, 20), 0);
    // a stray event is ignored by the engine as well
    h.capture.inject(EngineEvent::BargeIn);

    let (_, updates) = h.finish().await;
    assert!(!updates
        .iter()
        .any(|u| matches!(u, EngineUpdate::Interrupted { .. })));
    assert_eq!(exits_from_speaking(&updates), 0);
}

fn exits_from_speaking(updates: &[EngineUpdate]) -> usize {
    transitions(updates)
        .iter()
        .filter(|(from, _)| *from == EngineState::Speaking)
        .count()
}

#[tokio::test]
async fn empty_transcript_goes_idle_without_calling_dialogue() {
    let mut h = launch(Setup {
        transcripts: vec![Ok("   ".into())],
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.reach(EngineState::Idle).await;

    assert_eq!(
        transitions(&h.seen),
        vec![
            (EngineState::Idle, EngineState::Listening),
            (EngineState::Listening, EngineState::Idle),
        ]
    );
    assert_eq!(h.dialogue.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 1);
    let (session, updates) = h.finish().await;
    assert!(session.is_empty());
    assert!(!updates.iter().any(|u| matches!(u, EngineUpdate::Notice(_))));
}

#[tokio::test]
async fn transcription_error_is_surfaced_and_goes_idle() {
    let mut h = launch(Setup {
        transcripts: vec![Err(VoiceError::Transcription("STT API error 500".into()))],
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.until(|u| matches!(u, EngineUpdate::Notice(Notice::TranscriptionFailed(_))))
        .await;
    h.reach(EngineState::Idle).await;
    assert_eq!(h.dialogue.calls.load(Ordering::SeqCst), 0);
    h.finish().await;
}

#[tokio::test]
async fn synthesis_failure_keeps_reply_and_listens_again() {
    let mut h = launch(Setup {
        synth: Err("TTS API error 502".into()),
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.until(|u| matches!(u, EngineUpdate::Notice(Notice::SynthesisUnavailable(_))))
        .await;
    h.reach(EngineState::Listening).await;

    assert_eq!(h.sink.play_count(), 0);
    let (session, updates) = h.finish().await;
    assert_eq!(
        transitions(&updates)[..3],
        [
            (EngineState::Idle, EngineState::Listening),
            (EngineState::Listening, EngineState::Processing),
            (EngineState::Processing, EngineState::Listening),
        ]
    );
    assert_eq!(session.len(), 2);
    assert_eq!(session.turns()[1].text, venting_reply().response);
}

#[tokio::test]
async fn dialogue_failure_goes_idle_by_default() {
    let mut h = launch(Setup {
        dialogue: FakeDialogue::default(),
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.until(|u| matches!(u, EngineUpdate::Notice(Notice::DialogueUnavailable(_))))
        .await;
    h.reach(EngineState::Idle).await;
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 1);
    let (session, _) = h.finish().await;
    assert!(session.is_empty());
}

#[tokio::test]
async fn dialogue_failure_can_listen_again() {
    let mut h = launch(Setup {
        dialogue: FakeDialogue::default(),
        policy: DialogueFailurePolicy::Listen,
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.reach(EngineState::Processing).await;
    h.reach(EngineState::Listening).await;
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 0);
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_dialogue_times_out() {
    let mut h = launch(Setup {
        dialogue: FakeDialogue {
            stall: true,
            ..Default::default()
        },
        ..Default::default()
    });
    let started = tokio::time::Instant::now();
    h.handle.start().unwrap();
    h.until(|u| matches!(u, EngineUpdate::Notice(Notice::DialogueUnavailable(_))))
        .await;
    assert!(started.elapsed() >= Duration::from_secs(15));
    h.reach(EngineState::Idle).await;
    h.finish().await;
}

#[tokio::test]
async fn late_reply_after_stop_is_discarded() {
    let release = Arc::new(Notify::new());
    let mut h = launch(Setup {
        dialogue: FakeDialogue {
            reply: Some(venting_reply()),
            release: Some(release.clone()),
            ..Default::default()
        },
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.reach(EngineState::Processing).await;

    h.handle.stop().unwrap();
    h.reach(EngineState::Idle).await;
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.handle.state(), EngineState::Idle);
    assert_eq!(h.sink.play_count(), 0);
    let (session, updates) = h.finish().await;
    assert!(session.is_empty());
    assert!(!updates
        .iter()
        .any(|u| matches!(u, EngineUpdate::TurnAppended(_))));
}

#[tokio::test]
async fn stop_twice_signals_once() {
    let mut h = launch(Setup::default());
    h.handle.start().unwrap();
    h.reach(EngineState::Speaking).await;

    h.handle.stop().unwrap();
    h.handle.stop().unwrap();
    h.handle.wait_for_state(EngineState::Idle).await.unwrap();

    let sink = h.sink.clone();
    let capture = h.capture.clone();
    let (_, updates) = h.finish().await;
    let idles = transitions(&updates)
        .iter()
        .filter(|(_, to)| *to == EngineState::Idle)
        .count();
    assert_eq!(idles, 1);
    assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    assert_eq!(capture.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_while_listening_cancels_recognition() {
    let mut h = launch(Setup {
        transcripts: vec![],
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.reach(EngineState::Listening).await;
    h.handle.stop().unwrap();
    h.reach(EngineState::Idle).await;
    assert_eq!(h.recognizer.cancels.load(Ordering::SeqCst), 1);
    h.finish().await;
}

#[tokio::test]
async fn missing_microphone_stays_idle_with_notice() {
    let mut h = launch(Setup {
        capture_fails: true,
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.until(|u| matches!(u, EngineUpdate::Notice(Notice::DeviceUnavailable(_))))
        .await;
    assert_eq!(h.handle.state(), EngineState::Idle);
    assert!(h.recognizer.begins.lock().unwrap().is_empty());
    let (_, updates) = h.finish().await;
    assert!(transitions(&updates).is_empty());
}

#[tokio::test]
async fn start_while_speaking_silences_reply_without_interruption() {
    let mut h = launch(Setup::default());
    h.handle.start().unwrap();
    h.reach(EngineState::Speaking).await;

    h.handle.start().unwrap();
    h.reach(EngineState::Listening).await;

    assert_eq!(h.sink.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.capture.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.recognizer.begins.lock().unwrap().len(), 2);
    let (_, updates) = h.finish().await;
    assert!(!updates
        .iter()
        .any(|u| matches!(u, EngineUpdate::Interrupted { .. })));
    assert_eq!(
        transitions(&updates)[2..4],
        [
            (EngineState::Processing, EngineState::Speaking),
            (EngineState::Speaking, EngineState::Listening),
        ]
    );
}

#[tokio::test]
async fn playback_failure_is_surfaced_and_listens_again() {
    let mut h = launch(Setup::default());
    h.handle.start().unwrap();
    h.reach(EngineState::Speaking).await;

    h.sink
        .end_last(PlaybackOutcome::Failed("output device lost".into()));
    h.until(|u| matches!(u, EngineUpdate::Notice(Notice::SynthesisUnavailable(_))))
        .await;
    h.reach(EngineState::Listening).await;

    assert_eq!(h.recognizer.begins.lock().unwrap().len(), 2);
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 0);
    let (session, updates) = h.finish().await;
    assert_eq!(session.len(), 2);
    assert_eq!(exits_from_speaking(&updates), 1);
}

#[tokio::test]
async fn barge_in_queued_behind_audio_applies_after_speaking_starts() {
    let mut h = launch(Setup {
        synth_stalls: true,
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.until(|u| matches!(u, EngineUpdate::TurnAppended(t) if t.role == Role::System))
        .await;
    assert_eq!(h.handle.state(), EngineState::Processing);

    // audio and the interruption land in the inbox back to back
    let ticket = h.recognizer.current_ticket();
    h.capture.inject(EngineEvent::Synthesized {
        ticket,
        result: Ok(vec![0xFF, 0xFB]),
    });
    h.capture.inject(EngineEvent::BargeIn);
    h.reach(EngineState::Speaking).await;
    h.reach(EngineState::Listening).await;

    assert_eq!(h.sink.play_count(), 1);
    assert_eq!(h.sink.stops.load(Ordering::SeqCst), 1);
    assert!(h.seen.contains(&EngineUpdate::Interrupted { active: true }));
    let (_, updates) = h.finish().await;
    assert_eq!(
        transitions(&updates),
        vec![
            (EngineState::Idle, EngineState::Listening),
            (EngineState::Listening, EngineState::Processing),
            (EngineState::Processing, EngineState::Speaking),
            (EngineState::Speaking, EngineState::Listening),
            (EngineState::Listening, EngineState::Idle),
        ]
    );
}

#[tokio::test]
async fn silent_listening_session_times_out_to_idle() {
    let (tap_tx, tap_rx) = mpsc::unbounded_channel();
    let recognizer = GapRecognizer::spawn(
        tap_rx,
        Arc::new(PlaceholderStt::new()),
        SegmenterSettings {
            listen_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        Duration::from_secs(15),
    );
    let mut h = launch(Setup {
        recognizer: Some(Box::new(recognizer)),
        ..Default::default()
    });
    h.handle.start().unwrap();
    h.reach(EngineState::Listening).await;

    // 1.2s of room tone in 100ms blocks
    for _ in 0..12 {
        tap_tx
            .send(ClassifiedBlock {
                block: AudioBlock::new(vec![0.0; 1600], 16_000),
                speech: false,
            })
            .unwrap();
    }
    h.reach(EngineState::Idle).await;

    assert_eq!(h.dialogue.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 1);
    let (_, updates) = h.finish().await;
    assert_eq!(
        transitions(&updates),
        vec![
            (EngineState::Idle, EngineState::Listening),
            (EngineState::Listening, EngineState::Idle),
        ]
    );
    assert!(!updates.iter().any(|u| matches!(u, EngineUpdate::Notice(_))));
}

#[tokio::test]
async fn slow_capture_open_leaves_the_runtime_free() {
    let mut h = launch(Setup {
        transcripts: vec![],
        capture_holds: true,
        ..Default::default()
    });
    h.handle.start().unwrap();
    // runs on the same single runtime thread as the engine
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.capture.released.store(true, Ordering::SeqCst);
    h.reach(EngineState::Listening).await;

    assert_eq!(h.capture.opens.load(Ordering::SeqCst), 1);
    let (_, updates) = h.finish().await;
    assert!(!updates.iter().any(|u| matches!(u, EngineUpdate::Notice(_))));
}
