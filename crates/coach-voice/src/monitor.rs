//! Barge-in monitor: turns per-block speech verdicts into at most one interruption per
//! speech episode, and only while the system is speaking.
//!
//! `MonitoredCapture` owns the frame source and runs the monitor on a dedicated thread, so
//! classification never waits on the engine. Every classified block is also forwarded to
//! the recognizer tap.

use crate::audio::{AudioBlock, FrameSource};
use crate::classifier::{ClassifierFactory, SpeechClassifier};
use crate::engine::{EngineEvent, EventSender};
use crate::error::{VoiceError, VoiceResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Debounce and suppression settings.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Quiet period after an interruption is raised (2s in the web client).
    pub cooldown: Duration,
    /// Contiguous speech blocks needed before an interruption is raised.
    pub min_blocks: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(2),
            min_blocks: 1,
        }
    }
}

/// Outcome of feeding one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub speech: bool,
    pub interrupt: bool,
}

/// Wraps a classifier and tracks the current speech episode.
pub struct BargeInMonitor {
    classifier: Box<dyn SpeechClassifier>,
    settings: MonitorSettings,
    run: u32,
    raised_this_episode: bool,
    suppress_until: Option<Instant>,
}

impl BargeInMonitor {
    pub fn new(classifier: Box<dyn SpeechClassifier>, settings: MonitorSettings) -> Self {
        Self {
            classifier,
            settings,
            run: 0,
            raised_this_episode: false,
            suppress_until: None,
        }
    }

    /// Classify one block. `speaking` is whether system playback is active right now; `now`
    /// is the instant the cool-down is measured against.
    pub fn feed(&mut self, block: &AudioBlock, speaking: bool, now: Instant) -> Verdict {
        let speech = self.classifier.classify(block);
        let interrupt = self.observe(speech, speaking, now);
        Verdict { speech, interrupt }
    }

    fn observe(&mut self, speech: bool, speaking: bool, now: Instant) -> bool {
        if !speech {
            self.run = 0;
            self.raised_this_episode = false;
            return false;
        }
        self.run = self.run.saturating_add(1);

        if !speaking || self.raised_this_episode {
            return false;
        }
        if self.suppress_until.is_some_and(|until| now < until) {
            return false;
        }
        if self.run < self.settings.min_blocks {
            return false;
        }

        self.raised_this_episode = true;
        self.suppress_until = Some(now + self.settings.cooldown);
        true
    }
}

/// Shared "system is speaking" flag. Written by the engine, read by the monitor thread.
#[derive(Debug, Clone, Default)]
pub struct SpeakingGate(Arc<AtomicBool>);

impl SpeakingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, speaking: bool) {
        self.0.store(speaking, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A block together with its classifier verdict.
#[derive(Debug, Clone)]
pub struct ClassifiedBlock {
    pub block: AudioBlock,
    pub speech: bool,
}

/// What the engine needs from capture: one open session at a time.
pub trait CaptureControl: Send {
    /// Start capture. Interruptions go to `inbox`; `gate` says whether playback is active.
    fn open(&mut self, inbox: EventSender, gate: SpeakingGate) -> VoiceResult<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Frame source plus barge-in monitor, run on a `coach-monitor` thread.
pub struct MonitoredCapture {
    source: Box<dyn FrameSource>,
    factory: ClassifierFactory,
    settings: MonitorSettings,
    tap: mpsc::UnboundedSender<ClassifiedBlock>,
    worker: Option<thread::JoinHandle<()>>,
}

impl MonitoredCapture {
    pub fn new(
        source: Box<dyn FrameSource>,
        factory: ClassifierFactory,
        settings: MonitorSettings,
        tap: mpsc::UnboundedSender<ClassifiedBlock>,
    ) -> Self {
        Self {
            source,
            factory,
            settings,
            tap,
            worker: None,
        }
    }
}

impl CaptureControl for MonitoredCapture {
    fn open(&mut self, inbox: EventSender, gate: SpeakingGate) -> VoiceResult<()> {
        self.close();

        let (blocks_tx, mut blocks_rx) = mpsc::unbounded_channel::<AudioBlock>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let factory = self.factory.clone();
        let settings = self.settings;
        let tap = self.tap.clone();

        let worker = thread::Builder::new()
            .name("coach-monitor".to_string())
            .spawn(move || {
                let classifier = match factory() {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let mut monitor = BargeInMonitor::new(classifier, settings);

                while let Some(block) = blocks_rx.blocking_recv() {
                    let started = Instant::now();
                    // cool-down runs on capture time, so queueing delay does not stretch it
                    let verdict = monitor.feed(&block, gate.is_speaking(), block.captured_at);
                    let elapsed = started.elapsed();
                    if elapsed > block.duration() {
                        warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            budget_ms = block.duration().as_millis() as u64,
                            "Classifier exceeded the block budget"
                        );
                    }
                    if verdict.interrupt {
                        info!("⚡ Barge-in: user speech during playback");
                        if inbox.send(EngineEvent::BargeIn).is_err() {
                            break;
                        }
                    }
                    let _ = tap.send(ClassifiedBlock {
                        block,
                        speech: verdict.speech,
                    });
                }
                debug!("Monitor thread finished");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(VoiceError::Classifier(
                    "monitor thread exited before the classifier was ready".to_string(),
                ));
            }
        }

        // A failed open drops the block sender, which ends the worker loop.
        if let Err(e) = self.source.open(blocks_tx) {
            let _ = worker.join();
            return Err(e);
        }
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        self.source.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn is_open(&self) -> bool {
        self.worker.is_some() && self.source.is_open()
    }
}

impl Drop for MonitoredCapture {
    fn drop(&mut self) {
        self.close();
    }
}
