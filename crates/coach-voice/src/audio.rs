//! Frame source: microphone capture via CPAL, emitted as fixed-size mono blocks.
//!
//! The CPAL stream lives on its own thread (the stream handle is `!Send` on some hosts),
//! so `CpalFrameSource` itself can be owned by the async engine. The capture callback
//! only assembles blocks and hands them to an unbounded channel; it never waits.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sender side of the block stream produced by a frame source.
pub type BlockSender = mpsc::UnboundedSender<AudioBlock>;

/// Capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Requested sample rate in Hz (default: 44100). The device default is used if it differs.
    pub sample_rate: u32,

    /// Samples per emitted block (default: 2048, ~46ms at 44.1kHz)
    pub block_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            block_size: 2048,
        }
    }
}

/// One fixed-length block of mono samples, normalized to -1.0..1.0
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    /// Wall-clock span of the block; also its real-time processing budget.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// A device that can be opened for one capture session at a time.
pub trait FrameSource: Send {
    /// Acquire the device and start delivering blocks to `blocks`. Opening while already
    /// open tears down the previous session first.
    fn open(&mut self, blocks: BlockSender) -> VoiceResult<()>;

    /// Release the device. Dropping the block sender ends the consumer's stream.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Downmixes interleaved frames and cuts them into fixed-size blocks.
pub struct BlockAssembler {
    block_size: usize,
    channels: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize, channels: usize, sample_rate: u32) -> Self {
        Self {
            block_size,
            channels: channels.max(1),
            sample_rate,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Feed interleaved samples; `emit` is called once per completed block.
    pub fn push_interleaved(&mut self, data: &[f32], mut emit: impl FnMut(AudioBlock)) {
        for frame in data.chunks(self.channels) {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            self.pending.push(mono);
            if self.pending.len() == self.block_size {
                let samples =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                emit(AudioBlock::new(samples, self.sample_rate));
            }
        }
    }
}

/// Default-input-device capture through CPAL.
///
/// Opens the device in shared mode, so a platform echo-cancelling capture that already
/// holds the microphone does not prevent this one from starting.
pub struct CpalFrameSource {
    config: AudioConfig,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalFrameSource {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            stop_tx: None,
            thread: None,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    fn build_stream(config: &AudioConfig, blocks: BlockSender) -> VoiceResult<Stream> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;

        info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let default_config = device.default_input_config()?;
        let sample_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        if sample_rate != config.sample_rate {
            warn!(
                requested = config.sample_rate,
                actual = sample_rate,
                "Input device does not run at the requested rate; using device default"
            );
        }

        let stream_config: StreamConfig = default_config.clone().into();
        let mut assembler = BlockAssembler::new(config.block_size, channels, sample_rate);
        let err_fn = |err: cpal::StreamError| warn!("Audio stream error: {}", err);

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    assembler.push_interleaved(data, |block| {
                        let _ = blocks.send(block);
                    });
                },
                err_fn,
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    assembler.push_interleaved(&converted, |block| {
                        let _ = blocks.send(block);
                    });
                },
                err_fn,
                None,
            )?,
            SampleFormat::U16 => device.build_input_stream(
                &stream_config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> = data
                        .iter()
                        .map(|&s| (s as f32 - 32768.0) / 32768.0)
                        .collect();
                    assembler.push_interleaved(&converted, |block| {
                        let _ = blocks.send(block);
                    });
                },
                err_fn,
                None,
            )?,
            other => {
                return Err(VoiceError::DeviceUnavailable(format!(
                    "Unsupported sample format {:?} (need F32, I16 or U16)",
                    other
                )))
            }
        };

        Ok(stream)
    }
}

impl FrameSource for CpalFrameSource {
    fn open(&mut self, blocks: BlockSender) -> VoiceResult<()> {
        self.close();
        info!("▶️ Starting audio capture stream");

        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("coach-capture".to_string())
            .spawn(move || {
                let stream = match Self::build_stream(&config, blocks) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Parked until close() sends or drops the stop channel.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Capture thread released the input device");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
                info!("✅ Audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(VoiceError::DeviceUnavailable(
                    "capture thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            info!("⏹️ Audio capture stopped");
        }
    }

    fn is_open(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
