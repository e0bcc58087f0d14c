//! Audio capture and playback devices.
//!
//! The session engine only sees the [`CaptureDevice`], [`OutputDevice`] and
//! [`AudioBackend`] seams. [`SystemAudio`] backs them with CPAL (microphone) and
//! Rodio (speaker). Both libraries hand out `!Send` stream objects, so each
//! device lives on its own thread and is driven over channels.

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{ChunkId, ScheduledChunk};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig};
use futures::stream::{BoxStream, StreamExt};
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, Sink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// A fixed-length block of captured mono samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// When the frame was completed by the capture callback
    pub captured_at: Instant,
}

/// Infinite, non-restartable sequence of captured frames. An `Err` item or
/// the end of the stream means the microphone is gone.
pub type FrameStream = BoxStream<'static, VoiceResult<AudioFrame>>;

/// Notification that a scheduled chunk finished playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackEnded {
    pub id: ChunkId,
}

/// Exclusive handle on an acquired microphone.
pub trait CaptureDevice: Send {
    /// Stop capturing and give the device back. Called at most once per session.
    fn release(&mut self) -> VoiceResult<()>;
}

/// A freshly acquired microphone: the device handle and its frame stream.
pub struct OpenedCapture {
    pub device: Box<dyn CaptureDevice>,
    pub frames: FrameStream,
}

/// A schedulable output sink with a monotonic clock.
pub trait OutputDevice: Send + Sync {
    /// Current output clock time in seconds. Never goes backwards.
    fn current_time(&self) -> f64;

    /// Queue samples to start at `chunk.start` on the output clock.
    fn schedule(&self, chunk: &ScheduledChunk, samples: Vec<f32>, sample_rate: u32) -> VoiceResult<()>;

    /// Silence the given chunks immediately (no fade).
    fn stop(&self, ids: &[ChunkId]);

    /// Release the device. Called at most once per session.
    fn close(&self) -> VoiceResult<()>;
}

/// Device acquisition used by the session on call start.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone at `sample_rate`, producing frames of `frame_size` samples.
    async fn open_capture(&self, sample_rate: u32, frame_size: usize) -> VoiceResult<OpenedCapture>;

    /// Acquire the speaker. Ended notifications are delivered on `ended_tx`.
    async fn open_output(
        &self,
        sample_rate: u32,
        ended_tx: mpsc::UnboundedSender<PlaybackEnded>,
    ) -> VoiceResult<Box<dyn OutputDevice>>;
}

/// Microphone capture using CPAL
pub struct CpalCapture {
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCapture {
    /// Acquire the input device and start streaming frames.
    ///
    /// The CPAL stream is built on a dedicated thread and kept alive there until
    /// [`CaptureDevice::release`] is called.
    pub async fn open(
        sample_rate: u32,
        frame_size: usize,
        device_name: Option<String>,
    ) -> VoiceResult<OpenedCapture> {
        info!("🎤 Initializing audio capture ({}Hz mono, {} samples/frame)", sample_rate, frame_size);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<VoiceResult<AudioFrame>>();
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();
        let stop_signal = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop_signal);

        let thread = thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                run_capture(sample_rate, frame_size, device_name, frame_tx, ready_tx, thread_stop)
            })?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoiceError::AudioDevice("capture thread exited during setup".to_string()));
            }
        }

        info!("✅ Audio capture started");

        Ok(OpenedCapture {
            device: Box::new(Self {
                stop_signal,
                thread: Some(thread),
            }),
            frames: UnboundedReceiverStream::new(frame_rx).boxed(),
        })
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
}

impl CaptureDevice for CpalCapture {
    fn release(&mut self) -> VoiceResult<()> {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            thread
                .join()
                .map_err(|_| VoiceError::AudioDevice("capture thread panicked".to_string()))?;
        }
        info!("⏹️ Audio capture released");
        Ok(())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }
}

fn select_input_device(name: Option<&str>) -> VoiceResult<Device> {
    let host = cpal::default_host();
    if let Some(wanted) = name {
        for device in host.input_devices()? {
            if device.name().map(|n| n == wanted).unwrap_or(false) {
                return Ok(device);
            }
        }
        warn!("Input device '{}' not found, using default", wanted);
    }
    host.default_input_device()
        .ok_or_else(|| VoiceError::PermissionDenied("no input device available".to_string()))
}

fn run_capture(
    sample_rate: u32,
    frame_size: usize,
    device_name: Option<String>,
    frame_tx: mpsc::UnboundedSender<VoiceResult<AudioFrame>>,
    ready_tx: oneshot::Sender<VoiceResult<()>>,
    stop_signal: Arc<AtomicBool>,
) {
    let device = match select_input_device(device_name.as_deref()) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let data_tx = frame_tx.clone();
    let mut sample_buffer = Vec::with_capacity(frame_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                sample_buffer.push(sample);

                if sample_buffer.len() >= frame_size {
                    let frame = AudioFrame {
                        samples: std::mem::replace(&mut sample_buffer, Vec::with_capacity(frame_size)),
                        sample_rate,
                        captured_at: Instant::now(),
                    };
                    // Receiver gone means the session is shutting down.
                    let _ = data_tx.send(Ok(frame));
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
            let _ = frame_tx.send(Err(VoiceError::AudioDevice(err.to_string())));
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(e.into()));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    while !stop_signal.load(Ordering::SeqCst) {
        thread::park_timeout(Duration::from_millis(100));
    }

    drop(stream);
    debug!("capture thread exiting");
}

enum OutputCommand {
    Play {
        id: ChunkId,
        samples: Vec<f32>,
        sample_rate: u32,
    },
    Stop,
    Shutdown,
}

/// Speaker output using Rodio.
///
/// Chunks are appended to a sink in schedule order, so back-to-back start times
/// translate to gap-free playback. Each chunk is followed by a callback source
/// that reports it as ended.
///
/// Rodio has no timed start. The clock is wall time since the device opened
/// and `ScheduledChunk::start` is only logical here: a chunk plays when the
/// sink reaches it. After a stop or an underrun the scheduler's start and end
/// times can differ from what the speaker actually plays.
pub struct RodioOutput {
    commands: mpsc::UnboundedSender<OutputCommand>,
    opened_at: Instant,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RodioOutput {
    /// Open the default output device.
    pub async fn open(
        sample_rate: u32,
        ended_tx: mpsc::UnboundedSender<PlaybackEnded>,
    ) -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback ({}Hz)", sample_rate);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();

        let thread = thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || run_playback(command_rx, ended_tx, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoiceError::Playback("playback thread exited during setup".to_string()));
            }
        }

        info!("✅ Audio playback initialized");

        Ok(Self {
            commands,
            opened_at: Instant::now(),
            thread: std::sync::Mutex::new(Some(thread)),
        })
    }
}

impl OutputDevice for RodioOutput {
    /// Seconds since the device opened.
    fn current_time(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(&self, chunk: &ScheduledChunk, samples: Vec<f32>, sample_rate: u32) -> VoiceResult<()> {
        self.commands
            .send(OutputCommand::Play {
                id: chunk.id,
                samples,
                sample_rate,
            })
            .map_err(|_| VoiceError::Playback("playback thread is gone".to_string()))
    }

    fn stop(&self, ids: &[ChunkId]) {
        if ids.is_empty() {
            return;
        }
        // The sink holds every queued chunk, so one stop covers all of them.
        let _ = self.commands.send(OutputCommand::Stop);
        info!("⏹️ Audio playback stopped ({} chunks)", ids.len());
    }

    fn close(&self) -> VoiceResult<()> {
        let _ = self.commands.send(OutputCommand::Shutdown);
        let handle = self
            .thread
            .lock()
            .map_err(|_| VoiceError::Playback("playback handle poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| VoiceError::Playback("playback thread panicked".to_string()))?;
        }
        Ok(())
    }
}

fn run_playback(
    mut command_rx: mpsc::UnboundedReceiver<OutputCommand>,
    ended_tx: mpsc::UnboundedSender<PlaybackEnded>,
    ready_tx: oneshot::Sender<VoiceResult<()>>,
) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
            return;
        }
    };
    let mut sink = match Sink::try_new(&handle) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    while let Some(command) = command_rx.blocking_recv() {
        match command {
            OutputCommand::Play { id, samples, sample_rate } => {
                sink.append(SamplesBuffer::new(1, sample_rate, samples));
                let tx = ended_tx.clone();
                sink.append(EmptyCallback::<f32>::new(Box::new(move || {
                    let _ = tx.send(PlaybackEnded { id });
                })));
            }
            OutputCommand::Stop => {
                sink.stop();
                // A fresh sink lets the next utterance start immediately.
                match Sink::try_new(&handle) {
                    Ok(fresh) => sink = fresh,
                    Err(e) => warn!("Failed to recreate sink after stop: {}", e),
                }
            }
            OutputCommand::Shutdown => break,
        }
    }

    sink.stop();
    debug!("playback thread exiting");
}

/// The host's real microphone and speaker.
#[derive(Debug, Clone, Default)]
pub struct SystemAudio {
    /// Preferred input device name.
    pub input_device: Option<String>,
}

impl SystemAudio {
    /// System audio using the configured preferred input device.
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            input_device: config.input_device.clone(),
        }
    }
}

#[async_trait]
impl AudioBackend for SystemAudio {
    async fn open_capture(&self, sample_rate: u32, frame_size: usize) -> VoiceResult<OpenedCapture> {
        CpalCapture::open(sample_rate, frame_size, self.input_device.clone()).await
    }

    async fn open_output(
        &self,
        sample_rate: u32,
        ended_tx: mpsc::UnboundedSender<PlaybackEnded>,
    ) -> VoiceResult<Box<dyn OutputDevice>> {
        Ok(Box::new(RodioOutput::open(sample_rate, ended_tx).await?))
    }
}
