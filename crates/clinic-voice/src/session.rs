//! Session state machine and the widget-facing call controller.
//!
//! A [`VoiceWidget`] owns at most one call at a time. Starting a call acquires
//! the microphone, the speaker and the agent channel, then hands them to a
//! single session task that interleaves every event of the call:
//!
//! ```text
//!  capture frames ──► VAD ──► barge-in ──► PlaybackScheduler ──► OutputDevice
//!        │                                       ▲
//!        └──► Uplink queue ──► DuplexChannel ────┤ audio
//!                                   │            │
//!                                   ├──► TranscriptAccumulator
//!                                   └──► ToolDispatcher ──► HostCallbacks
//! ```
//!
//! UI visibility (expanded/minimized) is tracked separately from the audio
//! lifecycle; minimizing never touches the call.

use crate::audio::{AudioBackend, CaptureDevice, FrameStream, OutputDevice, PlaybackEnded};
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{decode_chunk, ChunkId, PlaybackScheduler};
use crate::protocol::{AgentConnector, DuplexChannel, InboundMessage, OutboundMessage, SessionSetup};
use crate::tools::{ToolDispatcher, ToolOutcome};
use crate::transcript::{TranscriptAccumulator, TranscriptFragment, TranscriptMessage};
use crate::uplink::{pcm_mime_type, Uplink};
use crate::vad::{VadConfig, VadDetector};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Audio lifecycle of the widget's call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No call.
    Idle,
    /// Devices being acquired, channel handshake in flight.
    Connecting,
    /// Call active, agent silent.
    Listening,
    /// Call active, agent audio in flight.
    Speaking,
    /// Call ended by hang-up; resources released.
    Closed,
    /// Call ended by a device or channel failure; resources released.
    Error { reason: String },
}

impl SessionState {
    /// Listening or speaking.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    /// Closed or error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error { .. })
    }
}

/// Whether the widget UI is collapsed. Independent of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiVisibility {
    #[default]
    Expanded,
    Minimized,
}

/// Audio lifecycle and UI visibility, as composed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetView {
    pub session: SessionState,
    pub ui: UiVisibility,
}

/// Host application hooks used by the engine.
#[async_trait]
pub trait HostCallbacks: Send + Sync {
    /// Show the booking calendar. Invoked by the `openBookingCalendar` tool.
    async fn on_open_booking(&self) -> Result<(), String>;

    /// Reflect a lifecycle change in the UI.
    fn on_session_state_changed(&self, _state: &SessionState) {}
}

/// State visible to the widget and written by the current session.
struct Shared {
    /// Epoch of the session allowed to publish.
    current_epoch: StdMutex<u64>,
    state: watch::Sender<SessionState>,
    ui: watch::Sender<UiVisibility>,
    transcript: RwLock<TranscriptAccumulator>,
    host: Arc<dyn HostCallbacks>,
}

/// Publishes on behalf of one session epoch; stale epochs are ignored.
#[derive(Clone)]
struct StateReporter {
    epoch: u64,
    shared: Arc<Shared>,
}

impl StateReporter {
    fn set_state(&self, state: SessionState) -> bool {
        let Ok(current) = self.shared.current_epoch.lock() else {
            return false;
        };
        if *current != self.epoch {
            debug!(epoch = self.epoch, current = *current, "ignoring state from stale session");
            return false;
        }
        let changed = self.shared.state.send_if_modified(|s| {
            if *s == state {
                false
            } else {
                *s = state.clone();
                true
            }
        });
        drop(current);
        if changed {
            info!(epoch = self.epoch, ?state, "session state changed");
            self.shared.host.on_session_state_changed(&state);
        }
        changed
    }

    fn set_ui(&self, ui: UiVisibility) {
        let Ok(current) = self.shared.current_epoch.lock() else {
            return;
        };
        if *current == self.epoch {
            self.shared.ui.send_replace(ui);
        }
    }
}

enum Command {
    SendText(String, oneshot::Sender<VoiceResult<()>>),
    HangUp(oneshot::Sender<()>),
}

struct ActiveCall {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

/// Devices and channel owned by one call. Each is taken exactly once on release.
#[derive(Default)]
struct Resources {
    channel: Option<Arc<dyn DuplexChannel>>,
    capture: Option<Box<dyn CaptureDevice>>,
    output: Option<Arc<dyn OutputDevice>>,
}

impl Resources {
    /// Release in order: playing sources, channel, capture, output.
    ///
    /// Every step runs even if an earlier one fails or panics.
    async fn release(&mut self, playing: Vec<ChunkId>) {
        if let Some(output) = self.output.as_ref() {
            if !playing.is_empty() {
                let stop = std::panic::catch_unwind(AssertUnwindSafe(|| output.stop(&playing)));
                if stop.is_err() {
                    warn!("stopping playback panicked");
                }
            }
        }

        if let Some(channel) = self.channel.take() {
            match AssertUnwindSafe(channel.close()).catch_unwind().await {
                Ok(Ok(())) => debug!("channel closed"),
                Ok(Err(e)) => warn!("channel close failed: {}", e),
                Err(_) => warn!("channel close panicked"),
            }
        }

        if let Some(mut capture) = self.capture.take() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| capture.release())) {
                Ok(Ok(())) => debug!("capture released"),
                Ok(Err(e)) => warn!("capture release failed: {}", e),
                Err(_) => warn!("capture release panicked"),
            }
        }

        if let Some(output) = self.output.take() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| output.close())) {
                Ok(Ok(())) => debug!("output closed"),
                Ok(Err(e)) => warn!("output close failed: {}", e),
                Err(_) => warn!("output close panicked"),
            }
        }
    }
}

/// Everything acquired while connecting.
struct Acquired {
    channel: Arc<dyn DuplexChannel>,
    frames: FrameStream,
    ended_rx: mpsc::UnboundedReceiver<PlaybackEnded>,
}

/// Controller for the voice call of one chat widget.
pub struct VoiceWidget {
    config: VoiceConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn AgentConnector>,
    tools: Arc<ToolDispatcher>,
    shared: Arc<Shared>,
    call: Mutex<Option<ActiveCall>>,
    next_epoch: AtomicU64,
}

impl VoiceWidget {
    /// Create an idle widget. `openBookingCalendar` is routed to `host`.
    pub fn new(
        config: VoiceConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn AgentConnector>,
        host: Arc<dyn HostCallbacks>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (ui, _) = watch::channel(UiVisibility::Expanded);
        Self {
            config,
            backend,
            connector,
            tools: Arc::new(ToolDispatcher::with_booking(Arc::clone(&host))),
            shared: Arc::new(Shared {
                current_epoch: StdMutex::new(0),
                state,
                ui,
                transcript: RwLock::new(TranscriptAccumulator::new()),
                host,
            }),
            call: Mutex::new(None),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Replace the tool dispatcher (for hosts exposing more tools).
    pub fn with_tool_dispatcher(mut self, tools: ToolDispatcher) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    /// Start a call, or return the id of the call already connecting or active.
    pub async fn start_call(&self) -> VoiceResult<String> {
        let mut call = self.call.lock().await;
        if let Some(active) = call.as_ref() {
            if !active.task.is_finished() {
                debug!(session = %active.id, "call already active");
                return Ok(active.id.clone());
            }
        }
        *call = None;

        self.config.validate()?;
        let vad = VadDetector::new(VadConfig {
            threshold: self.config.vad_threshold,
        })?;

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut current) = self.shared.current_epoch.lock() {
            *current = epoch;
        }
        let reporter = StateReporter {
            epoch,
            shared: Arc::clone(&self.shared),
        };
        let id = Uuid::new_v4().to_string();

        info!(session = %id, epoch, "📞 starting voice call");
        reporter.set_state(SessionState::Connecting);
        self.shared.transcript.write().await.begin_epoch(epoch);

        let mut resources = Resources::default();
        let acquired = match self.acquire(&id, &mut resources).await {
            Ok(a) => a,
            Err(e) => {
                error!(session = %id, "call setup failed: {}", e);
                resources.release(Vec::new()).await;
                reporter.set_state(SessionState::Error { reason: e.to_string() });
                return Err(e);
            }
        };

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (uplink, writer) = Uplink::spawn(
            Arc::clone(&acquired.channel),
            self.config.outbound_queue_capacity,
            fault_tx,
        );

        reporter.set_state(SessionState::Listening);

        if let Some(greeting) = self.config.auto_greet.clone() {
            if let Err(e) = uplink.send_control(OutboundMessage::Text { text: greeting }).await {
                warn!(session = %id, "auto-greet failed: {}", e);
            }
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let dropped = uplink.dropped_counter();
        let session = Session {
            id: id.clone(),
            config: self.config.clone(),
            reporter,
            vad,
            scheduler: PlaybackScheduler::new(),
            tools: Arc::clone(&self.tools),
            uplink: Some(uplink),
            writer: Some(writer),
            tool_tx,
            tool_tasks: Vec::new(),
            resources,
            state: SessionState::Listening,
        };
        let task = tokio::spawn(session.run(
            acquired.channel,
            acquired.frames,
            command_rx,
            acquired.ended_rx,
            fault_rx,
            tool_rx,
        ));

        *call = Some(ActiveCall {
            id: id.clone(),
            commands,
            task,
            dropped,
        });
        info!(session = %id, "✅ voice call active");
        Ok(id)
    }

    async fn acquire(&self, id: &str, resources: &mut Resources) -> VoiceResult<Acquired> {
        let capture = self
            .backend
            .open_capture(self.config.capture_sample_rate, self.config.frame_size)
            .await?;
        resources.capture = Some(capture.device);

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = self
            .backend
            .open_output(self.config.playback_sample_rate, ended_tx)
            .await?;
        resources.output = Some(Arc::from(output));

        let setup = SessionSetup {
            session_id: id.to_string(),
            input_mime_type: pcm_mime_type(self.config.capture_sample_rate),
            output_sample_rate: self.config.playback_sample_rate,
        };
        let channel: Arc<dyn DuplexChannel> = Arc::from(self.connector.connect(&setup).await?);
        resources.channel = Some(Arc::clone(&channel));

        Ok(Acquired {
            channel,
            frames: capture.frames,
            ended_rx,
        })
    }

    /// End the call. Releases everything once; later calls are no-ops.
    pub async fn hang_up(&self) {
        let mut call = self.call.lock().await;
        let Some(active) = call.take() else {
            debug!("hang_up with no call");
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if active.commands.send(Command::HangUp(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Err(e) = active.task.await {
            warn!(session = %active.id, "session task ended abnormally: {}", e);
        }
    }

    /// Inject text into the live conversation.
    pub async fn send_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        let call = self.call.lock().await;
        let Some(active) = call.as_ref() else {
            return Err(VoiceError::Channel("no active call".to_string()));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        active
            .commands
            .send(Command::SendText(text.into(), reply_tx))
            .map_err(|_| VoiceError::Channel("call has ended".to_string()))?;
        drop(call);
        reply_rx
            .await
            .map_err(|_| VoiceError::Channel("call has ended".to_string()))?
    }

    /// Collapse the widget; the call keeps running.
    pub fn minimize(&self) {
        self.shared.ui.send_replace(UiVisibility::Minimized);
    }

    /// Expand the widget without touching devices.
    pub fn restore(&self) {
        self.shared.ui.send_replace(UiVisibility::Expanded);
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn ui(&self) -> UiVisibility {
        *self.shared.ui.borrow()
    }

    pub fn view(&self) -> WidgetView {
        WidgetView {
            session: self.state(),
            ui: self.ui(),
        }
    }

    /// Watch lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Watch UI visibility changes.
    pub fn subscribe_ui(&self) -> watch::Receiver<UiVisibility> {
        self.shared.ui.subscribe()
    }

    /// Id of the current or most recent call.
    pub async fn session_id(&self) -> Option<String> {
        self.call.lock().await.as_ref().map(|c| c.id.clone())
    }

    /// Uplink frames dropped by the current call because the channel was slow.
    pub async fn dropped_frames(&self) -> u64 {
        self.call
            .lock()
            .await
            .as_ref()
            .map(|c| c.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Conversation so far, across calls.
    pub async fn transcript(&self) -> Vec<TranscriptMessage> {
        self.shared.transcript.read().await.messages().to_vec()
    }
}

enum Exit {
    HangUp(Option<oneshot::Sender<()>>),
    Failed(VoiceError),
}

/// One physical call, driven by a single task.
struct Session {
    id: String,
    config: VoiceConfig,
    reporter: StateReporter,
    vad: VadDetector,
    scheduler: PlaybackScheduler,
    tools: Arc<ToolDispatcher>,
    uplink: Option<Uplink>,
    writer: Option<JoinHandle<()>>,
    /// Finished tool handlers report here.
    tool_tx: mpsc::UnboundedSender<VoiceResult<ToolOutcome>>,
    tool_tasks: Vec<JoinHandle<()>>,
    resources: Resources,
    state: SessionState,
}

impl Session {
    async fn run(
        mut self,
        channel: Arc<dyn DuplexChannel>,
        mut frames: FrameStream,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut ended_rx: mpsc::UnboundedReceiver<PlaybackEnded>,
        mut fault_rx: mpsc::UnboundedReceiver<VoiceError>,
        mut tool_rx: mpsc::UnboundedReceiver<VoiceResult<ToolOutcome>>,
    ) {
        let exit = loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::HangUp(done)) => break Exit::HangUp(Some(done)),
                    Some(Command::SendText(text, reply)) => {
                        let result = match self.uplink.clone() {
                            Some(uplink) => uplink.send_control(OutboundMessage::Text { text }).await,
                            None => Err(VoiceError::Channel("uplink closed".to_string())),
                        };
                        let _ = reply.send(result);
                    }
                    None => break Exit::HangUp(None),
                },

                Some(fault) = fault_rx.recv() => break Exit::Failed(fault),

                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(&frame),
                    Some(Err(e)) => break Exit::Failed(e),
                    None => break Exit::Failed(VoiceError::AudioDevice("microphone stream ended".to_string())),
                },

                message = channel.recv() => match message {
                    Some(Ok(message)) => {
                        if let Err(e) = self.on_message(message).await {
                            break Exit::Failed(e);
                        }
                    }
                    Some(Err(e)) if e.is_terminal() => break Exit::Failed(e),
                    Some(Err(e)) => warn!(session = %self.id, "dropping unreadable agent message: {}", e),
                    None => break Exit::Failed(VoiceError::Channel("agent closed the channel".to_string())),
                },

                Some(ended) = ended_rx.recv() => self.on_chunk_ended(ended.id),

                Some(finished) = tool_rx.recv() => match finished {
                    Ok(outcome) => self.on_tool_finished(outcome),
                    Err(e) => break Exit::Failed(e),
                },
            }
        };

        drop(channel);
        self.shutdown(exit).await;
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state.clone();
            self.reporter.set_state(state);
        }
    }

    fn output(&self) -> Option<&Arc<dyn OutputDevice>> {
        self.resources.output.as_ref()
    }

    /// VAD, barge-in, then uplink. Barge-in completes before the next frame.
    fn on_frame(&mut self, frame: &crate::audio::AudioFrame) {
        if self.vad.is_speech(frame) && self.scheduler.has_audio_in_flight() {
            let stopped = self.scheduler.barge_in();
            if let Some(output) = self.output() {
                output.stop(&stopped);
            }
            self.set_state(SessionState::Listening);
        }
        if let Some(uplink) = self.uplink.as_ref() {
            uplink.submit_frame(frame);
        }
    }

    async fn on_message(&mut self, message: InboundMessage) -> VoiceResult<()> {
        match message {
            InboundMessage::Audio {
                data,
                mime_type,
                utterance,
            } => {
                let chunk = match decode_chunk(&data, &mime_type, utterance, self.config.playback_sample_rate) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(session = %self.id, "dropping agent audio chunk: {}", e);
                        return Ok(());
                    }
                };
                let Some(output) = self.output().cloned() else {
                    return Err(VoiceError::Playback("output device released".to_string()));
                };
                let Some(scheduled) = self.scheduler.schedule(&chunk, output.current_time()) else {
                    return Ok(());
                };
                output.schedule(&scheduled, chunk.samples, chunk.sample_rate)?;
                debug!(
                    session = %self.id,
                    id = scheduled.id.0,
                    start = scheduled.start,
                    end = scheduled.end,
                    "chunk scheduled"
                );
                self.set_state(SessionState::Speaking);
            }
            InboundMessage::Transcript { role, text, mode } => {
                self.reporter
                    .shared
                    .transcript
                    .write()
                    .await
                    .apply(TranscriptFragment { role, text, mode });
            }
            InboundMessage::ToolCall { calls } => {
                let Some(uplink) = self.uplink.clone() else {
                    return Err(VoiceError::Channel("uplink closed".to_string()));
                };
                let tools = Arc::clone(&self.tools);
                if let Some(job) = tools.begin(&calls, &uplink).await? {
                    debug!(session = %self.id, id = %job.call().id, "tool handler started");
                    let outcomes = self.tool_tx.clone();
                    self.tool_tasks.retain(|task| !task.is_finished());
                    self.tool_tasks.push(tokio::spawn(async move {
                        let _ = outcomes.send(job.run().await);
                    }));
                }
            }
            InboundMessage::TurnComplete | InboundMessage::Interrupted => {
                self.scheduler.utterance_boundary();
            }
        }
        Ok(())
    }

    fn on_tool_finished(&mut self, outcome: ToolOutcome) {
        debug!(session = %self.id, id = %outcome.id, tool = %outcome.name, "tool handler finished");
        if outcome.minimize_ui {
            self.reporter.set_ui(UiVisibility::Minimized);
        }
    }

    fn on_chunk_ended(&mut self, id: ChunkId) {
        if self.scheduler.on_chunk_ended(id) {
            self.set_state(SessionState::Listening);
        }
    }

    async fn shutdown(mut self, exit: Exit) {
        let playing = self.scheduler.cancel_all();

        // Stop tool handlers and the writer first so nothing else reaches the channel.
        for task in self.tool_tasks.drain(..) {
            task.abort();
        }
        self.uplink = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }

        self.resources.release(playing).await;

        match exit {
            Exit::HangUp(done) => {
                info!(session = %self.id, "📴 call closed");
                self.set_state(SessionState::Closed);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Exit::Failed(e) => {
                error!(session = %self.id, "call failed: {}", e);
                self.set_state(SessionState::Error { reason: e.to_string() });
            }
        }
    }
}
