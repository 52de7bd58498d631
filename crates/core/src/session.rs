//! Session orchestration.
//!
//! `SessionController` owns one realtime channel, one microphone and one
//! speaker for as long as a session is connected. Lifecycle calls
//! (`connect`, `disconnect`) and user actions are serialized by a lifecycle
//! lock; a newer lifecycle call bumps an epoch counter before queuing for that
//! lock so that a connect in flight notices it has been superseded and backs
//! out, releasing everything it acquired.
//!
//! Inbound events are handled by a single dispatch task per connection, in
//! arrival order. The same task watches the memory store and pushes updated
//! instructions whenever it changes.

use crate::{
    context::{BASE_INSTRUCTIONS, compose_instructions},
    conversation::{ConversationItem, ConversationReconciler, ItemEffect, ItemUpdate},
    error::{ProtocolEventError, SessionError},
    event_log::{EventLog, EventSource, RealtimeEvent},
    memory::{MemoryMap, MemoryStore},
    tools::ToolRegistry,
    turn::{CaptureCommand, PushToTalk, TurnMode, TurnModeStateMachine},
};
use chrono::Utc;
use oracle_native_utils::{
    AudioBackend, AudioCaptureBridge, AudioPlaybackBridge, DeviceError, capture::DEFAULT_FRAME_SAMPLES,
    pcm::REALTIME_SAMPLE_RATE,
};
use oracle_realtime::{
    ConnectionError, ConnectionGuard, RealtimeClient, RealtimeConnection, RealtimeTransport,
    types::{AudioFormat, AudioTranscription, InboundMessage, ServerEvent, SessionConfig},
};
use std::{
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{self, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};

/// Per-session options fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Voice the assistant speaks with.
    pub voice: String,
    /// Base instructions; remembered facts are appended on every update.
    pub instructions: String,
    /// Samples per microphone frame sent to the server.
    pub frame_samples: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            voice: "ash".to_string(),
            instructions: BASE_INSTRUCTIONS.to_string(),
            frame_samples: DEFAULT_FRAME_SAMPLES,
        }
    }
}

/// Connection status as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct LiveConnection {
    /// Epoch of the `connect` call that opened this connection.
    epoch: u64,
    client: RealtimeClient,
    dispatch: Option<JoinHandle<()>>,
    _guard: ConnectionGuard,
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        if let Some(dispatch) = &self.dispatch {
            dispatch.abort();
        }
    }
}

struct Lifecycle {
    capture: AudioCaptureBridge,
    connection: Option<LiveConnection>,
    /// Frames accepted by the channel since the last push-to-talk start.
    frames_sent: Arc<AtomicU64>,
}

/// State shared with the dispatch task and the send observer.
struct Shared {
    log: EventLog,
    items: ConversationReconciler,
    turn: TurnModeStateMachine,
}

struct Inner {
    settings: SessionSettings,
    transport: Arc<dyn RealtimeTransport>,
    memory: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    epoch: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    lifecycle: sync::Mutex<Lifecycle>,
    playback: sync::Mutex<AudioPlaybackBridge>,
    shared: Mutex<Shared>,
}

/// Top-level orchestrator of a voice session. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("voice", &self.inner.settings.voice)
            .finish()
    }
}

impl SessionController {
    /// Builds a controller around its collaborators. Nothing is connected and
    /// no device is opened until [`connect`](Self::connect).
    pub fn new(
        settings: SessionSettings,
        transport: Arc<dyn RealtimeTransport>,
        audio: Arc<dyn AudioBackend>,
        memory: Arc<MemoryStore>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let (epoch, _) = watch::channel(0);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let capture = AudioCaptureBridge::with_frame_samples(audio.clone(), settings.frame_samples);
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                memory,
                tools,
                epoch,
                state,
                lifecycle: sync::Mutex::new(Lifecycle {
                    capture,
                    connection: None,
                    frames_sent: Arc::new(AtomicU64::new(0)),
                }),
                playback: sync::Mutex::new(AudioPlaybackBridge::new(audio)),
                shared: Mutex::new(Shared {
                    log: EventLog::default(),
                    items: ConversationReconciler::new(),
                    turn: TurnModeStateMachine::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.inner.memory
    }

    /// Instructions as they would be sent right now: base plus memory context.
    pub fn instructions(&self) -> String {
        compose_instructions(&self.inner.settings.instructions, &self.inner.memory.snapshot())
    }

    pub fn items(&self) -> Vec<ConversationItem> {
        self.inner.shared().items.items()
    }

    pub fn log(&self) -> Vec<RealtimeEvent> {
        self.inner.shared().log.entries().to_vec()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.inner.shared().log.lines()
    }

    pub fn turn_mode(&self) -> TurnMode {
        self.inner.shared().turn.mode()
    }

    /// Seconds since push-to-talk started, while it is active.
    pub fn recording_secs(&self) -> Option<u64> {
        self.inner.shared().turn.recording_secs()
    }

    /// Opens the channel, arms the microphone, opens the speaker and sends the
    /// initial session configuration. On any failure every acquired resource
    /// is released and the session is left disconnected.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), SessionError> {
        let epoch = self.inner.bump_epoch();
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.current_epoch() != epoch {
            return Err(SessionError::Superseded);
        }
        if lifecycle.connection.is_some() {
            debug!("Already connected");
            return Ok(());
        }
        self.inner.state.send_replace(ConnectionState::Connecting);

        match self.inner.connect_locked(&mut lifecycle, epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Connect failed, releasing resources");
                self.inner.teardown_locked(&mut lifecycle).await;
                Err(e)
            }
        }
    }

    /// Tears the session down. Always succeeds and never touches memory.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.inner.bump_epoch();
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown_locked(&mut lifecycle).await;
    }

    /// Sends a user text turn after interrupting any reply being played.
    /// Blank text is ignored.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let lifecycle = self.inner.lifecycle.lock().await;
        let client = lifecycle.client().ok_or(SessionError::NotConnected)?;
        self.inner.barge_in(&client).await?;
        client.send_user_text(text).await?;
        Ok(())
    }

    /// Asks the server to delete an item. Unknown ids are ignored.
    pub async fn delete_item(&self, item_id: &str) -> Result<(), SessionError> {
        let lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.shared().items.contains(item_id) {
            debug!(item_id, "Ignoring delete of unknown item");
            return Ok(());
        }
        let Some(client) = lifecycle.client() else {
            return Ok(());
        };
        client.delete_item(item_id).await?;
        Ok(())
    }

    /// Switches between push-to-talk and server VAD.
    pub async fn set_turn_mode(&self, mode: TurnMode) -> Result<(), SessionError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let command = self.inner.shared().turn.switch_to(mode);
        let Some(command) = command else {
            return Ok(());
        };
        info!(%mode, "Turn mode changed");
        let Some(client) = lifecycle.client() else {
            return Ok(());
        };

        if command == CaptureCommand::Pause && lifecycle.capture.is_recording() {
            lifecycle.capture.pause().await;
        }
        client
            .update_session(SessionConfig::turn_detection(mode.turn_detection()))
            .await?;
        if command == CaptureCommand::Record && !lifecycle.capture.is_recording() {
            lifecycle.stream_microphone(&client)?;
        }
        Ok(())
    }

    /// Push-to-talk. Starting interrupts playback and records; stopping
    /// commits the recorded audio and requests a response.
    pub async fn toggle_recording(&self) -> Result<PushToTalk, SessionError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let client = lifecycle.client();
        let action = self.inner.shared().turn.toggle(client.is_some())?;
        let Some(client) = client else {
            return Err(SessionError::NotConnected);
        };

        match action {
            PushToTalk::Started => {
                let started = match self.inner.barge_in(&client).await {
                    Ok(()) => {
                        lifecycle.frames_sent.store(0, Ordering::Relaxed);
                        lifecycle.stream_microphone(&client).map_err(SessionError::from)
                    }
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = started {
                    self.inner.shared().turn.cancel_talking();
                    return Err(e);
                }
                debug!("Push-to-talk started");
            }
            PushToTalk::Stopped { elapsed_secs } => {
                lifecycle.capture.pause().await;
                if lifecycle.frames_sent.load(Ordering::Relaxed) > 0 {
                    client.commit_input_audio().await?;
                } else {
                    debug!("Nothing recorded, skipping commit");
                }
                client.create_response().await?;
                debug!(elapsed_secs, "Push-to-talk stopped");
            }
        }
        Ok(action)
    }
}

impl Lifecycle {
    fn client(&self) -> Option<RealtimeClient> {
        self.connection.as_ref().map(|c| c.client.clone())
    }

    /// Streams microphone frames into the server's input buffer.
    fn stream_microphone(&mut self, client: &RealtimeClient) -> Result<(), DeviceError> {
        let client = client.clone();
        let frames_sent = self.frames_sent.clone();
        self.capture.record(move |frame| match client.append_input_audio(frame.to_base64()) {
            Ok(()) => {
                frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!(error = %e, "Dropping microphone frame"),
        })
    }
}

/// Resolves once the epoch moves past `epoch`.
async fn superseded(mut epochs: watch::Receiver<u64>, epoch: u64) {
    let _ = epochs.wait_for(|current| *current != epoch).await;
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_epoch(&self) -> u64 {
        let mut next = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        next
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Runs `step` unless a newer lifecycle call arrives first.
    async fn unless_superseded<T, F>(&self, epoch: u64, step: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>>,
    {
        tokio::select! {
            biased;
            _ = superseded(self.epoch.subscribe(), epoch) => Err(SessionError::Superseded),
            result = step => result,
        }
    }

    fn initial_session(&self, instructions: String) -> SessionConfig {
        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: Some(instructions),
            voice: Some(self.settings.voice.clone()),
            input_audio_format: Some(AudioFormat::Pcm16),
            output_audio_format: Some(AudioFormat::Pcm16),
            input_audio_transcription: Some(AudioTranscription::default()),
            turn_detection: Some(TurnMode::Automatic.turn_detection()),
            tools: Some(self.tools.definitions()),
            tool_choice: Some("auto".to_string()),
        }
    }

    async fn connect_locked(self: &Arc<Self>, lifecycle: &mut Lifecycle, epoch: u64) -> Result<(), SessionError> {
        {
            let mut shared = self.shared();
            shared.log.reset(Utc::now());
            shared.items.clear();
            shared.turn.reset();
        }

        let RealtimeConnection {
            outbound,
            inbound,
            guard,
        } = self
            .unless_superseded(epoch, async { self.transport.connect().await.map_err(SessionError::from) })
            .await?;
        let observer = Arc::downgrade(self);
        let client = RealtimeClient::new(outbound).with_observer(move |event| {
            if let Some(inner) = observer.upgrade() {
                inner.record_outbound(event);
            }
        });
        lifecycle.connection = Some(LiveConnection {
            epoch,
            client: client.clone(),
            dispatch: None,
            _guard: guard,
        });

        self.unless_superseded(epoch, async { lifecycle.capture.arm().await.map_err(SessionError::from) })
            .await?;
        self.unless_superseded(epoch, async {
            self.playback.lock().await.connect().await.map_err(SessionError::from)
        })
        .await?;

        let mut memory_rx = self.memory.subscribe();
        let instructions = compose_instructions(&self.settings.instructions, &memory_rx.borrow_and_update());
        self.unless_superseded(epoch, async {
            client
                .update_session(self.initial_session(instructions))
                .await
                .map_err(SessionError::from)
        })
        .await?;

        let dispatch = tokio::spawn(run_dispatch(
            Arc::downgrade(self),
            client.clone(),
            inbound,
            memory_rx,
            epoch,
        ));
        if let Some(connection) = lifecycle.connection.as_mut() {
            connection.dispatch = Some(dispatch);
        }
        if self.current_epoch() != epoch {
            return Err(SessionError::Superseded);
        }

        self.state.send_replace(ConnectionState::Connected);
        info!(voice = %self.settings.voice, "Session connected");
        lifecycle.stream_microphone(&client)?;
        Ok(())
    }

    async fn teardown_locked(&self, lifecycle: &mut Lifecycle) {
        // Dropping the connection aborts dispatch and closes the channel.
        let had_connection = lifecycle.connection.take().is_some();
        lifecycle.capture.disarm().await;
        self.playback.lock().await.disconnect();
        {
            let mut shared = self.shared();
            shared.log.reset(Utc::now());
            shared.items.clear();
            shared.turn.cancel_talking();
        }
        self.state.send_replace(ConnectionState::Disconnected);
        if had_connection {
            info!("Session disconnected");
        }
    }

    /// Teardown requested by the dispatch task when the server closed the
    /// channel. Ignored unless that channel is still the live one.
    async fn close_from_server(&self, epoch: u64) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.connection.as_ref().map(|c| c.epoch) != Some(epoch) {
            return;
        }
        self.teardown_locked(&mut lifecycle).await;
    }

    fn record_outbound(&self, event: &oracle_realtime::types::ClientEvent) {
        match serde_json::to_value(event) {
            Ok(value) => self.shared().log.record(EventSource::Client, value),
            Err(e) => warn!(kind = event.kind(), error = %e, "Failed to log outbound event"),
        }
    }

    /// Interrupts playback and, if an assistant reply was audible, cancels
    /// the response and truncates the item where the listener stopped hearing.
    async fn barge_in(&self, client: &RealtimeClient) -> Result<(), ConnectionError> {
        let position = self.playback.lock().await.interrupt();
        let Some(position) = position else {
            return Ok(());
        };
        let is_assistant = self
            .shared()
            .items
            .get(&position.track_id)
            .is_some_and(ConversationItem::is_assistant_message);
        if !is_assistant {
            return Ok(());
        }
        info!(track_id = %position.track_id, offset = position.offset, "Barge-in");
        client
            .cancel_response(&position.track_id, 0, position.offset, REALTIME_SAMPLE_RATE)
            .await
    }

    async fn push_instructions(&self, client: &RealtimeClient, memory: &MemoryMap) {
        let instructions = compose_instructions(&self.settings.instructions, memory);
        if let Err(e) = client.update_session(SessionConfig::instructions(instructions)).await {
            warn!(error = %e, "Failed to push updated instructions");
        } else {
            debug!(keys = memory.len(), "Instructions updated from memory");
        }
    }

    async fn handle_inbound(
        &self,
        client: &RealtimeClient,
        memory_rx: &mut watch::Receiver<MemoryMap>,
        message: InboundMessage,
    ) {
        self.shared().log.record(EventSource::Server, message.raw.clone());
        let event = match message.event() {
            Ok(event) => event,
            Err(e) => {
                let err = ProtocolEventError::Malformed {
                    kind: message.kind().to_string(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Ignoring inbound event");
                return;
            }
        };

        match event {
            ServerEvent::Error { error } => {
                let err = ProtocolEventError::Server {
                    code: error.code,
                    message: error.message,
                };
                error!(error = %err, "Realtime service error");
            }
            ServerEvent::SpeechStarted { .. } => {
                if let Err(e) = self.barge_in(client).await {
                    warn!(error = %e, "Barge-in failed");
                }
            }
            event => {
                let Some(update) = ItemUpdate::from_server_event(event) else {
                    return;
                };
                let effect = self.shared().items.apply(update);
                match effect {
                    Some(ItemEffect::PlayAudio { track_id, samples }) => {
                        self.playback.lock().await.enqueue(&track_id, &samples);
                    }
                    Some(ItemEffect::CallTool(call)) => {
                        let output = self.tools.invoke(&call.name, &call.arguments).await;
                        if memory_rx.has_changed().unwrap_or(false) {
                            let memory = memory_rx.borrow_and_update().clone();
                            self.push_instructions(client, &memory).await;
                        }
                        if let Err(e) = client.submit_function_output(&call.call_id, &output).await {
                            warn!(call_id = %call.call_id, error = %e, "Failed to return tool output");
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

/// Per-connection dispatch loop.
async fn run_dispatch(
    inner: Weak<Inner>,
    client: RealtimeClient,
    mut inbound: mpsc::Receiver<InboundMessage>,
    mut memory_rx: watch::Receiver<MemoryMap>,
    epoch: u64,
) {
    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some(message) = message else { break };
                let Some(inner) = inner.upgrade() else { return };
                inner.handle_inbound(&client, &mut memory_rx, message).await;
            }
            changed = memory_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let memory = memory_rx.borrow_and_update().clone();
                let Some(inner) = inner.upgrade() else { return };
                inner.push_instructions(&client, &memory).await;
            }
        }
    }

    info!("Realtime channel closed by server");
    if let Some(inner) = inner.upgrade() {
        tokio::spawn(async move { inner.close_from_server(epoch).await });
    }
}
