//! Voice conversation orchestrator
//!
//! Owns one conversation: a transcription stream, at most one in-flight
//! response task, and the state machine that ties them together. The
//! orchestrator is driven entirely by two channels, commands from the
//! transport and events from the transcription client, consumed in a single
//! select loop so no handler races another.
//!
//! Interruption model: each response task gets a fresh interrupt flag. When
//! the user starts speaking mid-response the flag is set, the synthesis
//! connection is force-closed, and the task is aborted. A superseding turn
//! additionally waits (bounded) for the old task to unwind before starting
//! the next one, so two tasks never share the synthesis slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::sentence;
use super::stt::{SttEvent, TranscriptStreamClient};
use super::tts::{SpeechSynthesisClient, TtsEvent};
use crate::config::{SttConfig, TtsConfig};
use crate::llm::{ResponseGenerator, StreamEvent};
use crate::retrieval::ContextRetriever;
use crate::session::{format_history, Role, SessionStore};

/// Passages of context fetched per voice turn
const CONTEXT_K: usize = 6;
/// Prior exchanges included in the prompt
const HISTORY_EXCHANGES: usize = 5;
/// Bound on waiting for a superseded response task to unwind
const CANCEL_WAIT: Duration = Duration::from_millis(100);
/// Bound on waiting for trailing synthesis flushes
const FLUSH_WAIT: Duration = Duration::from_secs(30);

/// Conversation lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// No transcription stream open
    Idle,
    /// Taking audio, waiting for the user's turn to end
    Listening,
    /// Retrieving context and generating a response
    Processing,
    /// Streaming synthesized audio to the user
    Speaking,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
            ConversationState::Speaking => "speaking",
        }
    }
}

/// Commands from the transport into the orchestrator
#[derive(Debug)]
pub enum VoiceCommand {
    /// Open the transcription stream and begin a conversation
    Start { session_id: Option<String> },
    /// Raw audio from the user's microphone
    Audio(Vec<u8>),
    /// End the conversation and release both speech connections
    Stop,
}

/// Events from the orchestrator out to the transport
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A transcript fragment for live display
    Transcript { text: String, is_final: bool },
    /// A response text increment, mirrored alongside the audio
    ResponseText(String),
    /// Synthesized audio for playback
    Audio(Vec<u8>),
    /// The conversation moved to a new state
    StateChange(ConversationState),
    /// The user interrupted the assistant mid-response
    Interrupt,
    /// A non-fatal pipeline error, described for the user
    Error(String),
}

/// Shared services a conversation draws on
#[derive(Clone)]
pub struct VoiceDeps {
    pub sessions: Option<Arc<SessionStore>>,
    pub retriever: Arc<ContextRetriever>,
    pub generator: Arc<ResponseGenerator>,
}

/// Conversation state shared between the orchestrator and response tasks.
/// Transitions are announced on the outbound channel; setting the current
/// state again is a no-op.
struct StateCell {
    state: watch::Sender<ConversationState>,
    outbound: mpsc::Sender<OrchestratorEvent>,
}

impl StateCell {
    fn new(outbound: mpsc::Sender<OrchestratorEvent>) -> Self {
        let (state, _) = watch::channel(ConversationState::Idle);
        Self { state, outbound }
    }

    fn get(&self) -> ConversationState {
        *self.state.borrow()
    }

    async fn set(&self, next: ConversationState) {
        let previous = self.get();
        let changed = self.state.send_if_modified(|current| {
            if *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Voice state: {} -> {}", previous.as_str(), next.as_str());
            let _ = self.outbound.send(OrchestratorEvent::StateChange(next)).await;
        }
    }
}

/// The synthesis connection for the current response, if one is open. Shared
/// so the interrupt path can force-close it while the response task streams.
type SynthesisSlot = Arc<Mutex<Option<SpeechSynthesisClient>>>;

/// One voice conversation
pub struct VoiceOrchestrator {
    stt_config: SttConfig,
    tts_config: TtsConfig,
    deps: VoiceDeps,
    outbound: mpsc::Sender<OrchestratorEvent>,
    state: Arc<StateCell>,

    session_id: Option<String>,
    stt: Option<TranscriptStreamClient>,
    stt_events: Option<mpsc::Receiver<SttEvent>>,
    /// Final transcript fragments accumulated across the current turn
    current_turn: String,
    response_task: Option<JoinHandle<()>>,
    interrupt: Arc<AtomicBool>,
    synthesis: SynthesisSlot,
}

impl VoiceOrchestrator {
    pub fn new(
        stt_config: SttConfig,
        tts_config: TtsConfig,
        deps: VoiceDeps,
        outbound: mpsc::Sender<OrchestratorEvent>,
    ) -> Self {
        let state = Arc::new(StateCell::new(outbound.clone()));
        Self {
            stt_config,
            tts_config,
            deps,
            outbound,
            state,
            session_id: None,
            stt: None,
            stt_events: None,
            current_turn: String::new(),
            response_task: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            synthesis: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state.get()
    }

    /// Drive the conversation until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<VoiceCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(VoiceCommand::Start { session_id }) => {
                        self.session_id = session_id;
                        if let Err(e) = self.start().await {
                            error!("Failed to start voice session: {}", e);
                            let _ = self
                                .outbound
                                .send(OrchestratorEvent::Error(format!(
                                    "Failed to start voice session: {}",
                                    e
                                )))
                                .await;
                        }
                    }
                    Some(VoiceCommand::Audio(data)) => self.process_audio(&data).await,
                    Some(VoiceCommand::Stop) => self.stop().await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                event = recv_event(&mut self.stt_events), if self.stt_events.is_some() => {
                    match event {
                        Some(event) => self.handle_stt_event(event).await,
                        None => {
                            debug!("STT event stream ended");
                            self.stt_events = None;
                        }
                    }
                },
            }
        }
    }

    /// Open the transcription stream and move to Listening.
    async fn start(&mut self) -> Result<(), super::VoiceError> {
        if self.stt.is_some() {
            debug!("Voice session already started");
            return Ok(());
        }
        info!("Starting voice session (session: {:?})", self.session_id);

        let (events_tx, events_rx) = mpsc::channel(64);
        let client = TranscriptStreamClient::connect(&self.stt_config, events_tx).await?;
        self.stt = Some(client);
        self.stt_events = Some(events_rx);
        self.current_turn.clear();
        self.state.set(ConversationState::Listening).await;
        Ok(())
    }

    /// Tear down both speech connections and any in-flight response.
    /// Safe to call repeatedly.
    async fn stop(&mut self) {
        if self.stt.is_none() && self.response_task.is_none() {
            self.state.set(ConversationState::Idle).await;
            return;
        }
        info!("Stopping voice session");

        self.cancel_response().await;
        if let Some(mut stt) = self.stt.take() {
            stt.close().await;
        }
        self.stt_events = None;
        self.current_turn.clear();
        self.state.set(ConversationState::Idle).await;
    }

    /// Forward user audio to the transcription stream.
    async fn process_audio(&mut self, data: &[u8]) {
        let Some(stt) = self.stt.as_mut() else {
            debug!("Dropping audio, no transcription stream open");
            return;
        };
        if let Err(e) = stt.send_audio(data).await {
            error!("Error sending audio to STT: {}", e);
            let _ = self
                .outbound
                .send(OrchestratorEvent::Error(format!("Audio send failed: {}", e)))
                .await;
        }
    }

    async fn handle_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Ready => debug!("Transcription stream ready"),
            SttEvent::Transcript { text, is_final } => {
                if is_final {
                    if !self.current_turn.is_empty() {
                        self.current_turn.push(' ');
                    }
                    self.current_turn.push_str(text.trim());
                }
                let _ = self
                    .outbound
                    .send(OrchestratorEvent::Transcript { text, is_final })
                    .await;
            }
            SttEvent::SpeechStarted => self.on_speech_started().await,
            SttEvent::EagerEndOfTurn(transcript) => {
                // Not acted on; the confirmed EndOfTurn drives the response
                debug!("Eager end of turn: {:.100}", transcript);
            }
            SttEvent::TurnResumed => debug!("User resumed the turn"),
            SttEvent::EndOfTurn(transcript) => self.on_end_of_turn(transcript).await,
            SttEvent::Error(message) => {
                error!("STT error: {}", message);
                let _ = self
                    .outbound
                    .send(OrchestratorEvent::Error(format!(
                        "Speech recognition error: {}",
                        message
                    )))
                    .await;
            }
        }
    }

    /// The user started speaking. Only meaningful while the assistant is
    /// speaking: cut the response off and go back to listening.
    async fn on_speech_started(&mut self) {
        if self.state.get() != ConversationState::Speaking {
            return;
        }
        info!("User interrupted the response");
        self.interrupt.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(OrchestratorEvent::Interrupt).await;

        if let Some(mut tts) = self.synthesis.lock().await.take() {
            tts.close(true).await;
        }
        if let Some(task) = self.response_task.as_ref() {
            task.abort();
        }
        self.state.set(ConversationState::Listening).await;
    }

    /// A confirmed end of the user's turn: supersede any in-flight response
    /// and start generating a new one.
    async fn on_end_of_turn(&mut self, transcript: String) {
        if transcript.trim().is_empty() {
            return;
        }
        let user_message = if self.current_turn.is_empty() {
            transcript.trim().to_string()
        } else {
            std::mem::take(&mut self.current_turn)
        };
        info!("Processing turn: {:.100}", user_message);

        self.cancel_response().await;

        self.interrupt = Arc::new(AtomicBool::new(false));
        self.state.set(ConversationState::Processing).await;

        let context = ResponseContext {
            session_id: self.session_id.clone(),
            deps: self.deps.clone(),
            tts_config: self.tts_config.clone(),
            outbound: self.outbound.clone(),
            state: self.state.clone(),
            interrupt: self.interrupt.clone(),
            synthesis: self.synthesis.clone(),
        };
        self.response_task = Some(tokio::spawn(run_response(context, user_message)));
    }

    /// Flag, force-close, and abort the current response task, waiting a
    /// bounded interval for it to unwind.
    async fn cancel_response(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(mut tts) = self.synthesis.lock().await.take() {
            tts.close(true).await;
        }
        if let Some(task) = self.response_task.take() {
            if !task.is_finished() {
                task.abort();
                let _ = tokio::time::timeout(CANCEL_WAIT, task).await;
            }
        }
    }
}

/// Await the next STT event. Only polled while the receiver exists.
async fn recv_event(events: &mut Option<mpsc::Receiver<SttEvent>>) -> Option<SttEvent> {
    match events.as_mut() {
        Some(receiver) => receiver.recv().await,
        None => None,
    }
}

/// Everything a response task needs, detached from the orchestrator so the
/// select loop keeps running while the response streams.
struct ResponseContext {
    session_id: Option<String>,
    deps: VoiceDeps,
    tts_config: TtsConfig,
    outbound: mpsc::Sender<OrchestratorEvent>,
    state: Arc<StateCell>,
    interrupt: Arc<AtomicBool>,
    synthesis: SynthesisSlot,
}

impl ResponseContext {
    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

/// Entry point of a response task. Whatever happens inside, the conversation
/// must come back to Listening unless it was stopped entirely.
async fn run_response(ctx: ResponseContext, user_message: String) {
    if let Err(e) = generate_and_speak(&ctx, &user_message).await {
        error!("Error generating response: {}", e);
        let _ = ctx
            .outbound
            .send(OrchestratorEvent::Error(format!("Response failed: {}", e)))
            .await;
    }
    match ctx.state.get() {
        ConversationState::Idle | ConversationState::Listening => {}
        _ => ctx.state.set(ConversationState::Listening).await,
    }
}

async fn generate_and_speak(ctx: &ResponseContext, user_message: &str) -> anyhow::Result<()> {
    // History write happens off the critical path
    if let (Some(store), Some(session_id)) = (&ctx.deps.sessions, &ctx.session_id) {
        let store = store.clone();
        let session_id = session_id.clone();
        let message = user_message.to_string();
        tokio::spawn(async move {
            store.save_message(&session_id, Role::User, &message).await;
        });
    }

    // Context and history fetched in parallel
    let retrieval = ctx.deps.retriever.retrieve(user_message, CONTEXT_K);
    let history = async {
        match (&ctx.deps.sessions, &ctx.session_id) {
            (Some(store), Some(session_id)) => store.get_history(session_id).await,
            _ => Vec::new(),
        }
    };
    let ((context, _chunks), history) = tokio::join!(retrieval, history);
    let chat_history = format_history(&history, HISTORY_EXCHANGES);

    if ctx.interrupted() {
        return Ok(());
    }

    // Fresh synthesis connection for this response
    let (tts_tx, tts_rx) = mpsc::channel(64);
    let tts = SpeechSynthesisClient::connect(&ctx.tts_config, tts_tx)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    *ctx.synthesis.lock().await = Some(tts);

    let forwarder = tokio::spawn(forward_audio(
        tts_rx,
        ctx.outbound.clone(),
        ctx.interrupt.clone(),
    ));

    ctx.state.set(ConversationState::Speaking).await;

    let mut generation = ctx
        .deps
        .generator
        .stream_voice(user_message, &context, &chat_history);
    let mut full_response = String::new();
    let mut sentence_buffer = String::new();

    while let Some(item) = generation.recv().await {
        if ctx.interrupted() {
            break;
        }
        let chunk = match item {
            StreamEvent::Content(text) => text,
            // Speak the apology instead of going silent
            StreamEvent::Failed(e) => {
                error!("Generation failed: {}", e);
                crate::llm::APOLOGY.to_string()
            }
        };
        full_response.push_str(&chunk);
        sentence_buffer.push_str(&chunk);
        let _ = ctx
            .outbound
            .send(OrchestratorEvent::ResponseText(chunk))
            .await;

        for sentence in sentence::drain_sentences(&mut sentence_buffer) {
            if ctx.interrupted() {
                break;
            }
            if sentence.trim().is_empty() {
                continue;
            }
            speak_sentence(ctx, &sentence).await;
        }
    }
    // Dropping the receiver tells the generator to stop
    drop(generation);

    if !ctx.interrupted() && !sentence_buffer.trim().is_empty() {
        speak_sentence(ctx, &sentence_buffer).await;
    }

    if !ctx.interrupted() {
        drain_synthesis(ctx).await;
    }

    if !ctx.interrupted() && !full_response.is_empty() {
        if let (Some(store), Some(session_id)) = (&ctx.deps.sessions, &ctx.session_id) {
            let store = store.clone();
            let session_id = session_id.clone();
            let response = full_response.clone();
            tokio::spawn(async move {
                store
                    .save_message(&session_id, Role::Assistant, &response)
                    .await;
            });
        }
        info!("Response complete ({} chars)", full_response.len());
    }

    if !ctx.interrupted() {
        if let Some(mut tts) = ctx.synthesis.lock().await.take() {
            tts.close(false).await;
        }
        ctx.state.set(ConversationState::Listening).await;
    }

    // The forwarder drains on its own once the synthesis connection closes
    let _ = forwarder.await;
    Ok(())
}

/// Queue one sentence for synthesis. Text streams continuously; the single
/// end-of-input flush comes from [`drain_synthesis`] once generation ends.
async fn speak_sentence(ctx: &ResponseContext, text: &str) {
    let sent = {
        let mut slot = ctx.synthesis.lock().await;
        match slot.as_mut() {
            Some(tts) => tts.send_text(text).await,
            None => Ok(()),
        }
    };
    if let Err(e) = sent {
        error!("Error sending text to synthesis: {}", e);
        let _ = ctx
            .outbound
            .send(OrchestratorEvent::Error(format!(
                "Speech synthesis send failed: {}",
                e
            )))
            .await;
    }
}

/// Signal end of input with one flush, then wait for every outstanding
/// acknowledgment without holding the synthesis slot, so an interrupt can
/// still force-close the connection.
async fn drain_synthesis(ctx: &ResponseContext) {
    let (flushed, watch) = {
        let mut slot = ctx.synthesis.lock().await;
        match slot.as_mut() {
            Some(tts) => (tts.flush().await, Some(tts.flush_watch())),
            None => (Ok(()), None),
        }
    };
    if let Err(e) = flushed {
        error!("Error requesting synthesis flush: {}", e);
        let _ = ctx
            .outbound
            .send(OrchestratorEvent::Error(format!(
                "Speech synthesis flush failed: {}",
                e
            )))
            .await;
    }
    let Some(mut watch) = watch else { return };
    match tokio::time::timeout(FLUSH_WAIT, watch.wait_for(|count| *count == 0)).await {
        Ok(Ok(_)) => debug!("Synthesis drained"),
        Ok(Err(_)) => debug!("Synthesis connection closed while draining"),
        Err(_) => tracing::warn!("Timed out draining synthesis after {:?}", FLUSH_WAIT),
    };
}

/// Relay synthesized audio to the transport. Audio arriving after an
/// interrupt is discarded so the user never hears a cut-off response resume.
async fn forward_audio(
    mut events: mpsc::Receiver<TtsEvent>,
    outbound: mpsc::Sender<OrchestratorEvent>,
    interrupt: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TtsEvent::Audio(data) => {
                if interrupt.load(Ordering::SeqCst) {
                    continue;
                }
                if outbound.send(OrchestratorEvent::Audio(data)).await.is_err() {
                    break;
                }
            }
            TtsEvent::Flushed => debug!("Synthesis flush acknowledged"),
            TtsEvent::Error(message) => {
                error!("Synthesis error: {}", message);
                let _ = outbound
                    .send(OrchestratorEvent::Error(format!(
                        "Speech synthesis error: {}",
                        message
                    )))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, RetrievalConfig};
    use crate::retrieval::MockVectorIndex;

    fn test_deps() -> VoiceDeps {
        let mut index = MockVectorIndex::new();
        index.expect_search().returning(|_, _| Ok(Vec::new()));
        VoiceDeps {
            sessions: None,
            retriever: Arc::new(ContextRetriever::new(
                Arc::new(index),
                RetrievalConfig::default(),
            )),
            generator: Arc::new(ResponseGenerator::new(LlmConfig::default())),
        }
    }

    fn test_context(outbound: mpsc::Sender<OrchestratorEvent>) -> ResponseContext {
        ResponseContext {
            session_id: None,
            deps: test_deps(),
            tts_config: TtsConfig::default(),
            outbound: outbound.clone(),
            state: Arc::new(StateCell::new(outbound)),
            interrupt: Arc::new(AtomicBool::new(false)),
            synthesis: Arc::new(Mutex::new(None)),
        }
    }

    async fn connect_synthesis(url: String) -> (SpeechSynthesisClient, mpsc::Receiver<TtsEvent>) {
        let config = TtsConfig {
            api_key: Some("test-key".to_string()),
            url,
            ..TtsConfig::default()
        };
        let (events_tx, events_rx) = mpsc::channel(64);
        let client = SpeechSynthesisClient::connect(&config, events_tx)
            .await
            .expect("synthesis connect should succeed");
        (client, events_rx)
    }

    fn test_orchestrator() -> (VoiceOrchestrator, mpsc::Receiver<OrchestratorEvent>) {
        let deps = test_deps();

        let stt_config = SttConfig {
            api_key: Some("test-key".to_string()),
            ..SttConfig::default()
        };
        // Unroutable endpoint so any accidental connection fails fast
        let tts_config = TtsConfig {
            api_key: Some("test-key".to_string()),
            url: "ws://127.0.0.1:9".to_string(),
            ..TtsConfig::default()
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let orchestrator = VoiceOrchestrator::new(stt_config, tts_config, deps, outbound_tx);
        (orchestrator, outbound_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for_state(
        rx: &mut mpsc::Receiver<OrchestratorEvent>,
        wanted: ConversationState,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(OrchestratorEvent::StateChange(state))) if state == wanted => return true,
                Ok(Some(_)) => {}
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let (orchestrator, _rx) = test_orchestrator();
        assert_eq!(orchestrator.state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_empty_end_of_turn_is_ignored() {
        let (mut orchestrator, mut rx) = test_orchestrator();
        orchestrator.state.set(ConversationState::Listening).await;

        orchestrator.on_end_of_turn("   ".to_string()).await;

        assert!(orchestrator.response_task.is_none());
        assert_eq!(orchestrator.state(), ConversationState::Listening);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .all(|e| !matches!(e, OrchestratorEvent::StateChange(ConversationState::Processing))));
    }

    #[tokio::test]
    async fn test_speech_while_listening_is_not_an_interrupt() {
        let (mut orchestrator, mut rx) = test_orchestrator();
        orchestrator.state.set(ConversationState::Listening).await;
        drain(&mut rx);

        orchestrator.on_speech_started().await;

        assert_eq!(orchestrator.state(), ConversationState::Listening);
        assert!(!orchestrator.interrupt.load(Ordering::SeqCst));
        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, OrchestratorEvent::Interrupt)));
    }

    #[tokio::test]
    async fn test_speech_while_speaking_interrupts() {
        let (mut orchestrator, mut rx) = test_orchestrator();
        orchestrator.state.set(ConversationState::Speaking).await;
        drain(&mut rx);

        orchestrator.on_speech_started().await;

        assert!(orchestrator.interrupt.load(Ordering::SeqCst));
        assert_eq!(orchestrator.state(), ConversationState::Listening);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::Interrupt)));
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::StateChange(ConversationState::Listening)
        )));
    }

    #[tokio::test]
    async fn test_final_transcripts_accumulate() {
        let (mut orchestrator, _rx) = test_orchestrator();

        orchestrator
            .handle_stt_event(SttEvent::Transcript {
                text: "hello".to_string(),
                is_final: true,
            })
            .await;
        orchestrator
            .handle_stt_event(SttEvent::Transcript {
                text: "interim".to_string(),
                is_final: false,
            })
            .await;
        orchestrator
            .handle_stt_event(SttEvent::Transcript {
                text: " world".to_string(),
                is_final: true,
            })
            .await;

        assert_eq!(orchestrator.current_turn, "hello world");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut orchestrator, mut rx) = test_orchestrator();
        orchestrator.state.set(ConversationState::Listening).await;

        orchestrator.stop().await;
        assert_eq!(orchestrator.state(), ConversationState::Idle);
        orchestrator.stop().await;
        assert_eq!(orchestrator.state(), ConversationState::Idle);

        // Only one Idle transition is announced
        let idles = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, OrchestratorEvent::StateChange(ConversationState::Idle)))
            .count();
        assert_eq!(idles, 1);
    }

    #[tokio::test]
    async fn test_failed_response_recovers_to_listening() {
        let (mut orchestrator, mut rx) = test_orchestrator();
        orchestrator.state.set(ConversationState::Listening).await;
        drain(&mut rx);

        // Synthesis connect fails (unroutable endpoint); the task must
        // report the error and put the conversation back in Listening
        orchestrator
            .on_end_of_turn("where have you worked".to_string())
            .await;
        assert_eq!(orchestrator.state(), ConversationState::Processing);

        assert!(wait_for_state(&mut rx, ConversationState::Listening).await);
    }

    #[tokio::test]
    async fn test_no_audio_forwarded_after_interrupt() {
        let (tts_tx, tts_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let interrupt = Arc::new(AtomicBool::new(false));
        let forwarder = tokio::spawn(forward_audio(tts_rx, out_tx, interrupt.clone()));

        tts_tx.send(TtsEvent::Audio(vec![1, 2])).await.unwrap();
        // The pre-interrupt chunk goes through
        match tokio::time::timeout(Duration::from_secs(1), out_rx.recv()).await {
            Ok(Some(OrchestratorEvent::Audio(data))) => assert_eq!(data, vec![1, 2]),
            other => panic!("expected audio, got {:?}", other),
        }

        interrupt.store(true, Ordering::SeqCst);
        tts_tx.send(TtsEvent::Audio(vec![3])).await.unwrap();
        drop(tts_tx);
        forwarder.await.unwrap();

        // Nothing after the interrupt
        while let Ok(event) = out_rx.try_recv() {
            assert!(!matches!(event, OrchestratorEvent::Audio(_)));
        }
    }

    #[tokio::test]
    async fn test_sentences_stream_without_intermediate_flushes() {
        let (url, mut frames) = crate::voice::testing::speech_service().await;
        let (out_tx, _out_rx) = mpsc::channel(8);
        let ctx = test_context(out_tx);
        let (client, _events) = connect_synthesis(url).await;
        *ctx.synthesis.lock().await = Some(client);

        speak_sentence(&ctx, "First sentence. ").await;
        speak_sentence(&ctx, "Second sentence! ").await;
        drain_synthesis(&ctx).await;

        // Text streams continuously; the flush comes once, after generation
        let mut kinds = Vec::new();
        while let Ok(kind) = frames.try_recv() {
            kinds.push(kind);
        }
        assert_eq!(kinds, vec!["Speak", "Speak", "Flush"]);
    }

    #[tokio::test]
    async fn test_synthesis_send_failure_reaches_error_event() {
        let (url, _frames) = crate::voice::testing::speech_service().await;
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let ctx = test_context(out_tx);
        let (mut client, _events) = connect_synthesis(url).await;
        // Closing the sink makes the next send fail
        client.close(true).await;
        *ctx.synthesis.lock().await = Some(client);

        speak_sentence(&ctx, "Hello there. ").await;

        let events = drain(&mut out_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_new_turn_supersedes_previous_task() {
        let (mut orchestrator, _rx) = test_orchestrator();
        orchestrator.state.set(ConversationState::Listening).await;

        orchestrator
            .on_end_of_turn("first question".to_string())
            .await;
        let first_handle = orchestrator
            .response_task
            .as_ref()
            .expect("first turn spawns a task")
            .abort_handle();
        let first_interrupt = orchestrator.interrupt.clone();

        orchestrator
            .on_end_of_turn("second question".to_string())
            .await;

        // The first task is flagged and gone before the second one runs
        assert!(first_interrupt.load(Ordering::SeqCst));
        assert!(first_handle.is_finished());
        assert!(orchestrator.synthesis.lock().await.is_none());
        assert!(!orchestrator.interrupt.load(Ordering::SeqCst));
        assert!(orchestrator.response_task.is_some());
        orchestrator.cancel_response().await;
    }

    #[tokio::test]
    async fn test_end_of_turn_prefers_accumulated_transcripts() {
        let (mut orchestrator, _rx) = test_orchestrator();
        orchestrator.state.set(ConversationState::Listening).await;
        orchestrator.current_turn = "what did you build".to_string();

        orchestrator.on_end_of_turn("build".to_string()).await;

        // The turn buffer is consumed and a response task is running
        assert!(orchestrator.current_turn.is_empty());
        assert!(orchestrator.response_task.is_some());
        orchestrator.cancel_response().await;
    }
}
