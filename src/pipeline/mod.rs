//! Turn orchestrator.
//!
//! Wires VAD, STT, LLM, TTS, playback, context, tools, and memory into the
//! full-duplex conversational loop. The orchestrator owns all turn state;
//! the microphone driver posts chunks from its own thread through a bounded
//! channel, and everything else runs cooperatively on the event loop. The
//! synchronous pieces (state machine, VAD counters, chunker, message log)
//! are atomic between suspension points.

use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::AudioOut;
use crate::config::Config;
use crate::context::{Content, ContentBlock, ContextManager, Role};
use crate::conversation_log::ConversationLogger;
use crate::error::{AuraError, Result};
use crate::hass::ToolBackend;
use crate::llm::ChatStream;
use crate::memory::MemoryExtractor;
use crate::state::{State, StateMachine};
use crate::store::GraphStore;
use crate::stt::{SttEvent, SttLink};
use crate::processing::{chunk_sentences, sanitize_for_tts};
use crate::tts::SpeechSynth;
use crate::turn::TurnClock;
use crate::vad::VadProcessor;

/// Capacity of the microphone chunk channel.
pub const AUDIO_CHANNEL_SIZE: usize = 64;
/// Bounded producer–consumer queue between TTS and playback.
const AUDIO_QUEUE_SIZE: usize = 32;
/// Queue depth at which back-pressure is logged.
const QUEUE_PRESSURE_DEPTH: usize = 28;
/// Minimum interval between queue-pressure log lines.
const QUEUE_PRESSURE_LOG_INTERVAL: Duration = Duration::from_secs(5);
/// Maximum LLM tool iterations per turn.
const MAX_TOOL_ITERATIONS: usize = 3;

/// External collaborators, wired at construction so their lifetimes nest
/// inside the orchestrator's.
pub struct PipelineDeps {
    pub stt: Arc<dyn SttLink>,
    pub llm: Arc<dyn ChatStream>,
    pub tts: Arc<dyn SpeechSynth>,
    pub player: Arc<dyn AudioOut>,
    pub tools: Option<Arc<dyn ToolBackend>>,
    pub memory: Option<Arc<MemoryExtractor>>,
    pub store: Option<GraphStore>,
}

/// The turn orchestrator.
pub struct Pipeline {
    config: Config,
    sm: StateMachine,
    vad: Mutex<VadProcessor>,
    stt: Arc<dyn SttLink>,
    llm: Arc<dyn ChatStream>,
    tts: Arc<dyn SpeechSynth>,
    player: Arc<dyn AudioOut>,
    tools: Option<Arc<dyn ToolBackend>>,
    memory: Option<Arc<MemoryExtractor>>,
    store: Option<GraphStore>,
    ctx: Mutex<ContextManager>,
    conv_logger: ConversationLogger,
    turn: TurnClock,

    current_transcript: Mutex<String>,
    pending_audio: Mutex<Vec<Bytes>>,
    stt_connected: AtomicBool,
    active_timeout_task: Mutex<Option<JoinHandle<()>>>,
    barge_in_count: AtomicU32,
    speaking_since: Mutex<Option<Instant>>,
    background_tasks: Mutex<JoinSet<()>>,
    conversation_id: Mutex<Uuid>,
    session_msg_offset: AtomicUsize,
}

impl Pipeline {
    pub fn new(config: Config, vad: VadProcessor, ctx: ContextManager, deps: PipelineDeps) -> Arc<Self> {
        let conv_logger = ConversationLogger::new(config.server.conversation_log_dir.clone());
        Arc::new(Self {
            sm: StateMachine::new(config.vad.vad_threshold, config.vad.vad_threshold_speaking),
            vad: Mutex::new(vad),
            stt: deps.stt,
            llm: deps.llm,
            tts: deps.tts,
            player: deps.player,
            tools: deps.tools,
            memory: deps.memory,
            store: deps.store,
            ctx: Mutex::new(ctx),
            conv_logger,
            turn: TurnClock::new(),
            current_transcript: Mutex::new(String::new()),
            pending_audio: Mutex::new(Vec::new()),
            stt_connected: AtomicBool::new(false),
            active_timeout_task: Mutex::new(None),
            barge_in_count: AtomicU32::new(0),
            speaking_since: Mutex::new(None),
            background_tasks: Mutex::new(JoinSet::new()),
            conversation_id: Mutex::new(Uuid::new_v4()),
            session_msg_offset: AtomicUsize::new(0),
            config,
        })
    }

    /// Current turn state.
    pub fn state(&self) -> State {
        self.sm.state()
    }

    /// Read-only snapshot of the conversation log. Not exposed over HTTP.
    pub fn conversation_messages(&self) -> Vec<crate::context::Message> {
        self.ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages()
            .to_vec()
    }

    /// Runtime diagnostics for the HTTP surface.
    pub fn diagnostics(&self) -> Value {
        let mut diag = json!({
            "state": self.sm.state().name(),
            "background_tasks": self.background_task_count(),
            "active_timeout": self
                .active_timeout_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some(),
        });
        if let Some(store) = &self.store {
            diag["db_pool_size"] = json!(store.pool().size());
            diag["db_pool_free"] = json!(store.pool().num_idle());
        }
        diag
    }

    /// Drive the event loop: microphone chunks and STT events, until
    /// cancelled.
    pub async fn run(
        self: &Arc<Self>,
        mut audio_rx: mpsc::Receiver<Bytes>,
        mut stt_rx: mpsc::UnboundedReceiver<SttEvent>,
        cancel: CancellationToken,
    ) {
        info!("pipeline running");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                chunk = audio_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    // The capture thread must never die to a turn error.
                    if let Err(e) = self.handle_audio_chunk(chunk).await {
                        error!("error in audio chunk processing: {e}");
                    }
                }
                event = stt_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_stt_event(event).await;
                }
            }
        }
        info!("pipeline loop ended");
    }

    /// Per-chunk path: VAD, barge-in counting, STT forwarding.
    pub async fn handle_audio_chunk(self: &Arc<Self>, chunk: Bytes) -> Result<()> {
        let is_speech = {
            let mut vad = self.vad.lock().unwrap_or_else(|e| e.into_inner());
            vad.set_threshold(self.sm.vad_threshold());
            vad.is_speech(&chunk)?
        };

        if is_speech {
            match self.sm.state() {
                State::Idle | State::Active => {
                    self.barge_in_count.store(0, Ordering::Relaxed);
                    self.handle_vad_speech().await?;
                }
                State::Speaking => {
                    // The grace window prevents the assistant's own first
                    // audio from self-triggering without echo cancellation.
                    let grace = Duration::from_millis(self.config.server.barge_in_grace_ms);
                    let past_grace = self
                        .speaking_since
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .is_none_or(|since| since.elapsed() >= grace);
                    if past_grace {
                        let frames = self.barge_in_count.fetch_add(1, Ordering::Relaxed) + 1;
                        if frames >= self.config.server.barge_in_frames {
                            info!(frames, "barge-in");
                            self.barge_in_count.store(0, Ordering::Relaxed);
                            self.sm.on_speech_detected()?;
                            self.handle_barge_in().await?;
                        }
                    }
                }
                _ => {}
            }
        } else {
            self.barge_in_count.store(0, Ordering::Relaxed);
        }

        if self.sm.state() == State::Listening {
            if self.stt_connected.load(Ordering::Relaxed) {
                if self.stt.send_audio(chunk).await.is_err() {
                    self.stt_connected.store(false, Ordering::Relaxed);
                }
            } else {
                self.pending_audio
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(chunk);
            }
        }
        Ok(())
    }

    async fn handle_stt_event(self: &Arc<Self>, event: SttEvent) {
        match event {
            SttEvent::Transcript { text, is_final } => {
                if is_final {
                    let mut transcript = self
                        .current_transcript
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    if !transcript.is_empty() {
                        transcript.push(' ');
                    }
                    transcript.push_str(&text);
                    let preview: String = text.chars().take(50).collect();
                    info!(text = %preview, elapsed_ms = self.turn.elapsed_ms(), "STT final");
                }
            }
            SttEvent::UtteranceEnd => self.handle_utterance_end().await,
        }
    }

    /// VAD detected speech in Idle/Active: transition and connect STT.
    async fn handle_vad_speech(self: &Arc<Self>) -> Result<()> {
        self.turn.start();
        info!(state = %self.sm.state(), "VAD speech");
        self.sm.on_speech_detected()?;
        self.current_transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.stt_connected.store(false, Ordering::Relaxed);

        // Drain the ring before reset so pre-trigger audio survives.
        {
            let mut vad = self.vad.lock().unwrap_or_else(|e| e.into_inner());
            let prebuffer = vad.drain_prebuffer();
            vad.reset();
            *self.pending_audio.lock().unwrap_or_else(|e| e.into_inner()) = prebuffer;
        }

        if self.stt.connect().await.is_err() {
            warn!("STT connect failed, falling back to idle");
            self.sm.force(State::Idle);
            self.pending_audio
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            self.turn.reset();
            return Ok(());
        }

        self.flush_pending_audio().await;
        Ok(())
    }

    /// Forward buffered audio (pre-trigger + anything that arrived during
    /// connect) to STT in order, then mark the stream live.
    async fn flush_pending_audio(&self) {
        let pending: Vec<Bytes> = std::mem::take(
            &mut *self.pending_audio.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for chunk in pending {
            if self.stt.send_audio(chunk).await.is_err() {
                break;
            }
        }
        self.stt_connected
            .store(self.stt.is_connected(), Ordering::Relaxed);
    }

    /// STT utterance end: hand the transcript to response processing.
    async fn handle_utterance_end(self: &Arc<Self>) {
        let transcript = self
            .current_transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .trim()
            .to_owned();
        if transcript.is_empty() {
            return;
        }

        info!(len = transcript.len(), elapsed_ms = self.turn.elapsed_ms(), "utterance done");
        if let Err(e) = self.sm.on_utterance_complete() {
            warn!("utterance end ignored: {e}");
            return;
        }
        self.stt_connected.store(false, Ordering::Relaxed);
        self.pending_audio
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.stt.disconnect().await;

        self.ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_message(Role::User, transcript.clone());
        self.save_message_bg("user", transcript);

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.process_response().await;
        });
    }

    /// Stream LLM → chunker → TTS → playback, with up to
    /// [`MAX_TOOL_ITERATIONS`] tool iterations. All failure paths restore a
    /// live state.
    pub async fn process_response(self: Arc<Self>) {
        if let Err(e) = self.process_response_inner().await {
            error!("error in process_response: {e}");
            let _ = self.player.kill().await;
            self.turn.reset();
            if matches!(self.sm.state(), State::Processing | State::Speaking) {
                self.sm.force(State::Active);
                self.start_active_timeout();
            }
        }
    }

    async fn process_response_inner(self: &Arc<Self>) -> Result<()> {
        let (system_blocks, tools) = {
            let ctx = self.ctx.lock().unwrap_or_else(|e| e.into_inner());
            let schemas = self.tools.as_ref().map(|t| t.build_tool_schemas());
            (ctx.build_system_blocks(), ctx.build_tools(schemas))
        };

        for iteration in 0..MAX_TOOL_ITERATIONS {
            let messages = self
                .ctx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .messages()
                .to_vec();

            // Optional safety valve: drop tools on the last iteration to
            // force a text-only response.
            let final_iteration = iteration == MAX_TOOL_ITERATIONS - 1;
            let iter_tools = if final_iteration && self.config.llm.strip_tools_on_final {
                warn!(iteration, "tool loop limit, forcing text-only");
                Vec::new()
            } else {
                tools.clone()
            };

            // Barge-in between iterations (e.g. during tool execution of the
            // previous pass) leaves us out of Processing; bail cleanly.
            if self.sm.state() != State::Processing {
                info!(iteration, state = %self.sm.state(), "state changed before TTS start");
                self.turn.reset();
                return Ok(());
            }

            self.sm.on_tts_started()?;
            self.player.start().await?;

            let (queue_tx, queue_rx) = mpsc::channel::<Option<Bytes>>(AUDIO_QUEUE_SIZE);
            let producer = tokio::spawn(produce_audio(
                Arc::clone(self),
                system_blocks.clone(),
                iter_tools,
                messages,
                queue_tx,
            ));
            let consumer = tokio::spawn(consume_audio(Arc::clone(self), queue_rx));
            let full_text = join_first_error(producer, consumer).await?;

            if self.sm.state() != State::Interrupted {
                self.player.finish().await?;
            }

            let tool_blocks = self.llm.tool_use_blocks();
            let response_content = self
                .llm
                .last_response_content()
                .filter(|blocks| !blocks.is_empty())
                .map(Content::Blocks)
                .unwrap_or_else(|| Content::Text(full_text.clone()));

            if tool_blocks.is_empty() {
                if self.sm.try_on_tts_complete() {
                    self.ctx
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .add_message(Role::Assistant, response_content);
                    self.save_message_bg("assistant", full_text.clone());
                    info!(
                        chars = full_text.len(),
                        elapsed_ms = self.turn.elapsed_ms(),
                        "response done"
                    );
                    self.turn.reset();
                    self.start_active_timeout();
                    self.extract_memories_bg();
                } else {
                    info!(state = %self.sm.state(), "response interrupted");
                    self.turn.reset();
                }
                return Ok(());
            }

            // Tool use: record the assistant message (with its tool_use
            // blocks) before any tool runs, then reply with one user message
            // holding all tool results.
            info!(count = tool_blocks.len(), iteration, "tool use");
            self.ctx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add_message(Role::Assistant, response_content);
            self.save_message_bg("assistant", full_text);

            let mut results = Vec::with_capacity(tool_blocks.len());
            for block in &tool_blocks {
                let Some((id, name, input)) = block.as_tool_use() else {
                    continue;
                };
                let result = match &self.tools {
                    Some(backend) => backend.execute(name, input).await,
                    None => Ok(json!({"error": format!("Unknown tool: {name}")})),
                };
                match result {
                    Ok(value) => {
                        results.push(ContentBlock::tool_result(id, value.to_string(), false));
                    }
                    Err(e) => {
                        warn!(tool = name, "tool failed: {e}");
                        results.push(ContentBlock::tool_result(id, e.to_string(), true));
                    }
                }
            }
            self.ctx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add_message(Role::User, Content::Blocks(results));

            if self.sm.state() != State::Speaking {
                info!(iteration, state = %self.sm.state(), "interrupted during tool execution");
                self.turn.reset();
                return Ok(());
            }
            self.sm.on_tool_iteration()?;
        }

        // Defense in depth: the loop can only fall through when the model
        // keeps requesting tools and stripping is disabled.
        error!("tool loop fell through without resolution");
        self.turn.reset();
        if matches!(self.sm.state(), State::Processing | State::Speaking) {
            self.sm.force(State::Active);
            self.start_active_timeout();
        }
        Ok(())
    }

    /// User interrupted during playback: cancel everything and reconnect STT.
    async fn handle_barge_in(self: &Arc<Self>) -> Result<()> {
        info!(state = %self.sm.state(), "interrupting");
        self.llm.cancel();
        self.tts.flush();
        self.player.kill().await?;
        self.sm.on_interrupt_handled()?;
        self.stt_connected.store(false, Ordering::Relaxed);
        self.turn.start();
        self.current_transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        {
            let mut vad = self.vad.lock().unwrap_or_else(|e| e.into_inner());
            let prebuffer = vad.drain_prebuffer();
            vad.reset();
            *self.pending_audio.lock().unwrap_or_else(|e| e.into_inner()) = prebuffer;
        }

        if self.stt.connect().await.is_err() {
            warn!("STT reconnect failed after barge-in, falling back to idle");
            self.sm.force(State::Idle);
            self.pending_audio
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            self.turn.reset();
            return Ok(());
        }

        self.flush_pending_audio().await;
        Ok(())
    }

    /// (Re)arm the active-timeout; any prior timer is cancelled first.
    fn start_active_timeout(self: &Arc<Self>) {
        let mut guard = self
            .active_timeout_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(task) = guard.take() {
            task.abort();
        }
        let pipeline = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(pipeline.config.server.active_timeout)).await;
            if pipeline.sm.state() == State::Active {
                info!("active timeout, returning to idle");
                let _ = pipeline.sm.on_active_timeout();
                pipeline.stt.disconnect().await;
                pipeline
                    .vad
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .reset();
                pipeline.save_session_log();
            }
        }));
    }

    /// Archive messages accumulated since the last session boundary and mint
    /// a fresh conversation id.
    fn save_session_log(&self) {
        let (session_id, new_messages) = {
            let ctx = self.ctx.lock().unwrap_or_else(|e| e.into_inner());
            let offset = self.session_msg_offset.load(Ordering::Relaxed);
            let messages = ctx.messages();
            let new_messages = messages[offset.min(messages.len())..].to_vec();
            self.session_msg_offset.store(messages.len(), Ordering::Relaxed);
            let mut id = self.conversation_id.lock().unwrap_or_else(|e| e.into_inner());
            let session_id = *id;
            *id = Uuid::new_v4();
            (session_id, new_messages)
        };
        if !new_messages.is_empty() {
            self.conv_logger.save_session(session_id, &new_messages);
        }
    }

    /// Persist one message to the store in the background.
    fn save_message_bg(self: &Arc<Self>, role: &'static str, content: String) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let conversation_id = *self
            .conversation_id
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.spawn_background(async move {
            if let Err(e) = store.save_message(conversation_id, role, &content, None).await {
                debug!("message save failed: {e}");
            }
        });
    }

    /// Extract memories from the conversation so far and refresh the RAG
    /// context, in the background.
    fn extract_memories_bg(self: &Arc<Self>) {
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let pipeline = Arc::clone(self);
        self.spawn_background(async move {
            let messages = pipeline
                .ctx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .messages()
                .to_vec();
            match memory.extract_incremental(&messages).await {
                Ok(extraction) => {
                    if let Err(e) = memory.save_extraction(&extraction).await {
                        warn!("memory extraction failed: {e}");
                        return;
                    }
                }
                Err(e) => {
                    warn!("memory extraction failed: {e}");
                    return;
                }
            }

            let query = pipeline
                .current_transcript
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if !query.is_empty() {
                match memory.pre_load_context(&query).await {
                    Ok(rag) => pipeline
                        .ctx
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .update_rag_context(rag),
                    Err(e) => debug!("RAG refresh failed: {e}"),
                }
            }
        });
    }

    fn spawn_background<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self
            .background_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks so the set tracks only live work.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(future);
    }

    fn background_task_count(&self) -> usize {
        let mut tasks = self
            .background_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Clean shutdown: archive, cancel, close, export. Every step is
    /// isolated so shutdown always completes.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("pipeline shutting down");
        self.stt_connected.store(false, Ordering::Relaxed);
        self.pending_audio
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.save_session_log();

        if let Some(task) = self
            .active_timeout_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        self.llm.cancel();
        self.tts.flush();
        self.stt.disconnect().await;
        if let Err(e) = self.player.kill().await {
            debug!("player close failed: {e}");
        }

        let mut tasks = std::mem::take(
            &mut *self
                .background_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        if let Some(store) = &self.store {
            if let Err(e) = store.export_tables(&self.config.database.db_export_dir).await {
                warn!("DB export failed: {e}");
            }
            store.pool().close().await;
        }
        info!("pipeline shutdown complete");
    }
}

/// Producer: LLM deltas → sentence chunker → TTS → bounded queue.
///
/// The sentinel is posted exactly once per invocation, whatever the exit
/// path, so the consumer always terminates.
async fn produce_audio(
    pipeline: Arc<Pipeline>,
    system_blocks: Vec<Value>,
    tools: Vec<Value>,
    messages: Vec<crate::context::Message>,
    queue: mpsc::Sender<Option<Bytes>>,
) -> Result<String> {
    let result = stream_llm_to_queue(&pipeline, system_blocks, tools, messages, &queue).await;
    let _ = queue.send(None).await;
    result
}

async fn stream_llm_to_queue(
    pipeline: &Arc<Pipeline>,
    system_blocks: Vec<Value>,
    tools: Vec<Value>,
    messages: Vec<crate::context::Message>,
    queue: &mpsc::Sender<Option<Bytes>>,
) -> Result<String> {
    let mut deltas = pipeline
        .llm
        .stream_response(system_blocks, tools, messages)
        .await?;

    let mut response = String::new();
    let mut buffer = String::new();
    let mut last_pressure_log: Option<Instant> = None;

    while let Some(delta) = deltas.recv().await {
        let delta = delta?;
        if pipeline.sm.state() == State::Interrupted {
            return Ok(response);
        }
        response.push_str(&delta);
        buffer.push_str(&delta);

        let (sentences, remainder) = chunk_sentences(&buffer);
        buffer = remainder;
        for sentence in sentences {
            if !speak_sentence(pipeline, &sentence, queue, &mut last_pressure_log).await? {
                return Ok(response);
            }
        }
    }

    // Flush the unterminated remainder as the final sentence.
    if !buffer.trim().is_empty() && pipeline.sm.state() != State::Interrupted {
        speak_sentence(pipeline, &buffer, queue, &mut last_pressure_log).await?;
    }
    Ok(response)
}

/// Synthesize one sentence and forward its frames. Returns `false` when the
/// turn was interrupted mid-sentence.
async fn speak_sentence(
    pipeline: &Arc<Pipeline>,
    sentence: &str,
    queue: &mpsc::Sender<Option<Bytes>>,
    last_pressure_log: &mut Option<Instant>,
) -> Result<bool> {
    let clean = sanitize_for_tts(sentence.trim());
    if clean.is_empty() {
        return Ok(true);
    }
    let mut frames = pipeline.tts.stream_audio(&clean).await;
    while let Some(frame) = frames.recv().await {
        if pipeline.sm.state() == State::Interrupted {
            return Ok(false);
        }
        if queue.send(Some(frame)).await.is_err() {
            return Ok(false);
        }
        let depth = AUDIO_QUEUE_SIZE.saturating_sub(queue.capacity());
        if depth >= QUEUE_PRESSURE_DEPTH
            && last_pressure_log.is_none_or(|t| t.elapsed() >= QUEUE_PRESSURE_LOG_INTERVAL)
        {
            warn!(depth, "queue pressure");
            *last_pressure_log = Some(Instant::now());
        }
    }
    Ok(true)
}

/// Consumer: queue → player, until the sentinel or a barge-in.
async fn consume_audio(
    pipeline: Arc<Pipeline>,
    mut queue: mpsc::Receiver<Option<Bytes>>,
) -> Result<()> {
    let mut first_chunk = true;
    while let Some(item) = queue.recv().await {
        let Some(frame) = item else { break };
        if pipeline.sm.state() == State::Interrupted {
            break;
        }
        if first_chunk {
            *pipeline
                .speaking_since
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            first_chunk = false;
        }
        pipeline.player.play_chunk(frame).await?;
    }
    Ok(())
}

/// Join the producer/consumer pair with first-error semantics: when either
/// task errors, the other is cancelled and the error re-raised. On clean
/// completion the producer's accumulated text is returned.
async fn join_first_error(
    mut producer: JoinHandle<Result<String>>,
    mut consumer: JoinHandle<Result<()>>,
) -> Result<String> {
    let mut producer_out: Option<String> = None;
    let mut consumer_done = false;

    loop {
        tokio::select! {
            joined = &mut producer, if producer_out.is_none() => {
                match flatten_join(joined) {
                    Ok(text) => {
                        if consumer_done {
                            return Ok(text);
                        }
                        producer_out = Some(text);
                    }
                    Err(e) => {
                        consumer.abort();
                        let _ = (&mut consumer).await;
                        return Err(e);
                    }
                }
            }
            joined = &mut consumer, if !consumer_done => {
                match flatten_join(joined) {
                    Ok(()) => {
                        if let Some(text) = producer_out.take() {
                            return Ok(text);
                        }
                        consumer_done = true;
                    }
                    Err(e) => {
                        producer.abort();
                        let _ = (&mut producer).await;
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn flatten_join<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(AuraError::Channel(format!("pipeline task failed: {e}"))),
    }
}
