//! End-to-end turn scenarios against scripted collaborators.
//!
//! Every external service (STT, LLM, TTS, player, tools) is a scripted fake;
//! the VAD scorer replays a probability sequence. The real state machine,
//! VAD hysteresis, chunker, and orchestrator run unmodified.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aura::config::Config;
use aura::context::{ContentBlock, ContextManager, Role};
use aura::error::{AuraError, Result};
use aura::hass::ToolBackend;
use aura::llm::ChatStream;
use aura::pipeline::{Pipeline, PipelineDeps};
use aura::processing::content_to_text;
use aura::state::State;
use aura::stt::{SttEvent, SttLink};
use aura::tts::SpeechSynth;
use aura::audio::AudioOut;
use aura::vad::{SpeechScorer, VadProcessor};

// ── Scripted collaborators ─────────────────────────────────────

struct ScriptedScorer {
    probs: Arc<Mutex<VecDeque<f32>>>,
}

impl SpeechScorer for ScriptedScorer {
    fn score(&mut self, _pcm: &[u8]) -> Result<f32> {
        Ok(self
            .probs
            .lock()
            .expect("probs lock")
            .pop_front()
            .unwrap_or(0.0))
    }

    fn reset(&mut self) {}
}

#[derive(Default)]
struct FakeStt {
    fail_connect: bool,
    connected: AtomicBool,
    connect_calls: AtomicU32,
    disconnects: AtomicU32,
    sent: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl SttLink for FakeStt {
    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            self.connected.store(false, Ordering::SeqCst);
            return Err(AuraError::Stt("scripted connect failure".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_audio(&self, chunk: Bytes) -> Result<()> {
        self.sent.lock().expect("sent lock").push(chunk);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct LlmScript {
    deltas: Vec<&'static str>,
    content: Vec<ContentBlock>,
    delta_delay_ms: u64,
}

struct FakeLlm {
    scripts: Mutex<VecDeque<LlmScript>>,
    cancelled: Arc<AtomicBool>,
    last: Arc<Mutex<Option<Vec<ContentBlock>>>>,
}

impl FakeLlm {
    fn new(scripts: Vec<LlmScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            cancelled: Arc::new(AtomicBool::new(false)),
            last: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl ChatStream for FakeLlm {
    async fn stream_response(
        &self,
        _system_blocks: Vec<Value>,
        _tools: Vec<Value>,
        _messages: Vec<aura::context::Message>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        *self.last.lock().expect("last lock") = None;
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or(LlmScript {
                deltas: Vec::new(),
                content: Vec::new(),
                delta_delay_ms: 0,
            });
        let (tx, rx) = mpsc::channel(64);
        let last = Arc::clone(&self.last);
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            for delta in script.deltas {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                if script.delta_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(script.delta_delay_ms)).await;
                }
                if tx.send(Ok(delta.to_owned())).await.is_err() {
                    break;
                }
            }
            *last.lock().expect("last lock") = Some(script.content);
        });
        Ok(rx)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn last_response_content(&self) -> Option<Vec<ContentBlock>> {
        self.last.lock().expect("last lock").clone()
    }

    fn tool_use_blocks(&self) -> Vec<ContentBlock> {
        self.last_response_content()
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.as_tool_use().is_some())
            .collect()
    }
}

static SILENT_FRAME: [u8; 320] = [0u8; 320];

#[derive(Default)]
struct FakeTts {
    flushed: Arc<AtomicBool>,
    frame_delay_ms: u64,
    frames_per_call: usize,
    synthesized: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynth for FakeTts {
    async fn stream_audio(&self, text: &str) -> mpsc::Receiver<Bytes> {
        self.synthesized
            .lock()
            .expect("synthesized lock")
            .push(text.to_owned());
        let (tx, rx) = mpsc::channel(16);
        let frames = self.frames_per_call;
        let delay = self.frame_delay_ms;
        let flushed = Arc::clone(&self.flushed);
        tokio::spawn(async move {
            for _ in 0..frames {
                if flushed.load(Ordering::SeqCst) {
                    break;
                }
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if tx.send(Bytes::from_static(&SILENT_FRAME)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn flush(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }

    async fn warm(&self) {}
}

#[derive(Default)]
struct FakePlayer {
    started: AtomicU32,
    finished: AtomicU32,
    killed: AtomicU32,
    chunks: AtomicU32,
}

#[async_trait]
impl AudioOut for FakePlayer {
    async fn start(&self) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play_chunk(&self, _data: Bytes) -> Result<()> {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeTools {
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ToolBackend for FakeTools {
    fn build_tool_schemas(&self) -> Vec<Value> {
        vec![json!({"name": "hass_control", "input_schema": {"type": "object"}})]
    }

    async fn execute(&self, tool_name: &str, input: &Value) -> Result<Value> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((tool_name.to_owned(), input.clone()));
        Ok(json!({"success": true}))
    }
}

// ── Harness ────────────────────────────────────────────────────

struct Harness {
    pipeline: Arc<Pipeline>,
    audio_tx: mpsc::Sender<Bytes>,
    stt_tx: mpsc::UnboundedSender<SttEvent>,
    cancel: CancellationToken,
    probs: Arc<Mutex<VecDeque<f32>>>,
    stt: Arc<FakeStt>,
    llm: Arc<FakeLlm>,
    tts: Arc<FakeTts>,
    player: Arc<FakePlayer>,
    tools: Arc<FakeTools>,
}

fn harness(config: Config, stt: FakeStt, llm: FakeLlm, tts: FakeTts) -> Harness {
    let probs: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
    let scorer = ScriptedScorer {
        probs: Arc::clone(&probs),
    };
    let vad = VadProcessor::new(Box::new(scorer), &config.vad);

    let stt = Arc::new(stt);
    let llm = Arc::new(llm);
    let tts = Arc::new(tts);
    let player = Arc::new(FakePlayer::default());
    let tools = Arc::new(FakeTools::default());

    let pipeline = Pipeline::new(
        config,
        vad,
        ContextManager::new("test persona"),
        PipelineDeps {
            stt: stt.clone(),
            llm: llm.clone(),
            tts: tts.clone(),
            player: player.clone(),
            tools: Some(tools.clone()),
            memory: None,
            store: None,
        },
    );

    let (audio_tx, audio_rx) = mpsc::channel(64);
    let (stt_tx, stt_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pipeline.run(audio_rx, stt_rx, cancel).await;
        });
    }

    Harness {
        pipeline,
        audio_tx,
        stt_tx,
        cancel,
        probs,
        stt,
        llm,
        tts,
        player,
        tools,
    }
}

impl Harness {
    /// Queue `count` chunks tagged `tag` with the given speech probability.
    async fn send_chunks(&self, count: usize, tag: u8, prob: f32) {
        {
            let mut probs = self.probs.lock().expect("probs lock");
            for _ in 0..count {
                probs.push_back(prob);
            }
        }
        for _ in 0..count {
            self.audio_tx
                .send(Bytes::from(vec![tag; 1024]))
                .await
                .expect("audio channel open");
        }
    }

    async fn wait_for_state(&self, state: State) {
        wait_until(|| self.pipeline.state() == state, &format!("state {state}")).await;
    }
}

async fn wait_until(condition: impl Fn() -> bool, what: &str) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn text_reply(deltas: Vec<&'static str>, full: &str) -> LlmScript {
    LlmScript {
        deltas,
        content: vec![ContentBlock::text_block(full)],
        delta_delay_ms: 0,
    }
}

// ── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn quiet_start_stays_idle() {
    let h = harness(
        Config::default(),
        FakeStt::default(),
        FakeLlm::new(Vec::new()),
        FakeTts::default(),
    );

    h.send_chunks(20, 0, 0.1).await;
    wait_until(|| h.probs.lock().expect("probs").is_empty(), "chunks drained").await;

    assert_eq!(h.pipeline.state(), State::Idle);
    assert_eq!(h.stt.connect_calls.load(Ordering::SeqCst), 0);
    assert!(h.pipeline.conversation_messages().is_empty());
    h.cancel.cancel();
}

#[tokio::test]
async fn happy_turn_reaches_active_with_full_context() {
    let llm = FakeLlm::new(vec![text_reply(
        vec!["I'm fine. ", "Thanks."],
        "I'm fine. Thanks.",
    )]);
    let tts = FakeTts {
        frames_per_call: 2,
        ..FakeTts::default()
    };
    let h = harness(Config::default(), FakeStt::default(), llm, tts);

    // Silence, then sustained speech (hysteresis threshold is 3).
    h.send_chunks(3, 1, 0.1).await;
    h.send_chunks(5, 2, 0.9).await;
    h.wait_for_state(State::Listening).await;
    assert_eq!(h.stt.connect_calls.load(Ordering::SeqCst), 1);
    // Pre-buffered audio reached STT ahead of the live stream: six ring
    // chunks, the triggering chunk again live, then the two tail chunks.
    wait_until(
        || h.stt.sent.lock().expect("sent").len() == 9,
        "all chunks forwarded",
    )
    .await;

    h.stt_tx
        .send(SttEvent::Transcript {
            text: "Hello, how are you?".into(),
            is_final: true,
        })
        .expect("stt channel");
    h.stt_tx.send(SttEvent::UtteranceEnd).expect("stt channel");

    h.wait_for_state(State::Active).await;

    let messages = h.pipeline.conversation_messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(content_to_text(&messages[0].content), "Hello, how are you?");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(content_to_text(&messages[1].content), "I'm fine. Thanks.");

    assert_eq!(
        h.tts.synthesized.lock().expect("synthesized").clone(),
        vec!["I'm fine.", "Thanks."]
    );
    assert_eq!(h.player.started.load(Ordering::SeqCst), 1);
    assert_eq!(h.player.finished.load(Ordering::SeqCst), 1);
    assert_eq!(h.player.chunks.load(Ordering::SeqCst), 4);
    assert_eq!(h.pipeline.diagnostics()["active_timeout"], json!(true));
    h.cancel.cancel();
}

#[tokio::test]
async fn barge_in_cancels_reply_and_reconnects_stt() {
    let mut config = Config::default();
    config.server.barge_in_grace_ms = 0;

    // A long, slow reply so the barge-in lands mid-stream.
    let llm = FakeLlm::new(vec![LlmScript {
        deltas: vec!["Well. "; 200],
        content: vec![ContentBlock::text_block("unused")],
        delta_delay_ms: 10,
    }]);
    let tts = FakeTts {
        frames_per_call: 4,
        frame_delay_ms: 5,
        ..FakeTts::default()
    };
    let h = harness(config, FakeStt::default(), llm, tts);

    h.send_chunks(3, 1, 0.9).await;
    h.wait_for_state(State::Listening).await;
    h.stt_tx
        .send(SttEvent::Transcript {
            text: "tell me a story".into(),
            is_final: true,
        })
        .expect("stt channel");
    h.stt_tx.send(SttEvent::UtteranceEnd).expect("stt channel");
    h.wait_for_state(State::Speaking).await;

    let sent_before = h.stt.sent.lock().expect("sent").len();

    // Sustained speech over the reply: 3 chunks of hysteresis warm-up, then
    // 6 confirmed frames trigger the interrupt.
    h.send_chunks(8, 9, 0.9).await;
    h.wait_for_state(State::Listening).await;

    assert!(h.llm.cancelled.load(Ordering::SeqCst));
    assert!(h.tts.flushed.load(Ordering::SeqCst));
    assert!(h.player.killed.load(Ordering::SeqCst) >= 1);
    assert_eq!(h.stt.connect_calls.load(Ordering::SeqCst), 2);

    // The pre-buffer (speech that triggered the barge-in) was re-forwarded.
    {
        let sent = h.stt.sent.lock().expect("sent");
        let reconnected = &sent[sent_before..];
        assert!(reconnected.len() >= 6, "prebuffer forwarded after reconnect");
        assert!(reconnected.iter().all(|c| c[0] == 9));
    }

    // The partial assistant response is never appended.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let messages = h.pipeline.conversation_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    h.cancel.cancel();
}

#[tokio::test]
async fn tool_loop_executes_and_finishes_active() {
    let first = LlmScript {
        deltas: vec!["Turning it on."],
        content: vec![
            ContentBlock::text_block("Turning it on."),
            ContentBlock::tool_use(
                "toolu_1",
                "hass_control",
                json!({"entity_id": "light.living_room", "action": "turn_on"}),
            ),
        ],
        delta_delay_ms: 0,
    };
    let second = text_reply(vec!["Done."], "Done.");
    let llm = FakeLlm::new(vec![first, second]);
    let tts = FakeTts {
        frames_per_call: 1,
        ..FakeTts::default()
    };
    let h = harness(Config::default(), FakeStt::default(), llm, tts);

    h.send_chunks(3, 1, 0.9).await;
    h.wait_for_state(State::Listening).await;
    h.stt_tx
        .send(SttEvent::Transcript {
            text: "turn on the living room light".into(),
            is_final: true,
        })
        .expect("stt channel");
    h.stt_tx.send(SttEvent::UtteranceEnd).expect("stt channel");

    h.wait_for_state(State::Active).await;

    {
        let calls = h.tools.calls.lock().expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "hass_control");
        assert_eq!(calls[0].1["entity_id"], "light.living_room");
        assert_eq!(calls[0].1["action"], "turn_on");
    }

    let messages = h.pipeline.conversation_messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, Role::User);
    // Assistant message keeps its tool_use block for round-tripping.
    assert_eq!(messages[1].role, Role::Assistant);
    let aura::context::Content::Blocks(blocks) = &messages[1].content else {
        panic!("assistant message should be structured");
    };
    assert!(blocks.iter().any(|b| b.as_tool_use().is_some()));
    // One user message carries all tool results.
    assert_eq!(messages[2].role, Role::User);
    assert!(messages[2].content.has_tool_result());
    assert_eq!(content_to_text(&messages[3].content), "Done.");
    h.cancel.cancel();
}

#[tokio::test]
async fn stt_connect_failure_falls_back_to_idle() {
    let stt = FakeStt {
        fail_connect: true,
        ..FakeStt::default()
    };
    let h = harness(
        Config::default(),
        stt,
        FakeLlm::new(Vec::new()),
        FakeTts::default(),
    );

    h.send_chunks(3, 1, 0.9).await;
    wait_until(
        || h.stt.connect_calls.load(Ordering::SeqCst) == 1,
        "connect attempted",
    )
    .await;
    h.wait_for_state(State::Idle).await;

    assert!(h.stt.sent.lock().expect("sent").is_empty());
    assert!(h.pipeline.conversation_messages().is_empty());
    h.cancel.cancel();
}

#[tokio::test]
async fn utterance_end_with_empty_transcript_is_ignored() {
    let h = harness(
        Config::default(),
        FakeStt::default(),
        FakeLlm::new(Vec::new()),
        FakeTts::default(),
    );

    h.send_chunks(3, 1, 0.9).await;
    h.wait_for_state(State::Listening).await;
    h.stt_tx.send(SttEvent::UtteranceEnd).expect("stt channel");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.pipeline.state(), State::Listening);
    assert!(h.pipeline.conversation_messages().is_empty());
    h.cancel.cancel();
}
