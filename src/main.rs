//! Binary entrypoint: bring the runtime up, run until ctrl-c, tear down in
//! reverse order.

use anyhow::Context as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aura::audio::{AudioPlayer, MicCapture};
use aura::community::CommunityDetector;
use aura::config::Config;
use aura::context::ContextManager;
use aura::embeddings::VoyageEmbedder;
use aura::hass::{HassRegistry, ToolBackend};
use aura::llm::{AnthropicChat, MessagesClient};
use aura::memory::MemoryExtractor;
use aura::persona::load_persona;
use aura::pipeline::{AUDIO_CHANNEL_SIZE, Pipeline, PipelineDeps};
use aura::reranker::VoyageReranker;
use aura::store::{GraphStore, init_pool};
use aura::stt::{DeepgramStt, SttEvent, SttLink};
use aura::tts::{ElevenLabsTts, SpeechSynth};
use aura::vad::{SileroVad, VadProcessor};

/// Playback rate from an ElevenLabs output-format tag like `pcm_24000`.
fn pcm_rate(output_format: &str) -> u32 {
    output_format
        .strip_prefix("pcm_")
        .and_then(|rate| rate.parse().ok())
        .unwrap_or(24_000)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("aura starting");

    // Memory subsystem is optional: without a reachable database the
    // assistant runs conversational-only.
    let (store, memory) = match init_pool(&config.database).await {
        Ok(pool) => {
            let store = GraphStore::new(pool);
            store.ensure_schema().await.context("applying schema")?;
            let embedder = VoyageEmbedder::new(config.embedding.clone());
            let reranker = VoyageReranker::new(config.embedding.clone());
            let extraction_llm = MessagesClient::new(
                &config.llm.anthropic_base_url,
                &config.llm.anthropic_api_key,
                &config.memory.memory_extraction_model,
                2000,
            );
            let summary_llm = MessagesClient::new(
                &config.llm.anthropic_base_url,
                &config.llm.anthropic_api_key,
                &config.memory.memory_extraction_model,
                300,
            );
            let detector = CommunityDetector::new(
                store.clone(),
                embedder.clone(),
                summary_llm,
                config.community.clone(),
            );
            let memory = Arc::new(MemoryExtractor::new(
                extraction_llm,
                store.clone(),
                embedder,
                Some(reranker),
                Some(detector),
                config.memory.clone(),
                &config.community,
                config.embedding.rerank_top_k,
            ));
            if let Err(e) = memory.seed_known_entities().await {
                warn!("known-entity seeding failed: {e}");
            }
            (Some(store), Some(memory))
        }
        Err(e) => {
            warn!("DB pool not available, running without memory: {e}");
            (None, None)
        }
    };

    let hass = Arc::new(HassRegistry::new(&config.hass));
    let _ = hass.discover().await;
    let tools: Option<Arc<dyn ToolBackend>> = Some(hass);

    let (stt_event_tx, stt_event_rx) = mpsc::unbounded_channel::<SttEvent>();
    let stt: Arc<dyn SttLink> = Arc::new(DeepgramStt::new(
        config.stt.clone(),
        config.audio.sample_rate,
        stt_event_tx,
    ));
    let llm = Arc::new(AnthropicChat::new(config.llm.clone()));
    let tts: Arc<dyn SpeechSynth> = Arc::new(ElevenLabsTts::new(config.tts.clone()));
    tts.warm().await;

    let player = Arc::new(
        AudioPlayer::new(pcm_rate(&config.tts.elevenlabs_output_format), 1, "s16le")
            .context("creating audio player")?,
    );

    let scorer = SileroVad::new(&config.vad.vad_model_path, config.audio.sample_rate)
        .context("loading VAD model")?;
    let vad = VadProcessor::new(Box::new(scorer), &config.vad);

    let mut ctx = ContextManager::new(load_persona(&config.llm.persona_path));
    if let Some(memory) = &memory {
        match memory.pre_load_context("general").await {
            Ok(rag) => ctx.update_rag_context(rag),
            Err(e) => warn!("RAG pre-load failed: {e}"),
        }
    }

    let pipeline = Pipeline::new(
        config.clone(),
        vad,
        ctx,
        PipelineDeps {
            stt,
            llm,
            tts,
            player,
            tools,
            memory,
            store,
        },
    );

    let cancel = CancellationToken::new();

    // Microphone capture: the cpal callback posts chunks from the driver's
    // audio thread; failure leaves the runtime headless but serving HTTP.
    let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_SIZE);
    let capture_cancel = cancel.clone();
    let capture_tx = audio_tx.clone();
    let capture_handle = match MicCapture::new(&config.audio) {
        Ok(capture) => Some(tokio::spawn(async move {
            if let Err(e) = capture.run(capture_tx, capture_cancel).await {
                warn!("capture stage error: {e}");
            }
        })),
        Err(e) => {
            warn!("audio init failed, running headless: {e}");
            None
        }
    };

    let server_pipeline = Arc::clone(&pipeline);
    let http_port = config.server.http_port;
    tokio::spawn(async move {
        if let Err(e) = aura::server::serve(server_pipeline, http_port).await {
            warn!("HTTP surface failed: {e}");
        }
    });

    let run_pipeline = Arc::clone(&pipeline);
    let run_cancel = cancel.clone();
    let run_handle = tokio::spawn(async move {
        run_pipeline.run(audio_rx, stt_event_rx, run_cancel).await;
    });

    info!(mic = ?config.audio.mic_device_index, "aura started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    cancel.cancel();
    if let Some(handle) = capture_handle {
        let _ = handle.await;
    }
    let _ = run_handle.await;
    pipeline.shutdown().await;
    info!("aura stopped");
    Ok(())
}
