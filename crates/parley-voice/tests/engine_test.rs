use async_trait::async_trait;
use futures_util::StreamExt;
use parley_cache::{CacheConfig, CacheError, RemoteStore, TwoTierCache};
use parley_resilience::{
    CircuitBreakerConfig, CircuitBreakerManager, CircuitState, ErrorKind, RetryPolicy,
};
use parley_types::{AudioChunk, AudioFormat, AudioFrame, ChatMessage, TranscriptResult, Vad};
use parley_voice::{
    reply_cache_key, ChunkSource, Completion, ConversationEngine, EngineError, EngineSettings,
    LanguageModel, PlaceholderStt, SilenceTts, SpeechToText, StreamChunk, TextToSpeech,
    VoiceError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the scripted model does on each call, consumed front to back. Once
/// the script runs out it keeps answering "Hello from the model".
#[derive(Clone)]
enum Step {
    Reply(&'static str),
    Fail(&'static str),
    Hang,
}

#[derive(Default)]
struct ScriptedLlm {
    script: Mutex<Vec<Step>>,
    calls: AtomicU32,
}

impl ScriptedLlm {
    fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Step::Reply("Hello from the model")
        } else {
            script.remove(0)
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model_name(&self) -> String {
        "scripted-1".to_string()
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<Completion, VoiceError> {
        match self.next_step() {
            Step::Reply(text) => Ok(Completion {
                content: text.to_string(),
                model: self.model_name(),
            }),
            Step::Fail(message) => Err(VoiceError::Llm(message.to_string())),
            Step::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<Completion, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for part in ["Hel", "lo"] {
            let _ = sink
                .send(StreamChunk {
                    text: part.to_string(),
                    source: ChunkSource::Cloud,
                })
                .await;
        }
        Ok(Completion {
            content: "Hello".to_string(),
            model: self.model_name(),
        })
    }
}

struct CountingTts {
    inner: SilenceTts,
    calls: AtomicU32,
    fail: bool,
}

impl CountingTts {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: SilenceTts::new(8),
            calls: AtomicU32::new(0),
            fail,
        })
    }
}

#[async_trait]
impl TextToSpeech for CountingTts {
    fn name(&self) -> &str {
        "counting"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<AudioChunk>, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(VoiceError::Tts("Piper failed: model crashed".to_string()));
        }
        self.inner.synthesize(text).await
    }
}

/// A shared store that is either down or answers from a plain map.
#[derive(Default)]
struct FlakyRemote {
    down: AtomicBool,
    entries: Mutex<std::collections::HashMap<String, String>>,
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    fn name(&self) -> &str {
        "flaky"
    }

    fn is_available(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("connection refused".into()));
        }
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("connection refused".into()));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("connection refused".into()));
        }
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_matching(&self, _pattern: &str) -> Result<u64, CacheError> {
        Ok(0)
    }
}

struct Harness {
    engine: ConversationEngine,
    llm: Arc<ScriptedLlm>,
    cache: Arc<TwoTierCache>,
    breakers: Arc<CircuitBreakerManager>,
}

fn harness_with(llm: Arc<ScriptedLlm>, tts: Arc<dyn TextToSpeech>, cache: TwoTierCache) -> Harness {
    let cache = Arc::new(cache);
    let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default()));
    let engine = ConversationEngine::new(
        Arc::new(PlaceholderStt::new()),
        llm.clone(),
        tts,
        cache.clone(),
        breakers.clone(),
    )
    .with_settings(EngineSettings {
        call_timeout: Duration::from_millis(500),
        response_ttl: Duration::from_secs(3600),
        retry: RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
        },
    });
    Harness {
        engine,
        llm,
        cache,
        breakers,
    }
}

fn harness(script: Vec<Step>) -> Harness {
    harness_with(
        ScriptedLlm::new(script),
        Arc::new(SilenceTts::new(8)),
        TwoTierCache::new(CacheConfig::default()),
    )
}

fn speech_frame(seq: u64) -> AudioFrame {
    AudioFrame {
        seq,
        timestamp: 1_700_000_000_000,
        format: AudioFormat::default(),
        vad: Vad::Speech,
        rms: 0.3,
        data: None,
    }
}

#[tokio::test]
async fn repeated_message_hits_cache() {
    let h = harness(vec![]);

    let first = h.engine.generate_ai_response("hello", None).await.unwrap();
    let second = h.engine.generate_ai_response("hello", None).await.unwrap();

    assert_eq!(h.llm.calls(), 1);
    assert_eq!(first.response, second.response);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.model, "scripted-1");
    assert_eq!(second.persona, "Parley");
}

#[tokio::test]
async fn context_changes_cache_key() {
    let h = harness(vec![]);
    h.engine.generate_ai_response("hello", None).await.unwrap();
    h.engine
        .generate_ai_response("hello", Some("user is in Lisbon"))
        .await
        .unwrap();
    assert_eq!(h.llm.calls(), 2);
}

#[tokio::test]
async fn corrupt_cache_entry_is_replaced() {
    let h = harness(vec![]);
    let key = reply_cache_key("hello", None);
    h.cache.set(&key, "{not json").await;

    let reply = h.engine.generate_ai_response("hello", None).await.unwrap();
    assert!(!reply.cached);
    assert_eq!(h.llm.calls(), 1);

    let stored = h.cache.get(&key).await.expect("fresh reply cached");
    assert!(stored.contains("Hello from the model"));
}

#[tokio::test]
async fn unreachable_remote_cache_still_serves_replies() {
    let remote = Arc::new(FlakyRemote::default());
    remote.down.store(true, Ordering::SeqCst);
    let h = harness_with(
        ScriptedLlm::new(vec![]),
        Arc::new(SilenceTts::new(8)),
        TwoTierCache::with_remote(CacheConfig::default(), remote.clone()),
    );

    let first = h.engine.generate_ai_response("hello", None).await.unwrap();
    assert_eq!(first.response, "Hello from the model");

    // Served from the local tier the second time.
    let second = h.engine.generate_ai_response("hello", None).await.unwrap();
    assert!(second.cached);
    assert_eq!(h.llm.calls(), 1);
    assert!(remote.entries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn non_retryable_failure_is_not_retried() {
    let h = harness_with(
        ScriptedLlm::new(vec![Step::Fail("401 unauthorized")]),
        Arc::new(SilenceTts::new(8)),
        TwoTierCache::new(CacheConfig::default()),
    );
    let mut engine_settings = EngineSettings::default();
    engine_settings.retry.max_retries = 3;
    let engine = h.engine.with_settings(engine_settings);

    let err = engine.generate_ai_response("hello", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_is_retried() {
    let h = harness(vec![Step::Fail("connection reset by peer")]);
    let mut settings = EngineSettings::default();
    settings.retry.max_retries = 2;
    let engine = h.engine.with_settings(settings);

    let reply = engine.generate_ai_response("hello", None).await.unwrap();
    assert_eq!(reply.response, "Hello from the model");
    assert_eq!(h.llm.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_model_times_out() {
    let h = harness(vec![Step::Hang]);
    let err = h.engine.generate_ai_response("hello", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout { stage: "llm", .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn repeated_failures_open_the_llm_circuit() {
    let failures = vec![Step::Fail("upstream exploded"); 5];
    let h = harness(failures);

    for i in 0..5 {
        let err = h
            .engine
            .generate_ai_response(&format!("message {i}"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
    assert_eq!(h.breakers.breaker("llm").state(), CircuitState::Open);

    let err = h
        .engine
        .generate_ai_response("one more", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { .. }));
    assert!(err.retry_after().is_some());
    assert_eq!(h.llm.calls(), 5);
}

#[tokio::test]
async fn empty_reply_is_an_error_and_not_cached() {
    let h = harness(vec![Step::Reply("   ")]);
    let err = h.engine.generate_ai_response("hello", None).await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyReply));
    assert!(h.cache.get(&reply_cache_key("hello", None)).await.is_none());
}

#[tokio::test]
async fn empty_message_is_rejected_without_model_call() {
    let h = harness(vec![]);
    let err = h.engine.generate_ai_response("  ", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserInput);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn streaming_reply_reaches_sink() {
    let h = harness(vec![]);
    let (tx, mut rx) = mpsc::channel(8);
    h.engine
        .generate_streaming_ai_response("hello", Some("ctx"), tx)
        .await
        .unwrap();

    let mut parts = Vec::new();
    while let Some(chunk) = rx.recv().await {
        parts.push(chunk.text);
    }
    assert_eq!(parts, vec!["Hel", "lo"]);
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test]
async fn speak_text_is_lazy_and_ends_with_last_chunk() {
    let tts = CountingTts::new(false);
    let h = harness_with(
        ScriptedLlm::new(vec![]),
        tts.clone(),
        TwoTierCache::new(CacheConfig::default()),
    );

    let stream = h.engine.speak_text("one two three");
    assert_eq!(tts.calls.load(Ordering::SeqCst), 0);

    let chunks: Vec<AudioChunk> = stream
        .map(|c| c.expect("chunk should synthesize"))
        .collect()
        .await;
    assert_eq!(tts.calls.load(Ordering::SeqCst), 1);
    assert_eq!(chunks.len(), 3);
    assert!(chunks.last().unwrap().is_last);
    assert!(chunks[..2].iter().all(|c| !c.is_last));

    let latency = h.engine.metrics().get("tts_chunk_latency_ms").unwrap();
    assert_eq!(latency.count, 3);
}

#[tokio::test]
async fn speak_text_surfaces_synthesis_failure_once() {
    let tts = CountingTts::new(true);
    let h = harness_with(
        ScriptedLlm::new(vec![]),
        tts,
        TwoTierCache::new(CacheConfig::default()),
    );

    let results: Vec<_> = h.engine.speak_text("hello").collect().await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(EngineError::Voice(VoiceError::Tts(_)))));
}

#[tokio::test]
async fn audio_frames_produce_partials_and_finals() {
    let h = harness(vec![]);

    let partial = h
        .engine
        .process_audio_frame(&speech_frame(0))
        .await
        .unwrap()
        .expect("speech frame should produce a partial");
    assert!(!partial.is_final);

    let mut silence = speech_frame(1);
    silence.vad = Vad::Silence;
    assert!(h.engine.process_audio_frame(&silence).await.unwrap().is_none());

    let partials: Vec<TranscriptResult> = vec![partial.clone(), partial];
    let final_result = h
        .engine
        .process_final_transcription(&partials)
        .await
        .unwrap()
        .expect("final transcript");
    assert!(final_result.is_final);
    assert_eq!(final_result.text, "Hello world Hello world");

    let stats = h.engine.stats();
    assert_eq!(stats.latency["stt_partial_latency_ms"].count, 1);
    assert_eq!(stats.latency["stt_final_latency_ms"].count, 1);
    assert_eq!(stats.stt, "placeholder");
    assert_eq!(stats.model, "scripted-1");
    assert_eq!(stats.persona, "Parley");
}

#[tokio::test]
async fn custom_stt_errors_are_classified() {
    struct BrokenStt;

    #[async_trait]
    impl SpeechToText for BrokenStt {
        fn name(&self) -> &str {
            "broken"
        }

        async fn transcribe(
            &self,
            _frame: &AudioFrame,
        ) -> Result<Option<TranscriptResult>, VoiceError> {
            Err(VoiceError::Network("whisper server connection refused".into()))
        }
    }

    let engine = ConversationEngine::new(
        Arc::new(BrokenStt),
        ScriptedLlm::new(vec![]),
        Arc::new(SilenceTts::default()),
        Arc::new(TwoTierCache::new(CacheConfig::default())),
        Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default())),
    );
    let err = engine
        .process_audio_frame(&speech_frame(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}
