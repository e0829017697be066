//! End-to-end session scenarios over a real WebSocket: a conversational
//! turn, a tool-call round trip, barge-in, and scheduler push delivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use voxbridge::agent::AgentBinding;
use voxbridge::audio::transcode::PcmPassthrough;
use voxbridge::cache::MemoryCache;
use voxbridge::config::Config;
use voxbridge::providers::llm::LlmChunk;
use voxbridge::providers::testing::{
    FunctionCallIntent, NoopMemory, NoopVoiceprint, ScriptedAsr, ScriptedLlm,
};
use voxbridge::providers::tts::{TtsProvider, TtsStream};
use voxbridge::providers::vad::EnergyVad;
use voxbridge::providers::ProviderError;
use voxbridge::scheduler::store::{InMemoryReminderStore, ReminderStore};
use voxbridge::scheduler::ReminderScheduler;
use voxbridge::server::ota::InMemoryDeviceRepository;
use voxbridge::server::registry::SessionRegistry;
use voxbridge::server::{build_router, ServerState};
use voxbridge::session::report::NullReportSink;
use voxbridge::session::{
    AdapterFactory, GatewayContext, SessionAdapters, StaticBindingSource,
};

const MAC: &str = "AA:BB:CC:DD:EE:FF";
const FRAME_SAMPLES: usize = 960; // 60 ms at 16 kHz

/// TTS emitting a fixed number of small frames per sentence.
struct CountedTts {
    frames: usize,
}

#[async_trait]
impl TtsProvider for CountedTts {
    async fn synthesize(&self, _text: &str) -> Result<TtsStream, ProviderError> {
        let frames: Vec<Result<Vec<u8>, ProviderError>> =
            (0..self.frames).map(|_| Ok(vec![0u8; 8])).collect();
        Ok(Box::pin(futures::stream::iter(frames)))
    }
}

/// Factory handing each session scripted providers.
struct TestFactory {
    transcripts: Vec<String>,
    llm_turns: Mutex<Vec<Vec<LlmChunk>>>,
    tts_frames: usize,
}

impl AdapterFactory for TestFactory {
    fn build(&self, _binding: &AgentBinding) -> Result<SessionAdapters, ProviderError> {
        let turns = self.llm_turns.lock().unwrap().clone();
        Ok(SessionAdapters {
            vad: tokio::sync::Mutex::new(Box::new(
                EnergyVad::new(Box::new(PcmPassthrough)).with_hangover_ms(120),
            )),
            asr: tokio::sync::Mutex::new(Box::new(ScriptedAsr::new(self.transcripts.clone()))),
            llm: Arc::new(ScriptedLlm::new(turns)),
            tts: Arc::new(CountedTts {
                frames: self.tts_frames,
            }),
            memory: Arc::new(NoopMemory),
            intent: Arc::new(FunctionCallIntent),
            voiceprint: Arc::new(NoopVoiceprint),
        })
    }
}

struct TestServer {
    url: String,
    store: Arc<InMemoryReminderStore>,
    scheduler: Arc<ReminderScheduler>,
    registry: Arc<SessionRegistry>,
}

async fn start_server(factory: TestFactory) -> TestServer {
    let config = Arc::new(Config::default());
    let cache = Arc::new(MemoryCache::new());
    let registry = SessionRegistry::new();
    let store = Arc::new(InMemoryReminderStore::new());
    let scheduler = ReminderScheduler::new(store.clone(), registry.clone(), None);
    tokio::spawn(scheduler.clone().run());

    let ctx = GatewayContext {
        config: config.clone(),
        cache,
        registry: registry.clone(),
        scheduler: scheduler.clone(),
        bindings: Arc::new(StaticBindingSource {
            config: config.clone(),
        }),
        adapters: Arc::new(factory),
        report_sink: Arc::new(NullReportSink),
    };
    let state = ServerState {
        ctx,
        devices: Arc::new(InMemoryDeviceRepository::new()),
        broker: None,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestServer {
        url: format!("ws://{addr}/ws?device-id={}", MAC.replace(':', "%3A")),
        store,
        scheduler,
        registry,
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(server: &TestServer) -> WsClient {
    let (socket, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();
    socket
}

fn loud_frame() -> Vec<u8> {
    (0..FRAME_SAMPLES)
        .flat_map(|i| {
            let sample: i16 = if i % 2 == 0 { 8000 } else { -8000 };
            sample.to_le_bytes()
        })
        .collect()
}

fn quiet_frame() -> Vec<u8> {
    vec![0u8; FRAME_SAMPLES * 2]
}

/// Send one spoken utterance: voiced frames then enough silence to end it.
async fn send_utterance(socket: &mut WsClient) {
    for _ in 0..10 {
        socket
            .send(WsMessage::Binary(loud_frame().into()))
            .await
            .unwrap();
    }
    for _ in 0..12 {
        socket
            .send(WsMessage::Binary(quiet_frame().into()))
            .await
            .unwrap();
    }
}

/// Collect messages until the deadline, classifying text envelopes.
async fn collect_messages(socket: &mut WsClient, window: Duration) -> (Vec<Value>, usize) {
    let mut envelopes = Vec::new();
    let mut binary_count = 0;
    let deadline = tokio::time::Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                envelopes.push(serde_json::from_str(&text).unwrap());
            }
            Ok(Some(Ok(WsMessage::Binary(_)))) => binary_count += 1,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => break,
        }
    }
    (envelopes, binary_count)
}

fn types_of(envelopes: &[Value]) -> Vec<String> {
    envelopes
        .iter()
        .filter_map(|e| e["type"].as_str().map(str::to_string))
        .collect()
}

fn tts_states(envelopes: &[Value]) -> Vec<String> {
    envelopes
        .iter()
        .filter(|e| e["type"] == "tts")
        .filter_map(|e| e["state"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn happy_conversational_turn() {
    let server = start_server(TestFactory {
        transcripts: vec!["Hello".to_string()],
        llm_turns: Mutex::new(vec![ScriptedLlm::text_turn("Hi there!")]),
        tts_frames: 3,
    })
    .await;
    let mut socket = connect(&server).await;

    socket
        .send(WsMessage::Text(r#"{"type":"hello","features":{"mcp":false}}"#.into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    send_utterance(&mut socket).await;
    let (envelopes, binary_count) = collect_messages(&mut socket, Duration::from_secs(3)).await;

    let types = types_of(&envelopes);
    assert!(types.contains(&"hello".to_string()), "welcome missing: {types:?}");

    let stt = envelopes.iter().find(|e| e["type"] == "stt").expect("stt envelope");
    assert_eq!(stt["text"], "Hello");

    let states = tts_states(&envelopes);
    assert_eq!(
        states,
        vec!["start", "sentence_start", "sentence_end", "stop"],
        "unexpected tts sequence"
    );
    let sentence = envelopes
        .iter()
        .find(|e| e["type"] == "tts" && e["state"] == "sentence_start")
        .unwrap();
    assert_eq!(sentence["text"], "Hi there!");
    assert!(binary_count >= 1, "no audio frames reached the device");

    // stt strictly precedes tts start.
    let stt_pos = types.iter().position(|t| t == "stt").unwrap();
    let tts_pos = envelopes
        .iter()
        .position(|e| e["type"] == "tts" && e["state"] == "start")
        .unwrap();
    assert!(stt_pos < tts_pos);
}

#[tokio::test]
async fn tool_call_round_trip_creates_reminder() {
    let remind_at = (chrono::Utc::now() + chrono::Duration::minutes(5)).to_rfc3339();
    let arguments = format!(r#"{{"remind_at":"{remind_at}","content":"drink water"}}"#);

    let server = start_server(TestFactory {
        transcripts: vec!["Remind me to drink water in 5 minutes".to_string()],
        llm_turns: Mutex::new(vec![
            ScriptedLlm::tool_call_turn("call_1", "create_reminder", &arguments),
            ScriptedLlm::text_turn("Okay, I'll remind you in 5 minutes."),
        ]),
        tts_frames: 2,
    })
    .await;
    let mut socket = connect(&server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    send_utterance(&mut socket).await;
    let (envelopes, _) = collect_messages(&mut socket, Duration::from_secs(3)).await;

    // The confirmation from the second LLM round is spoken.
    let sentences: Vec<&str> = envelopes
        .iter()
        .filter(|e| e["type"] == "tts" && e["state"] == "sentence_start")
        .filter_map(|e| e["text"].as_str())
        .collect();
    assert!(
        sentences.iter().any(|s| s.contains("remind you in 5 minutes")),
        "confirmation not spoken: {sentences:?}"
    );

    // The reminder landed in the store, pending and scheduled.
    let pending = server.store.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content, "drink water");
    assert_eq!(pending[0].mac_address, MAC);
}

#[tokio::test]
async fn barge_in_stops_audio_without_tts_stop() {
    let server = start_server(TestFactory {
        transcripts: vec!["Hello".to_string()],
        llm_turns: Mutex::new(vec![ScriptedLlm::text_turn("Hi there!")]),
        tts_frames: 60, // ~3.6 s of paced audio
    })
    .await;
    let mut socket = connect(&server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    send_utterance(&mut socket).await;

    // Wait for the first audio frame, then barge in.
    let mut saw_binary = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), socket.next()).await {
            Ok(Some(Ok(WsMessage::Binary(_)))) => {
                saw_binary = true;
                break;
            }
            Ok(Some(Ok(_))) => {}
            _ => break,
        }
    }
    assert!(saw_binary, "tts audio never started");

    socket
        .send(WsMessage::Text(r#"{"type":"abort"}"#.into()))
        .await
        .unwrap();

    // After the abort propagates, no tts stop arrives and audio ceases.
    let (envelopes, _) = collect_messages(&mut socket, Duration::from_millis(1200)).await;
    let states = tts_states(&envelopes);
    assert!(
        !states.contains(&"stop".to_string()),
        "abort must pre-empt tts stop: {states:?}"
    );
}

#[tokio::test]
async fn scheduler_delivers_notification_to_live_session() {
    let server = start_server(TestFactory {
        transcripts: vec![],
        llm_turns: Mutex::new(vec![]),
        tts_frames: 1,
    })
    .await;
    let mut socket = connect(&server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reminder = server
        .store
        .create(voxbridge::scheduler::store::NewReminder {
            agent_id: "agent-1".to_string(),
            device_id: None,
            mac_address: MAC.to_string(),
            content: "Water time".to_string(),
            title: Some("Drink".to_string()),
            remind_at: chrono::Utc::now() + chrono::Duration::milliseconds(50),
            remind_at_local: (chrono::Utc::now() + chrono::Duration::milliseconds(50))
                .with_timezone(&chrono::FixedOffset::east_opt(0).unwrap()),
            metadata: Some(serde_json::json!({"useLLM": false})),
        })
        .await
        .unwrap();
    server
        .scheduler
        .schedule(&reminder.public_id, reminder.remind_at)
        .await;

    let (envelopes, _) = collect_messages(&mut socket, Duration::from_millis(600)).await;
    let notification = envelopes
        .iter()
        .find(|e| e["type"] == "notification")
        .expect("notification envelope");
    assert_eq!(notification["title"], "Drink");
    assert_eq!(notification["content"], "Water time");
    assert_eq!(notification["useLLM"], false);

    // Live delivery marks the reminder delivered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = server.store.get(reminder.id).await.unwrap();
    assert_eq!(
        stored.status,
        voxbridge::scheduler::store::ReminderStatus::Delivered
    );
}

#[tokio::test]
async fn hot_reload_keeps_the_session_alive() {
    let server = start_server(TestFactory {
        transcripts: vec!["Hello".to_string()],
        llm_turns: Mutex::new(vec![ScriptedLlm::text_turn("Hi there!")]),
        tts_frames: 2,
    })
    .await;
    let mut socket = connect(&server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Rebind mid-session; the factory hands out fresh scripted adapters.
    let handle = server.registry.lookup(MAC).await.expect("session registered");
    let binding = Arc::new(AgentBinding::default_with_agent("reloaded-agent"));
    handle
        .commands
        .send(voxbridge::session::SessionCommand::Reload(binding))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The socket survived and a full turn still works.
    send_utterance(&mut socket).await;
    let (envelopes, _) = collect_messages(&mut socket, Duration::from_secs(3)).await;
    let stt = envelopes.iter().find(|e| e["type"] == "stt").expect("stt after reload");
    assert_eq!(stt["text"], "Hello");
    assert!(tts_states(&envelopes).contains(&"start".to_string()));
}

#[tokio::test]
async fn websocket_without_device_id_is_rejected() {
    let server = start_server(TestFactory {
        transcripts: vec![],
        llm_turns: Mutex::new(vec![]),
        tts_frames: 1,
    })
    .await;
    let url = server.url.split('?').next().unwrap().to_string();
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}
