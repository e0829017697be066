//! Per-connection session runtime.
//!
//! Each accepted WebSocket becomes an actor owning its provider adapters,
//! dialogue, and a set of cooperating tasks: the receive loop (this
//! module), a timeout monitor, the audio ingress worker, and the two TTS
//! workers. Tasks communicate over bounded channels and share a small set
//! of atomic flags; `client_abort` is the universal cancellation signal.

pub mod audio_in;
pub mod chat;
pub mod emotion;
pub mod report;
pub mod segment;
pub mod text;
pub mod tts_out;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::prompt::PromptManager;
use crate::agent::{AgentBinding, ChatHistoryLevel};
use crate::cache::{CacheKind, CacheStore};
use crate::config::Config;
use crate::dialogue::Dialogue;
use crate::protocol::frame::{self, TimestampSynthesizer};
use crate::protocol::{FrameKind, ServerEnvelope};
use crate::providers::{
    AsrProvider, IntentProvider, LlmProvider, MemoryProvider, ProviderError, TtsProvider,
    VadProvider, VoiceprintProvider,
};
use crate::scheduler::ReminderScheduler;
use crate::server::registry::{SessionHandle, SessionRegistry};
use crate::session::audio_in::AudioIn;
use crate::session::report::{ChatReporter, ReportKind, ReportSink};
use crate::session::tts_out::{SentenceOrdinal, TtsJob};
use crate::tools::device_iot::DeviceIotExecutor;
use crate::tools::device_mcp::{DeviceMcpClient, DeviceMcpExecutor};
use crate::tools::mcp_endpoint::{validate_endpoint_url, McpEndpointClient, McpEndpointExecutor};
use crate::tools::server_mcp::{ServerMcpExecutor, ServerMcpManager};
use crate::tools::server_plugins::{PluginContext, ServerPluginExecutor};
use crate::tools::{ToolBackend, ToolDispatcher, ToolManager};
use crate::types::{DeviceIdentity, Outbound, OutboundSender};

/// Audio chunks retained while the pipeline is still initializing.
pub const PRE_READY_AUDIO_BUFFER: usize = 10;
/// How often the timeout monitor wakes.
const TIMEOUT_CHECK_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(10);

/// Commands into a live session from the registry, webhook, or scheduler.
#[derive(Debug)]
pub enum SessionCommand {
    /// Speak this text through the normal TTS path (no LLM round).
    Speak(String),
    /// Hot-reload onto a new agent binding without dropping the socket.
    Reload(Arc<AgentBinding>),
    Close,
}

/// The provider adapters a session runs on. Swapped wholesale during
/// hot-reload.
pub struct SessionAdapters {
    pub vad: TokioMutex<Box<dyn VadProvider>>,
    pub asr: TokioMutex<Box<dyn AsrProvider>>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub memory: Arc<dyn MemoryProvider>,
    pub intent: Arc<dyn IntentProvider>,
    pub voiceprint: Arc<dyn VoiceprintProvider>,
}

/// Builds adapters for a binding. The default factory wires the built-in
/// implementations; tests inject scripted ones.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, binding: &AgentBinding) -> Result<SessionAdapters, ProviderError>;
}

pub struct DefaultAdapterFactory {
    pub config: Arc<Config>,
}

impl AdapterFactory for DefaultAdapterFactory {
    fn build(&self, _binding: &AgentBinding) -> Result<SessionAdapters, ProviderError> {
        use crate::audio::transcode::PcmPassthrough;
        use crate::providers::llm::OpenAiCompatLlm;
        use crate::providers::testing::{
            FunctionCallIntent, NoopMemory, NoopVoiceprint, ScriptedAsr, SilenceTts,
        };
        use crate::providers::vad::EnergyVad;

        let llm = OpenAiCompatLlm::new(
            self.config.llm.base_url.clone(),
            self.config.llm.api_key.clone(),
            self.config.llm.model.clone(),
        )
        .with_max_tokens(self.config.llm.max_tokens);

        Ok(SessionAdapters {
            vad: TokioMutex::new(Box::new(EnergyVad::new(Box::new(PcmPassthrough)))),
            asr: TokioMutex::new(Box::new(ScriptedAsr::new(Vec::<String>::new()))),
            llm: Arc::new(llm),
            tts: Arc::new(SilenceTts),
            memory: Arc::new(NoopMemory),
            intent: Arc::new(FunctionCallIntent),
            voiceprint: Arc::new(NoopVoiceprint),
        })
    }
}

/// Resolves the binding for a device: repository record first, static
/// configuration as fallback. The runtime cannot tell which was used.
#[async_trait::async_trait]
pub trait BindingSource: Send + Sync {
    async fn resolve(&self, identity: &DeviceIdentity) -> Arc<AgentBinding>;
}

/// Binding built from the static `[agent]` config section.
pub struct StaticBindingSource {
    pub config: Arc<Config>,
}

#[async_trait::async_trait]
impl BindingSource for StaticBindingSource {
    async fn resolve(&self, identity: &DeviceIdentity) -> Arc<AgentBinding> {
        let agent = &self.config.agent;
        let mut binding = AgentBinding::default_with_agent(format!("static-{}", identity.mac));
        binding.prompt_template = agent.prompt.clone();
        binding.chat_history = ChatHistoryLevel::try_from(agent.chat_history_conf)
            .unwrap_or(ChatHistoryLevel::Off);
        binding.mcp_servers = agent.mcp_servers.clone();
        if !agent.mcp_endpoint.is_empty() {
            binding.mcp_endpoint_url = Some(agent.mcp_endpoint.clone());
        }
        match binding.with_tool_refs(&agent.tools) {
            Ok(binding) => Arc::new(binding),
            Err(e) => {
                warn!(error = %e, "invalid tool refs in static config, ignoring them");
                Arc::new(AgentBinding::default_with_agent(format!(
                    "static-{}",
                    identity.mac
                )))
            }
        }
    }
}

/// Shared process context threaded into every session. Explicit lifecycle,
/// no singletons.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<Config>,
    pub cache: Arc<dyn CacheStore>,
    pub registry: Arc<SessionRegistry>,
    pub scheduler: Arc<ReminderScheduler>,
    pub bindings: Arc<dyn BindingSource>,
    pub adapters: Arc<dyn AdapterFactory>,
    pub report_sink: Arc<dyn ReportSink>,
}

/// The tool side of a session: registry, dispatcher, and the executors
/// that hold live transports.
pub struct ToolRuntime {
    pub manager: Arc<ToolManager>,
    pub dispatcher: ToolDispatcher,
    pub device_mcp: Arc<DeviceMcpClient>,
    pub device_iot: Arc<DeviceIotExecutor>,
    pub server_mcp: Arc<ServerMcpManager>,
    pub mcp_endpoint: Option<Arc<McpEndpointClient>>,
}

struct SessionFlags {
    client_abort: AtomicBool,
    is_speaking: AtomicBool,
    stopping: AtomicBool,
    closing: AtomicBool,
    reloading: AtomicBool,
    llm_busy: AtomicBool,
    mcp_enabled: AtomicBool,
    manual_listen: AtomicBool,
    manual_listening: AtomicBool,
    frame_duration_ms: AtomicU32,
    last_activity_ms: AtomicU64,
}

pub struct Session {
    pub session_id: String,
    pub identity: DeviceIdentity,
    pub ctx: GatewayContext,
    pub outbound: OutboundSender,
    pub dialogue: Arc<TokioMutex<Dialogue>>,
    flags: SessionFlags,
    adapters: TokioRwLock<Option<Arc<SessionAdapters>>>,
    tools: TokioRwLock<Option<Arc<ToolRuntime>>>,
    binding: TokioRwLock<Option<Arc<AgentBinding>>>,
    tts_jobs: StdMutex<Option<mpsc::Sender<TtsJob>>>,
    sentence_id: StdMutex<Option<String>>,
    reporter: StdMutex<Option<ChatReporter>>,
    commands: mpsc::Sender<SessionCommand>,
    ready_tx: watch::Sender<bool>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Session {
    fn new(
        ctx: GatewayContext,
        identity: DeviceIdentity,
        outbound: OutboundSender,
        tts_jobs: mpsc::Sender<TtsJob>,
        commands: mpsc::Sender<SessionCommand>,
    ) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        let frame_duration = ctx.config.session.frame_duration_ms;
        Arc::new(Self {
            session_id: Uuid::new_v4().to_string(),
            identity,
            ctx,
            outbound,
            dialogue: Arc::new(TokioMutex::new(Dialogue::new())),
            flags: SessionFlags {
                client_abort: AtomicBool::new(false),
                is_speaking: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                reloading: AtomicBool::new(false),
                llm_busy: AtomicBool::new(false),
                mcp_enabled: AtomicBool::new(false),
                manual_listen: AtomicBool::new(false),
                manual_listening: AtomicBool::new(false),
                frame_duration_ms: AtomicU32::new(frame_duration),
                last_activity_ms: AtomicU64::new(now_ms()),
            },
            adapters: TokioRwLock::new(None),
            tools: TokioRwLock::new(None),
            binding: TokioRwLock::new(None),
            tts_jobs: StdMutex::new(Some(tts_jobs)),
            sentence_id: StdMutex::new(None),
            reporter: StdMutex::new(None),
            commands,
            ready_tx,
        })
    }

    // ── flag accessors ───────────────────────────────────────

    pub fn touch_activity(&self) {
        self.flags.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.flags.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.stopping.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.flags.client_abort.load(Ordering::SeqCst)
    }

    pub fn clear_abort(&self) {
        self.flags.client_abort.store(false, Ordering::SeqCst);
    }

    /// Barge-in: stop speaking now, drop queued audio at the next
    /// checkpoint.
    pub fn abort_playback(&self) {
        self.flags.client_abort.store(true, Ordering::SeqCst);
        self.flags.is_speaking.store(false, Ordering::SeqCst);
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.flags.is_speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.flags.is_speaking.load(Ordering::SeqCst)
    }

    pub fn set_llm_busy(&self, busy: bool) {
        self.flags.llm_busy.store(busy, Ordering::SeqCst);
    }

    pub fn is_llm_busy(&self) -> bool {
        self.flags.llm_busy.load(Ordering::SeqCst)
    }

    pub fn set_mcp_enabled(&self, enabled: bool) {
        self.flags.mcp_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn mcp_enabled(&self) -> bool {
        self.flags.mcp_enabled.load(Ordering::SeqCst)
    }

    pub fn set_manual_listen(&self, manual: bool) {
        self.flags.manual_listen.store(manual, Ordering::SeqCst);
    }

    pub fn is_manual_listen(&self) -> bool {
        self.flags.manual_listen.load(Ordering::SeqCst)
    }

    pub fn set_manual_listening(&self, listening: bool) {
        self.flags.manual_listening.store(listening, Ordering::SeqCst);
    }

    pub fn is_manual_listening(&self) -> bool {
        self.flags.manual_listening.load(Ordering::SeqCst)
    }

    pub fn set_frame_duration_ms(&self, ms: u32) {
        self.flags
            .frame_duration_ms
            .store(ms.max(1), Ordering::SeqCst);
    }

    pub fn frame_duration_ms(&self) -> u32 {
        self.flags.frame_duration_ms.load(Ordering::SeqCst)
    }

    pub fn set_sentence_id(&self, id: &str) {
        *self.sentence_id.lock().unwrap() = Some(id.to_string());
    }

    pub fn current_sentence_id(&self) -> Option<String> {
        self.sentence_id.lock().unwrap().clone()
    }

    // ── channels and snapshots ───────────────────────────────

    pub async fn adapters_snapshot(&self) -> Option<Arc<SessionAdapters>> {
        self.adapters.read().await.clone()
    }

    pub async fn tools_snapshot(&self) -> Option<Arc<ToolRuntime>> {
        self.tools.read().await.clone()
    }

    pub async fn binding_snapshot(&self) -> Option<Arc<AgentBinding>> {
        self.binding.read().await.clone()
    }

    pub async fn send_envelope(&self, envelope: ServerEnvelope) {
        let _ = self.outbound.send(Outbound::Text(envelope.to_json())).await;
    }

    pub async fn enqueue_tts(&self, job: TtsJob) {
        let sender = self.tts_jobs.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(job).await;
        }
    }

    pub fn reporter_report(&self, kind: ReportKind, text: &str, audio: Option<Vec<u8>>) {
        if let Some(reporter) = self.reporter.lock().unwrap().as_ref() {
            reporter.report(kind, text, audio);
        }
    }

    pub async fn request_close(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
    }

    /// Speak text directly through TTS with a fresh sentence id; the path
    /// used by notifications and direct tool responses.
    pub async fn speak_text(&self, text: &str) {
        let id = Uuid::new_v4().simple().to_string();
        self.set_sentence_id(&id);
        self.clear_abort();
        self.enqueue_tts(TtsJob::action(&id, SentenceOrdinal::First))
            .await;
        for sentence in segment::split_sentences(text) {
            self.enqueue_tts(TtsJob::sentence(&id, sentence)).await;
        }
        self.enqueue_tts(TtsJob::action(&id, SentenceOrdinal::Last))
            .await;
    }

    /// Queue one sentence under the current turn's sentence id.
    pub async fn speak_now(&self, text: &str) {
        let id = self.current_sentence_id().unwrap_or_default();
        self.enqueue_tts(TtsJob::sentence(&id, text)).await;
    }

    // ── initialization & hot-reload ──────────────────────────

    async fn initialize(self: &Arc<Self>) {
        let binding = self.ctx.bindings.resolve(&self.identity).await;
        debug!(agent_id = %binding.agent_id, "binding resolved");

        match self.ctx.adapters.build(&binding) {
            Ok(adapters) => {
                *self.adapters.write().await = Some(Arc::new(adapters));
            }
            Err(e) => {
                error!(error = %e, "adapter construction failed, session stays deaf");
                return;
            }
        }

        let runtime = self.build_tool_runtime(&binding).await;
        *self.tools.write().await = Some(runtime);

        *self.reporter.lock().unwrap() = Some(ChatReporter::new(
            binding.chat_history,
            self.ctx.report_sink.clone(),
        ));

        self.install_prompt(&binding).await;
        *self.binding.write().await = Some(binding);

        self.mark_device_status(true).await;
        let _ = self.ready_tx.send(true);
        info!(session_id = %self.session_id, "pipeline ready");

        // The device may have negotiated MCP before the tool runtime
        // existed; discovery starts here in that case.
        if self.mcp_enabled() {
            if let Some(runtime) = self.tools_snapshot().await {
                runtime.device_mcp.start_discovery(&self.session_id).await;
            }
        }
    }

    async fn install_prompt(&self, binding: &AgentBinding) {
        let prompt_manager = PromptManager::new(self.ctx.cache.clone());
        let prompt = prompt_manager
            .build_enhanced_prompt(
                &binding.prompt_template,
                binding.user_profile.as_deref(),
                "",
            )
            .await;
        self.dialogue.lock().await.update_system_message(prompt);
    }

    async fn build_tool_runtime(self: &Arc<Self>, binding: &AgentBinding) -> Arc<ToolRuntime> {
        let manager = Arc::new(ToolManager::new());

        let plugin_ctx = Arc::new(PluginContext {
            identity: self.identity.clone(),
            agent_id: binding.agent_id.clone(),
            outbound: self.outbound.clone(),
            dialogue: self.dialogue.clone(),
            reminder_store: self.ctx.scheduler.store().clone(),
            scheduler: self.ctx.scheduler.clone(),
            utc_offset_minutes: self.ctx.config.session.utc_offset_minutes,
        });
        let tool_refs = (!binding.tool_refs.is_empty()).then_some(binding.tool_refs.as_slice());
        manager.register_executor(
            ToolBackend::ServerPlugin,
            Arc::new(ServerPluginExecutor::new(plugin_ctx, tool_refs)),
        );

        let server_mcp = Arc::new(ServerMcpManager::new(&binding.active_mcp_servers()));
        server_mcp.initialize().await;
        manager.register_executor(
            ToolBackend::ServerMcp,
            Arc::new(ServerMcpExecutor::new(server_mcp.clone())),
        );

        let device_mcp = DeviceMcpClient::new(self.outbound.clone());
        manager.register_executor(
            ToolBackend::DeviceMcp,
            Arc::new(DeviceMcpExecutor::new(device_mcp.clone())),
        );

        let device_iot = Arc::new(DeviceIotExecutor::new(self.outbound.clone()));
        manager.register_executor(ToolBackend::DeviceIot, device_iot.clone());

        let mcp_endpoint = match binding.mcp_endpoint_url.as_deref() {
            Some(url) if validate_endpoint_url(url) => {
                match McpEndpointClient::connect(url, &self.identity.mac).await {
                    Ok(client) => {
                        manager.register_executor(
                            ToolBackend::McpEndpoint,
                            Arc::new(McpEndpointExecutor::new(client.clone())),
                        );
                        Some(client)
                    }
                    Err(e) => {
                        warn!(error = %e, "MCP endpoint unavailable");
                        None
                    }
                }
            }
            Some(url) => {
                warn!(%url, "invalid MCP endpoint url, skipping");
                None
            }
            None => None,
        };

        Arc::new(ToolRuntime {
            dispatcher: ToolDispatcher::new(manager.clone()),
            manager,
            device_mcp,
            device_iot,
            server_mcp,
            mcp_endpoint,
        })
    }

    /// Rebind to a different agent template without dropping the socket.
    pub async fn hot_reload(self: &Arc<Self>, new_binding: Arc<AgentBinding>) {
        if self.flags.reloading.swap(true, Ordering::SeqCst) {
            warn!("hot-reload already in progress");
            return;
        }

        // Never interleave with an in-flight LLM turn.
        if self.is_llm_busy() {
            self.abort_playback();
            for _ in 0..50 {
                if !self.is_llm_busy() {
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }
        }

        let _ = self.ready_tx.send(false);
        let previous = self.adapters.write().await.take();

        match self.ctx.adapters.build(&new_binding) {
            Ok(adapters) => {
                *self.adapters.write().await = Some(Arc::new(adapters));
                let runtime = self.build_tool_runtime(&new_binding).await;
                *self.tools.write().await = Some(runtime);
                self.install_prompt(&new_binding).await;
                *self.binding.write().await = Some(new_binding);
                self.clear_abort();
                info!("hot-reload completed");
            }
            Err(e) => {
                // Roll back: the previous adapters keep the session alive.
                warn!(error = %e, "hot-reload failed, rolling back");
                *self.adapters.write().await = previous;
            }
        }

        let _ = self.ready_tx.send(true);
        self.flags.reloading.store(false, Ordering::SeqCst);
    }

    async fn mark_device_status(&self, connected: bool) {
        let key = format!("{}:status", self.identity.mac);
        let result = if connected {
            self.ctx
                .cache
                .set(CacheKind::Device, &key, serde_json::json!("connected"))
                .await
        } else {
            self.ctx.cache.delete(CacheKind::Device, &key).await.map(|_| ())
        };
        if let Err(e) = result {
            error!(error = %e, "device status cache update failed");
        }
    }
}

// ── session runtime ──────────────────────────────────────────

/// Drive one accepted WebSocket to completion.
pub async fn run_session(
    socket: WebSocket,
    ctx: GatewayContext,
    identity: DeviceIdentity,
    via_mqtt_gateway: bool,
) {
    let (ws_tx, ws_rx) = socket.split();

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(256);
    let (tts_tx, tts_rx) = mpsc::channel::<TtsJob>(64);
    let (audio_tx, audio_rx) = mpsc::channel::<AudioIn>(256);
    let (audio_out_tx, audio_out_rx) = mpsc::channel(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(16);

    let session = Session::new(
        ctx.clone(),
        identity.clone(),
        out_tx.clone(),
        tts_tx,
        cmd_tx.clone(),
    );
    info!(session_id = %session.session_id, mac = %identity.mac, "session started");

    let sender_task = tokio::spawn(sender_loop(ws_tx, out_rx));

    let handle = SessionHandle::new(session.session_id.clone(), out_tx.clone(), cmd_tx.clone());
    ctx.registry.register(&identity.mac, handle.clone()).await;

    // Non-blocking initialization; audio arriving early is buffered.
    let init_session = session.clone();
    let init_task = tokio::spawn(async move { init_session.initialize().await });

    let timeout_session = session.clone();
    let timeout_cmd = cmd_tx.clone();
    let timeout_ceiling_ms = ctx.config.session.timeout_seconds * 1000;
    let timeout_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(TIMEOUT_CHECK_INTERVAL).await;
            if timeout_session.is_stopping() {
                break;
            }
            if timeout_session.idle_ms() > timeout_ceiling_ms {
                info!("session idle past ceiling, closing");
                let _ = timeout_cmd.send(SessionCommand::Close).await;
                break;
            }
        }
    });

    let ingress_task = tokio::spawn(audio_in::ingress_worker(session.clone(), audio_rx));
    let tts_text_task = tokio::spawn(tts_out::text_worker(
        session.clone(),
        tts_rx,
        audio_out_tx,
    ));
    let egress_task = tokio::spawn(tts_out::egress_worker(session.clone(), audio_out_rx));

    receive_loop(&session, ws_rx, audio_tx, cmd_rx, via_mqtt_gateway).await;

    close_session(
        &session,
        &handle,
        SessionTasks {
            sender: sender_task,
            init: init_task,
            timeout: timeout_task,
            ingress: ingress_task,
            tts_text: tts_text_task,
            egress: egress_task,
        },
    )
    .await;
}

struct SessionTasks {
    sender: JoinHandle<()>,
    init: JoinHandle<()>,
    timeout: JoinHandle<()>,
    ingress: JoinHandle<()>,
    tts_text: JoinHandle<()>,
    egress: JoinHandle<()>,
}

async fn sender_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(message) = rx.recv().await {
        let result = match message {
            Outbound::Text(text) => ws_tx.send(WsMessage::Text(text.into())).await,
            Outbound::Audio(bytes) => ws_tx.send(WsMessage::Binary(bytes.into())).await,
            Outbound::Close => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

async fn receive_loop(
    session: &Arc<Session>,
    mut ws_rx: SplitStream<WebSocket>,
    audio_tx: mpsc::Sender<AudioIn>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    via_mqtt_gateway: bool,
) {
    let mut ready = session.ready_tx.subscribe();
    let mut timestamps = TimestampSynthesizer::new(session.frame_duration_ms());
    let mut pre_ready: VecDeque<AudioIn> = VecDeque::with_capacity(PRE_READY_AUDIO_BUFFER);
    let mut warned_not_ready = false;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error");
                        break;
                    }
                    None => break,
                };
                match message {
                    WsMessage::Text(text) => {
                        text::handle_text(session, text.as_str(), &audio_tx).await;
                    }
                    WsMessage::Binary(bytes) => {
                        handle_binary(
                            session,
                            bytes.to_vec(),
                            via_mqtt_gateway,
                            &mut timestamps,
                            &audio_tx,
                            &mut ready,
                            &mut pre_ready,
                            &mut warned_not_ready,
                        )
                        .await;
                    }
                    WsMessage::Close(_) => {
                        info!("client disconnected");
                        break;
                    }
                    _ => {}
                }
            }
            command = cmd_rx.recv() => {
                match command {
                    Some(SessionCommand::Speak(text)) => session.speak_text(&text).await,
                    Some(SessionCommand::Reload(binding)) => session.hot_reload(binding).await,
                    Some(SessionCommand::Close) | None => break,
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_binary(
    session: &Arc<Session>,
    bytes: Vec<u8>,
    via_mqtt_gateway: bool,
    timestamps: &mut TimestampSynthesizer,
    audio_tx: &mpsc::Sender<AudioIn>,
    ready: &mut watch::Receiver<bool>,
    pre_ready: &mut VecDeque<AudioIn>,
    warned_not_ready: &mut bool,
) {
    session.touch_activity();

    let frame = if via_mqtt_gateway && bytes.len() >= frame::V3_HEADER_SIZE {
        match frame::decode(&bytes) {
            Ok(decoded) => match decoded.kind() {
                FrameKind::Control => {
                    match String::from_utf8(decoded.into_payload()) {
                        Ok(text) => text::handle_text(session, &text, audio_tx).await,
                        Err(e) => warn!(error = %e, "framed control payload is not UTF-8"),
                    }
                    return;
                }
                FrameKind::Audio => {
                    let timestamp = decoded
                        .timestamp_ms()
                        .unwrap_or_else(|| timestamps.next());
                    AudioIn::Frame {
                        bytes: decoded.into_payload(),
                        timestamp: Some(timestamp),
                    }
                }
            },
            Err(e @ frame::FrameError::Truncated { .. }) => {
                // A declared payload longer than the buffer is a framing
                // error: drop the frame, never the session.
                warn!(error = %e, "discarding malformed frame");
                return;
            }
            Err(_) => {
                // Not recognizably framed; treat as raw Opus audio.
                AudioIn::Frame {
                    bytes,
                    timestamp: None,
                }
            }
        }
    } else {
        // Plain binary is raw Opus audio.
        AudioIn::Frame {
            bytes,
            timestamp: None,
        }
    };

    if !*ready.borrow() {
        if !*warned_not_ready {
            warn!("audio before pipeline ready, buffering a bounded tail");
            *warned_not_ready = true;
        }
        if pre_ready.len() == PRE_READY_AUDIO_BUFFER {
            pre_ready.pop_front();
        }
        pre_ready.push_back(frame);
        return;
    }

    // First audio after readiness drains the held-back tail in order.
    while let Some(buffered) = pre_ready.pop_front() {
        let _ = audio_tx.send(buffered).await;
    }
    let _ = audio_tx.send(frame).await;
}

async fn close_session(session: &Arc<Session>, handle: &SessionHandle, tasks: SessionTasks) {
    if session.flags.closing.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(session_id = %session.session_id, "closing session");

    session.flags.stopping.store(true, Ordering::SeqCst);
    session.abort_playback();
    handle.mark_stopped();
    session
        .ctx
        .registry
        .unregister(&session.identity.mac, &session.session_id)
        .await;

    tasks.timeout.abort();
    tasks.init.abort();

    // Closing the job channel winds down the TTS workers in order.
    session.tts_jobs.lock().unwrap().take();
    let _ = tasks.tts_text.await;
    let _ = tasks.egress.await;
    let _ = tasks.ingress.await;

    let reporter = session.reporter.lock().unwrap().take();
    if let Some(mut reporter) = reporter {
        reporter.shutdown().await;
    }

    session.mark_device_status(false).await;

    // Memory persistence must not block the close path.
    if let Some(adapters) = session.adapters.write().await.take() {
        let messages = session.dialogue.lock().await.messages().to_vec();
        tokio::spawn(async move {
            if let Err(e) = adapters.memory.save_memory(&messages).await {
                warn!(error = %e, "memory save failed");
            }
        });
    }

    // Close the socket exactly once.
    let _ = session.outbound.send(Outbound::Close).await;
    let _ = tasks.sender.await;

    info!(session_id = %session.session_id, "session resources released");
}
