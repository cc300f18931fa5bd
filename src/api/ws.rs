//! WS upgrade bridging (spec §6 `/ws/stream`, `/ws/stream/compare`,
//! `/ws/replay`, `/ws/voice`) and `GET /healthz` / `POST /providers/refresh`.
//!
//! Each handler bridges a real `warp::filters::ws::WebSocket` into the
//! transport-agnostic `WsInbound`/`WsOutbound` channels the Session
//! Handlers speak, the way the teacher's `api/socket.rs` splits a socket
//! into a spawned write task and a spawned read task joined with
//! `futures::select!`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures_util::stream::StreamExt;
use futures_util::{pin_mut, sink::SinkExt};
use tokio::sync::mpsc;
use tokio::task::spawn;
use uuid::Uuid;
use warp::filters::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use tokio::sync::broadcast;

use crate::availability::{AvailabilityCache, ProviderHealth};
use crate::config::InnerConfig;
use crate::error::ConfigError;
use crate::provider::ProviderAdapter;
use crate::session::realtime::{RealtimeSessionHandler, WsInbound, WsOutbound};
use crate::session::replay::{ReplaySessionHandler, ReplaySource};
use crate::session::{providers_from_query, ServerMessage, StreamingConfig};
use crate::storage::Storage;
use crate::voice::meeting::{EchoSuppressConfig, WakeWordConfig};
use crate::voice::{ChatClient, TtsClient, VoiceOrchestrator, VoiceOrchestratorConfig};

const WS_BUFFER: usize = 256;

pub struct AppState {
    pub config: InnerConfig,
    pub adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    pub storage: Arc<dyn Storage>,
    pub availability: Arc<AvailabilityCache>,
    pub resampler_bin: String,
    pub chat: Arc<dyn ChatClient>,
    pub tts: Arc<dyn TtsClient>,
    /// Fans out each `/providers/refresh` snapshot through the shared
    /// `Router` registry, the way the teacher's own cache-invalidation
    /// broadcasts ride `Router` rather than a bespoke channel.
    pub health_tx: broadcast::Sender<HashMap<String, ProviderHealth>>,
}

/// Resolves the requested provider names against both the registered
/// adapters and the Availability Cache (spec §4.I: "all endpoint handlers
/// and WS upgraders consult the cache"). An explicitly requested but
/// unsupported or unavailable provider is an error, not a silent
/// substitution; an empty `names` (no provider requested) picks any one
/// available adapter.
async fn selected_adapters(
    state: &AppState,
    names: &[String],
) -> Result<HashMap<String, Arc<dyn ProviderAdapter>>, ConfigError> {
    let health = state.availability.snapshot().await;
    let is_available = |name: &str| health.get(name).map(|h| h.available).unwrap_or(false);

    if names.is_empty() {
        let mut chosen = HashMap::new();
        if let Some((name, adapter)) = state
            .adapters
            .iter()
            .find(|(name, _)| is_available(name))
        {
            chosen.insert(name.clone(), adapter.clone());
        }
        return Ok(chosen);
    }

    let mut chosen = HashMap::new();
    for name in names {
        if is_available(name) {
            if let Some(adapter) = state.adapters.get(name) {
                chosen.insert(name.clone(), adapter.clone());
            }
        }
    }
    if chosen.is_empty() {
        return Err(ConfigError::UnsupportedProvider(names.join(",")));
    }
    Ok(chosen)
}

/// Sends a single `{type:"error"}` frame then closes, without ever
/// upgrading into a session handler. Used for config-layer failures
/// discovered only after the WS upgrade (origin, provider selection).
async fn send_error_and_close(ws: WebSocket, message: String) {
    let (mut write, _read) = ws.split();
    if let Ok(text) = serde_json::to_string(&ServerMessage::Error {
        message,
        provider: None,
    }) {
        write.send(Message::text(text)).await.ok();
    }
    write.send(Message::close()).await.ok();
}

/// Drives a real socket through the `WsInbound`/`WsOutbound` channel pair
/// that the given async closure consumes/produces.
async fn bridge_socket<F, Fut>(ws: WebSocket, run: F)
where
    F: FnOnce(mpsc::Receiver<WsInbound>, mpsc::Sender<WsOutbound>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let (in_tx, in_rx) = mpsc::channel::<WsInbound>(WS_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<WsOutbound>(WS_BUFFER);

    let handler = spawn(run(in_rx, out_tx)).fuse();

    let write_handler = spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let sent = match msg {
                WsOutbound::Text(text) => write.send(Message::text(text)).await,
                WsOutbound::Binary(bytes) => write.send(Message::binary(bytes)).await,
                WsOutbound::Close => {
                    write.send(Message::close()).await.ok();
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
    })
    .fuse();

    let read_handler = spawn(async move {
        while let Some(message) = read.next().await {
            let Ok(message) = message else { break; };
            if message.is_text() {
                if let Ok(text) = message.to_str() {
                    if in_tx.send(WsInbound::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
            } else if message.is_binary() {
                if in_tx.send(WsInbound::Binary(message.into_bytes())).await.is_err() {
                    break;
                }
            } else if message.is_close() {
                in_tx.send(WsInbound::Close).await.ok();
                break;
            }
        }
    })
    .fuse();

    pin_mut!(handler, write_handler, read_handler);
    futures::select! {
        _ = handler => {},
        _ = write_handler => {},
        _ = read_handler => {},
    }
}

async fn stream_ws(ws: WebSocket, query: HashMap<String, String>, state: Arc<AppState>) {
    let names = providers_from_query(&query);
    let adapters = match selected_adapters(&state, &names).await {
        Ok(adapters) => adapters,
        Err(err) => {
            send_error_and_close(ws, err.to_string()).await;
            return;
        }
    };
    let storage = state.storage.clone();
    let resampler_bin = state.resampler_bin.clone();
    bridge_socket(ws, move |in_rx, out_tx| async move {
        let handler = RealtimeSessionHandler {
            session_id: Uuid::new_v4(),
            adapters,
            storage,
            resampler_bin,
        };
        handler.run(in_rx, out_tx).await;
    })
    .await;
}

async fn replay_ws(ws: WebSocket, query: HashMap<String, String>, state: Arc<AppState>) {
    let names = providers_from_query(&query);
    let adapters = match selected_adapters(&state, &names).await {
        Ok(adapters) => adapters,
        Err(err) => {
            send_error_and_close(ws, err.to_string()).await;
            return;
        }
    };
    let storage = state.storage.clone();
    let resampler_bin = state.resampler_bin.clone();
    // `sessionId` resolution to a stored recording is out of scope (spec.md §9);
    // an empty-frame source still exercises the full handshake/teardown path.
    let frames = Vec::new();
    bridge_socket(ws, move |in_rx, out_tx| async move {
        let (config_tx, mut config_rx) = mpsc::channel::<StreamingConfig>(1);
        let mut in_rx = in_rx;
        spawn(async move {
            if let Some(WsInbound::Text(text)) = in_rx.recv().await {
                if let Ok(config) = serde_json::from_str(&text) {
                    config_tx.send(config).await.ok();
                }
            }
        });
        let config = config_rx.recv().await.unwrap_or(StreamingConfig {
            pcm: true,
            client_sample_rate: Some(16_000),
            enable_interim: false,
            degraded: false,
            normalize_preset: None,
            context_phrases: vec![],
            options: Default::default(),
        });
        let handler = ReplaySessionHandler {
            session_id: Uuid::new_v4(),
            adapters,
            storage,
            resampler_bin,
        };
        handler.run(config, ReplaySource { frames }, out_tx).await;
    })
    .await;
}

async fn voice_ws(ws: WebSocket, _query: HashMap<String, String>, state: Arc<AppState>) {
    let adapter = match selected_adapters(&state, &[]).await {
        Ok(adapters) => match adapters.into_values().next() {
            Some(adapter) => adapter,
            None => {
                send_error_and_close(
                    ws,
                    ConfigError::UnsupportedProvider("no provider available".to_string())
                        .to_string(),
                )
                .await;
                return;
            }
        },
        Err(err) => {
            send_error_and_close(ws, err.to_string()).await;
            return;
        }
    };
    let chat = state.chat.clone();
    let tts = state.tts.clone();
    let voice_conf = state.config.voice.clone();
    bridge_socket(ws, move |in_rx, out_tx| async move {
        let orchestrator = VoiceOrchestrator::new(
            Uuid::new_v4(),
            adapter,
            chat,
            tts,
            VoiceOrchestratorConfig {
                history_max_turns: voice_conf.history_max_turns,
                system_prompt: voice_conf.system_prompt,
                meeting_mode: voice_conf.meeting_mode,
                wake_word: WakeWordConfig {
                    wake_words: voice_conf.wake_words,
                    require_wake_word: voice_conf.require_wake_word,
                    open_window: std::time::Duration::from_millis(voice_conf.open_window_ms),
                    cooldown: std::time::Duration::from_millis(voice_conf.cooldown_ms),
                },
                echo_suppress: EchoSuppressConfig {
                    suppress_for: std::time::Duration::from_millis(voice_conf.echo_suppress_ms),
                    similarity_threshold: voice_conf.echo_similarity_threshold,
                },
                intro_enabled: voice_conf.intro_enabled,
            },
        );
        orchestrator.run(in_rx, out_tx).await;
    })
    .await;
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Origin checking happens *after* the WS upgrade, not as an HTTP-layer
/// rejection: spec.md groups a disallowed origin with the other
/// `ConfigError` cases that get a `{type:"error"}` WS frame then close
/// (§7/SPEC_FULL.md §4.K), not an HTTP 403 before the socket exists.
async fn origin_checked_upgrade<F, Fut>(
    origin: Option<String>,
    ws: warp::ws::Ws,
    state: Arc<AppState>,
    run: F,
) -> Result<impl Reply, std::convert::Infallible>
where
    F: FnOnce(WebSocket, Arc<AppState>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Ok(ws.on_upgrade(move |socket| async move {
        if let Some(origin) = origin {
            if !state.config.is_origin_allowed(&origin) {
                send_error_and_close(
                    socket,
                    ConfigError::OriginNotAllowed(origin).to_string(),
                )
                .await;
                return;
            }
        }
        run(socket, state).await;
    }))
}

pub fn routes(state: Arc<AppState>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let healthz = warp::path("healthz").and(warp::get()).map(|| "ok");

    let refresh_state = state.clone();
    let refresh = warp::path("providers")
        .and(warp::path("refresh"))
        .and(warp::post())
        .and(with_state(refresh_state))
        .and_then(|state: Arc<AppState>| async move {
            let health = state.availability.refresh().await;
            state.health_tx.send(health).ok();
            Ok::<_, std::convert::Infallible>(warp::reply::json(&serde_json::json!({"refreshed": true})))
        });

    let stream_state = state.clone();
    let stream = warp::path("ws")
        .and(warp::path("stream"))
        .and(warp::path::end())
        .and(warp::header::optional::<String>("origin"))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .and(with_state(stream_state))
        .and_then(
            |origin: Option<String>, query: HashMap<String, String>, ws: warp::ws::Ws, state: Arc<AppState>| {
                origin_checked_upgrade(origin, ws, state, move |socket, state| {
                    stream_ws(socket, query, state)
                })
            },
        );

    let compare_state = state.clone();
    let compare = warp::path("ws")
        .and(warp::path("stream"))
        .and(warp::path("compare"))
        .and(warp::path::end())
        .and(warp::header::optional::<String>("origin"))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .and(with_state(compare_state))
        .and_then(
            |origin: Option<String>, query: HashMap<String, String>, ws: warp::ws::Ws, state: Arc<AppState>| {
                origin_checked_upgrade(origin, ws, state, move |socket, state| {
                    stream_ws(socket, query, state)
                })
            },
        );

    let replay_state = state.clone();
    let replay = warp::path("ws")
        .and(warp::path("replay"))
        .and(warp::path::end())
        .and(warp::header::optional::<String>("origin"))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .and(with_state(replay_state))
        .and_then(
            |origin: Option<String>, query: HashMap<String, String>, ws: warp::ws::Ws, state: Arc<AppState>| {
                origin_checked_upgrade(origin, ws, state, move |socket, state| {
                    replay_ws(socket, query, state)
                })
            },
        );

    let voice_state = state.clone();
    let voice = warp::path("ws")
        .and(warp::path("voice"))
        .and(warp::path::end())
        .and(warp::header::optional::<String>("origin"))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .and(with_state(voice_state))
        .and_then(
            |origin: Option<String>, query: HashMap<String, String>, ws: warp::ws::Ws, state: Arc<AppState>| {
                origin_checked_upgrade(origin, ws, state, move |socket, state| {
                    voice_ws(socket, query, state)
                })
            },
        );

    healthz.or(refresh).or(stream).or(compare).or(replay).or(voice)
}
