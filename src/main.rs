use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use warp::Filter;

use sttcompare::api::ws::{routes, AppState};
use sttcompare::api::handle_rejection;
use sttcompare::availability::AvailabilityCache;
use sttcompare::config::BaseConfig;
use sttcompare::error::AdapterError;
use sttcompare::provider::http_batch::{HttpBatchAdapter, HttpBatchConfig};
use sttcompare::provider::mock::MockAdapter;
use sttcompare::provider::ws_realtime::{WsRealtimeAdapter, WsRealtimeConfig};
use sttcompare::provider::ProviderAdapter;
use sttcompare::resample::DEFAULT_RESAMPLER_BIN;
use sttcompare::router::Router;
use sttcompare::storage::{establish_connection_pool, DieselStorage, MemoryStorage, Storage};
use sttcompare::voice::{ChatClient, TtsClient};

#[derive(Parser, Debug)]
#[command(author, version, about = "Realtime STT comparison gateway")]
struct Args {
    conf: PathBuf,
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// No LLM is implemented (spec.md Non-goals); echoes the prompt back so the
/// orchestrator's turn-taking machinery can be exercised end to end.
struct EchoChat;

#[async_trait]
impl ChatClient for EchoChat {
    async fn reply(
        &self,
        _history: &[sttcompare::voice::ChatMessage],
        user_text: &str,
    ) -> Result<String, AdapterError> {
        Ok(format!("you said: {user_text}"))
    }
}

/// No TTS is implemented (spec.md Non-goals); emits a single silent PCM
/// chunk so `voice_assistant_audio_start/end` still fire correctly.
struct SilentTts;

#[async_trait]
impl TtsClient for SilentTts {
    async fn synthesize(&self, _text: &str) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(vec![0u8; 640]).await.ok();
        Ok(rx)
    }
}

fn build_adapters(
    conf: &sttcompare::config::InnerConfig,
) -> HashMap<String, Arc<dyn ProviderAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert("mock".to_string(), Arc::new(MockAdapter));

    for (name, provider) in &conf.providers {
        if !provider.enabled {
            continue;
        }
        match name.as_str() {
            "openai-realtime" => {
                adapters.insert(
                    name.clone(),
                    Arc::new(WsRealtimeAdapter::new(WsRealtimeConfig {
                        model: "gpt-4o-transcribe",
                        ..Default::default()
                    })),
                );
            }
            "whisper" | "http-batch" => {
                adapters.insert(
                    name.clone(),
                    Arc::new(HttpBatchAdapter::new(HttpBatchConfig {
                        default_model: provider
                            .model
                            .clone()
                            .unwrap_or_else(|| "whisper-1".to_string()),
                        ..Default::default()
                    })),
                );
            }
            other => {
                tracing::warn!(provider = %other, "no adapter wired for configured provider name");
            }
        }
    }
    adapters
}

#[tokio::main]
async fn main() {
    setup_tracing();

    let args = Args::parse();
    let conf = BaseConfig::from_path(&args.conf).expect("could not read config file");
    let conf: sttcompare::config::InnerConfig = conf.try_into().expect("could not resolve config secrets");

    let adapters = build_adapters(&conf);

    let storage: Arc<dyn Storage> = match &conf.database_url {
        Some(url) => match establish_connection_pool(url) {
            Ok(pool) => Arc::new(DieselStorage::new(pool)),
            Err(e) => {
                tracing::error!(error = %e, "could not establish database pool, falling back to in-memory storage");
                Arc::new(MemoryStorage::new())
            }
        },
        None => Arc::new(MemoryStorage::new()),
    };

    let availability = Arc::new(AvailabilityCache::new(
        Duration::from_millis(conf.provider_health_refresh_ms),
        adapters.values().cloned().collect(),
    ));

    let bind_addr = conf.bind_addr.clone();
    let tls = conf.tls.clone();

    let mut router = Router::new();
    let health_tx: tokio::sync::broadcast::Sender<HashMap<String, sttcompare::availability::ProviderHealth>> =
        router.announce();
    let mut health_rx = health_tx.subscribe();
    tokio::spawn(async move {
        while let Ok(health) = health_rx.recv().await {
            tracing::info!(providers = health.len(), "provider availability refreshed");
        }
    });

    let state = Arc::new(AppState {
        config: conf,
        adapters,
        storage,
        availability,
        resampler_bin: DEFAULT_RESAMPLER_BIN.to_string(),
        chat: Arc::new(EchoChat),
        tts: Arc::new(SilentTts),
        health_tx,
    });

    let log_requests = warp::log::custom(|info| {
        tracing::info!(
            "{} {} {} {}",
            info.remote_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "???".into()),
            info.method(),
            info.path(),
            info.status()
        );
    });

    let app_routes = routes(state).recover(handle_rejection).with(log_requests);

    let addr: std::net::SocketAddr = bind_addr.parse().expect("invalid bind_addr");

    match tls {
        Some(tls) => {
            warp::serve(app_routes)
                .tls()
                .cert_path(&tls.cert_path)
                .key_path(&tls.key_path)
                .run(addr)
                .await;
        }
        None => {
            warp::serve(app_routes).run(addr).await;
        }
    }
}
