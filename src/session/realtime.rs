//! Module F — Realtime Session Handler (spec §4.F).
//!
//! Decoupled from warp's `WebSocket` type on purpose: the handler speaks
//! `WsInbound`/`WsOutbound` over plain channels so the state machine can be
//! exercised directly in tests. `crate::api::ws` bridges a real upgraded
//! socket into these channels.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::attribution::CaptureAttributor;
use crate::error::SessionError;
use crate::frame::AudioFrame;
use crate::normalize::{NormalizePreset, StreamNormalizer};
use crate::provider::{
    AdapterEvent, Channel, PartialTranscript, ProviderAdapter, StreamingController,
    StreamingOptions,
};
use crate::resample::{ChunkMeta, Resampler, ResamplerConfig, DEFAULT_RESAMPLER_BIN};
use crate::storage::{LatencySummaryRow, Storage, TranscriptLogRow};

use super::{AudioSpec, ServerMessage, StreamingConfig};

pub const MAX_PCM_QUEUE_BYTES: usize = 5 * 1024 * 1024;
pub const OVERFLOW_GRACE: Duration = Duration::from_millis(500);
const BUCKET_MS: f64 = 250.0;

#[derive(Debug, Clone)]
pub enum WsInbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Clone)]
pub enum WsOutbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

pub struct RealtimeSessionHandler {
    pub session_id: Uuid,
    pub adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    pub storage: Arc<dyn Storage>,
    pub resampler_bin: String,
}

struct ProviderState {
    name: String,
    controller: StreamingController,
    attributor: CaptureAttributor,
    last_signature: Option<String>,
    latencies_ms: Vec<f64>,
    resampler: Option<Resampler>,
}

/// Tracks the byte-bounded backlog over a trailing `OVERFLOW_GRACE`
/// window and its overflow grace timer (spec §4.F "Backpressure").
/// A rolling window rather than an instantaneous in-flight counter: a
/// single frame is forwarded and drained before the next one is read,
/// so only bytes received in the recent past (not bytes "in transit")
/// can ever reflect a client outrunning the providers.
struct Backlog {
    received: VecDeque<(Instant, usize)>,
}

impl Backlog {
    fn new() -> Self {
        Backlog {
            received: VecDeque::new(),
        }
    }

    fn push(&mut self, now: Instant, len: usize) {
        self.received.push_back((now, len));
        while let Some(&(ts, _)) = self.received.front() {
            if now.saturating_duration_since(ts) > OVERFLOW_GRACE {
                self.received.pop_front();
            } else {
                break;
            }
        }
    }

    fn queued_bytes(&self, now: Instant) -> usize {
        self.received
            .iter()
            .filter(|(ts, _)| now.saturating_duration_since(*ts) <= OVERFLOW_GRACE)
            .map(|(_, len)| len)
            .sum()
    }
}

impl RealtimeSessionHandler {
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<WsInbound>,
        outbound: mpsc::Sender<WsOutbound>,
    ) {
        let started_at = Utc::now();

        let first = match inbound.recv().await {
            Some(WsInbound::Text(text)) => text,
            _ => {
                send_error(&outbound, "expected config message first", None).await;
                return;
            }
        };
        let config: StreamingConfig = match serde_json::from_str(&first) {
            Ok(c) => c,
            Err(e) => {
                send_error(&outbound, &format!("invalid config: {e}"), None).await;
                return;
            }
        };
        if self.adapters.is_empty() {
            send_error(&outbound, "no provider available", None).await;
            return;
        }

        let client_rate = config.client_sample_rate.unwrap_or(16_000);
        let preset = config
            .normalize_preset
            .as_deref()
            .map(NormalizePreset::parse)
            .unwrap_or_default();
        let degraded = config.degraded;

        let mut providers = Vec::new();
        for (name, adapter) in &self.adapters {
            let required_rate = adapter.required_sample_rate().unwrap_or(client_rate);
            let opts = StreamingOptions {
                language: None,
                sample_rate_hz: required_rate,
                encoding: Default::default(),
                enable_interim: config.enable_interim,
                enable_vad: config.options.enable_vad,
                vad: config.options.vad.clone(),
                context_phrases: config.context_phrases.clone(),
                dictionary_phrases: config.options.dictionary_phrases.clone(),
                punctuation_policy: config.options.punctuation_policy.clone(),
                model: None,
                batch_model: None,
                fallback_model: None,
                normalize_preset: config.normalize_preset.clone(),
            };
            let session = match adapter.start_streaming(opts).await {
                Ok(s) => s,
                Err(e) => {
                    send_error(&outbound, &e.client_message_from_adapter(), Some(name.clone()))
                        .await;
                    return;
                }
            };
            let resampler = if required_rate != client_rate {
                match Resampler::spawn(
                    DEFAULT_RESAMPLER_BIN,
                    ResamplerConfig {
                        from_rate: client_rate,
                        to_rate: required_rate,
                        low_pass: required_rate >= client_rate,
                    },
                ) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        send_error(&outbound, &e.to_string(), Some(name.clone())).await;
                        return;
                    }
                }
            } else {
                None
            };
            providers.push((
                ProviderState {
                    name: name.clone(),
                    controller: session.controller,
                    attributor: CaptureAttributor::new(),
                    last_signature: None,
                    latencies_ms: Vec::new(),
                    resampler,
                },
                session.events,
            ));
        }

        let provider_label = providers
            .iter()
            .map(|(p, _)| p.name.clone())
            .collect::<Vec<_>>()
            .join(",");
        send(
            &outbound,
            ServerMessage::Session {
                session_id: self.session_id,
                provider: provider_label,
                started_at: started_at.timestamp_millis(),
                input_sample_rate: client_rate,
                audio_spec: AudioSpec {
                    sample_rate: client_rate,
                    channels: 1,
                    format: "pcm16le",
                },
            },
        )
        .await;

        let mut normalizer = StreamNormalizer::new(BUCKET_MS, preset);
        let mut backlog = Backlog::new();
        let mut overflow_deadline: Option<Instant> = None;
        let mut normalized_seq: u64 = 0;

        let mut event_futs = FuturesUnordered::new();
        let mut provider_states: HashMap<String, ProviderState> = HashMap::new();
        for (state, mut events) in providers {
            let name = state.name.clone();
            provider_states.insert(name.clone(), state);
            event_futs.push(Box::pin(async move {
                let ev = events.recv().await;
                (name, events, ev)
            })
                as std::pin::Pin<Box<dyn std::future::Future<Output = (String, mpsc::Receiver<AdapterEvent>, Option<AdapterEvent>)> + Send>>);
        }

        let mut fatal: Option<String> = None;

        'outer: loop {
            let overflow_sleep = async {
                match overflow_deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                inbound_msg = inbound.recv() => {
                    match inbound_msg {
                        None | Some(WsInbound::Close) => break 'outer,
                        Some(WsInbound::Text(_)) => {
                            // Control messages (pong, commands) are voice-mode only here.
                        }
                        Some(WsInbound::Binary(bytes)) => {
                            let frame = match AudioFrame::decode(&bytes) {
                                Ok(f) => f,
                                Err(e) => {
                                    send_error(&outbound, &e.to_string(), None).await;
                                    break 'outer;
                                }
                            };
                            let len = frame.payload.len();
                            let now = Instant::now();
                            backlog.push(now, len);

                            if backlog.queued_bytes(now) > MAX_PCM_QUEUE_BYTES {
                                if overflow_deadline.is_none() {
                                    overflow_deadline = Some(now + OVERFLOW_GRACE);
                                }
                            } else {
                                overflow_deadline = None;
                            }

                            for (_, state) in provider_states.iter_mut() {
                                state.attributor.record_chunk(frame.capture_ts, frame.duration_ms, frame.seq);
                                let meta = ChunkMeta {
                                    capture_ts: frame.capture_ts,
                                    duration_ms: frame.duration_ms,
                                    seq: frame.seq,
                                };
                                if let Some(resampler) = state.resampler.as_mut() {
                                    if resampler.write(meta, &frame.payload).await.is_err() {
                                        fatal = Some(format!("{}: resampler pipe closed", state.name));
                                        break;
                                    }
                                    while let Some(chunk) = resampler.try_next_output() {
                                        state.controller.send_audio(chunk.payload, chunk.meta.capture_ts).await.ok();
                                    }
                                } else {
                                    state.controller.send_audio(frame.payload.clone(), frame.capture_ts).await.ok();
                                }
                            }

                            if fatal.is_some() {
                                break 'outer;
                            }
                        }
                    }
                }

                _ = overflow_sleep, if overflow_deadline.is_some() => {
                    if backlog.queued_bytes(Instant::now()) > MAX_PCM_QUEUE_BYTES {
                        send_error(
                            &outbound,
                            &SessionError::Backpressure { max_bytes: MAX_PCM_QUEUE_BYTES }.to_string(),
                            None,
                        ).await;
                        break 'outer;
                    }
                    overflow_deadline = None;
                }

                next = event_futs.next(), if !event_futs.is_empty() => {
                    let Some((name, mut events, event)) = next else { break 'outer; };
                    match event {
                        None => {
                            // adapter closed without an explicit Closed event.
                        }
                        Some(AdapterEvent::Closed) => {}
                        Some(AdapterEvent::Error(e)) => {
                            if e.is_fatal() {
                                send_error(&outbound, &e.to_string(), Some(name.clone())).await;
                                fatal = Some(name.clone());
                            }
                        }
                        Some(AdapterEvent::Data(transcript)) => {
                            if let Some(state) = provider_states.get_mut(&name) {
                                handle_transcript(
                                    state,
                                    transcript,
                                    degraded,
                                    &mut normalizer,
                                    &mut normalized_seq,
                                    &outbound,
                                    &self.storage,
                                    self.session_id,
                                ).await;
                            }
                        }
                    }
                    if fatal.is_none() {
                        event_futs.push(Box::pin(async move {
                            let ev = events.recv().await;
                            (name, events, ev)
                        })
                            as std::pin::Pin<Box<dyn std::future::Future<Output = (String, mpsc::Receiver<AdapterEvent>, Option<AdapterEvent>)> + Send>>);
                    } else {
                        break 'outer;
                    }
                }
            }
        }

        // Draining.
        for (_, state) in provider_states.iter_mut() {
            if let Some(resampler) = state.resampler.take() {
                let _ = resampler.end().await;
            }
            let _ = state.controller.end().await;
            let _ = state.controller.close().await;
        }

        for (_, state) in provider_states.iter() {
            persist_latency_summary(&self.storage, self.session_id, state).await;
        }

        outbound.send(WsOutbound::Close).await.ok();
        tracing::info!(session_id = %self.session_id, "session_end");
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_transcript(
    state: &mut ProviderState,
    transcript: PartialTranscript,
    degraded: bool,
    normalizer: &mut StreamNormalizer,
    normalized_seq: &mut u64,
    outbound: &mpsc::Sender<WsOutbound>,
    storage: &Arc<dyn Storage>,
    session_id: Uuid,
) {
    let signature = transcript.signature();
    if state.last_signature.as_deref() == Some(signature.as_str()) {
        return;
    }
    state.last_signature = Some(signature);

    let origin_capture_ts = state.attributor.attribute();
    let now = Utc::now().timestamp_millis() as f64;
    let latency_ms = (now - origin_capture_ts).max(0.0);
    state.latencies_ms.push(latency_ms);

    send(
        outbound,
        ServerMessage::Transcript {
            provider: transcript.provider.clone(),
            is_final: transcript.is_final,
            text: transcript.text.clone(),
            words: transcript.words.clone(),
            timestamp: transcript.timestamp,
            channel: transcript.channel,
            latency_ms,
            origin_capture_ts,
            speaker_id: transcript.speaker_id.clone(),
            degraded: if degraded { Some(true) } else { None },
        },
    )
    .await;

    storage
        .log_transcript(TranscriptLogRow {
            id: Uuid::new_v4(),
            created: Utc::now().naive_utc(),
            session_id,
            provider: transcript.provider.clone(),
            window_id: (origin_capture_ts / BUCKET_MS).floor() as i64,
            revision: 0,
            is_final: transcript.is_final,
            text: transcript.text.clone(),
        })
        .await
        .ok();

    let row = normalizer.ingest(&transcript.provider, origin_capture_ts, &transcript.text);
    *normalized_seq += 1;
    send(
        outbound,
        ServerMessage::Normalized {
            normalized_id: *normalized_seq,
            segment_id: format!("{}:{}", row.provider, row.window_id),
            window_id: row.window_id,
            window_start_ms: row.window_id as f64 * BUCKET_MS,
            window_end_ms: (row.window_id as f64 + 1.0) * BUCKET_MS,
            provider: row.provider,
            text_raw: transcript.text,
            text_norm: row.text,
            text_delta: Some(row.text_delta),
            is_final: transcript.is_final,
            revision: row.revision,
            latency_ms: Some(latency_ms),
        },
    )
    .await;
}

async fn persist_latency_summary(storage: &Arc<dyn Storage>, session_id: Uuid, state: &ProviderState) {
    if state.latencies_ms.is_empty() {
        return;
    }
    let mut sorted = state.latencies_ms.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let mean = sum / count as f64;
    let p50 = percentile(&sorted, 0.50);
    let p95 = percentile(&sorted, 0.95);
    let max = *sorted.last().unwrap();

    storage
        .save_latency_summary(LatencySummaryRow {
            id: Uuid::new_v4(),
            created: Utc::now().naive_utc(),
            session_id,
            provider: state.name.clone(),
            sample_count: count as i32,
            mean_latency_ms: mean,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            max_latency_ms: max,
        })
        .await
        .ok();
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

async fn send(outbound: &mpsc::Sender<WsOutbound>, msg: ServerMessage) {
    if let Ok(text) = serde_json::to_string(&msg) {
        outbound.send(WsOutbound::Text(text)).await.ok();
    }
}

async fn send_error(outbound: &mpsc::Sender<WsOutbound>, message: &str, provider: Option<String>) {
    send(
        outbound,
        ServerMessage::Error {
            message: message.to_string(),
            provider,
        },
    )
    .await;
}

trait ClientFacingMessage {
    fn client_message_from_adapter(&self) -> String;
}

impl ClientFacingMessage for crate::error::AdapterError {
    fn client_message_from_adapter(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::mock::MockAdapter;
    use crate::storage::MemoryStorage;

    fn adapters() -> HashMap<String, Arc<dyn ProviderAdapter>> {
        let mut m: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        m.insert("mock".to_string(), Arc::new(MockAdapter));
        m
    }

    #[test]
    fn backlog_window_ages_out_old_bytes() {
        let anchor = Instant::now();
        let mut backlog = Backlog::new();
        backlog.push(anchor, 3 * 1024 * 1024);
        assert!(backlog.queued_bytes(anchor) <= MAX_PCM_QUEUE_BYTES);

        backlog.push(anchor + Duration::from_millis(100), 3 * 1024 * 1024);
        assert!(backlog.queued_bytes(anchor + Duration::from_millis(100)) > MAX_PCM_QUEUE_BYTES);

        // Past the grace window, the first chunk should no longer count.
        let later = anchor + OVERFLOW_GRACE + Duration::from_millis(50);
        assert!(backlog.queued_bytes(later) <= 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn config_then_silent_close_emits_session_then_empty_final() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let storage = Arc::new(MemoryStorage::new());

        let handler = RealtimeSessionHandler {
            session_id: Uuid::new_v4(),
            adapters: adapters(),
            storage: storage.clone(),
            resampler_bin: DEFAULT_RESAMPLER_BIN.to_string(),
        };

        let run = tokio::spawn(handler.run(in_rx, out_tx));

        in_tx
            .send(WsInbound::Text(
                r#"{"pcm":true,"clientSampleRate":16000,"enableInterim":false,"degraded":false}"#
                    .to_string(),
            ))
            .await
            .unwrap();
        in_tx.send(WsInbound::Close).await.unwrap();
        drop(in_tx);

        let mut saw_session = false;
        let mut saw_final_empty = false;
        while let Some(msg) = out_rx.recv().await {
            if let WsOutbound::Text(text) = msg {
                if text.contains("\"type\":\"session\"") {
                    saw_session = true;
                }
                if text.contains("\"type\":\"transcript\"") && text.contains("\"text\":\"\"") {
                    saw_final_empty = true;
                }
            }
        }
        run.await.unwrap();
        assert!(saw_session);
        assert!(saw_final_empty);
    }

    #[tokio::test]
    async fn rejects_binary_before_config() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let storage = Arc::new(MemoryStorage::new());
        let handler = RealtimeSessionHandler {
            session_id: Uuid::new_v4(),
            adapters: adapters(),
            storage,
            resampler_bin: DEFAULT_RESAMPLER_BIN.to_string(),
        };
        let run = tokio::spawn(handler.run(in_rx, out_tx));
        in_tx.send(WsInbound::Binary(vec![0u8; 20])).await.unwrap();
        drop(in_tx);
        let msg = out_rx.recv().await.unwrap();
        run.await.unwrap();
        match msg {
            WsOutbound::Text(text) => assert!(text.contains("\"type\":\"error\"")),
            _ => panic!("expected error text message"),
        }
    }
}
