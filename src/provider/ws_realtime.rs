//! WS-Realtime provider adapter (spec §4.C.1) — the hard state machine.
//!
//! Grounded on the OpenAI Realtime transcription protocol as exercised by
//! the pack's own realtime providers (`openai_realtime.rs`): connect, send
//! one `session.update`, gate on both `session.created` and
//! `session.updated`, stream base64 PCM as `input_audio_buffer.append`,
//! either let server VAD commit or schedule a manual commit, and reorder
//! completions into audio order before handing finals upstream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::spawn;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use super::{
    AdapterEvent, AudioCommand, BatchResult, Channel, PartialTranscript, ProviderAdapter, Word,
    StreamingOptions, StreamingSession, new_controller_channel,
};
use crate::error::AdapterError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WS_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const MANUAL_COMMIT_DELAY: Duration = Duration::from_secs(1);
const HIGH_WATER_BYTES: usize = 5 * 1024 * 1024;
const BACKOFF_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WsRealtimeConfig {
    pub ws_url: String,
    pub api_key_env: String,
    pub model: &'static str,
    pub required_sample_rate: u32,
    pub provider_name: &'static str,
}

impl Default for WsRealtimeConfig {
    fn default() -> Self {
        WsRealtimeConfig {
            ws_url: "wss://api.openai.com/v1/realtime?intent=transcription".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-transcribe",
            required_sample_rate: 24_000,
            provider_name: "openai-realtime",
        }
    }
}

pub struct WsRealtimeAdapter {
    config: WsRealtimeConfig,
}

impl WsRealtimeAdapter {
    pub fn new(config: WsRealtimeConfig) -> Self {
        WsRealtimeAdapter { config }
    }
}

#[async_trait]
impl ProviderAdapter for WsRealtimeAdapter {
    fn name(&self) -> &'static str {
        self.config.provider_name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_batch(&self) -> bool {
        false
    }

    fn required_sample_rate(&self) -> Option<u32> {
        Some(self.config.required_sample_rate)
    }

    async fn start_streaming(
        &self,
        opts: StreamingOptions,
    ) -> Result<StreamingSession, AdapterError> {
        if opts.sample_rate_hz != self.config.required_sample_rate {
            return Err(AdapterError::InvalidSampleRate {
                requested: opts.sample_rate_hz,
                required: self.config.required_sample_rate,
            });
        }

        let api_key = env::var(&self.config.api_key_env)
            .map_err(|_| AdapterError::MissingCredentials(self.config.provider_name.to_string()))?;

        let mut request = self
            .config
            .ws_url
            .clone()
            .into_client_request()
            .map_err(|e| AdapterError::Fatal(e.to_string()))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| AdapterError::Fatal(e.to_string()))?,
        );

        let (ws_stream, _response) = timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| AdapterError::ConnectTimeout)?
            .map_err(|e| AdapterError::Fatal(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let prompt = dedup_prompt(&opts.context_phrases, &opts.dictionary_phrases);
        let session_update = SessionUpdate {
            kind: "session.update",
            session: SessionPayload {
                input_audio_format: "pcm16",
                input_audio_noise_reduction: NoiseReduction { kind: "near_field" },
                input_audio_transcription: TranscriptionConfig {
                    model: self.config.model.to_string(),
                    language: opts.language.clone(),
                    prompt,
                },
                turn_detection: opts.vad.as_ref().map(|v| TurnDetection {
                    kind: "server_vad",
                    silence_duration_ms: v.silence_duration_ms,
                    prefix_padding_ms: v.prefix_padding_ms,
                    threshold: v.threshold,
                }),
            },
        };
        write
            .send(Message::Text(
                serde_json::to_string(&session_update)
                    .map_err(|e| AdapterError::Fatal(e.to_string()))?,
            ))
            .await
            .map_err(|e| AdapterError::Fatal(e.to_string()))?;

        // Ready gate: both `session.created` and `session.updated` (or the
        // legacy `transcription_session.*` equivalents) must be observed.
        let ready = timeout(CONNECT_TIMEOUT, async {
            let mut created = false;
            let mut updated = false;
            while !(created || updated) || !(created && updated) {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event: RawEvent = match serde_json::from_str(&text) {
                            Ok(e) => e,
                            Err(_) => continue,
                        };
                        match event.kind.as_str() {
                            "session.created" | "transcription_session.created" => created = true,
                            "session.updated" | "transcription_session.updated" => updated = true,
                            "error" => {
                                let msg = event
                                    .error
                                    .map(|e| e.message)
                                    .unwrap_or_else(|| "unknown provider error".to_string());
                                return Err(AdapterError::Fatal(msg));
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(AdapterError::StreamClosed {
                            code: frame.as_ref().map(|f| f.code.into()),
                            reason: frame.map(|f| f.reason.to_string()),
                        });
                    }
                    Some(Err(e)) => return Err(AdapterError::Fatal(e.to_string())),
                    None => {
                        return Err(AdapterError::StreamClosed {
                            code: None,
                            reason: None,
                        });
                    }
                    _ => {}
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| AdapterError::ConnectTimeout)??;
        let _ = ready;

        let (controller, commands) = new_controller_channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let enable_interim = opts.enable_interim;
        let server_vad = opts.vad.is_some();
        let min_buffered_bytes = (opts.sample_rate_hz as usize * 2 * 100) / 1000;
        // Per-session: approximates this session's own provider-socket
        // buffered-amount, incremented before a send and decremented once
        // the send future resolves.
        let bytes_in_flight = Arc::new(AtomicUsize::new(0));

        spawn(run_session(
            write,
            read,
            commands,
            event_tx,
            enable_interim,
            server_vad,
            min_buffered_bytes,
            bytes_in_flight,
        ));

        Ok(StreamingSession {
            controller,
            events: event_rx,
        })
    }

    async fn transcribe_file_from_pcm(
        &self,
        _pcm: Vec<u8>,
        _opts: StreamingOptions,
    ) -> Result<BatchResult, AdapterError> {
        Err(AdapterError::Fatal(format!(
            "{} does not support batch",
            self.name()
        )))
    }
}

fn dedup_prompt(context_phrases: &[String], dictionary_phrases: &[String]) -> Option<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for phrase in context_phrases.iter().chain(dictionary_phrases.iter()) {
        if seen.insert(phrase.clone()) {
            ordered.push(phrase.clone());
        }
    }
    if ordered.is_empty() {
        None
    } else {
        Some(ordered.join(", "))
    }
}

// ---- wire protocol -------------------------------------------------------

#[derive(Serialize)]
struct SessionUpdate {
    #[serde(rename = "type")]
    kind: &'static str,
    session: SessionPayload,
}

#[derive(Serialize)]
struct SessionPayload {
    input_audio_format: &'static str,
    input_audio_noise_reduction: NoiseReduction,
    input_audio_transcription: TranscriptionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_detection: Option<TurnDetection>,
}

#[derive(Serialize)]
struct NoiseReduction {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct TranscriptionConfig {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
}

#[derive(Serialize)]
struct TurnDetection {
    #[serde(rename = "type")]
    kind: &'static str,
    silence_duration_ms: u64,
    prefix_padding_ms: u64,
    threshold: f32,
}

#[derive(Serialize)]
struct AudioAppend {
    #[serde(rename = "type")]
    kind: &'static str,
    audio: String,
}

#[derive(Serialize)]
struct AudioCommit {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize, Default)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    previous_item_id: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    error: Option<RawProviderError>,
}

#[derive(Deserialize)]
struct RawProviderError {
    message: String,
}

// ---- ordered finalization -------------------------------------------------

/// Reorders `conversation.item.*` completions into audio order regardless
/// of arrival order (spec §4.C.1 step 8).
#[derive(Default)]
struct FinalizeOrderer {
    next_of: HashMap<String, String>,
    known: HashSet<String>,
    completed: HashMap<String, String>,
    skipped: HashSet<String>,
    cursor: Option<String>,
    cursor_set: bool,
}

impl FinalizeOrderer {
    fn register(&mut self, item_id: &str, previous_item_id: Option<&str>) {
        if self.known.contains(item_id) {
            return;
        }
        self.known.insert(item_id.to_string());
        if let Some(prev) = previous_item_id {
            self.next_of.insert(prev.to_string(), item_id.to_string());
        }
        if !self.cursor_set {
            let is_head = match previous_item_id {
                None => true,
                Some(prev) => !self.known.contains(prev) && prev != item_id,
            };
            if is_head {
                self.cursor = Some(item_id.to_string());
                self.cursor_set = true;
            }
        }
    }

    fn complete(&mut self, item_id: &str, text: &str) {
        if text.trim().is_empty() {
            self.skipped.insert(item_id.to_string());
        } else {
            self.completed.insert(item_id.to_string(), text.to_string());
        }
    }

    fn fail(&mut self, item_id: &str) {
        self.completed.remove(item_id);
        self.skipped.remove(item_id);
    }

    /// Drains every item that has become ready, in order, advancing the
    /// cursor through skipped (empty) items without emitting them.
    fn drain_ready(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            let Some(cur) = self.cursor.clone() else {
                break;
            };
            if self.skipped.contains(&cur) {
                self.cursor = self.next_of.get(&cur).cloned();
                continue;
            }
            if let Some(text) = self.completed.remove(&cur) {
                out.push(text);
                self.cursor = self.next_of.get(&cur).cloned();
            } else {
                break;
            }
        }
        out
    }
}

// ---- session task ---------------------------------------------------------

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut write: WsWrite,
    mut read: WsRead,
    mut commands: mpsc::Receiver<AudioCommand>,
    events: mpsc::Sender<AdapterEvent>,
    enable_interim: bool,
    server_vad: bool,
    min_buffered_bytes: usize,
    bytes_in_flight: Arc<AtomicUsize>,
) {
    let mut accumulators: HashMap<String, String> = HashMap::new();
    let mut orderer = FinalizeOrderer::default();
    let mut has_buffered_audio = false;
    let mut buffered_bytes: usize = 0;
    let mut commit_deadline: Option<Instant> = None;
    let mut ended = false;
    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    let mut pending_odd_byte: Option<u8> = None;

    'outer: loop {
        let sleep_until_commit = async {
            match commit_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    None => break 'outer,
                    Some(AudioCommand::SendAudio { chunk, capture_ts: _ }) => {
                        if ended { continue; }
                        let mut aligned = Vec::with_capacity(chunk.len() + 1);
                        if let Some(b) = pending_odd_byte.take() {
                            aligned.push(b);
                        }
                        aligned.extend_from_slice(&chunk);
                        if aligned.len() % 2 != 0 {
                            pending_odd_byte = aligned.pop();
                        }
                        if aligned.is_empty() {
                            continue;
                        }

                        while bytes_in_flight.load(Ordering::Acquire) > HIGH_WATER_BYTES {
                            sleep(BACKOFF_STEP).await;
                        }

                        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(&aligned);
                        let append = AudioAppend { kind: "input_audio_buffer.append", audio: audio_b64 };
                        let payload_len = aligned.len();
                        bytes_in_flight.fetch_add(payload_len, Ordering::AcqRel);
                        let send_result = match serde_json::to_string(&append) {
                            Ok(text) => write.send(Message::Text(text)).await,
                            Err(_) => Ok(()),
                        };
                        bytes_in_flight.fetch_sub(payload_len, Ordering::AcqRel);
                        if send_result.is_err() {
                            events.send(AdapterEvent::Error(AdapterError::Fatal("provider socket closed".into()))).await.ok();
                            break 'outer;
                        }

                        has_buffered_audio = true;
                        buffered_bytes += payload_len;

                        if !server_vad && commit_deadline.is_none() {
                            commit_deadline = Some(Instant::now() + MANUAL_COMMIT_DELAY);
                        }
                    }
                    Some(AudioCommand::End) => {
                        if !ended {
                            ended = true;
                            if has_buffered_audio {
                                send_commit(&mut write).await.ok();
                                has_buffered_audio = false;
                                buffered_bytes = 0;
                            }
                            commit_deadline = None;
                        }
                    }
                    Some(AudioCommand::Close) => {
                        if has_buffered_audio {
                            send_commit(&mut write).await.ok();
                            has_buffered_audio = false;
                            buffered_bytes = 0;
                        }
                        let _ = write.send(Message::Close(None)).await;
                        let _ = timeout(WS_CLOSE_TIMEOUT, async {
                            while let Some(Ok(msg)) = read.next().await {
                                if matches!(msg, Message::Close(_)) {
                                    break;
                                }
                            }
                        }).await;
                        events.send(AdapterEvent::Closed).await.ok();
                        break 'outer;
                    }
                }
            }

            _ = sleep_until_commit, if commit_deadline.is_some() => {
                commit_deadline = None;
                if !server_vad && has_buffered_audio && buffered_bytes >= min_buffered_bytes {
                    send_commit(&mut write).await.ok();
                    has_buffered_audio = false;
                    buffered_bytes = 0;
                }
            }

            _ = keepalive.tick() => {
                let _ = write.send(Message::Ping(Vec::new())).await;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let event: RawEvent = match serde_json::from_str(&text) {
                            Ok(e) => e,
                            Err(_) => continue,
                        };
                        handle_provider_event(
                            event,
                            &events,
                            &mut accumulators,
                            &mut orderer,
                            enable_interim,
                        ).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame.map(|f| f.reason.to_string());
                        let normal = matches!(code, Some(1000) | Some(1005) | None) && reason.as_deref().unwrap_or("").is_empty();
                        if !normal {
                            events.send(AdapterEvent::Error(AdapterError::StreamClosed { code, reason })).await.ok();
                        }
                        events.send(AdapterEvent::Closed).await.ok();
                        break 'outer;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        events.send(AdapterEvent::Error(AdapterError::Fatal(e.to_string()))).await.ok();
                        break 'outer;
                    }
                    None => {
                        events.send(AdapterEvent::Closed).await.ok();
                        break 'outer;
                    }
                }
            }
        }
    }
}

async fn send_commit(write: &mut WsWrite) -> Result<(), ()> {
    let commit = AudioCommit {
        kind: "input_audio_buffer.commit",
    };
    let text = serde_json::to_string(&commit).map_err(|_| ())?;
    write.send(Message::Text(text)).await.map_err(|_| ())
}

async fn handle_provider_event(
    event: RawEvent,
    events: &mpsc::Sender<AdapterEvent>,
    accumulators: &mut HashMap<String, String>,
    orderer: &mut FinalizeOrderer,
    enable_interim: bool,
) {
    match event.kind.as_str() {
        "conversation.item.created" => {
            if let Some(item_id) = &event.item_id {
                orderer.register(item_id, event.previous_item_id.as_deref());
            }
        }
        "input_audio_buffer.committed" => {
            if let Some(item_id) = &event.item_id {
                orderer.register(item_id, event.previous_item_id.as_deref());
            }
        }
        "input_audio_buffer.cleared" => {
            // Resetting hasBufferedAudio/bufferedBytes happens at commit
            // *issuance*, never here — see the late-commit race note in
            // spec §4.C.1 step 6. This event carries no further action.
        }
        "conversation.item.input_audio_transcription.delta" => {
            if let (Some(item_id), Some(delta)) = (&event.item_id, &event.delta) {
                let entry = accumulators.entry(item_id.clone()).or_default();
                entry.push_str(delta);
                if enable_interim {
                    events
                        .send(AdapterEvent::Data(PartialTranscript {
                            provider: "ws-realtime".to_string(),
                            is_final: false,
                            text: entry.clone(),
                            words: None,
                            timestamp: 0.0,
                            channel: Channel::Mic,
                            speaker_id: None,
                            confidence: None,
                            punctuation_applied: None,
                            casing_applied: None,
                        }))
                        .await
                        .ok();
                }
            }
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(item_id) = &event.item_id {
                orderer.register(item_id, event.previous_item_id.as_deref());
                let text = event
                    .transcript
                    .or_else(|| accumulators.get(item_id).cloned())
                    .unwrap_or_default();
                accumulators.remove(item_id);
                orderer.complete(item_id, &text);
                for final_text in orderer.drain_ready() {
                    events
                        .send(AdapterEvent::Data(PartialTranscript {
                            provider: "ws-realtime".to_string(),
                            is_final: true,
                            text: final_text,
                            words: finalize_words(),
                            timestamp: 0.0,
                            channel: Channel::Mic,
                            speaker_id: None,
                            confidence: None,
                            punctuation_applied: None,
                            casing_applied: None,
                        }))
                        .await
                        .ok();
                }
            }
        }
        "conversation.item.input_audio_transcription.failed" => {
            if let Some(item_id) = &event.item_id {
                accumulators.remove(item_id);
                orderer.fail(item_id);
            }
        }
        "error" => {
            let message = event
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown provider error".to_string());
            if message.to_ascii_lowercase().contains("buffer too small") {
                tracing::debug!(message = %message, "benign commit race, swallowed");
            } else {
                events
                    .send(AdapterEvent::Error(AdapterError::Fatal(message)))
                    .await
                    .ok();
            }
        }
        _ => {}
    }
}

fn finalize_words() -> Option<Vec<Word>> {
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dedup_prompt_unions_and_dedups() {
        let ctx = vec!["alpha".to_string(), "beta".to_string()];
        let dict = vec!["beta".to_string(), "gamma".to_string()];
        assert_eq!(dedup_prompt(&ctx, &dict), Some("alpha, beta, gamma".to_string()));
    }

    #[test]
    fn dedup_prompt_empty_is_none() {
        assert_eq!(dedup_prompt(&[], &[]), None);
    }

    #[test]
    fn out_of_order_completions_emit_in_audio_order() {
        let mut orderer = FinalizeOrderer::default();
        orderer.register("a", None);
        orderer.register("b", Some("a"));
        // B completes before A.
        orderer.complete("b", "second");
        assert!(orderer.drain_ready().is_empty());
        orderer.complete("a", "first");
        assert_eq!(orderer.drain_ready(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn empty_completion_is_skipped_but_advances_cursor() {
        let mut orderer = FinalizeOrderer::default();
        orderer.register("a", None);
        orderer.register("b", Some("a"));
        orderer.complete("a", "   ");
        orderer.complete("b", "hello");
        assert_eq!(orderer.drain_ready(), vec!["hello".to_string()]);
    }

    #[test]
    fn failed_item_drops_any_pending_completion() {
        let mut orderer = FinalizeOrderer::default();
        orderer.register("a", None);
        orderer.complete("a", "partial");
        orderer.fail("a");
        assert!(orderer.drain_ready().is_empty());
    }
}
