//! Module F/G — Session Handlers (spec §4.F, §4.G) and the wire message
//! types they speak (spec §6).

pub mod realtime;
pub mod replay;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::NormalizePreset;
use crate::provider::{Channel, VadOptions, Word};

/// First client message on every realtime/replay WS (spec §3 `StreamingConfig`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    #[serde(default)]
    pub pcm: bool,
    #[serde(default)]
    pub client_sample_rate: Option<u32>,
    #[serde(default)]
    pub enable_interim: bool,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub normalize_preset: Option<String>,
    #[serde(default)]
    pub context_phrases: Vec<String>,
    #[serde(default)]
    pub options: StreamingConfigOptions,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfigOptions {
    #[serde(default)]
    pub punctuation_policy: Option<String>,
    #[serde(default)]
    pub enable_vad: bool,
    #[serde(default)]
    pub dictionary_phrases: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub vad: Option<VadOptions>,
    #[serde(default)]
    pub meeting_mode: bool,
    #[serde(default)]
    pub wake_words: Vec<String>,
    #[serde(default)]
    pub meeting_require_wake_word: bool,
    #[serde(default)]
    pub finalize_delay_ms: Option<u64>,
    #[serde(default)]
    pub echo_suppress_ms: Option<u64>,
    #[serde(default)]
    pub echo_similarity: Option<f32>,
    #[serde(default)]
    pub meeting_open_window_ms: Option<u64>,
    #[serde(default)]
    pub meeting_cooldown_ms: Option<u64>,
    #[serde(default)]
    pub meeting_output_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u8,
    pub format: &'static str,
}

/// Server → client control/data messages (spec §6). Tagged so the client
/// can dispatch on `type` without guessing field shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session")]
    Session {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        provider: String,
        #[serde(rename = "startedAt")]
        started_at: i64,
        #[serde(rename = "inputSampleRate")]
        input_sample_rate: u32,
        #[serde(rename = "audioSpec")]
        audio_spec: AudioSpec,
    },
    #[serde(rename = "transcript")]
    Transcript {
        provider: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        words: Option<Vec<Word>>,
        timestamp: f64,
        channel: Channel,
        #[serde(rename = "latencyMs")]
        latency_ms: f64,
        #[serde(rename = "originCaptureTs")]
        origin_capture_ts: f64,
        #[serde(skip_serializing_if = "Option::is_none", rename = "speakerId")]
        speaker_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        degraded: Option<bool>,
    },
    #[serde(rename = "normalized")]
    Normalized {
        #[serde(rename = "normalizedId")]
        normalized_id: u64,
        #[serde(rename = "segmentId")]
        segment_id: String,
        #[serde(rename = "windowId")]
        window_id: i64,
        #[serde(rename = "windowStartMs")]
        window_start_ms: f64,
        #[serde(rename = "windowEndMs")]
        window_end_ms: f64,
        provider: String,
        #[serde(rename = "textRaw")]
        text_raw: String,
        #[serde(rename = "textNorm")]
        text_norm: String,
        #[serde(skip_serializing_if = "Option::is_none", rename = "textDelta")]
        text_delta: Option<String>,
        #[serde(rename = "isFinal")]
        is_final: bool,
        revision: u32,
        #[serde(skip_serializing_if = "Option::is_none", rename = "latencyMs")]
        latency_ms: Option<f64>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
}

/// Client → server control messages other than raw binary audio frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControlMessage {
    Command {
        name: VoiceCommandName,
        #[serde(default, rename = "playedMs")]
        played_ms: Option<u64>,
    },
    Pong,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceCommandName {
    StopSpeaking,
    BargeIn,
    ResetHistory,
}

/// What the query string / config resolve into before the pipeline starts.
#[derive(Debug, Clone)]
pub struct ResolvedSessionParams {
    pub provider_names: Vec<String>,
    pub lang: Option<String>,
    pub preset: Option<NormalizePreset>,
}

/// A single parsed `?k=v&...` query string, as warp hands the filter.
pub fn providers_from_query(query: &HashMap<String, String>) -> Vec<String> {
    if let Some(csv) = query.get("providers") {
        csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
    } else if let Some(single) = query.get("provider") {
        vec![single.clone()]
    } else {
        vec![]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn providers_query_prefers_csv_list() {
        let mut q = HashMap::new();
        q.insert("providers".to_string(), "mock, other".to_string());
        assert_eq!(providers_from_query(&q), vec!["mock".to_string(), "other".to_string()]);
    }

    #[test]
    fn providers_query_falls_back_to_single() {
        let mut q = HashMap::new();
        q.insert("provider".to_string(), "mock".to_string());
        assert_eq!(providers_from_query(&q), vec!["mock".to_string()]);
    }
}
