//! Module C — Provider Adapter capability set (spec §4.C).
//!
//! `ProviderAdapter` is polymorphic over `{startStreaming, transcribeFileFromPCM,
//! supportsStreaming, supportsBatch}`. Event callbacks (`onData`/`onError`/
//! `onClose` in the spec) collapse to a single channel of a tagged
//! `AdapterEvent` enum (see design note §9) so ordering of registration
//! never matters and there's one `mpsc::Receiver` to drain per source.

pub mod http_batch;
pub mod mock;
pub mod ws_realtime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Linear16,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Linear16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Mic,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VadOptions {
    pub silence_duration_ms: u64,
    pub prefix_padding_ms: u64,
    pub threshold: f32,
}

impl Default for VadOptions {
    fn default() -> Self {
        VadOptions {
            silence_duration_ms: 500,
            prefix_padding_ms: 300,
            threshold: 0.5,
        }
    }
}

/// Options a Session Handler passes when starting a streaming or batch
/// transcription (spec §4.C `StreamingOptions`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingOptions {
    pub language: Option<String>,
    pub sample_rate_hz: u32,
    #[serde(default)]
    pub encoding: Encoding,
    pub enable_interim: bool,
    pub enable_vad: bool,
    pub vad: Option<VadOptions>,
    #[serde(default)]
    pub context_phrases: Vec<String>,
    #[serde(default)]
    pub dictionary_phrases: Vec<String>,
    pub punctuation_policy: Option<String>,
    pub model: Option<String>,
    pub batch_model: Option<String>,
    pub fallback_model: Option<String>,
    pub normalize_preset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Word {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// What an adapter emits per utterance hypothesis (spec §3 `PartialTranscript`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialTranscript {
    pub provider: String,
    pub is_final: bool,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
    pub timestamp: f64,
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub punctuation_applied: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub casing_applied: Option<bool>,
}

impl PartialTranscript {
    /// `(channel, isFinal, text)` — the dedup key of spec §3/§4.F.
    pub fn signature(&self) -> String {
        let channel = match self.channel {
            Channel::Mic => "mic",
            Channel::File => "file",
        };
        format!("{}:{}:{}", channel, self.is_final, self.text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub text: String,
    pub words: Option<Vec<Word>>,
}

/// A tagged event, replacing the source's `onData`/`onError`/`onClose`
/// callback registration with a single ordered channel.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Data(PartialTranscript),
    Error(AdapterError),
    Closed,
}

pub(crate) enum AudioCommand {
    SendAudio { chunk: Vec<u8>, capture_ts: f64 },
    End,
    Close,
}

/// Handle used by a Session Handler to feed audio to a running streaming
/// session. Cloning and holding multiple controllers is safe: sends are
/// serialized by the single command-consuming task on the other end,
/// giving the same "tail promise" ordering guarantee as the teacher's
/// per-source mutex pattern without needing an explicit lock here.
#[derive(Clone)]
pub struct StreamingController {
    commands: mpsc::Sender<AudioCommand>,
}

impl StreamingController {
    pub async fn send_audio(&self, chunk: Vec<u8>, capture_ts: f64) -> Result<(), AdapterError> {
        self.commands
            .send(AudioCommand::SendAudio { chunk, capture_ts })
            .await
            .map_err(|_| AdapterError::Fatal("adapter task is gone".to_string()))
    }

    pub async fn end(&self) -> Result<(), AdapterError> {
        self.commands
            .send(AudioCommand::End)
            .await
            .map_err(|_| AdapterError::Fatal("adapter task is gone".to_string()))
    }

    pub async fn close(&self) -> Result<(), AdapterError> {
        self.commands
            .send(AudioCommand::Close)
            .await
            .map_err(|_| AdapterError::Fatal("adapter task is gone".to_string()))
    }
}

pub struct StreamingSession {
    pub controller: StreamingController,
    pub events: mpsc::Receiver<AdapterEvent>,
}

/// Uniform streaming + batch contract over provider-specific protocols
/// (spec §4.C). Default methods fail loudly for adapters that only
/// implement one of the two capabilities, mirroring the
/// `supportsStreaming`/`supportsBatch` flags in the source spec.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_streaming(&self) -> bool {
        false
    }

    fn supports_batch(&self) -> bool {
        false
    }

    /// `None` means the provider accepts the client's native rate.
    fn required_sample_rate(&self) -> Option<u32> {
        None
    }

    async fn start_streaming(
        &self,
        _opts: StreamingOptions,
    ) -> Result<StreamingSession, AdapterError> {
        Err(AdapterError::Fatal(format!(
            "{} does not support streaming",
            self.name()
        )))
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

pub(crate) fn new_controller_channel(
    buffer: usize,
) -> (StreamingController, mpsc::Receiver<AudioCommand>) {
    let (tx, rx) = mpsc::channel(buffer);
    (StreamingController { commands: tx }, rx)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_matches_spec_grammar() {
        let t = PartialTranscript {
            provider: "mock".into(),
            is_final: true,
            text: "hello".into(),
            words: None,
            timestamp: 0.0,
            channel: Channel::Mic,
            speaker_id: None,
            confidence: None,
            punctuation_applied: None,
            casing_applied: None,
        };
        assert_eq!(t.signature(), "mic:true:hello");
    }
}
