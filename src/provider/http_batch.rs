//! HTTP-Batch provider adapter (spec §4.C.2).
//!
//! Collects PCM in memory for the lifetime of one session, wraps it in a
//! minimal WAV header on `end()`, and posts it as multipart form data.
//! Falls back once to a secondary model when the primary model's response
//! is non-2xx and the two models differ.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::spawn;
use tokio::time::timeout;

use super::{
    AdapterEvent, AudioCommand, BatchResult, ProviderAdapter, StreamingOptions, StreamingSession,
    Word, new_controller_channel,
};
use crate::error::AdapterError;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const HARD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct HttpBatchConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub default_model: String,
    pub provider_name: &'static str,
}

impl Default for HttpBatchConfig {
    fn default() -> Self {
        HttpBatchConfig {
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            default_model: "whisper-1".to_string(),
            provider_name: "http-batch",
        }
    }
}

pub struct HttpBatchAdapter {
    config: HttpBatchConfig,
    client: Client,
}

impl HttpBatchAdapter {
    pub fn new(config: HttpBatchConfig) -> Self {
        HttpBatchAdapter {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpBatchAdapter {
    fn name(&self) -> &'static str {
        self.config.provider_name
    }

    fn supports_streaming(&self) -> bool {
        // The session handler feeds audio incrementally even to a batch
        // provider; this adapter just accumulates rather than forwarding.
        true
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn start_streaming(
        &self,
        opts: StreamingOptions,
    ) -> Result<StreamingSession, AdapterError> {
        let (controller, mut commands) = new_controller_channel(64);
        let (event_tx, event_rx) = mpsc::channel(8);

        let client = self.client.clone();
        let config = self.config.clone();

        spawn(async move {
            let mut pcm = Vec::new();
            while let Some(cmd) = commands.recv().await {
                match cmd {
                    AudioCommand::SendAudio { mut chunk, .. } => {
                        pcm.append(&mut chunk);
                    }
                    AudioCommand::End => {
                        let result = run_batch(&client, &config, pcm.clone(), &opts).await;
                        match result {
                            Ok(batch) => {
                                let transcript = super::PartialTranscript {
                                    provider: config.provider_name.to_string(),
                                    is_final: true,
                                    text: batch.text,
                                    words: batch.words,
                                    timestamp: 0.0,
                                    channel: super::Channel::Mic,
                                    speaker_id: None,
                                    confidence: None,
                                    punctuation_applied: None,
                                    casing_applied: None,
                                };
                                event_tx.send(AdapterEvent::Data(transcript)).await.ok();
                            }
                            Err(e) => {
                                event_tx.send(AdapterEvent::Error(e)).await.ok();
                            }
                        }
                    }
                    AudioCommand::Close => {
                        event_tx.send(AdapterEvent::Closed).await.ok();
                        break;
                    }
                }
            }
        });

        Ok(StreamingSession {
            controller,
            events: event_rx,
        })
    }

    async fn transcribe_file_from_pcm(
        &self,
        pcm: Vec<u8>,
        opts: StreamingOptions,
    ) -> Result<BatchResult, AdapterError> {
        run_batch(&self.client, &self.config, pcm, &opts).await
    }
}

async fn run_batch(
    client: &Client,
    config: &HttpBatchConfig,
    pcm: Vec<u8>,
    opts: &StreamingOptions,
) -> Result<BatchResult, AdapterError> {
    let api_key = std::env::var(&config.api_key_env)
        .map_err(|_| AdapterError::MissingCredentials(config.provider_name.to_string()))?;

    let sample_rate = if opts.sample_rate_hz == 0 {
        16_000
    } else {
        opts.sample_rate_hz
    };
    let wav = wrap_wav(&pcm, sample_rate);

    let primary_model = opts
        .batch_model
        .clone()
        .unwrap_or_else(|| config.default_model.clone());

    match post_once(client, config, &api_key, &wav, &primary_model, opts).await {
        Ok(result) => Ok(result),
        Err(primary_err) => match &opts.fallback_model {
            Some(fallback) if fallback != &primary_model => {
                post_once(client, config, &api_key, &wav, fallback, opts).await
            }
            _ => Err(primary_err),
        },
    }
}

async fn post_once(
    client: &Client,
    config: &HttpBatchConfig,
    api_key: &str,
    wav: &[u8],
    model: &str,
    opts: &StreamingOptions,
) -> Result<BatchResult, AdapterError> {
    let response_format = if model_supports_word_timestamps(model) {
        "verbose_json"
    } else {
        "json"
    };

    let mut form = Form::new()
        .part(
            "file",
            Part::bytes(wav.to_vec())
                .file_name("audio.wav")
                .mime_str("audio/wav")
                .map_err(|e| AdapterError::Fatal(e.to_string()))?,
        )
        .text("model", model.to_string())
        .text("chunking_strategy", "auto")
        .text("response_format", response_format.to_string());

    if let Some(language) = &opts.language {
        form = form.text("language", language.clone());
    }
    if let Some(prompt) = dedup_prompt(&opts.context_phrases, &opts.dictionary_phrases) {
        form = form.text("prompt", prompt);
    }

    let request = client
        .post(&config.endpoint)
        .bearer_auth(api_key)
        .multipart(form)
        .send();

    let idle = timeout(IDLE_TIMEOUT, request);
    let response = timeout(HARD_TIMEOUT, idle)
        .await
        .map_err(|_| AdapterError::Fatal("batch request exceeded hard timeout".to_string()))?
        .map_err(|_| AdapterError::Fatal("batch request idle timeout".to_string()))?
        .map_err(|e| AdapterError::Transient(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AdapterError::Transient(format!(
            "batch provider returned {status}: {body}"
        )));
    }

    let parsed: BatchResponse = response
        .json()
        .await
        .map_err(|e| AdapterError::Fatal(e.to_string()))?;

    let words = parsed.words.or_else(|| {
        parsed.segments.map(|segments| {
            segments
                .into_iter()
                .flat_map(|s| s.words.unwrap_or_default())
                .collect()
        })
    });

    Ok(BatchResult {
        text: parsed.text,
        words,
    })
}

fn model_supports_word_timestamps(model: &str) -> bool {
    model.contains("whisper")
}

fn dedup_prompt(context_phrases: &[String], dictionary_phrases: &[String]) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
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

/// Wraps raw mono PCM16 in a minimal 44-byte RIFF/WAVE header.
fn wrap_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * 2;
    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

#[derive(Deserialize)]
struct BatchResponse {
    text: String,
    #[serde(default)]
    words: Option<Vec<Word>>,
    #[serde(default)]
    segments: Option<Vec<BatchSegment>>,
}

#[derive(Deserialize)]
struct BatchSegment {
    #[serde(default)]
    words: Option<Vec<Word>>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wav_header_declares_correct_lengths() {
        let pcm = vec![0u8; 100];
        let wav = wrap_wav(&pcm, 16_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(wav[4..8].try_into().unwrap()), 36 + 100);
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 100);
        assert_eq!(wav.len(), 144);
    }

    #[test]
    fn dedup_prompt_unions_context_and_dictionary() {
        let ctx = vec!["alpha".to_string()];
        let dict = vec!["alpha".to_string(), "beta".to_string()];
        assert_eq!(dedup_prompt(&ctx, &dict), Some("alpha, beta".to_string()));
    }

    #[test]
    fn whisper_model_gets_verbose_json() {
        assert!(model_supports_word_timestamps("whisper-1"));
        assert!(!model_supports_word_timestamps("gpt-4o-transcribe"));
    }
}
