//! `mock` provider adapter (spec §4.C: "Variants minimally required:
//! mock, wsRealtime, httpBatch"). Used by tests and by a `dev` deployment
//! where no real provider credentials are configured.
//!
//! Emits one interim transcript per `sendAudio` call (if `enableInterim`)
//! and one final transcript on `end()`, so the ordering/backpressure tests
//! around the Session Handler don't need a real socket.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::spawn;

use super::{
    AdapterEvent, AudioCommand, BatchResult, Channel, PartialTranscript, ProviderAdapter,
    StreamingOptions, StreamingSession, new_controller_channel,
};
use crate::error::AdapterError;

#[derive(Debug, Clone, Default)]
pub struct MockAdapter;

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_streaming(&self) -> bool {
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
        let (event_tx, event_rx) = mpsc::channel(64);

        spawn(async move {
            let mut accumulated = String::new();
            let mut byte_count: usize = 0;

            while let Some(cmd) = commands.recv().await {
                match cmd {
                    AudioCommand::SendAudio { chunk, capture_ts } => {
                        byte_count += chunk.len();
                        if !accumulated.is_empty() {
                            accumulated.push(' ');
                        }
                        accumulated.push_str("speech");
                        if opts.enable_interim {
                            let event = AdapterEvent::Data(PartialTranscript {
                                provider: "mock".to_string(),
                                is_final: false,
                                text: accumulated.clone(),
                                words: None,
                                timestamp: capture_ts,
                                channel: Channel::Mic,
                                speaker_id: None,
                                confidence: None,
                                punctuation_applied: None,
                                casing_applied: None,
                            });
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    AudioCommand::End => {
                        let text = if byte_count == 0 {
                            String::new()
                        } else {
                            accumulated.clone()
                        };
                        let event = AdapterEvent::Data(PartialTranscript {
                            provider: "mock".to_string(),
                            is_final: true,
                            text,
                            words: None,
                            timestamp: 0.0,
                            channel: Channel::Mic,
                            speaker_id: None,
                            confidence: None,
                            punctuation_applied: None,
                            casing_applied: None,
                        });
                        event_tx.send(event).await.ok();
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
        _opts: StreamingOptions,
    ) -> Result<BatchResult, AdapterError> {
        let text = if pcm.is_empty() {
            String::new()
        } else {
            "speech".to_string()
        };
        Ok(BatchResult { text, words: None })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn emits_empty_final_for_silent_session() {
        let adapter = MockAdapter;
        let mut session = adapter
            .start_streaming(StreamingOptions {
                enable_interim: false,
                ..Default::default()
            })
            .await
            .unwrap();
        session.controller.end().await.unwrap();
        let event = session.events.recv().await.unwrap();
        match event {
            AdapterEvent::Data(t) => {
                assert!(t.is_final);
                assert_eq!(t.text, "");
            }
            _ => panic!("expected Data event"),
        }
    }

    #[tokio::test]
    async fn emits_final_with_text_after_audio() {
        let adapter = MockAdapter;
        let mut session = adapter
            .start_streaming(StreamingOptions::default())
            .await
            .unwrap();
        session
            .controller
            .send_audio(vec![0u8; 8000], 1_000.0)
            .await
            .unwrap();
        session.controller.end().await.unwrap();
        let event = session.events.recv().await.unwrap();
        match event {
            AdapterEvent::Data(t) => assert!(t.is_final && !t.text.is_empty()),
            _ => panic!("expected Data event"),
        }
    }
}
