//! Module G — Replay Session Handler (spec §4.G).
//!
//! Identical orchestration to the realtime handler, except the audio
//! source is a file's own frames rather than live client binary messages.
//! Reuses `RealtimeSessionHandler::run` by synthesizing `WsInbound::Binary`
//! frames on the same channel a live socket would otherwise feed, so the
//! two handlers cannot drift in behavior.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::frame::AudioFrame;
use crate::provider::ProviderAdapter;
use crate::storage::Storage;

use super::realtime::{RealtimeSessionHandler, WsInbound, WsOutbound};
use super::StreamingConfig;

/// A previously uploaded file's frames, resolved elsewhere from
/// `sessionId` (spec §4.G: "the upload itself is out of scope").
pub struct ReplaySource {
    pub frames: Vec<AudioFrame>,
}

pub struct ReplaySessionHandler {
    pub session_id: Uuid,
    pub adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    pub storage: Arc<dyn Storage>,
    pub resampler_bin: String,
}

impl ReplaySessionHandler {
    pub async fn run(
        self,
        config: StreamingConfig,
        source: ReplaySource,
        outbound: mpsc::Sender<WsOutbound>,
    ) {
        let (feed_tx, feed_rx) = mpsc::channel(32);

        let inner = RealtimeSessionHandler {
            session_id: self.session_id,
            adapters: self.adapters,
            storage: self.storage,
            resampler_bin: self.resampler_bin,
        };

        let config_text = serde_json::to_string(&config).unwrap_or_else(|_| "{}".to_string());
        let drive = tokio::spawn(async move {
            feed_tx
                .send(WsInbound::Text(config_text))
                .await
                .ok();
            for frame in source.frames {
                feed_tx
                    .send(WsInbound::Binary(frame.encode()))
                    .await
                    .ok();
                // Simulate the file's own timeline rather than flooding
                // the pipeline faster than real audio would have arrived.
                sleep(Duration::from_millis(frame.duration_ms.max(0.0) as u64)).await;
            }
            feed_tx.send(WsInbound::Close).await.ok();
        });

        inner.run(feed_rx, outbound).await;
        let _ = drive.await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::mock::MockAdapter;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn replays_file_frames_and_ends_session() {
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("mock".to_string(), Arc::new(MockAdapter));

        let handler = ReplaySessionHandler {
            session_id: Uuid::new_v4(),
            adapters,
            storage: Arc::new(MemoryStorage::new()),
            resampler_bin: crate::resample::DEFAULT_RESAMPLER_BIN.to_string(),
        };

        let (out_tx, mut out_rx) = mpsc::channel(32);
        let frames = vec![AudioFrame {
            seq: 0,
            capture_ts: 0.0,
            duration_ms: 1.0,
            payload: vec![0u8; 320],
        }];

        let run = tokio::spawn(handler.run(
            StreamingConfig {
                pcm: true,
                client_sample_rate: Some(16_000),
                enable_interim: false,
                degraded: false,
                normalize_preset: None,
                context_phrases: vec![],
                options: Default::default(),
            },
            ReplaySource { frames },
            out_tx,
        ));

        let mut saw_session = false;
        while let Some(msg) = out_rx.recv().await {
            if let WsOutbound::Text(text) = msg {
                if text.contains("\"type\":\"session\"") {
                    saw_session = true;
                }
            }
        }
        run.await.unwrap();
        assert!(saw_session);
    }
}
