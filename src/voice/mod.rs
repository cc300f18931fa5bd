//! Module H — Voice Dialogue Orchestrator (spec §4.H).
//!
//! STT → LLM → TTS turn controller with barge-in, a suppression buffer
//! for transcripts that arrive while the assistant is speaking, and
//! meeting-mode wake-word gating/echo suppression (`meeting.rs`).
//! `ChatClient`/`TtsClient` are narrow seams: implementing the LLM and
//! TTS themselves is out of scope (spec.md Non-goals), so the orchestrator
//! only needs something that can produce a reply and stream PCM for it.

pub mod meeting;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AdapterError;
use crate::frame::AudioFrame;
use crate::provider::{AdapterEvent, PartialTranscript, ProviderAdapter, StreamingOptions};
use crate::session::realtime::{WsInbound, WsOutbound};
use crate::session::{ClientControlMessage, VoiceCommandName};

use self::meeting::{EchoSuppressConfig, EchoSuppressor, WakeWordConfig, WakeWordGate};

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn reply(&self, history: &[ChatMessage], user_text: &str) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Streams synthesized PCM16LE mono chunks for `text`.
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    Listening,
    Thinking,
    Speaking,
}

impl DialogueState {
    fn as_str(&self) -> &'static str {
        match self {
            DialogueState::Listening => "listening",
            DialogueState::Thinking => "thinking",
            DialogueState::Speaking => "speaking",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum VoiceServerMessage {
    #[serde(rename = "voice_session")]
    VoiceSession { session_id: Uuid },
    #[serde(rename = "voice_state")]
    VoiceState {
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_id: Option<Uuid>,
    },
    #[serde(rename = "voice_user_transcript")]
    VoiceUserTranscript { text: String },
    #[serde(rename = "voice_assistant_text")]
    VoiceAssistantText { text: String },
    #[serde(rename = "voice_assistant_audio_start")]
    VoiceAssistantAudioStart { turn_id: Uuid },
    #[serde(rename = "voice_assistant_audio_end")]
    VoiceAssistantAudioEnd { reason: &'static str },
    #[serde(rename = "voice_meeting_window")]
    VoiceMeetingWindow {
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

enum TurnEvent {
    AssistantText(String),
    AudioStart,
    AudioChunk(Vec<u8>),
    Done,
    Failed(AdapterError),
}

pub struct VoiceOrchestratorConfig {
    pub history_max_turns: usize,
    pub system_prompt: Option<String>,
    pub meeting_mode: bool,
    pub wake_word: WakeWordConfig,
    pub echo_suppress: EchoSuppressConfig,
    pub intro_enabled: bool,
}

pub struct VoiceOrchestrator {
    session_id: Uuid,
    adapter: Arc<dyn ProviderAdapter>,
    chat: Arc<dyn ChatClient>,
    tts: Arc<dyn TtsClient>,
    config: VoiceOrchestratorConfig,
    state: DialogueState,
    history: VecDeque<ChatMessage>,
    current_turn: Option<JoinHandle<()>>,
    suppressed_finals: Vec<String>,
    suppressed_interim: Option<String>,
    wake_gate: WakeWordGate,
    echo: EchoSuppressor,
    meeting_window_open: bool,
}

impl VoiceOrchestrator {
    pub fn new(
        session_id: Uuid,
        adapter: Arc<dyn ProviderAdapter>,
        chat: Arc<dyn ChatClient>,
        tts: Arc<dyn TtsClient>,
        config: VoiceOrchestratorConfig,
    ) -> Self {
        let mut history = VecDeque::new();
        if let Some(prompt) = &config.system_prompt {
            history.push_back(ChatMessage {
                role: "system",
                content: prompt.clone(),
            });
        }
        let wake_gate = WakeWordGate::new(config.wake_word.clone());
        let echo = EchoSuppressor::new(config.echo_suppress.clone());
        VoiceOrchestrator {
            session_id,
            adapter,
            chat,
            tts,
            config,
            state: DialogueState::Listening,
            history,
            current_turn: None,
            suppressed_finals: Vec::new(),
            suppressed_interim: None,
            wake_gate,
            echo,
            meeting_window_open: false,
        }
    }

    pub async fn run(mut self, mut inbound: mpsc::Receiver<WsInbound>, outbound: mpsc::Sender<WsOutbound>) {
        send(&outbound, VoiceServerMessage::VoiceSession { session_id: self.session_id }).await;

        if self.config.meeting_mode && self.config.intro_enabled {
            self.speak_intro(&outbound).await;
        }

        let base_opts = StreamingOptions {
            sample_rate_hz: self.adapter.required_sample_rate().unwrap_or(16_000),
            enable_interim: true,
            ..Default::default()
        };
        let mut mic = match self.adapter.start_streaming(base_opts.clone()).await {
            Ok(s) => s,
            Err(e) => {
                send(&outbound, VoiceServerMessage::Error { message: e.to_string() }).await;
                return;
            }
        };
        // Meeting mode carries a second, independently-transcribed channel for the
        // room mic; frames are demuxed by `seq % 2` (mic even, meeting odd).
        let mut meeting = if self.config.meeting_mode {
            match self.adapter.start_streaming(base_opts).await {
                Ok(s) => Some(s),
                Err(e) => {
                    send(&outbound, VoiceServerMessage::Error { message: e.to_string() }).await;
                    None
                }
            }
        } else {
            None
        };

        let (turn_tx, mut turn_rx) = mpsc::channel::<TurnEvent>(64);

        loop {
            let meeting_events = async {
                match meeting.as_mut() {
                    Some(m) => m.events.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        None | Some(WsInbound::Close) => break,
                        Some(WsInbound::Binary(bytes)) => {
                            if let Ok(frame) = AudioFrame::decode(&bytes) {
                                if let Some(m) = meeting.as_mut() {
                                    if frame.seq % 2 == 1 {
                                        m.controller.send_audio(frame.payload, frame.capture_ts).await.ok();
                                    } else {
                                        mic.controller.send_audio(frame.payload, frame.capture_ts).await.ok();
                                    }
                                } else {
                                    mic.controller.send_audio(frame.payload, frame.capture_ts).await.ok();
                                }
                            }
                        }
                        Some(WsInbound::Text(text)) => {
                            if let Ok(ClientControlMessage::Command { name, .. }) = serde_json::from_str(&text) {
                                self.handle_command(name, &outbound, &turn_tx).await;
                            }
                        }
                    }
                }

                ev = mic.events.recv() => {
                    match ev {
                        None | Some(AdapterEvent::Closed) => break,
                        Some(AdapterEvent::Error(e)) => {
                            send(&outbound, VoiceServerMessage::Error { message: e.to_string() }).await;
                        }
                        Some(AdapterEvent::Data(t)) => {
                            self.on_transcript(t, false, &outbound, &turn_tx).await;
                        }
                    }
                }

                ev = meeting_events => {
                    match ev {
                        None | Some(AdapterEvent::Closed) => {}
                        Some(AdapterEvent::Error(e)) => {
                            send(&outbound, VoiceServerMessage::Error { message: e.to_string() }).await;
                        }
                        Some(AdapterEvent::Data(t)) => {
                            self.on_transcript(t, true, &outbound, &turn_tx).await;
                        }
                    }
                }

                turn_ev = turn_rx.recv() => {
                    let Some(turn_ev) = turn_ev else { continue; };
                    self.on_turn_event(turn_ev, &outbound).await;
                }
            }
        }

        if let Some(handle) = self.current_turn.take() {
            handle.abort();
        }
        mic.controller.end().await.ok();
        mic.controller.close().await.ok();
        if let Some(m) = meeting.as_ref() {
            m.controller.end().await.ok();
            m.controller.close().await.ok();
        }
    }

    async fn speak_intro(&mut self, outbound: &mpsc::Sender<WsOutbound>) {
        let intro = "Say 'assistant' then continue.";
        send(outbound, VoiceServerMessage::VoiceAssistantText { text: intro.to_string() }).await;
        self.echo.note_assistant_sentence(intro, Instant::now());
    }

    async fn handle_command(
        &mut self,
        name: VoiceCommandName,
        outbound: &mpsc::Sender<WsOutbound>,
        turn_tx: &mpsc::Sender<TurnEvent>,
    ) {
        match name {
            VoiceCommandName::StopSpeaking => {
                self.interrupt_current_turn("stop_speaking", outbound).await;
            }
            VoiceCommandName::BargeIn => {
                self.interrupt_current_turn("barge_in", outbound).await;
                self.flush_suppressed(outbound, turn_tx).await;
            }
            VoiceCommandName::ResetHistory => {
                if let Some(handle) = self.current_turn.take() {
                    handle.abort();
                }
                self.history.retain(|m| m.role == "system");
                self.suppressed_finals.clear();
                self.suppressed_interim = None;
                self.wake_gate.reset();
                self.meeting_window_open = false;
                self.state = DialogueState::Listening;
                send(outbound, VoiceServerMessage::VoiceState { state: "listening", turn_id: None }).await;
            }
        }
    }

    async fn interrupt_current_turn(&mut self, reason: &'static str, outbound: &mpsc::Sender<WsOutbound>) {
        if self.state == DialogueState::Speaking || self.state == DialogueState::Thinking {
            if let Some(handle) = self.current_turn.take() {
                handle.abort();
            }
            if self.state == DialogueState::Speaking {
                send(outbound, VoiceServerMessage::VoiceAssistantAudioEnd { reason }).await;
            }
            self.state = DialogueState::Listening;
            send(outbound, VoiceServerMessage::VoiceState { state: "listening", turn_id: None }).await;
        }
    }

    async fn flush_suppressed(&mut self, outbound: &mpsc::Sender<WsOutbound>, turn_tx: &mpsc::Sender<TurnEvent>) {
        let finals = std::mem::take(&mut self.suppressed_finals);
        self.suppressed_interim = None;
        if finals.is_empty() {
            return;
        }
        for text in &finals {
            send(outbound, VoiceServerMessage::VoiceUserTranscript { text: text.clone() }).await;
        }
        let trigger = finals.join(" ");
        self.start_turn(trigger, outbound, turn_tx).await;
    }

    async fn on_transcript(
        &mut self,
        transcript: PartialTranscript,
        is_meeting_source: bool,
        outbound: &mpsc::Sender<WsOutbound>,
        turn_tx: &mpsc::Sender<TurnEvent>,
    ) {
        if self.state == DialogueState::Speaking {
            if transcript.is_final {
                self.suppressed_finals.push(transcript.text.clone());
            } else {
                self.suppressed_interim = Some(transcript.text.clone());
            }
            self.interrupt_current_turn("barge_in", outbound).await;
            return;
        }

        if !transcript.is_final || transcript.text.trim().is_empty() {
            return;
        }

        if is_meeting_source {
            if self.echo.should_suppress(&transcript.text, Instant::now()) {
                return;
            }
            let was_open = self.meeting_window_open;
            let triggers = self.wake_gate.evaluate(&transcript.text, Instant::now());
            self.meeting_window_open = triggers;
            if triggers && !was_open {
                send(outbound, VoiceServerMessage::VoiceMeetingWindow { state: "open", reason: None }).await;
            } else if !triggers && was_open {
                send(outbound, VoiceServerMessage::VoiceMeetingWindow { state: "closed", reason: Some("timed_out") }).await;
            }
            if !triggers {
                return;
            }
        }

        if self.state == DialogueState::Thinking {
            if let Some(handle) = self.current_turn.take() {
                handle.abort();
            }
        }

        send(outbound, VoiceServerMessage::VoiceUserTranscript { text: transcript.text.clone() }).await;
        self.start_turn(transcript.text, outbound, turn_tx).await;
    }

    async fn start_turn(&mut self, user_text: String, outbound: &mpsc::Sender<WsOutbound>, turn_tx: &mpsc::Sender<TurnEvent>) {
        self.state = DialogueState::Thinking;
        send(outbound, VoiceServerMessage::VoiceState { state: "thinking", turn_id: None }).await;

        self.history.push_back(ChatMessage { role: "user", content: user_text.clone() });
        self.trim_history();

        let chat = self.chat.clone();
        let tts = self.tts.clone();
        let history: Vec<ChatMessage> = self.history.iter().cloned().collect();
        let tx = turn_tx.clone();

        let handle = tokio::spawn(async move {
            let reply = match chat.reply(&history, &user_text).await {
                Ok(text) => text,
                Err(e) => {
                    tx.send(TurnEvent::Failed(e)).await.ok();
                    return;
                }
            };
            if tx.send(TurnEvent::AssistantText(reply.clone())).await.is_err() {
                return;
            }

            let mut pcm = match tts.synthesize(&reply).await {
                Ok(rx) => rx,
                Err(e) => {
                    tx.send(TurnEvent::Failed(e)).await.ok();
                    return;
                }
            };

            let mut started = false;
            while let Some(chunk) = pcm.recv().await {
                if !started {
                    started = true;
                    if tx.send(TurnEvent::AudioStart).await.is_err() {
                        return;
                    }
                }
                if tx.send(TurnEvent::AudioChunk(chunk)).await.is_err() {
                    return;
                }
            }
            tx.send(TurnEvent::Done).await.ok();
        });

        self.current_turn = Some(handle);
    }

    fn trim_history(&mut self) {
        let system_count = self.history.iter().take_while(|m| m.role == "system").count();
        let max_len = system_count + self.config.history_max_turns * 2;
        while self.history.len() > max_len {
            if let Some(idx) = self.history.iter().position(|m| m.role != "system") {
                self.history.remove(idx);
            } else {
                break;
            }
        }
    }

    async fn on_turn_event(&mut self, event: TurnEvent, outbound: &mpsc::Sender<WsOutbound>) {
        match event {
            TurnEvent::AssistantText(text) => {
                self.history.push_back(ChatMessage { role: "assistant", content: text.clone() });
                self.echo.note_assistant_sentence(&text, Instant::now());
                send(outbound, VoiceServerMessage::VoiceAssistantText { text }).await;
            }
            TurnEvent::AudioStart => {
                self.state = DialogueState::Speaking;
                send(outbound, VoiceServerMessage::VoiceState { state: "speaking", turn_id: None }).await;
                send(outbound, VoiceServerMessage::VoiceAssistantAudioStart { turn_id: Uuid::new_v4() }).await;
            }
            TurnEvent::AudioChunk(chunk) => {
                outbound.send(WsOutbound::Binary(chunk)).await.ok();
            }
            TurnEvent::Done => {
                if self.state == DialogueState::Speaking {
                    send(outbound, VoiceServerMessage::VoiceAssistantAudioEnd { reason: "completed" }).await;
                }
                self.state = DialogueState::Listening;
                send(outbound, VoiceServerMessage::VoiceState { state: "listening", turn_id: None }).await;
                self.current_turn = None;
            }
            TurnEvent::Failed(e) => {
                send(outbound, VoiceServerMessage::Error { message: e.to_string() }).await;
                self.state = DialogueState::Listening;
                send(outbound, VoiceServerMessage::VoiceState { state: "listening", turn_id: None }).await;
                self.current_turn = None;
            }
        }
    }
}

async fn send(outbound: &mpsc::Sender<WsOutbound>, msg: VoiceServerMessage) {
    if let Ok(text) = serde_json::to_string(&msg) {
        outbound.send(WsOutbound::Text(text)).await.ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::mock::MockAdapter;

    struct EchoChat;
    #[async_trait]
    impl ChatClient for EchoChat {
        async fn reply(&self, _history: &[ChatMessage], user_text: &str) -> Result<String, AdapterError> {
            Ok(format!("you said {user_text}"))
        }
    }

    struct SilentTts;
    #[async_trait]
    impl TtsClient for SilentTts {
        async fn synthesize(&self, _text: &str) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                tx.send(vec![0u8; 4]).await.ok();
            });
            Ok(rx)
        }
    }

    fn orchestrator() -> VoiceOrchestrator {
        VoiceOrchestrator::new(
            Uuid::new_v4(),
            Arc::new(MockAdapter),
            Arc::new(EchoChat),
            Arc::new(SilentTts),
            VoiceOrchestratorConfig {
                history_max_turns: 12,
                system_prompt: Some("be terse".to_string()),
                meeting_mode: false,
                wake_word: WakeWordConfig::default(),
                echo_suppress: EchoSuppressConfig::default(),
                intro_enabled: false,
            },
        )
    }

    #[tokio::test]
    async fn trim_history_keeps_system_prompt() {
        let mut orch = orchestrator();
        for i in 0..40 {
            orch.history.push_back(ChatMessage { role: "user", content: format!("msg {i}") });
        }
        orch.trim_history();
        assert!(orch.history.iter().any(|m| m.role == "system"));
        assert!(orch.history.len() <= 1 + orch.config.history_max_turns * 2);
    }

    /// Sends one chunk (enough to trigger `audio_start`/`Speaking`) and then
    /// never finishes, so a test can deterministically interrupt mid-speech
    /// without racing a real completion.
    struct HangingTts;
    #[async_trait]
    impl TtsClient for HangingTts {
        async fn synthesize(&self, _text: &str) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                tx.send(vec![0u8; 4]).await.ok();
                std::future::pending::<()>().await;
            });
            Ok(rx)
        }
    }

    /// A streaming session whose transcript events the test drives directly,
    /// since `MockAdapter` only ever emits a final on `end()` (which tears
    /// the whole session down) and barge-in needs a final transcript to
    /// arrive mid-session, while the assistant is still speaking.
    struct ScriptedAdapter {
        events: std::sync::Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn supports_streaming(&self) -> bool {
            true
        }
        async fn start_streaming(
            &self,
            _opts: StreamingOptions,
        ) -> Result<crate::provider::StreamingSession, AdapterError> {
            let (controller, mut commands) = crate::provider::new_controller_channel(8);
            tokio::spawn(async move { while commands.recv().await.is_some() {} });
            let events = self
                .events
                .lock()
                .unwrap()
                .take()
                .expect("start_streaming called more than once");
            Ok(crate::provider::StreamingSession { controller, events })
        }
    }

    fn transcript(text: &str, is_final: bool) -> PartialTranscript {
        PartialTranscript {
            provider: "scripted".to_string(),
            is_final,
            text: text.to_string(),
            words: None,
            timestamp: 0.0,
            channel: crate::provider::Channel::Mic,
            speaker_id: None,
            confidence: None,
            punctuation_applied: None,
            casing_applied: None,
        }
    }

    /// Drains `out_rx` until a text message containing `needle` is seen, or
    /// panics after a short timeout — avoids hanging forever if the
    /// orchestrator doesn't behave as expected.
    async fn recv_until(out_rx: &mut mpsc::Receiver<WsOutbound>, needle: &str) {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                match out_rx.recv().await.expect("channel closed before match") {
                    WsOutbound::Text(text) if text.contains(needle) => return,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"));
    }

    /// S4: a final transcript arriving while the assistant is speaking
    /// interrupts it (audio_end{reason:barge_in}) and buffers the text
    /// instead of forwarding it; a subsequent explicit `barge_in` command
    /// flushes the buffered text as `voice_user_transcript` and starts a
    /// fresh turn for it.
    #[tokio::test]
    async fn barge_in_flushes_suppressed_transcript_and_starts_new_turn() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let adapter = Arc::new(ScriptedAdapter {
            events: std::sync::Mutex::new(Some(event_rx)),
        });
        let orch = VoiceOrchestrator::new(
            Uuid::new_v4(),
            adapter,
            Arc::new(EchoChat),
            Arc::new(HangingTts),
            VoiceOrchestratorConfig {
                history_max_turns: 12,
                system_prompt: None,
                meeting_mode: false,
                wake_word: WakeWordConfig::default(),
                echo_suppress: EchoSuppressConfig::default(),
                intro_enabled: false,
            },
        );

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let run = tokio::spawn(orch.run(in_rx, out_tx));

        // First turn: talk, get a reply, assistant starts speaking.
        event_tx.send(AdapterEvent::Data(transcript("hello", true))).await.unwrap();
        recv_until(&mut out_rx, "\"type\":\"voice_user_transcript\"").await;
        recv_until(&mut out_rx, "\"type\":\"voice_assistant_audio_start\"").await;

        // Barge in with a final transcript while still speaking: interrupted,
        // buffered, not yet forwarded as a user transcript.
        event_tx.send(AdapterEvent::Data(transcript("stop", true))).await.unwrap();
        recv_until(&mut out_rx, "\"reason\":\"barge_in\"").await;

        // Explicit barge_in command flushes the buffer.
        in_tx
            .send(WsInbound::Text(r#"{"type":"command","name":"barge_in"}"#.to_string()))
            .await
            .unwrap();
        recv_until(&mut out_rx, "\"text\":\"stop\"").await;
        recv_until(&mut out_rx, "\"type\":\"voice_assistant_audio_start\"").await;

        drop(in_tx);
        drop(event_tx);
        run.await.unwrap();
    }
}
