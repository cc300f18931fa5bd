//! Meeting-mode wake-word gating and echo suppression.
//!
//! Wake-word gate opens a follow-up window on a match and closes it after
//! a cooldown; echo suppression tracks recently-spoken TTS text and
//! compares incoming transcripts against it by bigram similarity.

use std::collections::HashSet;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    pub wake_words: Vec<String>,
    pub require_wake_word: bool,
    pub open_window: Duration,
    pub cooldown: Duration,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        WakeWordConfig {
            wake_words: vec![],
            require_wake_word: false,
            open_window: Duration::from_millis(6_000),
            cooldown: Duration::from_millis(1_500),
        }
    }
}

/// Gates meeting-source finals behind a wake word, with a rolling open
/// window that lets follow-up utterances trigger without repeating it.
pub struct WakeWordGate {
    config: WakeWordConfig,
    window_expires_at: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl WakeWordGate {
    pub fn new(config: WakeWordConfig) -> Self {
        WakeWordGate {
            config,
            window_expires_at: None,
            cooldown_until: None,
        }
    }

    /// Returns true if this final transcript should trigger a turn, and
    /// advances/opens/closes the window as a side effect.
    pub fn evaluate(&mut self, text: &str, now: Instant) -> bool {
        if !self.config.require_wake_word {
            return true;
        }

        if let Some(expires) = self.window_expires_at {
            if now < expires {
                self.window_expires_at = Some(now + self.config.open_window);
                return true;
            }
            self.window_expires_at = None;
            self.cooldown_until = Some(now + self.config.cooldown);
        }

        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }

        if contains_wake_word(text, &self.config.wake_words) {
            self.window_expires_at = Some(now + self.config.open_window);
            true
        } else {
            false
        }
    }

    /// `reset_history` closes any open window immediately (spec §4.H commands).
    pub fn reset(&mut self) {
        self.window_expires_at = None;
        self.cooldown_until = None;
    }
}

/// A wake word must appear as a whole token, not as a prefix of a longer
/// word (`"ai"` must not match `"aiden"`).
fn contains_wake_word(text: &str, wake_words: &[String]) -> bool {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect();
    wake_words
        .iter()
        .any(|w| tokens.iter().any(|t| t == &w.to_ascii_lowercase()))
}

#[derive(Debug, Clone)]
pub struct EchoSuppressConfig {
    pub suppress_for: Duration,
    pub similarity_threshold: f32,
}

impl Default for EchoSuppressConfig {
    fn default() -> Self {
        EchoSuppressConfig {
            suppress_for: Duration::from_millis(3_000),
            similarity_threshold: 0.8,
        }
    }
}

/// Drops meeting-source transcripts that are really the room's own
/// speakers echoing back the assistant's just-spoken sentence.
pub struct EchoSuppressor {
    config: EchoSuppressConfig,
    last_assistant: Option<(String, Instant)>,
}

impl EchoSuppressor {
    pub fn new(config: EchoSuppressConfig) -> Self {
        EchoSuppressor {
            config,
            last_assistant: None,
        }
    }

    pub fn note_assistant_sentence(&mut self, text: &str, now: Instant) {
        self.last_assistant = Some((text.to_string(), now));
    }

    pub fn should_suppress(&self, candidate: &str, now: Instant) -> bool {
        let Some((assistant_text, spoken_at)) = &self.last_assistant else {
            return false;
        };
        if now.duration_since(*spoken_at) > self.config.suppress_for {
            return false;
        }
        bigram_jaccard(assistant_text, candidate) >= self.config.similarity_threshold
    }
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.to_ascii_lowercase().chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

pub fn bigram_jaccard(a: &str, b: &str) -> f32 {
    let set_a = bigrams(a);
    let set_b = bigrams(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wake_word_rejects_prefix_match() {
        let mut gate = WakeWordGate::new(WakeWordConfig {
            wake_words: vec!["ai".to_string()],
            require_wake_word: true,
            ..Default::default()
        });
        let now = Instant::now();
        assert!(!gate.evaluate("aiden please", now));
    }

    #[test]
    fn wake_word_accepts_token_match() {
        let mut gate = WakeWordGate::new(WakeWordConfig {
            wake_words: vec!["ai".to_string()],
            require_wake_word: true,
            ..Default::default()
        });
        let now = Instant::now();
        assert!(gate.evaluate("ai, help", now));
    }

    #[test]
    fn open_window_lets_followups_trigger_without_wake_word() {
        let mut gate = WakeWordGate::new(WakeWordConfig {
            wake_words: vec!["assistant".to_string()],
            require_wake_word: true,
            open_window: Duration::from_millis(6_000),
            cooldown: Duration::from_millis(1_500),
        });
        let t0 = Instant::now();
        assert!(gate.evaluate("assistant what is the status", t0));
        let t1 = t0 + Duration::from_secs(3);
        assert!(gate.evaluate("any blockers", t1));
        let t2 = t1 + Duration::from_secs(11);
        assert!(!gate.evaluate("thanks", t2));
    }

    #[test]
    fn echo_suppressed_within_window_passes_after() {
        let mut suppressor = EchoSuppressor::new(EchoSuppressConfig::default());
        let t0 = Instant::now();
        suppressor.note_assistant_sentence("turn off the lights", t0);
        assert!(suppressor.should_suppress("turn off the lights", t0 + Duration::from_secs(1)));
        assert!(!suppressor.should_suppress("turn off the lights", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn bigram_jaccard_identical_strings_is_one() {
        assert_eq!(bigram_jaccard("hello world", "hello world"), 1.0);
    }
}
