//! Module E — Stream Normalizer (spec §4.E).
//!
//! Buckets transcripts into fixed-width time windows keyed by origin
//! capture timestamp, tracks per-`(windowId, provider)` revisions as a
//! provider corrects itself, and applies an optional text normalization
//! preset before handing a row to the caller.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizePreset {
    pub nfkc: bool,
    pub strip_punct: bool,
    pub strip_space: bool,
    pub lowercase: bool,
}

impl NormalizePreset {
    /// Parses the comma-separated preset name from `StreamingOptions.normalize_preset`
    /// (spec §4.E: "nfkc", "stripPunct", "stripSpace", "lowercase", combinable).
    pub fn parse(spec: &str) -> Self {
        let mut preset = NormalizePreset::default();
        for token in spec.split(',').map(str::trim) {
            match token {
                "nfkc" => preset.nfkc = true,
                "stripPunct" => preset.strip_punct = true,
                "stripSpace" => preset.strip_space = true,
                "lowercase" => preset.lowercase = true,
                _ => {}
            }
        }
        preset
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        if self.nfkc {
            out = nfkc_fold(&out);
        }
        if self.strip_punct {
            out = out
                .chars()
                .filter(|c| !c.is_ascii_punctuation())
                .collect();
        }
        if self.strip_space {
            out = out.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        if self.lowercase {
            out = out.to_lowercase();
        }
        out
    }
}

/// Best-effort compatibility folding without pulling in a full Unicode
/// normalization table: collapses the common typographic punctuation
/// variants a transcript provider tends to emit.
fn nfkc_fold(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            '\u{00A0}' => ' ',
            other => other,
        })
        .collect()
}

const MAX_TRACKED_WINDOWS: usize = 600;
const MAX_EMITTED_TAIL: usize = 500;

#[derive(Debug, Clone)]
pub struct NormalizedRow {
    pub window_id: i64,
    pub provider: String,
    pub revision: u32,
    pub text: String,
    pub text_delta: String,
}

#[derive(Debug, Clone, Default)]
struct WindowState {
    revision: u32,
    text: String,
}

/// Stateful per-session normalizer. `bucket_ms` is the window width; a
/// transcript's `windowId = floor(originCaptureTs / bucketMs)`.
pub struct StreamNormalizer {
    bucket_ms: f64,
    preset: NormalizePreset,
    windows: BTreeMap<i64, HashMap<String, WindowState>>,
    emitted_tail: Vec<NormalizedRow>,
}

impl StreamNormalizer {
    pub fn new(bucket_ms: f64, preset: NormalizePreset) -> Self {
        StreamNormalizer {
            bucket_ms,
            preset,
            windows: BTreeMap::new(),
            emitted_tail: Vec::new(),
        }
    }

    /// Ingest one final transcript, returning the row to emit (a new
    /// revision of its window) and updating internal state.
    pub fn ingest(&mut self, provider: &str, origin_capture_ts: f64, text: &str) -> NormalizedRow {
        let window_id = (origin_capture_ts / self.bucket_ms).floor() as i64;
        let normalized = self.preset.apply(text);

        let by_provider = self.windows.entry(window_id).or_default();
        let state = by_provider.entry(provider.to_string()).or_default();

        let text_delta = suffix_delta(&state.text, &normalized);
        state.revision += 1;
        state.text = normalized.clone();

        let row = NormalizedRow {
            window_id,
            provider: provider.to_string(),
            revision: state.revision,
            text: normalized,
            text_delta,
        };

        self.evict_if_over_capacity();
        self.push_emitted(row.clone());
        row
    }

    fn evict_if_over_capacity(&mut self) {
        while self.windows.len() > MAX_TRACKED_WINDOWS {
            if let Some((&smallest, _)) = self.windows.iter().next() {
                self.windows.remove(&smallest);
            } else {
                break;
            }
        }
    }

    fn push_emitted(&mut self, row: NormalizedRow) {
        self.emitted_tail.push(row);
        if self.emitted_tail.len() > MAX_EMITTED_TAIL {
            let overflow = self.emitted_tail.len() - MAX_EMITTED_TAIL;
            self.emitted_tail.drain(0..overflow);
        }
    }

    pub fn emitted_tail(&self) -> &[NormalizedRow] {
        &self.emitted_tail
    }

    pub fn tracked_window_count(&self) -> usize {
        self.windows.len()
    }
}

/// Diffs two revisions of the same window/provider by common-prefix length;
/// the delta is whatever the new revision added or changed past that point.
fn suffix_delta(previous: &str, current: &str) -> String {
    let prev_chars: Vec<char> = previous.chars().collect();
    let cur_chars: Vec<char> = current.chars().collect();
    let common = prev_chars
        .iter()
        .zip(cur_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();
    cur_chars[common..].iter().collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn preset_combines_flags() {
        let preset = NormalizePreset::parse("lowercase,stripPunct");
        assert_eq!(preset.apply("Hello, World!"), "hello world");
    }

    #[test]
    fn bucketing_groups_by_floor_division() {
        let mut norm = StreamNormalizer::new(1000.0, NormalizePreset::default());
        let a = norm.ingest("mock", 500.0, "hi");
        let b = norm.ingest("mock", 1999.0, "there");
        assert_eq!(a.window_id, 0);
        assert_eq!(b.window_id, 1);
    }

    #[test]
    fn revisions_increment_and_delta_is_suffix_only() {
        let mut norm = StreamNormalizer::new(1000.0, NormalizePreset::default());
        let first = norm.ingest("mock", 0.0, "hello");
        assert_eq!(first.revision, 1);
        assert_eq!(first.text_delta, "hello");
        let second = norm.ingest("mock", 0.0, "hello world");
        assert_eq!(second.revision, 2);
        assert_eq!(second.text_delta, " world");
    }

    #[test]
    fn separate_providers_in_same_window_do_not_share_revisions() {
        let mut norm = StreamNormalizer::new(1000.0, NormalizePreset::default());
        let a = norm.ingest("mock", 0.0, "hi");
        let b = norm.ingest("other", 0.0, "hi");
        assert_eq!(a.revision, 1);
        assert_eq!(b.revision, 1);
    }

    #[test]
    fn evicts_smallest_window_once_over_capacity() {
        let mut norm = StreamNormalizer::new(1.0, NormalizePreset::default());
        for i in 0..(MAX_TRACKED_WINDOWS + 5) {
            norm.ingest("mock", i as f64, "x");
        }
        assert_eq!(norm.tracked_window_count(), MAX_TRACKED_WINDOWS);
    }

    #[test]
    fn emitted_tail_caps_at_500() {
        let mut norm = StreamNormalizer::new(1.0, NormalizePreset::default());
        for i in 0..(MAX_EMITTED_TAIL + 10) {
            norm.ingest("mock", i as f64, "x");
        }
        assert_eq!(norm.emitted_tail().len(), MAX_EMITTED_TAIL);
    }
}
