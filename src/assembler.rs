//! Cross-segment transcript assembly and dedup.
//!
//! Ported from the original `EnvelopeWebSocket._maybe_update_dedup_prefix` /
//! `send_text`: each utterance accumulates `committed_text` across engine
//! segments, tracks the longest prefix already emitted to the client as
//! `visible_text`, and uses a bounded suffix/prefix scan to detect where a
//! new segment's transcript overlaps the tail of what's already committed.

/// Suffix/prefix scan window (chars), matching the original's `[-2000:]`
/// window on both sides.
const DEDUP_SCAN_WINDOW: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct TranscriptAssembler {
    committed_text: String,
    visible_text: String,
    segment_text: String,
    dedup_prefix_len: usize,
}

/// Result of feeding a delta/done event into the assembler: at most one
/// token of newly-visible text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembleOutcome {
    pub token: Option<String>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed_text(&self) -> &str {
        &self.committed_text
    }

    pub fn visible_text(&self) -> &str {
        &self.visible_text
    }

    /// Longest suffix of `a` that is a prefix of `b`, scanning from longest
    /// to shortest candidate length.
    fn find_overlap(a_suffix: &str, b_prefix: &str) -> usize {
        if a_suffix.is_empty() || b_prefix.is_empty() {
            return 0;
        }
        let a_chars: Vec<char> = a_suffix.chars().collect();
        let b_chars: Vec<char> = b_prefix.chars().collect();
        let max_len = a_chars.len().min(b_chars.len());
        for i in (1..=max_len).rev() {
            if a_chars[a_chars.len() - i..] == b_chars[..i] {
                return i;
            }
        }
        0
    }

    fn char_tail(s: &str, window: usize) -> &str {
        let char_count = s.chars().count();
        if char_count <= window {
            return s;
        }
        let skip = char_count - window;
        let byte_idx = s
            .char_indices()
            .nth(skip)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        &s[byte_idx..]
    }

    fn char_head(s: &str, window: usize) -> &str {
        match s.char_indices().nth(window) {
            Some((byte_idx, _)) => &s[..byte_idx],
            None => s,
        }
    }

    fn maybe_update_dedup_prefix(&mut self) {
        if self.committed_text.is_empty() || self.segment_text.is_empty() {
            return;
        }
        let tail = Self::char_tail(&self.committed_text, DEDUP_SCAN_WINDOW);
        let head = Self::char_head(&self.segment_text, DEDUP_SCAN_WINDOW);
        let overlap = Self::find_overlap(tail, head);
        if overlap == 0 || overlap <= self.dedup_prefix_len {
            return;
        }
        let candidate_merged = format!(
            "{}{}",
            self.committed_text,
            Self::skip_chars(&self.segment_text, overlap)
        );
        if candidate_merged.starts_with(&self.visible_text) {
            self.dedup_prefix_len = overlap;
        }
    }

    fn skip_chars(s: &str, n: usize) -> &str {
        match s.char_indices().nth(n) {
            Some((byte_idx, _)) => &s[byte_idx..],
            None => "",
        }
    }

    fn merged(&self) -> String {
        format!(
            "{}{}",
            self.committed_text,
            Self::skip_chars(&self.segment_text, self.dedup_prefix_len)
        )
    }

    fn emit_if_prefix_extends(&mut self, merged: &str) -> Option<String> {
        if !merged.starts_with(&self.visible_text) {
            return None;
        }
        let out = &merged[self.visible_text.len()..];
        if out.is_empty() {
            return None;
        }
        let token = out.to_string();
        self.visible_text = merged.to_string();
        Some(token)
    }

    /// Feed a `transcription.delta` event.
    pub fn on_delta(&mut self, delta: &str) -> AssembleOutcome {
        if delta.is_empty() {
            return AssembleOutcome::default();
        }
        self.segment_text.push_str(delta);
        self.maybe_update_dedup_prefix();
        let merged = self.merged();
        let token = self.emit_if_prefix_extends(&merged);
        AssembleOutcome { token }
    }

    /// Feed a `transcription.done` event, closing the current segment.
    /// Returns the residual token (if any) plus the final merged text for
    /// this segment's completion (used by the writer to decide whether to
    /// emit `final`/`done`).
    pub fn on_done(&mut self, text: Option<&str>) -> (AssembleOutcome, String) {
        if let Some(t) = text {
            self.segment_text = t.to_string();
        }
        self.maybe_update_dedup_prefix();
        let merged = self.merged();
        let token = self.emit_if_prefix_extends(&merged);

        self.committed_text = merged.clone();
        self.visible_text = merged.clone();
        self.segment_text.clear();
        self.dedup_prefix_len = 0;

        (AssembleOutcome { token }, merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_single_segment_utterance() {
        let mut a = TranscriptAssembler::new();
        let o1 = a.on_delta("hel");
        assert_eq!(o1.token.as_deref(), Some("hel"));
        let o2 = a.on_delta("lo there");
        assert_eq!(o2.token.as_deref(), Some("lo there"));
        let (o3, merged) = a.on_done(None);
        assert_eq!(o3.token, None);
        assert_eq!(merged, "hello there");
        assert_eq!(a.visible_text(), "hello there");
    }

    #[test]
    fn visible_text_never_shrinks_across_rolled_segments() {
        let mut a = TranscriptAssembler::new();
        a.on_delta("the quick brown");
        let (_, merged1) = a.on_done(None);
        assert_eq!(merged1, "the quick brown");

        // Next segment replays overlap "brown" then continues.
        a.on_delta("brown fox jumps");
        let before = a.visible_text().to_string();
        a.on_delta(" over");
        assert!(a.visible_text().starts_with(&before));
        let (_, merged2) = a.on_done(None);
        assert_eq!(merged2, "the quick brown fox jumps over");
    }

    #[test]
    fn done_with_text_replaces_segment_before_dedup() {
        let mut a = TranscriptAssembler::new();
        a.on_delta("hello wor");
        let (outcome, merged) = a.on_done(Some("hello world"));
        assert_eq!(merged, "hello world");
        assert_eq!(outcome.token.as_deref(), Some("ld"));
    }

    #[test]
    fn empty_delta_is_a_no_op() {
        let mut a = TranscriptAssembler::new();
        let o = a.on_delta("");
        assert_eq!(o.token, None);
        assert_eq!(a.visible_text(), "");
    }
}
