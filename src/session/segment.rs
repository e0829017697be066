//! Streaming sentence segmentation for TTS.
//!
//! Token chunks from the LLM are cut into speakable sentences with a
//! two-level, table-driven rule: hard breaks on terminal punctuation
//! (guarded so decimals survive), and a soft break on the first
//! soft-break character of the very first sentence of a turn so the voice
//! starts sooner. Both character sets are data, not code.

/// Characters that always end a sentence, unless preceded by a digit.
pub const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', ';', '。', '！', '？', '；'];

/// Characters that end only the first sentence of a turn.
pub const FIRST_SENTENCE_SOFT_BREAK: &[char] = &[',', '，', '、', '~'];

#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    emitted_first: bool,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every sentence it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        for ch in chunk.chars() {
            self.buffer.push(ch);

            let is_terminal = TERMINAL_PUNCTUATION.contains(&ch);
            let is_soft = !self.emitted_first && FIRST_SENTENCE_SOFT_BREAK.contains(&ch);
            if !is_terminal && !is_soft {
                continue;
            }

            // A digit right before the break keeps decimals like 3.14
            // intact.
            let prev = self.buffer.chars().rev().nth(1);
            if prev.is_some_and(|p| p.is_ascii_digit()) {
                continue;
            }

            if let Some(sentence) = self.take_buffer() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// End of turn: flush whatever remains.
    pub fn finish(&mut self) -> Option<String> {
        self.take_buffer()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.emitted_first = false;
    }

    fn take_buffer(&mut self) -> Option<String> {
        let sentence = std::mem::take(&mut self.buffer);
        let trimmed = sentence.trim();
        if trimmed.is_empty() {
            return None;
        }
        self.emitted_first = true;
        Some(trimmed.to_string())
    }
}

/// Convenience for whole strings.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut segmenter = SentenceSegmenter::new();
    // Whole strings are not a live turn: no soft break.
    segmenter.emitted_first = true;
    let mut sentences = segmenter.push(text);
    sentences.extend(segmenter.finish());
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_question_splits_into_two() {
        assert_eq!(split_sentences("2.5 km? Yes."), vec!["2.5 km?", "Yes."]);
    }

    #[test]
    fn decimal_at_end_is_one_sentence() {
        assert_eq!(split_sentences("Pi is 3.14."), vec!["Pi is 3.14."]);
    }

    #[test]
    fn first_sentence_breaks_on_comma() {
        let mut segmenter = SentenceSegmenter::new();
        let mut out = segmenter.push("Sure, let me check that for you.");
        out.extend(segmenter.finish());
        assert_eq!(out, vec!["Sure,", "let me check that for you."]);
    }

    #[test]
    fn later_commas_do_not_break() {
        let mut segmenter = SentenceSegmenter::new();
        let mut out = segmenter.push("One. Two, three, four.");
        out.extend(segmenter.finish());
        assert_eq!(out, vec!["One.", "Two, three, four."]);
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let text = "Hello there! How are you today? I am fine.";
        let whole = split_sentences(text);

        let mut segmenter = SentenceSegmenter::new();
        segmenter.emitted_first = true;
        let mut pieces = Vec::new();
        for chunk in text.split_inclusive(' ') {
            pieces.extend(segmenter.push(chunk));
        }
        pieces.extend(segmenter.finish());
        assert_eq!(pieces, whole);
    }

    #[test]
    fn reassembly_matches_input_up_to_whitespace() {
        let text = "First. Second! Third?";
        let joined = split_sentences(text).join(" ");
        assert_eq!(joined, text);
    }

    #[test]
    fn cjk_terminals_break() {
        assert_eq!(split_sentences("你好。再见。"), vec!["你好。", "再见。"]);
    }

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   ").is_empty());
    }
}
