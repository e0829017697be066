//! Emoji hint derived from assistant text.
//!
//! Devices with a face render a mood while the reply is spoken. The hint
//! is keyword-driven and sent once per turn on the first non-empty chunk.

/// Recognized emotions and the emoji a device may render.
pub const EMOTIONS: &[(&str, &str)] = &[
    ("neutral", "😶"),
    ("happy", "🙂"),
    ("laughing", "😆"),
    ("sad", "😔"),
    ("angry", "😠"),
    ("loving", "😍"),
    ("surprised", "😲"),
    ("thinking", "🤔"),
    ("cool", "😎"),
    ("sleepy", "😴"),
];

const HAPPY_MARKERS: &[&str] = &["great", "awesome", "glad", "happy", "wonderful", "nice"];
const SAD_MARKERS: &[&str] = &["sorry", "sad", "unfortunately", "afraid"];
const SURPRISED_MARKERS: &[&str] = &["wow", "really", "amazing", "incredible"];
const THINKING_MARKERS: &[&str] = &["hmm", "let me think", "maybe", "perhaps"];

/// Pick an emotion for a chunk of assistant text.
pub fn detect_emotion(text: &str) -> &'static str {
    let lowered = text.to_lowercase();

    for marker in SAD_MARKERS {
        if lowered.contains(marker) {
            return "sad";
        }
    }
    for marker in SURPRISED_MARKERS {
        if lowered.contains(marker) {
            return "surprised";
        }
    }
    for marker in THINKING_MARKERS {
        if lowered.contains(marker) {
            return "thinking";
        }
    }
    for marker in HAPPY_MARKERS {
        if lowered.contains(marker) {
            return "happy";
        }
    }
    if lowered.contains('!') {
        return "happy";
    }
    "neutral"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_detection() {
        assert_eq!(detect_emotion("I'm so glad you asked!"), "happy");
        assert_eq!(detect_emotion("Sorry, that failed."), "sad");
        assert_eq!(detect_emotion("Wow, that is tall."), "surprised");
        assert_eq!(detect_emotion("Hmm, give me a second."), "thinking");
        assert_eq!(detect_emotion("The answer is four."), "neutral");
    }

    #[test]
    fn every_emotion_has_an_emoji() {
        for (name, emoji) in EMOTIONS {
            assert!(!name.is_empty());
            assert!(!emoji.is_empty());
        }
    }
}
