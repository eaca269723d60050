//! Transcript cleanup applied before an utterance is dispatched

/// Collapse consecutive duplicate tokens in an utterance
///
/// Streaming transcripts echo words across overlapping partial and final
/// events ("I I I was was was"). Tokens are split on whitespace and compared
/// exactly (case-sensitive); only adjacent repeats are collapsed, so
/// "a b a" is left alone. The result is re-joined with single spaces.
#[must_use]
pub fn collapse_repeats(utterance: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for token in utterance.split_whitespace() {
        if out.last() != Some(&token) {
            out.push(token);
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_stammered_words() {
        assert_eq!(collapse_repeats("I I I was was was"), "I was");
    }

    #[test]
    fn collapses_repeated_sentences() {
        assert_eq!(collapse_repeats("Great. Great. Great."), "Great.");
    }

    #[test]
    fn keeps_non_consecutive_repeats() {
        assert_eq!(collapse_repeats("a b a"), "a b a");
    }

    #[test]
    fn is_case_sensitive() {
        assert_eq!(collapse_repeats("Hello hello"), "Hello hello");
    }

    #[test]
    fn empty_and_whitespace_inputs() {
        assert_eq!(collapse_repeats(""), "");
        assert_eq!(collapse_repeats("   \t "), "");
    }

    #[test]
    fn idempotent_and_never_longer() {
        let inputs = [
            "hello hello world",
            "the the  cat sat sat on the the mat",
            "one",
            "  spaced   out   out  ",
            "x x y y x x",
        ];
        for input in inputs {
            let once = collapse_repeats(input);
            assert_eq!(collapse_repeats(&once), once, "not idempotent for {input:?}");
            assert!(once.len() <= input.len(), "grew for {input:?}");
        }
    }
}
