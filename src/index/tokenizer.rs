//! Named tokenizers for the lexical index.
//!
//! A tokenizer's name is part of the persisted index's identity: the
//! staleness check compares names, so two behaviorally different tokenizers
//! must never share one.  Changing tokenization behavior means registering a
//! new name.
//!
//! Token boundaries are computed on the raw text so byte offsets stay valid
//! for provenance; normalization (NFC + lowercasing) applies per token.

use std::collections::HashSet;
use std::ops::Range;

use unicode_normalization::UnicodeNormalization;

/// Default tokenizer name, used when the server config names none.
pub const DEFAULT_TOKENIZER: &str = "unicode-v1";

const MIN_TOKEN_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenizerKind {
    /// Unicode letter-or-digit runs, internal hyphens and apostrophes kept
    /// (contractions and hyphenated compounds stay intact), NFC + lowercase.
    UnicodeV1,
    /// ASCII letter-or-digit runs, lowercase.
    AsciiV1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tokenizer {
    name: &'static str,
    kind: TokenizerKind,
}

/// Resolve a tokenizer by its stable name.
pub fn lookup(name: &str) -> Option<Tokenizer> {
    match name {
        "unicode-v1" => Some(Tokenizer {
            name: "unicode-v1",
            kind: TokenizerKind::UnicodeV1,
        }),
        "ascii-v1" => Some(Tokenizer {
            name: "ascii-v1",
            kind: TokenizerKind::AsciiV1,
        }),
        _ => None,
    }
}

impl Tokenizer {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Tokens in document order.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenize_with_offsets(text)
            .into_iter()
            .map(|(_, tok)| tok)
            .collect()
    }

    /// Tokens with the byte range each one occupies in `text`.
    pub fn tokenize_with_offsets(&self, text: &str) -> Vec<(Range<usize>, String)> {
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let mut out = Vec::new();
        let mut token_start: Option<usize> = None;

        let flush = |start: usize, end: usize, out: &mut Vec<(Range<usize>, String)>, kind| {
            let raw = &text[start..end];
            let normalized = normalize(raw, kind);
            if normalized.chars().count() >= MIN_TOKEN_CHARS {
                out.push((start..end, normalized));
            }
        };

        for (i, &(pos, ch)) in chars.iter().enumerate() {
            let is_token_char = match self.kind {
                TokenizerKind::UnicodeV1 => {
                    ch.is_alphanumeric()
                        || ((ch == '-' || ch == '\'')
                            && token_start.is_some()
                            && chars.get(i + 1).is_some_and(|&(_, next)| next.is_alphanumeric()))
                }
                TokenizerKind::AsciiV1 => ch.is_ascii_alphanumeric(),
            };

            match (is_token_char, token_start) {
                (true, None) => token_start = Some(pos),
                (false, Some(start)) => {
                    flush(start, pos, &mut out, self.kind);
                    token_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = token_start {
            flush(start, text.len(), &mut out, self.kind);
        }
        out
    }

    /// Tokenize and deduplicate, preserving first-seen order — query-side
    /// processing.
    pub fn tokenize_unique(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tokenize(text)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }
}

fn normalize(raw: &str, kind: TokenizerKind) -> String {
    match kind {
        TokenizerKind::UnicodeV1 => raw.nfc().collect::<String>().to_lowercase(),
        TokenizerKind::AsciiV1 => raw.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicode() -> Tokenizer {
        lookup("unicode-v1").unwrap()
    }

    #[test]
    fn lookup_known_and_unknown() {
        assert_eq!(lookup("unicode-v1").unwrap().name(), "unicode-v1");
        assert_eq!(lookup("ascii-v1").unwrap().name(), "ascii-v1");
        assert!(lookup("stemmed-v9").is_none());
    }

    #[test]
    fn basic_tokenization() {
        let tokens = unicode().tokenize("Hello, World!");
        assert_eq!(tokens, vec!["hello", "world"]);
    }

    #[test]
    fn filters_short_tokens() {
        let tokens = unicode().tokenize("I am a test");
        assert_eq!(tokens, vec!["am", "test"]);
    }

    #[test]
    fn keeps_internal_hyphens_and_apostrophes() {
        let tokens = unicode().tokenize("state-of-the-art isn't trailing- 'quoted'");
        assert_eq!(
            tokens,
            vec!["state-of-the-art", "isn't", "trailing", "quoted"]
        );
    }

    #[test]
    fn offsets_slice_back_to_source() {
        let text = "The Python programming language";
        for (range, token) in unicode().tokenize_with_offsets(text) {
            assert_eq!(text[range].to_lowercase(), token);
        }
    }

    #[test]
    fn unicode_letters_tokenize() {
        let tokens = unicode().tokenize("Grüße München 北京");
        assert_eq!(tokens, vec!["grüße", "münchen", "北京"]);
    }

    #[test]
    fn ascii_tokenizer_splits_non_ascii() {
        let tokens = lookup("ascii-v1").unwrap().tokenize("Grüße rust");
        assert_eq!(tokens, vec!["gr", "rust"]);
    }

    #[test]
    fn unique_preserves_order() {
        let tokens = unicode().tokenize_unique("apple banana Apple cherry");
        assert_eq!(tokens, vec!["apple", "banana", "cherry"]);
    }

    #[test]
    fn empty_and_punctuation_only() {
        assert!(unicode().tokenize("").is_empty());
        assert!(unicode().tokenize("...---...").is_empty());
    }
}
