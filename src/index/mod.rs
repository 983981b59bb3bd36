//! Lexical index — BM25 Okapi ranking over a session's documents.
//!
//! The index is built lazily per session and cached by the runtime; this
//! module only knows about document ids and their text.  Context-window
//! selection and highlight extraction live here too, since both must agree
//! with the tokenizer the index was built with.

pub mod persist;
pub mod tokenizer;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use tokenizer::Tokenizer;

/// Term-saturation parameter; fixed for index version 1.
pub const BM25_K1: f32 = 1.2;
/// Length-normalization parameter; fixed for index version 1.
pub const BM25_B: f32 = 0.75;

/// Hard cap on characters of a single document fed to the index.  The
/// runtime warns when a document is truncated into the index at this cap.
pub const INDEX_DOC_CHAR_CAP: usize = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    /// Ordinal into `doc_ids`.
    pub doc: u32,
    /// Term frequency in that document.
    pub tf: u32,
}

/// Serialized as the snapshot body; `BTreeMap` keeps the wire form stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    pub tokenizer: String,
    pub doc_ids: Vec<String>,
    pub doc_lens: Vec<u32>,
    pub avg_doc_len: f32,
    pub postings: BTreeMap<String, Vec<Posting>>,
}

/// One ranked document from a BM25 query.
#[derive(Debug, Clone)]
pub struct RankedDoc {
    pub doc_id: String,
    /// May be negative; never filtered on sign.
    pub score: f32,
    /// Query terms present in the document, sorted.
    pub terms: Vec<String>,
}

impl Bm25Index {
    /// Build from `(doc_id, text)` pairs.  Caller is responsible for any
    /// per-document truncation policy.
    pub fn build(docs: &[(String, String)], tokenizer: Tokenizer) -> Self {
        let mut doc_ids = Vec::with_capacity(docs.len());
        let mut doc_lens = Vec::with_capacity(docs.len());
        let mut postings: BTreeMap<String, Vec<Posting>> = BTreeMap::new();

        for (ord, (doc_id, text)) in docs.iter().enumerate() {
            let tokens = tokenizer.tokenize(text);
            doc_lens.push(tokens.len() as u32);
            doc_ids.push(doc_id.clone());

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (term, tf) in tf {
                postings.entry(term).or_default().push(Posting {
                    doc: ord as u32,
                    tf,
                });
            }
        }

        let avg_doc_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().map(|&l| l as f32).sum::<f32>() / doc_lens.len() as f32
        };

        Bm25Index {
            tokenizer: tokenizer.name().to_string(),
            doc_ids,
            doc_lens,
            avg_doc_len,
            postings,
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_ids.len()
    }

    /// Inverse document frequency with the usual smoothing:
    /// `ln((N - df + 0.5) / (df + 0.5) + 1)`.
    fn idf(&self, term: &str) -> f32 {
        let df = self.postings.get(term).map_or(0, |p| p.len()) as f32;
        let n = self.doc_count() as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Ranked retrieval.  Every document containing at least one query term
    /// is scored; no match is dropped for a low or negative score.  Ties
    /// break on document id so results are deterministic.
    pub fn query(
        &self,
        query: &str,
        limit: usize,
        doc_filter: Option<&HashSet<String>>,
        tokenizer: Tokenizer,
    ) -> Vec<RankedDoc> {
        let terms = tokenizer.tokenize_unique(query);
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut scores: HashMap<u32, (f32, Vec<String>)> = HashMap::new();
        for term in &terms {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(term);
            for posting in postings {
                let dl = self.doc_lens[posting.doc as usize] as f32;
                let avg = self.avg_doc_len.max(1.0);
                let tf = posting.tf as f32;
                let tf_component =
                    (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg));

                let entry = scores.entry(posting.doc).or_insert_with(|| (0.0, Vec::new()));
                entry.0 += idf * tf_component;
                entry.1.push(term.clone());
            }
        }

        let mut ranked: Vec<RankedDoc> = scores
            .into_iter()
            .map(|(ord, (score, mut terms))| {
                terms.sort_unstable();
                RankedDoc {
                    doc_id: self.doc_ids[ord as usize].clone(),
                    score,
                    terms,
                }
            })
            .filter(|r| doc_filter.is_none_or(|f| f.contains(&r.doc_id)))
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        ranked.truncate(limit);
        ranked
    }
}

// ── Context windows and highlights ────────────────────────────────────────────

/// A highlighted region of a snippet, with the term(s) it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub start: usize,
    pub end: usize,
    pub terms: Vec<String>,
}

/// Byte ranges in `text` whose normalized token matches one of `terms`.
fn term_occurrences(
    text: &str,
    terms: &[String],
    tokenizer: Tokenizer,
) -> Vec<(Range<usize>, String)> {
    let wanted: HashSet<&str> = terms.iter().map(String::as_str).collect();
    tokenizer
        .tokenize_with_offsets(text)
        .into_iter()
        .filter(|(_, tok)| wanted.contains(tok.as_str()))
        .collect()
}

/// Choose the window of `window_chars` bytes covering the densest cluster of
/// term occurrences.  Falls back to a document-head window when no term
/// occurs.  Both edges land on char boundaries.
pub fn best_window(
    text: &str,
    terms: &[String],
    window_chars: usize,
    tokenizer: Tokenizer,
) -> Range<usize> {
    let window_chars = window_chars.max(1);
    let occurrences = term_occurrences(text, terms, tokenizer);

    if occurrences.is_empty() {
        let end = ceil_char_boundary(text, window_chars.min(text.len()));
        return 0..end;
    }

    // Densest cluster: for each occurrence as cluster start, count how many
    // later occurrences still fit in the window.
    let mut best = (0usize, 1usize); // (occurrence index, covered count)
    for i in 0..occurrences.len() {
        let start = occurrences[i].0.start;
        let covered = occurrences[i..]
            .iter()
            .take_while(|(r, _)| r.end.saturating_sub(start) <= window_chars)
            .count();
        if covered > best.1 {
            best = (i, covered);
        }
    }

    let cluster_start = occurrences[best.0].0.start;
    let cluster_end = occurrences[best.0 + best.1 - 1].0.end;
    let slack = window_chars.saturating_sub(cluster_end - cluster_start);

    let start = cluster_start.saturating_sub(slack / 2);
    let end = (start + window_chars).min(text.len());
    let start = start.min(end);

    floor_char_boundary(text, start)..ceil_char_boundary(text, end)
}

/// Highlights inside `window`, re-based to snippet offsets.  Overlapping
/// regions are merged and carry the union of their terms.
pub fn highlights_within(
    text: &str,
    window: &Range<usize>,
    terms: &[String],
    tokenizer: Tokenizer,
) -> Vec<Highlight> {
    let inside: Vec<(Range<usize>, String)> = term_occurrences(text, terms, tokenizer)
        .into_iter()
        .filter(|(r, _)| r.start >= window.start && r.end <= window.end)
        .map(|(r, tok)| (r.start - window.start..r.end - window.start, tok))
        .collect();
    merge_highlights(inside)
}

/// Highlights for raw match ranges (the regex and literal search methods),
/// re-based to `window` and merged.  The attributed term is the literal
/// matched text.
pub fn match_highlights(
    text: &str,
    occurrences: &[(usize, usize)],
    window: &Range<usize>,
) -> Vec<Highlight> {
    let regions = occurrences
        .iter()
        .filter(|(s, e)| *s >= window.start && *e <= window.end)
        .map(|&(s, e)| (s - window.start..e - window.start, text[s..e].to_string()))
        .collect();
    merge_highlights(regions)
}

/// Merge overlapping regions; a merged region carries the union of the
/// underlying terms.
fn merge_highlights(mut regions: Vec<(Range<usize>, String)>) -> Vec<Highlight> {
    regions.sort_by_key(|(r, _)| (r.start, r.end));

    let mut merged: Vec<Highlight> = Vec::new();
    for (range, term) in regions {
        match merged.last_mut() {
            Some(last) if range.start < last.end => {
                last.end = last.end.max(range.end);
                if !last.terms.contains(&term) {
                    last.terms.push(term);
                }
            }
            _ => merged.push(Highlight {
                start: range.start,
                end: range.end,
                terms: vec![term],
            }),
        }
    }
    for h in &mut merged {
        h.terms.sort_unstable();
    }
    merged
}

pub(crate) fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

pub(crate) fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
