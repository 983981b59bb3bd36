//! Chunking strategies — pure functions from bytes to half-open ranges.
//!
//! A strategy plans a finite, ordered sequence of `[start, end)` byte ranges
//! that tile its input.  Planning has no side effects; persisting the
//! resulting spans is the runtime's job.  Parameters are validated at
//! construction time via [`ChunkStrategy::validate`].

use std::ops::Range;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Windows of `chunk_size` bytes advancing by `chunk_size - overlap`.
    Fixed {
        chunk_size: usize,
        #[serde(default)]
        overlap: usize,
    },
    /// Windows of `line_count` newline-delimited lines with `overlap` lines
    /// shared between consecutive windows, translated back to byte offsets.
    Lines {
        line_count: usize,
        #[serde(default)]
        overlap: usize,
    },
    /// Ranges between consecutive delimiter occurrences; the bytes of each
    /// delimiter belong to the following chunk.
    Delimiter {
        delimiter: String,
        #[serde(default)]
        is_regex: bool,
    },
}

impl ChunkStrategy {
    /// Reject invalid parameters with a caller-fixable error naming the
    /// offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            ChunkStrategy::Fixed { chunk_size, overlap } => {
                if *chunk_size == 0 {
                    return Err(EngineError::InvalidArgument(
                        "chunk_size must be > 0".into(),
                    ));
                }
                if overlap >= chunk_size {
                    return Err(EngineError::InvalidArgument(format!(
                        "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
                    )));
                }
            }
            ChunkStrategy::Lines { line_count, overlap } => {
                if *line_count == 0 {
                    return Err(EngineError::InvalidArgument(
                        "line_count must be > 0".into(),
                    ));
                }
                if overlap >= line_count {
                    return Err(EngineError::InvalidArgument(format!(
                        "overlap ({overlap}) must be smaller than line_count ({line_count})"
                    )));
                }
            }
            ChunkStrategy::Delimiter { delimiter, is_regex } => {
                if delimiter.is_empty() {
                    return Err(EngineError::InvalidArgument(
                        "delimiter must not be empty".into(),
                    ));
                }
                if *is_regex {
                    Regex::new(delimiter).map_err(|e| {
                        EngineError::InvalidArgument(format!("invalid delimiter regex: {e}"))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Plan the ranges for `bytes`, truncated to `max_chunks` when given.
    /// Identical inputs always yield identical ranges.
    pub fn plan(
        &self,
        bytes: &[u8],
        max_chunks: Option<usize>,
    ) -> Result<Vec<Range<usize>>, EngineError> {
        self.validate()?;
        let mut ranges = match self {
            ChunkStrategy::Fixed { chunk_size, overlap } => {
                plan_fixed(bytes.len(), *chunk_size, *overlap)
            }
            ChunkStrategy::Lines { line_count, overlap } => {
                plan_lines(bytes, *line_count, *overlap)
            }
            ChunkStrategy::Delimiter { delimiter, is_regex } => {
                plan_delimiter(bytes, delimiter, *is_regex)?
            }
        };
        if let Some(cap) = max_chunks {
            ranges.truncate(cap);
        }
        Ok(ranges)
    }

    /// Canonical JSON descriptor, recorded on every span the strategy
    /// produces.
    pub fn descriptor(&self) -> String {
        serde_json::to_string(self).expect("strategy serialization is infallible")
    }

    /// Short stable fingerprint of the descriptor — part of deterministic
    /// chunk span ids.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.descriptor().as_bytes());
        hex::encode(hasher.finalize())[..8].to_string()
    }
}

fn plan_fixed(len: usize, chunk_size: usize, overlap: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    if len == 0 {
        return ranges;
    }
    let step = chunk_size - overlap;
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(len);
        ranges.push(start..end);
        if end == len {
            break;
        }
        start += step;
    }
    ranges
}

fn plan_lines(bytes: &[u8], line_count: usize, overlap: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    if bytes.is_empty() {
        return ranges;
    }

    // Byte offset of every line start; a trailing newline does not open an
    // empty final line.
    let mut line_starts = vec![0usize];
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'\n' && i + 1 < bytes.len() {
            line_starts.push(i + 1);
        }
    }

    let total = line_starts.len();
    let step = line_count - overlap;
    let mut line = 0usize;
    loop {
        let end_line = (line + line_count).min(total);
        let start = line_starts[line];
        let end = if end_line == total {
            bytes.len()
        } else {
            line_starts[end_line]
        };
        ranges.push(start..end);
        if end_line == total {
            break;
        }
        line += step;
    }
    ranges
}

fn plan_delimiter(
    bytes: &[u8],
    delimiter: &str,
    is_regex: bool,
) -> Result<Vec<Range<usize>>, EngineError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let text = String::from_utf8_lossy(bytes);

    let mut boundaries: Vec<usize> = if is_regex {
        let re = Regex::new(delimiter)
            .map_err(|e| EngineError::InvalidArgument(format!("invalid delimiter regex: {e}")))?;
        re.find_iter(&text).map(|m| m.start()).collect()
    } else {
        text.match_indices(delimiter).map(|(i, _)| i).collect()
    };
    boundaries.dedup();

    let mut ranges = Vec::new();
    let mut start = 0usize;
    for boundary in boundaries {
        if boundary > start {
            ranges.push(start..boundary);
        }
        start = boundary;
    }
    if start < bytes.len() {
        ranges.push(start..bytes.len());
    }
    Ok(ranges)
}
