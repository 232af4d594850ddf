//! Recursive boundary-preserving text chunker.
//!
//! Splits a document into overlapping windows without splitting mid-word where
//! avoidable: separators are tried in priority order (paragraph, line, sentence,
//! clause, word) before falling back to a forced per-character split.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " ", ""];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
    pub total_chunks: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Normalize runs of horizontal whitespace to single spaces; newlines are kept
/// since they carry paragraph/line structure the splitter relies on.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        if c == '\n' {
            out.push(c);
            last_was_space = false;
        } else if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// Split `text` on the first separator (in priority order starting at
/// `from_sep_idx`) that yields pieces all within `chunk_size`. Falls back to a
/// forced per-character split (`""` separator) if no earlier choice works.
fn split_recursive(text: &str, chunk_size: usize, from_sep_idx: usize) -> Vec<String> {
    if text.chars().count() <= chunk_size {
        return vec![text.to_string()];
    }

    for (offset, sep) in SEPARATORS[from_sep_idx..].iter().enumerate() {
        let sep_idx = from_sep_idx + offset;
        if sep.is_empty() {
            // Forced fallback: one piece per character. The greedy accumulator in
            // `chunk` re-packs these up to `chunk_size`; handing it anything bigger
            // than a single char here can push a buffer that already carries an
            // overlap tail past `chunk_size`.
            return text.chars().map(|c| c.to_string()).collect();
        }

        let pieces: Vec<&str> = text.split(sep).collect();
        if pieces.len() < 2 {
            continue;
        }

        // Re-glue the separator except after the final piece.
        let mut rejoined: Vec<String> = Vec::with_capacity(pieces.len());
        for (i, p) in pieces.iter().enumerate() {
            if i + 1 < pieces.len() {
                rejoined.push(format!("{}{}", p, sep));
            } else if !p.is_empty() {
                rejoined.push(p.to_string());
            }
        }

        if rejoined.iter().all(|p| p.chars().count() <= chunk_size) {
            return rejoined;
        }

        // Recurse into oversized pieces using the remaining lower-priority separators.
        let mut out = Vec::new();
        for p in rejoined {
            if p.chars().count() > chunk_size {
                out.extend(split_recursive(&p, chunk_size, sep_idx + 1));
            } else {
                out.push(p);
            }
        }
        return out;
    }

    vec![text.to_string()]
}

fn tail_chars(s: &str, n: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= n {
        s.to_string()
    } else {
        chars[chars.len() - n..].iter().collect()
    }
}

pub fn chunk(
    text: &str,
    metadata: &HashMap<String, serde_json::Value>,
    chunk_size: usize,
    chunk_overlap: usize,
) -> AppResult<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(AppError::InvalidArgument("chunk_size must be > 0".into()));
    }
    if chunk_overlap >= chunk_size {
        return Err(AppError::InvalidArgument(
            "chunk_overlap must be smaller than chunk_size".into(),
        ));
    }

    let normalized = normalize(text);
    if normalized.trim().is_empty() {
        return Err(AppError::EmptyInput);
    }

    let pieces = split_recursive(&normalized, chunk_size, 0);

    // Greedily accumulate pieces into buffers, carrying an overlap tail forward.
    let mut buffers: Vec<String> = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if !current.is_empty() && current.chars().count() + piece.chars().count() > chunk_size {
            let overlap_tail = tail_chars(&current, chunk_overlap);
            buffers.push(std::mem::take(&mut current));
            current = overlap_tail;
        }
        current.push_str(&piece);
    }
    if !current.is_empty() {
        buffers.push(current);
    }

    let total_chunks = buffers.len();
    let mut chunks = Vec::with_capacity(total_chunks);
    let mut cursor = 0usize;

    for (index, buf) in buffers.into_iter().enumerate() {
        let char_start = cursor;
        let len = buf.chars().count();
        let char_end = char_start + len;
        let mut meta = metadata.clone();
        meta.insert("chunk_index".into(), serde_json::json!(index));
        meta.insert("chunk_total".into(), serde_json::json!(total_chunks));
        meta.insert("char_start".into(), serde_json::json!(char_start));
        meta.insert("char_end".into(), serde_json::json!(char_end));

        chunks.push(Chunk {
            text: buf,
            index,
            total_chunks,
            char_start,
            char_end,
            metadata: meta,
            embedding: None,
        });

        // The next buffer starts `chunk_overlap` chars before this one ends,
        // matching the carried-forward overlap tail (clamped at the first chunk).
        cursor = if char_end > chunk_overlap { char_end - chunk_overlap } else { char_end };
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_when_short() {
        let chunks = chunk("hello world", &HashMap::new(), 100, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn splits_with_overlap() {
        let text = "abcdefghij";
        let chunks = chunk(text, &HashMap::new(), 4, 1).unwrap();
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].char_start, 0);
        for c in &chunks {
            assert!(c.text.chars().count() <= 4);
        }
    }

    #[test]
    fn rejects_bad_overlap() {
        let err = chunk("hello", &HashMap::new(), 4, 4).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_empty_text() {
        let err = chunk("   ", &HashMap::new(), 10, 2).unwrap_err();
        assert!(matches!(err, AppError::EmptyInput));
    }
}
