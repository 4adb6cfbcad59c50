//! Splits input text into size-bounded chunks along paragraph and sentence
//! boundaries, fusing runts so embeddings are not wasted on fragments.
use regex::Regex;
use std::sync::LazyLock;

/// Chunking bounds, in estimated tokens (one token ≈ four characters).
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Chunks below this estimate are fused with their successor.
    pub min_tokens: usize,
    /// Paragraphs above this estimate are split at sentence boundaries.
    pub max_tokens: usize,
    /// Inputs below this estimate are passed through whole.
    pub no_chunk_threshold: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_tokens: 50,
            max_tokens: 2000,
            no_chunk_threshold: 100,
        }
    }
}

/// Crude token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n{2,}").expect("Failed to compile paragraph break regex")
});

// Sentence enders, or a double dash, followed by whitespace. The ender stays
// with the preceding piece.
static SENTENCE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([.!?;]|--)\s+").expect("Failed to compile sentence boundary regex")
});

/// Split `text` into ordered chunks.
///
/// Deterministic and idempotent under a fixed config: short inputs pass
/// through whole; longer ones split on blank lines, then on sentence
/// boundaries where a paragraph exceeds `max_tokens`; undersized chunks are
/// fused left-to-right with their successor. The final chunk is kept even
/// when small.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if estimate_tokens(text) < config.no_chunk_threshold {
        return vec![text.to_string()];
    }

    let mut pieces: Vec<String> = Vec::new();
    for paragraph in PARAGRAPH_BREAK.split(text.trim()) {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if estimate_tokens(paragraph) > config.max_tokens {
            for sentence in split_sentences(paragraph) {
                let sentence = sentence.trim();
                if !sentence.is_empty() {
                    pieces.push(sentence.to_string());
                }
            }
        } else {
            pieces.push(paragraph.to_string());
        }
    }

    combine_small(pieces, config.min_tokens)
}

/// Split at sentence enders, keeping each ender with the text before it.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in SENTENCE_BOUNDARY.captures_iter(paragraph) {
        if let (Some(whole), Some(ender)) = (caps.get(0), caps.get(1)) {
            out.push(&paragraph[last..ender.end()]);
            last = whole.end();
        }
    }
    if last < paragraph.len() {
        out.push(&paragraph[last..]);
    }
    out
}

/// Fuse undersized chunks with their successor, left to right. The final
/// chunk is never dropped.
fn combine_small(pieces: Vec<String>, min_tokens: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    for piece in pieces {
        current = Some(match current.take() {
            None => piece,
            Some(held) if estimate_tokens(&held) < min_tokens => format!("{held} {piece}"),
            Some(held) => {
                out.push(held);
                piece
            }
        });
    }
    if let Some(held) = current {
        out.push(held);
    }
    out
}
