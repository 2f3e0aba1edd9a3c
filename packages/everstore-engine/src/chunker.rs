//! Semantic text segmentation with embedding-based boundary detection.
//!
//! The chunker splits authored text into retrieval-sized chunks. Structured
//! text (anything with sentence-terminal punctuation) segments on sentence
//! boundaries; unstructured voice-transcription style input falls back to
//! sliding token windows. Adjacent segments are embedded in one batch and a
//! chunk boundary is placed wherever the cosine similarity drops below the
//! configured threshold, or where the running chunk would overflow.
//!
//! Output contract: chunks are strictly sequential and non-overlapping on
//! token indices (`a.end_token == b.start_token`), their token counts sum
//! to the input token count, and every chunk except possibly the trailing
//! one lies within `[min_chunk_size, max_chunk_size]`.

use std::ops::Range;
use std::sync::Arc;

use everstore_index::{distance, Metric};
use everstore_storage::EmbeddingService;

use crate::error::{EngineError, Result};

/// Chunker tuning knobs. Token counts are whitespace tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkerConfig {
    /// Sliding-window width for unstructured input.
    pub window_size: usize,
    /// Overlap between consecutive windows; erased from the output.
    pub overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Boundary when adjacent-segment cosine similarity drops below this.
    pub similarity_threshold: f32,
}

impl ChunkerConfig {
    /// Coarse chunks for parent documents.
    pub fn parent() -> Self {
        Self {
            window_size: 200,
            overlap: 50,
            min_chunk_size: 128,
            max_chunk_size: 400,
            similarity_threshold: 0.5,
        }
    }

    /// Fine-grained chunks for child passages.
    pub fn child() -> Self {
        Self {
            window_size: 30,
            overlap: 10,
            min_chunk_size: 10,
            max_chunk_size: 60,
            similarity_threshold: 0.5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 || self.max_chunk_size == 0 {
            return Err(EngineError::config("chunk sizes must be positive"));
        }
        if self.overlap >= self.window_size {
            return Err(EngineError::config("overlap must be smaller than the window"));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(EngineError::config("minChunkSize exceeds maxChunkSize"));
        }
        // Keeps every piece of an oversize split above the minimum.
        if self.min_chunk_size * 2 > self.max_chunk_size {
            return Err(EngineError::config(
                "minChunkSize must be at most half of maxChunkSize",
            ));
        }
        Ok(())
    }
}

/// A contiguous token range of the input, with its text and an optional
/// embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start_token: usize,
    pub end_token: usize,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn token_count(&self) -> usize {
        self.end_token - self.start_token
    }
}

pub struct SemanticChunker {
    embedder: Arc<dyn EmbeddingService>,
    config: ChunkerConfig,
}

impl SemanticChunker {
    pub fn new(embedder: Arc<dyn EmbeddingService>, config: ChunkerConfig) -> Self {
        Self { embedder, config }
    }

    pub fn parent(embedder: Arc<dyn EmbeddingService>) -> Self {
        Self::new(embedder, ChunkerConfig::parent())
    }

    pub fn child(embedder: Arc<dyn EmbeddingService>) -> Self {
        Self::new(embedder, ChunkerConfig::child())
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` into chunks per the configured limits.
    pub async fn chunk(&self, text: &str) -> Result<Vec<Chunk>> {
        self.config.validate()?;
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let structured = text.contains(['.', '!', '?']);
        let segments = if structured {
            sentence_segments(&tokens)
        } else {
            window_segments(tokens.len(), self.config.window_size, self.config.overlap)
        };

        if segments.len() == 1 && segments[0].len() <= self.config.max_chunk_size {
            return Ok(vec![build_chunk(&tokens, 0..tokens.len())]);
        }

        let segment_texts: Vec<String> = segments
            .iter()
            .map(|r| tokens[r.clone()].join(" "))
            .collect();
        let vectors = self.embedder.generate_batch(&segment_texts).await?;
        if vectors.len() != segments.len() {
            return Err(EngineError::Embedding(format!(
                "batch returned {} vectors for {} segments",
                vectors.len(),
                segments.len()
            )));
        }

        let groups = self.group_segments(&segments, &vectors);
        let merged = merge_undersized(groups, self.config.min_chunk_size);
        let normalized = normalize_positions(merged, tokens.len());
        let bounded = enforce_max(normalized, self.config.max_chunk_size);

        Ok(bounded
            .into_iter()
            .map(|range| build_chunk(&tokens, range))
            .collect())
    }

    /// Walk adjacent segment pairs placing boundaries on semantic drops and
    /// size overflows. Ranges may still overlap here for windowed input.
    fn group_segments(&self, segments: &[Range<usize>], vectors: &[Vec<f32>]) -> Vec<Range<usize>> {
        let mut groups = Vec::new();
        let mut current = segments[0].clone();
        for i in 0..segments.len() - 1 {
            let next = &segments[i + 1];
            let similarity = (1.0 - distance(Metric::Cosine, &vectors[i], &vectors[i + 1])) as f32;
            let prospective = next.end - current.start;
            if similarity < self.config.similarity_threshold
                || prospective > self.config.max_chunk_size
            {
                groups.push(current);
                current = next.clone();
            } else {
                current.end = next.end;
            }
        }
        groups.push(current);
        groups
    }
}

fn build_chunk(tokens: &[&str], range: Range<usize>) -> Chunk {
    Chunk {
        text: tokens[range.clone()].join(" "),
        start_token: range.start,
        end_token: range.end,
        embedding: None,
    }
}

/// Token ranges of sentences; a trailing run without terminal punctuation
/// becomes the final segment.
fn sentence_segments(tokens: &[&str]) -> Vec<Range<usize>> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        let trimmed = token.trim_end_matches(['"', '\'', ')', ']', '”', '’']);
        if trimmed.ends_with(['.', '!', '?']) {
            segments.push(start..i + 1);
            start = i + 1;
        }
    }
    if start < tokens.len() {
        segments.push(start..tokens.len());
    }
    segments
}

/// Overlapping sliding windows covering `[0, n)`.
fn window_segments(n: usize, window: usize, overlap: usize) -> Vec<Range<usize>> {
    let step = window - overlap;
    let mut segments = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + window).min(n);
        segments.push(start..end);
        if end == n {
            break;
        }
        start += step;
    }
    segments
}

/// Merge groups shorter than `min` into their preceding neighbor (or let
/// the following group absorb a short head).
fn merge_undersized(groups: Vec<Range<usize>>, min: usize) -> Vec<Range<usize>> {
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(groups.len());
    for group in groups {
        match merged.last_mut() {
            Some(last) if group.len() < min || last.len() < min => {
                last.end = group.end;
            }
            _ => merged.push(group),
        }
    }
    merged
}

/// Clip range starts to the previous range end, erasing window overlap so
/// the chunks partition the token stream.
fn normalize_positions(groups: Vec<Range<usize>>, n: usize) -> Vec<Range<usize>> {
    let mut normalized = Vec::with_capacity(groups.len());
    let mut cursor = 0;
    for group in groups {
        let end = group.end.min(n);
        if end > cursor {
            normalized.push(cursor..end);
            cursor = end;
        }
    }
    if cursor < n {
        normalized.push(cursor..n);
    }
    normalized
}

/// Final hard-limit pass: split anything over `max` into balanced windows
/// of at most `max` tokens.
fn enforce_max(groups: Vec<Range<usize>>, max: usize) -> Vec<Range<usize>> {
    let mut bounded = Vec::with_capacity(groups.len());
    for group in groups {
        let len = group.len();
        if len <= max {
            bounded.push(group);
            continue;
        }
        let pieces = len.div_ceil(max);
        let base = len / pieces;
        let extra = len % pieces;
        let mut start = group.start;
        for i in 0..pieces {
            let size = base + usize::from(i < extra);
            bounded.push(start..start + size);
            start += size;
        }
    }
    bounded
}
