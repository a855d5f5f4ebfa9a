//! Text chunking for the ingestion pipeline.
//!
//! Token counts are estimated as `ceil(chars / 4)`; a token budget converts
//! to a character budget as `tokens * 4`. All offsets are char offsets into
//! the source text, so slicing is boundary-safe for any UTF-8 input.

use memory_model::TextChunk;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("invalid chunk configuration: {message}")]
    InvalidConfig { message: String },
}

/// How chunk boundaries are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Sliding window over raw characters.
    Fixed,
    /// Accumulate blank-line paragraphs up to the budget.
    Semantic,
    /// As semantic, but oversized paragraphs are further split on sentence ends.
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Budget per chunk, in estimated tokens.
    pub chunk_size: usize,
    /// Overlap carried between adjacent chunks, in estimated tokens.
    /// Must be strictly less than `chunk_size`.
    pub chunk_overlap: usize,
    pub strategy: ChunkStrategy,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            chunk_overlap: 20,
            strategy: ChunkStrategy::Hybrid,
        }
    }
}

/// Estimated token count for `text` (`ceil(chars / 4)`).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Split `text` into ordered chunks. Pure and deterministic: identical
/// arguments always yield identical chunk sequences.
///
/// Blank input yields an empty vec; text that fits the budget yields one
/// chunk spanning the full text.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Result<Vec<TextChunk>, ChunkError> {
    validate(config)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let source = SourceText::new(text);
    let char_budget = config.chunk_size * 4;
    let char_overlap = config.chunk_overlap * 4;

    let chunks = match config.strategy {
        ChunkStrategy::Fixed => chunk_fixed(&source, char_budget, char_overlap),
        ChunkStrategy::Semantic => chunk_paragraphs(&source, char_budget, char_overlap, false),
        ChunkStrategy::Hybrid => chunk_paragraphs(&source, char_budget, char_overlap, true),
    };
    Ok(chunks)
}

/// Async variant of [`chunk_text`]. Produces byte-identical output but yields
/// to the runtime before heavy work begins so large documents do not starve
/// other tasks on the same thread.
pub async fn chunk_text_async(
    text: &str,
    config: &ChunkConfig,
) -> Result<Vec<TextChunk>, ChunkError> {
    validate(config)?;
    tokio::task::yield_now().await;
    chunk_text(text, config)
}

fn validate(config: &ChunkConfig) -> Result<(), ChunkError> {
    if config.chunk_size == 0 {
        return Err(ChunkError::InvalidConfig {
            message: "chunk_size must be greater than zero".into(),
        });
    }
    if config.chunk_overlap >= config.chunk_size {
        return Err(ChunkError::InvalidConfig {
            message: format!(
                "chunk_overlap ({}) must be in [0, chunk_size ({}))",
                config.chunk_overlap, config.chunk_size
            ),
        });
    }
    Ok(())
}

/// Source text with a char-offset -> byte-offset map for cheap slicing.
struct SourceText<'a> {
    text: &'a str,
    /// Byte offset of each char, plus a trailing entry at `text.len()`.
    byte_at: Vec<usize>,
}

impl<'a> SourceText<'a> {
    fn new(text: &'a str) -> Self {
        let mut byte_at: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        byte_at.push(text.len());
        Self { text, byte_at }
    }

    fn char_len(&self) -> usize {
        self.byte_at.len() - 1
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[self.byte_at[start]..self.byte_at[end]]
    }

    fn char_at(&self, idx: usize) -> Option<char> {
        self.text[self.byte_at[idx]..].chars().next()
    }
}

fn chunk_fixed(source: &SourceText<'_>, char_budget: usize, char_overlap: usize) -> Vec<TextChunk> {
    let total = source.char_len();
    // Overlap is strictly smaller than the budget, but keep the loop safe
    // against a zero step regardless.
    let step = char_budget.saturating_sub(char_overlap).max(1);

    let mut out = Vec::new();
    let mut pos = 0usize;
    loop {
        let end = (pos + char_budget).min(total);
        out.push(TextChunk {
            text: source.slice(pos, end).to_string(),
            index: out.len(),
            start: pos,
            end,
        });
        if end == total {
            break;
        }
        pos += step;
    }
    out
}

/// A paragraph or sentence span in char offsets.
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
}

/// Paragraph accumulation shared by the semantic and hybrid strategies.
/// Each flushed chunk seeds the next with its trailing `char_overlap` chars;
/// `start`/`end` cover the source span of the accumulated segments, not the
/// seeded overlap prefix.
fn chunk_paragraphs(
    source: &SourceText<'_>,
    char_budget: usize,
    char_overlap: usize,
    split_oversized: bool,
) -> Vec<TextChunk> {
    let mut segments = paragraph_segments(source);
    if split_oversized {
        segments = segments
            .into_iter()
            .flat_map(|seg| {
                if seg.end - seg.start > char_budget {
                    sentence_segments(source, seg)
                } else {
                    vec![seg]
                }
            })
            .collect();
    }

    let mut out: Vec<TextChunk> = Vec::new();
    let mut acc = String::new();
    let mut acc_chars = 0usize;
    let mut span: Option<Segment> = None;
    let mut seed = String::new();
    let mut seed_chars = 0usize;

    for seg in segments {
        let seg_text = source.slice(seg.start, seg.end);
        let seg_chars = seg.end - seg.start;
        let joiner = if acc_chars > 0 { 2 } else { 0 };

        if acc_chars > 0 && seed_chars + acc_chars + joiner + seg_chars > char_budget {
            flush(&mut out, &seed, &acc, span.take());
            seed = tail_chars(&format!("{seed}{acc}"), char_overlap);
            seed_chars = seed.chars().count();
            acc.clear();
            acc_chars = 0;
        }

        if acc_chars > 0 {
            acc.push_str("\n\n");
            acc_chars += 2;
        }
        acc.push_str(seg_text);
        acc_chars += seg_chars;
        span = Some(match span {
            Some(s) => Segment {
                start: s.start,
                end: seg.end,
            },
            None => seg,
        });
    }

    if acc_chars > 0 {
        flush(&mut out, &seed, &acc, span.take());
    }
    out
}

fn flush(out: &mut Vec<TextChunk>, seed: &str, acc: &str, span: Option<Segment>) {
    let span = match span {
        Some(s) => s,
        None => return,
    };
    let mut text = String::with_capacity(seed.len() + acc.len());
    text.push_str(seed);
    text.push_str(acc);
    out.push(TextChunk {
        text,
        index: out.len(),
        start: span.start,
        end: span.end,
    });
}

fn tail_chars(text: &str, count: usize) -> String {
    if count == 0 {
        return String::new();
    }
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(count)).collect()
}

/// Paragraph spans separated by blank lines. Leading/trailing blank runs are
/// dropped; interior newlines within a paragraph are kept.
fn paragraph_segments(source: &SourceText<'_>) -> Vec<Segment> {
    let total = source.char_len();
    let mut segments = Vec::new();
    let mut pos = 0usize;

    while pos < total {
        // Skip separator whitespace between paragraphs.
        while pos < total && source.char_at(pos).is_some_and(char::is_whitespace) {
            pos += 1;
        }
        if pos >= total {
            break;
        }
        let start = pos;
        let mut end = pos;
        let mut newline_run = 0usize;
        while end < total {
            let ch = source.char_at(end).unwrap_or(' ');
            if ch == '\n' {
                newline_run += 1;
                if newline_run >= 2 {
                    // Blank line: paragraph ended before the newline run.
                    break;
                }
            } else if !ch.is_whitespace() {
                newline_run = 0;
            }
            end += 1;
        }
        // Trim the trailing newline run (and any whitespace before it) off the span.
        let mut para_end = end;
        while para_end > start
            && source
                .char_at(para_end - 1)
                .is_some_and(char::is_whitespace)
        {
            para_end -= 1;
        }
        if para_end > start {
            segments.push(Segment {
                start,
                end: para_end,
            });
        }
        pos = end;
    }
    segments
}

/// Sentence spans within `seg`: boundaries after `.`, `!`, or `?` followed by
/// whitespace, punctuation retained with the preceding sentence.
fn sentence_segments(source: &SourceText<'_>, seg: Segment) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut start = seg.start;
    let mut pos = seg.start;
    while pos < seg.end {
        let ch = source.char_at(pos).unwrap_or(' ');
        let next_is_ws = pos + 1 < seg.end
            && source
                .char_at(pos + 1)
                .is_some_and(char::is_whitespace);
        if matches!(ch, '.' | '!' | '?') && (next_is_ws || pos + 1 == seg.end) {
            out.push(Segment {
                start,
                end: pos + 1,
            });
            // Next sentence starts at the first non-whitespace char.
            let mut next = pos + 1;
            while next < seg.end && source.char_at(next).is_some_and(char::is_whitespace) {
                next += 1;
            }
            start = next;
            pos = next;
            continue;
        }
        pos += 1;
    }
    if start < seg.end {
        out.push(Segment {
            start,
            end: seg.end,
        });
    }
    if out.is_empty() {
        out.push(seg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(chunk_size: usize, chunk_overlap: usize) -> ChunkConfig {
        ChunkConfig {
            chunk_size,
            chunk_overlap,
            strategy: ChunkStrategy::Fixed,
        }
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = chunk_text("hello", &fixed(0, 0)).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_overlap_not_below_size() {
        let err = chunk_text("hello", &fixed(4, 4)).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidConfig { .. }));
    }

    #[test]
    fn blank_input_yields_no_chunks() {
        assert!(chunk_text("", &fixed(10, 0)).unwrap().is_empty());
        assert!(chunk_text("   \n\n  ", &fixed(10, 0)).unwrap().is_empty());
    }

    #[test]
    fn short_text_yields_single_full_span_chunk() {
        let chunks = chunk_text("hello world", &fixed(10, 0)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 11));
    }

    #[test]
    fn fixed_chunking_splits_at_char_budget() {
        // 100 chars at a 40-char budget: [0,40) [40,80) [80,100).
        let text = "x".repeat(100);
        let chunks = chunk_text(&text, &fixed(10, 0)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 40));
        assert_eq!((chunks[1].start, chunks[1].end), (40, 80));
        assert_eq!((chunks[2].start, chunks[2].end), (80, 100));
        assert_eq!(chunks[2].text.len(), 20);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn fixed_chunking_is_deterministic() {
        let text: String = ('a'..='z').cycle().take(500).collect();
        let cfg = fixed(12, 3);
        let a = chunk_text(&text, &cfg).unwrap();
        let b = chunk_text(&text, &cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_overlap_law_holds_for_adjacent_chunks() {
        let text: String = ('a'..='z').cycle().take(300).collect();
        let overlap_tokens = 3;
        let chunks = chunk_text(&text, &fixed(10, overlap_tokens)).unwrap();
        assert!(chunks.len() > 2);
        let overlap_chars = overlap_tokens * 4;
        for pair in chunks.windows(2) {
            let tail: String = pair[0]
                .text
                .chars()
                .skip(pair[0].text.chars().count() - overlap_chars)
                .collect();
            let head: String = pair[1].text.chars().take(overlap_chars).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn fixed_handles_multibyte_text() {
        let text = "é".repeat(100);
        let chunks = chunk_text(&text, &fixed(10, 0)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text.chars().count(), 40);
    }

    #[test]
    fn semantic_groups_paragraphs_under_budget() {
        let text = "first paragraph here.\n\nsecond paragraph here.\n\nthird one.";
        let cfg = ChunkConfig {
            chunk_size: 12, // 48 chars
            chunk_overlap: 0,
            strategy: ChunkStrategy::Semantic,
        };
        let chunks = chunk_text(text, &cfg).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].text,
            "first paragraph here.\n\nsecond paragraph here."
        );
        assert_eq!(chunks[1].text, "third one.");
    }

    #[test]
    fn semantic_seeds_next_chunk_with_overlap() {
        let text = "aaaa aaaa aaaa aaaa.\n\nbbbb bbbb bbbb bbbb.\n\ncccc cccc cccc cccc.";
        let cfg = ChunkConfig {
            chunk_size: 6, // 24 chars: one paragraph per chunk
            chunk_overlap: 2,
            strategy: ChunkStrategy::Semantic,
        };
        let chunks = chunk_text(text, &cfg).unwrap();
        assert_eq!(chunks.len(), 3);
        // Second chunk starts with the 8-char tail of the first.
        assert!(chunks[1].text.starts_with("aa aaaa."));
        assert!(chunks[1].text.ends_with("bbbb bbbb bbbb bbbb."));
    }

    #[test]
    fn hybrid_splits_oversized_paragraph_on_sentences() {
        let long_para =
            "One sentence goes here. Another sentence follows it! A third one asks? Final words.";
        let cfg = ChunkConfig {
            chunk_size: 8, // 32 chars: the paragraph far exceeds the budget
            chunk_overlap: 0,
            strategy: ChunkStrategy::Hybrid,
        };
        let chunks = chunk_text(long_para, &cfg).unwrap();
        assert!(chunks.len() > 1);
        // Punctuation stays with its sentence.
        assert!(chunks[0].text.ends_with('.') || chunks[0].text.ends_with('!'));
        // No chunk loses content: concatenation covers every sentence.
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("|");
        assert!(joined.contains("One sentence goes here."));
        assert!(joined.contains("Final words."));
    }

    #[test]
    fn semantic_is_deterministic() {
        let text = "alpha beta.\n\ngamma delta epsilon.\n\nzeta eta theta iota kappa.";
        let cfg = ChunkConfig {
            chunk_size: 8,
            chunk_overlap: 2,
            strategy: ChunkStrategy::Semantic,
        };
        assert_eq!(chunk_text(text, &cfg).unwrap(), chunk_text(text, &cfg).unwrap());
    }

    #[tokio::test]
    async fn async_variant_matches_sync_output() {
        let text: String = ('a'..='z').cycle().take(400).collect();
        for strategy in [
            ChunkStrategy::Fixed,
            ChunkStrategy::Semantic,
            ChunkStrategy::Hybrid,
        ] {
            let cfg = ChunkConfig {
                chunk_size: 12,
                chunk_overlap: 4,
                strategy,
            };
            let sync = chunk_text(&text, &cfg).unwrap();
            let async_ = chunk_text_async(&text, &cfg).await.unwrap();
            assert_eq!(sync, async_);
        }
    }

    #[tokio::test]
    async fn async_variant_propagates_invalid_config() {
        let err = chunk_text_async("hello", &fixed(0, 0)).await.unwrap_err();
        assert!(matches!(err, ChunkError::InvalidConfig { .. }));
    }
}
