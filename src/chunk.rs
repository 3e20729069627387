//! Sentence-aware sliding-window text chunker.
//!
//! Splits source text into overlapping [`Chunk`]s of at most `max_chars`
//! characters. Each chunk id is derived from its source id and position
//! (`{source_id}_chunk_{n}`), so chunking identical content twice yields
//! the identical id sequence and a re-index can replace chunks in place.
//!
//! # Algorithm
//!
//! 1. Take a window of up to `max_chars` characters starting at `start`.
//! 2. If the window stops short of the end of the text, look backward in
//!    it for the last `". "`. If that period lies more than 70% of
//!    `max_chars` past `start`, cut right after the period instead of at
//!    the hard limit.
//! 3. Trim the window; empty windows are dropped.
//! 4. Start the next window `overlap_chars` before the cut, but always at
//!    least one character after the previous start.
//!
//! [`chunk_content`] and [`count_chunks`] both drive the same
//! [`Boundaries`] iterator, so a progress total computed up front always
//! matches the number of chunks later written.

use crate::models::{Chunk, ChunkMetadata, Source};

/// Default window size in characters.
pub const DEFAULT_MAX_CHARS: usize = 800;

/// Default overlap between consecutive windows in characters.
pub const DEFAULT_OVERLAP_CHARS: usize = 150;

/// A sentence break is only used past this fraction of the window.
const SENTENCE_BREAK_RATIO: f64 = 0.7;

/// Window size and overlap for the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            overlap_chars: DEFAULT_OVERLAP_CHARS,
        }
    }
}

/// Iterator over the raw (untrimmed) byte spans of each window.
struct Boundaries<'a> {
    text: &'a str,
    /// Byte offset of every char, plus `text.len()` as a sentinel.
    offsets: Vec<usize>,
    /// Char index where the next window starts.
    next_start: usize,
    done: bool,
    params: ChunkParams,
}

impl<'a> Boundaries<'a> {
    fn new(text: &'a str, params: ChunkParams) -> Self {
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        offsets.push(text.len());
        Self {
            text,
            offsets,
            next_start: 0,
            done: text.is_empty(),
            params,
        }
    }

    fn char_count(&self) -> usize {
        self.offsets.len() - 1
    }

    fn char_index_of(&self, byte: usize) -> usize {
        self.offsets.binary_search(&byte).unwrap_or_else(|i| i)
    }
}

impl Iterator for Boundaries<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.char_count();
        if self.done || self.next_start >= total {
            return None;
        }

        let max_chars = self.params.max_chars.max(1);
        let start = self.next_start;
        let mut end = (start + max_chars).min(total);

        if end < total {
            let window = &self.text[self.offsets[start]..self.offsets[end]];
            if let Some(rel) = window.rfind(". ") {
                let period = self.char_index_of(self.offsets[start] + rel);
                if (period - start) as f64 > max_chars as f64 * SENTENCE_BREAK_RATIO {
                    end = period + 1;
                }
            }
        }

        if end >= total {
            self.done = true;
        } else {
            self.next_start = end
                .saturating_sub(self.params.overlap_chars)
                .max(start + 1);
        }

        Some((self.offsets[start], self.offsets[end]))
    }
}

/// Split `content` into trimmed, non-empty chunk strings.
pub fn chunk_content(content: &str, params: ChunkParams) -> Vec<String> {
    Boundaries::new(content, params)
        .map(|(s, e)| content[s..e].trim())
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Number of chunks [`chunk_content`] would produce, without building them.
pub fn count_chunks(content: &str, params: ChunkParams) -> usize {
    Boundaries::new(content, params)
        .filter(|&(s, e)| !content[s..e].trim().is_empty())
        .count()
}

/// Chunk a source's text into index-ready [`Chunk`]s.
///
/// `type_label` is stored as the chunk's `sourceType` metadata; the watch
/// loop passes `"text"` for sources whose type it does not recognize.
pub fn build_chunks(
    source: &Source,
    content: &str,
    type_label: &str,
    params: ChunkParams,
) -> Vec<Chunk> {
    chunk_content(content, params)
        .into_iter()
        .enumerate()
        .map(|(n, text)| Chunk {
            id: chunk_id(&source.id, n),
            content: text,
            metadata: ChunkMetadata {
                source_id: source.id.clone(),
                source_type: type_label.to_string(),
                chunk_index: n,
                title: source.title.clone(),
            },
        })
        .collect()
}

pub fn chunk_id(source_id: &str, index: usize) -> String {
    format!("{}_chunk_{}", source_id, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;

    fn params(max_chars: usize, overlap_chars: usize) -> ChunkParams {
        ChunkParams {
            max_chars,
            overlap_chars,
        }
    }

    fn source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            title: "Doc".to_string(),
            path: format!("app/data/{}", id),
            note_id: None,
            source_type: SourceType::Text,
            created_at: None,
        }
    }

    #[test]
    fn test_empty_content_has_no_chunks() {
        assert!(chunk_content("", ChunkParams::default()).is_empty());
        assert_eq!(count_chunks("", ChunkParams::default()), 0);
        assert_eq!(count_chunks("   \n\t ", ChunkParams::default()), 0);
    }

    #[test]
    fn test_short_content_single_chunk() {
        let chunks = chunk_content("  Hello, world!  ", ChunkParams::default());
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
        assert_eq!(count_chunks("Hello, world!", ChunkParams::default()), 1);
    }

    #[test]
    fn test_cuts_after_late_sentence_break() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta.";
        let chunks = chunk_content(text, params(20, 5));
        assert_eq!(chunks[0], "Alpha beta gamma.");
        assert_eq!(chunks.len(), count_chunks(text, params(20, 5)));
    }

    #[test]
    fn test_ignores_early_sentence_break() {
        // The only ". " sits at 60% of the window, so the cut stays at 20.
        let text = "Sentence one. Sentence two. Sentence three.";
        let chunks = chunk_content(text, params(20, 5));
        assert_eq!(chunks[0], "Sentence one. Senten");
    }

    #[test]
    fn test_hard_cut_without_sentence_break() {
        let text = "abcdefghij".repeat(10);
        let chunks = chunk_content(&text, params(20, 5));
        assert_eq!(chunks[0].chars().count(), 20);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
    }

    #[test]
    fn test_terminates_when_overlap_exceeds_window() {
        let text = "x".repeat(30);
        let chunks = chunk_content(&text, params(10, 50));
        assert_eq!(chunks.len(), 21);
        assert_eq!(count_chunks(&text, params(10, 50)), 21);
    }

    #[test]
    fn test_count_matches_chunks() {
        let samples = [
            String::new(),
            "One.".to_string(),
            "First sentence here. Second one follows. ".repeat(40),
            "no breaks at all ".repeat(120),
            "Ünïcödé tëxt. Wïth àccents. ".repeat(60),
        ];
        for p in [params(800, 150), params(50, 10), params(30, 40), params(1, 0)] {
            for text in &samples {
                assert_eq!(
                    count_chunks(text, p),
                    chunk_content(text, p).len(),
                    "mismatch for {:?}",
                    p
                );
            }
        }
    }

    #[test]
    fn test_spans_cover_content() {
        let text = "The quick brown fox. Jumps over the lazy dog. ".repeat(30);
        let spans: Vec<(usize, usize)> = Boundaries::new(&text, params(64, 16)).collect();
        let mut rebuilt = String::new();
        let mut covered = 0;
        for (s, e) in spans {
            assert!(s <= covered, "gap before byte {}", s);
            if e > covered {
                rebuilt.push_str(&text[covered..e]);
                covered = e;
            }
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_chunk_ids_are_stable() {
        let text = "Stable content. ".repeat(100);
        let a = build_chunks(&source("s1"), &text, "text", params(100, 20));
        let b = build_chunks(&source("s1"), &text, "text", params(100, 20));
        assert_eq!(a, b);
        assert_eq!(a[0].id, "s1_chunk_0");
        for (i, c) in a.iter().enumerate() {
            assert_eq!(c.metadata.chunk_index, i);
            assert_eq!(c.id, chunk_id("s1", i));
            assert_eq!(c.metadata.source_type, "text");
        }
    }
}
