//! Sliding-window text chunker.
//!
//! Walks each extracted page with a fixed-size character window advancing by
//! `size - overlap`, trimming whitespace and dropping empty windows. The
//! chunk index increments globally across the whole document, so
//! `(document, chunk_index)` totally orders content in reading order: page
//! first, then position.
//!
//! Deterministic and side-effect-free; identical input always yields an
//! identical sequence, which is what makes delete-and-recreate reprocessing
//! safe.

use crate::extract::PageText;

/// One window of page text, not yet persisted. The indexer turns these into
/// chunk rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub page_number: Option<i64>,
    pub chunk_index: i64,
    pub text: String,
}

/// Split pages into overlapping windows of `size` characters. `overlap` must
/// be smaller than `size` (enforced at config load).
pub fn chunk_pages(pages: &[PageText], size: usize, overlap: usize) -> Vec<ChunkPiece> {
    let stride = size.saturating_sub(overlap).max(1);
    let mut pieces = Vec::new();
    let mut chunk_index: i64 = 0;

    for page in pages {
        let chars: Vec<char> = page.text.chars().collect();
        let mut start = 0usize;
        while start < chars.len() {
            let end = (start + size).min(chars.len());
            let window: String = chars[start..end].iter().collect();
            let trimmed = window.trim();
            if !trimmed.is_empty() {
                pieces.push(ChunkPiece {
                    page_number: page.page_number,
                    chunk_index,
                    text: trimmed.to_string(),
                });
                chunk_index += 1;
            }
            if end == chars.len() {
                break;
            }
            start += stride;
        }
    }

    pieces
}
