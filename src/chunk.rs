//! Fixed-width overlapping text chunker.
//!
//! Splits cleaned document text into windows of roughly `chunk_size`
//! characters. A window that would end inside a word is extended forward to
//! the next whitespace or sentence-ending punctuation, and consecutive
//! windows overlap by `chunk_overlap` characters to preserve context across
//! boundaries. Each chunk carries its offsets and a best-effort page number.

use std::collections::BTreeMap;

/// Bytes that may terminate a window: whitespace or sentence-ending
/// punctuation. All ASCII, so scanning for them never lands inside a
/// multi-byte UTF-8 sequence.
const WINDOW_BOUNDARY: &[u8] = b" \n.!?";

/// A chunk of cleaned document text.
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub index: i64,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<i64>,
}

/// Split `text` into overlapping chunks. `page_texts` maps page numbers to
/// per-page text for page inference and may be empty. Requires
/// `chunk_overlap < chunk_size` (validated at config load).
///
/// Text shorter than `chunk_size` yields exactly one chunk; empty input
/// yields none.
pub fn chunk_text(
    text: &str,
    page_texts: &BTreeMap<usize, String>,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<TextChunk> {
    let bytes = text.as_bytes();
    let len = bytes.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0i64;

    while start < len {
        let mut end = start + chunk_size;

        // Don't split in the middle of a word: extend to the next boundary.
        if end < len {
            while end < len && !WINDOW_BOUNDARY.contains(&bytes[end]) {
                end += 1;
            }
        }
        let end_clamped = end.min(len);

        // `end_clamped` is either the text length or an ASCII boundary byte,
        // so this slice cannot split a UTF-8 sequence.
        let piece = text[start..end_clamped].trim();
        if !piece.is_empty() {
            chunks.push(TextChunk {
                index,
                text: piece.to_string(),
                start_char: start,
                end_char: end_clamped,
                page_number: infer_page_number(piece, page_texts),
            });
            index += 1;
        }

        // The previous window reached the text end: done.
        if end_clamped >= len {
            break;
        }

        let mut next = end_clamped - chunk_overlap;
        while next > 0 && !text.is_char_boundary(next) {
            next -= 1;
        }
        if next <= start {
            break;
        }
        start = next;
    }

    chunks
}

/// Best-effort page inference for a chunk.
///
/// With per-page text available, the chunk's page is the page whose text
/// contains the chunk's first 100 characters. Without it, only an explicit
/// `[Page N]` marker inside the chunk yields a page.
fn infer_page_number(chunk_text: &str, page_texts: &BTreeMap<usize, String>) -> Option<i64> {
    if page_texts.is_empty() {
        return parse_page_marker(chunk_text);
    }

    let probe: String = chunk_text.chars().take(100).collect();
    for (page_num, page_text) in page_texts {
        if page_text.contains(&probe) {
            return Some(*page_num as i64);
        }
    }

    None
}

/// Find the first well-formed `[Page N]` marker in the text.
fn parse_page_marker(text: &str) -> Option<i64> {
    let mut rest = text;
    while let Some(pos) = rest.find("[Page ") {
        let after = &rest[pos + "[Page ".len()..];
        if let Some(close) = after.find(']') {
            if let Ok(n) = after[..close].parse::<i64>() {
                return Some(n);
            }
        }
        rest = &rest[pos + "[Page ".len()..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_pages() -> BTreeMap<usize, String> {
        BTreeMap::new()
    }

    #[test]
    fn short_text_yields_single_chunk() {
        let chunks = chunk_text("Hello, world!", &no_pages(), 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = chunk_text("", &no_pages(), 500, 50);
        assert!(chunks.is_empty());
    }

    #[test]
    fn long_text_produces_overlapping_chunks() {
        let text = "word ".repeat(300); // 1500 chars
        let chunks = chunk_text(text.trim(), &no_pages(), 500, 50);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
            assert!(!c.text.is_empty());
        }
        // Consecutive windows overlap by the configured amount
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_char, pair[0].end_char - 50);
        }
    }

    #[test]
    fn window_extends_to_word_boundary() {
        // A run of 120 letters starting before the window edge: the chunk
        // must not end inside it.
        let long_word = "x".repeat(120);
        let text = format!("{} {} trailing words here", "a ".repeat(45).trim(), long_word);
        let chunks = chunk_text(&text, &no_pages(), 100, 10);
        for c in &chunks {
            assert!(
                !c.text.ends_with('x') || c.text.ends_with(&long_word),
                "chunk split inside a word: {:?}",
                c.text
            );
        }
    }

    #[test]
    fn chunks_cover_whole_text() {
        let text = "alpha beta gamma delta. ".repeat(100);
        let text = text.trim();
        let chunks = chunk_text(text, &no_pages(), 200, 20);
        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks.last().unwrap().end_char, text.len());
        // No gaps between consecutive windows
        for pair in chunks.windows(2) {
            assert!(pair[1].start_char < pair[0].end_char);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "sentence one. sentence two! sentence three? ".repeat(50);
        let a = chunk_text(&text, &no_pages(), 180, 30);
        let b = chunk_text(&text, &no_pages(), 180, 30);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.start_char, y.start_char);
            assert_eq!(x.end_char, y.end_char);
        }
    }

    #[test]
    fn multibyte_text_does_not_panic() {
        let text = "héllo wörld à la carte — ".repeat(60);
        let chunks = chunk_text(&text, &no_pages(), 100, 20);
        assert!(!chunks.is_empty());
    }

    #[test]
    fn page_inferred_from_page_texts() {
        let mut pages = BTreeMap::new();
        pages.insert(1, "the quick brown fox".to_string());
        pages.insert(2, "jumps over the lazy dog".to_string());

        let chunks = chunk_text("jumps over the lazy dog", &pages, 500, 50);
        assert_eq!(chunks[0].page_number, Some(2));
    }

    #[test]
    fn page_inferred_from_marker_without_page_texts() {
        let chunks = chunk_text("[Page 7]\nsome text on page seven", &no_pages(), 500, 50);
        assert_eq!(chunks[0].page_number, Some(7));
    }

    #[test]
    fn page_is_none_when_nothing_matches() {
        let mut pages = BTreeMap::new();
        pages.insert(1, "completely unrelated".to_string());
        let chunks = chunk_text("no marker and no containment", &pages, 500, 50);
        assert_eq!(chunks[0].page_number, None);
    }

    #[test]
    fn malformed_marker_is_skipped() {
        assert_eq!(parse_page_marker("[Page x] then [Page 3]"), Some(3));
        assert_eq!(parse_page_marker("[Page ]"), None);
        assert_eq!(parse_page_marker("no marker"), None);
    }
}
