//! PDF text extraction and text cleaning.
//!
//! Extraction is two-stage: the layout-aware extractor runs first and yields
//! per-page text; on any failure a simpler extractor recovers the
//! concatenated text and page count only. If both fail the document is
//! rejected with an [`ExtractError`] and nothing is indexed.

use std::collections::BTreeMap;

/// Extraction error. Carries the fallback extractor's message, since the
/// fallback only runs after the primary has already failed.
#[derive(Debug)]
pub enum ExtractError {
    Pdf(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Text pulled out of one PDF file.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Full document text. When per-page extraction succeeded, each non-empty
    /// page is prefixed with a `[Page N]` marker line.
    pub text: String,
    pub page_count: usize,
    /// Page number → page text. Empty when only the fallback extractor ran.
    pub page_texts: BTreeMap<usize, String>,
}

/// Extract text from PDF bytes, preferring the layout-aware per-page
/// extractor and falling back to concatenated-text extraction.
pub fn extract_pdf(bytes: &[u8]) -> Result<Extraction, ExtractError> {
    match extract_per_page(bytes) {
        Ok(extraction) => Ok(extraction),
        Err(primary_err) => {
            tracing::warn!(error = %primary_err, "per-page extraction failed, trying fallback");
            extract_concatenated(bytes)
        }
    }
}

fn extract_per_page(bytes: &[u8]) -> Result<Extraction, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let page_count = pages.len();
    let mut text = String::new();
    let mut page_texts = BTreeMap::new();

    for (i, page_text) in pages.into_iter().enumerate() {
        let page_num = i + 1;
        if page_text.trim().is_empty() {
            continue;
        }
        text.push_str(&format!("[Page {}]\n{}\n\n", page_num, page_text));
        page_texts.insert(page_num, page_text);
    }

    Ok(Extraction {
        text,
        page_count,
        page_texts,
    })
}

fn extract_concatenated(bytes: &[u8]) -> Result<Extraction, ExtractError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let pages = doc.get_pages();
    let page_count = pages.len();

    let mut text = String::new();
    for page_num in pages.keys() {
        let page_text = doc
            .extract_text(&[*page_num])
            .map_err(|e| ExtractError::Pdf(e.to_string()))?;
        text.push_str(&page_text);
        text.push_str("\n\n");
    }

    Ok(Extraction {
        text,
        page_count,
        page_texts: BTreeMap::new(),
    })
}

/// Normalize extracted text before chunking: collapse runs of spaces to one,
/// collapse 3+ consecutive newlines to exactly 2, strip NUL bytes, and trim
/// surrounding whitespace.
pub fn clean_text(text: &str) -> String {
    // Collapse runs of spaces
    let mut collapsed = String::with_capacity(text.len());
    let mut prev_space = false;
    for c in text.chars() {
        if c == ' ' {
            if !prev_space {
                collapsed.push(c);
            }
            prev_space = true;
        } else {
            collapsed.push(c);
            prev_space = false;
        }
    }

    // Collapse 3+ consecutive newlines to exactly 2
    let mut out = String::with_capacity(collapsed.len());
    let mut newline_run = 0usize;
    for c in collapsed.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
        } else {
            newline_run = 0;
            out.push(c);
        }
    }

    out.replace('\0', "").trim().to_string()
}
