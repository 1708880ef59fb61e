use crate::error::{RagError, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text_from_mem_by_pages;
use std::fs;
use std::path::Path;

/// A single page of the source document, the unit of retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChunk {
    /// Normalized text of the page
    pub text: String,
    /// Zero-based page index in the source document
    pub page: usize,
}

/// Extract one chunk per page from a PDF, preserving page order
pub fn extract_pages<P: AsRef<Path>>(file_path: P) -> Result<Vec<PageChunk>> {
    let path = file_path.as_ref();

    let mime_type = from_path(path).first_or_octet_stream().to_string();
    debug!("Detected MIME type: {}", mime_type);

    // Read first so a missing file is reported as IO rather than a parse failure
    let bytes = fs::read(path)?;

    if !mime_type.starts_with("application/pdf") {
        return Err(RagError::Parse(format!(
            "Unsupported document format: {}. Only PDF files are supported.",
            mime_type
        )));
    }

    info!("Processing PDF document: {}", path.display());
    let pages = extract_text_from_mem_by_pages(&bytes).map_err(|e| {
        RagError::Parse(format!(
            "Failed to extract text from PDF {}: {}",
            path.display(),
            e
        ))
    })?;

    let chunks: Vec<PageChunk> = pages
        .into_iter()
        .enumerate()
        .map(|(page, raw)| PageChunk {
            // PDF extraction can sometimes include excessive whitespace
            text: normalize_whitespace(&raw),
            page,
        })
        .collect();

    if chunks.iter().all(|chunk| chunk.text.is_empty()) {
        warn!("Extracted PDF content is empty or contains only whitespace");
    }
    info!("Extracted {} pages from {}", chunks.len(), path.display());

    Ok(chunks)
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
            continue;
        }

        if newline_count > 0 {
            // At most one paragraph break
            normalized.push_str(if newline_count >= 2 { "\n\n" } else { "\n" });
            newline_count = 0;
        }

        if !(c == ' ' && prev_char == ' ') {
            normalized.push(c);
        }
        prev_char = c;
    }

    normalized.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_pdf;

    #[test]
    fn test_normalize_whitespace() {
        let text = "This  has   multiple    spaces.\n\n\nAnd multiple newlines.\r\nAnd Windows line endings.";
        let expected =
            "This has multiple spaces.\n\nAnd multiple newlines.\nAnd Windows line endings.";
        assert_eq!(normalize_whitespace(text), expected);
    }

    #[test]
    fn test_normalize_whitespace_trims_edges() {
        assert_eq!(normalize_whitespace("\n\n  Artigo 1  \n\n\n"), "Artigo 1");
        assert_eq!(normalize_whitespace("   "), "");
    }

    #[test]
    fn test_extract_pages_one_chunk_per_page_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codigo.pdf");
        write_pdf(&path, &["Integridade", "Respeito", "Transparencia"]);

        let chunks = extract_pages(&path).unwrap();

        assert_eq!(chunks.len(), 3);
        for (idx, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.page, idx);
        }
        assert!(chunks[0].text.contains("Integridade"));
        assert!(chunks[1].text.contains("Respeito"));
        assert!(chunks[2].text.contains("Transparencia"));
    }

    #[test]
    fn test_extract_pages_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_pages(dir.path().join("absent.pdf")).unwrap_err();
        assert!(matches!(err, RagError::Io(_)), "got {:?}", err);
    }

    #[test]
    fn test_extract_pages_invalid_pdf_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"definitely not a pdf").unwrap();

        let err = extract_pages(&path).unwrap_err();
        assert!(matches!(err, RagError::Parse(_)), "got {:?}", err);
    }

    #[test]
    fn test_extract_pages_rejects_non_pdf_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "plain text").unwrap();

        let err = extract_pages(&path).unwrap_err();
        assert!(matches!(err, RagError::Parse(_)), "got {:?}", err);
    }
}
