//! Text extraction from raw source artifacts.
//!
//! The pipeline stores opaque bytes; extraction turns them into a title
//! plus plain text. Plain text and Markdown are the only shipped formats,
//! but the trait keeps the seam open for richer ones.

use anyhow::{bail, Result};

/// Extraction output: a display title and the full document text.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub title: String,
    pub text: String,
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, file_key: &str, bytes: &[u8]) -> Result<ExtractedDocument>;
}

/// Extractor for UTF-8 text files (`.txt`, `.md`). The title is derived
/// from the file name: extension stripped, separators spaced out.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, file_key: &str, bytes: &[u8]) -> Result<ExtractedDocument> {
        let text = match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(e) => bail!("{} is not valid UTF-8: {}", file_key, e),
        };
        if text.trim().is_empty() {
            bail!("{} contains no text", file_key);
        }
        Ok(ExtractedDocument {
            title: title_from_key(file_key),
            text,
        })
    }
}

fn title_from_key(file_key: &str) -> String {
    let name = file_key.rsplit('/').next().unwrap_or(file_key);
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    let title = stem.replace(['_', '-'], " ").trim().to_string();
    if title.is_empty() {
        file_key.to_string()
    } else {
        title
    }
}
