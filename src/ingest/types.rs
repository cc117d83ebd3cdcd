//! Type definitions for document ingestion

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Supported document formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Markdown,
    Text,
}

impl DocumentFormat {
    /// Detect the format from a filename extension
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "md" => Some(Self::Markdown),
            "txt" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Markdown => "md",
            Self::Text => "txt",
        }
    }
}

/// Extracted text of one page, in document order
#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-based page number
    pub page_number: u32,
    pub text: String,
    /// Best-effort heading found near the top of the page
    pub section_title: Option<String>,
}

/// Structured metadata carried by every chunk
///
/// Consumers must tolerate absent fields; unknown keys round-trip through
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,

    #[serde(default)]
    pub has_table: bool,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A chunk ready for embedding and storage
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    /// Global 0-based position within the document
    pub chunk_index: usize,
    pub text: String,
    /// Filled by the embedding stage; empty until then
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Summary of a completed ingest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub document_id: i64,
    pub filename: String,
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub failed_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_filename() {
        assert_eq!(
            DocumentFormat::from_filename("handbook.md"),
            Some(DocumentFormat::Markdown)
        );
        assert_eq!(
            DocumentFormat::from_filename("Report.PDF"),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(DocumentFormat::from_filename("archive.tar.gz"), None);
        assert_eq!(DocumentFormat::from_filename("noext"), None);
    }

    #[test]
    fn test_metadata_tolerates_unknown_keys() {
        let json = r#"{"page_number": 2, "source_tool": "scanner-v2"}"#;
        let meta: ChunkMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.page_number, Some(2));
        assert!(meta.section_title.is_none());
        assert!(!meta.has_table);
        assert_eq!(
            meta.extra.get("source_tool"),
            Some(&serde_json::json!("scanner-v2"))
        );

        // Unknown keys survive a round-trip
        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["source_tool"], "scanner-v2");
    }
}
