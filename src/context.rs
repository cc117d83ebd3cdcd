//! Packing ranked chunks into a bounded context block

use crate::store::RetrievalResult;
use tracing::debug;

/// Relevance tier markers prepended to each source header
const TIER_HIGH: &str = "***";
const TIER_GOOD: &str = "[+]";
const TIER_MEDIUM: &str = " - ";

const HIGH_THRESHOLD: f32 = 0.80;
const GOOD_THRESHOLD: f32 = 0.65;

/// Formats retrieval results into one length-bounded context string
pub struct ContextFormatter {
    max_context_chars: usize,
}

impl ContextFormatter {
    pub fn new(max_context_chars: usize) -> Self {
        Self { max_context_chars }
    }

    /// Render the ranked results, keeping within the character budget
    ///
    /// At least one block is always included. When blocks are dropped, a
    /// trailer records how many of the results made it in.
    pub fn format(&self, results: &[RetrievalResult]) -> String {
        if results.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        let mut included = 0usize;

        for (i, result) in results.iter().enumerate() {
            let block = render_block(i + 1, result);
            if included > 0 && out.len() + block.len() > self.max_context_chars {
                break;
            }
            out.push_str(&block);
            included += 1;
        }

        if included < results.len() {
            debug!(
                "Context truncated to {} of {} chunks",
                included,
                results.len()
            );
            out.push_str(&format!(
                "[Context truncated: {} of {} chunks included]\n",
                included,
                results.len()
            ));
        }

        out
    }
}

fn tier_marker(similarity: f32) -> &'static str {
    if similarity >= HIGH_THRESHOLD {
        TIER_HIGH
    } else if similarity >= GOOD_THRESHOLD {
        TIER_GOOD
    } else {
        TIER_MEDIUM
    }
}

/// Collapse runs of spaces within lines and drop blank lines, keeping row
/// structure for tables
fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_block(position: usize, result: &RetrievalResult) -> String {
    let mut header = format!(
        "{}[Source {}] {} (chunk {}",
        tier_marker(result.similarity),
        position,
        result.filename,
        result.chunk_index
    );
    if let Some(page) = result.metadata.page_number {
        header.push_str(&format!(", page {page}"));
    }
    if let Some(section) = &result.metadata.section_title {
        header.push_str(&format!(", section: \"{section}\""));
    }
    header.push_str(&format!(
        ", relevance: {:.0}%)",
        result.similarity * 100.0
    ));

    let body = normalize_whitespace(&result.chunk_text);
    let table_note = if result.metadata.has_table {
        "[Contains structured data table]\n"
    } else {
        ""
    };

    format!("{header}\n{table_note}{body}\n---\n")
}
