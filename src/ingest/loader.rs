//! Per-format text extraction
//!
//! Each loader yields page records in reading order. Tables are preserved
//! as pipe-delimited blocks between `[Table]` and `[/Table]` markers so the
//! chunker can keep them intact.

use crate::error::{RagError, Result};
use crate::ingest::types::{DocumentFormat, PageText};
use regex::Regex;
use std::io::Read;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Marker opening a preserved table block
pub const TABLE_START: &str = "[Table]";
/// Marker closing a preserved table block
pub const TABLE_END: &str = "[/Table]";

fn enumeration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+[.)]\s|[-*•]\s|[a-z][.)]\s)").unwrap())
}

/// Multi-format document loader
pub struct DocumentLoader;

impl DocumentLoader {
    /// Extract page records from raw file bytes
    pub fn load(format: DocumentFormat, filename: &str, bytes: &[u8]) -> Result<Vec<PageText>> {
        let pages = match format {
            DocumentFormat::Text => Self::load_plain(filename, bytes)?,
            DocumentFormat::Markdown => Self::load_markdown(filename, bytes)?,
            DocumentFormat::Docx => Self::load_docx(filename, bytes)?,
            DocumentFormat::Pdf => Self::load_pdf(filename, bytes)?,
        };

        let total_chars: usize = pages.iter().map(|p| p.text.trim().len()).sum();
        if total_chars == 0 {
            let hint = if format == DocumentFormat::Pdf {
                " (image-only PDF? OCR is required for scanned documents)"
            } else {
                ""
            };
            return Err(RagError::DocumentProcessing(format!(
                "{filename}: no extractable text{hint}"
            )));
        }

        Ok(pages)
    }

    fn load_plain(filename: &str, bytes: &[u8]) -> Result<Vec<PageText>> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        debug!("Loaded {} as plain text ({} chars)", filename, text.len());
        Ok(vec![PageText {
            page_number: 1,
            section_title: detect_section_title(&text),
            text,
        }])
    }

    fn load_markdown(filename: &str, bytes: &[u8]) -> Result<Vec<PageText>> {
        let text = String::from_utf8_lossy(bytes).into_owned();

        // Prefer the first markdown heading as the section title
        let section_title = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .filter(|l| l.trim_start().starts_with('#'))
            .map(|l| l.trim_start_matches(['#', ' ']).trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| detect_section_title(&text));

        debug!("Loaded {} as markdown ({} chars)", filename, text.len());
        Ok(vec![PageText {
            page_number: 1,
            text,
            section_title,
        }])
    }

    fn load_docx(filename: &str, bytes: &[u8]) -> Result<Vec<PageText>> {
        let document_xml = read_docx_document_xml(bytes)
            .map_err(|e| RagError::DocumentProcessing(format!("{filename}: {e}")))?;
        let text = extract_docx_text(&document_xml)
            .map_err(|e| RagError::DocumentProcessing(format!("{filename}: {e}")))?;

        debug!("Loaded {} as DOCX ({} chars)", filename, text.len());
        Ok(vec![PageText {
            page_number: 1,
            section_title: detect_section_title(&text),
            text,
        }])
    }

    fn load_pdf(filename: &str, bytes: &[u8]) -> Result<Vec<PageText>> {
        match lopdf::Document::load_mem(bytes) {
            Ok(doc) => {
                let mut pages = Vec::new();
                for (page_number, _) in doc.get_pages() {
                    let raw = match doc.extract_text(&[page_number]) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!("Page {} of {} unreadable: {}", page_number, filename, e);
                            continue;
                        }
                    };
                    let text = annotate_pdf_tables(&raw);
                    if text.trim().is_empty() {
                        continue;
                    }
                    pages.push(PageText {
                        page_number,
                        section_title: detect_section_title(&text),
                        text,
                    });
                }

                if pages.is_empty() {
                    // Some PDFs defeat lopdf's text extractor; try the
                    // whole-document fallback before giving up.
                    Self::load_pdf_fallback(filename, bytes)
                } else {
                    debug!("Loaded {} as PDF ({} pages)", filename, pages.len());
                    Ok(pages)
                }
            }
            Err(e) => {
                warn!("lopdf failed on {}: {}, using fallback extractor", filename, e);
                Self::load_pdf_fallback(filename, bytes)
            }
        }
    }

    fn load_pdf_fallback(filename: &str, bytes: &[u8]) -> Result<Vec<PageText>> {
        let raw = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| RagError::DocumentProcessing(format!("{filename}: {e}")))?;
        let text = annotate_pdf_tables(&raw);
        Ok(vec![PageText {
            page_number: 1,
            section_title: detect_section_title(&text),
            text,
        }])
    }
}

/// Pull `word/document.xml` out of the DOCX zip container
fn read_docx_document_xml(bytes: &[u8]) -> std::result::Result<Vec<u8>, String> {
    // Bounded read; a DOCX body larger than this is not a real document
    const MAX_XML_BYTES: u64 = 50 * 1024 * 1024;

    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| "word/document.xml not found".to_string())?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| e.to_string())?;
    if xml.len() as u64 >= MAX_XML_BYTES {
        return Err("word/document.xml exceeds size limit".to_string());
    }
    Ok(xml)
}

/// Walk paragraphs and tables of a DOCX body in document order
fn extract_docx_text(xml: &[u8]) -> std::result::Result<String, String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut out = String::new();
    let mut table_depth = 0usize;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut cell = String::new();
    let mut paragraph = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        rows.clear();
                    }
                }
                b"tr" if table_depth == 1 => rows.push(Vec::new()),
                b"tc" if table_depth == 1 => cell.clear(),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 && !rows.is_empty() {
                        out.push_str(&render_table_block(&rows));
                    }
                }
                b"tc" if table_depth == 1 => {
                    if let Some(row) = rows.last_mut() {
                        row.push(cell.trim().to_string());
                    }
                }
                b"p" if table_depth == 0 => {
                    let trimmed = paragraph.trim();
                    if !trimmed.is_empty() {
                        out.push_str(trimmed);
                        out.push_str("\n\n");
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default();
                if table_depth >= 1 {
                    cell.push_str(&text);
                } else {
                    paragraph.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    if !paragraph.trim().is_empty() {
        out.push_str(paragraph.trim());
        out.push('\n');
    }

    Ok(out)
}

/// Render table rows as a delimited block the chunker keeps intact
fn render_table_block(rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str(TABLE_START);
    out.push('\n');
    for row in rows {
        out.push_str(&row.join(" | "));
        out.push('\n');
    }
    out.push_str(TABLE_END);
    out.push('\n');
    out
}

/// True when a line looks like one row of a table
fn is_tabular_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < 5 {
        return false;
    }
    if trimmed.matches('|').count() >= 1 && trimmed.split('|').count() >= 2 {
        return true;
    }
    // Columns separated by runs of 2+ spaces
    trimmed.split("  ").filter(|s| !s.trim().is_empty()).count() >= 3
}

fn split_tabular_cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    if trimmed.contains('|') {
        trimmed
            .split('|')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    } else {
        trimmed
            .split("  ")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Detect tabular regions in extracted PDF text and wrap them in markers
///
/// A run of two or more consecutive lines with aligned columns (pipes or
/// 2+-space separation) is treated as one table. Non-table text keeps its
/// paragraph breaks.
fn annotate_pdf_tables(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < lines.len() {
        if is_tabular_line(lines[i]) {
            let mut j = i;
            while j < lines.len() && is_tabular_line(lines[j]) {
                j += 1;
            }
            if j - i >= 2 {
                let rows: Vec<Vec<String>> =
                    lines[i..j].iter().map(|l| split_tabular_cells(l)).collect();
                out.push_str(&render_table_block(&rows));
                i = j;
                continue;
            }
        }
        out.push_str(lines[i]);
        out.push('\n');
        i += 1;
    }

    out
}

/// Best-effort heading from the first few non-empty lines of a page
///
/// Prefers short lines that are title-case, all-caps, or end with a colon;
/// enumerated lines never qualify.
pub fn detect_section_title(text: &str) -> Option<String> {
    for line in text.lines().filter(|l| !l.trim().is_empty()).take(5) {
        let candidate = line.trim();
        if candidate.len() > 100 {
            continue;
        }
        if candidate.starts_with(TABLE_START) || candidate.starts_with(TABLE_END) {
            continue;
        }
        if enumeration_re().is_match(candidate) {
            continue;
        }
        if is_all_caps(candidate) || candidate.ends_with(':') || is_title_case(candidate) {
            return Some(candidate.trim_end_matches(':').trim().to_string());
        }
    }
    None
}

fn is_all_caps(line: &str) -> bool {
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 3 && letters.iter().all(|c| c.is_uppercase())
}

fn is_title_case(line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() || words.len() > 12 {
        return false;
    }
    let significant = words
        .iter()
        .filter(|w| w.chars().next().is_some_and(|c| c.is_alphabetic()))
        .count();
    if significant == 0 {
        return false;
    }
    let capitalized = words
        .iter()
        .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
        .count();
    // Allow lowercase connectives ("of", "and") in an otherwise-titled line
    capitalized * 3 >= significant * 2
}
