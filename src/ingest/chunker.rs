//! Structure-aware chunking of the per-page text stream
//!
//! Prose is split by a separator hierarchy (paragraph, line, sentence,
//! word, character) with verbatim overlap between neighbours. Table blocks
//! get their own larger budget and never straddle prose chunks.

use crate::config::ChunkingConfig;
use crate::error::{RagError, Result};
use crate::ingest::loader::{TABLE_END, TABLE_START};
use crate::ingest::types::{ChunkMetadata, DocumentChunk, PageText};
use tracing::warn;

/// One span of the concatenated page stream
enum Segment {
    Prose { offset: usize, text: String },
    Table { offset: usize, text: String },
}

/// Snap a byte index backward onto a char boundary
fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Snap a byte index forward onto a char boundary
fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Structure-aware chunker over a loaded page stream
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Split the page stream into ordered chunks with metadata
    pub fn chunk_pages(&self, pages: &[PageText]) -> Result<Vec<DocumentChunk>> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        // Concatenate pages into one stream, remembering where each page
        // starts so chunks can be attributed to the page of their first
        // character.
        let mut stream = String::new();
        let mut page_starts: Vec<(usize, u32, Option<String>)> = Vec::new();
        for page in pages {
            if !stream.is_empty() && !stream.ends_with("\n\n") {
                stream.push_str("\n\n");
            }
            page_starts.push((stream.len(), page.page_number, page.section_title.clone()));
            stream.push_str(&page.text);
        }

        let mut chunks = Vec::new();
        for segment in split_segments(&stream) {
            match segment {
                Segment::Prose { offset, text } => {
                    self.chunk_prose(&text, offset, &page_starts, &mut chunks);
                }
                Segment::Table { offset, text } => {
                    self.chunk_table(&text, offset, &page_starts, &mut chunks)?;
                }
            }
        }

        if chunks.is_empty() {
            return Err(RagError::Chunking(
                "document produced no non-empty chunks".to_string(),
            ));
        }

        Ok(chunks)
    }

    fn chunk_prose(
        &self,
        text: &str,
        segment_offset: usize,
        page_starts: &[(usize, u32, Option<String>)],
        chunks: &mut Vec<DocumentChunk>,
    ) {
        let budget = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;
        let mut start = 0usize;

        while start < text.len() {
            let remaining = &text[start..];
            let end = if remaining.len() <= budget {
                text.len()
            } else {
                let window_end = floor_char_boundary(text, start + budget);
                let window = &text[start..window_end];
                start + find_cut(window, budget)
            };

            let piece = &text[start..end];
            if !piece.trim().is_empty() {
                self.push_chunk(
                    piece.to_string(),
                    segment_offset + start,
                    false,
                    page_starts,
                    chunks,
                );
            }

            if end >= text.len() {
                break;
            }
            // Step back by the overlap so the region appears verbatim in
            // both neighbours; always make forward progress.
            let next = floor_char_boundary(text, end.saturating_sub(overlap));
            start = if next > start {
                next
            } else {
                ceil_char_boundary(text, start + 1)
            };
        }
    }

    fn chunk_table(
        &self,
        block: &str,
        segment_offset: usize,
        page_starts: &[(usize, u32, Option<String>)],
        chunks: &mut Vec<DocumentChunk>,
    ) -> Result<()> {
        let budget = self.config.table_chunk_size;

        if self.config.keep_tables_intact && block.len() <= budget {
            self.push_chunk(block.to_string(), segment_offset, true, page_starts, chunks);
            return Ok(());
        }

        // Oversized table: split along row boundaries, repeating the header
        // row in every piece.
        let inner = block
            .trim()
            .strip_prefix(TABLE_START)
            .and_then(|s| s.strip_suffix(TABLE_END))
            .map(str::trim)
            .ok_or_else(|| RagError::Chunking("malformed table block".to_string()))?;

        let mut rows = inner.lines().filter(|l| !l.trim().is_empty());
        let Some(header) = rows.next() else {
            return Ok(());
        };
        let frame_len = TABLE_START.len() + TABLE_END.len() + header.len() + 4;

        let mut piece_rows: Vec<&str> = Vec::new();
        let mut piece_len = frame_len;
        for row in rows {
            if piece_len + row.len() + 1 > budget && !piece_rows.is_empty() {
                self.push_chunk(
                    render_piece(header, &piece_rows),
                    segment_offset,
                    true,
                    page_starts,
                    chunks,
                );
                piece_rows.clear();
                piece_len = frame_len;
            }
            piece_rows.push(row);
            piece_len += row.len() + 1;
        }
        if !piece_rows.is_empty() {
            self.push_chunk(
                render_piece(header, &piece_rows),
                segment_offset,
                true,
                page_starts,
                chunks,
            );
        }

        Ok(())
    }

    fn push_chunk(
        &self,
        text: String,
        stream_offset: usize,
        has_table: bool,
        page_starts: &[(usize, u32, Option<String>)],
        chunks: &mut Vec<DocumentChunk>,
    ) {
        let (page_number, section_title) = locate(stream_offset, page_starts);
        chunks.push(DocumentChunk {
            chunk_index: chunks.len(),
            text,
            embedding: Vec::new(),
            metadata: ChunkMetadata {
                page_number: Some(page_number),
                section_title,
                has_table,
                ..Default::default()
            },
        });
    }
}

/// Page of the chunk's first character, and the most recent section title
fn locate(offset: usize, page_starts: &[(usize, u32, Option<String>)]) -> (u32, Option<String>) {
    let mut page = 1;
    let mut title = None;
    for (start, number, section) in page_starts {
        if *start > offset {
            break;
        }
        page = *number;
        if section.is_some() {
            title = section.clone();
        }
    }
    (page, title)
}

fn render_piece(header: &str, rows: &[&str]) -> String {
    let mut out = String::new();
    out.push_str(TABLE_START);
    out.push('\n');
    out.push_str(header);
    out.push('\n');
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    out.push_str(TABLE_END);
    out
}

/// Split the stream into prose and `[Table]…[/Table]` segments
fn split_segments(stream: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel_start) = stream[cursor..].find(TABLE_START) {
        let table_start = cursor + rel_start;
        let Some(rel_end) = stream[table_start..].find(TABLE_END) else {
            warn!("Unterminated table marker; treating remainder as prose");
            break;
        };
        let table_end = table_start + rel_end + TABLE_END.len();

        if table_start > cursor {
            segments.push(Segment::Prose {
                offset: cursor,
                text: stream[cursor..table_start].to_string(),
            });
        }
        segments.push(Segment::Table {
            offset: table_start,
            text: stream[table_start..table_end].to_string(),
        });
        cursor = table_end;
    }

    if cursor < stream.len() {
        segments.push(Segment::Prose {
            offset: cursor,
            text: stream[cursor..].to_string(),
        });
    }

    segments
}

/// Choose a cut point inside the window, trying separators in order:
/// paragraph break, line break, sentence terminator, word boundary, and
/// finally the raw budget. A cut is only taken in the latter half of the
/// window so chunks stay reasonably full.
fn find_cut(window: &str, budget: usize) -> usize {
    let min_cut = budget / 2;

    if let Some(pos) = window.rfind("\n\n") {
        if pos > min_cut {
            return pos + 2;
        }
    }
    if let Some(pos) = window.rfind('\n') {
        if pos > min_cut {
            return pos + 1;
        }
    }
    for terminator in [". ", "! ", "? "] {
        if let Some(pos) = window.rfind(terminator) {
            if pos > min_cut {
                return pos + terminator.len();
            }
        }
    }
    if let Some(pos) = window.rfind(' ') {
        if pos > min_cut {
            return pos + 1;
        }
    }
    window.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            page_number: number,
            text: text.to_string(),
            section_title: None,
        }
    }

    fn chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            table_chunk_size: size * 3,
            keep_tables_intact: true,
        })
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunker(1024, 200)
            .chunk_pages(&[page(1, "The backup window is 02:00-04:00 UTC.")])
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].metadata.page_number, Some(1));
    }

    #[test]
    fn test_text_exactly_at_budget_not_split() {
        let text = "a".repeat(100);
        let chunks = chunker(100, 20).chunk_pages(&[page(1, &text)]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text.len(), 100);
    }

    #[test]
    fn test_overlap_bytes_verbatim_in_both_neighbours() {
        let sentences: Vec<String> = (0..40)
            .map(|i| format!("Sentence number {i} carries some words."))
            .collect();
        let text = sentences.join(" ");
        let chunks = chunker(200, 40).chunk_pages(&[page(1, &text)]).unwrap();
        assert!(chunks.len() > 1);

        for pair in chunks.windows(2) {
            let prev = &pair[0].text;
            let next = &pair[1].text;
            // The start of `next` must appear verbatim at the end of `prev`
            let head: String = next.chars().take(10).collect();
            assert!(
                prev.contains(&head),
                "overlap head {head:?} missing from previous chunk"
            );
        }
    }

    #[test]
    fn test_round_trip_reconstruction() {
        let paragraphs: Vec<String> = (0..12)
            .map(|i| format!("Paragraph {i} holds a couple of sentences. Each one is short."))
            .collect();
        let text = paragraphs.join("\n\n");
        let chunks = chunker(150, 30).chunk_pages(&[page(1, &text)]).unwrap();

        // Stitch chunks back together by dropping each chunk's overlap with
        // its predecessor.
        let mut rebuilt = chunks[0].text.clone();
        for chunk in &chunks[1..] {
            let mut appended = false;
            for split in (1..=chunk.text.len().min(rebuilt.len())).rev() {
                if !chunk.text.is_char_boundary(split) {
                    continue;
                }
                if rebuilt.ends_with(&chunk.text[..split]) {
                    rebuilt.push_str(&chunk.text[split..]);
                    appended = true;
                    break;
                }
            }
            if !appended {
                rebuilt.push_str(&chunk.text);
            }
        }

        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&rebuilt), normalize(&text));
    }

    #[test]
    fn test_chunk_indices_contiguous() {
        let text = "word ".repeat(600);
        let chunks = chunker(256, 50).chunk_pages(&[page(1, &text)]).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn test_small_table_kept_intact() {
        let text = format!(
            "Before the table.\n{TABLE_START}\nName | Value\nRPO | 15 min\n{TABLE_END}\nAfter the table."
        );
        let chunks = chunker(1024, 200).chunk_pages(&[page(1, &text)]).unwrap();

        let table_chunks: Vec<_> = chunks.iter().filter(|c| c.metadata.has_table).collect();
        assert_eq!(table_chunks.len(), 1);
        assert!(table_chunks[0].text.contains("RPO | 15 min"));

        // Tables never straddle prose chunks
        for chunk in chunks.iter().filter(|c| !c.metadata.has_table) {
            assert!(!chunk.text.contains(TABLE_START));
        }
    }

    #[test]
    fn test_oversized_table_split_with_header_repeated() {
        let mut rows = String::new();
        for i in 0..200 {
            rows.push_str(&format!("row-{i} | col-a-{i} | col-b-{i}\n"));
        }
        let text = format!("{TABLE_START}\nid | a | b\n{rows}{TABLE_END}");

        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 512,
            chunk_overlap: 100,
            table_chunk_size: 600,
            keep_tables_intact: true,
        });
        let chunks = chunker.chunk_pages(&[page(1, &text)]).unwrap();

        assert!(chunks.len() > 1, "oversized table must be split");
        for chunk in &chunks {
            assert!(chunk.metadata.has_table);
            assert!(chunk.text.len() <= 600 + TABLE_END.len());
            assert!(
                chunk.text.contains("id | a | b"),
                "header row must repeat in every piece"
            );
            // Pieces break at row boundaries: every data line is whole
            for line in chunk.text.lines().filter(|l| l.starts_with("row-")) {
                assert_eq!(line.matches('|').count(), 2);
            }
        }
    }

    #[test]
    fn test_locate_inherits_section_from_earlier_page() {
        let page_starts = vec![
            (0usize, 1u32, Some("Overview".to_string())),
            (100, 2, None),
            (200, 3, Some("Appendix".to_string())),
        ];

        assert_eq!(locate(10, &page_starts), (1, Some("Overview".to_string())));
        // Page 2 defines no title of its own, so page 1's is inherited
        assert_eq!(locate(150, &page_starts), (2, Some("Overview".to_string())));
        assert_eq!(locate(250, &page_starts), (3, Some("Appendix".to_string())));
    }

    #[test]
    fn test_page_attribution_across_pages() {
        let first = "First page sentence one. ".repeat(8);
        let second = "Second page sentence two. ".repeat(8);
        let pages = vec![
            PageText {
                page_number: 1,
                text: first,
                section_title: Some("Overview".to_string()),
            },
            PageText {
                page_number: 2,
                text: second,
                section_title: None,
            },
        ];
        let chunks = chunker(120, 24).chunk_pages(&pages).unwrap();

        assert_eq!(chunks[0].metadata.page_number, Some(1));
        let last = chunks.last().unwrap();
        assert_eq!(last.metadata.page_number, Some(2));
        // Section title carries over from the last page that defined one
        assert_eq!(last.metadata.section_title.as_deref(), Some("Overview"));
    }

    #[test]
    fn test_empty_pages_produce_chunking_error() {
        let err = chunker(100, 10)
            .chunk_pages(&[page(1, "   \n\n  ")])
            .unwrap_err();
        assert!(matches!(err, RagError::Chunking(_)));
    }
}
