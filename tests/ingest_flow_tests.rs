//! End-to-end tests of the load -> chunk -> format flow
//!
//! These run the real loader, chunker, and context formatter against
//! in-memory documents; no database or Ollama server is needed.

use ragserve::config::ChunkingConfig;
use ragserve::context::ContextFormatter;
use ragserve::ingest::types::ChunkMetadata;
use ragserve::ingest::{Chunker, DocumentFormat, DocumentLoader};
use ragserve::store::RetrievalResult;

fn default_chunker() -> Chunker {
    Chunker::new(ChunkingConfig::default())
}

#[test]
fn markdown_handbook_survives_the_full_flow() {
    let body = b"# Operations Handbook\n\nThe backup window is 02:00-04:00 UTC.\n\nRPO is 15 minutes.";
    let pages = DocumentLoader::load(DocumentFormat::Markdown, "handbook.md", body).unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(
        pages[0].section_title.as_deref(),
        Some("Operations Handbook")
    );

    let chunks = default_chunker().chunk_pages(&pages).unwrap();
    assert_eq!(chunks.len(), 1, "short document fits one chunk");
    assert!(chunks[0].text.contains("02:00"));
    assert!(chunks[0].text.contains("RPO is 15 minutes"));
    assert_eq!(chunks[0].metadata.page_number, Some(1));
}

#[test]
fn docx_table_is_preserved_through_chunking() {
    // Minimal but valid DOCX container
    let mut zip_bytes = Vec::new();
    {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
        let options: zip::write::SimpleFileOptions = Default::default();
        writer.start_file("word/document.xml", options).unwrap();
        writer
            .write_all(
                br#"<?xml version="1.0"?>
                <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
                  <w:body>
                    <w:p><w:r><w:t>Service levels are listed below.</w:t></w:r></w:p>
                    <w:tbl>
                      <w:tr>
                        <w:tc><w:p><w:r><w:t>Metric</w:t></w:r></w:p></w:tc>
                        <w:tc><w:p><w:r><w:t>Target</w:t></w:r></w:p></w:tc>
                      </w:tr>
                      <w:tr>
                        <w:tc><w:p><w:r><w:t>Uptime</w:t></w:r></w:p></w:tc>
                        <w:tc><w:p><w:r><w:t>99.9%</w:t></w:r></w:p></w:tc>
                      </w:tr>
                    </w:tbl>
                  </w:body>
                </w:document>"#,
            )
            .unwrap();
        writer.finish().unwrap();
    }

    let pages = DocumentLoader::load(DocumentFormat::Docx, "sla.docx", &zip_bytes).unwrap();
    assert_eq!(pages[0].page_number, 1);
    assert!(pages[0].text.contains("Metric | Target"));

    let chunks = default_chunker().chunk_pages(&pages).unwrap();
    let table_chunk = chunks
        .iter()
        .find(|c| c.metadata.has_table)
        .expect("table chunk present");
    assert!(table_chunk.text.contains("Uptime | 99.9%"));

    // Prose chunks never contain table fragments
    for chunk in chunks.iter().filter(|c| !c.metadata.has_table) {
        assert!(!chunk.text.contains("[Table]"));
    }
}

#[test]
fn chunk_metadata_feeds_the_context_formatter() {
    let results = vec![
        RetrievalResult {
            chunk_text: "The backup window is 02:00-04:00 UTC.".to_string(),
            filename: "handbook.md".to_string(),
            chunk_index: 0,
            similarity: 0.88,
            metadata: ChunkMetadata {
                page_number: Some(1),
                section_title: Some("Operations Handbook".to_string()),
                ..Default::default()
            },
        },
        RetrievalResult {
            chunk_text: "[Table]\nMetric | Target\nUptime | 99.9%\n[/Table]".to_string(),
            filename: "sla.docx".to_string(),
            chunk_index: 2,
            similarity: 0.70,
            metadata: ChunkMetadata {
                has_table: true,
                ..Default::default()
            },
        },
    ];

    let context = ContextFormatter::new(8000).format(&results);

    assert!(context.contains("***[Source 1] handbook.md (chunk 0, page 1"));
    assert!(context.contains("section: \"Operations Handbook\""));
    assert!(context.contains("relevance: 88%"));
    assert!(context.contains("[+][Source 2] sla.docx"));
    assert!(context.contains("[Contains structured data table]"));
    assert_eq!(context.matches("---").count(), 2);
}

#[test]
fn long_document_chunks_stay_within_budget_and_in_order() {
    let paragraphs: Vec<String> = (0..50)
        .map(|i| format!("Paragraph {i}: some operational details repeated for bulk. "))
        .collect();
    let body = paragraphs.join("\n\n");

    let pages =
        DocumentLoader::load(DocumentFormat::Text, "bulk.txt", body.as_bytes()).unwrap();
    let config = ChunkingConfig::default();
    let chunks = Chunker::new(config.clone()).chunk_pages(&pages).unwrap();

    assert!(chunks.len() > 1);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i);
        assert!(!chunk.text.trim().is_empty());
        assert!(chunk.text.len() <= config.chunk_size + config.chunk_overlap);
    }

    // Reading order: paragraph markers appear in nondecreasing order
    let mut last_seen = 0usize;
    for chunk in &chunks {
        if let Some(pos) = chunk.text.find("Paragraph ") {
            let tail = &chunk.text[pos + "Paragraph ".len()..];
            if let Some(n) = tail
                .split(':')
                .next()
                .and_then(|s| s.trim().parse::<usize>().ok())
            {
                assert!(n >= last_seen.saturating_sub(1));
                last_seen = last_seen.max(n);
            }
        }
    }
}

#[test]
fn unsupported_extension_is_rejected_before_loading() {
    assert!(DocumentFormat::from_filename("binary.exe").is_none());
    assert!(DocumentFormat::from_filename("report.pdf").is_some());
}
