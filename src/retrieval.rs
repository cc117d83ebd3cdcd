//! Hybrid retrieval: vector search plus lexical re-ranking
//!
//! A query is normalized, optionally expanded, embedded, searched, fused
//! across variants with reciprocal-rank fusion, filtered by similarity,
//! re-ranked by a weighted multi-signal score, and de-duplicated by token
//! overlap. Results are cached with a short TTL.

use crate::cache::{compute_cache_key, RagCache};
use crate::config::RetrievalConfig;
use crate::error::{RagError, Result};
use crate::llm::OllamaClient;
use crate::store::{RetrievalResult, VectorStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Contractions expanded during query normalization
const CONTRACTIONS: &[(&str, &str)] = &[
    ("what's", "what is"),
    ("where's", "where is"),
    ("who's", "who is"),
    ("how's", "how is"),
    ("it's", "it is"),
    ("there's", "there is"),
    ("can't", "cannot"),
    ("won't", "will not"),
    ("don't", "do not"),
    ("doesn't", "does not"),
    ("isn't", "is not"),
    ("aren't", "are not"),
    ("didn't", "did not"),
    ("couldn't", "could not"),
    ("shouldn't", "should not"),
    ("wouldn't", "would not"),
];

/// Domain synonyms used for query expansion
const SYNONYMS: &[(&str, &str)] = &[
    ("backup", "recovery"),
    ("error", "failure"),
    ("config", "configuration"),
    ("configuration", "settings"),
    ("delete", "remove"),
    ("install", "setup"),
    ("schedule", "window"),
    ("document", "file"),
];

/// BM25 constants; average document length approximates a typical chunk
const BM25_K1: f32 = 1.5;
const BM25_B: f32 = 0.75;
const BM25_AVGDL: f32 = 500.0;

/// Reciprocal-rank fusion constant
const RRF_K: f32 = 60.0;

/// Collapse whitespace, expand contractions, and strip non-semantic
/// punctuation while preserving `? . ! , -`
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());

    for token in query.split_whitespace() {
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '?' | '.' | '!' | ',' | '-' | '\''))
            .collect();
        if cleaned.is_empty() {
            continue;
        }

        let lower = cleaned.to_lowercase();
        let bare = lower.trim_end_matches(['?', '.', '!', ',']);
        let expanded = CONTRACTIONS
            .iter()
            .find(|(from, _)| *from == bare)
            .map(|(_, to)| {
                let tail = &lower[bare.len()..];
                format!("{to}{tail}")
            });

        if !out.is_empty() {
            out.push(' ');
        }
        match expanded {
            Some(e) => out.push_str(&e),
            None => out.push_str(cleaned.trim_matches('\'')),
        }
    }

    // Apostrophes only mattered for contraction matching
    out.replace('\'', "")
}

/// Produce the original query plus up to three synonym variants
pub fn expand_query(normalized: &str) -> Vec<String> {
    let mut variants = vec![normalized.to_string()];
    let lower = normalized.to_lowercase();

    for (term, replacement) in SYNONYMS {
        if variants.len() >= 4 {
            break;
        }
        let tokens: Vec<&str> = lower.split_whitespace().collect();
        if tokens.contains(term) {
            let variant: Vec<String> = lower
                .split_whitespace()
                .map(|t| {
                    if t == *term {
                        replacement.to_string()
                    } else {
                        t.to_string()
                    }
                })
                .collect();
            let variant = variant.join(" ");
            if !variants.contains(&variant) {
                variants.push(variant);
            }
        }
    }

    variants
}

/// Lowercased alphanumeric tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Fraction of query terms present in the chunk
fn keyword_overlap(query_terms: &HashSet<String>, chunk_terms: &HashSet<String>) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let hits = query_terms.intersection(chunk_terms).count();
    hits as f32 / query_terms.len() as f32
}

/// Per-chunk BM25 approximation, normalized into [0, 1)
///
/// No corpus-wide IDF is maintained; with a 0.20 weight the approximation
/// is acceptable next to the vector signal.
fn bm25_score(query_terms: &HashSet<String>, chunk_tokens: &[String]) -> f32 {
    if query_terms.is_empty() || chunk_tokens.is_empty() {
        return 0.0;
    }

    let mut tf: HashMap<&str, f32> = HashMap::new();
    for token in chunk_tokens {
        *tf.entry(token.as_str()).or_insert(0.0) += 1.0;
    }

    let dl = chunk_tokens.len() as f32;
    let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * dl / BM25_AVGDL);

    let mut score = 0.0;
    for term in query_terms {
        if let Some(freq) = tf.get(term.as_str()) {
            score += freq * (BM25_K1 + 1.0) / (freq + norm);
        }
    }

    score / (query_terms.len() as f32 * (BM25_K1 + 1.0))
}

fn position_score(chunk_index: usize) -> f32 {
    1.0 / (1.0 + 0.1 * chunk_index as f32)
}

fn length_score(text_len: usize) -> f32 {
    (text_len as f32 / 1000.0).min(1.0)
}

/// Jaccard overlap of two token sets
pub fn jaccard_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// A candidate with its computed re-rank score
#[derive(Debug, Clone)]
struct Scored {
    result: RetrievalResult,
    score: f32,
}

/// Compute the weighted multi-signal score for one candidate
fn rerank_score(
    config: &RetrievalConfig,
    query_terms: &HashSet<String>,
    result: &RetrievalResult,
    sim: f32,
) -> f32 {
    let chunk_tokens = tokenize(&result.chunk_text);
    let chunk_terms: HashSet<String> = chunk_tokens.iter().cloned().collect();

    config.similarity_weight * sim
        + config.keyword_weight * keyword_overlap(query_terms, &chunk_terms)
        + config.bm25_weight * bm25_score(query_terms, &chunk_tokens)
        + config.position_weight * position_score(result.chunk_index)
        + config.length_weight * length_score(result.chunk_text.len())
}

/// Order by score, breaking ties by similarity, chunk index, then filename
fn sort_ranked(candidates: &mut [Scored]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.result
                    .similarity
                    .partial_cmp(&a.result.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.result.chunk_index.cmp(&b.result.chunk_index))
            .then_with(|| a.result.filename.cmp(&b.result.filename))
    });
}

/// Drop candidates that are near-duplicates of already-kept ones
fn diversity_filter(candidates: Vec<Scored>, threshold: f32) -> Vec<Scored> {
    let mut kept: Vec<(Scored, HashSet<String>)> = Vec::new();

    for candidate in candidates {
        let terms: HashSet<String> = tokenize(&candidate.result.chunk_text).into_iter().collect();
        let duplicate = kept
            .iter()
            .any(|(_, kept_terms)| jaccard_overlap(&terms, kept_terms) >= threshold);
        if !duplicate {
            kept.push((candidate, terms));
        }
    }

    kept.into_iter().map(|(c, _)| c).collect()
}

/// Fuse per-variant ranked lists with reciprocal-rank fusion
///
/// Returns candidates keyed by (filename, chunk_index) with their fused
/// pre-rerank score and best raw similarity.
fn fuse_variants(lists: &[Vec<RetrievalResult>]) -> Vec<(RetrievalResult, f32)> {
    let mut fused: HashMap<(String, usize), (RetrievalResult, f32, f32)> = HashMap::new();

    for list in lists {
        for (rank, result) in list.iter().enumerate() {
            let key = (result.filename.clone(), result.chunk_index);
            let rrf = 1.0 / (RRF_K + rank as f32 + 1.0);
            let entry = fused
                .entry(key)
                .or_insert_with(|| (result.clone(), 0.0, result.similarity));
            entry.1 += rrf;
            if result.similarity > entry.2 {
                entry.2 = result.similarity;
                entry.0 = result.clone();
            }
        }
    }

    let max_rrf = fused
        .values()
        .map(|(_, rrf, _)| *rrf)
        .fold(0.0f32, f32::max);

    fused
        .into_values()
        .map(|(result, rrf, best_sim)| {
            let rrf_norm = if max_rrf > 0.0 { rrf / max_rrf } else { 0.0 };
            (result, 0.7 * rrf_norm + 0.3 * best_sim)
        })
        .collect()
}

/// Turns a user query into an ordered list of retrieval results
pub struct Retriever {
    store: Arc<VectorStore>,
    llm: Arc<OllamaClient>,
    cache: Arc<RagCache>,
    config: RetrievalConfig,
    embedding_model: String,
}

impl Retriever {
    pub fn new(
        store: Arc<VectorStore>,
        llm: Arc<OllamaClient>,
        cache: Arc<RagCache>,
        config: RetrievalConfig,
        embedding_model: String,
    ) -> Self {
        Self {
            store,
            llm,
            cache,
            config,
            embedding_model,
        }
    }

    /// Run the full retrieval pipeline for one query
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        file_type: Option<&str>,
    ) -> Result<Vec<RetrievalResult>> {
        let normalized = normalize_query(query);
        if normalized.trim_matches(|c: char| !c.is_alphanumeric()).is_empty() {
            return Err(RagError::Validation("query is empty".to_string()));
        }

        let top_k = top_k.unwrap_or(self.config.top_k).max(1);
        let cache_key = compute_cache_key(&[
            &normalized,
            &top_k.to_string(),
            &self.config.min_similarity.to_string(),
            file_type.unwrap_or(""),
        ]);

        if let Some(cached) = self
            .cache
            .get_results::<Vec<RetrievalResult>>(&cache_key)
            .await
        {
            debug!("Retrieval cache hit for {:?}", normalized);
            return Ok(cached);
        }

        let variants = if self.config.enable_query_expansion {
            expand_query(&normalized)
        } else {
            vec![normalized.clone()]
        };

        let knn = (top_k * 4).min(100);
        let mut lists: Vec<Vec<RetrievalResult>> = Vec::with_capacity(variants.len());
        for variant in &variants {
            let embedding = self.embed_cached(variant).await?;
            let results = self
                .store
                .search_similar_chunks(&embedding, knn, file_type)
                .await?;
            lists.push(results);
        }

        // Pre-rerank score: fused across variants, or raw similarity
        let candidates: Vec<(RetrievalResult, f32)> = if lists.len() > 1 {
            fuse_variants(&lists)
        } else {
            lists
                .pop()
                .unwrap_or_default()
                .into_iter()
                .map(|r| {
                    let sim = r.similarity;
                    (r, sim)
                })
                .collect()
        };

        if candidates.is_empty() {
            debug!("No candidates for {:?}", normalized);
            return Ok(Vec::new());
        }

        // Similarity floor on raw cosine similarity
        let max_observed = candidates
            .iter()
            .map(|(r, _)| r.similarity)
            .fold(0.0f32, f32::max);
        let surviving: Vec<(RetrievalResult, f32)> = candidates
            .into_iter()
            .filter(|(r, _)| r.similarity >= self.config.min_similarity)
            .collect();

        if surviving.is_empty() {
            info!(
                "All candidates below similarity threshold {} (max observed {:.3})",
                self.config.min_similarity, max_observed
            );
            return Ok(Vec::new());
        }

        let query_terms: HashSet<String> = tokenize(&normalized).into_iter().collect();
        let mut scored: Vec<Scored> = surviving
            .into_iter()
            .map(|(result, sim)| {
                let score = rerank_score(&self.config, &query_terms, &result, sim);
                Scored { result, score }
            })
            .collect();

        sort_ranked(&mut scored);
        let kept = diversity_filter(scored, self.config.diversity_threshold);

        let limit = self.config.rerank_top_k.min(top_k.max(1));
        let results: Vec<RetrievalResult> = kept
            .into_iter()
            .take(limit)
            .map(|s| s.result)
            .collect();

        self.cache.set_results(&cache_key, &results).await;
        Ok(results)
    }

    /// Fetch a query embedding through the cache
    async fn embed_cached(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(embedding) = self.cache.get_embedding(text).await {
            return Ok(embedding);
        }

        let embedding = self
            .llm
            .generate_embedding(&self.embedding_model, text)
            .await
            .map_err(|e| {
                warn!("Query embedding failed: {}", e);
                e
            })?;
        self.cache.set_embedding(text, &embedding).await;
        Ok(embedding)
    }
}
