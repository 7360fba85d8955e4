//! Hybrid lexical + semantic tool discovery.
//!
//! When a catalogue grows, sending every tool definition on every step wastes
//! context and confuses the model. [`ToolDiscoveryIndex::search`] ranks tools
//! for a free-text query so the controller can narrow the active tool set.
//!
//! - **Lexical** (always available): BM25 over each tool's name, example
//!   phrases, and description, weighted in that order. Identifiers are split
//!   on camelCase and snake_case so `createPage` matches "create a page".
//! - **Semantic** (once ready): cosine similarity between the query embedding
//!   and per-tool embeddings built by a background task in batches. Used when
//!   lexical confidence is low or when forced, and merged with the lexical
//!   ranking by reciprocal-rank fusion.
//!
//! Search works lexical-only from construction; semantic ranking switches on
//! by itself once [`ToolDiscoveryIndex::spawn_embedding`] completes.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::embedding::{Embedder, cosine_similarity};
use crate::{AgentError, ToolDef};

/// BM25 term-frequency saturation.
const BM25_K1: f64 = 1.2;
/// BM25 length normalization.
const BM25_B: f64 = 0.75;
/// Reciprocal-rank fusion constant.
const RRF_K: f64 = 60.0;

const NAME_WEIGHT: f64 = 3.0;
const EXAMPLE_WEIGHT: f64 = 2.0;
const DESCRIPTION_WEIGHT: f64 = 1.0;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "i", "in", "into", "is", "it",
    "me", "my", "of", "on", "or", "please", "the", "this", "to", "with",
];

// ── Metadata ───────────────────────────────────────────────────────

/// How dangerous a tool is to call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Searchable description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Example user phrases the tool serves.
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Tools often needed alongside this one.
    #[serde(default)]
    pub related: Vec<String>,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            examples: Vec::new(),
            category: None,
            related: Vec::new(),
            risk: RiskLevel::Low,
            requires_confirmation: false,
        }
    }

    /// Minimal metadata derived from a tool definition.
    pub fn from_def(def: &ToolDef) -> Self {
        Self::new(def.function.name.clone(), def.function.description.clone())
    }

    pub fn with_examples(mut self, examples: &[&str]) -> Self {
        self.examples = examples.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_related(mut self, related: &[&str]) -> Self {
        self.related = related.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// Text embedded for semantic search.
    pub fn searchable_text(&self) -> String {
        let mut text = format!("{}: {}", split_identifier(&self.name).join(" "), self.description);
        if !self.examples.is_empty() {
            text.push_str("\nExamples: ");
            text.push_str(&self.examples.join("; "));
        }
        text
    }
}

// ── Config ─────────────────────────────────────────────────────────

/// Discovery index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Build embeddings for semantic ranking.
    pub embeddings: bool,
    pub embedding_model: String,
    pub embedding_base_url: String,
    /// Tools per embedding request.
    pub batch_size: usize,
    /// Pause between embedding requests.
    pub batch_delay_ms: u64,
    /// Fewer lexical hits than this counts as low confidence.
    pub min_confident_hits: usize,
    /// A top BM25 score below this counts as low confidence.
    pub min_confident_score: f64,
    /// Semantic hits below this cosine similarity are dropped.
    pub min_similarity: f32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            embeddings: false,
            embedding_model: "text-embedding-3-small".into(),
            embedding_base_url: "https://api.openai.com/v1".into(),
            batch_size: 16,
            batch_delay_ms: 250,
            min_confident_hits: 2,
            min_confident_score: 1.5,
            min_similarity: 0.2,
        }
    }
}

// ── Search types ───────────────────────────────────────────────────

/// Options for [`ToolDiscoveryIndex::search`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    /// Append each result's related tools after the ranked results.
    pub expand_related: bool,
    /// Use semantic ranking even when lexical results look confident.
    pub force_vector: bool,
}

/// Which ranking produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Lexical,
    Semantic,
    Hybrid,
    Related,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTool {
    pub name: String,
    pub score: f64,
    pub source: MatchSource,
}

// ── Tokenization ───────────────────────────────────────────────────

/// Split an identifier on camelCase, snake_case, kebab-case and digits.
fn split_identifier(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in s.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn normalize(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word.trim_end_matches('s').to_string()
    } else {
        word.to_string()
    }
}

/// Lowercased, stemmed tokens without stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    split_identifier(text)
        .into_iter()
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| normalize(&w))
        .filter(|w| !w.is_empty())
        .collect()
}

// ── Lexical index ──────────────────────────────────────────────────

#[derive(Debug)]
struct LexicalDoc {
    /// Field-weighted term frequencies.
    tf: HashMap<String, f64>,
    /// Field-weighted length.
    len: f64,
}

#[derive(Debug)]
struct Bm25 {
    docs: Vec<LexicalDoc>,
    df: HashMap<String, usize>,
    avg_len: f64,
}

impl Bm25 {
    fn build(tools: &[ToolMetadata]) -> Self {
        let mut docs = Vec::with_capacity(tools.len());
        let mut df: HashMap<String, usize> = HashMap::new();

        for tool in tools {
            let mut tf: HashMap<String, f64> = HashMap::new();
            let mut len = 0.0;
            let fields = [
                (tokenize(&tool.name), NAME_WEIGHT),
                (tokenize(&tool.examples.join(" ")), EXAMPLE_WEIGHT),
                (tokenize(&tool.description), DESCRIPTION_WEIGHT),
            ];
            for (tokens, weight) in fields {
                len += tokens.len() as f64 * weight;
                for t in tokens {
                    *tf.entry(t).or_insert(0.0) += weight;
                }
            }
            for term in tf.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
            docs.push(LexicalDoc { tf, len });
        }

        let avg_len = if docs.is_empty() {
            0.0
        } else {
            docs.iter().map(|d| d.len).sum::<f64>() / docs.len() as f64
        };
        Self { docs, df, avg_len }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// `(doc index, score)` for docs with a positive score, best first.
    fn search(&self, query: &str) -> Vec<(usize, f64)> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let mut scored: Vec<(usize, f64)> = self
            .docs
            .iter()
            .enumerate()
            .filter_map(|(i, doc)| {
                let norm = if self.avg_len > 0.0 {
                    1.0 - BM25_B + BM25_B * doc.len / self.avg_len
                } else {
                    1.0
                };
                let score: f64 = terms
                    .iter()
                    .filter_map(|t| doc.tf.get(t).map(|tf| (t, *tf)))
                    .map(|(t, tf)| self.idf(t) * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm))
                    .sum();
                (score > 0.0).then_some((i, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored
    }
}

// ── Index ──────────────────────────────────────────────────────────

/// Searchable tool catalogue. Cheap to share behind an `Arc`.
pub struct ToolDiscoveryIndex {
    tools: Vec<ToolMetadata>,
    by_name: HashMap<String, usize>,
    lexical: Bm25,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: RwLock<Option<Vec<Vec<f32>>>>,
    config: DiscoveryConfig,
}

impl std::fmt::Debug for ToolDiscoveryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDiscoveryIndex")
            .field("tools", &self.tools.len())
            .field("semantic_ready", &self.is_semantic_ready())
            .finish()
    }
}

impl ToolDiscoveryIndex {
    /// Build the lexical index. Later duplicates of a name replace earlier
    /// entries.
    pub fn new(tools: Vec<ToolMetadata>, config: DiscoveryConfig) -> Self {
        let mut deduped: Vec<ToolMetadata> = Vec::with_capacity(tools.len());
        let mut by_name = HashMap::new();
        for tool in tools {
            match by_name.get(&tool.name) {
                Some(&i) => deduped[i] = tool,
                None => {
                    by_name.insert(tool.name.clone(), deduped.len());
                    deduped.push(tool);
                }
            }
        }
        let lexical = Bm25::build(&deduped);
        Self {
            tools: deduped,
            by_name,
            lexical,
            embedder: None,
            vectors: RwLock::new(None),
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn tools(&self) -> &[ToolMetadata] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolMetadata> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether semantic ranking is available.
    pub fn is_semantic_ready(&self) -> bool {
        self.vectors.read().map(|v| v.is_some()).unwrap_or(false)
    }

    /// Embed every tool's searchable text in batches, then enable semantic
    /// ranking. On failure, including a batch that comes back with the wrong
    /// number of vectors, the index stays lexical-only.
    pub async fn build_embeddings(&self) -> Result<(), AgentError> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };
        let texts: Vec<String> = self.tools.iter().map(|t| t.searchable_text()).collect();
        let batch_size = self.config.batch_size.max(1);
        let delay = Duration::from_millis(self.config.batch_delay_ms);
        let batches = texts.len().div_ceil(batch_size);

        let mut vectors = Vec::with_capacity(texts.len());
        for (i, chunk) in texts.chunks(batch_size).enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let batch = embedder.embed_batch(chunk).await?;
            if batch.len() != chunk.len() {
                return Err(AgentError::Embedding(format!(
                    "batch {}/{batches}: expected {} embeddings, got {}",
                    i + 1,
                    chunk.len(),
                    batch.len()
                )));
            }
            vectors.extend(batch);
            debug!("Embedded tool batch {}/{}", i + 1, batches);
        }

        if let Ok(mut slot) = self.vectors.write() {
            *slot = Some(vectors);
        }
        info!("Tool discovery: semantic ranking ready ({} tools)", self.tools.len());
        Ok(())
    }

    /// Build embeddings on a background task. Returns `None` when no
    /// embedder is attached.
    pub fn spawn_embedding(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.embedder.as_ref()?;
        let index = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = index.build_embeddings().await {
                warn!("Tool embedding failed, discovery stays lexical-only: {e}");
            }
        }))
    }

    fn semantic_search(&self, query_vec: &[f32]) -> Vec<(usize, f64)> {
        let Ok(guard) = self.vectors.read() else {
            return Vec::new();
        };
        let Some(vectors) = guard.as_ref() else {
            return Vec::new();
        };
        let mut scored: Vec<(usize, f64)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query_vec, v)))
            .filter(|(_, s)| *s >= self.config.min_similarity)
            .map(|(i, s)| (i, f64::from(s)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored
    }

    /// Rank tools for `query`.
    pub async fn search(&self, query: &str, limit: usize, opts: SearchOptions) -> Vec<RankedTool> {
        if limit == 0 || self.tools.is_empty() {
            return Vec::new();
        }
        let lexical = self.lexical.search(query);

        let confident = lexical.len() >= self.config.min_confident_hits
            && lexical
                .first()
                .is_some_and(|(_, s)| *s >= self.config.min_confident_score);

        let mut ranked = if (opts.force_vector || !confident) && self.is_semantic_ready() {
            match self.embed_query(query).await {
                Some(qv) => {
                    let semantic = self.semantic_search(&qv);
                    debug!(
                        query,
                        lexical = lexical.len(),
                        semantic = semantic.len(),
                        "Hybrid tool search"
                    );
                    self.fuse(&lexical, &semantic, limit)
                }
                None => self.lexical_only(&lexical, limit),
            }
        } else {
            self.lexical_only(&lexical, limit)
        };

        if opts.expand_related {
            self.append_related(&mut ranked);
        }
        ranked
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(query).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                warn!("Query embedding failed, using lexical ranking: {e}");
                None
            }
        }
    }

    fn lexical_only(&self, lexical: &[(usize, f64)], limit: usize) -> Vec<RankedTool> {
        lexical
            .iter()
            .take(limit)
            .map(|&(i, score)| RankedTool {
                name: self.tools[i].name.clone(),
                score,
                source: MatchSource::Lexical,
            })
            .collect()
    }

    /// Reciprocal-rank fusion of both rankings.
    fn fuse(&self, lexical: &[(usize, f64)], semantic: &[(usize, f64)], limit: usize) -> Vec<RankedTool> {
        let window = limit * 2;
        let mut scores: HashMap<usize, (f64, bool, bool)> = HashMap::new();
        for (rank, &(i, _)) in lexical.iter().take(window).enumerate() {
            let e = scores.entry(i).or_insert((0.0, false, false));
            e.0 += 1.0 / (RRF_K + (rank + 1) as f64);
            e.1 = true;
        }
        for (rank, &(i, _)) in semantic.iter().take(window).enumerate() {
            let e = scores.entry(i).or_insert((0.0, false, false));
            e.0 += 1.0 / (RRF_K + (rank + 1) as f64);
            e.2 = true;
        }

        let mut merged: Vec<RankedTool> = scores
            .into_iter()
            .map(|(i, (score, lex, sem))| RankedTool {
                name: self.tools[i].name.clone(),
                score,
                source: match (lex, sem) {
                    (true, true) => MatchSource::Hybrid,
                    (true, false) => MatchSource::Lexical,
                    _ => MatchSource::Semantic,
                },
            })
            .collect();
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        merged.truncate(limit);
        merged
    }

    fn append_related(&self, ranked: &mut Vec<RankedTool>) {
        let mut seen: HashSet<String> = ranked.iter().map(|r| r.name.clone()).collect();
        let mut extra = Vec::new();
        for r in ranked.iter() {
            let Some(meta) = self.get(&r.name) else {
                continue;
            };
            for rel in &meta.related {
                if self.by_name.contains_key(rel) && seen.insert(rel.clone()) {
                    extra.push(RankedTool {
                        name: rel.clone(),
                        score: 0.0,
                        source: MatchSource::Related,
                    });
                }
            }
        }
        ranked.extend(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue() -> Vec<ToolMetadata> {
        vec![
            ToolMetadata::new("createPage", "Create a new page with a slug and title")
                .with_examples(&["add an about page", "make a new landing page"])
                .with_related(&["listPages"])
                .with_category("pages"),
            ToolMetadata::new("listPages", "List all pages in the site")
                .with_examples(&["show me every page"]),
            ToolMetadata::new("deletePage", "Delete a page by id")
                .with_examples(&["remove the old page"])
                .with_risk(RiskLevel::High),
            ToolMetadata::new("uploadImage", "Upload an image to the media library")
                .with_examples(&["add a photo", "upload picture"])
                .with_related(&["listMedia"]),
            ToolMetadata::new("listMedia", "List uploaded media files"),
            ToolMetadata::new("updateNavigation", "Change the site menu entries")
                .with_examples(&["edit the menu"]),
        ]
    }

    #[test]
    fn splits_identifiers() {
        assert_eq!(split_identifier("createPage"), vec!["create", "page"]);
        assert_eq!(split_identifier("list_media_v2"), vec!["list", "media", "v2"]);
        assert_eq!(split_identifier("HTTPServer"), vec!["httpserver"]);
        assert_eq!(tokenize("Show me the Pages"), vec!["show", "page"]);
    }

    #[tokio::test]
    async fn lexical_ranks_name_matches_first() {
        let index = ToolDiscoveryIndex::new(catalogue(), DiscoveryConfig::default());
        let results = index.search("create page", 3, SearchOptions::default()).await;
        assert_eq!(results[0].name, "createPage");
        assert_eq!(results[0].source, MatchSource::Lexical);
        assert!(results.len() <= 3);
    }

    #[tokio::test]
    async fn examples_contribute() {
        let index = ToolDiscoveryIndex::new(catalogue(), DiscoveryConfig::default());
        let results = index.search("photo", 5, SearchOptions::default()).await;
        assert_eq!(results[0].name, "uploadImage");
    }

    #[tokio::test]
    async fn related_tools_appended_once() {
        let index = ToolDiscoveryIndex::new(catalogue(), DiscoveryConfig::default());
        let opts = SearchOptions {
            expand_related: true,
            ..Default::default()
        };
        let results = index.search("upload image", 1, opts).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "uploadImage");
        assert_eq!(results[1].name, "listMedia");
        assert_eq!(results[1].source, MatchSource::Related);
    }

    #[tokio::test]
    async fn no_match_returns_empty_without_embeddings() {
        let index = ToolDiscoveryIndex::new(catalogue(), DiscoveryConfig::default());
        assert!(index.search("zebra", 5, SearchOptions::default()).await.is_empty());
        assert!(!index.is_semantic_ready());
    }

    /// Embeds text as a bag of two concepts: media-ish and menu-ish words.
    struct ConceptEmbedder;

    #[async_trait::async_trait]
    impl Embedder for ConceptEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
            let t = text.to_lowercase();
            let media = ["image", "photo", "picture", "media", "snapshot"]
                .iter()
                .filter(|w| t.contains(*w))
                .count() as f32;
            let menu = ["menu", "navigation", "nav bar"]
                .iter()
                .filter(|w| t.contains(*w))
                .count() as f32;
            Ok(vec![media, menu, 0.01])
        }
    }

    struct BrokenEmbedder;

    #[async_trait::async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _: &str) -> Result<Vec<f32>, AgentError> {
            Err(AgentError::Embedding("HTTP 429".into()))
        }
    }

    /// Drops the last vector of every batch.
    struct ShortEmbedder;

    #[async_trait::async_trait]
    impl Embedder for ShortEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
            ConceptEmbedder.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AgentError> {
            let mut out = Vec::new();
            for text in texts.iter().skip(1) {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn semantic_fallback_when_lexical_weak() {
        let config = DiscoveryConfig {
            batch_size: 2,
            batch_delay_ms: 0,
            ..Default::default()
        };
        let index = Arc::new(
            ToolDiscoveryIndex::new(catalogue(), config).with_embedder(Arc::new(ConceptEmbedder)),
        );
        index.spawn_embedding().unwrap().await.unwrap();
        assert!(index.is_semantic_ready());

        let results = index.search("snapshot", 2, SearchOptions::default()).await;
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.source == MatchSource::Semantic));
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"uploadImage") || names.contains(&"listMedia"));
    }

    #[tokio::test]
    async fn force_vector_merges_sources() {
        let config = DiscoveryConfig {
            batch_delay_ms: 0,
            ..Default::default()
        };
        let index =
            ToolDiscoveryIndex::new(catalogue(), config).with_embedder(Arc::new(ConceptEmbedder));
        index.build_embeddings().await.unwrap();

        let opts = SearchOptions {
            force_vector: true,
            ..Default::default()
        };
        let results = index.search("upload image", 3, opts).await;
        assert_eq!(results[0].name, "uploadImage");
        assert_eq!(results[0].source, MatchSource::Hybrid);
    }

    #[tokio::test]
    async fn embedding_failure_stays_lexical() {
        let index = Arc::new(
            ToolDiscoveryIndex::new(catalogue(), DiscoveryConfig::default())
                .with_embedder(Arc::new(BrokenEmbedder)),
        );
        index.spawn_embedding().unwrap().await.unwrap();
        assert!(!index.is_semantic_ready());
        let results = index.search("create page", 2, SearchOptions::default()).await;
        assert_eq!(results[0].name, "createPage");
    }

    #[tokio::test]
    async fn short_embedding_batch_is_rejected() {
        let config = DiscoveryConfig {
            batch_delay_ms: 0,
            ..Default::default()
        };
        let index =
            ToolDiscoveryIndex::new(catalogue(), config).with_embedder(Arc::new(ShortEmbedder));
        let err = index.build_embeddings().await.unwrap_err();
        assert!(matches!(err, AgentError::Embedding(_)), "{err:?}");
        assert!(!index.is_semantic_ready());

        let opts = SearchOptions {
            force_vector: true,
            ..Default::default()
        };
        let results = index.search("upload image", 3, opts).await;
        assert_eq!(results[0].name, "uploadImage");
        assert_eq!(results[0].source, MatchSource::Lexical);
        assert!(
            results
                .iter()
                .all(|r| !matches!(r.source, MatchSource::Semantic | MatchSource::Hybrid))
        );
    }

    #[test]
    fn spawn_without_embedder_is_none() {
        let index = Arc::new(ToolDiscoveryIndex::new(catalogue(), DiscoveryConfig::default()));
        assert!(index.spawn_embedding().is_none());
    }

    #[test]
    fn metadata_deserializes_with_defaults() {
        let meta: ToolMetadata = serde_json::from_str(r#"{"name": "getPage"}"#).unwrap();
        assert_eq!(meta.risk, RiskLevel::Low);
        assert!(meta.related.is_empty());
        assert_eq!(ToolMetadata::from_def(&ToolDef::new("x", "d", serde_json::json!({}))).name, "x");
    }
}
