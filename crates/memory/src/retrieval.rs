//! Retrieval composition: query embedding, search, merge and budgeting.

use std::collections::HashMap;
use std::sync::Arc;

use healmate_common::{Result, with_retry};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::embedding::Embedder;
use crate::knowledge::{KnowledgeDomain, KnowledgeStore, RetrievedPassage, SearchFilter};
use crate::types::RetrievalConfig;

/// Passages plus a rendered, citation-bearing context block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundedContext {
    pub passages: Vec<RetrievedPassage>,
    pub text: String,
    /// Set when a backing service failed and grounding is incomplete.
    pub degraded: bool,
}

impl GroundedContext {
    pub fn degraded() -> Self {
        Self {
            degraded: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn passage_ids(&self) -> Vec<String> {
        self.passages.iter().map(|p| p.source_id.clone()).collect()
    }
}

/// Builds grounded context from the knowledge store.
pub struct RetrievalComposer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn KnowledgeStore>,
    config: RetrievalConfig,
}

impl RetrievalComposer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn KnowledgeStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Compose grounded context for `query`. Never fails: unavailable
    /// services yield an empty, degraded context.
    #[instrument(skip(self, query, domain), fields(query_len = query.len(), domain = ?domain))]
    pub async fn compose(&self, query: &str, domain: Option<KnowledgeDomain>) -> GroundedContext {
        let k = self.config.k.max(1);

        let embedding = match with_retry(&self.config.retry, "embedding.embed", || {
            self.embedder.embed(query)
        })
        .await
        {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, continuing without grounding");
                return GroundedContext::degraded();
            }
        };

        let mut degraded = false;
        let mut result_sets = Vec::with_capacity(2);

        match self.search(&embedding, None, k).await {
            Ok(hits) => result_sets.push(hits),
            Err(e) => {
                warn!(error = %e, "Knowledge search failed");
                degraded = true;
            }
        }

        if let Some(domain) = domain {
            let filter = SearchFilter::from(domain);
            match self.search(&embedding, Some(&filter), k).await {
                Ok(hits) => result_sets.push(hits),
                Err(e) => {
                    warn!(error = %e, domain = ?domain, "Filtered knowledge search failed");
                    degraded = true;
                }
            }
        }

        let passages = merge_passages(result_sets, k, self.config.min_score);
        let (passages, text) = render_context(passages, self.config.context_char_budget);

        debug!(
            passages = passages.len(),
            chars = text.chars().count(),
            degraded,
            "Composed grounded context"
        );

        GroundedContext {
            passages,
            text,
            degraded,
        }
    }

    /// Combine contexts from several queries of one turn into a single
    /// context under the same `k` and character budget as one query.
    pub fn merge(&self, contexts: Vec<GroundedContext>) -> GroundedContext {
        let degraded = contexts.iter().any(|c| c.degraded);
        let result_sets = contexts.into_iter().map(|c| c.passages).collect();
        let passages = merge_passages(result_sets, self.config.k.max(1), self.config.min_score);
        let (passages, text) = render_context(passages, self.config.context_char_budget);
        GroundedContext {
            passages,
            text,
            degraded,
        }
    }

    async fn search(
        &self,
        embedding: &[f32],
        filter: Option<&SearchFilter>,
        k: usize,
    ) -> Result<Vec<RetrievedPassage>> {
        with_retry(&self.config.retry, "knowledge.search", || {
            self.store.search(embedding, filter, k)
        })
        .await
    }
}

/// Dedupe by source id keeping the higher score, drop weak hits, sort by
/// score descending and cap at `k`.
pub fn merge_passages(
    result_sets: Vec<Vec<RetrievedPassage>>,
    k: usize,
    min_score: f32,
) -> Vec<RetrievedPassage> {
    let mut best: HashMap<String, RetrievedPassage> = HashMap::new();
    for passage in result_sets.into_iter().flatten() {
        if passage.score < min_score {
            continue;
        }
        match best.get(&passage.source_id) {
            Some(existing) if existing.score >= passage.score => {}
            _ => {
                best.insert(passage.source_id.clone(), passage);
            }
        }
    }

    let mut merged: Vec<RetrievedPassage> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    merged.truncate(k);
    merged
}

/// Render `[source_id] text` blocks within `budget` characters. A passage
/// that only partly fits is cut; passages after the budget are dropped.
fn render_context(
    passages: Vec<RetrievedPassage>,
    budget: usize,
) -> (Vec<RetrievedPassage>, String) {
    let mut kept = Vec::with_capacity(passages.len());
    let mut parts: Vec<String> = Vec::with_capacity(passages.len());
    let mut used = 0usize;

    for passage in passages {
        let header = format!("[{}] ", passage.source_id);
        let separator = if parts.is_empty() { 0 } else { 2 };
        let overhead = header.chars().count() + separator;
        if used + overhead >= budget {
            break;
        }
        let room = budget - used - overhead;
        let body = truncate_chars(&passage.text, room);
        used += overhead + body.chars().count();
        parts.push(format!("{header}{body}"));
        let cut = body.chars().count() < passage.text.chars().count();
        kept.push(passage);
        if cut {
            break;
        }
    }

    (kept, parts.join("\n\n"))
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
