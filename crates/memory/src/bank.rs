//! The memory bank.
//!
//! Items are created and updated only through [`MemoryBank::upsert`].
//! Every upsert refreshes `updated_at` and (re)computes the item's
//! embedding under the active model. Embedding failures never fail the
//! upsert; the vector is computed again on demand at search time.

use crate::embedding::{EmbeddingCache, text_hash};
use crate::vector::{cosine_similarity, lexical_score};
use canopy_core::error::MemoryError;
use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::memory::{MemoryItem, MemoryScope, MemoryStatus};
use canopy_core::provider::Embedder;
use canopy_core::{Error, Result};
use canopy_store::{MemoryFilter, SqliteStore, StoredEmbedding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A search over active memory items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQuery {
    pub query: String,
    pub top_k: usize,
    /// Any of these scopes; empty means every scope.
    #[serde(default)]
    pub scopes: Vec<MemoryScope>,
    /// Items must carry all of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// `updated_at` window. The bounds may be given in either order.
    #[serde(default)]
    pub time_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_to: Option<DateTime<Utc>>,
}

impl MemoryQuery {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            top_k,
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: MemoryScope) -> Self {
        self.scopes.push(scope);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_time_range(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.time_from = from;
        self.time_to = to;
        self
    }

    /// The window with `from <= to`.
    pub fn time_window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match (self.time_from, self.time_to) {
            (Some(from), Some(to)) if from > to => (Some(to), Some(from)),
            window => window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    pub score: f32,
}

pub struct MemoryBank {
    store: SqliteStore,
    embedder: Option<Arc<dyn Embedder>>,
    model: RwLock<String>,
    cache: EmbeddingCache,
    events: EventBus,
}

impl MemoryBank {
    /// A bank without an embedder ranks by lexical containment only.
    pub fn new(store: SqliteStore, events: EventBus) -> Self {
        Self {
            store,
            embedder: None,
            model: RwLock::new(String::new()),
            cache: EmbeddingCache::new(),
            events,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>, model: impl Into<String>) -> Self {
        self.embedder = Some(embedder);
        self.model = RwLock::new(model.into());
        self
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    pub async fn embedding_model(&self) -> String {
        self.model.read().await.clone()
    }

    /// Switch the active embedding model. Items are re-embedded lazily the
    /// next time a search needs them.
    pub async fn set_embedding_model(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(Error::Validation("embedding model cannot be empty".into()));
        }
        let mut current = self.model.write().await;
        if *current != model {
            info!(from = %current, to = model, "Switched embedding model");
            *current = model.to_string();
        }
        Ok(())
    }

    /// Create or update an item. An existing item keeps its `created_at`;
    /// `updated_at` is always refreshed.
    pub async fn upsert(&self, mut item: MemoryItem) -> Result<MemoryItem> {
        let text = item.text.trim();
        if text.is_empty() {
            return Err(MemoryError::Invalid("memory text cannot be empty".into()).into());
        }
        item.text = text.to_string();
        item.normalize_tags();

        let now = Utc::now();
        if let Some(existing) = self.store.get_memory(&item.id).await? {
            item.created_at = existing.created_at;
        }
        item.updated_at = now.max(item.created_at);
        self.store.upsert_memory(&item).await?;

        if let Err(e) = self.embed_item(&item).await {
            warn!(memory_id = %item.id, error = %e, "Embedding failed, will retry at search time");
        }

        debug!(memory_id = %item.id, scope = item.scope.kind(), "Upserted memory");
        self.events.publish(DomainEvent::MemoryUpserted {
            memory_id: item.id.clone(),
            timestamp: item.updated_at,
        });
        Ok(item)
    }

    pub async fn get(&self, id: &str) -> Result<MemoryItem> {
        self.store
            .get_memory(id)
            .await?
            .ok_or_else(|| Error::not_found("memory", id))
    }

    /// Fetch items in request order. Unknown ids are skipped and repeated
    /// ids yield one result at their first position.
    pub async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<MemoryItem>> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect();
        let mut found: HashMap<String, MemoryItem> = self
            .store
            .get_memories(&unique)
            .await?
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        Ok(unique.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Items in `scope` (every scope with `None`), most recently updated first.
    pub async fn list(&self, scope: Option<MemoryScope>, include_archived: bool) -> Result<Vec<MemoryItem>> {
        let filter = MemoryFilter {
            scopes: scope.into_iter().collect(),
            status: (!include_archived).then_some(MemoryStatus::Active),
            ..Default::default()
        };
        Ok(self.store.list_memories(&filter).await?)
    }

    /// Archived items stay stored but are no longer search candidates.
    pub async fn archive(&self, id: &str) -> Result<()> {
        if !self.store.set_memory_status(id, MemoryStatus::Archived, Utc::now()).await? {
            return Err(Error::not_found("memory", id));
        }
        info!(memory_id = id, "Archived memory");
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.store.delete_memory(id).await? {
            return Err(Error::not_found("memory", id));
        }
        info!(memory_id = id, "Deleted memory");
        Ok(())
    }

    /// Rank active items against `query`.
    ///
    /// With an embedder the score is cosine similarity to the query vector.
    /// Without one, or when the query cannot be embedded, the score is
    /// lexical containment and non-matching items are dropped. A blank query
    /// returns the most recently updated candidates. Ties always break by
    /// `updated_at` descending.
    pub async fn search(&self, query: &MemoryQuery) -> Result<Vec<ScoredMemory>> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }
        let (updated_from, updated_to) = query.time_window();
        let filter = MemoryFilter {
            scopes: query.scopes.clone(),
            status: Some(MemoryStatus::Active),
            tags: query.tags.clone(),
            updated_from,
            updated_to,
        };
        let candidates = self.store.list_memories(&filter).await?;

        let text = query.query.trim();
        if text.is_empty() {
            return Ok(candidates
                .into_iter()
                .take(query.top_k)
                .map(|item| ScoredMemory { item, score: 0.0 })
                .collect());
        }

        let mut scored = match &self.embedder {
            Some(embedder) => match self.semantic_scores(embedder.as_ref(), text, &candidates).await {
                Ok(scores) => candidates
                    .into_iter()
                    .zip(scores)
                    .map(|(item, score)| ScoredMemory { item, score })
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "Embeddings unavailable, falling back to lexical ranking");
                    lexical(text, candidates)
                }
            },
            None => lexical(text, candidates),
        };

        scored.sort_by(rank_order);
        scored.truncate(query.top_k);
        debug!(query = text, results = scored.len(), "Memory search");
        Ok(scored)
    }

    /// Cosine scores aligned with `items`. Fails unless the query and every
    /// item have a vector.
    async fn semantic_scores(&self, embedder: &dyn Embedder, query: &str, items: &[MemoryItem]) -> Result<Vec<f32>> {
        let model = self.embedding_model().await;
        let query_vec = self
            .cache
            .embed_many(embedder, &model, &[query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| MemoryError::EmbeddingFailed("empty query embedding".into()))?;

        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let mut stored = self.store.embeddings_for(&model, &ids).await?;

        let stale: Vec<&MemoryItem> = items
            .iter()
            .filter(|item| {
                stored
                    .get(&item.id)
                    .is_none_or(|e| e.text_hash != text_hash(&item.text))
            })
            .collect();
        if !stale.is_empty() {
            let texts: Vec<String> = stale.iter().map(|i| i.text.clone()).collect();
            match self.cache.embed_many(embedder, &model, &texts).await {
                Ok(vectors) => {
                    for (item, vector) in stale.into_iter().zip(vectors) {
                        let embedding = StoredEmbedding {
                            text_hash: text_hash(&item.text),
                            vector,
                        };
                        if let Err(e) = self.store.put_embedding(&item.id, &model, &embedding).await {
                            warn!(memory_id = %item.id, error = %e, "Failed to persist embedding");
                        }
                        stored.insert(item.id.clone(), embedding);
                    }
                }
                Err(e) => {
                    warn!(missing = stale.len(), error = %e, "Item embeddings unavailable");
                    return Err(e.into());
                }
            }
        }

        items
            .iter()
            .map(|item| {
                stored
                    .get(&item.id)
                    .map(|e| cosine_similarity(&query_vec, &e.vector))
                    .ok_or_else(|| Error::from(MemoryError::EmbeddingFailed(format!("no vector for memory {}", item.id))))
            })
            .collect()
    }

    async fn embed_item(&self, item: &MemoryItem) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };
        let model = self.embedding_model().await;
        let hash = text_hash(&item.text);
        let existing = self.store.embeddings_for(&model, std::slice::from_ref(&item.id)).await?;
        if existing.get(&item.id).is_some_and(|e| e.text_hash == hash) {
            return Ok(());
        }
        let vector = self
            .cache
            .embed_many(embedder.as_ref(), &model, std::slice::from_ref(&item.text))
            .await?
            .pop()
            .ok_or_else(|| MemoryError::EmbeddingFailed("no vector returned".into()))?;
        self.store
            .put_embedding(&item.id, &model, &StoredEmbedding { text_hash: hash, vector })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBank")
            .field("has_embedder", &self.embedder.is_some())
            .finish()
    }
}

fn lexical(query: &str, items: Vec<MemoryItem>) -> Vec<ScoredMemory> {
    items
        .into_iter()
        .filter_map(|item| {
            let score = lexical_score(query, &item.text);
            (score > 0.0).then_some(ScoredMemory { item, score })
        })
        .collect()
}

fn rank_order(a: &ScoredMemory, b: &ScoredMemory) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.item.updated_at.cmp(&a.item.updated_at))
        .then_with(|| a.item.id.cmp(&b.item.id))
}
