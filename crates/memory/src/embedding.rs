//! Embedding memo cache.
//!
//! Entries are keyed by (model, normalized text) and never evicted or
//! invalidated during a session. Switching the embedding model changes the
//! key, so old entries simply stop matching.

use crate::vector::normalize_text;
use canopy_core::error::MemoryError;
use canopy_core::provider::Embedder;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

type Key = (String, String);

#[derive(Debug, Default)]
pub struct EmbeddingCache {
    entries: Mutex<HashMap<Key, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        self.entries
            .lock()
            .await
            .get(&(model.to_string(), normalize_text(text)))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Vectors for `texts` in input order. Misses are embedded with a single
    /// batch call; hits never reach the embedder.
    pub async fn embed_many(
        &self,
        embedder: &dyn Embedder,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, MemoryError> {
        let keys: Vec<Key> = texts
            .iter()
            .map(|t| (model.to_string(), normalize_text(t)))
            .collect();

        let misses: Vec<String> = {
            let entries = self.entries.lock().await;
            let mut misses: Vec<String> = Vec::new();
            for (_, text) in &keys {
                if !entries.contains_key(&(model.to_string(), text.clone())) && !misses.contains(text) {
                    misses.push(text.clone());
                }
            }
            misses
        };

        if !misses.is_empty() {
            let vectors = embedder
                .embed(model, &misses)
                .await
                .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;
            if vectors.len() != misses.len() {
                return Err(MemoryError::EmbeddingFailed(format!(
                    "expected {} vectors, got {}",
                    misses.len(),
                    vectors.len()
                )));
            }
            debug!(model, computed = misses.len(), "Embedded texts");
            let mut entries = self.entries.lock().await;
            for (text, vector) in misses.into_iter().zip(vectors) {
                entries.insert((model.to_string(), text), vector);
            }
        }

        let entries = self.entries.lock().await;
        keys.iter()
            .map(|key| {
                entries
                    .get(key)
                    .cloned()
                    .ok_or_else(|| MemoryError::EmbeddingFailed(format!("no vector for '{}'", key.1)))
            })
            .collect()
    }
}

/// Hex SHA-256 of the normalized text. Stored next to persisted vectors so a
/// changed text is detected and re-embedded.
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(normalize_text(text).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KeywordEmbedder;
    use async_trait::async_trait;
    use canopy_core::error::ProviderError;

    #[tokio::test]
    async fn hits_skip_the_embedder() {
        let embedder = KeywordEmbedder::new(vec!["tea", "rust"]);
        let cache = EmbeddingCache::new();

        let first = cache
            .embed_many(&embedder, "m", &["likes tea".into(), "writes Rust".into()])
            .await
            .unwrap();
        assert_eq!(first, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(embedder.calls(), 1);

        // whitespace-normalized text is the same key
        let again = cache
            .embed_many(&embedder, "m", &["  likes   tea ".into()])
            .await
            .unwrap();
        assert_eq!(again, vec![vec![1.0, 0.0]]);
        assert_eq!(embedder.calls(), 1);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn model_is_part_of_the_key() {
        let embedder = KeywordEmbedder::new(vec!["tea"]);
        let cache = EmbeddingCache::new();
        cache.embed_many(&embedder, "a", &["tea".into()]).await.unwrap();
        cache.embed_many(&embedder, "b", &["tea".into()]).await.unwrap();
        assert_eq!(embedder.calls(), 2);
        assert!(cache.get("a", "tea").await.is_some());
        assert!(cache.get("c", "tea").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_misses_are_embedded_once() {
        let embedder = KeywordEmbedder::new(vec!["x"]);
        let cache = EmbeddingCache::new();
        let out = cache
            .embed_many(&embedder, "m", &["x".into(), "x".into()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(embedder.inputs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        async fn embed(&self, _model: &str, _inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(vec![vec![1.0]])
        }
    }

    #[tokio::test]
    async fn count_mismatch_is_an_error() {
        let cache = EmbeddingCache::new();
        let err = cache
            .embed_many(&ShortEmbedder, "m", &["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::EmbeddingFailed(_)));
        assert!(cache.is_empty().await);
    }

    #[test]
    fn hash_ignores_whitespace_layout() {
        assert_eq!(text_hash("a  b"), text_hash(" a b\n"));
        assert_ne!(text_hash("a b"), text_hash("a c"));
        assert_eq!(text_hash("x").len(), 64);
    }
}
