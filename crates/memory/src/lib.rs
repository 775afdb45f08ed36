//! # Canopy Memory
//!
//! The long-term memory bank. Memory items are atomic facts scoped to the
//! user or to one folder. The bank embeds them with the active embedding
//! model and answers semantic, tag-filtered and time-windowed searches.
//!
//! Also here:
//! - [`EmbeddingCache`]: append-only memo keyed by (model, normalized text)
//! - [`DocsService`]: the user profile and per-folder docs
//! - [`injection`]: caps on how many memories reach one context
//! - [`MemoryWriter`]: background extraction of facts from finished turns

pub mod bank;
pub mod docs;
pub mod embedding;
pub mod injection;
pub mod vector;
pub mod writer;

pub use bank::{MemoryBank, MemoryQuery, ScoredMemory};
pub use docs::DocsService;
pub use embedding::{EmbeddingCache, text_hash};
pub use injection::{InjectionLimits, MemoryInjection, query_for_folder, select_injection};
pub use writer::{MemoryWriter, TurnRecord, WriterSettings, extract_json};

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use canopy_core::error::ProviderError;
    use canopy_core::provider::Embedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic embedder: one dimension per keyword, 1.0 when the
    /// lowercased text mentions it.
    pub struct KeywordEmbedder {
        pub keywords: Vec<&'static str>,
        pub calls: AtomicUsize,
        pub inputs: AtomicUsize,
        /// Calls from this one on fail.
        pub fail_from_call: usize,
    }

    impl KeywordEmbedder {
        pub fn new(keywords: Vec<&'static str>) -> Self {
            Self {
                keywords,
                calls: AtomicUsize::new(0),
                inputs: AtomicUsize::new(0),
                fail_from_call: usize::MAX,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail_from_call: 0,
                ..Self::new(Vec::new())
            }
        }

        /// Succeeds `calls` times, then fails.
        pub fn failing_after(keywords: Vec<&'static str>, calls: usize) -> Self {
            Self {
                fail_from_call: calls,
                ..Self::new(keywords)
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, _model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.fetch_add(inputs.len(), Ordering::SeqCst);
            if call >= self.fail_from_call {
                return Err(ProviderError::Network("embedding endpoint down".into()));
            }
            Ok(inputs
                .iter()
                .map(|text| {
                    let text = text.to_lowercase();
                    self.keywords
                        .iter()
                        .map(|k| if text.contains(k) { 1.0 } else { 0.0 })
                        .collect()
                })
                .collect())
        }
    }
}
