//! Per-chunk technique retrieval.
//!
//! The retriever embeds a chunk's text and queries the similarity-search
//! capability, then applies the similarity floor and optional tactic filter.
//! Sub-techniques (dotted ids) face a stricter floor than parent techniques:
//! their descriptions are close siblings, so weak matches are noise.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingClient};
use crate::error::MapError;
use crate::index::TechniqueIndex;
use crate::models::RetrievedCandidate;

/// Retrieves candidate techniques for one chunk of document text.
///
/// Cheap to clone; shared across concurrent chunk workers.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn TechniqueIndex>,
    top_k: usize,
    similarity_floor: f32,
    subtechnique_floor: f32,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn TechniqueIndex>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            top_k: config.top_k,
            similarity_floor: config.similarity_floor,
            subtechnique_floor: config.subtechnique_floor,
        }
    }

    /// Retrieve ranked candidates for `chunk_text`.
    ///
    /// Returns candidates ordered by descending similarity, ties broken by
    /// ascending technique id. Fewer than `top_k` results after floor
    /// filtering is not an error — the available subset is returned.
    pub async fn retrieve(
        &self,
        chunk_text: &str,
        chunk_index: usize,
        tactic_filter: Option<&BTreeSet<String>>,
    ) -> Result<Vec<RetrievedCandidate>, MapError> {
        let vector = embed_query(self.embedder.as_ref(), chunk_text)
            .await
            .map_err(|e| MapError::Capability {
                capability: "embedding",
                message: e.to_string(),
            })?;

        let hits = self
            .index
            .search(&vector, self.top_k, tactic_filter)
            .await
            .map_err(|e| MapError::Capability {
                capability: "similarity search",
                message: e.to_string(),
            })?;

        let mut candidates: Vec<RetrievedCandidate> = hits
            .into_iter()
            .filter(|hit| {
                let floor = if hit.technique_id.contains('.') {
                    self.subtechnique_floor
                } else {
                    self.similarity_floor
                };
                hit.score >= floor
            })
            .map(|hit| RetrievedCandidate {
                technique_id: hit.technique_id,
                score: hit.score,
                chunk_index,
            })
            .collect();

        // The index already ranks its output; re-sort anyway so ordering is
        // a local guarantee, not an assumption about the capability.
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.technique_id.cmp(&b.technique_id))
        });

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use anyhow::Result;
    use async_trait::async_trait;

    /// Test embedder: maps any text to a fixed query vector.
    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait]
    impl EmbeddingClient for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.vector.len()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.vector.clone()).collect())
        }
    }

    /// Test embedder that always fails.
    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingClient for BrokenEmbedder {
        fn model_name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            0
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("simulated outage")
        }
    }

    fn retriever_with(index: MemoryIndex, vector: Vec<f32>) -> Retriever {
        Retriever::new(
            Arc::new(FixedEmbedder { vector }),
            Arc::new(index),
            &RetrievalConfig {
                top_k: 10,
                similarity_floor: 0.3,
                subtechnique_floor: 0.5,
            },
        )
    }

    #[tokio::test]
    async fn floor_filters_weak_candidates() {
        let mut index = MemoryIndex::new();
        index.insert("T1566", &["initial-access"], vec![1.0, 0.0]);
        index.insert("T1053", &["persistence"], vec![0.2, 0.98]);

        let retriever = retriever_with(index, vec![1.0, 0.0]);
        let candidates = retriever.retrieve("text", 0, None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].technique_id, "T1566");
        assert_eq!(candidates[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn subtechniques_face_stricter_floor() {
        let mut index = MemoryIndex::new();
        // Both score ~0.42 against the query: above the parent floor (0.3),
        // below the sub-technique floor (0.5).
        index.insert("T1071", &[], vec![0.42, 0.9078]);
        index.insert("T1566.001", &[], vec![0.42, 0.9078]);

        let retriever = retriever_with(index, vec![1.0, 0.0]);
        let candidates = retriever.retrieve("text", 0, None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].technique_id, "T1071");
    }

    #[tokio::test]
    async fn fewer_than_top_k_is_not_an_error() {
        let mut index = MemoryIndex::new();
        index.insert("T1566", &[], vec![1.0, 0.0]);

        let retriever = retriever_with(index, vec![1.0, 0.0]);
        let candidates = retriever.retrieve("text", 3, None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].chunk_index, 3);
    }

    #[tokio::test]
    async fn tactic_filter_passes_through() {
        let mut index = MemoryIndex::new();
        index.insert("T1566", &["initial-access"], vec![1.0, 0.0]);
        index.insert("T1543", &["persistence"], vec![0.99, 0.14]);

        let retriever = retriever_with(index, vec![1.0, 0.0]);
        let filter: BTreeSet<String> = ["persistence".to_string()].into_iter().collect();
        let candidates = retriever.retrieve("text", 0, Some(&filter)).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].technique_id, "T1543");
    }

    #[tokio::test]
    async fn embedding_failure_is_a_capability_error() {
        let retriever = Retriever::new(
            Arc::new(BrokenEmbedder),
            Arc::new(MemoryIndex::new()),
            &RetrievalConfig::default(),
        );
        let err = retriever.retrieve("text", 0, None).await.unwrap_err();
        assert!(matches!(
            err,
            MapError::Capability {
                capability: "embedding",
                ..
            }
        ));
    }
}
