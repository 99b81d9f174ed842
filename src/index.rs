//! Similarity-search capability over the embedded technique catalog.
//!
//! The core treats the vector index as a capability exposing "k nearest
//! neighbors by similarity metric" with an optional tactic restriction; it
//! does not implement vector indexing itself. [`SqliteIndex`] serves
//! production use from the `technique_vectors` table; [`MemoryIndex`] backs
//! tests with synthetic catalogs.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::catalog::split_tactics;
use crate::embedding::{blob_to_vec, cosine_similarity};

/// One ranked hit from the index.
#[derive(Debug, Clone)]
pub struct ScoredTechnique {
    pub technique_id: String,
    /// Cosine similarity against the query vector.
    pub score: f32,
}

/// k-nearest-neighbor search over the embedded catalog.
#[async_trait]
pub trait TechniqueIndex: Send + Sync {
    /// Return up to `k` techniques ranked by descending similarity to
    /// `vector`, ties broken by ascending technique id. When `tactic_filter`
    /// is given, only techniques whose tactic set intersects it qualify.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        tactic_filter: Option<&BTreeSet<String>>,
    ) -> Result<Vec<ScoredTechnique>>;
}

/// Rank raw `(id, tactics, vector)` entries against a query vector.
///
/// Shared by both index implementations so ordering and filtering behave
/// identically regardless of backing store.
fn rank_entries(
    entries: impl Iterator<Item = (String, Vec<String>, Vec<f32>)>,
    vector: &[f32],
    k: usize,
    tactic_filter: Option<&BTreeSet<String>>,
) -> Vec<ScoredTechnique> {
    let mut scored: Vec<ScoredTechnique> = entries
        .filter(|(_, tactics, _)| match tactic_filter {
            Some(filter) => tactics.iter().any(|t| filter.contains(t)),
            None => true,
        })
        .map(|(technique_id, _, embedding)| ScoredTechnique {
            score: cosine_similarity(vector, &embedding),
            technique_id,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.technique_id.cmp(&b.technique_id))
    });
    scored.truncate(k);
    scored
}

// ============ SQLite-backed index ============

/// Index over the `technique_vectors` table populated by `index build`.
///
/// Vectors are stored as little-endian f32 BLOBs; similarity is computed in
/// Rust over the full catalog, which stays cheap at catalog scale (hundreds
/// of techniques).
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TechniqueIndex for SqliteIndex {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        tactic_filter: Option<&BTreeSet<String>>,
    ) -> Result<Vec<ScoredTechnique>> {
        let rows = sqlx::query(
            r#"
            SELECT tv.technique_id, tv.embedding, t.tactics
            FROM technique_vectors tv
            JOIN techniques t ON t.technique_id = tv.technique_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let entries = rows.iter().map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let tactics_csv: String = row.get("tactics");
            (
                row.get::<String, _>("technique_id"),
                split_tactics(&tactics_csv),
                blob_to_vec(&blob),
            )
        });

        Ok(rank_entries(entries, vector, k, tactic_filter))
    }
}

// ============ In-memory index ============

/// In-memory index for tests and synthetic catalogs.
#[derive(Default)]
pub struct MemoryIndex {
    entries: Vec<(String, Vec<String>, Vec<f32>)>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a technique with its tactics and embedding vector.
    pub fn insert(&mut self, technique_id: &str, tactics: &[&str], vector: Vec<f32>) {
        self.entries.push((
            technique_id.to_string(),
            tactics.iter().map(|t| t.to_string()).collect(),
            vector,
        ));
    }
}

#[async_trait]
impl TechniqueIndex for MemoryIndex {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        tactic_filter: Option<&BTreeSet<String>>,
    ) -> Result<Vec<ScoredTechnique>> {
        Ok(rank_entries(
            self.entries.iter().cloned(),
            vector,
            k,
            tactic_filter,
        ))
    }
}
