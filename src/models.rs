//! Core data models used throughout the mapping pipeline.
//!
//! These types represent the techniques, chunks, retrieval candidates, and
//! mappings that flow from document text to the final aggregated result.

use std::collections::BTreeSet;

use serde::Serialize;

/// A MITRE ATT&CK technique as loaded into the catalog.
///
/// Immutable once loaded; owned by the [`crate::catalog::TechniqueCatalog`]
/// for the process lifetime.
#[derive(Debug, Clone)]
pub struct Technique {
    /// Stable identifier, e.g. `T1566` or `T1566.001` for a sub-technique.
    pub technique_id: String,
    pub name: String,
    /// Tactic names in catalog order. A technique may belong to several.
    pub tactics: Vec<String>,
    pub description: String,
    /// Framework version tag (e.g. `"18.1"`).
    pub version: String,
}

impl Technique {
    /// Sub-techniques carry a dotted id (`T1234.001`).
    pub fn is_subtechnique(&self) -> bool {
        self.technique_id.contains('.')
    }
}

/// A bounded span of a source document, produced by the chunker.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Source document reference (path, URL, or synthetic label).
    pub source: String,
    /// Zero-based position in document order.
    pub chunk_index: usize,
    pub text: String,
    /// Token count of `text` under the crate's tokenization rule.
    pub token_count: usize,
    /// Byte offset into `text` where content not shared with the previous
    /// chunk begins. Zero when the chunk has no leading overlap.
    pub overlap_prefix_len: usize,
    /// The leading portion of this chunk repeats the previous chunk's tail.
    pub has_leading_overlap: bool,
    /// The trailing portion of this chunk is repeated by the next chunk.
    pub has_trailing_overlap: bool,
}

/// A technique candidate returned by the retriever for one chunk.
#[derive(Debug, Clone)]
pub struct RetrievedCandidate {
    pub technique_id: String,
    /// Similarity score. With the cosine metric this lies in `[-1, 1]`;
    /// no tighter bound is assumed.
    pub score: f32,
    pub chunk_index: usize,
}

/// A verbatim quote cited as support for a mapping.
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub quote: String,
    /// Chunk the quote was attributed to.
    pub chunk_index: usize,
    /// Whether the quote was located in the chunk text. Unverified quotes
    /// survive only on warning-flagged, downgraded mappings.
    pub verified: bool,
}

/// A technique mapping extracted from one or more chunks.
///
/// Produced per chunk by the extractor; merged across chunks by the
/// aggregator (confidence and evidence only). Tactics are resolved from the
/// catalog at aggregation time, never taken from model output.
#[derive(Debug, Clone, Serialize)]
pub struct Mapping {
    pub technique_id: String,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Evidence quotes in chunk-index order, no duplicate strings.
    pub evidence: Vec<Evidence>,
    /// Chunks that contributed evidence.
    pub chunk_indices: BTreeSet<usize>,
    /// Tactic names resolved from the catalog entry.
    pub tactics: Vec<String>,
}

/// Display band for a confidence value. Not a stored field; derived for
/// statistics and report rendering only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            ConfidenceBand::High
        } else if confidence >= 0.5 {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }
}

impl std::fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceBand::High => write!(f, "high"),
            ConfidenceBand::Medium => write!(f, "medium"),
            ConfidenceBand::Low => write!(f, "low"),
        }
    }
}
