//! End-to-end tests for the document mapping pipeline.
//!
//! These tests prove that the chunker, retriever, context builder,
//! extractor, and aggregator work together through `map_document`, using a
//! synthetic catalog, an in-memory index, and scripted capability
//! implementations — no network, no database.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use attack_mapper::catalog::TechniqueCatalog;
use attack_mapper::chunk::chunk_text;
use attack_mapper::config::{ExtractionConfig, RetrievalConfig};
use attack_mapper::embedding::EmbeddingClient;
use attack_mapper::error::MapError;
use attack_mapper::index::MemoryIndex;
use attack_mapper::llm::ChatModel;
use attack_mapper::mapper::MappingExtractor;
use attack_mapper::models::{Chunk, Technique};
use attack_mapper::pipeline::{map_document, DocumentMapping, PipelineOptions};
use attack_mapper::retrieve::Retriever;

// ─── Test document ──────────────────────────────────────────────────

const SENTENCE_PHISHING: &str = "The attackers sent phishing emails with malicious attachments \
to several victims at the target organization.";
const SENTENCE_SPEARPHISHING: &str = "Later a second spearphishing wave delivered further \
phishing emails containing macro laden documents again.";
const SENTENCE_SCHEDULED: &str = "They established persistence using scheduled tasks that \
executed the payload every hour on schedule.";
const SENTENCE_GLITCH: &str = "GLITCH marker sentence with enough words to form its own chunk \
here today.";

/// Three sentences of ~15 tokens each; a 20-token limit puts each in its
/// own chunk.
const CHUNK_MAX_TOKENS: usize = 20;

fn document() -> String {
    format!(
        "{} {} {}",
        SENTENCE_PHISHING, SENTENCE_SPEARPHISHING, SENTENCE_SCHEDULED
    )
}

fn chunks_of(text: &str) -> Vec<Chunk> {
    chunk_text("test-doc", text, CHUNK_MAX_TOKENS, 0, 10).unwrap()
}

// ─── Synthetic catalog and index ────────────────────────────────────

fn technique(id: &str, name: &str, tactics: &[&str]) -> Technique {
    Technique {
        technique_id: id.to_string(),
        name: name.to_string(),
        tactics: tactics.iter().map(|t| t.to_string()).collect(),
        description: format!("{} description.", name),
        version: "18.1".to_string(),
    }
}

fn catalog() -> Arc<TechniqueCatalog> {
    Arc::new(TechniqueCatalog::new(
        vec![
            technique("T1566", "Phishing", &["initial-access"]),
            technique("T1566.001", "Spearphishing Attachment", &["initial-access"]),
            technique("T1053", "Scheduled Task/Job", &["execution", "persistence"]),
            technique(
                "T1071",
                "Application Layer Protocol",
                &["command-and-control"],
            ),
        ],
        "18.1",
    ))
}

fn index() -> MemoryIndex {
    let mut index = MemoryIndex::new();
    index.insert("T1566", &["initial-access"], vec![1.0, 0.0, 0.0, 0.0]);
    index.insert("T1566.001", &["initial-access"], vec![0.98, 0.0, 0.0, 0.0]);
    index.insert(
        "T1053",
        &["execution", "persistence"],
        vec![0.0, 1.0, 0.0, 0.0],
    );
    index.insert(
        "T1071",
        &["command-and-control"],
        vec![0.0, 0.0, 1.0, 0.0],
    );
    index
}

/// Keyword-triggered embedder: deterministic vectors from text content.
struct KeywordEmbedder;

#[async_trait]
impl EmbeddingClient for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                vec![
                    if lower.contains("phishing") { 1.0 } else { 0.0 },
                    if lower.contains("scheduled") { 1.0 } else { 0.0 },
                    if lower.contains("protocol") { 1.0 } else { 0.0 },
                    0.1,
                ]
            })
            .collect())
    }
}

// ─── Scripted structured-generation capability ──────────────────────

/// Returns canned JSON keyed on markers in the chunk text; errors out on
/// the GLITCH marker to simulate a capability failure.
struct ScriptedModel;

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> String {
        "scripted-test".to_string()
    }

    async fn complete(&self, _system: &str, user: &str) -> Result<String> {
        if user.contains("GLITCH") {
            anyhow::bail!("simulated provider outage");
        }
        if user.contains("several victims") {
            return Ok(r#"{"techniques": [
                {"technique_id": "T1566", "confidence": 0.6,
                 "evidence": ["phishing emails with malicious attachments"]}
            ]}"#
            .to_string());
        }
        if user.contains("spearphishing wave") {
            return Ok(r#"{"techniques": [
                {"technique_id": "T1566", "confidence": 0.9,
                 "evidence": ["spearphishing wave delivered further phishing emails"]},
                {"technique_id": "T9999", "confidence": 0.9,
                 "evidence": ["spearphishing wave"]}
            ]}"#
            .to_string());
        }
        if user.contains("every hour on schedule") {
            return Ok(r#"{"techniques": [
                {"technique_id": "T1053", "confidence": 0.45,
                 "evidence": ["established persistence using scheduled tasks"]},
                {"technique_id": "T1071", "confidence": 0.4,
                 "evidence": ["beaconed over encrypted channels"]}
            ]}"#
            .to_string());
        }
        Ok(r#"{"techniques": []}"#.to_string())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

fn retriever() -> Retriever {
    Retriever::new(
        Arc::new(KeywordEmbedder),
        Arc::new(index()),
        &RetrievalConfig {
            top_k: 5,
            similarity_floor: 0.3,
            subtechnique_floor: 0.5,
        },
    )
}

fn extractor(catalog: &Arc<TechniqueCatalog>) -> Arc<MappingExtractor> {
    Arc::new(MappingExtractor::new(
        Arc::new(ScriptedModel),
        Arc::clone(catalog),
        &ExtractionConfig::default(),
    ))
}

fn options(min_confidence: f64) -> PipelineOptions {
    PipelineOptions {
        concurrency: 4,
        min_confidence,
        context_token_budget: 500,
        tactic_filter: None,
    }
}

async fn run(text: &str, min_confidence: f64) -> Result<DocumentMapping, MapError> {
    let catalog = catalog();
    map_document(
        chunks_of(text),
        &retriever(),
        &extractor(&catalog),
        &catalog,
        &options(min_confidence),
        None,
    )
    .await
}

// ─── Tests ──────────────────────────────────────────────────────────

#[test]
fn document_splits_into_expected_chunks() {
    let chunks = chunks_of(&document());
    assert_eq!(chunks.len(), 3);
    assert!(chunks[0].text.contains("several victims"));
    assert!(chunks[1].text.contains("spearphishing wave"));
    assert!(chunks[2].text.contains("every hour on schedule"));
}

#[tokio::test]
async fn full_pipeline_merges_and_validates() {
    let result = run(&document(), 0.0).await.unwrap();

    // Sorted by technique id; T9999 never appears.
    let ids: Vec<&str> = result
        .mappings
        .iter()
        .map(|m| m.technique_id.as_str())
        .collect();
    assert_eq!(ids, vec!["T1053", "T1071", "T1566"]);

    // T1566 was proposed by chunks 0 (0.6) and 1 (0.9): merged confidence is
    // the max, evidence is the union in chunk order.
    let t1566 = &result.mappings[2];
    assert!((t1566.confidence - 0.9).abs() < 1e-9);
    assert_eq!(t1566.evidence.len(), 2);
    assert_eq!(
        t1566.evidence[0].quote,
        "phishing emails with malicious attachments"
    );
    assert_eq!(t1566.chunk_indices, BTreeSet::from([0, 1]));
    assert_eq!(t1566.tactics, vec!["initial-access"]);

    // T1071's evidence is not locatable in chunk 2: downgraded, flagged.
    let t1071 = &result.mappings[1];
    assert!((t1071.confidence - 0.3).abs() < 1e-9);
    assert!(!t1071.evidence[0].verified);

    // Tactics come from the catalog, never from model output.
    let t1053 = &result.mappings[0];
    assert_eq!(t1053.tactics, vec!["execution", "persistence"]);

    // Every id in the final set exists in the catalog.
    let catalog = catalog();
    assert!(result.mappings.iter().all(|m| catalog.contains(&m.technique_id)));

    // The fabricated id and the downgrade were both recorded as warnings.
    let warnings: Vec<&str> = result.report.warnings().collect();
    assert!(warnings.iter().any(|w| w.contains("T9999")));
    assert!(warnings.iter().any(|w| w.contains("confidence capped")));

    assert_eq!(result.report.chunks_total, 3);
    assert_eq!(result.report.chunks_mapped, 3);
    assert_eq!(result.report.chunks_skipped, 0);
}

#[tokio::test]
async fn confidence_filter_applies_after_merge() {
    let result = run(&document(), 0.5).await.unwrap();

    // T1566 survives at its merged 0.9 even though chunk 0 alone scored 0.6;
    // T1053 (0.45) and the downgraded T1071 (0.3) are filtered out.
    let ids: Vec<&str> = result
        .mappings
        .iter()
        .map(|m| m.technique_id.as_str())
        .collect();
    assert_eq!(ids, vec!["T1566"]);
    assert_eq!(result.mappings[0].evidence.len(), 2);
}

#[tokio::test]
async fn partial_failure_still_produces_results() {
    let text = format!("{} {}", SENTENCE_PHISHING, SENTENCE_GLITCH);
    let result = run(&text, 0.0).await.unwrap();

    assert_eq!(result.report.chunks_total, 2);
    assert_eq!(result.report.chunks_mapped, 1);
    assert_eq!(result.report.chunks_skipped, 1);
    assert_eq!(result.mappings.len(), 1);
    assert_eq!(result.mappings[0].technique_id, "T1566");

    let skipped = &result.report.outcomes[1];
    assert!(skipped.skipped);
    assert!(skipped.warnings.iter().any(|w| w.contains("outage")));
}

#[tokio::test]
async fn all_chunks_failing_is_an_aggregation_failure() {
    let err = run(SENTENCE_GLITCH, 0.0).await.unwrap_err();
    assert!(matches!(err, MapError::Aggregation(_)));
}

#[tokio::test]
async fn chunks_succeeding_with_zero_mappings_is_plain_success() {
    // No marker sentences: the scripted model returns empty technique lists.
    let text = "Nothing interesting happens in this report narrative at all today. \
                It only describes routine maintenance windows and patch cycles generally.";
    let result = run(text, 0.0).await.unwrap();
    assert!(result.mappings.is_empty());
    assert_eq!(result.report.chunks_skipped, 0);
}

#[tokio::test]
async fn empty_document_is_invalid_input() {
    let err = chunk_text("test-doc", "", CHUNK_MAX_TOKENS, 0, 10).unwrap_err();
    assert!(matches!(err, MapError::InvalidInput(_)));
}

#[tokio::test]
async fn output_is_deterministic_across_runs() {
    let first = run(&document(), 0.0).await.unwrap();
    let second = run(&document(), 0.0).await.unwrap();

    let a = serde_json::to_string(&first.mappings).unwrap();
    let b = serde_json::to_string(&second.mappings).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn serial_and_concurrent_runs_agree() {
    let catalog = catalog();
    let serial = map_document(
        chunks_of(&document()),
        &retriever(),
        &extractor(&catalog),
        &catalog,
        &PipelineOptions {
            concurrency: 1,
            ..options(0.0)
        },
        None,
    )
    .await
    .unwrap();

    let concurrent = run(&document(), 0.0).await.unwrap();
    assert_eq!(
        serde_json::to_string(&serial.mappings).unwrap(),
        serde_json::to_string(&concurrent.mappings).unwrap()
    );
}
