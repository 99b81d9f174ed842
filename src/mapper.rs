//! LLM-backed technique extraction for one chunk.
//!
//! The extractor owns the protocol around the structured-generation call:
//! prompt assembly, response parsing, and validation against the technique
//! catalog. It does not reason about technique semantics itself.
//!
//! Validation policy:
//! - a technique id absent from the catalog is dropped (fabricated id),
//! - a confidence outside `[0.0, 1.0]` drops the mapping (never clamped),
//! - a mapping without evidence is dropped,
//! - evidence that cannot be located in the chunk text (after whitespace
//!   normalization, configurable to exact matching) keeps the mapping but
//!   downgrades it: confidence capped at 0.3 and a warning recorded.
//!
//! A response that fails to parse triggers exactly one retry; a second
//! failure makes the chunk a skip with a recorded warning, never a document
//! failure.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::catalog::TechniqueCatalog;
use crate::config::ExtractionConfig;
use crate::llm::ChatModel;
use crate::models::{Chunk, Evidence, Mapping};

/// Confidence ceiling applied to mappings whose evidence could not be
/// located in the source chunk.
const UNVERIFIED_CONFIDENCE_CAP: f64 = 0.3;

const SYSTEM_PROMPT: &str = r#"You are an expert in cyber threat intelligence and the MITRE ATT&CK framework.
Your task is to analyze threat intelligence text and identify which ATT&CK techniques are described.

You will be provided with:
1. A chunk of text from a threat intelligence report
2. A list of potentially relevant ATT&CK techniques retrieved through semantic search

Your job is to:
- Identify which techniques from the retrieved list are actually described in the text
- Assign a confidence score (0.0 to 1.0) based on how explicitly the technique is mentioned
- Provide evidence by quoting the relevant parts of the text verbatim
- Only include techniques that are clearly present in the text

CRITICAL: Only map techniques that describe ATTACKER/THREAT ACTOR behaviors and capabilities.
DO NOT map techniques for:
- Vendor/defender defensive actions (e.g., "Cisco blocked these IPs", "security team detected")
- Indicators of Compromise (IOCs) being reported (IPs, hashes, domains mentioned as evidence)
- Security product features or configurations
- Mitigation recommendations or patches

Confidence scoring guidelines:
- 0.8-1.0: Technique explicitly mentioned by name or with detailed behavioral description
- 0.5-0.8: Technique strongly implied with specific behavioral indicators
- 0.3-0.5: Technique possibly relevant but only tangentially related
- Below 0.3: Do not include

Respond with a single JSON object and nothing else, using this schema:
{"techniques": [{"technique_id": "T1234", "confidence": 0.0, "evidence": ["verbatim quote from the text"]}]}
Evidence quotes must be copied exactly from the text. Return {"techniques": []} when nothing qualifies."#;

const EXAMPLE_MAPPINGS: &str = r#"Example 1 (CORRECT - Attacker behavior):
Text: "The attackers sent phishing emails with malicious Excel documents attached."
Mapping: T1566.001, confidence 0.9, evidence ["phishing emails with malicious Excel documents attached"]

Example 2 (CORRECT - Attacker behavior):
Text: "Once inside, they established persistence using scheduled tasks."
Mapping: T1053.005, confidence 0.85, evidence ["established persistence using scheduled tasks"]

Example 3 (CORRECT - Attacker behavior):
Text: "The malware communicated with command and control servers."
Mapping: T1071, confidence 0.5, evidence ["communicated with command and control servers"]

Example 4 (INCORRECT - Vendor defensive action, DO NOT MAP):
Text: "Cisco has blocked the following IPs: 192.168.1.1, 10.0.0.1"
Mapping: NONE - This describes vendor blocking IOCs, not attacker reconnaissance

Example 5 (INCORRECT - IOC reporting, DO NOT MAP):
Text: "The following file hashes were observed: abc123, def456"
Mapping: NONE - This lists IOCs for reference, not attacker file collection techniques"#;

/// Structured response schema expected from the model.
#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    techniques: Vec<ExtractedTechnique>,
}

#[derive(Debug, Deserialize)]
struct ExtractedTechnique {
    technique_id: String,
    confidence: f64,
    evidence: Vec<String>,
}

/// Result of extracting one chunk: validated mappings plus the validation
/// warnings that accompanied them.
#[derive(Debug, Default)]
pub struct ChunkExtraction {
    pub mappings: Vec<Mapping>,
    pub warnings: Vec<String>,
}

/// Extracts technique mappings from chunks via a [`ChatModel`].
///
/// Shared read-only across concurrent chunk workers.
pub struct MappingExtractor {
    model: Arc<dyn ChatModel>,
    catalog: Arc<TechniqueCatalog>,
    config: ExtractionConfig,
}

impl MappingExtractor {
    pub fn new(
        model: Arc<dyn ChatModel>,
        catalog: Arc<TechniqueCatalog>,
        config: &ExtractionConfig,
    ) -> Self {
        Self {
            model,
            catalog,
            config: config.clone(),
        }
    }

    /// Name of the underlying model, for output metadata.
    pub fn model_name(&self) -> String {
        self.model.name()
    }

    /// Extract zero or more mappings from `chunk` given the built `context`.
    ///
    /// `Err` means the chunk is a definitive skip (capability failure, or
    /// malformed output twice in a row); the caller records it as a warning.
    pub async fn extract(&self, chunk: &Chunk, context: &str) -> Result<ChunkExtraction> {
        let user_prompt = format!(
            "{}\n\n---\n\n{}\n\n---\n\nText to analyze:\n{}",
            EXAMPLE_MAPPINGS, context, chunk.text
        );

        let mut warnings = Vec::new();

        // One retry on malformed output, per policy. Capability failures
        // are already retried with backoff inside the model client.
        let raw = self.model.complete(SYSTEM_PROMPT, &user_prompt).await?;
        let response = match parse_response(&raw) {
            Ok(parsed) => parsed,
            Err(first_err) => {
                warnings.push(format!(
                    "chunk {}: malformed structured output, retrying: {}",
                    chunk.chunk_index, first_err
                ));
                let raw = self.model.complete(SYSTEM_PROMPT, &user_prompt).await?;
                parse_response(&raw)
                    .map_err(|e| anyhow!("malformed structured output after retry: {}", e))?
            }
        };

        let mut extraction = ChunkExtraction {
            mappings: Vec::new(),
            warnings,
        };

        for item in response.techniques {
            if let Some(mapping) = self.validate_item(chunk, item, &mut extraction.warnings) {
                extraction.mappings.push(mapping);
            }
        }

        Ok(extraction)
    }

    /// Validate one extracted item against the catalog and the chunk text.
    /// Returns `None` (with a warning recorded) when the item is rejected.
    fn validate_item(
        &self,
        chunk: &Chunk,
        item: ExtractedTechnique,
        warnings: &mut Vec<String>,
    ) -> Option<Mapping> {
        if !self.catalog.contains(&item.technique_id) {
            warnings.push(format!(
                "chunk {}: unknown technique id '{}' dropped",
                chunk.chunk_index, item.technique_id
            ));
            return None;
        }

        if !(0.0..=1.0).contains(&item.confidence) || !item.confidence.is_finite() {
            warnings.push(format!(
                "chunk {}: {} has out-of-range confidence {}; dropped",
                chunk.chunk_index, item.technique_id, item.confidence
            ));
            return None;
        }

        let quotes: Vec<String> = item
            .evidence
            .into_iter()
            .filter(|q| !q.trim().is_empty())
            .collect();
        if quotes.is_empty() {
            warnings.push(format!(
                "chunk {}: {} has no evidence; dropped",
                chunk.chunk_index, item.technique_id
            ));
            return None;
        }

        let evidence: Vec<Evidence> = quotes
            .into_iter()
            .map(|quote| {
                let verified = self.locate_evidence(&chunk.text, &quote);
                Evidence {
                    quote,
                    chunk_index: chunk.chunk_index,
                    verified,
                }
            })
            .collect();

        let mut confidence = item.confidence;
        if !evidence.iter().any(|e| e.verified) {
            // Unverifiable evidence is kept but never trusted at face value.
            confidence = confidence.min(UNVERIFIED_CONFIDENCE_CAP);
            warnings.push(format!(
                "chunk {}: {} evidence not found in chunk text, confidence capped at {}",
                chunk.chunk_index, item.technique_id, UNVERIFIED_CONFIDENCE_CAP
            ));
        }

        let mut chunk_indices = BTreeSet::new();
        chunk_indices.insert(chunk.chunk_index);

        Some(Mapping {
            technique_id: item.technique_id,
            confidence,
            evidence,
            chunk_indices,
            // Resolved from the catalog at aggregation time.
            tactics: Vec::new(),
        })
    }

    /// Check whether `quote` occurs in `text` under the configured match
    /// strictness.
    fn locate_evidence(&self, text: &str, quote: &str) -> bool {
        match self.config.evidence_match.as_str() {
            "exact" => text.contains(quote),
            _ => normalize_ws(text).contains(&normalize_ws(quote)),
        }
    }
}

/// Fold all whitespace runs to single spaces for tolerant substring checks.
pub(crate) fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse the model's raw text into the expected schema.
///
/// Models wrap JSON in prose or code fences often enough that we parse the
/// outermost brace-delimited object rather than the whole response.
fn parse_response(raw: &str) -> Result<ExtractionResponse> {
    let start = raw
        .find('{')
        .ok_or_else(|| anyhow!("no JSON object in response"))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| anyhow!("no JSON object in response"))?;
    if end < start {
        return Err(anyhow!("no JSON object in response"));
    }
    let parsed: ExtractionResponse = serde_json::from_str(&raw[start..=end])?;
    Ok(parsed)
}
