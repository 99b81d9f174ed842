//! Bounded context construction for the extraction prompt.
//!
//! Formats retrieved candidates into the structured block the extractor
//! hands to the LLM. Entries are included whole or not at all — a technique
//! description is never cut mid-sentence — and inclusion stops at the first
//! entry that would exceed the token budget.

use std::collections::HashMap;

use crate::catalog::TechniqueCatalog;
use crate::chunk::count_tokens;
use crate::models::RetrievedCandidate;

/// Header line of a non-empty context block.
const CONTEXT_HEADER: &str = "Retrieved ATT&CK techniques:\n";

/// Placeholder when retrieval produced nothing usable.
const EMPTY_CONTEXT: &str = "No candidate techniques were retrieved for this text.";

/// Build a bounded context block from retrieved candidates.
///
/// Candidates sharing a technique id are deduplicated, keeping the
/// highest-similarity occurrence. Entries are ordered by descending
/// similarity (ties by ascending id) and included greedily until the next
/// whole entry would exceed `token_budget`. Deterministic for a given
/// candidate set and budget.
pub fn build_context(
    candidates: &[RetrievedCandidate],
    catalog: &TechniqueCatalog,
    token_budget: usize,
) -> String {
    // Dedup by technique id, keeping the best score.
    let mut best: HashMap<&str, &RetrievedCandidate> = HashMap::new();
    for candidate in candidates {
        match best.get(candidate.technique_id.as_str()) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.technique_id.as_str(), candidate);
            }
        }
    }

    let mut unique: Vec<&RetrievedCandidate> = best.into_values().collect();
    unique.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.technique_id.cmp(&b.technique_id))
    });

    let mut out = String::new();
    let mut used_tokens = count_tokens(CONTEXT_HEADER);

    for candidate in unique {
        let technique = match catalog.get(&candidate.technique_id) {
            Some(t) => t,
            // Retrieval hit an id the catalog no longer carries; skip it
            // rather than describe a technique we cannot validate later.
            None => continue,
        };

        let entry = format!(
            "- {}: {}\n  Tactics: {}\n  Description: {}\n",
            technique.technique_id,
            technique.name,
            technique.tactics.join(", "),
            technique.description.trim(),
        );

        let entry_tokens = count_tokens(&entry);
        if used_tokens + entry_tokens > token_budget {
            break;
        }

        if out.is_empty() {
            out.push_str(CONTEXT_HEADER);
        }
        out.push_str(&entry);
        used_tokens += entry_tokens;
    }

    if out.is_empty() {
        EMPTY_CONTEXT.to_string()
    } else {
        out
    }
}
