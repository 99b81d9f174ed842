//! Cross-chunk mapping aggregation.
//!
//! Merges per-chunk mappings into one deduplicated result set. For each
//! technique the surviving confidence is the maximum observed across chunks
//! — a chunk with strong evidence is not diluted by a weaker chunk elsewhere
//! in the document. Evidence quotes are unioned in chunk order, and tactics
//! are resolved fresh from the catalog so hallucinated tactic names never
//! propagate.
//!
//! The caller's minimum-confidence filter runs after merging; filtering
//! first would discard evidence that could have raised a technique's merged
//! confidence. Aggregation is idempotent and independent of chunk completion
//! order.

use std::collections::{BTreeMap, HashSet};

use crate::catalog::TechniqueCatalog;
use crate::models::{Evidence, Mapping};

/// Merge per-chunk mappings into the final deduplicated, confidence-ranked
/// set, sorted by ascending technique id. Presentation grouping by tactic is
/// provided by [`group_by_tactic`].
pub fn aggregate(
    per_chunk: &[(usize, Vec<Mapping>)],
    catalog: &TechniqueCatalog,
    min_confidence: f64,
) -> Vec<Mapping> {
    // Group by technique id across all chunks. BTreeMap gives deterministic
    // id-ordered output regardless of chunk completion order.
    let mut by_id: BTreeMap<&str, Vec<&Mapping>> = BTreeMap::new();
    for (_, mappings) in per_chunk {
        for mapping in mappings {
            by_id.entry(mapping.technique_id.as_str()).or_default().push(mapping);
        }
    }

    let mut merged: Vec<Mapping> = Vec::with_capacity(by_id.len());
    for (technique_id, group) in by_id {
        let confidence = group
            .iter()
            .map(|m| m.confidence)
            .fold(f64::NEG_INFINITY, f64::max);

        // Union of evidence in chunk-index order, without duplicate strings.
        let mut evidence: Vec<Evidence> = group
            .iter()
            .flat_map(|m| m.evidence.iter().cloned())
            .collect();
        evidence.sort_by_key(|e| e.chunk_index);
        let mut seen: HashSet<String> = HashSet::new();
        evidence.retain(|e| seen.insert(e.quote.clone()));

        let chunk_indices = group
            .iter()
            .flat_map(|m| m.chunk_indices.iter().copied())
            .collect();

        merged.push(Mapping {
            technique_id: technique_id.to_string(),
            confidence,
            evidence,
            chunk_indices,
            tactics: catalog.resolve_tactics(technique_id),
        });
    }

    // Minimum-confidence filter runs last, after merging.
    merged.retain(|m| m.confidence >= min_confidence);
    merged
}

/// Group aggregated mappings by tactic for presentation: tactic names
/// ascending, technique ids ascending within each tactic. A technique
/// spanning multiple tactics appears in each of its groups; mappings with no
/// resolved tactic fall under `"uncategorized"`.
pub fn group_by_tactic(mappings: &[Mapping]) -> BTreeMap<String, Vec<&Mapping>> {
    let mut groups: BTreeMap<String, Vec<&Mapping>> = BTreeMap::new();
    for mapping in mappings {
        if mapping.tactics.is_empty() {
            groups
                .entry("uncategorized".to_string())
                .or_default()
                .push(mapping);
        } else {
            for tactic in &mapping.tactics {
                groups.entry(tactic.clone()).or_default().push(mapping);
            }
        }
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.technique_id.cmp(&b.technique_id));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Technique;
    use std::collections::BTreeSet;

    fn catalog() -> TechniqueCatalog {
        let mk = |id: &str, tactics: &[&str]| Technique {
            technique_id: id.to_string(),
            name: format!("Technique {}", id),
            tactics: tactics.iter().map(|t| t.to_string()).collect(),
            description: "desc".to_string(),
            version: "18.1".to_string(),
        };
        TechniqueCatalog::new(
            vec![
                mk("T1053", &["execution", "persistence"]),
                mk("T1566", &["initial-access"]),
                mk("T1071", &["command-and-control"]),
            ],
            "18.1",
        )
    }

    fn mapping(id: &str, confidence: f64, quote: &str, chunk: usize) -> Mapping {
        let mut chunk_indices = BTreeSet::new();
        chunk_indices.insert(chunk);
        Mapping {
            technique_id: id.to_string(),
            confidence,
            evidence: vec![Evidence {
                quote: quote.to_string(),
                chunk_index: chunk,
                verified: true,
            }],
            chunk_indices,
            tactics: Vec::new(),
        }
    }

    #[test]
    fn merge_takes_max_confidence_and_unions_evidence() {
        let per_chunk = vec![
            (0, vec![mapping("T1566", 0.6, "first quote", 0)]),
            (1, vec![mapping("T1566", 0.9, "second quote", 1)]),
        ];
        let merged = aggregate(&per_chunk, &catalog(), 0.0);
        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert!((m.confidence - 0.9).abs() < 1e-9);
        assert_eq!(m.evidence.len(), 2);
        assert_eq!(m.evidence[0].quote, "first quote");
        assert_eq!(m.evidence[1].quote, "second quote");
        assert_eq!(m.chunk_indices, [0, 1].into_iter().collect::<BTreeSet<_>>());
    }

    #[test]
    fn duplicate_quotes_appear_once() {
        let per_chunk = vec![
            (0, vec![mapping("T1071", 0.5, "same quote", 0)]),
            (3, vec![mapping("T1071", 0.5, "same quote", 3)]),
        ];
        let merged = aggregate(&per_chunk, &catalog(), 0.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].evidence.len(), 1);
        assert_eq!(merged[0].evidence[0].chunk_index, 0);
    }

    #[test]
    fn tactics_resolved_from_catalog_not_input() {
        let mut poisoned = mapping("T1566", 0.8, "q", 0);
        poisoned.tactics = vec!["made-up-tactic".to_string()];
        let merged = aggregate(&[(0, vec![poisoned])], &catalog(), 0.0);
        assert_eq!(merged[0].tactics, vec!["initial-access"]);
    }

    #[test]
    fn confidence_filter_runs_after_merge() {
        // T1566 merges to 0.9 and survives a 0.5 filter even though one of
        // its per-chunk confidences is below it; T1071 merges to 0.4 and is
        // dropped.
        let per_chunk = vec![
            (0, vec![mapping("T1566", 0.4, "weak", 0)]),
            (
                1,
                vec![
                    mapping("T1566", 0.9, "strong", 1),
                    mapping("T1071", 0.4, "only weak", 1),
                ],
            ),
        ];
        let merged = aggregate(&per_chunk, &catalog(), 0.5);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].technique_id, "T1566");
        assert_eq!(merged[0].evidence.len(), 2);
    }

    #[test]
    fn output_sorted_by_technique_id() {
        let per_chunk = vec![(
            0,
            vec![
                mapping("T1566", 0.9, "a", 0),
                mapping("T1053", 0.8, "b", 0),
                mapping("T1071", 0.7, "c", 0),
            ],
        )];
        let merged = aggregate(&per_chunk, &catalog(), 0.0);
        let ids: Vec<&str> = merged.iter().map(|m| m.technique_id.as_str()).collect();
        assert_eq!(ids, vec!["T1053", "T1071", "T1566"]);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let per_chunk = vec![
            (0, vec![mapping("T1566", 0.6, "one", 0)]),
            (
                1,
                vec![mapping("T1566", 0.9, "two", 1), mapping("T1053", 0.7, "three", 1)],
            ),
        ];
        let once = aggregate(&per_chunk, &catalog(), 0.5);
        let again = aggregate(&[(0, once.clone())], &catalog(), 0.5);

        assert_eq!(once.len(), again.len());
        for (a, b) in once.iter().zip(again.iter()) {
            assert_eq!(a.technique_id, b.technique_id);
            assert_eq!(a.confidence, b.confidence);
            assert_eq!(a.chunk_indices, b.chunk_indices);
            assert_eq!(
                a.evidence.iter().map(|e| &e.quote).collect::<Vec<_>>(),
                b.evidence.iter().map(|e| &e.quote).collect::<Vec<_>>()
            );
            assert_eq!(a.tactics, b.tactics);
        }
    }

    #[test]
    fn grouping_by_tactic_orders_and_duplicates_membership() {
        let per_chunk = vec![(
            0,
            vec![
                mapping("T1053", 0.9, "a", 0),
                mapping("T1566", 0.8, "b", 0),
            ],
        )];
        let merged = aggregate(&per_chunk, &catalog(), 0.0);
        let groups = group_by_tactic(&merged);

        let tactics: Vec<&str> = groups.keys().map(|k| k.as_str()).collect();
        assert_eq!(tactics, vec!["execution", "initial-access", "persistence"]);
        // T1053 spans two tactics and appears once per group.
        assert_eq!(groups["execution"][0].technique_id, "T1053");
        assert_eq!(groups["persistence"][0].technique_id, "T1053");
        assert_eq!(groups["initial-access"][0].technique_id, "T1566");
    }

    #[test]
    fn empty_input_aggregates_to_empty() {
        let merged = aggregate(&[], &catalog(), 0.5);
        assert!(merged.is_empty());
    }
}
