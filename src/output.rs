//! Result serialization.
//!
//! Writes a mapping run to JSON, CSV, Markdown, and ATT&CK Navigator layer
//! files. Technique names and tactics are resolved from the catalog at
//! render time; confidence bands feed the statistics and summaries but are
//! never stored as data.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::group_by_tactic;
use crate::catalog::TechniqueCatalog;
use crate::models::{ConfidenceBand, Evidence, Mapping};
use crate::pipeline::ProcessingReport;

/// Navigator layer format constants.
const NAVIGATOR_VERSION: &str = "5.3.0";
const LAYER_VERSION: &str = "4.5";

/// Maximum characters of evidence carried into CSV cells and Navigator
/// comments.
const CSV_EVIDENCE_LIMIT: usize = 500;
const NAVIGATOR_COMMENT_LIMIT: usize = 200;

/// Metadata describing one mapping run, shared by all formatters.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    /// Unique id for this mapping run.
    pub run_id: String,
    pub source: String,
    pub title: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub attack_version: String,
    pub llm_model: String,
    pub min_confidence: f64,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Csv,
    Markdown,
    Navigator,
}

impl OutputFormat {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "markdown" => Ok(OutputFormat::Markdown),
            "navigator" => Ok(OutputFormat::Navigator),
            other => bail!(
                "Unknown output format: '{}'. Valid formats: csv, json, markdown, navigator.",
                other
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Markdown => "markdown",
            OutputFormat::Navigator => "navigator",
        }
    }

    fn file_suffix(&self) -> &'static str {
        match self {
            OutputFormat::Json => ".json",
            OutputFormat::Csv => ".csv",
            OutputFormat::Markdown => ".md",
            OutputFormat::Navigator => "_navigator.json",
        }
    }
}

/// Parse a comma-or-repeat formats list from the CLI.
pub fn parse_formats(raw: &[String]) -> Result<Vec<OutputFormat>> {
    let mut formats = Vec::new();
    for item in raw {
        for piece in item.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let format = OutputFormat::parse(piece)?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
    }
    Ok(formats)
}

#[derive(Serialize)]
struct TechniqueRow<'a> {
    technique_id: &'a str,
    technique_name: &'a str,
    tactics: &'a [String],
    confidence: f64,
    evidence: &'a [Evidence],
}

#[derive(Serialize)]
struct RunStatistics {
    total_techniques: usize,
    high_confidence: usize,
    medium_confidence: usize,
    low_confidence: usize,
    tactics_covered: usize,
    chunks_total: usize,
    chunks_mapped: usize,
    chunks_skipped: usize,
}

/// Write the run to each requested format in `dir`, returning the paths.
pub fn write_outputs(
    meta: &RunMetadata,
    mappings: &[Mapping],
    report: &ProcessingReport,
    catalog: &TechniqueCatalog,
    formats: &[OutputFormat],
    dir: &Path,
) -> Result<Vec<(OutputFormat, PathBuf)>> {
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(formats.len());
    for format in formats {
        let content = match format {
            OutputFormat::Json => render_json(meta, mappings, report, catalog)?,
            OutputFormat::Csv => render_csv(mappings, catalog),
            OutputFormat::Markdown => render_markdown(meta, mappings, catalog),
            OutputFormat::Navigator => render_navigator(meta, mappings)?,
        };
        let path = dir.join(output_filename(meta, *format));
        std::fs::write(&path, content)?;
        written.push((*format, path));
    }
    Ok(written)
}

fn output_filename(meta: &RunMetadata, format: OutputFormat) -> String {
    let stem = source_stem(&meta.source);
    let timestamp = meta.generated_at.format("%Y%m%d_%H%M%S");
    format!("r2a_{}_{}{}", stem, timestamp, format.file_suffix())
}

/// A filesystem-safe stem derived from the input source; URLs fall back to
/// "report".
fn source_stem(source: &str) -> String {
    if source.starts_with("http://") || source.starts_with("https://") {
        return "report".to_string();
    }
    let stem = Path::new(source)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("report");
    let sanitized: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if sanitized.is_empty() {
        "report".to_string()
    } else {
        sanitized
    }
}

fn statistics(mappings: &[Mapping], report: &ProcessingReport) -> RunStatistics {
    let band = |b: ConfidenceBand| {
        mappings
            .iter()
            .filter(|m| ConfidenceBand::from_confidence(m.confidence) == b)
            .count()
    };
    RunStatistics {
        total_techniques: mappings.len(),
        high_confidence: band(ConfidenceBand::High),
        medium_confidence: band(ConfidenceBand::Medium),
        low_confidence: band(ConfidenceBand::Low),
        tactics_covered: group_by_tactic(mappings).len(),
        chunks_total: report.chunks_total,
        chunks_mapped: report.chunks_mapped,
        chunks_skipped: report.chunks_skipped,
    }
}

fn technique_rows<'a>(
    mappings: &'a [Mapping],
    catalog: &'a TechniqueCatalog,
) -> Vec<TechniqueRow<'a>> {
    mappings
        .iter()
        .map(|m| TechniqueRow {
            technique_id: &m.technique_id,
            technique_name: catalog
                .get(&m.technique_id)
                .map(|t| t.name.as_str())
                .unwrap_or(""),
            tactics: &m.tactics,
            confidence: m.confidence,
            evidence: &m.evidence,
        })
        .collect()
}

// ============ JSON ============

fn render_json(
    meta: &RunMetadata,
    mappings: &[Mapping],
    report: &ProcessingReport,
    catalog: &TechniqueCatalog,
) -> Result<String> {
    #[derive(Serialize)]
    struct JsonOutput<'a> {
        metadata: &'a RunMetadata,
        statistics: RunStatistics,
        techniques: Vec<TechniqueRow<'a>>,
        report: &'a ProcessingReport,
    }

    let output = JsonOutput {
        metadata: meta,
        statistics: statistics(mappings, report),
        techniques: technique_rows(mappings, catalog),
        report,
    };
    Ok(serde_json::to_string_pretty(&output)?)
}

// ============ CSV ============

fn render_csv(mappings: &[Mapping], catalog: &TechniqueCatalog) -> String {
    let mut out = String::from("technique_id,technique_name,tactics,confidence,evidence\n");
    for row in technique_rows(mappings, catalog) {
        let evidence = truncate_chars(
            &row.evidence
                .iter()
                .map(|e| e.quote.as_str())
                .collect::<Vec<_>>()
                .join(" | "),
            CSV_EVIDENCE_LIMIT,
        );
        out.push_str(&format!(
            "{},{},{},{:.2},{}\n",
            csv_escape(row.technique_id),
            csv_escape(row.technique_name),
            csv_escape(&row.tactics.join("; ")),
            row.confidence,
            csv_escape(&evidence),
        ));
    }
    out
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit.saturating_sub(3)).collect();
    format!("{}...", cut)
}

// ============ Markdown ============

fn render_markdown(meta: &RunMetadata, mappings: &[Mapping], catalog: &TechniqueCatalog) -> String {
    let groups = group_by_tactic(mappings);
    let high = mappings
        .iter()
        .filter(|m| ConfidenceBand::from_confidence(m.confidence) == ConfidenceBand::High)
        .count();
    let medium = mappings
        .iter()
        .filter(|m| ConfidenceBand::from_confidence(m.confidence) == ConfidenceBand::Medium)
        .count();

    let mut out = String::new();
    out.push_str("# ATT&CK Mapping Report\n\n");
    out.push_str(&format!("**Source:** {}\n", meta.source));
    out.push_str(&format!(
        "**Title:** {}\n",
        meta.title.as_deref().unwrap_or("N/A")
    ));
    out.push_str(&format!(
        "**Generated:** {} UTC\n",
        meta.generated_at.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("**Model:** {}\n\n", meta.llm_model));

    out.push_str("## Summary\n\n");
    out.push_str(&format!("- **Total Techniques:** {}\n", mappings.len()));
    out.push_str(&format!("- **High Confidence (>=0.8):** {}\n", high));
    out.push_str(&format!("- **Medium Confidence (0.5-0.8):** {}\n", medium));
    out.push_str(&format!("- **Tactics Covered:** {}\n\n", groups.len()));

    out.push_str("## Table of Contents\n\n");
    for tactic in groups.keys() {
        out.push_str(&format!("- [{}](#{})\n", tactic_display(tactic), tactic));
    }
    out.push_str("\n---\n\n");

    for (tactic, group) in &groups {
        out.push_str(&format!("## {}\n\n", tactic_display(tactic)));

        let mut by_confidence: Vec<&&Mapping> = group.iter().collect();
        by_confidence.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.technique_id.cmp(&b.technique_id))
        });

        for mapping in by_confidence {
            let name = catalog
                .get(&mapping.technique_id)
                .map(|t| t.name.as_str())
                .unwrap_or("");
            out.push_str(&format!("### {}: {}\n\n", mapping.technique_id, name));
            out.push_str(&format!(
                "**Confidence:** {} ({:.2})\n\n",
                confidence_bar(mapping.confidence),
                mapping.confidence
            ));
            out.push_str("**Evidence:**\n");
            for evidence in &mapping.evidence {
                let flag = if evidence.verified { "" } else { " _(unverified)_" };
                out.push_str(&format!(
                    "> {} — chunk {}{}\n",
                    evidence.quote, evidence.chunk_index, flag
                ));
            }
            out.push('\n');
        }
        out.push_str("---\n\n");
    }

    out
}

fn tactic_display(tactic: &str) -> String {
    tactic
        .split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn confidence_bar(confidence: f64) -> String {
    let filled = (confidence * 10.0).round().clamp(0.0, 10.0) as usize;
    "█".repeat(filled) + &"░".repeat(10 - filled)
}

// ============ ATT&CK Navigator layer ============

fn render_navigator(meta: &RunMetadata, mappings: &[Mapping]) -> Result<String> {
    let techniques: Vec<serde_json::Value> = mappings
        .iter()
        .map(|m| {
            let comment = format!(
                "Confidence: {:.2}\nEvidence: {}",
                m.confidence,
                truncate_chars(
                    m.evidence
                        .first()
                        .map(|e| e.quote.as_str())
                        .unwrap_or_default(),
                    NAVIGATOR_COMMENT_LIMIT
                )
            );
            serde_json::json!({
                "techniqueID": m.technique_id,
                "tactic": m.tactics.first().cloned().unwrap_or_default(),
                "color": "",
                "comment": comment,
                "enabled": true,
                "metadata": [],
                "links": [],
                "showSubtechniques": true,
                "score": m.confidence,
            })
        })
        .collect();

    let layer = serde_json::json!({
        "name": format!(
            "attack-mapper - {}",
            meta.title.as_deref().unwrap_or("Analysis")
        ),
        "versions": {
            "attack": meta.attack_version,
            "navigator": NAVIGATOR_VERSION,
            "layer": LAYER_VERSION,
        },
        "domain": "enterprise-attack",
        "description": format!("ATT&CK mapping generated from: {}", meta.source),
        "filters": { "platforms": [] },
        "sorting": 0,
        "layout": {
            "layout": "side",
            "aggregateFunction": "average",
            "showID": true,
            "showName": true,
            "showAggregateScores": false,
            "countUnscored": false,
            "expandedSubtechniques": "annotated",
        },
        "hideDisabled": false,
        "techniques": techniques,
        "gradient": {
            "colors": ["#ffffff", "#42a5f5", "#ff4444"],
            "minValue": 0,
            "maxValue": 1,
        },
        "legendItems": [],
        "metadata": [],
        "links": [],
        "showTacticRowBackground": false,
        "tacticRowBackground": "#dddddd",
    });

    Ok(serde_json::to_string_pretty(&layer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Technique;
    use std::collections::BTreeSet;

    fn catalog() -> TechniqueCatalog {
        TechniqueCatalog::new(
            vec![
                Technique {
                    technique_id: "T1566".to_string(),
                    name: "Phishing".to_string(),
                    tactics: vec!["initial-access".to_string()],
                    description: "desc".to_string(),
                    version: "18.1".to_string(),
                },
                Technique {
                    technique_id: "T1053".to_string(),
                    name: "Scheduled Task/Job".to_string(),
                    tactics: vec!["execution".to_string(), "persistence".to_string()],
                    description: "desc".to_string(),
                    version: "18.1".to_string(),
                },
            ],
            "18.1",
        )
    }

    fn mapping(id: &str, confidence: f64, tactics: &[&str]) -> Mapping {
        Mapping {
            technique_id: id.to_string(),
            confidence,
            evidence: vec![Evidence {
                quote: "some, \"quoted\" evidence".to_string(),
                chunk_index: 0,
                verified: true,
            }],
            chunk_indices: BTreeSet::from([0]),
            tactics: tactics.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn meta() -> RunMetadata {
        RunMetadata {
            run_id: "test-run".to_string(),
            source: "report.pdf".to_string(),
            title: Some("Quarterly Threat Report".to_string()),
            generated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            attack_version: "18.1".to_string(),
            llm_model: "openai-test".to_string(),
            min_confidence: 0.5,
        }
    }

    fn report() -> ProcessingReport {
        ProcessingReport {
            chunks_total: 2,
            chunks_mapped: 2,
            chunks_skipped: 0,
            outcomes: Vec::new(),
        }
    }

    #[test]
    fn csv_escapes_delimiters_and_quotes() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn csv_renders_header_and_rows() {
        let mappings = vec![mapping("T1566", 0.9, &["initial-access"])];
        let csv = render_csv(&mappings, &catalog());
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "technique_id,technique_name,tactics,confidence,evidence"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("T1566,Phishing,initial-access,0.90,"));
        assert!(row.contains("\"\"quoted\"\""));
    }

    #[test]
    fn json_output_contains_stats_and_bands() {
        let mappings = vec![
            mapping("T1566", 0.9, &["initial-access"]),
            mapping("T1053", 0.6, &["execution", "persistence"]),
        ];
        let json = render_json(&meta(), &mappings, &report(), &catalog()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["statistics"]["total_techniques"], 2);
        assert_eq!(value["statistics"]["high_confidence"], 1);
        assert_eq!(value["statistics"]["medium_confidence"], 1);
        assert_eq!(value["statistics"]["tactics_covered"], 3);
        assert_eq!(value["techniques"][0]["technique_name"], "Phishing");
        assert_eq!(value["metadata"]["attack_version"], "18.1");
    }

    #[test]
    fn markdown_groups_by_tactic() {
        let mappings = vec![
            mapping("T1053", 0.6, &["execution", "persistence"]),
            mapping("T1566", 0.9, &["initial-access"]),
        ];
        let md = render_markdown(&meta(), &mappings, &catalog());
        assert!(md.contains("# ATT&CK Mapping Report"));
        assert!(md.contains("## Execution"));
        assert!(md.contains("## Initial Access"));
        assert!(md.contains("## Persistence"));
        // T1053 spans two tactics and is rendered in both sections.
        assert_eq!(md.matches("### T1053: Scheduled Task/Job").count(), 2);
        assert!(md.contains("█"));
    }

    #[test]
    fn navigator_layer_shape() {
        let mappings = vec![mapping("T1566", 0.9, &["initial-access"])];
        let layer = render_navigator(&meta(), &mappings).unwrap();
        let value: serde_json::Value = serde_json::from_str(&layer).unwrap();
        assert_eq!(value["domain"], "enterprise-attack");
        assert_eq!(value["versions"]["attack"], "18.1");
        assert_eq!(value["techniques"][0]["techniqueID"], "T1566");
        assert_eq!(value["techniques"][0]["tactic"], "initial-access");
        assert_eq!(value["techniques"][0]["score"], 0.9);
    }

    #[test]
    fn format_parsing_accepts_commas_and_dedups() {
        let formats = parse_formats(&[
            "json,markdown".to_string(),
            "json".to_string(),
            "navigator".to_string(),
        ])
        .unwrap();
        assert_eq!(
            formats,
            vec![
                OutputFormat::Json,
                OutputFormat::Markdown,
                OutputFormat::Navigator
            ]
        );
        assert!(parse_formats(&["yaml".to_string()]).is_err());
    }

    #[test]
    fn filenames_are_stamped_and_sanitized() {
        let name = output_filename(&meta(), OutputFormat::Navigator);
        assert!(name.starts_with("r2a_report_"));
        assert!(name.ends_with("_navigator.json"));
        assert_eq!(source_stem("https://example.com/x.html"), "report");
        assert_eq!(source_stem("dir/My Report!.pdf"), "My-Report-");
    }
}
