//! The `r2a map` command: run the full document mapping pipeline.
//!
//! Parse input → clean and validate → chunk → retrieve/extract per chunk →
//! aggregate → write output files. Capability clients, the catalog, and the
//! vector index are wired up here and handed to the core as interfaces.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::catalog::load_catalog;
use crate::chunk::chunk_text;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedding_client;
use crate::index::SqliteIndex;
use crate::input::parse_input;
use crate::llm::create_chat_model;
use crate::mapper::MappingExtractor;
use crate::models::ConfidenceBand;
use crate::output::{parse_formats, write_outputs, OutputFormat, RunMetadata};
use crate::pipeline::{map_document, PipelineOptions};
use crate::preprocess::clean_text;
use crate::progress::ProgressMode;
use crate::retrieve::Retriever;

/// CLI-facing options for one mapping run; `None` falls back to config.
pub struct MapOptions {
    pub output_dir: Option<std::path::PathBuf>,
    pub formats: Vec<String>,
    pub min_confidence: Option<f64>,
    pub top_k: Option<usize>,
    pub tactics: Vec<String>,
    pub progress: ProgressMode,
}

pub async fn run_map(config: &Config, input: &str, options: MapOptions) -> Result<()> {
    let formats: Vec<OutputFormat> = if options.formats.is_empty() {
        parse_formats(&config.output.formats)?
    } else {
        parse_formats(&options.formats)?
    };

    // Step 1: acquire the document
    let document = parse_input(input, config.catalog.timeout_secs)
        .await
        .context("Failed to parse input")?;
    println!(
        "parsed: {}",
        document.title.as_deref().unwrap_or(&document.source)
    );

    // Step 2: clean and chunk
    let cleaned = clean_text(&document.text);
    let chunks = chunk_text(
        &document.source,
        &cleaned,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
        config.chunking.min_chars,
    )?;
    println!("chunks: {}", chunks.len());

    // Step 3: load the catalog and wire up capabilities
    let pool = db::connect(config).await?;
    let catalog = Arc::new(load_catalog(&pool).await?);
    println!(
        "catalog: {} techniques (version {})",
        catalog.len(),
        catalog.version()
    );

    let embedder = create_embedding_client(&config.embedding)?;
    let index = Arc::new(SqliteIndex::new(pool.clone()));
    let model = create_chat_model(&config.llm)?;

    let mut retrieval = config.retrieval.clone();
    if let Some(top_k) = options.top_k {
        retrieval.top_k = top_k;
    }
    let retriever = Retriever::new(embedder, index, &retrieval);
    let extractor = Arc::new(MappingExtractor::new(
        model,
        Arc::clone(&catalog),
        &config.extraction,
    ));

    let tactic_filter: Option<BTreeSet<String>> = if options.tactics.is_empty() {
        None
    } else {
        Some(options.tactics.iter().cloned().collect())
    };
    let min_confidence = options
        .min_confidence
        .unwrap_or(config.extraction.min_confidence);

    let pipeline_options = PipelineOptions {
        concurrency: config.pipeline.concurrency,
        min_confidence,
        context_token_budget: config.context.token_budget,
        tactic_filter,
    };

    // Step 4: map
    let result = map_document(
        chunks,
        &retriever,
        &extractor,
        &catalog,
        &pipeline_options,
        Some(options.progress.reporter()),
    )
    .await?;

    for warning in result.report.warnings() {
        eprintln!("Warning: {}", warning);
    }

    // Step 5: write outputs
    let meta = RunMetadata {
        run_id: uuid::Uuid::new_v4().to_string(),
        source: document.source.clone(),
        title: document.title.clone(),
        generated_at: chrono::Utc::now(),
        attack_version: catalog.version().to_string(),
        llm_model: extractor.model_name(),
        min_confidence,
    };
    let output_dir = options
        .output_dir
        .unwrap_or_else(|| config.output.dir.clone());
    let written = write_outputs(
        &meta,
        &result.mappings,
        &result.report,
        &catalog,
        &formats,
        &output_dir,
    )?;

    // Final summary
    let high = result
        .mappings
        .iter()
        .filter(|m| ConfidenceBand::from_confidence(m.confidence) == ConfidenceBand::High)
        .count();
    let medium = result
        .mappings
        .iter()
        .filter(|m| ConfidenceBand::from_confidence(m.confidence) == ConfidenceBand::Medium)
        .count();

    println!("map {}", document.source);
    println!("  techniques: {}", result.mappings.len());
    println!("  high confidence (>=0.8): {}", high);
    println!("  medium confidence (0.5-0.8): {}", medium);
    println!(
        "  chunks mapped: {} / {} ({} skipped)",
        result.report.chunks_mapped, result.report.chunks_total, result.report.chunks_skipped
    );
    for (format, path) in &written {
        println!("  {}: {}", format.name(), path.display());
    }
    println!("ok");

    pool.close().await;
    Ok(())
}
