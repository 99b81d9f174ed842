//! The document mapping pipeline.
//!
//! [`map_document`] is the entry point exposed to the CLI and library
//! callers: it runs retrieval, context building, and extraction for every
//! chunk of a document, then aggregates the per-chunk mappings into the
//! final result set together with a per-chunk processing report.
//!
//! Chunks are mutually independent, so they run concurrently on a bounded
//! worker pool sized by `pipeline.concurrency` (external API rate limits set
//! the practical cap). The aggregator is a strict barrier: it starts only
//! after every chunk has completed or definitively failed. Output ordering
//! is deterministic and independent of completion order.
//!
//! Cancellation is by dropping the returned future: chunk tasks live in a
//! `JoinSet` owned by it, so in-flight capability calls are aborted and no
//! partial aggregate is ever produced.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::aggregate;
use crate::catalog::TechniqueCatalog;
use crate::context::build_context;
use crate::error::MapError;
use crate::mapper::MappingExtractor;
use crate::models::{Chunk, Mapping};
use crate::progress::{MapProgressEvent, MapProgressReporter, NoProgress};
use crate::retrieve::Retriever;

/// Options for one document mapping run.
#[derive(Clone)]
pub struct PipelineOptions {
    /// Maximum chunks in flight at once.
    pub concurrency: usize,
    /// Minimum merged confidence for the final output (applied post-merge).
    pub min_confidence: f64,
    /// Token budget for each chunk's retrieved-techniques context.
    pub context_token_budget: usize,
    /// Optional tactic restriction passed through to retrieval.
    pub tactic_filter: Option<BTreeSet<String>>,
}

/// What happened to one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    /// Number of validated mappings the chunk produced.
    pub mapped: usize,
    /// True when extraction definitively failed and the chunk contributed
    /// nothing.
    pub skipped: bool,
    pub warnings: Vec<String>,
}

/// Per-chunk accounting for a document run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub chunks_total: usize,
    pub chunks_mapped: usize,
    pub chunks_skipped: usize,
    /// Outcomes in chunk-index order.
    pub outcomes: Vec<ChunkOutcome>,
}

impl ProcessingReport {
    /// All warnings across chunks, in chunk-index order.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .flat_map(|o| o.warnings.iter().map(|w| w.as_str()))
    }
}

/// Final result of mapping one document.
#[derive(Debug, Clone)]
pub struct DocumentMapping {
    /// Aggregated mappings, sorted by ascending technique id.
    pub mappings: Vec<Mapping>,
    pub report: ProcessingReport,
}

struct ChunkResult {
    chunk_index: usize,
    mappings: Vec<Mapping>,
    warnings: Vec<String>,
    skipped: bool,
}

/// Map a chunked document to its final technique mapping set.
///
/// Partial success is the default expectation: chunks that fail extraction
/// are skipped with warnings while the rest still produce a result. The run
/// fails with [`MapError::Aggregation`] only when every chunk definitively
/// failed — distinguishable from a successful run that found zero
/// techniques.
pub async fn map_document(
    chunks: Vec<Chunk>,
    retriever: &Retriever,
    extractor: &Arc<MappingExtractor>,
    catalog: &Arc<TechniqueCatalog>,
    options: &PipelineOptions,
    progress: Option<Arc<dyn MapProgressReporter>>,
) -> Result<DocumentMapping, MapError> {
    if chunks.is_empty() {
        return Err(MapError::InvalidInput(
            "document produced no chunks".to_string(),
        ));
    }

    let total = chunks.len();
    let progress = progress.unwrap_or_else(|| Arc::new(NoProgress));
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks: JoinSet<ChunkResult> = JoinSet::new();

    for chunk in chunks {
        let semaphore = Arc::clone(&semaphore);
        let retriever = retriever.clone();
        let extractor = Arc::clone(extractor);
        let catalog = Arc::clone(catalog);
        let progress = Arc::clone(&progress);
        let tactic_filter = options.tactic_filter.clone();
        let token_budget = options.context_token_budget;

        tasks.spawn(async move {
            let chunk_index = chunk.chunk_index;
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return ChunkResult {
                        chunk_index,
                        mappings: Vec::new(),
                        warnings: vec![format!("chunk {}: worker pool closed", chunk_index)],
                        skipped: true,
                    }
                }
            };
            progress.report(MapProgressEvent::ChunkStarted {
                chunk: chunk_index,
                total,
            });

            let result =
                process_chunk(&chunk, &retriever, &extractor, &catalog, tactic_filter, token_budget)
                    .await;
            drop(permit);

            match &result {
                r if r.skipped => progress.report(MapProgressEvent::ChunkSkipped {
                    chunk: chunk_index,
                    total,
                }),
                r => progress.report(MapProgressEvent::ChunkMapped {
                    chunk: chunk_index,
                    total,
                    found: r.mappings.len(),
                }),
            }
            result
        });
    }

    // Barrier: aggregation must not start until every chunk-level attempt
    // has completed or definitively failed.
    let mut results: BTreeMap<usize, ChunkResult> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(result) = joined {
            results.insert(result.chunk_index, result);
        }
        // A panicked worker surfaces below as a missing chunk index.
    }

    let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(total);
    let mut per_chunk: Vec<(usize, Vec<Mapping>)> = Vec::with_capacity(total);
    for chunk_index in 0..total {
        match results.remove(&chunk_index) {
            Some(result) => {
                outcomes.push(ChunkOutcome {
                    chunk_index,
                    mapped: result.mappings.len(),
                    skipped: result.skipped,
                    warnings: result.warnings,
                });
                per_chunk.push((chunk_index, result.mappings));
            }
            None => outcomes.push(ChunkOutcome {
                chunk_index,
                mapped: 0,
                skipped: true,
                warnings: vec![format!("chunk {}: worker terminated abnormally", chunk_index)],
            }),
        }
    }

    let chunks_skipped = outcomes.iter().filter(|o| o.skipped).count();
    if chunks_skipped == total {
        return Err(MapError::Aggregation(format!(
            "no chunk produced a valid mapping: all {} chunks failed extraction",
            total
        )));
    }

    let mappings = aggregate(&per_chunk, catalog, options.min_confidence);

    Ok(DocumentMapping {
        mappings,
        report: ProcessingReport {
            chunks_total: total,
            chunks_mapped: total - chunks_skipped,
            chunks_skipped,
            outcomes,
        },
    })
}

async fn process_chunk(
    chunk: &Chunk,
    retriever: &Retriever,
    extractor: &MappingExtractor,
    catalog: &TechniqueCatalog,
    tactic_filter: Option<BTreeSet<String>>,
    token_budget: usize,
) -> ChunkResult {
    let chunk_index = chunk.chunk_index;

    let candidates = match retriever
        .retrieve(&chunk.text, chunk_index, tactic_filter.as_ref())
        .await
    {
        Ok(candidates) => candidates,
        Err(e) => {
            return ChunkResult {
                chunk_index,
                mappings: Vec::new(),
                warnings: vec![format!("chunk {}: {}", chunk_index, e)],
                skipped: true,
            }
        }
    };

    let context = build_context(&candidates, catalog, token_budget);

    match extractor.extract(chunk, &context).await {
        Ok(extraction) => ChunkResult {
            chunk_index,
            mappings: extraction.mappings,
            warnings: extraction.warnings,
            skipped: false,
        },
        Err(e) => ChunkResult {
            chunk_index,
            mappings: Vec::new(),
            warnings: vec![format!("chunk {}: {}", chunk_index, e)],
            skipped: true,
        },
    }
}
