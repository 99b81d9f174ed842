//! The `r2a search` command: exercise retrieval standalone.
//!
//! Embeds a free-text query and prints the ranked candidate techniques from
//! the index. Useful for checking catalog coverage and tuning the
//! similarity floor before running a full mapping.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;

use crate::catalog::load_catalog;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedding_client;
use crate::index::SqliteIndex;
use crate::retrieve::Retriever;

pub async fn run_search(
    config: &Config,
    query: &str,
    top_k: Option<usize>,
    tactics: Vec<String>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let catalog = Arc::new(load_catalog(&pool).await?);

    let embedder = create_embedding_client(&config.embedding)?;
    let index = Arc::new(SqliteIndex::new(pool.clone()));

    let mut retrieval = config.retrieval.clone();
    if let Some(k) = top_k {
        retrieval.top_k = k;
    }
    let retriever = Retriever::new(embedder, index, &retrieval);

    let tactic_filter: Option<BTreeSet<String>> = if tactics.is_empty() {
        None
    } else {
        Some(tactics.into_iter().collect())
    };

    let candidates = retriever.retrieve(query, 0, tactic_filter.as_ref()).await?;

    if candidates.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, candidate) in candidates.iter().enumerate() {
        let (name, tactics) = catalog
            .get(&candidate.technique_id)
            .map(|t| (t.name.as_str(), t.tactics.join(", ")))
            .unwrap_or(("(unknown)", String::new()));

        println!(
            "{}. [{:.3}] {} / {}",
            i + 1,
            candidate.score,
            candidate.technique_id,
            name
        );
        if !tactics.is_empty() {
            println!("    tactics: {}", tactics);
        }
    }

    pool.close().await;
    Ok(())
}
