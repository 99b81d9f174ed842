//! Catalog embedding management (`r2a index build` / `r2a index rebuild`).
//!
//! Embeds technique texts into the `technique_vectors` table. Staleness is
//! hash-based: a technique is re-embedded when it has no vector, when its
//! text hash changed after a catalog refresh, or when the configured model
//! changed.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::catalog::{split_tactics, technique_embedding_text};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, vec_to_blob};
use crate::models::Technique;

/// Find and embed techniques that are missing or have stale vectors.
pub async fn run_index_build(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let client = embedding::create_embedding_client(&config.embedding)?;
    let model_name = client.model_name().to_string();
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    let pending = find_pending_techniques(&pool, &model_name, limit).await?;

    if dry_run {
        println!("index build (dry-run)");
        println!("  techniques needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("index build");
        println!("  all technique vectors up to date");
        pool.close().await;
        return Ok(());
    }

    let total = pending.len();
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in pending.chunks(batch_size) {
        let texts: Vec<String> = batch
            .iter()
            .map(|p| technique_embedding_text(&p.technique))
            .collect();

        match client.embed(&texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    let blob = vec_to_blob(vec);
                    upsert_vector(
                        &pool,
                        &item.technique.technique_id,
                        &model_name,
                        client.dims(),
                        &item.hash,
                        &blob,
                    )
                    .await?;
                    embedded += 1;
                }
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                failed += batch.len() as u64;
            }
        }
    }

    println!("index build");
    println!("  total pending: {}", total);
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Delete all vectors and regenerate from the full catalog.
pub async fn run_index_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    sqlx::query("DELETE FROM technique_vectors")
        .execute(&pool)
        .await?;
    pool.close().await;

    println!("index rebuild — cleared existing vectors");
    run_index_build(config, None, batch_size_override, false).await
}

struct PendingTechnique {
    technique: Technique,
    hash: String,
}

async fn find_pending_techniques(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingTechnique>> {
    let limit_val = limit.unwrap_or(usize::MAX) as i64;

    // Techniques with no vector, a stale hash, or a vector from another model
    let rows = sqlx::query(
        r#"
        SELECT t.technique_id, t.name, t.tactics, t.description, t.version, t.hash
        FROM techniques t
        LEFT JOIN technique_vectors tv ON tv.technique_id = t.technique_id
        WHERE tv.technique_id IS NULL OR tv.hash != t.hash OR tv.model != ?
        ORDER BY t.technique_id
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    let results: Vec<PendingTechnique> = rows
        .iter()
        .map(|row| {
            let tactics_csv: String = row.get("tactics");
            PendingTechnique {
                technique: Technique {
                    technique_id: row.get("technique_id"),
                    name: row.get("name"),
                    tactics: split_tactics(&tactics_csv),
                    description: row.get("description"),
                    version: row.get("version"),
                },
                hash: row.get("hash"),
            }
        })
        .collect();

    Ok(results)
}

async fn upsert_vector(
    pool: &SqlitePool,
    technique_id: &str,
    model: &str,
    dims: usize,
    hash: &str,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO technique_vectors (technique_id, model, dims, hash, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(technique_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            hash = excluded.hash,
            embedding = excluded.embedding,
            created_at = excluded.created_at
        "#,
    )
    .bind(technique_id)
    .bind(model)
    .bind(dims as i64)
    .bind(hash)
    .bind(blob)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
