use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Catalog of known techniques, populated by `catalog sync`
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS techniques (
            technique_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            tactics TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            version TEXT NOT NULL,
            hash TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Embedded catalog vectors, populated by `index build`
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS technique_vectors (
            technique_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (technique_id) REFERENCES techniques(technique_id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Catalog metadata (framework version, last sync time)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_techniques_version ON techniques(version)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_technique_vectors_model ON technique_vectors(model)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
