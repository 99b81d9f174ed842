//! The ATT&CK technique catalog.
//!
//! The catalog is the authoritative set of known techniques: loaded once,
//! shared read-only across all concurrent chunk workers, and consulted for
//! every validation and tactic resolution. Tests inject a small synthetic
//! catalog through [`TechniqueCatalog::new`]; production code loads it from
//! the SQLite techniques table populated by `r2a catalog sync`.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::Technique;

/// In-memory index of all known techniques, keyed by technique id.
#[derive(Debug)]
pub struct TechniqueCatalog {
    by_id: BTreeMap<String, Technique>,
    version: String,
}

impl TechniqueCatalog {
    /// Build a catalog from a technique list and a framework version tag.
    pub fn new(techniques: Vec<Technique>, version: &str) -> Self {
        let by_id = techniques
            .into_iter()
            .map(|t| (t.technique_id.clone(), t))
            .collect();
        Self {
            by_id,
            version: version.to_string(),
        }
    }

    pub fn get(&self, technique_id: &str) -> Option<&Technique> {
        self.by_id.get(technique_id)
    }

    pub fn contains(&self, technique_id: &str) -> bool {
        self.by_id.contains_key(technique_id)
    }

    /// Tactic names for a technique, or empty for an unknown id.
    pub fn resolve_tactics(&self, technique_id: &str) -> Vec<String> {
        self.by_id
            .get(technique_id)
            .map(|t| t.tactics.clone())
            .unwrap_or_default()
    }

    /// Techniques in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Technique> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Load the catalog from the techniques table.
///
/// Fails when the table is empty — run `r2a catalog sync` first.
pub async fn load_catalog(pool: &SqlitePool) -> Result<TechniqueCatalog> {
    let version: Option<String> =
        sqlx::query_scalar("SELECT value FROM catalog_meta WHERE key = 'attack_version'")
            .fetch_optional(pool)
            .await?;
    let version = version.unwrap_or_else(|| "unknown".to_string());

    let rows = sqlx::query(
        "SELECT technique_id, name, tactics, description FROM techniques ORDER BY technique_id",
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        bail!("Technique catalog is empty. Run `r2a catalog sync` first.");
    }

    let techniques: Vec<Technique> = rows
        .iter()
        .map(|row| {
            let tactics_csv: String = row.get("tactics");
            Technique {
                technique_id: row.get("technique_id"),
                name: row.get("name"),
                tactics: split_tactics(&tactics_csv),
                description: row.get("description"),
                version: version.clone(),
            }
        })
        .collect();

    Ok(TechniqueCatalog::new(techniques, &version))
}

/// Join tactics for storage as a CSV column.
pub fn join_tactics(tactics: &[String]) -> String {
    tactics.join(",")
}

/// Split a stored CSV tactics column.
pub fn split_tactics(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

// ============ STIX parsing ============

/// Extract techniques and the framework version from an ATT&CK STIX bundle.
///
/// Walks `objects[]` for `attack-pattern` entries, takes the id from the
/// `mitre-attack` external reference and the tactics from the kill-chain
/// phases, and drops deprecated or revoked entries.
pub fn parse_stix_bundle(bundle: &serde_json::Value) -> Result<(Vec<Technique>, String)> {
    let objects = bundle
        .get("objects")
        .and_then(|o| o.as_array())
        .context("Invalid STIX bundle: missing objects array")?;

    let mut version = "unknown".to_string();
    for obj in objects {
        if obj.get("type").and_then(|t| t.as_str()) == Some("x-mitre-collection") {
            if let Some(v) = obj.get("x_mitre_version").and_then(|v| v.as_str()) {
                version = v.to_string();
            }
            break;
        }
    }

    let mut techniques = Vec::new();
    for obj in objects {
        if obj.get("type").and_then(|t| t.as_str()) != Some("attack-pattern") {
            continue;
        }
        if obj
            .get("x_mitre_deprecated")
            .and_then(|d| d.as_bool())
            .unwrap_or(false)
            || obj.get("revoked").and_then(|r| r.as_bool()).unwrap_or(false)
        {
            continue;
        }

        let technique_id = obj
            .get("external_references")
            .and_then(|refs| refs.as_array())
            .and_then(|refs| {
                refs.iter().find(|r| {
                    r.get("source_name").and_then(|s| s.as_str()) == Some("mitre-attack")
                })
            })
            .and_then(|r| r.get("external_id"))
            .and_then(|id| id.as_str());
        let technique_id = match technique_id {
            Some(id) => id.to_string(),
            None => continue,
        };

        let tactics: Vec<String> = obj
            .get("kill_chain_phases")
            .and_then(|p| p.as_array())
            .map(|phases| {
                phases
                    .iter()
                    .filter(|p| {
                        p.get("kill_chain_name").and_then(|n| n.as_str()) == Some("mitre-attack")
                    })
                    .filter_map(|p| p.get("phase_name").and_then(|n| n.as_str()))
                    .map(|n| n.to_string())
                    .collect()
            })
            .unwrap_or_default();

        techniques.push(Technique {
            technique_id,
            name: obj
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            tactics,
            description: obj
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string(),
            version: version.clone(),
        });
    }

    Ok((techniques, version))
}

// ============ CLI commands ============

/// Download the ATT&CK STIX bundle and (re)populate the techniques table.
pub async fn run_catalog_sync(config: &Config, force: bool) -> Result<()> {
    let pool = db::connect(config).await?;

    if !force {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM techniques")
            .fetch_one(&pool)
            .await?;
        if count > 0 {
            let version: Option<String> =
                sqlx::query_scalar("SELECT value FROM catalog_meta WHERE key = 'attack_version'")
                    .fetch_optional(&pool)
                    .await?;
            println!(
                "catalog already loaded ({} techniques, version {}). Use --force to refresh.",
                count,
                version.as_deref().unwrap_or("unknown")
            );
            pool.close().await;
            return Ok(());
        }
    }

    println!("Downloading ATT&CK data from {}...", config.catalog.stix_url);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.catalog.timeout_secs))
        .build()?;
    let response = client
        .get(&config.catalog.stix_url)
        .send()
        .await
        .with_context(|| format!("Failed to download {}", config.catalog.stix_url))?;
    if !response.status().is_success() {
        bail!("ATT&CK download failed: HTTP {}", response.status());
    }
    let bundle: serde_json::Value = response.json().await?;

    let (techniques, version) = parse_stix_bundle(&bundle)?;
    if techniques.is_empty() {
        bail!("STIX bundle contained no usable techniques");
    }

    upsert_techniques(&pool, &techniques, &version).await?;

    println!("catalog sync");
    println!("  techniques loaded: {}", techniques.len());
    println!("  framework version: {}", version);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Print catalog status: technique count, version, embedded vector count.
pub async fn run_catalog_info(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let technique_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM techniques")
        .fetch_one(&pool)
        .await?;
    let vector_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM technique_vectors")
        .fetch_one(&pool)
        .await?;
    let version: Option<String> =
        sqlx::query_scalar("SELECT value FROM catalog_meta WHERE key = 'attack_version'")
            .fetch_optional(&pool)
            .await?;
    let updated_at: Option<String> =
        sqlx::query_scalar("SELECT value FROM catalog_meta WHERE key = 'updated_at'")
            .fetch_optional(&pool)
            .await?;

    println!("catalog");
    println!("  techniques: {}", technique_count);
    println!("  embedded vectors: {}", vector_count);
    println!(
        "  framework version: {}",
        version.as_deref().unwrap_or("unknown")
    );
    if let Some(ts) = updated_at {
        println!("  last sync: {}", ts);
    }

    pool.close().await;
    Ok(())
}

async fn upsert_techniques(
    pool: &SqlitePool,
    techniques: &[Technique],
    version: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    // A refresh replaces the full table; stale vectors are detected by hash.
    sqlx::query("DELETE FROM techniques").execute(&mut *tx).await?;

    for technique in techniques {
        let hash = technique_text_hash(technique);
        sqlx::query(
            r#"
            INSERT INTO techniques (technique_id, name, tactics, description, version, hash)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(technique_id) DO UPDATE SET
                name = excluded.name,
                tactics = excluded.tactics,
                description = excluded.description,
                version = excluded.version,
                hash = excluded.hash
            "#,
        )
        .bind(&technique.technique_id)
        .bind(&technique.name)
        .bind(join_tactics(&technique.tactics))
        .bind(&technique.description)
        .bind(version)
        .bind(&hash)
        .execute(&mut *tx)
        .await?;
    }

    let now = chrono::Utc::now().to_rfc3339();
    for (key, value) in [("attack_version", version), ("updated_at", now.as_str())] {
        sqlx::query(
            r#"
            INSERT INTO catalog_meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Staleness hash over the text that gets embedded for a technique.
pub fn technique_text_hash(technique: &Technique) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(technique.name.as_bytes());
    hasher.update(b". ");
    hasher.update(technique.description.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The text embedded for a technique: name and description together.
pub fn technique_embedding_text(technique: &Technique) -> String {
    format!("{}. {}", technique.name, technique.description)
}
