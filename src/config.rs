use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default URL for the MITRE ATT&CK enterprise STIX bundle.
pub const DEFAULT_STIX_URL: &str =
    "https://raw.githubusercontent.com/mitre/cti/master/enterprise-attack/enterprise-attack.json";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_stix_url")]
    pub stix_url: String,
    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            stix_url: default_stix_url(),
            timeout_secs: default_catalog_timeout_secs(),
        }
    }
}

fn default_stix_url() -> String {
    DEFAULT_STIX_URL.to_string()
}
fn default_catalog_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// Minimum document length in characters. Shorter input is rejected as
    /// the quality gate for empty or garbage extraction.
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_chars: default_min_chars(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_overlap_tokens() -> usize {
    50
}
fn default_min_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates scoring below this similarity are discarded.
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,
    /// Stricter floor applied to sub-techniques (dotted ids).
    #[serde(default = "default_subtechnique_floor")]
    pub subtechnique_floor: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_floor: default_similarity_floor(),
            subtechnique_floor: default_subtechnique_floor(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_similarity_floor() -> f32 {
    0.3
}
fn default_subtechnique_floor() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Token budget for the retrieved-techniques context handed to the LLM.
    #[serde(default = "default_context_budget")]
    pub token_budget: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_context_budget(),
        }
    }
}

fn default_context_budget() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Minimum merged confidence for a technique to appear in the final
    /// output. Applied after aggregation, never per chunk.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Evidence verification strictness: `"normalized"` (whitespace-folded
    /// substring match) or `"exact"`.
    #[serde(default = "default_evidence_match")]
    pub evidence_match: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            evidence_match: default_evidence_match(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.5
}
fn default_evidence_match() -> String {
    "normalized".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of the OpenAI-compatible embeddings endpoint. Override to
    /// point at a local server.
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            base_url: default_openai_base_url(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"openai"`, `"anthropic"`, or `"disabled"`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for the OpenAI-compatible chat endpoint. Override to point
    /// at a local server (Ollama and friends speak this protocol).
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            base_url: default_openai_base_url(),
            max_output_tokens: default_max_output_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Maximum chunks processed concurrently. Sized to respect external
    /// API rate limits.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_output_formats")]
    pub formats: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            formats: default_output_formats(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_output_formats() -> Vec<String> {
    vec!["json".to_string(), "markdown".to_string()]
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Validate context
    if config.context.token_budget == 0 {
        anyhow::bail!("context.token_budget must be > 0");
    }

    // Validate extraction
    if !(0.0..=1.0).contains(&config.extraction.min_confidence) {
        anyhow::bail!("extraction.min_confidence must be in [0.0, 1.0]");
    }
    match config.extraction.evidence_match.as_str() {
        "normalized" | "exact" => {}
        other => anyhow::bail!(
            "Unknown extraction.evidence_match: '{}'. Must be normalized or exact.",
            other
        ),
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate llm
    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }
    match config.llm.provider.as_str() {
        "disabled" | "openai" | "anthropic" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or anthropic.",
            other
        ),
    }

    // Validate pipeline
    if config.pipeline.concurrency == 0 {
        anyhow::bail!("pipeline.concurrency must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"./data/r2a.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.retrieval.top_k, 10);
        assert!((config.retrieval.similarity_floor - 0.3).abs() < 1e-6);
        assert!((config.extraction.min_confidence - 0.5).abs() < 1e-9);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.llm.provider, "disabled");
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.output.formats, vec!["json", "markdown"]);
    }

    #[test]
    fn overrides_are_respected() {
        let config = parse(
            r#"
[db]
path = "./x.sqlite"

[chunking]
max_tokens = 800
overlap_tokens = 100

[retrieval]
top_k = 5
similarity_floor = 0.4

[extraction]
min_confidence = 0.7
evidence_match = "exact"
"#,
        )
        .unwrap();
        assert_eq!(config.chunking.max_tokens, 800);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.extraction.evidence_match, "exact");
        assert!((config.extraction.min_confidence - 0.7).abs() < 1e-9);
    }
}
