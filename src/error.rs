//! Pipeline error kinds.
//!
//! Failures are classified by how the pipeline reacts to them: bad input is
//! reported to the caller immediately, capability failures are retried and
//! then demoted to per-chunk warnings, validation failures never abort a
//! document, and an aggregation failure signals that no chunk produced
//! anything usable.

/// Error returned by the mapping pipeline and its building blocks.
#[derive(Debug)]
pub enum MapError {
    /// Document text is empty or below the minimum usable length.
    /// Not retryable; reported to the caller immediately.
    InvalidInput(String),
    /// An external capability call (embedding, similarity search, structured
    /// generation) failed or timed out after its own retries were exhausted.
    Capability {
        capability: &'static str,
        message: String,
    },
    /// Structured output failed validation (unknown technique id,
    /// out-of-range confidence, malformed response schema).
    Validation(String),
    /// No chunk in the document produced a valid mapping. Distinguishable
    /// from a successful run that found zero techniques.
    Aggregation(String),
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            MapError::Capability {
                capability,
                message,
            } => write!(f, "{} capability failed: {}", capability, message),
            MapError::Validation(msg) => write!(f, "validation failed: {}", msg),
            MapError::Aggregation(msg) => write!(f, "aggregation failed: {}", msg),
        }
    }
}

impl std::error::Error for MapError {}
