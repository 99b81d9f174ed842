//! Mapping progress reporting.
//!
//! Reports observable progress while `r2a map` works through a document so
//! users see chunks being retrieved, mapped, and skipped. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a document mapping run.
#[derive(Clone, Debug)]
pub enum MapProgressEvent {
    /// A chunk entered the retrieval/extraction stage.
    ChunkStarted { chunk: usize, total: usize },
    /// A chunk finished with `found` validated mappings.
    ChunkMapped {
        chunk: usize,
        total: usize,
        found: usize,
    },
    /// A chunk was skipped after its extraction definitively failed.
    ChunkSkipped { chunk: usize, total: usize },
}

/// Reports mapping progress. Implementations write to stderr (human or JSON).
pub trait MapProgressReporter: Send + Sync {
    /// Emit a progress event. Called from concurrent chunk workers.
    fn report(&self, event: MapProgressEvent);
}

/// Human-friendly progress on stderr: "map  chunk 3/8  mapped 2 techniques".
pub struct StderrProgress;

impl MapProgressReporter for StderrProgress {
    fn report(&self, event: MapProgressEvent) {
        let line = match &event {
            MapProgressEvent::ChunkStarted { chunk, total } => {
                format!("map  chunk {}/{}  working...\n", chunk + 1, total)
            }
            MapProgressEvent::ChunkMapped {
                chunk,
                total,
                found,
            } => {
                format!(
                    "map  chunk {}/{}  mapped {} technique{}\n",
                    chunk + 1,
                    total,
                    found,
                    if *found == 1 { "" } else { "s" }
                )
            }
            MapProgressEvent::ChunkSkipped { chunk, total } => {
                format!("map  chunk {}/{}  skipped\n", chunk + 1, total)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl MapProgressReporter for JsonProgress {
    fn report(&self, event: MapProgressEvent) {
        let obj = match &event {
            MapProgressEvent::ChunkStarted { chunk, total } => serde_json::json!({
                "event": "progress",
                "phase": "started",
                "chunk": chunk,
                "total": total
            }),
            MapProgressEvent::ChunkMapped {
                chunk,
                total,
                found,
            } => serde_json::json!({
                "event": "progress",
                "phase": "mapped",
                "chunk": chunk,
                "total": total,
                "found": found
            }),
            MapProgressEvent::ChunkSkipped { chunk, total } => serde_json::json!({
                "event": "progress",
                "phase": "skipped",
                "chunk": chunk,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl MapProgressReporter for NoProgress {
    fn report(&self, _event: MapProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller passes it to the pipeline.
    pub fn reporter(&self) -> std::sync::Arc<dyn MapProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
