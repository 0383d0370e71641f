//! Conversation memory sink
//!
//! After each completed generation the engine hands a [`MemoryRecord`] to a
//! [`MemoryStore`] on a detached thread. Store failures are logged and never
//! affect the generated text.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{DeltavoxError, Result};
use crate::field::FieldSnapshot;

/// One completed exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    /// User prompt, before templating
    pub prompt: String,
    /// Generated text
    pub response: String,
    /// Field scalars at completion
    #[serde(flatten)]
    pub field: FieldSnapshot,
    /// Delta blend strength used
    pub alpha: f32,
}

/// Sink for completed exchanges
pub trait MemoryStore: Send + Sync {
    /// Persist one record
    ///
    /// # Errors
    ///
    /// Implementation specific; the engine only logs failures.
    fn store(&self, record: &MemoryRecord) -> Result<()>;
}

/// Discards every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMemory;

impl MemoryStore for NullMemory {
    fn store(&self, _record: &MemoryRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonlMemory {
    path: PathBuf,
    /// Serializes appends from concurrent store threads
    lock: Mutex<()>,
}

impl JsonlMemory {
    /// Log to `path`, created on first store
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Log file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MemoryStore for JsonlMemory {
    fn store(&self, record: &MemoryRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let io_err = |e: std::io::Error| DeltavoxError::io(&self.path, e);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record).map_err(|e| io_err(e.into()))?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldKernel, FieldSource, NullField};

    fn record(prompt: &str) -> MemoryRecord {
        MemoryRecord {
            prompt: prompt.to_string(),
            response: "an answer.".to_string(),
            field: FieldKernel::new().snapshot(),
            alpha: 0.5,
        }
    }

    #[test]
    fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let memory = JsonlMemory::new(dir.path().join("memory.jsonl"));
        memory.store(&record("first")).unwrap();
        memory.store(&record("second")).unwrap();

        let text = std::fs::read_to_string(memory.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["prompt"], "first");
        assert_eq!(lines[1]["prompt"], "second");
        assert_eq!(lines[0]["velocity"], "WALK");
        assert!((lines[0]["alpha"].as_f64().unwrap() - 0.5).abs() < 1e-6);
        assert!(lines[0].get("destiny").is_some());
    }

    #[test]
    fn test_jsonl_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let memory = JsonlMemory::new(dir.path().join("missing").join("memory.jsonl"));
        assert!(matches!(
            memory.store(&record("x")),
            Err(DeltavoxError::Io { .. })
        ));
    }

    #[test]
    fn test_null_memory_accepts() {
        let r = MemoryRecord {
            field: NullField.snapshot(),
            ..record("x")
        };
        assert!(NullMemory.store(&r).is_ok());
    }
}
