//! Artifact contract: handlers persist blobs through an [ArtifactWriter] and
//! record the returned URI in their step state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::json;
use thiserror::Error;

use crate::step::{StepContext, StepError, StepHandler, StepOutput};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("invalid artifact path component: {0}")]
    InvalidPath(String),
    #[error("io: {0}")]
    Io(String),
}

pub trait ArtifactWriter: Send + Sync {
    /// Stores `bytes` for `(run_id, step_id)` and returns the artifact URI.
    fn write(&self, run_id: &str, step_id: &str, bytes: &[u8]) -> Result<String, ArtifactError>;
}

/// Writes `<base_dir>/<run_id>/<step_id>` and returns a `file://` URI.
#[derive(Clone, Debug)]
pub struct FsArtifactWriter {
    base_dir: PathBuf,
}

impl FsArtifactWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

fn check_component(value: &str) -> Result<&str, ArtifactError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(ArtifactError::InvalidPath(value.to_string()));
    }
    Ok(value)
}

impl ArtifactWriter for FsArtifactWriter {
    fn write(&self, run_id: &str, step_id: &str, bytes: &[u8]) -> Result<String, ArtifactError> {
        let dir = self.base_dir.join(check_component(run_id)?);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ArtifactError::Io(format!("create {}: {}", dir.display(), e)))?;
        let path = dir.join(check_component(step_id)?);
        std::fs::write(&path, bytes)
            .map_err(|e| ArtifactError::Io(format!("write {}: {}", path.display(), e)))?;
        let absolute = std::fs::canonicalize(&path).unwrap_or(path);
        Ok(format!("file://{}", absolute.display()))
    }
}

/// Keeps artifacts in memory under `mem://<run_id>/<step_id>`.
#[derive(Debug, Default)]
pub struct InMemoryArtifactWriter {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryArtifactWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.get(uri).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactWriter for InMemoryArtifactWriter {
    fn write(&self, run_id: &str, step_id: &str, bytes: &[u8]) -> Result<String, ArtifactError> {
        let uri = format!(
            "mem://{}/{}",
            check_component(run_id)?,
            check_component(step_id)?
        );
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| ArtifactError::Io("in-memory artifact store lock poisoned".to_string()))?;
        blobs.insert(uri.clone(), bytes.to_vec());
        Ok(uri)
    }
}

/// Built-in `write_artifact` step: writes the step `config` as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteArtifactStepHandler;

impl StepHandler for WriteArtifactStepHandler {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let bytes = serde_json::to_vec_pretty(ctx.config)
            .map_err(|e| StepError::failed("serialize_error", e.to_string()))?;
        let uri = ctx.artifacts.write(ctx.run_id, ctx.step_id, &bytes)?;
        Ok(StepOutput {
            output: json!({"uri": uri, "bytes": bytes.len()}),
            artifact_uris: vec![uri],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_writer_lays_out_run_and_step_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsArtifactWriter::new(dir.path());
        let uri = writer.write("run-1", "report", b"{}").unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("run-1/report"));
        let stored = std::fs::read(dir.path().join("run-1").join("report")).unwrap();
        assert_eq!(stored, b"{}");
    }

    #[test]
    fn fs_writer_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsArtifactWriter::new(dir.path());
        assert!(matches!(
            writer.write("..", "x", b""),
            Err(ArtifactError::InvalidPath(_))
        ));
        assert!(writer.write("run-1", "a/b", b"").is_err());
    }

    #[test]
    fn fs_writer_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let writer = FsArtifactWriter::new(&blocker);
        assert!(matches!(
            writer.write("run-1", "s", b"{}"),
            Err(ArtifactError::Io(_))
        ));
    }

    #[test]
    fn in_memory_writer_keeps_bytes() {
        let writer = InMemoryArtifactWriter::new();
        let uri = writer.write("run-1", "s", b"abc").unwrap();
        assert_eq!(uri, "mem://run-1/s");
        assert_eq!(writer.get(&uri).as_deref(), Some(&b"abc"[..]));
        assert_eq!(writer.len(), 1);
    }
}
