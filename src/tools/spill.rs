//! Large-output spill (§4.5).
//!
//! Any tool output exceeding a threshold is written to a per-session temp
//! file and replaced in-band by a short descriptor. If the spill write
//! itself fails, the output is truncated in place instead — a tool call
//! should never hard-fail just because disk is full.

use crate::types::SessionId;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SpillConfig {
    pub threshold_chars: usize,
    pub preview_chars: usize,
}

/// Manages the process-global spill directory.
#[derive(Debug, Clone)]
pub struct SpillManager {
    dir: PathBuf,
    config: SpillConfig,
}

impl SpillManager {
    pub fn new(dir: impl Into<PathBuf>, config: SpillConfig) -> Self {
        Self { dir: dir.into(), config }
    }

    /// If `output` exceeds the spill threshold, write it to a temp file
    /// under `dir/<session_id>/` and return a short descriptor in its
    /// place. Otherwise returns `output` unchanged.
    pub async fn maybe_spill(&self, session_id: &SessionId, tool_name: &str, output: &str) -> String {
        if output.chars().count() <= self.config.threshold_chars {
            return output.to_string();
        }

        let session_dir = self.dir.join(session_id.as_str());
        match self.write_spill_file(&session_dir, tool_name, output).await {
            Ok(path) => self.descriptor(&path, output),
            Err(err) => {
                warn!(error = %err, tool = tool_name, "spill write failed, truncating output in place");
                self.truncate_with_suffix(output)
            }
        }
    }

    async fn write_spill_file(&self, session_dir: &Path, tool_name: &str, output: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(session_dir).await?;
        let file_name = format!("{tool_name}-{}.txt", uuid::Uuid::new_v4());
        let path = session_dir.join(file_name);
        tokio::fs::write(&path, output).await?;
        Ok(path)
    }

    fn descriptor(&self, path: &Path, output: &str) -> String {
        let preview: String = output.chars().take(self.config.preview_chars).collect();
        format!(
            "[output spilled: {} bytes written to {}]\npreview (first {} chars):\n{}\n... use the shell to inspect the full file.",
            output.len(),
            path.display(),
            self.config.preview_chars,
            preview,
        )
    }

    fn truncate_with_suffix(&self, output: &str) -> String {
        let truncated: String = output.chars().take(self.config.preview_chars).collect();
        format!("{truncated}\n... [output truncated: spill to disk failed]")
    }

    /// Remove the spill directory for one session (called at session end).
    pub async fn cleanup_session(&self, session_id: &SessionId) {
        let session_dir = self.dir.join(session_id.as_str());
        if let Err(err) = tokio::fs::remove_dir_all(&session_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "failed to clean up session spill directory");
            }
        }
    }

    /// Remove orphaned spill directories older than `max_age` (called on
    /// startup). Tolerates entries disappearing concurrently.
    pub async fn cleanup_orphans(&self, max_age: Duration) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(error = %err, "failed to scan spill directory for orphans");
                return;
            }
        };

        let cutoff = SystemTime::now().checked_sub(max_age);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            if let Some(cutoff) = cutoff {
                if modified >= cutoff {
                    continue;
                }
            }
            if let Err(err) = tokio::fs::remove_dir_all(entry.path()).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %err, path = %entry.path().display(), "failed to remove orphaned spill directory");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: usize, preview: usize) -> SpillConfig {
        SpillConfig { threshold_chars: threshold, preview_chars: preview }
    }

    #[tokio::test]
    async fn short_output_passes_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SpillManager::new(dir.path(), config(100, 10));
        let session_id = SessionId::new();
        let result = manager.maybe_spill(&session_id, "grep", "short").await;
        assert_eq!(result, "short");
    }

    #[tokio::test]
    async fn long_output_is_spilled_with_preview() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SpillManager::new(dir.path(), config(10, 5));
        let session_id = SessionId::new();
        let long_output = "x".repeat(100);
        let result = manager.maybe_spill(&session_id, "grep", &long_output).await;
        assert!(result.contains("output spilled"));
        assert!(result.contains("xxxxx"));
    }

    #[tokio::test]
    async fn cleanup_session_removes_spill_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SpillManager::new(dir.path(), config(10, 5));
        let session_id = SessionId::new();
        manager.maybe_spill(&session_id, "grep", &"x".repeat(100)).await;

        let session_dir = dir.path().join(session_id.as_str());
        assert!(session_dir.exists());
        manager.cleanup_session(&session_id).await;
        assert!(!session_dir.exists());
    }

    #[tokio::test]
    async fn cleanup_session_on_missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SpillManager::new(dir.path(), config(10, 5));
        manager.cleanup_session(&SessionId::new()).await;
    }

    #[tokio::test]
    async fn cleanup_orphans_on_missing_dir_is_a_no_op() {
        let manager = SpillManager::new("/nonexistent/spill/dir", config(10, 5));
        manager.cleanup_orphans(Duration::from_secs(3600)).await;
    }
}
