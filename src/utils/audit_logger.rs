use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Append-only operation log with size-based rotation. One line per
/// operation, so silent degradation (swallowed limiter failures included)
/// stays observable after the fact.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: Arc<Config>) -> Self {
        if let Some(parent_dir) = config.audit_log_file.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path: config.audit_log_file.clone(),
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn log_operation(&self, operation: &str, tenant: &str, details: &Value) {
        if let Err(e) = self.try_log_operation(operation, tenant, details).await {
            error!(operation = %operation, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_operation(&self, operation: &str, tenant: &str, details: &Value) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        let details_string = serde_json::to_string(details)?;
        let log_entry = format!(
            "{} | {:<26} | tenant={} | {}\n",
            timestamp, operation, tenant, details_string
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        // Dropping a tokio File does not wait for pending writes.
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;

    fn config_with_log(path: PathBuf, max_size_bytes: u64) -> Arc<Config> {
        Arc::new(Config {
            default_shell: "/bin/sh".to_string(),
            blocked_commands: Vec::<Regex>::new(),
            log_level: "info".to_string(),
            audit_log_file: path,
            audit_log_max_size_bytes: max_size_bytes,
            buffer_max_bytes: 1_048_576,
            cgroup_root: PathBuf::from("/nonexistent-cgroup-root"),
            cgroup_parent: "mcp-tenants".to_string(),
        })
    }

    #[tokio::test]
    async fn test_log_operation_appends_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.log");
        let logger = AuditLogger::new(config_with_log(path.clone(), 10 * 1024 * 1024));

        logger
            .log_operation("create-terminal", "alice", &json!({ "terminal_id": "term-1" }))
            .await;
        logger
            .log_operation("kill-terminal", "alice", &json!({ "terminal_id": "term-1" }))
            .await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("create-terminal"));
        assert!(contents.contains("tenant=alice"));
        assert!(contents.contains("term-1"));
    }

    #[tokio::test]
    async fn test_log_rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.log");
        let logger = AuditLogger::new(config_with_log(path.clone(), 64));

        logger
            .log_operation("execute-command", "alice", &json!({ "command": "echo" }))
            .await;
        // Second write sees a file over the 64-byte limit and rotates first.
        logger
            .log_operation("execute-command", "alice", &json!({ "command": "echo" }))
            .await;

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(entries.len() >= 2, "expected rotated backup alongside the live log");
        let live = std::fs::read_to_string(&path).unwrap();
        assert_eq!(live.lines().count(), 1);
    }
}
