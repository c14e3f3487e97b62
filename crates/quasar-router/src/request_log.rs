use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;

pub const REQUEST_LOG_FILE: &str = "inference.log";

/// Append-only log of inference requests and their responses.
///
/// Write failures are logged and otherwise ignored: the log never affects the
/// reply a caller gets.
#[derive(Debug, Clone)]
pub struct RequestLog {
    path: PathBuf,
}

impl RequestLog {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(REQUEST_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, request: &Value, response: &Value) {
        let line = format!("request: {request}, response: {response}\n");
        if let Err(e) = self.write_line(&line).await {
            tracing::warn!(path=%self.path.display(), error=%e, "failed to write inference log");
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// `"False"`, `"false"`, `"0"` and the empty string disable a flag; any
/// other value enables it.
pub fn env_flag_enabled(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => !matches!(v.trim(), "" | "0" | "false" | "False"),
    }
}
