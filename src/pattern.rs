//! Pattern assets
//!
//! A pattern is an authored haptic waveform, stored as a `.spn` file holding
//! a JSON description. The asset is immutable once read; the device driver
//! assigns it an ID when loaded.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

/// File extension of pattern description files
pub const PATTERN_EXTENSION: &str = "spn";

/// A pattern description, identified by its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternAsset {
    /// Name of the pattern, also the stem of its `.spn` file
    pub name: String,
    /// JSON describing the pattern
    pub json: String,
}

impl PatternAsset {
    pub fn new(name: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json: json.into(),
        }
    }

    /// Read a pattern file, naming the asset after the file stem unless
    /// `name` is given
    pub async fn load(path: impl AsRef<Path>, name: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read pattern file: {}", path.display()))?;

        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
                .with_context(|| format!("Pattern path has no file name: {}", path.display()))?,
        };

        if path.extension().and_then(|e| e.to_str()) != Some(PATTERN_EXTENSION) {
            tracing::debug!(
                "Pattern '{}' loaded from a file without .{} extension",
                name,
                PATTERN_EXTENSION
            );
        }

        Ok(Self { name, json })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_names_pattern_after_file_stem() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("impact.spn");
        std::fs::write(&path, r#"{"boost": 10}"#)?;

        let pattern = PatternAsset::load(&path, None).await?;
        assert_eq!(pattern.name, "impact");
        assert_eq!(pattern.json, r#"{"boost": 10}"#);

        let renamed = PatternAsset::load(&path, Some("hit")).await?;
        assert_eq!(renamed.name, "hit");
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let result = PatternAsset::load("/nonexistent/heartbeat.spn", None).await;
        assert!(result.is_err());
    }
}
