//! Store configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::log::CompactionPolicy;

/// Configuration for an [`crate::ExtentStore`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Automatic compaction after appends
    pub compaction: CompactionPolicy,
    /// Accumulate elapsed time per operation, not just counts
    pub measure_timing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compaction: CompactionPolicy::default(),
            measure_timing: false,
        }
    }
}

impl StoreConfig {
    /// Load a configuration from a JSON file. Missing fields keep their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no store can run with
    pub fn validate(&self) -> Result<()> {
        if self.compaction.invalid_percent > 100 {
            return Err(Error::Config(format!(
                "compaction.invalid_percent {} is above 100",
                self.compaction.invalid_percent
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert!(config.compaction.enabled);
        assert_eq!(config.compaction.min_entries, 170);
        assert!(!config.measure_timing);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "measure_timing": true, "compaction": {{ "enabled": false }} }}"#
        )
        .unwrap();

        let config = StoreConfig::from_json_file(file.path()).unwrap();
        assert!(config.measure_timing);
        assert!(!config.compaction.enabled);
        assert_eq!(config.compaction.invalid_percent, 50);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "compaction": {{ "invalid_percent": 150 }} }}"#).unwrap();
        assert!(matches!(
            StoreConfig::from_json_file(file.path()),
            Err(Error::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            StoreConfig::from_json_file(file.path()),
            Err(Error::Config(_))
        ));
    }
}
