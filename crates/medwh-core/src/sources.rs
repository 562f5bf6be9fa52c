use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

const DEFAULT_LOOKBACK_DAYS: u32 = 7;

fn default_lookback_days() -> u32 {
    DEFAULT_LOOKBACK_DAYS
}

fn default_active() -> bool {
    true
}

/// A channel whose messages are ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Channel username. Also used as a directory name, so it must be path-safe.
    pub id: String,
    pub name: String,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<SourceConfig>,
}

impl SourcesFile {
    /// Active sources in file order.
    #[must_use]
    pub fn active(&self) -> Vec<SourceConfig> {
        self.sources.iter().filter(|s| s.active).cloned().collect()
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

/// Load and validate the sources configuration from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
pub fn load_sources(path: &Path) -> Result<SourcesFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::SourcesFileIo {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_sources(&content)
}

/// Parse and validate sources YAML already in memory.
///
/// # Errors
///
/// Returns `ConfigError` if the YAML is malformed or fails validation.
pub fn parse_sources(content: &str) -> Result<SourcesFile, ConfigError> {
    let sources_file: SourcesFile =
        serde_yaml::from_str(content).map_err(ConfigError::SourcesFileParse)?;
    validate_sources(&sources_file)?;
    Ok(sources_file)
}

/// A source id is path-safe when it is non-empty lowercase ASCII
/// alphanumerics, `_` or `-`, and does not start with `-`.
fn is_path_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn validate_sources(sources_file: &SourcesFile) -> Result<(), ConfigError> {
    let mut seen_ids = HashSet::new();

    for source in &sources_file.sources {
        if !is_path_safe_id(&source.id) {
            return Err(ConfigError::Validation(format!(
                "source id '{}' must be lowercase ascii letters, digits, '_' or '-'",
                source.id
            )));
        }

        if source.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "source '{}' has an empty name",
                source.id
            )));
        }

        if source.lookback_days == 0 {
            return Err(ConfigError::Validation(format!(
                "source '{}' has lookback_days 0; must be at least 1",
                source.id
            )));
        }

        if !seen_ids.insert(source.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate source id: '{}'",
                source.id
            )));
        }
    }

    Ok(())
}
