use std::path::Path;

use serde::Deserialize;

use crate::error::{AthenaError, Result};

/// Daemon configuration file: links to open, routes to seed, store size.
/// Command-line flags extend whatever the file provides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub content_store_mb: usize,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RouteConfig {
    pub prefix: String,
    pub link: String,
}

impl ForwarderConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|error| AthenaError::Invalid(format!("bad config: {}", error)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}
