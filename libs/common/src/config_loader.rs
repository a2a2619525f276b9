//! Layered configuration loading
//!
//! Sources are merged in order, later ones winning:
//! 1. configuration files (JSON or YAML, chosen by extension; missing files are skipped)
//! 2. environment variables of the form `Section__key`, case preserved,
//!    restricted to the sections the caller names

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Json, Yaml},
    Figment,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Separator used between section and key in environment variable names
pub const ENV_SEPARATOR: &str = "__";

/// Builder for a file + environment configuration stack
#[derive(Debug, Clone, Default)]
pub struct LayeredConfig {
    files: Vec<PathBuf>,
    env_sections: Vec<String>,
}

impl LayeredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration file. `.yaml`/`.yml` are read as YAML, anything else as JSON.
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.files.push(path.as_ref().to_path_buf());
        self
    }

    /// Accept environment overrides for a top-level section, e.g. `ConnectionStrings`
    /// picks up `ConnectionStrings__modbusHost`.
    pub fn env_section(mut self, section: &str) -> Self {
        self.env_sections.push(section.to_string());
        self
    }

    /// Build the underlying figment without extracting
    pub fn figment(&self) -> Figment {
        let mut figment = Figment::new();

        for file in &self.files {
            if !file.exists() {
                debug!("Config file {} not found, skipping", file.display());
                continue;
            }
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(file)),
                _ => figment.merge(Json::file(file)),
            };
        }

        if !self.env_sections.is_empty() {
            let prefixes: Vec<String> = self
                .env_sections
                .iter()
                .map(|section| format!("{}{}", section, ENV_SEPARATOR))
                .collect();
            figment = figment.merge(
                Env::raw()
                    .filter(move |key| {
                        prefixes
                            .iter()
                            .any(|prefix| key.as_str().starts_with(prefix.as_str()))
                    })
                    .lowercase(false)
                    .split(ENV_SEPARATOR),
            );
        }

        figment
    }

    /// Extract the merged configuration into `T`
    pub fn load<T: DeserializeOwned>(&self) -> Result<T, figment::Error> {
        let config = self.figment().extract()?;
        info!(
            "Configuration loaded from {} file(s) + environment",
            self.files.iter().filter(|f| f.exists()).count()
        );
        Ok(config)
    }
}
