// config lets you read a separate config file, layered with SEPA_* environment variables
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::binding::SubstitutionMode;
use crate::error::Result;

/// Settings of the client itself, as opposed to the broker [`crate::configuration::Configuration`].
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub log_filter: String,
    pub subscribe_timeout_ms: u64,
    pub credentials_path: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    pub substitution: SubstitutionMode,
    pub client_identity: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
            subscribe_timeout_ms: 10_000,
            credentials_path: None,
            accept_invalid_certs: false,
            substitution: SubstitutionMode::Tokenized,
            client_identity: None,
        }
    }
}

impl ClientSettings {
    /// Defaults, then the optional settings file, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("log_filter", defaults.log_filter)?
            .set_default("subscribe_timeout_ms", defaults.subscribe_timeout_ms)?
            .set_default("accept_invalid_certs", defaults.accept_invalid_certs)?
            .set_default("substitution", "tokenized")?;
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("SEPA").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sepa.toml");
        std::fs::write(&file, "subscribe_timeout_ms = 250\nsubstitution = \"legacy\"\nclient_identity = \"lab-1\"\n").unwrap();
        let settings = ClientSettings::load(Some(&file)).unwrap();
        assert_eq!(settings.subscribe_timeout(), Duration::from_millis(250));
        assert_eq!(settings.substitution, SubstitutionMode::Legacy);
        assert_eq!(settings.client_identity.as_deref(), Some("lab-1"));
        assert!(!settings.accept_invalid_certs);
    }

    #[test]
    fn a_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ClientSettings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.log_filter, "info");
        assert_eq!(settings.credentials_path, None);
    }
}
