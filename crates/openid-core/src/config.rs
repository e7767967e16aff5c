//! Protocol configuration.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use time::Duration;

use crate::association::{AssociationType, SessionType};
use crate::namespace::DEFAULT_ALIAS_PREFIX;

/// Tunables shared by provider and consumer flows.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Shared association lifetime in seconds.
    pub association_lifetime_secs: u32,
    /// Private (stateless) association lifetime in seconds.
    pub private_association_lifetime_secs: u32,
    /// Maximum accepted nonce age in seconds.
    pub nonce_max_age_secs: u32,
    /// Prefix for generated extension aliases.
    pub extension_alias_prefix: String,
    /// Whether `no-encryption` sessions are served.
    pub allow_no_encryption: bool,
    /// Association type suggested on unsupported requests.
    pub preferred_association_type: AssociationType,
    /// Session type suggested on unsupported requests.
    pub preferred_session_type: SessionType,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            association_lifetime_secs: 3600,
            private_association_lifetime_secs: 60,
            nonce_max_age_secs: 60,
            extension_alias_prefix: DEFAULT_ALIAS_PREFIX.to_owned(),
            allow_no_encryption: true,
            preferred_association_type: AssociationType::HmacSha256,
            preferred_session_type: SessionType::DhSha256,
        }
    }
}

impl ProtocolConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        toml::from_str::<Self>(data).map_err(ConfigError::Toml)
    }

    /// Loads configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&data)
    }

    /// Shared association lifetime.
    #[must_use]
    pub fn association_lifetime(&self) -> Duration {
        Duration::seconds(i64::from(self.association_lifetime_secs))
    }

    /// Private association lifetime.
    #[must_use]
    pub fn private_association_lifetime(&self) -> Duration {
        Duration::seconds(i64::from(self.private_association_lifetime_secs))
    }

    /// Nonce acceptance window.
    #[must_use]
    pub fn nonce_max_age(&self) -> Duration {
        Duration::seconds(i64::from(self.nonce_max_age_secs))
    }

    /// Returns true when `session_type` may be served.
    #[must_use]
    pub fn allows_session(&self, session_type: SessionType) -> bool {
        session_type != SessionType::NoEncryption || self.allow_no_encryption
    }
}

/// Embedded example configuration.
pub const EXAMPLE_CONFIG_TOML: &str = include_str!("../openid-core.example.toml");

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File read error.
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),
    /// TOML parse error.
    #[error("failed to parse config toml: {0}")]
    Toml(toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_matches_defaults() {
        let parsed = ProtocolConfig::from_toml_str(EXAMPLE_CONFIG_TOML).expect("example parses");
        assert_eq!(parsed, ProtocolConfig::default());
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let parsed = ProtocolConfig::from_toml_str(
            "nonce_max_age_secs = 300\nallow_no_encryption = false\n",
        )
        .expect("parse");
        assert_eq!(parsed.nonce_max_age(), Duration::minutes(5));
        assert!(!parsed.allows_session(SessionType::NoEncryption));
        assert!(parsed.allows_session(SessionType::DhSha1));
        assert_eq!(parsed.association_lifetime(), Duration::hours(1));
    }

    #[test]
    fn wire_names_are_accepted_for_types() {
        let parsed = ProtocolConfig::from_toml_str(
            "preferred_association_type = \"HMAC-SHA1\"\npreferred_session_type = \"DH-SHA1\"\n",
        )
        .expect("parse");
        assert_eq!(parsed.preferred_association_type, AssociationType::HmacSha1);
        assert_eq!(parsed.preferred_session_type, SessionType::DhSha1);
    }

    #[test]
    fn bad_toml_is_reported() {
        let err = ProtocolConfig::from_toml_str("nonce_max_age_secs = \"soon\"").expect_err("bad");
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let path = std::env::temp_dir().join(format!(
            "openid-core-missing-{}.toml",
            std::process::id()
        ));
        let err = ProtocolConfig::from_toml_file(&path).expect_err("missing");
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
