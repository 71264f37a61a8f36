//! Configuration loading from capgate.toml.

use policy::Policy;
use runtime::{ChallengeKind, DEFAULT_TOKEN_TTL, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Consent checkpoint settings.
    #[serde(default)]
    pub consent: ConsentConfig,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Policy rules (standing grants, step-up, deny).
    #[serde(flatten)]
    pub policy: Policy,
}

#[derive(Debug, Deserialize)]
pub struct ConsentConfig {
    /// Lifetime of a confirmation token in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    #[serde(default)]
    pub challenge: ChallengeKind,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            challenge: ChallengeKind::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditConfig {
    /// SQLite file for the event log. Defaults to the data directory.
    pub path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            enabled: true,
        }
    }
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL.as_secs()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.policy.validate()?;
        if config.consent.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "consent.token_ttl_secs must be greater than zero".into(),
            ));
        }
        Ok(config)
    }

    /// Configuration used when no file is present.
    pub fn default_config() -> Self {
        Self {
            consent: ConsentConfig::default(),
            audit: AuditConfig::default(),
            policy: Policy::restrictive(),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.consent.token_ttl_secs)
    }

    /// Session settings without the audit store, which the caller opens.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.policy.clone());
        config.challenge = self.consent.challenge;
        config.token_ttl = self.token_ttl();
        config
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Policy(#[from] policy::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::Capability;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
[grants]
standing = ["apply_eq", "mix_track"]

[step_up]
required = ["render_export"]

[deny]
all = ["load_plugin"]

[consent]
token_ttl_secs = 90
challenge = "voice_phrase"

[audit]
path = "/tmp/capgate-audit.db"
enabled = false
"#,
        )
        .unwrap();

        assert!(config.policy.grants.standing.contains(&Capability::ApplyEq));
        assert!(config.policy.deny.all.contains(&Capability::LoadPlugin));
        assert_eq!(config.token_ttl(), Duration::from_secs(90));
        assert_eq!(config.consent.challenge, ChallengeKind::VoicePhrase);
        assert!(!config.audit.enabled);
        assert_eq!(
            config.audit.path.as_deref(),
            Some(Path::new("/tmp/capgate-audit.db"))
        );
    }

    #[test]
    fn test_sections_default() {
        let config = Config::parse("[grants]\nstanding = [\"apply_eq\"]\n").unwrap();
        assert_eq!(config.token_ttl(), DEFAULT_TOKEN_TTL);
        assert_eq!(config.consent.challenge, ChallengeKind::TypeCode);
        assert!(config.audit.enabled);
        assert!(config.audit.path.is_none());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let err = Config::parse("[consent]\ntoken_ttl_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_conflicting_policy_rejected() {
        let err = Config::parse(
            "[grants]\nstanding = [\"apply_eq\"]\n[deny]\nall = [\"apply_eq\"]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Policy(_)));
    }

    #[test]
    fn test_unknown_challenge_rejected() {
        let err = Config::parse("[consent]\nchallenge = \"retina_scan\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
