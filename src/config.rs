//! Provider Configuration
//!
//! Connection profiles and transition polling settings. Configuration is an
//! explicit value handed to each gateway and controller at construction time;
//! nothing here is read from global state.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Connection Profile
// =============================================================================

/// Credentials and endpoint of one storage controller cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Profile name, referenced by `cx_profile_name` in manifests
    pub name: String,
    /// Cluster management hostname or IP
    pub hostname: String,
    pub username: String,
    /// Password (may be supplied through the environment instead)
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Verify the controller's TLS certificate
    #[serde(default = "default_validate_certs")]
    pub validate_certs: bool,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_validate_certs() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    60
}

impl ConnectionProfile {
    /// Base URL of the REST API
    pub fn api_url(&self) -> String {
        let host = self.hostname.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}/api", host)
        } else {
            format!("https://{}/api", host)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Poll Configuration
// =============================================================================

/// Settings for waiting on asynchronous backend transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between two reads of the transitioning object
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Give up waiting after this long; the object is kept
    #[serde(default = "default_poll_timeout")]
    pub timeout_ms: u64,
}

fn default_poll_interval() -> u64 {
    3_000
}

fn default_poll_timeout() -> u64 {
    120_000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            timeout_ms: default_poll_timeout(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Provider Configuration
// =============================================================================

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub connection_profiles: Vec<ConnectionProfile>,
    #[serde(default)]
    pub poll: PollConfig,
}

impl ProviderConfig {
    /// Load and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ProviderConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill in the password of every profile that has none
    pub fn with_default_password(mut self, password: Option<&str>) -> Self {
        if let Some(password) = password {
            for profile in self.connection_profiles.iter_mut() {
                if profile.password.is_empty() {
                    profile.password = password.to_string();
                }
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_profiles.is_empty() {
            return Err(Error::Configuration(
                "at least one connection profile is required".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        for profile in &self.connection_profiles {
            if profile.name.is_empty() || profile.hostname.is_empty() {
                return Err(Error::Configuration(
                    "connection profiles need a name and a hostname".into(),
                ));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate connection profile '{}'",
                    profile.name
                )));
            }
        }

        if self.poll.interval_ms == 0 {
            return Err(Error::Configuration("poll.interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Look up a profile by name
    pub fn profile(&self, name: &str) -> Result<&ConnectionProfile> {
        self.connection_profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                Error::Configuration(format!("connection profile '{}' is not defined", name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
connection_profiles:
  - name: cluster4
    hostname: 10.0.0.4
    username: admin
    validate_certs: false
poll:
  interval_ms: 500
"#;

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = ProviderConfig::load(file.path())
            .unwrap()
            .with_default_password(Some("secret"));

        let profile = config.profile("cluster4").unwrap();
        assert_eq!(profile.api_url(), "https://10.0.0.4/api");
        assert_eq!(profile.password, "secret");
        assert!(!profile.validate_certs);
        assert_eq!(profile.timeout_secs, 60);
        assert_eq!(config.poll.interval(), Duration::from_millis(500));
        assert_eq!(config.poll.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_missing_profile() {
        let config: ProviderConfig = serde_yaml::from_str(CONFIG).unwrap();
        assert!(matches!(
            config.profile("nope"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_profiles_rejected() {
        let yaml = r#"
connection_profiles:
  - { name: a, hostname: h1, username: u }
  - { name: a, hostname: h2, username: u }
"#;
        let config: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
