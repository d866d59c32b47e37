use crate::authorize::{AuthorizationSettings, PollSettings};
use crate::clock::ParsedDuration;
use crate::config::default::DefaultConfig;
use crate::config::toml::TomlConfiguration;
use crate::dns::resolver::PropagationSettings;
use crate::issue::IssuanceSettings;
use crate::state::types::CsrSelection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod default;
mod toml;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub directories: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Delay between challenge-status polls.
    pub poll_interval: ParsedDuration,
    /// Poll attempts before an authorization counts as timed out.
    pub max_poll_attempts: u32,
    /// Identifiers of one certificate authorized concurrently.
    pub batch_size: usize,
    /// Fetch HTTP proofs once before asking the CA to validate.
    pub warm_up: bool,
    /// Leave proofs in place after successful validation (for debugging).
    pub disable_cleanup: bool,
    /// Delay between DNS propagation checks.
    pub propagation_interval: ParsedDuration,
    /// Propagation checks before submitting the answer anyway.
    pub propagation_attempts: u32,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            poll_interval: ParsedDuration::from(4),
            max_poll_attempts: 10,
            batch_size: 4,
            warm_up: true,
            disable_cleanup: false,
            propagation_interval: ParsedDuration::from(5),
            propagation_attempts: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// Password protecting PKCS#12 archives. Empty means unprotected.
    pub archive_password: String,
    /// Central store directory receiving a copy of every archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub central_archive_dir: Option<PathBuf>,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            archive_password: String::new(),
            central_archive_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long after a successful issuance the next renewal is due.
    pub renewal_period: ParsedDuration,
    /// Upper bound of the random per-record start delay of unattended runs.
    pub max_random_delay: ParsedDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            renewal_period: ParsedDuration::from(Duration::from_secs(55 * 86400)),
            max_random_delay: ParsedDuration::from(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Where renewal records and the renewal lock live.
    pub state_dir: PathBuf,
    /// Where certificate artifacts are written, one subdirectory per record.
    pub artifact_dir: PathBuf,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            artifact_dir: PathBuf::from("certificates"),
        }
    }
}

impl Configuration {
    pub fn authorization_settings(&self) -> AuthorizationSettings {
        AuthorizationSettings {
            poll: PollSettings {
                interval: *self.authorization.poll_interval,
                max_attempts: self.authorization.max_poll_attempts,
            },
            propagation: PropagationSettings {
                interval: *self.authorization.propagation_interval,
                max_attempts: self.authorization.propagation_attempts,
            },
            batch_size: self.authorization.batch_size,
            warm_up: self.authorization.warm_up,
            disable_cleanup: self.authorization.disable_cleanup,
        }
    }

    pub fn issuance_settings(&self, csr: &CsrSelection) -> IssuanceSettings {
        IssuanceSettings {
            key_type: csr.key_type,
            archive_password: self.issuance.archive_password.clone(),
            central_archive_dir: self.issuance.central_archive_dir.clone(),
            poll: PollSettings {
                interval: *self.authorization.poll_interval,
                max_attempts: self.authorization.max_poll_attempts,
            },
        }
    }
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error>;
}

/// Loads the configuration, materializing (and persisting) defaults when the
/// file does not exist yet.
pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    if file.as_ref().exists() {
        TomlConfiguration::load(file)
    } else {
        let default = DefaultConfig::load(&file)?;
        TomlConfiguration::save(&default, &file)?;
        Ok(default)
    }
}

pub fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error> {
    TomlConfiguration::save(config, file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_cadence() {
        let config = Configuration::default();
        let settings = config.authorization_settings();
        assert_eq!(settings.poll.interval, Duration::from_secs(4));
        assert_eq!(settings.poll.max_attempts, 10);
        assert!(settings.warm_up);
        assert!(!settings.disable_cleanup);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("certmill.toml");

        let config = load(&config_file).unwrap();

        assert!(config_file.exists());
        assert_eq!(config.directories.state_dir, dir.path().join("state"));
        let reloaded = load(&config_file).unwrap();
        assert_eq!(
            reloaded.scheduler.renewal_period,
            config.scheduler.renewal_period
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("certmill.toml");
        std::fs::write(
            &config_file,
            "[authorization]\npoll_interval = \"2s\"\n",
        )
        .unwrap();

        let config = load(&config_file).unwrap();

        assert_eq!(
            *config.authorization.poll_interval,
            Duration::from_secs(2)
        );
        assert_eq!(config.authorization.max_poll_attempts, 10);
    }
}
