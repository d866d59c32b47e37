use crate::config::{Configuration, DirectoryConfig};
use std::path::Path;

/// Built-in configuration, rooted next to the configuration file.
pub struct DefaultConfig;

impl DefaultConfig {
    pub fn load<P: AsRef<Path>>(config_file: P) -> Result<Configuration, anyhow::Error> {
        let base = config_file
            .as_ref()
            .parent()
            .unwrap_or_else(|| Path::new("."));
        Ok(Configuration {
            directories: DirectoryConfig {
                state_dir: base.join("state"),
                artifact_dir: base.join("certificates"),
            },
            ..Configuration::default()
        })
    }
}
