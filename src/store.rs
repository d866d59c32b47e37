//! Store and installation collaborators.
//!
//! The core hands a finished [`CertificateArtifact`] to these traits and knows
//! nothing about their internals (OS certificate stores, web-server bindings,
//! file drops, scripts). Implementations are registered by name; renewal
//! records reference those names as their opaque store/installer selection.

use crate::cmd_runner::run_shell_command_checked;
use crate::issue::CertificateArtifact;
use crate::target::Target;
use anyhow::bail;
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use tracing::debug;

/// Keeps certificates available to consumers (and removable again).
#[async_trait]
pub trait CertificateStore: Send + Sync {
    fn name(&self) -> &str;
    async fn install(&self, target: &Target, artifact: &CertificateArtifact)
    -> anyhow::Result<()>;
    /// Removes a previously installed certificate by thumbprint. Called only
    /// after a replacement was confirmed installed.
    async fn remove(&self, thumbprint: &str) -> anyhow::Result<()>;
}

/// Applies an installed certificate to its consumer (bindings, reloads, ...).
#[async_trait]
pub trait Installer: Send + Sync {
    fn name(&self) -> &str;
    async fn install(&self, target: &Target, artifact: &CertificateArtifact)
    -> anyhow::Result<()>;
}

/// Installer that delegates to an operator-provided shell command. The
/// artifact location and identity are passed through the environment.
pub struct ScriptInstaller {
    name: String,
    command: String,
}

impl ScriptInstaller {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl Installer for ScriptInstaller {
    fn name(&self) -> &str {
        &self.name
    }

    async fn install(
        &self,
        target: &Target,
        artifact: &CertificateArtifact,
    ) -> anyhow::Result<()> {
        let env: HashMap<OsString, OsString> = HashMap::from([
            (
                "RENEWAL_TARGET".into(),
                target.friendly_name.as_str().into(),
            ),
            (
                "CERT_THUMBPRINT".into(),
                artifact.thumbprint.as_str().into(),
            ),
            (
                "CERT_DIRECTORY".into(),
                artifact.directory.as_os_str().to_os_string(),
            ),
        ]);
        debug!(
            "Running installation script {} for {}",
            self.name, target.friendly_name
        );
        run_shell_command_checked(self.command.as_ref(), env).await
    }
}

/// Named store/installer implementations available to the scheduler. Renewal
/// records select by name; an unknown name is a configuration error surfaced
/// before any issuance work starts.
#[derive(Default)]
pub struct CollaboratorRegistry {
    stores: HashMap<String, Arc<dyn CertificateStore>>,
    installers: HashMap<String, Arc<dyn Installer>>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_store(&mut self, store: Arc<dyn CertificateStore>) {
        self.stores.insert(store.name().to_string(), store);
    }

    pub fn register_installer(&mut self, installer: Arc<dyn Installer>) {
        self.installers.insert(installer.name().to_string(), installer);
    }

    pub fn store(&self, name: &str) -> anyhow::Result<Arc<dyn CertificateStore>> {
        match self.stores.get(name) {
            Some(store) => Ok(store.clone()),
            None => bail!("No certificate store named {name} is registered"),
        }
    }

    pub fn installer(&self, name: &str) -> anyhow::Result<Arc<dyn Installer>> {
        match self.installers.get(name) {
            Some(installer) => Ok(installer.clone()),
            None => bail!("No installer named {name} is registered"),
        }
    }
}
