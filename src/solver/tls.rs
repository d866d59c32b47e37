use crate::acme::object::{ChallengeKind, Identifier, InnerChallenge};
use crate::crypto::sha256;
use crate::solver::ChallengeSolver;
use anyhow::{Context, Error, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Validity of the throwaway certificates. They only need to survive one
/// validation round-trip.
const EPHEMERAL_CERT_LIFETIME: time::Duration = time::Duration::hours(1);

/// Key-pair generation failing for a usable SAN is exceedingly rare; retry a
/// couple of times before giving up.
const MAX_GENERATION_ATTEMPTS: u32 = 3;

/// Derives the validation names for an ephemeral-TLS proof.
///
/// Each round hashes the previous round's lowercase hex digest (round one
/// hashes the key-authorization string itself), and formats the two 16-byte
/// halves of the digest as `{first32hex}.{last32hex}.acme.invalid`.
pub fn derive_validation_names(key_authorization: &str, iterations: u32) -> Vec<String> {
    let mut names = Vec::with_capacity(iterations as usize);
    let mut input = key_authorization.to_string();
    for _ in 0..iterations {
        let digest = hex::encode(sha256(input.as_bytes()));
        names.push(format!("{}.{}.acme.invalid", &digest[..32], &digest[32..]));
        input = digest;
    }
    names
}

/// Where ephemeral validation certificates get installed for TLS negotiation.
/// The embedding TLS server serves them by SNI name while validation runs.
#[async_trait]
pub trait TlsCertificateSink: Send + Sync {
    async fn install(&self, name: &str, certificate: EphemeralCertificate) -> anyhow::Result<()>;
    async fn remove(&self, name: &str) -> anyhow::Result<()>;
}

/// A short-lived self-signed certificate plus its key, both PEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralCertificate {
    pub certificate_pem: String,
    pub key_pem: String,
}

/// In-memory sink. Sufficient for embedders that resolve SNI lookups against
/// process memory; also what the tests observe.
#[derive(Debug, Default)]
pub struct MemoryCertificateSink {
    certificates: parking_lot::Mutex<HashMap<String, EphemeralCertificate>>,
}

impl MemoryCertificateSink {
    pub fn get(&self, name: &str) -> Option<EphemeralCertificate> {
        self.certificates.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.certificates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.lock().is_empty()
    }
}

#[async_trait]
impl TlsCertificateSink for MemoryCertificateSink {
    async fn install(&self, name: &str, certificate: EphemeralCertificate) -> anyhow::Result<()> {
        self.certificates
            .lock()
            .insert(name.to_string(), certificate);
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.certificates.lock().remove(name);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralTlsSolverConfiguration {}

/// Proves ownership by presenting derived `.acme.invalid` SANs during TLS
/// negotiation. Touches no filesystem.
pub struct EphemeralTlsSolver {
    sink: Arc<dyn TlsCertificateSink>,
    installed: Vec<String>,
}

impl EphemeralTlsSolver {
    pub fn from_config(
        _config: EphemeralTlsSolverConfiguration,
        sink: Arc<dyn TlsCertificateSink>,
    ) -> Box<Self> {
        Box::new(Self {
            sink,
            installed: Vec::new(),
        })
    }

    fn generate_certificate(name: &str) -> anyhow::Result<EphemeralCertificate> {
        let mut last_error = None;
        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            match Self::try_generate_certificate(name) {
                Ok(certificate) => return Ok(certificate),
                Err(e) => {
                    warn!("Generating validation certificate for {name} failed (attempt {attempt}): {e:#}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("at least one generation attempt"))
    }

    fn try_generate_certificate(name: &str) -> anyhow::Result<EphemeralCertificate> {
        let key = rcgen::KeyPair::generate().context("Validation key generation failed")?;
        let mut params = rcgen::CertificateParams::new(vec![name.to_string()])
            .context("Validation certificate parameters rejected")?;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + EPHEMERAL_CERT_LIFETIME;
        let certificate = params
            .self_signed(&key)
            .context("Signing validation certificate failed")?;
        Ok(EphemeralCertificate {
            certificate_pem: certificate.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    async fn remove_installed(&mut self) {
        for name in self.installed.drain(..) {
            if let Err(e) = self.sink.remove(&name).await {
                warn!("Failed to remove validation certificate {name}: {e:#}");
            }
        }
    }
}

#[async_trait]
impl ChallengeSolver for EphemeralTlsSolver {
    fn long_name(&self) -> &'static str {
        "ephemeral TLS certificate solver"
    }

    fn short_name(&self) -> &'static str {
        "ephemeral-tls"
    }

    fn supports_challenge(&self, challenge: &InnerChallenge) -> bool {
        matches!(challenge, InnerChallenge::Tls(_))
    }

    fn preferred_kind(&self) -> ChallengeKind {
        ChallengeKind::TlsAlpn01
    }

    async fn deploy_challenge(
        &mut self,
        identifier: &Identifier,
        challenge: InnerChallenge,
    ) -> Result<(), Error> {
        let tls_challenge = match challenge {
            InnerChallenge::Tls(tls_challenge) => tls_challenge,
            other => bail!("Unsupported challenge type {}", other.get_type()),
        };
        if tls_challenge.iterations == 0 {
            bail!("CA requested zero validation certificate iterations");
        }
        let names =
            derive_validation_names(&tls_challenge.key_authorization, tls_challenge.iterations);
        for name in names {
            let certificate = Self::generate_certificate(&name)?;
            self.sink
                .install(&name, certificate)
                .await
                .context(format!("Installing validation certificate {name}"))?;
            debug!("Installed validation certificate {name} for {identifier}");
            self.installed.push(name);
        }
        Ok(())
    }

    async fn on_failure(&mut self) -> Result<(), Error> {
        // Nothing on disk to inspect; free the installed certificates.
        self.remove_installed().await;
        Ok(())
    }

    async fn cleanup_challenge(mut self: Box<Self>) -> Result<(), Error> {
        if self.installed.is_empty() {
            bail!("No challenge to cleanup");
        }
        self.remove_installed().await;
        Ok(())
    }
}
