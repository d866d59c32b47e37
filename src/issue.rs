//! The issuance pipeline: key → CSR → order → certificate → artifacts.
//!
//! Precondition: the target's authorization is valid. Every artifact write is
//! independent; a failed network step leaves everything written so far on disk
//! for the next attempt.

use crate::acme::object::{OrderHandle, OrderStatus};
use crate::acme::{AcmeClient, error as acme_error};
use crate::artifacts::{
    ArtifactLayout, GeneratedCsrRecord, GeneratedKeyRecord, IssuerCache, build_pkcs12, issuer_link,
};
use crate::authorize::PollSettings;
use crate::cert::{ParsedX509Certificate, create_and_sign_csr};
use crate::clock::Clock;
use crate::crypto::{KeyType, new_key};
use crate::error::{IssueContext, IssueError, IssueResult};
use crate::target::Target;
use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub key_type: KeyType,
    /// Password protecting the PKCS#12 archive. Empty means unprotected.
    pub archive_password: String,
    /// Optional central store directory receiving a second archive copy.
    pub central_archive_dir: Option<PathBuf>,
    /// Cadence for the order-completion poll.
    pub poll: PollSettings,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            key_type: KeyType::default(),
            archive_password: String::new(),
            central_archive_dir: None,
            poll: PollSettings::default(),
        }
    }
}

/// The issued certificate with everything installers need.
#[derive(Debug, Clone)]
pub struct CertificateArtifact {
    pub leaf: ParsedX509Certificate,
    /// Issuer chain, the leaf's direct issuer first (root omitted when the
    /// authority does not provide it).
    pub chain: Vec<ParsedX509Certificate>,
    pub private_key_pem: String,
    /// Hex SHA-256 of the leaf; the identity recorded in renewal history.
    pub thumbprint: String,
    /// Where the artifact files were persisted.
    pub directory: PathBuf,
}

pub struct IssuancePipeline<'a> {
    client: &'a dyn AcmeClient,
    clock: &'a dyn Clock,
    settings: &'a IssuanceSettings,
}

impl<'a> IssuancePipeline<'a> {
    pub fn new(
        client: &'a dyn AcmeClient,
        clock: &'a dyn Clock,
        settings: &'a IssuanceSettings,
    ) -> Self {
        Self {
            client,
            clock,
            settings,
        }
    }

    pub async fn issue(
        &self,
        target: &mut Target,
        layout: &ArtifactLayout,
    ) -> IssueResult<CertificateArtifact> {
        let identifiers = target.identifiers();
        let names = identifiers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!("Requesting certificate for {names}");
        layout.ensure_directory().await.client_failure()?;

        let key = new_key(self.settings.key_type)
            .context("Generating certificate private key")
            .client_failure()?;
        let key_pem = key
            .to_pem()
            .context("Serializing certificate private key")
            .client_failure()?
            .to_string();
        let rcgen_key = key
            .to_rcgen_keypair()
            .context("Preparing signing key for CSR")
            .client_failure()?;
        self.write(
            layout.generated_key_record(),
            serde_json::to_vec_pretty(&GeneratedKeyRecord {
                algorithm: self.settings.key_type.to_string(),
                created: self.clock.now(),
            })
            .context("Encoding key metadata")
            .client_failure()?,
        )
        .await?;
        self.write(layout.key_pem(), key_pem.clone().into_bytes())
            .await?;
        target.private_key_pem = Some(key_pem.clone());

        let common_name = target.common_name.to_string();
        let csr = create_and_sign_csr(&rcgen_key, &common_name, &identifiers).client_failure()?;
        let csr_der = csr.der().to_vec();
        self.write(
            layout.generated_csr_record(),
            serde_json::to_vec_pretty(&GeneratedCsrRecord {
                common_name: common_name.clone(),
                subject_alternative_names: identifiers
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                created: self.clock.now(),
            })
            .context("Encoding CSR metadata")
            .client_failure()?,
        )
        .await?;
        self.write(
            layout.csr_pem(),
            csr.pem()
                .context("Encoding CSR PEM")
                .client_failure()?
                .into_bytes(),
        )
        .await?;
        target.csr_der = Some(csr_der.clone());

        let order = self
            .client
            .submit_csr(&identifiers, &csr_der)
            .await
            .map_err(|e| wire_error(e, "Submitting CSR"))?;
        debug!("Order created @ {}", order.url);
        self.await_order_completion(&order).await?;

        let download = self
            .client
            .download_certificate(&order)
            .await
            .map_err(|e| wire_error(e, "Downloading certificate"))?;
        info!("Successfully issued a certificate!");
        self.write(layout.certificate_der(), download.der.clone())
            .await?;
        let leaf = ParsedX509Certificate::try_from(download.der.clone())
            .context("Parsing issued certificate")
            .client_failure()?;
        self.write(
            layout.certificate_pem(),
            pem::encode(&leaf.to_pem()).into_bytes(),
        )
        .await?;

        let chain = self.resolve_chain(&order, &download.links, &leaf, layout).await?;
        let issuer_der = chain.first().map(|issuer| issuer.as_der_bytes().to_vec());
        let archive = build_pkcs12(
            layout.name(),
            leaf.as_der_bytes(),
            &rcgen_key.serialize_der(),
            issuer_der.as_deref(),
            &self.settings.archive_password,
        )
        .client_failure()?;
        self.write(layout.archive(), archive.clone()).await?;
        if let Some(central) = &self.settings.central_archive_dir {
            tokio::fs::create_dir_all(central)
                .await
                .context("Creating central archive directory")
                .client_failure()?;
            self.write(layout.central_archive(central), archive).await?;
        }

        let thumbprint = leaf.thumbprint.clone();
        Ok(CertificateArtifact {
            leaf,
            chain,
            private_key_pem: key_pem,
            thumbprint,
            directory: layout.directory().to_path_buf(),
        })
    }

    /// Polls the order until the certificate is ready for download.
    async fn await_order_completion(&self, order: &OrderHandle) -> IssueResult<()> {
        let poll = self.settings.poll;
        for attempt in 1..=poll.max_attempts {
            let status = self
                .client
                .poll_order(order)
                .await
                .map_err(|e| wire_error(e, "Polling order status"))?;
            match status {
                OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return anyhow!("The CA rejected the submitted CSR").ca_failure();
                }
                OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {
                    debug!("Order not complete yet (attempt {attempt}): {status:?}");
                }
            }
            if attempt < poll.max_attempts {
                self.clock.sleep(poll.interval).await;
            }
        }
        anyhow!(
            "Order did not complete within {} poll attempts",
            poll.max_attempts
        )
        .timed_out()
    }

    /// Resolves the issuer chain via the `rel="up"` link, using the on-disk
    /// serial-number cache, and persists `-chain.pem`.
    async fn resolve_chain(
        &self,
        order: &OrderHandle,
        links: &[String],
        leaf: &ParsedX509Certificate,
        layout: &ArtifactLayout,
    ) -> IssueResult<Vec<ParsedX509Certificate>> {
        let Some(link) = issuer_link(links, &order.url) else {
            warn!("The CA provided no issuer link; chain artifacts will be incomplete");
            return Ok(Vec::new());
        };
        let cache = IssuerCache::new(layout.directory());
        let issuer = cache
            .resolve(self.client, &link, leaf)
            .await
            .client_failure()?;
        self.write(
            layout.chain_pem(),
            pem::encode(&issuer.to_pem()).into_bytes(),
        )
        .await?;
        Ok(vec![issuer])
    }

    async fn write(&self, path: PathBuf, content: Vec<u8>) -> IssueResult<()> {
        write_artifact(&path, &content).await.client_failure()
    }
}

async fn write_artifact(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    tokio::fs::write(path, content)
        .await
        .context(format!("Writing artifact {}", path.display()))
}

fn wire_error(error: acme_error::Error, action: &'static str) -> IssueError {
    IssueError::from(anyhow::Error::new(error).context(action))
}
