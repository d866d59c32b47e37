//! On-disk certificate artifacts.
//!
//! Every artifact of an issuance run is written independently, so a failure in
//! a later (network) step never invalidates files a previous step already
//! persisted; re-running the pipeline simply overwrites.

use crate::acme::AcmeClient;
use crate::acme::object::Identifier;
use crate::cert::ParsedX509Certificate;
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

/// File-name layout for one certificate, keyed by its primary identifier.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    directory: PathBuf,
    name: String,
}

impl ArtifactLayout {
    pub fn new(directory: impl Into<PathBuf>, common_name: &Identifier) -> Self {
        Self {
            directory: directory.into(),
            name: sanitize_file_name(&common_name.to_string()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn ensure_directory(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .context(format!(
                "Failed to create artifact directory {}",
                self.directory.display()
            ))
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.directory.join(format!("{}{suffix}", self.name))
    }

    pub fn generated_key_record(&self) -> PathBuf {
        self.file("-gen-key.json")
    }

    pub fn key_pem(&self) -> PathBuf {
        self.file("-key.pem")
    }

    pub fn generated_csr_record(&self) -> PathBuf {
        self.file("-gen-csr.json")
    }

    pub fn csr_pem(&self) -> PathBuf {
        self.file("-csr.pem")
    }

    pub fn certificate_der(&self) -> PathBuf {
        self.file("-crt.der")
    }

    pub fn certificate_pem(&self) -> PathBuf {
        self.file("-crt.pem")
    }

    pub fn chain_pem(&self) -> PathBuf {
        self.file("-chain.pem")
    }

    pub fn archive(&self) -> PathBuf {
        self.file("-all.pfx")
    }

    /// Archive copy in a central store directory, named `{name}.pfx`.
    pub fn central_archive(&self, central_directory: &Path) -> PathBuf {
        central_directory.join(format!("{}.pfx", self.name))
    }
}

/// `*` and `:` appear in identifiers (wildcards, IPv6) but not in portable
/// file names.
fn sanitize_file_name(name: &str) -> String {
    name.replace(['*'], "_").replace([':'], "_")
}

/// Metadata written next to the raw key, for operators and resumed runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedKeyRecord {
    pub algorithm: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// Metadata written next to the raw CSR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCsrRecord {
    pub common_name: String,
    pub subject_alternative_names: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// On-disk issuer certificate cache, keyed by serial number
/// (`ca-{serial}-crt.der` / `.pem`). Once an issuer is cached, repeat runs
/// make no further download attempt.
#[derive(Debug, Clone)]
pub struct IssuerCache {
    directory: PathBuf,
}

impl IssuerCache {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Resolves the issuer of `leaf`, preferring the cache over the
    /// authority-provided link.
    pub async fn resolve(
        &self,
        client: &dyn AcmeClient,
        link: &Url,
        leaf: &ParsedX509Certificate,
    ) -> anyhow::Result<ParsedX509Certificate> {
        if let Some(cached) = self.find_cached(leaf).await {
            debug!(
                "Issuer {} found in cache (serial {}), skipping download",
                cached.subject, cached.serial
            );
            return Ok(cached);
        }
        let der = client
            .download_issuer(link)
            .await
            .map_err(|e| anyhow!(e))
            .context(format!("Downloading issuer certificate from {link}"))?;
        let issuer = ParsedX509Certificate::try_from(der)
            .context("Parsing downloaded issuer certificate")?;
        self.store(&issuer).await?;
        Ok(issuer)
    }

    async fn find_cached(&self, leaf: &ParsedX509Certificate) -> Option<ParsedX509Certificate> {
        let mut entries = tokio::fs::read_dir(&self.directory).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with("ca-") || !file_name.ends_with("-crt.der") {
                continue;
            }
            let Ok(der) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            match ParsedX509Certificate::try_from(der) {
                Ok(candidate) if candidate.subject == leaf.issuer => return Some(candidate),
                Ok(_) => {}
                Err(e) => {
                    warn!("Ignoring unreadable issuer cache entry {file_name}: {e:#}");
                }
            }
        }
        None
    }

    async fn store(&self, issuer: &ParsedX509Certificate) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .context("Creating issuer cache directory")?;
        let der_path = self.directory.join(format!("ca-{}-crt.der", issuer.serial));
        let pem_path = self.directory.join(format!("ca-{}-crt.pem", issuer.serial));
        tokio::fs::write(&der_path, issuer.as_der_bytes())
            .await
            .context(format!("Writing issuer cache {}", der_path.display()))?;
        tokio::fs::write(&pem_path, pem::encode(&issuer.to_pem()))
            .await
            .context(format!("Writing issuer cache {}", pem_path.display()))?;
        Ok(())
    }
}

/// Picks the issuer (`rel="up"`) link out of raw `Link` headers.
pub fn issuer_link(links: &[String], base: &Url) -> Option<Url> {
    links
        .iter()
        .filter_map(|header| nom_rfc8288::complete::link(header).ok())
        .flat_map(IntoIterator::into_iter)
        .flatten()
        .find_map(|link| {
            let url = base.join(link.url.as_ref()).ok()?;
            let relation = link.params.into_iter().find(|param| param.key == "rel")?;
            (relation.val? == "up").then_some(url)
        })
}

/// Bundles key, leaf and issuer into a PKCS#12 archive.
pub fn build_pkcs12(
    friendly_name: &str,
    leaf_der: &[u8],
    key_der: &[u8],
    issuer_der: Option<&[u8]>,
    password: &str,
) -> anyhow::Result<Vec<u8>> {
    let pfx = p12::PFX::new(leaf_der, key_der, issuer_der, password, friendly_name)
        .ok_or_else(|| anyhow!("Assembling the PKCS#12 archive failed"))?;
    Ok(pfx.to_der())
}
