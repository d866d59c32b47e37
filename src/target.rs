use crate::acme::object::Identifier;
use anyhow::bail;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// An ordered, de-duplicated group of identifiers that share one certificate,
/// optionally tagged with the source-system site it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPart {
    pub identifiers: Vec<Identifier>,
    /// Opaque reference to the site this group was read from (e.g. a web-server
    /// site id). Not interpreted by this core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
}

impl TargetPart {
    pub fn new(identifiers: Vec<Identifier>) -> Self {
        Self {
            identifiers: identifiers.into_iter().unique().collect(),
            site_id: None,
        }
    }

    #[must_use]
    pub fn with_site_id(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }
}

/// The full set of identifiers covered by one certificate, grouped into parts
/// ("split" certificates span multiple sites sharing one certificate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Display name only; user-overridable and never used as an identifier.
    pub friendly_name: String,
    /// The primary identifier. Must be a member of some part.
    pub common_name: Identifier,
    pub parts: Vec<TargetPart>,
    /// PEM of the private key generated during the current issuance run.
    #[serde(skip)]
    pub private_key_pem: Option<String>,
    /// DER of the CSR generated during the current issuance run.
    #[serde(skip)]
    pub csr_der: Option<Vec<u8>>,
}

impl Target {
    pub fn new(
        friendly_name: impl Into<String>,
        common_name: Identifier,
        parts: Vec<TargetPart>,
    ) -> anyhow::Result<Self> {
        if parts.iter().all(|part| part.identifiers.is_empty()) {
            bail!("A certificate target must contain at least one identifier");
        }
        if !parts
            .iter()
            .any(|part| part.identifiers.contains(&common_name))
        {
            bail!("Common name {common_name} is not part of the certificate target");
        }
        Ok(Self {
            friendly_name: friendly_name.into(),
            common_name,
            parts,
            private_key_pem: None,
            csr_der: None,
        })
    }

    /// All identifiers across all parts, de-duplicated, in first-seen order.
    /// This is the order authorization results are reported in.
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.parts
            .iter()
            .flat_map(|part| part.identifiers.iter())
            .unique()
            .cloned()
            .collect()
    }

    /// Clears the transient key/CSR material after an issuance run.
    pub fn clear_run_material(&mut self) {
        self.private_key_pem = None;
        self.csr_der = None;
    }
}
