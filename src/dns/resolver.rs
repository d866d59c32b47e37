use crate::clock::Clock;
use crate::dns::name::DnsName;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::lookup::Lookup;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_CNAME_CHAIN_LENGTH: usize = 10;

/// How often and how long to wait for a published TXT record to become visible
/// before the answer is submitted to the CA.
#[derive(Debug, Clone, Copy)]
pub struct PropagationSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 12,
        }
    }
}

#[derive(Debug)]
pub struct Resolver {
    resolver: hickory_resolver::Resolver<TokioConnectionProvider>,
}

impl Resolver {
    /// Create a new DNS resolver with default settings. The resolver will use the system configuration (`/etc/resolv.conf` or equivalent)
    /// if available, otherwise it falls back to a compiled-in default (currently Cloudflare DNS).
    pub fn new() -> Self {
        let resolver = hickory_resolver::Resolver::builder_tokio()
            .unwrap_or_else(|e| {
                warn!("Failed to create DNS resolver using system configuration, using default servers instead: {e:#}");
                hickory_resolver::Resolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
            })
            .build();
        Self { resolver }
    }

    async fn lookup_generic(&self, source: &DnsName, rtype: RecordType) -> Result<Lookup, Error> {
        match self
            .resolver
            .lookup(hickory_resolver::Name::from(source), rtype)
            .await
        {
            Ok(lookup) => Ok(lookup),
            // Note: Order matters, because is_no_records_found includes is_nx_domain
            Err(e) if e.is_nx_domain() => Err(Error::NxDomain),
            Err(e) if e.is_no_records_found() => Err(Error::NoRecords(rtype)),
            Err(e) => Err(e.into()),
        }
    }

    /// All TXT values published at `source`. A record's character strings are
    /// joined, as resolvers split long values.
    pub async fn lookup_txt(&self, source: &DnsName) -> Result<Vec<String>, Error> {
        match self
            .resolver
            .txt_lookup(hickory_resolver::Name::from(source))
            .await
        {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|segment| String::from_utf8_lossy(segment))
                        .collect::<String>()
                })
                .collect()),
            Err(e) if e.is_nx_domain() => Err(Error::NxDomain),
            Err(e) if e.is_no_records_found() => Err(Error::NoRecords(RecordType::TXT)),
            Err(e) => Err(e.into()),
        }
    }

    /// Follows CNAMEs from `source` to the name that actually holds records.
    /// Used to honor challenge delegation before propagation checks.
    pub async fn resolve_cname_chain(&self, source: DnsName) -> Result<DnsName, Error> {
        let mut cname_lookups = 0;
        let mut current = source;
        let resolved = loop {
            cname_lookups += 1;
            if cname_lookups > MAX_CNAME_CHAIN_LENGTH {
                return Err(Error::CNameChainTooLong);
            }
            let lookup = match self.lookup_generic(&current, RecordType::CNAME).await {
                Ok(lookup) => lookup,
                Err(Error::NoRecords(_) | Error::NxDomain) => {
                    break current;
                }
                other_error => other_error?,
            };
            let new_source = lookup.record_iter().find_map(|record| {
                let record_name: DnsName = record.name().into();
                if let Some(cname) = record.data().as_cname() {
                    if record_name.eq_ignore_root(&current) {
                        return Some((&cname.0).into());
                    }
                }
                None
            });
            match new_source {
                Some(new_source) if current.eq_ignore_root(&new_source) => {
                    // CNAME that points to itself? Abort search, consider this the final result
                    break new_source;
                }
                Some(new_source) => {
                    current = new_source;
                }
                None => {
                    break current;
                }
            }
        };
        Ok(resolved)
    }

    /// Waits until `expected` is observable as a TXT value at `record_name`
    /// (following CNAME delegation), up to the configured attempt cap.
    ///
    /// Returns whether the record was observed. Lookup errors count as "not yet
    /// visible"; the caller decides whether a missing record is fatal.
    pub async fn wait_for_txt(
        &self,
        clock: &dyn Clock,
        record_name: &DnsName,
        expected: &str,
        settings: PropagationSettings,
    ) -> bool {
        let target = match self.resolve_cname_chain(record_name.clone()).await {
            Ok(target) => target,
            Err(e) => {
                debug!("CNAME resolution for {record_name} failed, checking the name directly: {e}");
                record_name.clone()
            }
        };
        for attempt in 1..=settings.max_attempts {
            match self.lookup_txt(&target).await {
                Ok(values) if values.iter().any(|value| value == expected) => {
                    debug!("TXT record at {target} visible after {attempt} attempt(s)");
                    return true;
                }
                Ok(_) => {
                    debug!("TXT record at {target} not yet propagated (attempt {attempt})");
                }
                Err(e) => {
                    debug!("TXT lookup for {target} failed (attempt {attempt}): {e}");
                }
            }
            if attempt < settings.max_attempts {
                clock.sleep(settings.interval).await;
            }
        }
        false
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the domain does not exist (NXDOMAIN)")]
    NxDomain,
    #[error("No DNS records found for RR type {0}")]
    NoRecords(RecordType),
    #[error("The domain name has too many CNAMEs (possible CNAME loop?)")]
    CNameChainTooLong,
    #[error("DNS resolution failed")]
    LookupFailure(#[from] hickory_resolver::ResolveError),
}
