//! Due-date driven renewal over all persisted records.
//!
//! Records renew concurrently, but never two runs for the same record id, and
//! no failure of one record prevents the others from being attempted. Every
//! run appends to the record's history, successful or not.

use crate::acme::AcmeClient;
use crate::artifacts::ArtifactLayout;
use crate::authorize::{AuthorizationOrchestrator, AuthorizationOutcome, Authorizer};
use crate::clock::{Clock, humanize_duration};
use crate::config::Configuration;
use crate::error::{IssueContext, IssueResult};
use crate::issue::{CertificateArtifact, IssuancePipeline, IssuanceSettings};
use crate::solver::SolverFactory;
use crate::state::RecordStore;
use crate::state::lock::RenewalLock;
use crate::state::types::{RenewalOutcome, RenewalRecord};
use crate::store::CollaboratorRegistry;
use anyhow::{Context, anyhow};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The CLI-surface flags this core consumes (it does not parse them).
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Renew regardless of due dates.
    pub force: bool,
    /// Cooperative cancellation for the whole pass.
    pub cancellation: CancellationToken,
}

/// Everything a renewal pass needs. Explicit context instead of process-wide
/// singletons, so embedders and tests can wire their own collaborators.
pub struct RenewContext {
    pub client: Arc<dyn AcmeClient>,
    pub clock: Arc<dyn Clock>,
    pub records: RecordStore,
    pub registry: CollaboratorRegistry,
    pub solvers: SolverFactory,
    pub config: Configuration,
    record_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RenewContext {
    pub fn new(
        client: Arc<dyn AcmeClient>,
        clock: Arc<dyn Clock>,
        records: RecordStore,
        registry: CollaboratorRegistry,
        solvers: SolverFactory,
        config: Configuration,
    ) -> Self {
        Self {
            client,
            clock,
            records,
            registry,
            solvers,
            config,
            record_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// One renewal per distinct record id at a time.
    fn record_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.record_locks
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewStatus {
    NotDue,
    Renewed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RenewResult {
    pub record_id: String,
    pub status: RenewStatus,
    pub outcome: RenewalOutcome,
    pub message: Option<String>,
}

/// Summary of one pass over all records.
#[derive(Debug, Clone)]
pub struct RenewSummary {
    pub results: Vec<RenewResult>,
}

impl RenewSummary {
    /// Non-zero when any record failed; the process exit code of an
    /// unattended run.
    pub fn exit_code(&self) -> i32 {
        if self
            .results
            .iter()
            .any(|result| result.status == RenewStatus::Failed)
        {
            1
        } else {
            0
        }
    }
}

pub struct RenewService {
    context: Arc<RenewContext>,
    options: RunOptions,
}

impl RenewService {
    pub fn new(context: RenewContext, options: RunOptions) -> Self {
        Self {
            context: Arc::new(context),
            options,
        }
    }

    pub async fn run(self) -> anyhow::Result<RenewSummary> {
        let _lock = RenewalLock::exclusive_lock(self.context.records.directory())
            .await
            .context("Acquiring renewal lock")?;
        let records = self.context.records.load_all().await?;
        info!("Checking {} renewal record(s)", records.len());
        let mut tasks = FuturesUnordered::new();
        for record in records {
            let context = self.context.clone();
            let options = self.options.clone();
            tasks.push(tokio::spawn(async move {
                RenewTask::new(context, options, record).run().await
            }));
        }

        let mut results = Vec::new();
        while let Some(task) = tasks.next().await {
            match task {
                Ok(result) => results.push(result),
                Err(e) => {
                    // A panicked task must not take the whole pass down
                    warn!("Renewal task failed abnormally: {e}");
                    results.push(RenewResult {
                        record_id: String::from("unknown"),
                        status: RenewStatus::Failed,
                        outcome: RenewalOutcome::Unknown,
                        message: Some(format!("renewal task panicked: {e}")),
                    });
                }
            }
        }
        self.context.solvers.shutdown().await;
        results.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(RenewSummary { results })
    }
}

struct RenewTask {
    context: Arc<RenewContext>,
    options: RunOptions,
    record: RenewalRecord,
}

impl RenewTask {
    fn new(context: Arc<RenewContext>, options: RunOptions, record: RenewalRecord) -> Self {
        Self {
            context,
            options,
            record,
        }
    }

    async fn run(mut self) -> RenewResult {
        let record_id = self.record.id.clone();
        let lock = self.context.record_lock(&record_id);
        let _guard = lock.lock().await;

        let now = self.context.clock.now();
        if !self.options.force && !self.record.is_due(now) {
            let until_due = self.record.due_date - now;
            info!(
                "Certificate {} is not due for renewal for {}",
                self.record.target.friendly_name,
                humanize_duration(until_due)
            );
            return RenewResult {
                record_id,
                status: RenewStatus::NotDue,
                outcome: RenewalOutcome::Success,
                message: None,
            };
        }
        self.random_start_delay().await;

        let previous_thumbprint = self.record.last_thumbprint().map(ToString::to_string);
        let outcome = self.renew(previous_thumbprint).await;
        let renewal_outcome = RenewalOutcome::from(&outcome);
        let (status, thumbprints, errors, message) = match &outcome {
            Ok(artifact) => (
                RenewStatus::Renewed,
                vec![artifact.thumbprint.clone()],
                Vec::new(),
                None,
            ),
            Err(e) => {
                warn!("Renewal of {record_id} failed: {e:#}");
                let messages = e.messages();
                (
                    RenewStatus::Failed,
                    Vec::new(),
                    messages.clone(),
                    messages.first().cloned(),
                )
            }
        };
        self.record.target.clear_run_material();
        self.record.record_run(
            self.context.clock.now(),
            renewal_outcome,
            thumbprints,
            errors,
            *self.context.config.scheduler.renewal_period,
        );
        if let Err(e) = self.context.records.save(&self.record).await {
            warn!("Persisting renewal record {record_id} failed: {e:#}");
            return RenewResult {
                record_id,
                status: RenewStatus::Failed,
                outcome: RenewalOutcome::ClientFailure,
                message: Some(format!("saving renewal record failed: {e:#}")),
            };
        }
        RenewResult {
            record_id,
            status,
            outcome: renewal_outcome,
            message,
        }
    }

    /// Spreads unattended runs so a fleet does not stampede the CA.
    async fn random_start_delay(&self) {
        let max_delay = *self.context.config.scheduler.max_random_delay;
        if max_delay.is_zero() {
            return;
        }
        let delay = {
            let mut rng = rand::rng();
            Duration::from_secs(rng.random_range(0..=max_delay.as_secs()))
        };
        debug!("Delaying renewal start by {}", humanize_duration(delay.try_into().unwrap_or_default()));
        self.context.clock.sleep(delay).await;
    }

    async fn renew(
        &mut self,
        previous_thumbprint: Option<String>,
    ) -> IssueResult<CertificateArtifact> {
        let context = &self.context;
        let record = &mut self.record;
        info!(
            "Renewing certificate {} ({})",
            record.target.friendly_name, record.id
        );

        // Resolve the persisted selections first so configuration errors fail
        // fast, before any network traffic.
        let mut authorizers = Vec::new();
        for identifier in record.target.identifiers() {
            let solver = context
                .solvers
                .build(&record.validation)
                .context("Building challenge solver from persisted selection")
                .client_failure()?;
            authorizers.push(Authorizer::new_boxed(identifier, solver));
        }
        let mut stores = Vec::new();
        for name in &record.stores {
            stores.push(context.registry.store(name).client_failure()?);
        }
        let mut installers = Vec::new();
        for name in &record.installers {
            installers.push(context.registry.installer(name).client_failure()?);
        }

        let orchestrator = AuthorizationOrchestrator::try_new(
            context.client.as_ref(),
            context.clock.clone(),
            context.config.authorization_settings(),
            self.options.cancellation.clone(),
        )
        .client_failure()?;
        let authorization = orchestrator
            .authorize_target(&record.target, authorizers)
            .await;
        if let Some(failure) = authorization.first_failure() {
            let identifier = failure.identifier.clone();
            return match &failure.outcome {
                AuthorizationOutcome::TimedOut => {
                    anyhow!("Validation of {identifier} timed out").timed_out()
                }
                AuthorizationOutcome::Aborted => {
                    anyhow!("Renewal aborted while validating {identifier}").client_failure()
                }
                outcome => anyhow!("Authorization of {identifier} failed: {outcome}")
                    .authentication_failure(),
            };
        }

        let issuance_settings: IssuanceSettings = context.config.issuance_settings(&record.csr);
        let layout = ArtifactLayout::new(
            context.config.directories.artifact_dir.join(&record.id),
            &record.target.common_name,
        );
        let pipeline = IssuancePipeline::new(
            context.client.as_ref(),
            context.clock.as_ref(),
            &issuance_settings,
        );
        let artifact = pipeline.issue(&mut record.target, &layout).await?;

        // Install everywhere first; only afterwards may the previous
        // certificate disappear (never delete-before-replace).
        for store in &stores {
            store
                .install(&record.target, &artifact)
                .await
                .context(format!("Installing certificate into store {}", store.name()))
                .client_failure()?;
        }
        for installer in &installers {
            installer
                .install(&record.target, &artifact)
                .await
                .context(format!("Running installation step {}", installer.name()))
                .client_failure()?;
        }
        if !record.keep_existing {
            if let Some(old_thumbprint) = previous_thumbprint {
                if old_thumbprint != artifact.thumbprint {
                    for store in &stores {
                        if let Err(e) = store.remove(&old_thumbprint).await {
                            warn!(
                                "Removing previous certificate {old_thumbprint} from store {} failed: {e:#}",
                                store.name()
                            );
                        }
                    }
                }
            }
        }
        Ok(artifact)
    }
}
