//! The per-identifier authorization state machine:
//! `Requested → Prepared → Submitted → Pending ⇄ poll → Valid | Invalid`.
//!
//! Failures never unwind across identifiers: every identifier of a target is
//! driven to a terminal outcome so one run surfaces all problems at once, and
//! the target-level verdict is computed afterwards.

use crate::acme::object::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, Identifier, InnerChallenge,
};
use crate::acme::AcmeClient;
use crate::clock::Clock;
use crate::dns::resolver::{PropagationSettings, Resolver};
use crate::solver::ChallengeSolver;
use crate::target::Target;
use anyhow::Context;
use futures::StreamExt;
use futures::stream;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Challenge-status polling cadence. The total wall-clock budget is
/// `interval × max_attempts`; exhausting it is a [`AuthorizationOutcome::TimedOut`],
/// never a hang and never conflated with a CA rejection.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationSettings {
    pub poll: PollSettings,
    pub propagation: PropagationSettings,
    /// How many identifiers of one target are authorized concurrently.
    pub batch_size: usize,
    /// Fetch the HTTP proof once before submitting, tolerating failures.
    pub warm_up: bool,
    /// Leave proofs in place even after successful validation.
    pub disable_cleanup: bool,
}

impl Default for AuthorizationSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            propagation: PropagationSettings::default(),
            batch_size: 4,
            warm_up: true,
            disable_cleanup: false,
        }
    }
}

/// One identifier paired with the solver that will prove it.
pub struct Authorizer {
    pub identifier: Identifier,
    pub solver: Box<dyn ChallengeSolver>,
}

impl Authorizer {
    pub fn new<S: ChallengeSolver + 'static>(identifier: Identifier, solver: S) -> Self {
        Self {
            identifier,
            solver: Box::new(solver),
        }
    }

    pub fn new_boxed(identifier: Identifier, solver: Box<dyn ChallengeSolver>) -> Self {
        Self { identifier, solver }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Valid,
    /// The CA rejected the proof, or a local step failed. Carries a
    /// human-readable reason for the renewal history.
    Invalid {
        reason: String,
    },
    /// The bounded poll loop ran out of attempts while the CA still reported
    /// the authorization as pending.
    TimedOut,
    /// The run was cancelled while this identifier was in flight.
    Aborted,
}

impl AuthorizationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, AuthorizationOutcome::Valid)
    }
}

impl Display for AuthorizationOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorizationOutcome::Valid => f.write_str("valid"),
            AuthorizationOutcome::Invalid { reason } => write!(f, "invalid: {reason}"),
            AuthorizationOutcome::TimedOut => f.write_str("timed out waiting for validation"),
            AuthorizationOutcome::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationResult {
    pub identifier: Identifier,
    pub outcome: AuthorizationOutcome,
}

impl AuthorizationResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_valid()
    }
}

/// Per-identifier results of one target authorization, in the order the
/// target's identifier union iterates.
#[derive(Debug, Clone)]
pub struct TargetAuthorization {
    results: Vec<AuthorizationResult>,
}

impl TargetAuthorization {
    pub fn results(&self) -> &[AuthorizationResult] {
        &self.results
    }

    /// A target is authorized only when every identifier across every part is
    /// valid.
    pub fn is_valid(&self) -> bool {
        self.results.iter().all(AuthorizationResult::is_valid)
    }

    /// The first non-valid result in input order, if any. This is the
    /// target-level verdict for failed authorizations.
    pub fn first_failure(&self) -> Option<&AuthorizationResult> {
        self.results.iter().find(|result| !result.is_valid())
    }
}

enum PollVerdict {
    Valid,
    Invalid(String),
    TimedOut,
    Aborted,
}

pub struct AuthorizationOrchestrator<'a> {
    client: &'a dyn AcmeClient,
    clock: Arc<dyn Clock>,
    settings: AuthorizationSettings,
    cancellation: CancellationToken,
    http: reqwest::Client,
    resolver: OnceLock<Resolver>,
}

impl<'a> AuthorizationOrchestrator<'a> {
    pub fn try_new(
        client: &'a dyn AcmeClient,
        clock: Arc<dyn Clock>,
        settings: AuthorizationSettings,
        cancellation: CancellationToken,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::CRATE_NAME)
            .timeout(Duration::from_secs(10))
            .build()
            .context("Building HTTP client for resource warm-up failed")?;
        Ok(Self {
            client,
            clock,
            settings,
            cancellation,
            http,
            resolver: OnceLock::new(),
        })
    }

    /// Authorizes every identifier of the target, one authorizer per
    /// identifier, with bounded parallelism. Results are reported in input
    /// order regardless of completion order.
    pub async fn authorize_target(
        &self,
        target: &Target,
        authorizers: Vec<Authorizer>,
    ) -> TargetAuthorization {
        let names = target
            .identifiers()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            "Authorizing {} ({names})",
            target.friendly_name
        );
        let batch_size = self.settings.batch_size.max(1);
        let mut results: Vec<(usize, AuthorizationResult)> =
            stream::iter(authorizers.into_iter().enumerate())
                .map(|(index, authorizer)| async move {
                    (index, self.authorize_identifier(authorizer).await)
                })
                .buffer_unordered(batch_size)
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);
        TargetAuthorization {
            results: results.into_iter().map(|(_, result)| result).collect(),
        }
    }

    /// Drives one identifier to a terminal outcome. Never returns an error:
    /// whatever goes wrong becomes part of the result so the remaining
    /// identifiers still get their turn.
    pub async fn authorize_identifier(&self, authorizer: Authorizer) -> AuthorizationResult {
        let Authorizer { identifier, solver } = authorizer;
        let outcome = self.drive(&identifier, solver).await;
        match &outcome {
            AuthorizationOutcome::Valid => info!("Successfully authorized {identifier}"),
            other => warn!("Authorization of {identifier} failed: {other}"),
        }
        AuthorizationResult {
            identifier,
            outcome,
        }
    }

    async fn drive(
        &self,
        identifier: &Identifier,
        mut solver: Box<dyn ChallengeSolver>,
    ) -> AuthorizationOutcome {
        let solver_name = solver.long_name();
        let kind = solver.preferred_kind();
        let challenge = match self.client.request_challenge(identifier, kind).await {
            Ok(challenge) => challenge,
            Err(e) => {
                return AuthorizationOutcome::Invalid {
                    reason: format!("Requesting {kind} challenge failed: {e}"),
                };
            }
        };
        if !solver.supports_challenge(&challenge.inner) {
            // Configuration problem, surfaced before anything was deployed
            return AuthorizationOutcome::Invalid {
                reason: format!(
                    "{solver_name} cannot solve the {} challenge the CA offered",
                    challenge.inner.get_type()
                ),
            };
        }
        if challenge.status == ChallengeStatus::Valid {
            debug!("Challenge for {identifier} is already valid, nothing to prove");
            return AuthorizationOutcome::Valid;
        }

        if let Err(e) = solver
            .deploy_challenge(identifier, challenge.inner.clone())
            .await
        {
            self.run_failure_hook(&mut solver, identifier).await;
            return AuthorizationOutcome::Invalid {
                reason: format!("Setting up {solver_name} for {identifier} failed: {e:#}"),
            };
        }
        debug!("{solver_name} reported successful challenge deployment for {identifier}");

        self.warm_up(identifier, &challenge).await;
        self.await_propagation(identifier, &challenge).await;

        if let Err(e) = self.client.submit_answer(&challenge).await {
            self.run_failure_hook(&mut solver, identifier).await;
            return AuthorizationOutcome::Invalid {
                reason: format!("Submitting challenge answer for {identifier} failed: {e}"),
            };
        }

        match self.poll(identifier, &challenge).await {
            PollVerdict::Valid => {
                if self.settings.disable_cleanup {
                    debug!("Cleanup disabled, leaving proof for {identifier} in place");
                } else if let Err(e) = solver.cleanup_challenge().await {
                    warn!("{solver_name} for {identifier} encountered an error during cleanup: {e:#}");
                }
                AuthorizationOutcome::Valid
            }
            PollVerdict::Invalid(reason) => {
                // Deliberate policy: the proof artifact stays where it is so an
                // operator can inspect why the CA could not see it. The failure
                // hook only releases live resources (ports, process memory).
                warn!("The CA could not validate {identifier}: {reason}");
                self.run_failure_hook(&mut solver, identifier).await;
                AuthorizationOutcome::Invalid { reason }
            }
            PollVerdict::TimedOut => {
                warn!(
                    "Validation of {identifier} did not reach a terminal state within {} attempts",
                    self.settings.poll.max_attempts
                );
                self.run_failure_hook(&mut solver, identifier).await;
                AuthorizationOutcome::TimedOut
            }
            PollVerdict::Aborted => {
                // The abort path still removes proofs that were already
                // deployed, so a cancelled run leaves nothing behind.
                if let Err(e) = solver.cleanup_challenge().await {
                    warn!("{solver_name} cleanup after abort failed: {e:#}");
                }
                AuthorizationOutcome::Aborted
            }
        }
    }

    /// Polls the authorization until it leaves `Pending`, the attempt cap is
    /// reached, or the run is cancelled. A pending response never replaces an
    /// already-observed terminal snapshot.
    async fn poll(&self, identifier: &Identifier, challenge: &Challenge) -> PollVerdict {
        let poll = self.settings.poll;
        let mut terminal: Option<Authorization> = None;
        for attempt in 1..=poll.max_attempts {
            if self.cancellation.is_cancelled() {
                return PollVerdict::Aborted;
            }
            match self.client.poll_authorization(challenge).await {
                Ok(update) if update.status.is_terminal() => {
                    terminal = Some(update);
                }
                Ok(_) => {
                    debug!("Authorization for {identifier} still pending (attempt {attempt})");
                }
                Err(e) => {
                    // Transient poll errors are retried here and nowhere else
                    debug!("Polling authorization for {identifier} failed (attempt {attempt}): {e}");
                }
            }
            if let Some(update) = &terminal {
                return match update.status {
                    AuthorizationStatus::Valid => PollVerdict::Valid,
                    AuthorizationStatus::Pending => {
                        unreachable!("pending responses never become the terminal snapshot")
                    }
                    status => {
                        let reason = update
                            .error
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| format!("authorization is {status}"));
                        PollVerdict::Invalid(reason)
                    }
                };
            }
            if attempt < poll.max_attempts {
                tokio::select! {
                    () = self.clock.sleep(poll.interval) => {}
                    () = self.cancellation.cancelled() => return PollVerdict::Aborted,
                }
            }
        }
        PollVerdict::TimedOut
    }

    /// Fetches the HTTP proof once so slow backends have it cached before the
    /// CA looks. Failures are logged and ignored.
    async fn warm_up(&self, identifier: &Identifier, challenge: &Challenge) {
        if !self.settings.warm_up {
            return;
        }
        let InnerChallenge::Http(http_challenge) = &challenge.inner else {
            return;
        };
        let url = format!("http://{identifier}/{}", http_challenge.resource_path());
        match self.http.get(&url).send().await {
            Ok(response) => {
                debug!("Warm-up fetch of {url} returned {}", response.status());
            }
            Err(e) => {
                debug!("Warm-up fetch of {url} failed (non-fatal): {e}");
            }
        }
    }

    /// Waits for DNS proofs to be observable before the answer is submitted.
    /// Blocks only the identifier being validated, and a record that never
    /// shows up is submitted anyway; the CA's resolvers may see more than ours.
    async fn await_propagation(&self, identifier: &Identifier, challenge: &Challenge) {
        let InnerChallenge::Dns(dns_challenge) = &challenge.inner else {
            return;
        };
        let record_name = match crate::acme::object::DnsChallenge::record_name(identifier) {
            Ok(record_name) => record_name,
            Err(e) => {
                warn!("Cannot derive record name for {identifier}: {e:#}");
                return;
            }
        };
        let resolver = self.resolver.get_or_init(Resolver::new);
        let visible = resolver
            .wait_for_txt(
                self.clock.as_ref(),
                &record_name,
                &dns_challenge.record_value,
                self.settings.propagation,
            )
            .await;
        if !visible {
            warn!(
                "TXT record {record_name} not observable after propagation wait, submitting anyway"
            );
        }
    }

    async fn run_failure_hook(&self, solver: &mut Box<dyn ChallengeSolver>, identifier: &Identifier) {
        if let Err(e) = solver.on_failure().await {
            warn!(
                "{} failure hook for {identifier} reported an error: {e:#}",
                solver.long_name()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::error::{Problem, ProtocolResult};
    use crate::acme::object::{
        ChallengeKind, DownloadedCertificate, HttpChallenge, OrderHandle, OrderStatus, Token,
    };
    use crate::clock::testing::ManualClock;
    use crate::target::TargetPart;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;
    use url::Url;

    /// CA double with a scripted poll sequence per identifier. An exhausted
    /// script keeps answering `Pending`.
    #[derive(Default)]
    struct ScriptedCa {
        scripts: Mutex<HashMap<String, VecDeque<Authorization>>>,
        challenge_kind: Option<ChallengeKind>,
        submitted: Mutex<Vec<String>>,
    }

    impl ScriptedCa {
        fn script(&self, identifier: &str, statuses: Vec<Authorization>) {
            self.scripts
                .lock()
                .insert(identifier.to_string(), statuses.into());
        }

        fn valid(&self, identifier: &str) {
            self.script(
                identifier,
                vec![Authorization {
                    status: AuthorizationStatus::Valid,
                    error: None,
                }],
            );
        }

        fn invalid(&self, identifier: &str, reason: &str) {
            self.script(
                identifier,
                vec![Authorization {
                    status: AuthorizationStatus::Invalid,
                    error: Some(Problem::new("urn:ietf:params:acme:error:unauthorized", reason)),
                }],
            );
        }
    }

    #[async_trait]
    impl AcmeClient for ScriptedCa {
        async fn request_challenge(
            &self,
            identifier: &Identifier,
            kind: ChallengeKind,
        ) -> ProtocolResult<Challenge> {
            let kind = self.challenge_kind.unwrap_or(kind);
            let token = Token::from_str(&format!("tok-{identifier}")).unwrap();
            let inner = match kind {
                ChallengeKind::Http01 => InnerChallenge::Http(HttpChallenge {
                    token,
                    key_authorization: format!("tok-{identifier}.thumb"),
                }),
                ChallengeKind::Dns01 => InnerChallenge::Dns(crate::acme::object::DnsChallenge {
                    token,
                    record_value: "digest".to_string(),
                }),
                ChallengeKind::TlsAlpn01 => InnerChallenge::Tls(crate::acme::object::TlsChallenge {
                    token,
                    key_authorization: format!("tok-{identifier}.thumb"),
                    iterations: 1,
                }),
            };
            Ok(Challenge {
                url: Url::parse(&format!("https://ca.invalid/challenge/{identifier}")).unwrap(),
                status: ChallengeStatus::Pending,
                error: None,
                inner,
            })
        }

        async fn submit_answer(&self, challenge: &Challenge) -> ProtocolResult<()> {
            self.submitted.lock().push(challenge.url.to_string());
            Ok(())
        }

        async fn poll_authorization(&self, challenge: &Challenge) -> ProtocolResult<Authorization> {
            let identifier = challenge
                .url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap()
                .to_string();
            let mut scripts = self.scripts.lock();
            let next = scripts
                .get_mut(&identifier)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Authorization {
                    status: AuthorizationStatus::Pending,
                    error: None,
                });
            Ok(next)
        }

        async fn submit_csr(
            &self,
            _identifiers: &[Identifier],
            _csr_der: &[u8],
        ) -> ProtocolResult<OrderHandle> {
            unimplemented!("not used by authorization tests")
        }

        async fn poll_order(&self, _order: &OrderHandle) -> ProtocolResult<OrderStatus> {
            unimplemented!("not used by authorization tests")
        }

        async fn download_certificate(
            &self,
            _order: &OrderHandle,
        ) -> ProtocolResult<DownloadedCertificate> {
            unimplemented!("not used by authorization tests")
        }

        async fn download_issuer(&self, _url: &Url) -> ProtocolResult<Vec<u8>> {
            unimplemented!("not used by authorization tests")
        }
    }

    #[derive(Clone, Default)]
    struct CountingSolver {
        deploys: Arc<AtomicUsize>,
        cleanups: Arc<AtomicUsize>,
        failure_hooks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChallengeSolver for CountingSolver {
        fn long_name(&self) -> &'static str {
            "counting solver"
        }

        fn short_name(&self) -> &'static str {
            "counting"
        }

        fn supports_challenge(&self, challenge: &InnerChallenge) -> bool {
            matches!(challenge, InnerChallenge::Http(_))
        }

        fn preferred_kind(&self) -> ChallengeKind {
            ChallengeKind::Http01
        }

        async fn deploy_challenge(
            &mut self,
            _identifier: &Identifier,
            _challenge: InnerChallenge,
        ) -> Result<(), anyhow::Error> {
            self.deploys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_failure(&mut self) -> Result<(), anyhow::Error> {
            self.failure_hooks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cleanup_challenge(self: Box<Self>) -> Result<(), anyhow::Error> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_settings() -> AuthorizationSettings {
        AuthorizationSettings {
            poll: PollSettings {
                interval: Duration::from_secs(4),
                max_attempts: 5,
            },
            propagation: PropagationSettings {
                interval: Duration::from_millis(1),
                max_attempts: 1,
            },
            batch_size: 1,
            warm_up: false,
            disable_cleanup: false,
        }
    }

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(datetime!(2026-01-15 12:00:00 UTC)))
    }

    fn target(identifiers: &[&str]) -> Target {
        let ids: Vec<Identifier> = identifiers
            .iter()
            .map(|raw| Identifier::from_str(raw).unwrap())
            .collect();
        Target::new("test target", ids[0].clone(), vec![TargetPart::new(ids)]).unwrap()
    }

    fn authorizers(identifiers: &[&str], solver: &CountingSolver) -> Vec<Authorizer> {
        identifiers
            .iter()
            .map(|raw| Authorizer::new(Identifier::from_str(raw).unwrap(), solver.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_all_valid_identifiers_authorize_target() {
        let ca = ScriptedCa::default();
        ca.valid("one.example");
        ca.valid("two.example");
        let clock = test_clock();
        let orchestrator = AuthorizationOrchestrator::try_new(
            &ca,
            clock,
            test_settings(),
            CancellationToken::new(),
        )
        .unwrap();
        let solver = CountingSolver::default();

        let authorization = orchestrator
            .authorize_target(
                &target(&["one.example", "two.example"]),
                authorizers(&["one.example", "two.example"], &solver),
            )
            .await;

        assert!(authorization.is_valid());
        assert!(authorization.first_failure().is_none());
        assert_eq!(solver.deploys.load(Ordering::SeqCst), 2);
        assert_eq!(solver.cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(solver.failure_hooks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_invalid_result_is_the_target_verdict() {
        let ca = ScriptedCa::default();
        ca.valid("one.example");
        ca.invalid("two.example", "unreachable resource");
        let clock = test_clock();
        let orchestrator = AuthorizationOrchestrator::try_new(
            &ca,
            clock,
            test_settings(),
            CancellationToken::new(),
        )
        .unwrap();
        let solver = CountingSolver::default();

        let authorization = orchestrator
            .authorize_target(
                &target(&["one.example", "two.example"]),
                authorizers(&["one.example", "two.example"], &solver),
            )
            .await;

        assert!(!authorization.is_valid());
        let failure = authorization.first_failure().unwrap();
        assert_eq!(failure.identifier.to_string(), "two.example");
        assert!(
            matches!(&failure.outcome, AuthorizationOutcome::Invalid { reason } if reason.contains("unreachable resource"))
        );
        // Only the valid identifier's proof is cleaned up; the invalid one is
        // left for inspection, but its failure hook ran.
        assert_eq!(solver.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(solver.failure_hooks.load(Ordering::SeqCst), 1);
        // Both identifiers were still processed
        assert_eq!(solver.deploys.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pending_responses_do_not_overwrite_terminal_state() {
        let ca = ScriptedCa::default();
        let pending = Authorization {
            status: AuthorizationStatus::Pending,
            error: None,
        };
        ca.script(
            "slow.example",
            vec![
                pending.clone(),
                pending.clone(),
                pending,
                Authorization {
                    status: AuthorizationStatus::Valid,
                    error: None,
                },
            ],
        );
        let clock = test_clock();
        let orchestrator = AuthorizationOrchestrator::try_new(
            &ca,
            clock.clone(),
            test_settings(),
            CancellationToken::new(),
        )
        .unwrap();
        let solver = CountingSolver::default();

        let result = orchestrator
            .authorize_identifier(Authorizer::new(
                Identifier::from_str("slow.example").unwrap(),
                solver.clone(),
            ))
            .await;

        assert_eq!(result.outcome, AuthorizationOutcome::Valid);
        // Three pending polls before the terminal one, each separated by a sleep
        assert_eq!(clock.sleep_count(), 3);
        assert_eq!(solver.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_poll_budget_is_a_timeout_not_a_rejection() {
        let ca = ScriptedCa::default();
        // No script: every poll answers pending
        let clock = test_clock();
        let settings = test_settings();
        let max_attempts = settings.poll.max_attempts;
        let orchestrator = AuthorizationOrchestrator::try_new(
            &ca,
            clock.clone(),
            settings,
            CancellationToken::new(),
        )
        .unwrap();
        let solver = CountingSolver::default();

        let result = orchestrator
            .authorize_identifier(Authorizer::new(
                Identifier::from_str("stuck.example").unwrap(),
                solver.clone(),
            ))
            .await;

        assert_eq!(result.outcome, AuthorizationOutcome::TimedOut);
        assert_eq!(clock.sleep_count() as u32, max_attempts - 1);
        // Timed-out proofs stay in place like invalid ones
        assert_eq!(solver.cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(solver.failure_hooks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_still_cleans_up_deployed_proofs() {
        let ca = ScriptedCa::default();
        let clock = test_clock();
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let orchestrator =
            AuthorizationOrchestrator::try_new(&ca, clock, test_settings(), cancellation).unwrap();
        let solver = CountingSolver::default();

        let result = orchestrator
            .authorize_identifier(Authorizer::new(
                Identifier::from_str("aborted.example").unwrap(),
                solver.clone(),
            ))
            .await;

        assert_eq!(result.outcome, AuthorizationOutcome::Aborted);
        assert_eq!(solver.deploys.load(Ordering::SeqCst), 1);
        assert_eq!(solver.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_challenge_fails_before_deployment() {
        let ca = ScriptedCa {
            challenge_kind: Some(ChallengeKind::Dns01),
            ..ScriptedCa::default()
        };
        let clock = test_clock();
        let orchestrator = AuthorizationOrchestrator::try_new(
            &ca,
            clock,
            test_settings(),
            CancellationToken::new(),
        )
        .unwrap();
        let solver = CountingSolver::default();

        let result = orchestrator
            .authorize_identifier(Authorizer::new(
                Identifier::from_str("misconfigured.example").unwrap(),
                solver.clone(),
            ))
            .await;

        assert!(
            matches!(&result.outcome, AuthorizationOutcome::Invalid { reason } if reason.contains("cannot solve"))
        );
        assert_eq!(solver.deploys.load(Ordering::SeqCst), 0);
        assert_eq!(solver.cleanups.load(Ordering::SeqCst), 0);
    }
}
