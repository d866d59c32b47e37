//! Pluggable ownership-proof strategies.
//!
//! A solver publishes the proof for exactly one identifier's challenge and
//! removes it again afterwards. Deployment must be idempotent against a
//! previous partial failure; full cleanup consumes the solver so it can run at
//! most once. The orchestrator decides *when* cleanup runs (see the
//! clean-only-valid policy there); strategies holding live resources get a
//! best-effort [`ChallengeSolver::on_failure`] hook for the invalid path.

use crate::acme::object::{ChallengeKind, Identifier, InnerChallenge};
use crate::solver::dns::{
    DnsApiSolver, DnsApiSolverConfiguration, DnsScriptSolver, DnsScriptSolverConfiguration,
};
use crate::solver::remote::{RemoteWebrootSolver, RemoteWebrootSolverConfiguration};
use crate::solver::standalone::{
    HttpChallengeServer, SelfHostedSolver, SelfHostedSolverConfiguration,
};
use crate::solver::tls::{
    EphemeralTlsSolver, EphemeralTlsSolverConfiguration, MemoryCertificateSink, TlsCertificateSink,
};
use crate::solver::webroot::{WebrootSolver, WebrootSolverConfiguration};
use anyhow::Error;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub mod dns;
pub mod remote;
pub mod standalone;
pub mod tls;
pub mod webroot;

#[async_trait]
pub trait ChallengeSolver: Send {
    fn long_name(&self) -> &'static str;
    fn short_name(&self) -> &'static str;
    fn supports_challenge(&self, challenge: &InnerChallenge) -> bool;
    /// The challenge kind this solver wants the orchestrator to request.
    fn preferred_kind(&self) -> ChallengeKind;
    /// Publishes the proof. Republishing an existing proof is not an error.
    async fn deploy_challenge(
        &mut self,
        identifier: &Identifier,
        challenge: InnerChallenge,
    ) -> Result<(), Error>;
    /// Best-effort teardown when the authorization ended `Invalid`. The default
    /// leaves everything in place for operator inspection; strategies holding
    /// ports or process memory override this to release them.
    async fn on_failure(&mut self) -> Result<(), Error> {
        Ok(())
    }
    /// Removes the proof. Consumes the solver, so it cannot run twice.
    async fn cleanup_challenge(self: Box<Self>) -> Result<(), Error>;
}

/// The persisted strategy selection of a renewal record. Opaque to the
/// scheduler; only [`SolverFactory::build`] interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SolverConfiguration {
    Null(NullSolverConfiguration),
    Webroot(WebrootSolverConfiguration),
    RemoteWebroot(RemoteWebrootSolverConfiguration),
    SelfHosted(SelfHostedSolverConfiguration),
    EphemeralTls(EphemeralTlsSolverConfiguration),
    DnsScript(DnsScriptSolverConfiguration),
    DnsApi(DnsApiSolverConfiguration),
}

/// Builds solver instances from persisted configuration.
///
/// One factory lives per renewal run: self-hosted listeners are shared per
/// port across every identifier answered concurrently, and the TLS sink is
/// shared so an embedding TLS server sees all ephemeral certificates.
pub struct SolverFactory {
    listeners: Mutex<HashMap<u16, Arc<HttpChallengeServer>>>,
    tls_sink: Arc<dyn TlsCertificateSink>,
}

impl SolverFactory {
    pub fn new() -> Self {
        Self::with_tls_sink(Arc::new(MemoryCertificateSink::default()))
    }

    pub fn with_tls_sink(tls_sink: Arc<dyn TlsCertificateSink>) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            tls_sink,
        }
    }

    fn listener(&self, port: u16) -> Arc<HttpChallengeServer> {
        let mut listeners = self.listeners.lock();
        listeners
            .entry(port)
            .or_insert_with(|| HttpChallengeServer::new(port))
            .clone()
    }

    /// Instantiates a solver for one identifier. Configuration problems
    /// (missing credentials, unsupported URL schemes) surface here, before any
    /// network traffic.
    pub fn build(&self, config: &SolverConfiguration) -> anyhow::Result<Box<dyn ChallengeSolver>> {
        Ok(match config {
            SolverConfiguration::Null(config) => NullSolver::from_config(config.clone()),
            SolverConfiguration::Webroot(config) => WebrootSolver::from_config(config.clone())?,
            SolverConfiguration::RemoteWebroot(config) => {
                RemoteWebrootSolver::from_config(config.clone())?
            }
            SolverConfiguration::SelfHosted(config) => {
                SelfHostedSolver::new(self.listener(config.port))
            }
            SolverConfiguration::EphemeralTls(config) => {
                EphemeralTlsSolver::from_config(config.clone(), self.tls_sink.clone())
            }
            SolverConfiguration::DnsScript(config) => DnsScriptSolver::from_config(config.clone()),
            SolverConfiguration::DnsApi(config) => DnsApiSolver::try_from_config(config.clone())?,
        })
    }

    /// Stops any listeners still running. Called at the end of a renewal pass.
    pub async fn shutdown(&self) {
        let listeners: Vec<_> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener.shutdown().await;
        }
    }
}

impl Default for SolverFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullSolverConfiguration {}

/// Solver that does not publish anything. Usable when the account is already
/// authorized out-of-band; will cause validation failures otherwise.
#[derive(Debug, Default, Clone)]
pub struct NullSolver {}

impl NullSolver {
    pub fn from_config(_config: NullSolverConfiguration) -> Box<Self> {
        Box::new(NullSolver {})
    }
}

#[async_trait]
impl ChallengeSolver for NullSolver {
    fn long_name(&self) -> &'static str {
        "null solver"
    }

    fn short_name(&self) -> &'static str {
        "null"
    }

    fn supports_challenge(&self, _challenge: &InnerChallenge) -> bool {
        true
    }

    fn preferred_kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn deploy_challenge(
        &mut self,
        _identifier: &Identifier,
        _challenge: InnerChallenge,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn cleanup_challenge(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}
