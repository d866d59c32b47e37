use crate::crypto::KeyType;
use crate::error::{IssueError, IssueResult};
use crate::solver::SolverConfiguration;
use crate::target::Target;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// CSR-related selection persisted per renewal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrSelection {
    pub key_type: KeyType,
}

/// Outcome classification of one renewal run, derived from [`IssueResult`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RenewalOutcome {
    Success,
    RateLimit,
    AuthorizationFailure,
    CAFailure,
    ClientFailure,
    Timeout,
    Unknown,
}

impl<T> From<&IssueResult<T>> for RenewalOutcome {
    fn from(value: &IssueResult<T>) -> Self {
        match value {
            Ok(_) => RenewalOutcome::Success,
            Err(IssueError::RateLimited(_)) => RenewalOutcome::RateLimit,
            Err(IssueError::AuthFailure(_)) => RenewalOutcome::AuthorizationFailure,
            Err(IssueError::CAFailure(_)) => RenewalOutcome::CAFailure,
            Err(IssueError::ClientFailure(_)) => RenewalOutcome::ClientFailure,
            Err(IssueError::TimedOut(_)) => RenewalOutcome::Timeout,
        }
    }
}

/// One issuance attempt in a record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub success: bool,
    pub outcome: RenewalOutcome,
    /// Thumbprints reported for this run, de-duplicated (store plugins may
    /// report the same thumbprint more than once).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thumbprints: Vec<String>,
    /// De-duplicated error messages of a failed run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
}

/// Everything needed to re-run one certificate's issuance unattended: the
/// chosen target, validation, CSR and store/installation selections, plus the
/// accumulated history and the computed due date.
///
/// History is append-only; records are never deleted by this core (that is a
/// user-facing management action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalRecord {
    pub id: String,
    pub target: Target,
    pub validation: SolverConfiguration,
    pub csr: CsrSelection,
    /// Names of the certificate stores to install into. Opaque to this core.
    #[serde(default)]
    pub stores: Vec<String>,
    /// Names of the installation steps to run. Opaque to this core.
    #[serde(default)]
    pub installers: Vec<String>,
    /// When false, the previously active certificate is removed from stores
    /// once the new one is confirmed installed.
    #[serde(default = "default_keep_existing")]
    pub keep_existing: bool,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub due_date: OffsetDateTime,
}

fn default_keep_existing() -> bool {
    true
}

impl RenewalRecord {
    /// A fresh record is due immediately; its first run creates the history.
    pub fn new(
        id: impl Into<String>,
        target: Target,
        validation: SolverConfiguration,
        csr: CsrSelection,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            validation,
            csr,
            stores: Vec::new(),
            installers: Vec::new(),
            keep_existing: true,
            history: Vec::new(),
            due_date: now,
        }
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        now >= self.due_date
    }

    /// The thumbprint of the most recent successful run, i.e. the certificate
    /// assumed to be active before the current run.
    pub fn last_thumbprint(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.success)
            .and_then(|entry| entry.thumbprints.first())
            .map(String::as_str)
    }

    /// Appends the outcome of one run. On success the due date moves to
    /// `now + renewal_period`; on failure it stays put so the next pass
    /// retries instead of going quiet for a whole period.
    pub fn record_run(
        &mut self,
        now: OffsetDateTime,
        outcome: RenewalOutcome,
        thumbprints: Vec<String>,
        error_messages: Vec<String>,
        renewal_period: Duration,
    ) {
        let success = outcome == RenewalOutcome::Success;
        self.history.push(HistoryEntry {
            timestamp: now,
            success,
            outcome,
            thumbprints: thumbprints.into_iter().unique().collect(),
            error_messages: error_messages.into_iter().unique().collect(),
        });
        if success {
            self.due_date = now + renewal_period;
        }
    }
}
