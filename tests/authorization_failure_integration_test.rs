mod common;

use certmill::acme::object::Identifier;
use certmill::config::Configuration;
use certmill::scheduler::{RenewContext, RenewService, RenewStatus, RunOptions};
use certmill::solver::webroot::WebrootSolverConfiguration;
use certmill::solver::{SolverConfiguration, SolverFactory};
use certmill::state::RecordStore;
use certmill::state::types::{CsrSelection, RenewalOutcome, RenewalRecord};
use certmill::store::CollaboratorRegistry;
use certmill::target::{Target, TargetPart};
use common::{FakeCa, RecordingStore};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// One identifier validates, the other is refused by the CA. The target must
/// fail as a whole, the valid identifier's proof is cleaned up, the refused
/// identifier's proof is left behind for inspection, and nothing is installed.
#[test_log::test(tokio::test)]
async fn test_partial_authorization_failure_fails_target_without_install() {
    let root = tempfile::tempdir().unwrap();
    let webroot = root.path().join("webroot");
    let mut config = Configuration::default();
    config.directories.state_dir = root.path().join("state");
    config.directories.artifact_dir = root.path().join("certificates");
    config.authorization.poll_interval = Duration::from_millis(10).into();
    config.authorization.warm_up = false;

    let fake_ca = Arc::new(FakeCa::new());
    fake_ca.refuse("two.example");

    let identifiers: Vec<Identifier> = ["one.example", "two.example"]
        .iter()
        .map(|raw| Identifier::from_str(raw).unwrap())
        .collect();
    let target = Target::new(
        "split cert",
        identifiers[0].clone(),
        vec![TargetPart::new(identifiers)],
    )
    .unwrap();
    let mut record = RenewalRecord::new(
        "split-cert",
        target,
        SolverConfiguration::Webroot(WebrootSolverConfiguration {
            webroot: webroot.to_string_lossy().into_owned(),
            write_web_config: false,
        }),
        CsrSelection::default(),
        OffsetDateTime::now_utc(),
    );
    record.stores.push("recording".to_string());
    let records = RecordStore::new(root.path().join("state"));
    records.save(&record).await.unwrap();

    let (store, events) = RecordingStore::new();
    let mut registry = CollaboratorRegistry::new();
    registry.register_store(store);
    let context = RenewContext::new(
        fake_ca.clone(),
        Arc::new(certmill::clock::SystemClock),
        records.clone(),
        registry,
        SolverFactory::new(),
        config,
    );

    let summary = RenewService::new(context, RunOptions::default())
        .run()
        .await
        .unwrap();

    // The failed record makes the whole run exit non-zero
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.results[0].status, RenewStatus::Failed);
    assert_eq!(
        summary.results[0].outcome,
        RenewalOutcome::AuthorizationFailure
    );

    // The failure names the refused identifier
    let saved = records.load("split-cert").await.unwrap();
    assert_eq!(saved.history.len(), 1);
    let entry = &saved.history[0];
    assert!(!entry.success);
    assert_eq!(entry.outcome, RenewalOutcome::AuthorizationFailure);
    assert!(
        entry
            .error_messages
            .iter()
            .any(|message| message.contains("two.example")),
        "{:?}",
        entry.error_messages
    );

    // The failed run must not move the due date; the next pass retries
    assert!(saved.is_due(OffsetDateTime::now_utc()));

    // No certificate was installed or removed
    assert!(events.lock().is_empty());

    // The valid identifier's proof was cleaned up; the refused identifier's
    // proof deliberately stays behind for operator inspection
    let challenge_dir = webroot.join(".well-known/acme-challenge");
    assert!(!challenge_dir.join("tok-one.example").exists());
    assert!(challenge_dir.join("tok-two.example").exists());
}
