//! Unattended certificate authorization, issuance and renewal.
//!
//! certmill proves ownership of domain identifiers against a certificate
//! authority through interchangeable proof-publishing strategies, turns
//! authorized targets into signed certificates with a full on-disk artifact
//! set, and re-runs the whole sequence on a due-date schedule while keeping
//! per-run history.
//!
//! The ACME wire protocol itself (directory discovery, JWS signing, account
//! registration) is not implemented here; a conforming client library plugs
//! in behind [`acme::AcmeClient`]. Certificate stores and web-server
//! installation steps are likewise collaborators behind the traits in
//! [`store`].

pub mod acme;
pub mod artifacts;
pub mod authorize;
pub mod cert;
pub mod clock;
pub mod cmd_runner;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod issue;
pub mod scheduler;
pub mod solver;
pub mod state;
pub mod store;
pub mod target;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

pub use acme::{AcmeClient, Identifier};
pub use authorize::{AuthorizationOrchestrator, AuthorizationOutcome, Authorizer};
pub use issue::{CertificateArtifact, IssuancePipeline};
pub use scheduler::{RenewContext, RenewService, RunOptions};
pub use target::{Target, TargetPart};
