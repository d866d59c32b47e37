//! Boundary to the certificate authority.
//!
//! This core deliberately does not speak the ACME wire protocol itself: directory
//! discovery, nonce handling, JWS signing and account management are the job of a
//! conforming client library, which plugs in behind [`AcmeClient`]. Everything the
//! authorization orchestrator and the issuance pipeline need from the CA is
//! expressed through that trait and the value objects in [`object`].

use async_trait::async_trait;
use url::Url;

pub mod error;
pub mod object;

pub use error::{Problem, ProtocolResult};
pub use object::{
    Authorization, AuthorizationStatus, Challenge, ChallengeKind, ChallengeStatus,
    DownloadedCertificate, Identifier, InnerChallenge, OrderHandle, OrderStatus, Token,
};

/// Operations the core requires from the ACME wire client.
///
/// Implementations are expected to apply their own per-request retry and timeout
/// policy; the poll loops in this crate only decide *when* to call, never *how*.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Requests a challenge of the given kind for one identifier. The returned
    /// challenge carries the authority token plus the pre-computed proof material
    /// (key authorization or its digest).
    async fn request_challenge(
        &self,
        identifier: &Identifier,
        kind: ChallengeKind,
    ) -> ProtocolResult<Challenge>;

    /// Tells the authority the proof is in place and validation may start.
    async fn submit_answer(&self, challenge: &Challenge) -> ProtocolResult<()>;

    /// One status poll for the authorization behind a challenge.
    async fn poll_authorization(&self, challenge: &Challenge) -> ProtocolResult<Authorization>;

    /// Submits a certificate signing request (raw DER; the wire client owns the
    /// base64url encoding) and returns a handle to the resulting order.
    async fn submit_csr(
        &self,
        identifiers: &[Identifier],
        csr_der: &[u8],
    ) -> ProtocolResult<OrderHandle>;

    /// One status poll for a submitted order.
    async fn poll_order(&self, order: &OrderHandle) -> ProtocolResult<OrderStatus>;

    /// Downloads the issued end-entity certificate, including any `Link` headers
    /// the authority attached (the issuer is behind `rel="up"`).
    async fn download_certificate(
        &self,
        order: &OrderHandle,
    ) -> ProtocolResult<DownloadedCertificate>;

    /// Fetches an issuer certificate (DER) from an authority-provided link.
    async fn download_issuer(&self, url: &Url) -> ProtocolResult<Vec<u8>>;
}
