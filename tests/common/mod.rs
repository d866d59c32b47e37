#![allow(dead_code)]

use async_trait::async_trait;
use certmill::acme::error::{Problem, ProtocolResult};
use certmill::acme::object::{
    Authorization, AuthorizationStatus, Challenge, ChallengeKind, ChallengeStatus,
    DownloadedCertificate, HttpChallenge, InnerChallenge, OrderHandle, OrderStatus, Token,
};
use certmill::acme::{AcmeClient, Identifier};
use certmill::issue::CertificateArtifact;
use certmill::store::CertificateStore;
use certmill::target::Target;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// In-memory certificate authority double. Challenges validate as soon as
/// their answer was submitted (unless the identifier is marked invalid), and
/// issued certificates are signed by a real self-signed test root.
pub struct FakeCa {
    ca_cert: rcgen::Certificate,
    ca_key: rcgen::KeyPair,
    state: Mutex<FakeCaState>,
}

#[derive(Default)]
struct FakeCaState {
    invalid_identifiers: HashSet<String>,
    answered: HashSet<String>,
    orders: HashMap<String, Vec<Identifier>>,
    order_counter: usize,
    issuer_downloads: usize,
}

impl FakeCa {
    pub fn new() -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        ca_params.distinguished_name = rcgen::DistinguishedName::new();
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Fake Intermediate CA");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        Self {
            ca_cert,
            ca_key,
            state: Mutex::new(FakeCaState::default()),
        }
    }

    /// Marks an identifier so its validation always fails.
    pub fn refuse(&self, identifier: &str) {
        self.state
            .lock()
            .invalid_identifiers
            .insert(identifier.to_string());
    }

    pub fn issuer_downloads(&self) -> usize {
        self.state.lock().issuer_downloads
    }

    pub fn issuer_der(&self) -> Vec<u8> {
        self.ca_cert.der().to_vec()
    }

    fn identifier_of(challenge: &Challenge) -> String {
        challenge
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string()
    }
}

impl Default for FakeCa {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcmeClient for FakeCa {
    async fn request_challenge(
        &self,
        identifier: &Identifier,
        kind: ChallengeKind,
    ) -> ProtocolResult<Challenge> {
        assert_eq!(kind, ChallengeKind::Http01, "FakeCa only offers http-01");
        let token = Token::from_str(&format!("tok-{identifier}")).unwrap();
        Ok(Challenge {
            url: Url::parse(&format!("https://fake.ca/challenge/{identifier}")).unwrap(),
            status: ChallengeStatus::Pending,
            error: None,
            inner: InnerChallenge::Http(HttpChallenge {
                key_authorization: format!("{token}.fake-account-thumbprint"),
                token,
            }),
        })
    }

    async fn submit_answer(&self, challenge: &Challenge) -> ProtocolResult<()> {
        self.state
            .lock()
            .answered
            .insert(Self::identifier_of(challenge));
        Ok(())
    }

    async fn poll_authorization(&self, challenge: &Challenge) -> ProtocolResult<Authorization> {
        let identifier = Self::identifier_of(challenge);
        let state = self.state.lock();
        if state.invalid_identifiers.contains(&identifier) {
            return Ok(Authorization {
                status: AuthorizationStatus::Invalid,
                error: Some(Problem::new(
                    "urn:ietf:params:acme:error:unauthorized",
                    format!("The validation resource for {identifier} was unreachable"),
                )),
            });
        }
        let status = if state.answered.contains(&identifier) {
            AuthorizationStatus::Valid
        } else {
            AuthorizationStatus::Pending
        };
        Ok(Authorization {
            status,
            error: None,
        })
    }

    async fn submit_csr(
        &self,
        identifiers: &[Identifier],
        _csr_der: &[u8],
    ) -> ProtocolResult<OrderHandle> {
        let mut state = self.state.lock();
        state.order_counter += 1;
        let url = format!("https://fake.ca/order/{}", state.order_counter);
        state.orders.insert(url.clone(), identifiers.to_vec());
        Ok(OrderHandle {
            url: Url::parse(&url).unwrap(),
        })
    }

    async fn poll_order(&self, _order: &OrderHandle) -> ProtocolResult<OrderStatus> {
        Ok(OrderStatus::Valid)
    }

    async fn download_certificate(
        &self,
        order: &OrderHandle,
    ) -> ProtocolResult<DownloadedCertificate> {
        let identifiers = self
            .state
            .lock()
            .orders
            .get(order.url.as_str())
            .cloned()
            .expect("certificate download for unknown order");
        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(
            identifiers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let leaf = leaf_params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .unwrap();
        Ok(DownloadedCertificate {
            der: leaf.der().to_vec(),
            links: vec![r#"<https://fake.ca/issuer/intermediate>;rel="up""#.to_string()],
        })
    }

    async fn download_issuer(&self, _url: &Url) -> ProtocolResult<Vec<u8>> {
        self.state.lock().issuer_downloads += 1;
        Ok(self.ca_cert.der().to_vec())
    }
}

/// Store double recording install/remove calls in order.
pub struct RecordingStore {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingStore {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                events: events.clone(),
            }),
            events,
        )
    }
}

#[async_trait]
impl CertificateStore for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    async fn install(
        &self,
        _target: &Target,
        artifact: &CertificateArtifact,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .push(format!("install:{}", artifact.thumbprint));
        Ok(())
    }

    async fn remove(&self, thumbprint: &str) -> anyhow::Result<()> {
        self.events.lock().push(format!("remove:{thumbprint}"));
        Ok(())
    }
}
