use crate::acme::error::Problem;
use crate::dns::name::DnsName;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use url::Url;

/// Relative path (no leading separator) under which HTTP proofs are served.
pub const ACME_CHALLENGE_PATH: &str = ".well-known/acme-challenge";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum Identifier {
    Dns {
        value: String,
    },
    Ip {
        value: IpAddr,
    },
    #[serde(other)]
    Unknown,
}

impl Identifier {
    /// The parsed DNS name, if this identifier is a domain name.
    pub fn as_dns_name(&self) -> Option<DnsName> {
        match self {
            Identifier::Dns { value } => DnsName::try_from(value.as_str()).ok(),
            Identifier::Ip { .. } | Identifier::Unknown => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Identifier::Dns { value } if value.starts_with("*."))
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        match value.parse::<IpAddr>() {
            Ok(ip) => Identifier::Ip { value: ip },
            Err(_) => Identifier::Dns { value },
        }
    }
}

impl From<IpAddr> for Identifier {
    fn from(value: IpAddr) -> Self {
        Identifier::Ip { value }
    }
}

impl FromStr for Identifier {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<IpAddr>() {
            Ok(ip) => Ok(Identifier::Ip { value: ip }),
            Err(_) => Ok(Identifier::Dns {
                value: s.to_string(),
            }),
        }
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.to_string()
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let value: Cow<str> = match &self {
            Identifier::Dns { value } => value.as_str().into(),
            Identifier::Ip { value } => value.to_string().into(),
            Identifier::Unknown => "unknown".into(),
        };
        write!(f, "{value}")
    }
}

/// The challenge types this core can prove. The wire form matches RFC 8555 type strings.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
pub enum ChallengeKind {
    #[strum(serialize = "http-01")]
    #[serde(rename = "http-01")]
    Http01,
    #[strum(serialize = "dns-01")]
    #[serde(rename = "dns-01")]
    Dns01,
    #[strum(serialize = "tls-alpn-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

/// An opaque, authority-issued challenge token. Tokens become path components and
/// file names, so anything resembling a path separator is rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Token {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            anyhow::bail!("Challenge token must not be empty");
        }
        if value.contains(['/', '\\']) || value.contains("..") {
            anyhow::bail!("Challenge token contains path separators");
        }
        Ok(Token(value))
    }
}

impl FromStr for Token {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Token::try_from(s.to_string())
    }
}

impl From<Token> for String {
    fn from(value: Token) -> Self {
        value.0
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ephemeral per-identifier proof obligation. Created when authorization of an
/// identifier starts and discarded when it ends; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Handle under which answers are submitted and status is polled.
    pub url: Url,
    pub status: ChallengeStatus,
    pub error: Option<Problem>,
    pub inner: InnerChallenge,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerChallenge {
    Http(HttpChallenge),
    Dns(DnsChallenge),
    Tls(TlsChallenge),
    Unknown,
}

impl InnerChallenge {
    pub fn kind(&self) -> Option<ChallengeKind> {
        match self {
            InnerChallenge::Http(_) => Some(ChallengeKind::Http01),
            InnerChallenge::Dns(_) => Some(ChallengeKind::Dns01),
            InnerChallenge::Tls(_) => Some(ChallengeKind::TlsAlpn01),
            InnerChallenge::Unknown => None,
        }
    }

    pub fn get_type(&self) -> &str {
        match self {
            InnerChallenge::Http(_) => "http-01",
            InnerChallenge::Dns(_) => "dns-01",
            InnerChallenge::Tls(_) => "tls-alpn-01",
            InnerChallenge::Unknown => "unknown challenge type",
        }
    }
}

/// Proof served as `http://{identifier}/.well-known/acme-challenge/{token}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpChallenge {
    pub token: Token,
    /// The full key authorization string, computed by the wire client (it owns the account key).
    pub key_authorization: String,
}

impl HttpChallenge {
    /// Relative resource path of the proof, without a leading separator.
    pub fn resource_path(&self) -> String {
        format!("{ACME_CHALLENGE_PATH}/{}", self.token)
    }
}

/// Proof published as a TXT record at `_acme-challenge.{identifier}` (or wherever
/// a CNAME delegates that name to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    pub token: Token,
    /// Digest of the key authorization, already encoded as the CA expects it.
    pub record_value: String,
}

impl DnsChallenge {
    /// The record name for an identifier, with wildcards collapsed to their base name.
    pub fn record_name(identifier: &Identifier) -> anyhow::Result<DnsName> {
        let name = identifier
            .as_dns_name()
            .ok_or_else(|| anyhow::anyhow!("{identifier} is not a domain name"))?;
        Ok(name.to_acme_challenge_name()?)
    }
}

/// Proof presented during TLS negotiation via short-lived self-signed certificates
/// whose SANs derive from the key authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsChallenge {
    pub token: Token,
    pub key_authorization: String,
    /// How many derivation rounds the authority demands; one certificate per round.
    pub iterations: u32,
}

/// Authorization status as reported by the certificate authority.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}

impl Display for AuthorizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Revoked => "revoked",
        };
        f.write_str(status)
    }
}

/// One poll response for an authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub status: AuthorizationStatus,
    pub error: Option<Problem>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// Opaque handle to a submitted certificate order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub url: Url,
}

/// The downloaded end-entity certificate plus the raw `Link` headers that
/// accompanied it. The issuer is found by following the `rel="up"` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedCertificate {
    pub der: Vec<u8>,
    pub links: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"type":"dns","value":"example.com"}"#, Identifier::Dns { value: "example.com".to_string() })]
    #[case(r#"{"type":"ip","value":"192.0.2.1"}"#, Identifier::Ip { value: "192.0.2.1".parse().unwrap() })]
    #[case(r#"{"type":"onion","value":"whatever"}"#, Identifier::Unknown)]
    fn test_deserialize_identifier(#[case] json: &str, #[case] expected: Identifier) {
        let identifier: Identifier = serde_json::from_str(json).unwrap();
        assert_eq!(identifier, expected);
    }

    #[rstest]
    #[case("example.com", false)]
    #[case("*.example.com", true)]
    #[case("192.0.2.1", false)]
    fn test_is_wildcard(#[case] raw: &str, #[case] expected: bool) {
        let identifier = Identifier::from_str(raw).unwrap();
        assert_eq!(identifier.is_wildcard(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("../escape")]
    #[case("a/b")]
    #[case(r"a\b")]
    fn test_invalid_tokens_are_rejected(#[case] raw: &str) {
        assert!(Token::from_str(raw).is_err());
    }

    #[test]
    fn test_http_resource_path() {
        let challenge = HttpChallenge {
            token: Token::from_str("some-token").unwrap(),
            key_authorization: "some-token.thumbprint".to_string(),
        };
        assert_eq!(
            challenge.resource_path(),
            ".well-known/acme-challenge/some-token"
        );
    }

    #[rstest]
    #[case("example.com", "_acme-challenge.example.com")]
    #[case("*.example.com", "_acme-challenge.example.com")]
    fn test_dns_record_name(#[case] raw: &str, #[case] expected: &str) {
        let identifier = Identifier::from_str(raw).unwrap();
        let record_name = DnsChallenge::record_name(&identifier).unwrap();
        assert_eq!(record_name.as_ascii(), expected);
    }

    #[test]
    fn test_dns_record_name_rejects_ip() {
        let identifier = Identifier::from_str("192.0.2.1").unwrap();
        assert!(DnsChallenge::record_name(&identifier).is_err());
    }

    #[rstest]
    #[case(ChallengeKind::Http01, "http-01")]
    #[case(ChallengeKind::Dns01, "dns-01")]
    #[case(ChallengeKind::TlsAlpn01, "tls-alpn-01")]
    fn test_challenge_kind_display(#[case] kind: ChallengeKind, #[case] expected: &str) {
        assert_eq!(kind.to_string(), expected);
        assert_eq!(expected.parse::<ChallengeKind>().unwrap(), kind);
    }
}
