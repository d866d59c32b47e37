use hickory_resolver::Name;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// A normalized domain name.
///
/// Normalization: all names are lowercased (not an RFC 5280 requirement, but
/// commonly applied), and all names are treated as absolute to the root (FQDN),
/// as SANs do not distinguish between relative and absolute domain names.
#[derive(Debug, Clone, Eq)]
pub struct DnsName {
    inner: Name,
    ascii: String,
    utf8: String,
}

impl DnsName {
    fn __to_ascii(name: &Name) -> String {
        let ascii = name.to_ascii();
        ascii
            .strip_suffix(".")
            .map(ToString::to_string)
            .unwrap_or(ascii)
    }

    fn __to_utf8(name: &Name) -> String {
        let utf8 = name.to_utf8();
        utf8.strip_suffix(".")
            .map(ToString::to_string)
            .unwrap_or(utf8)
    }

    pub fn as_ascii(&self) -> &str {
        &self.ascii
    }

    pub fn as_utf8(&self) -> &str {
        &self.utf8
    }

    pub fn is_wildcard(&self) -> bool {
        self.inner.is_wildcard()
    }

    pub fn eq_ignore_root(&self, other: &DnsName) -> bool {
        self.inner.eq_ignore_root(&other.inner)
    }

    /// The `_acme-challenge.` name proofs are published under. Wildcards collapse
    /// to their base name first.
    pub fn to_acme_challenge_name(&self) -> Result<Self, ParseError> {
        let base = if self.is_wildcard() {
            &self.inner.base_name()
        } else {
            &self.inner
        };
        let acme_challenge_name = base.prepend_label("_acme-challenge")?;
        Ok(acme_challenge_name.into())
    }
}

impl PartialEq<Self> for DnsName {
    fn eq(&self, other: &Self) -> bool {
        self.inner.eq(&other.inner)
    }
}

impl Hash for DnsName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl Display for DnsName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_utf8())
    }
}

impl From<&Name> for DnsName {
    fn from(value: &Name) -> Self {
        let mut normalized = value.to_lowercase();
        normalized.set_fqdn(true);
        let ascii = Self::__to_ascii(&normalized);
        let utf8 = Self::__to_utf8(&normalized);
        Self {
            inner: normalized,
            ascii,
            utf8,
        }
    }
}

impl From<Name> for DnsName {
    fn from(value: Name) -> Self {
        (&value).into()
    }
}

impl From<DnsName> for Name {
    fn from(value: DnsName) -> Self {
        value.inner
    }
}

impl From<&DnsName> for Name {
    fn from(value: &DnsName) -> Self {
        value.inner.clone()
    }
}

impl TryFrom<&str> for DnsName {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Name::from_str_relaxed(value)?.into())
    }
}

impl TryFrom<String> for DnsName {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    ParseFailure(#[from] hickory_resolver::proto::ProtoError),
}

#[cfg(test)]
mod tests {
    use crate::dns::name::DnsName;
    use rstest::rstest;

    #[rstest]
    #[case("example.com", "example.com")]
    #[case("example.com.", "example.com")]
    #[case("UPPERCASE.COM", "uppercase.com")]
    #[case("Bücher.example", "xn--bcher-kva.example")]
    #[case("xn--bcher-kva.example", "xn--bcher-kva.example")]
    #[case("_underscore.name", "_underscore.name")]
    #[case("tld", "tld")]
    fn test_to_ascii(#[case] raw_name: &str, #[case] ascii_name: &str) {
        let parsed: DnsName = raw_name.try_into().unwrap();

        assert_eq!(parsed.as_ascii(), ascii_name);
    }

    #[rstest]
    #[case("tld", false)]
    #[case("a.tld", false)]
    #[case("*.tld", true)]
    #[case("*.fqdn.example.com", true)]
    fn test_is_wildcard(#[case] raw_name: &str, #[case] expected: bool) {
        let parsed: DnsName = raw_name.try_into().unwrap();

        assert_eq!(parsed.is_wildcard(), expected);
    }

    #[rstest]
    #[case("sub.example.com", "sub.example.com.", true)]
    #[case("example.com", "sub.example.com", false)]
    #[case("tld", "tld.", true)]
    fn test_eq_ignore_root(
        #[case] first_name: &str,
        #[case] second_name: &str,
        #[case] expected: bool,
    ) {
        let first: DnsName = first_name.try_into().unwrap();
        let second: DnsName = second_name.try_into().unwrap();

        assert_eq!(first.eq_ignore_root(&second), expected);
    }

    #[rstest]
    #[case("example.com", "_acme-challenge.example.com")]
    #[case("fqdn.example.com", "_acme-challenge.fqdn.example.com")]
    #[case("*.example.com", "_acme-challenge.example.com.")]
    #[case("*.sub.example.com", "_acme-challenge.sub.example.com.")]
    fn test_to_acme_challenge_name(#[case] raw_name: &str, #[case] expected_name: &str) {
        let parsed: DnsName = raw_name.try_into().unwrap();
        let expected: DnsName = expected_name.try_into().unwrap();

        assert_eq!(parsed.to_acme_challenge_name().unwrap(), expected);
    }
}
