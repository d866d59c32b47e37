use anyhow::{Context, anyhow};
use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, ECDSA_P384_SHA384_FIXED_SIGNING};
use aws_lc_rs::{rsa, signature};
use pem::Pem;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const SHA256_LENGTH: usize = 32;

/// Computes the SHA2-256 digest over the provided byte slice.
///
/// # Panics
///
/// If the hashing engine encounters a catastrophic problem (such as the earth no longer being round)
pub fn sha256(input: &[u8]) -> [u8; SHA256_LENGTH] {
    aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, input)
        .as_ref()
        .try_into()
        .expect("SHA256 returned a hash with size != 32")
}

/// Lowercase hex form of the SHA2-256 digest, as used for certificate thumbprints.
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(sha256(input))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyType {
    Ecdsa(Curve),
    Rsa(RsaSize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Curve {
    P256,
    P384,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RsaSize {
    Rsa2048,
    Rsa3072,
    Rsa4096,
}

impl Curve {
    fn signing_algorithm(self) -> &'static signature::EcdsaSigningAlgorithm {
        match self {
            Curve::P256 => &ECDSA_P256_SHA256_FIXED_SIGNING,
            Curve::P384 => &ECDSA_P384_SHA384_FIXED_SIGNING,
        }
    }
}

impl RsaSize {
    fn key_size(self) -> rsa::KeySize {
        match self {
            RsaSize::Rsa2048 => rsa::KeySize::Rsa2048,
            RsaSize::Rsa3072 => rsa::KeySize::Rsa3072,
            RsaSize::Rsa4096 => rsa::KeySize::Rsa4096,
        }
    }
}

impl Default for KeyType {
    fn default() -> Self {
        KeyType::Ecdsa(Curve::P256)
    }
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Ecdsa(Curve::P256) => "ecdsa-p256",
            KeyType::Ecdsa(Curve::P384) => "ecdsa-p384",
            KeyType::Rsa(RsaSize::Rsa2048) => "rsa-2048",
            KeyType::Rsa(RsaSize::Rsa3072) => "rsa-3072",
            KeyType::Rsa(RsaSize::Rsa4096) => "rsa-4096",
        }
    }
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for KeyType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(match value.as_str() {
            "ecdsa-p256" => KeyType::Ecdsa(Curve::P256),
            "ecdsa-p384" => KeyType::Ecdsa(Curve::P384),
            "rsa-2048" => KeyType::Rsa(RsaSize::Rsa2048),
            "rsa-3072" => KeyType::Rsa(RsaSize::Rsa3072),
            "rsa-4096" => KeyType::Rsa(RsaSize::Rsa4096),
            other => return Err(anyhow!("Unknown key type {other}")),
        })
    }
}

impl From<KeyType> for String {
    fn from(value: KeyType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug)]
pub enum KeyPair {
    Ecdsa(signature::EcdsaKeyPair),
    Rsa(signature::RsaKeyPair),
}

impl KeyPair {
    /// The private key in PKCS#8 PEM form.
    pub fn to_pem(&self) -> anyhow::Result<Pem> {
        let der = match self {
            KeyPair::Ecdsa(keypair) => keypair
                .to_pkcs8v1()
                .map_err(|_| anyhow!("Serializing ECDSA keypair failed"))?
                .as_ref()
                .to_vec(),
            KeyPair::Rsa(keypair) => keypair
                .as_der()
                .map_err(|_| anyhow!("Serializing RSA keypair failed"))?
                .as_ref()
                .to_vec(),
        };
        Ok(Pem::new("PRIVATE KEY", der))
    }

    /// Converts the key to an `rcgen` keypair for CSR/certificate signing.
    ///
    /// Parsing the PEM with rcgen + aws-lc-rs solves the problem of finding the correct
    /// algorithm and curve for us, so go through the PEM representation.
    pub fn to_rcgen_keypair(&self) -> anyhow::Result<rcgen::KeyPair> {
        let pem = self.to_pem()?;
        rcgen::KeyPair::from_pem(&pem.to_string()).context("reading private key from pem failed")
    }
}

pub fn new_key(typ: KeyType) -> anyhow::Result<KeyPair> {
    Ok(match typ {
        KeyType::Ecdsa(curve) => {
            let keypair = signature::EcdsaKeyPair::generate(curve.signing_algorithm())
                .map_err(|_| anyhow!("Could not generate key"))?;
            KeyPair::Ecdsa(keypair)
        }
        KeyType::Rsa(size) => {
            let keypair = signature::RsaKeyPair::generate(size.key_size())
                .map_err(|_| anyhow!("Could not generate key"))?;
            KeyPair::Rsa(keypair)
        }
    })
}
