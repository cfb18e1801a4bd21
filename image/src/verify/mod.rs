//! Image signature verification.
//!
//! A [`Verifier`] is picked per image: cosign-style inline signatures when
//! verification keys are configured, otherwise the process-wide choice
//! between no verification and notation.

mod cosign;
mod notation;

pub use cosign::{CosignVerifier, SIGNATURE_ANNOTATION, signature_reference};
pub use notation::{
    NotationCli, NotationRunner, NotationVerifier, ValidationAction, ValidationResult,
    VerificationLevel, VerificationOutcome,
};

use crate::error::ImageError;
use berth_core::Context;
use berth_remote::{HostsResolver, RegistryResolver};
use berth_supervisor::{Image, SupervisorSpi};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use p256::pkcs8::DecodePublicKey;
use p256::pkcs8::der::Decode;
use p256::pkcs8::der::asn1::ObjectIdentifier;
use p256::pkcs8::spki::SubjectPublicKeyInfoRef;
use ring::signature::{self as ring_sig, UnparsedPublicKey};
use sha2::Digest;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierKind {
    None,
    Notation,
    Cosign,
}

impl FromStr for VerifierKind {
    type Err = ImageError;

    /// Parses the configurable verifier types. Cosign is selected by the
    /// presence of keys and cannot be named here.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(VerifierKind::None),
            "notation" => Ok(VerifierKind::Notation),
            other => Err(ImageError::InvalidVerifierConfig(format!(
                "unknown verifier type {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for VerifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierKind::None => write!(f, "none"),
            VerifierKind::Notation => write!(f, "notation"),
            VerifierKind::Cosign => write!(f, "cosign"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashFunction {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashFunction::Sha224 => sha2::Sha224::digest(data).to_vec(),
            HashFunction::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashFunction::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashFunction::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }
}

impl FromStr for HashFunction {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha224" => Ok(HashFunction::Sha224),
            "sha256" => Ok(HashFunction::Sha256),
            "sha384" => Ok(HashFunction::Sha384),
            "sha512" => Ok(HashFunction::Sha512),
            _ => Err(ImageError::UnsupportedHash(s.to_string())),
        }
    }
}

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

#[derive(Clone)]
enum PublicKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    /// PKCS#1 `RSAPublicKey` DER.
    Rsa(Vec<u8>),
    Ed25519(Vec<u8>),
}

fn pem_body(pem: &str) -> Option<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("-----"))
        .collect();
    STANDARD.decode(body).ok()
}

/// RSA and Ed25519 keys, read from their SubjectPublicKeyInfo.
fn other_public_key(pem: &str, hash: HashFunction) -> Result<PublicKey, String> {
    let der = pem_body(pem).ok_or("not a PEM encoded public key")?;
    let spki = SubjectPublicKeyInfoRef::from_der(&der).map_err(|e| e.to_string())?;
    let key = spki.subject_public_key.raw_bytes().to_vec();
    let oid = spki.algorithm.oid;
    if oid == RSA_ENCRYPTION {
        if hash == HashFunction::Sha224 {
            return Err("RSA keys need sha256, sha384 or sha512".to_string());
        }
        Ok(PublicKey::Rsa(key))
    } else if oid == ED25519 {
        Ok(PublicKey::Ed25519(key))
    } else {
        Err(format!(
            "unsupported key algorithm {}; expected ECDSA P-256/P-384, RSA or Ed25519",
            oid
        ))
    }
}

fn ring_verify(
    algs: &[&'static dyn ring_sig::VerificationAlgorithm],
    key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), ImageError> {
    if algs
        .iter()
        .any(|alg| UnparsedPublicKey::new(*alg, key).verify(message, signature).is_ok())
    {
        Ok(())
    } else {
        Err(ImageError::InvalidSignature(
            "signature does not match".to_string(),
        ))
    }
}

/// A public key paired with the hash its signatures were made over.
#[derive(Clone)]
pub struct VerificationKey {
    path: PathBuf,
    hash: HashFunction,
    key: PublicKey,
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("path", &self.path)
            .field("hash", &self.hash)
            .finish()
    }
}

impl VerificationKey {
    /// Parses `<path>:<hash>`, e.g. `/etc/keys/cosign.pub:sha256`.
    pub fn parse(spec: &str) -> Result<Self, ImageError> {
        let (path, hash) = spec.rsplit_once(':').ok_or_else(|| ImageError::InvalidKey {
            key: spec.to_string(),
            reason: "expected <path>:<hash-function>".to_string(),
        })?;
        let hash = hash.parse()?;
        let pem = std::fs::read_to_string(path).map_err(|e| ImageError::InvalidKey {
            key: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_pem(path, &pem, hash)
    }

    pub fn from_pem(path: &str, pem: &str, hash: HashFunction) -> Result<Self, ImageError> {
        let key = if let Ok(k) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            PublicKey::P256(k)
        } else if let Ok(k) = p384::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            PublicKey::P384(k)
        } else {
            other_public_key(pem, hash).map_err(|reason| ImageError::InvalidKey {
                key: path.to_string(),
                reason,
            })?
        };
        Ok(Self {
            path: PathBuf::from(path),
            hash,
            key,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn hash(&self) -> HashFunction {
        self.hash
    }

    /// Verifies `signature` over `message`. ECDSA signatures may be ASN.1
    /// DER or fixed-size; RSA accepts PKCS#1 v1.5 and PSS. Ed25519 signs the
    /// message itself, so the hash function does not apply to it.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), ImageError> {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;

        let bad = |e: p256::ecdsa::Error| ImageError::InvalidSignature(e.to_string());
        let prehash = || self.hash.digest(message);
        match &self.key {
            PublicKey::Rsa(key) => {
                let algs: [&'static dyn ring_sig::VerificationAlgorithm; 2] = match self.hash {
                    HashFunction::Sha384 => [
                        &ring_sig::RSA_PKCS1_2048_8192_SHA384,
                        &ring_sig::RSA_PSS_2048_8192_SHA384,
                    ],
                    HashFunction::Sha512 => [
                        &ring_sig::RSA_PKCS1_2048_8192_SHA512,
                        &ring_sig::RSA_PSS_2048_8192_SHA512,
                    ],
                    HashFunction::Sha224 | HashFunction::Sha256 => [
                        &ring_sig::RSA_PKCS1_2048_8192_SHA256,
                        &ring_sig::RSA_PSS_2048_8192_SHA256,
                    ],
                };
                ring_verify(&algs, key, message, signature)
            }
            PublicKey::Ed25519(key) => {
                let algs: [&'static dyn ring_sig::VerificationAlgorithm; 1] = [&ring_sig::ED25519];
                ring_verify(&algs, key, message, signature)
            }
            PublicKey::P256(key) => {
                let sig = p256::ecdsa::Signature::from_der(signature)
                    .or_else(|_| p256::ecdsa::Signature::from_slice(signature))
                    .map_err(bad)?;
                key.verify_prehash(&prehash(), &sig).map_err(bad)
            }
            PublicKey::P384(key) => {
                let sig = p384::ecdsa::Signature::from_der(signature)
                    .or_else(|_| p384::ecdsa::Signature::from_slice(signature))
                    .map_err(bad)?;
                key.verify_prehash(&prehash(), &sig).map_err(bad)
            }
        }
    }
}

pub fn parse_verification_keys(specs: &[String]) -> Result<Vec<VerificationKey>, ImageError> {
    specs.iter().map(|s| VerificationKey::parse(s)).collect()
}

#[derive(Clone)]
pub enum Verifier {
    None,
    Notation(NotationVerifier),
    Cosign(CosignVerifier),
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Verifier({})", self.kind())
    }
}

impl Verifier {
    /// Builds the process-wide verifier for `kind`. Notation reads
    /// `config_dir` and `libexec_dir` from `config`.
    pub fn configured(
        kind: VerifierKind,
        config: &HashMap<String, String>,
        registry: Arc<RegistryResolver>,
    ) -> Result<Self, ImageError> {
        match kind {
            VerifierKind::None => Ok(Verifier::None),
            VerifierKind::Notation => {
                let runner = NotationCli::from_config(config)?;
                Ok(Verifier::Notation(NotationVerifier::new(
                    Arc::new(runner),
                    registry,
                )))
            }
            VerifierKind::Cosign => Err(ImageError::InvalidVerifierConfig(
                "cosign verification is selected by verification keys".to_string(),
            )),
        }
    }

    /// Cosign with `keys` when there are any, else `fallback`.
    pub fn for_keys(keys: &[VerificationKey], fallback: &Verifier) -> Verifier {
        if keys.is_empty() {
            fallback.clone()
        } else {
            Verifier::Cosign(CosignVerifier::new(keys.to_vec()))
        }
    }

    pub fn kind(&self) -> VerifierKind {
        match self {
            Verifier::None => VerifierKind::None,
            Verifier::Notation(_) => VerifierKind::Notation,
            Verifier::Cosign(_) => VerifierKind::Cosign,
        }
    }

    pub async fn verify(
        &self,
        ctx: &Context,
        spi: &SupervisorSpi,
        image: &Image,
        resolver: Option<HostsResolver>,
    ) -> Result<(), ImageError> {
        match self {
            Verifier::None => Ok(()),
            Verifier::Notation(v) => v.verify(ctx, &image.name).await,
            Verifier::Cosign(v) => v.verify(ctx, spi, image, resolver).await,
        }
    }
}
