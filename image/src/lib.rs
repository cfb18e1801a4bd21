//! Image-side checks run before a container uses an image: platform
//! manifest selection, decryption authorization and signature verification.

mod decrypt;
mod error;
mod jwe;
mod manifest;
pub mod verify;

pub use decrypt::{DecryptConfig, JWE_ANNOTATION, check_authorization};
pub use error::ImageError;
pub use manifest::{image_config, platform_manifest, read_manifest};
pub use verify::{
    HashFunction, VerificationKey, Verifier, VerifierKind, parse_verification_keys,
    signature_reference,
};
