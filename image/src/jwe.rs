//! Unwrapping of JWE-protected layer keys (`ECDH-ES` direct key agreement
//! on P-256 with `A256GCM` content encryption).

use crate::error::ImageError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::aead;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

const ALG_ECDH_ES: &str = "ECDH-ES";
const ENC_A256GCM: &str = "A256GCM";
const CEK_BITS: u32 = 256;

#[derive(Debug, Deserialize)]
struct JweJson {
    #[serde(default)]
    protected: Option<String>,
    #[serde(default)]
    unprotected: Option<Map<String, Value>>,
    #[serde(default)]
    recipients: Vec<Recipient>,
    #[serde(default)]
    header: Option<Map<String, Value>>,
    iv: String,
    ciphertext: String,
    tag: String,
    #[serde(default)]
    aad: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Recipient {
    #[serde(default)]
    header: Option<Map<String, Value>>,
}

fn invalid(reason: impl Into<String>) -> ImageError {
    ImageError::InvalidJwe(reason.into())
}

fn b64(field: &str, value: &str) -> Result<Vec<u8>, ImageError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| invalid(format!("{}: {}", field, e)))
}

/// Decrypts the JWE JSON serialization `raw` with `key`, returning the
/// protected payload.
pub fn unwrap(raw: &[u8], key: &p256::SecretKey) -> Result<Vec<u8>, ImageError> {
    let jwe: JweJson = serde_json::from_slice(raw)?;

    let mut shared = Map::new();
    if let Some(protected) = &jwe.protected {
        let decoded: Map<String, Value> = serde_json::from_slice(&b64("protected", protected)?)?;
        shared.extend(decoded);
    }
    if let Some(unprotected) = &jwe.unprotected {
        shared.extend(unprotected.clone());
    }

    let mut headers: Vec<Map<String, Value>> = jwe
        .recipients
        .iter()
        .map(|r| {
            let mut h = shared.clone();
            if let Some(own) = &r.header {
                h.extend(own.clone());
            }
            h
        })
        .collect();
    if headers.is_empty() {
        let mut h = shared.clone();
        if let Some(own) = &jwe.header {
            h.extend(own.clone());
        }
        headers.push(h);
    }

    let iv = b64("iv", &jwe.iv)?;
    let mut sealed = b64("ciphertext", &jwe.ciphertext)?;
    sealed.extend(b64("tag", &jwe.tag)?);
    let mut aad = jwe.protected.clone().unwrap_or_default();
    if let Some(extra) = &jwe.aad {
        aad.push('.');
        aad.push_str(extra);
    }

    let mut last_err = invalid("no recipients");
    for header in &headers {
        match content_key(header, key).and_then(|cek| open(&cek, &iv, aad.as_bytes(), sealed.clone())) {
            Ok(plain) => return Ok(plain),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn header_str<'a>(header: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    header.get(name).and_then(Value::as_str)
}

fn content_key(header: &Map<String, Value>, key: &p256::SecretKey) -> Result<[u8; 32], ImageError> {
    let alg = header_str(header, "alg").unwrap_or_default();
    if alg != ALG_ECDH_ES {
        return Err(invalid(format!("unsupported key management algorithm {:?}", alg)));
    }
    let enc = header_str(header, "enc").unwrap_or_default();
    if enc != ENC_A256GCM {
        return Err(invalid(format!("unsupported content encryption {:?}", enc)));
    }

    let epk = header
        .get("epk")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("missing epk"))?;
    if header_str(epk, "crv") != Some("P-256") {
        return Err(invalid("ephemeral key is not on P-256"));
    }
    let x = b64("epk.x", header_str(epk, "x").unwrap_or_default())?;
    let y = b64("epk.y", header_str(epk, "y").unwrap_or_default())?;
    let mut sec1 = Vec::with_capacity(65);
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    let ephemeral = p256::PublicKey::from_sec1_bytes(&sec1)
        .map_err(|e| invalid(format!("ephemeral key: {}", e)))?;

    let shared = p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), ephemeral.as_affine());
    let apu = match header_str(header, "apu") {
        Some(v) => b64("apu", v)?,
        None => Vec::new(),
    };
    let apv = match header_str(header, "apv") {
        Some(v) => b64("apv", v)?,
        None => Vec::new(),
    };
    Ok(concat_kdf(
        shared.raw_secret_bytes().as_slice(),
        enc,
        &apu,
        &apv,
    ))
}

/// Single-round Concat KDF with SHA-256 as used by JWA for 256-bit keys.
pub(crate) fn concat_kdf(z: &[u8], alg_id: &str, apu: &[u8], apv: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(1u32.to_be_bytes());
    hasher.update(z);
    for part in [alg_id.as_bytes(), apu, apv] {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.update(CEK_BITS.to_be_bytes());
    hasher.finalize().into()
}

fn open(cek: &[u8; 32], iv: &[u8], aad: &[u8], mut sealed: Vec<u8>) -> Result<Vec<u8>, ImageError> {
    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_256_GCM, cek)
            .map_err(|_| invalid("bad content key length"))?,
    );
    let nonce = aead::Nonce::try_assume_unique_for_key(iv).map_err(|_| invalid("bad iv length"))?;
    let plain = key
        .open_in_place(nonce, aead::Aad::from(aad), &mut sealed)
        .map_err(|_| invalid("content decryption failed"))?;
    Ok(plain.to_vec())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Builds a single-recipient JWE for `recipient` the way an image
    /// encryptor would.
    pub(crate) fn seal_for(recipient: &p256::PublicKey, payload: &[u8]) -> Vec<u8> {
        let ephemeral = p256::SecretKey::from_slice(&[5u8; 32]).unwrap();
        let epk_point = ephemeral.public_key().to_sec1_bytes();
        let (x, y) = (&epk_point[1..33], &epk_point[33..65]);

        let protected = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "alg": ALG_ECDH_ES,
                "enc": ENC_A256GCM,
                "epk": {
                    "kty": "EC",
                    "crv": "P-256",
                    "x": URL_SAFE_NO_PAD.encode(x),
                    "y": URL_SAFE_NO_PAD.encode(y),
                },
            }))
            .unwrap(),
        );

        let shared = p256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
        let cek = concat_kdf(shared.raw_secret_bytes().as_slice(), ENC_A256GCM, &[], &[]);
        let key = aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, &cek).unwrap());
        let iv = [9u8; 12];
        let mut in_out = payload.to_vec();
        let tag = key
            .seal_in_place_separate_tag(
                aead::Nonce::assume_unique_for_key(iv),
                aead::Aad::from(protected.as_bytes()),
                &mut in_out,
            )
            .unwrap();

        serde_json::to_vec(&json!({
            "protected": protected,
            "iv": URL_SAFE_NO_PAD.encode(iv),
            "ciphertext": URL_SAFE_NO_PAD.encode(&in_out),
            "tag": URL_SAFE_NO_PAD.encode(tag.as_ref()),
        }))
        .unwrap()
    }

    #[test]
    fn test_unwrap_with_matching_key() {
        let key = p256::SecretKey::from_slice(&[3u8; 32]).unwrap();
        let jwe = seal_for(&key.public_key(), b"{\"symkey\":\"abc\"}");
        assert_eq!(unwrap(&jwe, &key).unwrap(), b"{\"symkey\":\"abc\"}");
    }

    #[test]
    fn test_unwrap_with_other_key_fails() {
        let key = p256::SecretKey::from_slice(&[3u8; 32]).unwrap();
        let other = p256::SecretKey::from_slice(&[4u8; 32]).unwrap();
        let jwe = seal_for(&key.public_key(), b"secret");
        assert!(matches!(unwrap(&jwe, &other), Err(ImageError::InvalidJwe(_))));
    }

    #[test]
    fn test_rejects_key_wrapping_algorithms() {
        let key = p256::SecretKey::from_slice(&[3u8; 32]).unwrap();
        let protected = URL_SAFE_NO_PAD.encode(br#"{"alg":"RSA-OAEP","enc":"A256GCM"}"#);
        let jwe = serde_json::to_vec(&json!({
            "protected": protected,
            "iv": "AAAAAAAAAAAAAAAA",
            "ciphertext": "",
            "tag": "AAAAAAAAAAAAAAAAAAAAAA",
        }))
        .unwrap();
        let err = unwrap(&jwe, &key).unwrap_err();
        assert!(err.to_string().contains("RSA-OAEP"));
    }

    #[test]
    fn test_concat_kdf_vector() {
        // RFC 7518 appendix C.
        let z = [
            158, 86, 217, 29, 129, 113, 53, 211, 114, 131, 66, 131, 191, 132, 38, 156, 251, 49,
            110, 163, 218, 128, 106, 72, 246, 218, 167, 121, 140, 254, 144, 196,
        ];
        let key = concat_kdf(&z, "A128GCM", b"Alice", b"Bob");
        // The appendix derives 128 bits; only the key length input differs,
        // so compare against an independently computed 256-bit derivation.
        let mut hasher = Sha256::new();
        hasher.update([0, 0, 0, 1]);
        hasher.update(z);
        hasher.update([0, 0, 0, 7]);
        hasher.update(b"A128GCM");
        hasher.update([0, 0, 0, 5]);
        hasher.update(b"Alice");
        hasher.update([0, 0, 0, 3]);
        hasher.update(b"Bob");
        hasher.update([0, 0, 1, 0]);
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(key, expected);
    }
}
