//! Ed25519 request signature verification.
//!
//! The platform signs `timestamp || body` with the application's private key
//! and sends the hex-encoded signature alongside the timestamp in headers.

use ed25519_dalek::{Signature, Verifier as _, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("public key is not valid hex")]
    KeyEncoding,
    #[error("public key must be {PUBLIC_KEY_LENGTH} bytes, got {0}")]
    KeyLength(usize),
    #[error("public key is not a valid ed25519 point")]
    KeyInvalid,
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("signature is not valid hex")]
    SignatureEncoding,
    #[error("signature must be {SIGNATURE_LENGTH} bytes, got {0}")]
    SignatureLength(usize),
    #[error("signature does not match")]
    Mismatch,
}

/// Verifies inbound interaction requests against a configured public key.
#[derive(Debug, Clone)]
pub struct Verifier {
    key: VerifyingKey,
}

impl Verifier {
    /// Parse a hex-encoded public key. Whitespace around the key is ignored.
    pub fn from_hex(public_key: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(public_key.trim()).map_err(|_| SignatureError::KeyEncoding)?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::KeyLength(bytes.len()))?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| SignatureError::KeyInvalid)?;
        Ok(Self { key })
    }

    pub fn from_key(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Check `signature_hex` over `timestamp || body`.
    ///
    /// Headers are passed as options so that a missing header and a bad
    /// signature are reported distinctly.
    pub fn verify(
        &self,
        signature_hex: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        let signature_hex = signature_hex
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;
        let timestamp = timestamp
            .filter(|value| !value.is_empty())
            .ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;

        let raw = hex::decode(signature_hex).map_err(|_| SignatureError::SignatureEncoding)?;
        let signature =
            Signature::from_slice(&raw).map_err(|_| SignatureError::SignatureLength(raw.len()))?;

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);

        self.key
            .verify(&message, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    pub(crate) fn test_signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    pub(crate) fn sign(key: &SigningKey, timestamp: &str, body: &[u8]) -> String {
        let mut message = timestamp.as_bytes().to_vec();
        message.extend_from_slice(body);
        hex::encode(key.sign(&message).to_bytes())
    }

    fn verifier() -> Verifier {
        let key = test_signing_key();
        Verifier::from_hex(&hex::encode(key.verifying_key().to_bytes())).unwrap()
    }

    #[test]
    fn accepts_valid_signature() {
        let key = test_signing_key();
        let body = br#"{"type":1}"#;
        let sig = sign(&key, "1700000000", body);
        assert!(verifier().verify(Some(&sig), Some("1700000000"), body).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_timestamp() {
        let key = test_signing_key();
        let sig = sign(&key, "1700000000", b"{}");
        let v = verifier();
        assert_eq!(
            v.verify(Some(&sig), Some("1700000000"), b"{ }"),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            v.verify(Some(&sig), Some("1700000001"), b"{}"),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_missing_headers() {
        let v = verifier();
        assert_eq!(
            v.verify(None, Some("1"), b"{}"),
            Err(SignatureError::MissingHeader(SIGNATURE_HEADER))
        );
        assert_eq!(
            v.verify(Some("00"), None, b"{}"),
            Err(SignatureError::MissingHeader(TIMESTAMP_HEADER))
        );
    }

    #[test]
    fn rejects_malformed_signature() {
        let v = verifier();
        assert_eq!(
            v.verify(Some("zz"), Some("1"), b"{}"),
            Err(SignatureError::SignatureEncoding)
        );
        assert_eq!(
            v.verify(Some("abcd"), Some("1"), b"{}"),
            Err(SignatureError::SignatureLength(2))
        );
    }

    #[test]
    fn rejects_bad_public_keys() {
        assert_eq!(
            Verifier::from_hex("not-hex").unwrap_err(),
            SignatureError::KeyEncoding
        );
        assert_eq!(
            Verifier::from_hex("abcd").unwrap_err(),
            SignatureError::KeyLength(2)
        );
    }
}
