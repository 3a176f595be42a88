//! Registration authentication.
//!
//! The register frame carries `{wallet, displayName, timestamp, signature}`.
//! The hub rejects a missing wallet, a timestamp outside a 5-minute window of
//! server time, and a signature the configured verifier refuses.
//!
//! Signature verification is pluggable. The default `HexFormatVerifier`
//! accepts any 128-character hex string: a format check, not a cryptographic
//! guarantee. It matches the network's existing node fleet and is a known
//! weak point; deployments that control both sides should run with
//! `HUB_SIGNATURE_MODE=ed25519`, which verifies a real Ed25519 signature over
//! the canonical register message.

use crate::error::RelayError;
use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Maximum clock skew accepted on register frames, either direction.
pub const REGISTER_WINDOW_SECS: i64 = 300;

/// Canonical message signed by a node when registering.
pub fn register_message(wallet: &str, timestamp: i64) -> String {
    format!("register:{}:{}", wallet, timestamp)
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, wallet: &str, timestamp: i64, signature: &str) -> Result<(), RelayError>;
}

/// Format-only check: the signature must be a 128-character hex string
/// (the length of a hex-encoded Ed25519 signature). Does not prove key
/// possession.
pub struct HexFormatVerifier;

impl SignatureVerifier for HexFormatVerifier {
    fn verify(&self, _wallet: &str, _timestamp: i64, signature: &str) -> Result<(), RelayError> {
        if signature.len() != 128 || !signature.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RelayError::Auth("malformed signature".to_string()));
        }
        Ok(())
    }
}

/// Real Ed25519 verification: the wallet is the hex-encoded public key and
/// the signature covers `register:{wallet}:{timestamp}`.
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, wallet: &str, timestamp: i64, signature: &str) -> Result<(), RelayError> {
        verify_register_signature(wallet, timestamp, signature)
            .map_err(|e| RelayError::Auth(e.to_string()))
    }
}

/// Select a verifier by mode name ("hex" or "ed25519").
pub fn verifier_for_mode(mode: &str) -> Box<dyn SignatureVerifier> {
    match mode {
        "ed25519" => Box::new(Ed25519Verifier),
        _ => Box::new(HexFormatVerifier),
    }
}

/// Validate a register frame against server time and the configured verifier.
pub fn validate_register(
    wallet: &str,
    timestamp: i64,
    signature: &str,
    now: i64,
    verifier: &dyn SignatureVerifier,
) -> Result<(), RelayError> {
    if wallet.is_empty() {
        return Err(RelayError::Auth("wallet is required".to_string()));
    }
    if (now - timestamp).abs() > REGISTER_WINDOW_SECS {
        return Err(RelayError::Auth(format!(
            "timestamp outside {}s window",
            REGISTER_WINDOW_SECS
        )));
    }
    verifier.verify(wallet, timestamp, signature)
}

fn verify_register_signature(wallet: &str, timestamp: i64, signature_hex: &str) -> Result<()> {
    let public_key_bytes = hex::decode(wallet).map_err(|_| anyhow!("wallet is not hex"))?;
    let public_key = VerifyingKey::from_bytes(
        public_key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("Invalid public key length"))?,
    )
    .map_err(|e| anyhow!("Failed to parse public key: {}", e))?;

    let signature_bytes = hex::decode(signature_hex).map_err(|_| anyhow!("signature is not hex"))?;
    let signature = Signature::from_bytes(
        signature_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("Invalid signature length"))?,
    );

    let message = register_message(wallet, timestamp);
    public_key
        .verify(message.as_bytes(), &signature)
        .map_err(|e| anyhow!("Signature verification failed: {}", e))?;

    Ok(())
}

/// Sign a register message with a hex-encoded Ed25519 secret key (agent side).
pub fn sign_register(secret_key_hex: &str, wallet: &str, timestamp: i64) -> Result<String> {
    let secret_bytes = hex::decode(secret_key_hex)
        .map_err(|e| anyhow!("Failed to decode secret key: {}", e))?;

    if secret_bytes.len() != 32 {
        return Err(anyhow!(
            "Invalid secret key length: expected 32 bytes, got {}",
            secret_bytes.len()
        ));
    }

    let signing_key = SigningKey::from_bytes(
        &secret_bytes
            .try_into()
            .map_err(|_| anyhow!("Invalid secret key length"))?,
    );

    let message = register_message(wallet, timestamp);
    let signature = signing_key.sign(message.as_bytes());
    Ok(hex::encode(signature.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_hex_verifier_accepts_fixed_length_hex() {
        let verifier = HexFormatVerifier;
        assert!(verifier.verify("w", NOW, &"ab".repeat(64)).is_ok());
        assert!(verifier.verify("w", NOW, "deadbeef").is_err());
        assert!(verifier.verify("w", NOW, &"zz".repeat(64)).is_err());
    }

    #[test]
    fn test_register_rejects_missing_wallet() {
        let err = validate_register("", NOW, &"ab".repeat(64), NOW, &HexFormatVerifier);
        assert!(matches!(err, Err(RelayError::Auth(_))));
    }

    #[test]
    fn test_register_rejects_stale_timestamp() {
        let sig = "ab".repeat(64);
        assert!(validate_register("w", NOW - 301, &sig, NOW, &HexFormatVerifier).is_err());
        assert!(validate_register("w", NOW + 301, &sig, NOW, &HexFormatVerifier).is_err());
        assert!(validate_register("w", NOW - 299, &sig, NOW, &HexFormatVerifier).is_ok());
    }

    #[test]
    fn test_ed25519_roundtrip() {
        let secret = [7u8; 32];
        let secret_hex = hex::encode(secret);
        let signing_key = SigningKey::from_bytes(&secret);
        let wallet = hex::encode(signing_key.verifying_key().as_bytes());

        let signature = sign_register(&secret_hex, &wallet, NOW).unwrap();
        assert!(validate_register(&wallet, NOW, &signature, NOW, &Ed25519Verifier).is_ok());

        // Tampered timestamp invalidates the signature
        assert!(validate_register(&wallet, NOW + 1, &signature, NOW, &Ed25519Verifier).is_err());
    }
}
