//! HMAC-SHA256 payload signing.
//!
//! Every outbound body is signed with the registration's secret and sent as
//! `X-Webhook-Signature: sha256=<hex>`. Receivers recompute the MAC over the
//! raw body bytes; [`verify_signature`] is the reference check.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Signature errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Header value is not `sha256=<64 hex chars>`.
    InvalidFormat(String),
    /// Secret cannot key the MAC.
    InvalidSecret,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(value) => write!(f, "invalid signature format: {value}"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// HMAC-SHA256 of `payload` keyed with `secret`, lowercase hex.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is rejected by the
/// MAC.
pub fn generate_hmac_hex(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Full header value, `sha256=<hex>`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is rejected by the
/// MAC.
pub fn signature_header(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    Ok(format!("{SIGNATURE_PREFIX}{}", generate_hmac_hex(payload, secret)?))
}

/// Checks a received header value against `payload` in constant time.
pub fn verify_signature(payload: &[u8], header: &str, secret: &str) -> bool {
    let Some(received) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    if received.len() != 64 || !received.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }

    match generate_hmac_hex(payload, secret) {
        Ok(expected) => timing_safe_eq(&received.to_ascii_lowercase(), &expected),
        Err(_) => false,
    }
}

fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.bytes().zip(b.bytes()) {
        result |= a_byte ^ b_byte;
    }

    result == 0
}
