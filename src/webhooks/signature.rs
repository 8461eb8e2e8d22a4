//! svix webhook signatures.
//!
//! The signed payload is `"{svix-id}.{svix-timestamp}.{body}"`, keyed with
//! the base64 part of a `whsec_` secret. The signature header is a space
//! separated list of `v1,<base64 sig>` entries; any one match is enough.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew between the sender and us, in seconds.
pub const TOLERANCE_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("webhook secret is not valid base64")]
    InvalidSecret,
    #[error("timestamp is malformed or outside the tolerance window")]
    StaleTimestamp,
    #[error("no signature matched")]
    Mismatch,
}

/// Headers svix attaches to every delivery.
#[derive(Debug, Clone, Copy)]
pub struct SvixHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signatures: &'a str,
}

fn secret_bytes(secret: &str) -> Result<Vec<u8>, SignatureError> {
    let raw = secret.strip_prefix("whsec_").unwrap_or(secret);
    STANDARD
        .decode(raw.trim())
        .map_err(|_| SignatureError::InvalidSecret)
}

fn keyed_mac(key: &[u8], headers: &SvixHeaders<'_>, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(headers.id.as_bytes());
    mac.update(b".");
    mac.update(headers.timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

pub fn verify(
    secret: &str,
    headers: &SvixHeaders<'_>,
    body: &[u8],
    now_unix: i64,
) -> Result<(), SignatureError> {
    let ts: i64 = headers
        .timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::StaleTimestamp)?;
    if now_unix.abs_diff(ts) > TOLERANCE_SECS.unsigned_abs() {
        return Err(SignatureError::StaleTimestamp);
    }

    let key = secret_bytes(secret)?;
    let mac = keyed_mac(&key, headers, body)?;

    let matched = headers
        .signatures
        .split_whitespace()
        .filter_map(|entry| entry.strip_prefix("v1,"))
        .filter_map(|sig| STANDARD.decode(sig).ok())
        .any(|sig| mac.clone().verify_slice(&sig).is_ok());

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
