use std::collections::HashSet;

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims read from a provider session token before any trust is established.
///
/// Everything except `sub` is optional and only used to synthesize a profile
/// when the provider cannot be asked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnverifiedClaims {
    pub sub: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub email_addresses: Vec<serde_json::Value>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

impl UnverifiedClaims {
    /// Non-blank subject, if the token carries one.
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    Malformed(#[from] jsonwebtoken::errors::Error),
}

/// Parses a JWT without checking signature, expiry, issuer or audience.
pub fn decode_unverified(token: &str) -> Result<UnverifiedClaims, TokenError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = decode::<UnverifiedClaims>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}
