use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::claims::UnverifiedClaims;

/// Domain used for addresses synthesized when a token carries no email at all.
pub const PLACEHOLDER_EMAIL_DOMAIN: &str = "temp.clerk.invalid";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEmail {
    pub address: String,
    pub is_primary: bool,
}

/// Identity-provider view of a user, as handed to the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub candidate_emails: Vec<CandidateEmail>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProviderProfile {
    /// The non-blank entry marked primary, else the first non-blank entry.
    pub fn primary_email(&self) -> Option<&str> {
        let mut usable = self
            .candidate_emails
            .iter()
            .filter(|e| !e.address.trim().is_empty());
        usable
            .clone()
            .find(|e| e.is_primary)
            .or_else(|| usable.next())
            .map(|e| e.address.as_str())
    }

    /// Best-effort profile built from unverified token claims.
    pub fn from_claims(external_id: &str, claims: &UnverifiedClaims) -> Self {
        let email = claims
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| is_valid_email(e))
            .map(str::to_string)
            .or_else(|| {
                claims
                    .email_addresses
                    .iter()
                    .filter_map(|v| match v {
                        serde_json::Value::String(s) => Some(s.trim()),
                        serde_json::Value::Object(o) => o
                            .get("email_address")
                            .and_then(|a| a.as_str())
                            .map(str::trim),
                        _ => None,
                    })
                    .find(|e| is_valid_email(e))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("{external_id}@{PLACEHOLDER_EMAIL_DOMAIN}"));

        Self {
            id: external_id.to_string(),
            candidate_emails: vec![CandidateEmail {
                address: email,
                is_primary: true,
            }],
            first_name: non_blank(claims.given_name.as_deref()),
            last_name: non_blank(claims.family_name.as_deref()),
            avatar_url: non_blank(claims.picture.as_deref()),
        }
    }
}

fn non_blank(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClerkEmailAddress {
    pub id: String,
    pub email_address: String,
}

/// User object as returned by `GET /users/{id}` and carried by webhooks.
#[derive(Debug, Clone, Deserialize)]
pub struct ClerkUser {
    pub id: String,
    #[serde(default)]
    pub email_addresses: Vec<ClerkEmailAddress>,
    pub primary_email_address_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image_url: Option<String>,
}

impl From<ClerkUser> for ProviderProfile {
    fn from(u: ClerkUser) -> Self {
        let primary = u.primary_email_address_id.as_deref();
        let candidate_emails = u
            .email_addresses
            .into_iter()
            .map(|e| CandidateEmail {
                is_primary: primary == Some(e.id.as_str()),
                address: e.email_address,
            })
            .collect();
        Self {
            id: u.id,
            candidate_emails,
            first_name: non_blank(u.first_name.as_deref()),
            last_name: non_blank(u.last_name.as_deref()),
            avatar_url: non_blank(u.image_url.as_deref()),
        }
    }
}
