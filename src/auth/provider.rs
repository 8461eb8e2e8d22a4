use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::auth::dto::{ClerkUser, ProviderProfile};
use crate::config::ClerkConfig;

/// External identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` when the provider does not know the subject.
    async fn fetch_user(&self, external_id: &str) -> anyhow::Result<Option<ProviderProfile>>;

    /// Writes public metadata on the provider record (role hints).
    async fn update_public_metadata(
        &self,
        external_id: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Per-subject profile cache with a fixed TTL.
#[derive(Clone)]
pub struct ProfileCache {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, (Instant, ProviderProfile)>>>,
}

impl ProfileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, key: &str) -> Option<ProviderProfile> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, p)| p.clone())
    }

    pub async fn insert(&self, key: &str, profile: ProviderProfile) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
        entries.insert(key.to_string(), (Instant::now(), profile));
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

/// Clerk backend API client.
#[derive(Clone)]
pub struct ClerkClient {
    http: Client,
    api_url: Url,
    secret_key: String,
    cache: ProfileCache,
}

impl ClerkClient {
    pub fn new(cfg: &ClerkConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build provider http client")?;
        Ok(Self {
            http,
            api_url: Url::parse(&cfg.api_url).context("parse provider api url")?,
            secret_key: cfg.secret_key.clone(),
            cache: ProfileCache::new(Duration::from_secs(cfg.profile_cache_ttl_secs)),
        })
    }

    /// `{api}/users/{id}[/{suffix}]`, with `id` as one percent-encoded
    /// path segment.
    fn user_url(&self, external_id: &str, suffix: Option<&str>) -> anyhow::Result<Url> {
        if matches!(external_id, "" | "." | "..") {
            anyhow::bail!("invalid provider user id {external_id:?}");
        }
        let mut url = self.api_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("provider api url cannot be a base"))?;
            segments.pop_if_empty().push("users").push(external_id);
            if let Some(suffix) = suffix {
                segments.push(suffix);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl IdentityProvider for ClerkClient {
    async fn fetch_user(&self, external_id: &str) -> anyhow::Result<Option<ProviderProfile>> {
        if let Some(profile) = self.cache.get(external_id).await {
            debug!(external_id, "provider profile served from cache");
            return Ok(Some(profile));
        }

        let res = self
            .http
            .get(self.user_url(external_id, None)?)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .context("provider get user")?;

        match res.status() {
            StatusCode::OK => {
                let user: ClerkUser = res.json().await.context("decode provider user")?;
                let profile = ProviderProfile::from(user);
                self.cache.insert(external_id, profile.clone()).await;
                debug!(external_id, "provider profile fetched");
                Ok(Some(profile))
            }
            StatusCode::NOT_FOUND => {
                warn!(external_id, "user not found at provider");
                Ok(None)
            }
            status => {
                let body = res.text().await.unwrap_or_default();
                error!(external_id, %status, body = %body, "provider get user failed");
                anyhow::bail!("provider returned {status}")
            }
        }
    }

    async fn update_public_metadata(
        &self,
        external_id: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        let res = self
            .http
            .patch(self.user_url(external_id, Some("metadata"))?)
            .bearer_auth(&self.secret_key)
            .json(&json!({ "public_metadata": metadata }))
            .send()
            .await
            .context("provider update metadata")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            error!(external_id, %status, body = %body, "provider metadata update failed");
            anyhow::bail!("provider returned {status}");
        }
        self.cache.invalidate(external_id).await;
        info!(external_id, "provider public metadata updated");
        Ok(())
    }
}
