use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

use crate::{
    config::TokenApiConfig,
    error::{SyncError, SyncResult},
};

const TOKEN_PREVIEW_CHARS: usize = 8;

#[derive(Debug)]
pub struct FetchedToken {
    pub token: String,
    /// Lifetime reported by the endpoint, if any.
    pub expires_in: Option<Duration>,
}

#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn fetch(&self) -> SyncResult<FetchedToken>;
}

/// Token endpoint taking `{email, password, application_name}` and answering
/// with `{access_token, expires_in?}`.
pub struct HttpTokenSource {
    client: Client,
    url: String,
    email: String,
    password: Option<String>,
    application_name: String,
}

impl HttpTokenSource {
    pub fn new(client: Client, url: impl Into<String>, config: &TokenApiConfig) -> Self {
        Self {
            client,
            url: url.into(),
            email: config.email.clone(),
            password: config.password.clone(),
            application_name: config.application_name.clone(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self) -> SyncResult<FetchedToken> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "email": self.email,
                "password": self.password.as_deref().unwrap_or_default(),
                "application_name": self.application_name,
            }))
            .send()
            .await
            .map_err(|err| SyncError::Auth(format!("token request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(200).collect();
            return Err(SyncError::Auth(format!(
                "token endpoint returned {status}: {excerpt}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| SyncError::Auth(format!("invalid token response: {err}")))?;
        let token = body
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| SyncError::Auth("token response has no access_token".into()))?;

        Ok(FetchedToken {
            token,
            expires_in: body.expires_in.map(Duration::from_secs),
        })
    }
}

#[derive(Clone)]
pub struct Credential {
    token: String,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
    acquired: Instant,
}

impl Credential {
    fn new(token: String, ttl: Duration) -> Self {
        Self {
            token,
            acquired_at: Utc::now(),
            ttl,
            acquired: Instant::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }

    fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired.elapsed())
    }

    /// A token shorter-lived than the margin is kept for half its lifetime.
    fn is_usable(&self, margin: Duration) -> bool {
        let margin = margin.min(self.ttl / 2);
        self.acquired.elapsed() < self.ttl - margin
    }

    fn preview(&self) -> String {
        let head: String = self.token.chars().take(TOKEN_PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("acquired_at", &self.acquired_at)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Diagnostic view of the cache for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub cached: bool,
    pub valid: bool,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub seconds_remaining: Option<u64>,
    pub token_preview: Option<String>,
    pub token_api_configured: bool,
    pub fallback_configured: bool,
}

/// Shared bearer credential with single-flight refresh.
///
/// The cache lock is held across the fetch, so concurrent callers on a cold
/// or expired cache wait for the one in-flight request and reuse its result.
pub struct CredentialCache {
    source: Option<Arc<dyn TokenSource>>,
    fallback: Option<String>,
    default_ttl: Duration,
    refresh_margin: Duration,
    cached: Mutex<Option<Credential>>,
}

impl CredentialCache {
    pub fn new(
        source: Option<Arc<dyn TokenSource>>,
        fallback: Option<String>,
        default_ttl: Duration,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            source,
            fallback,
            default_ttl,
            refresh_margin,
            cached: Mutex::new(None),
        }
    }

    pub fn from_config(client: Client, config: &TokenApiConfig) -> Self {
        let source = config.url.as_ref().map(|url| {
            Arc::new(HttpTokenSource::new(client, url.clone(), config)) as Arc<dyn TokenSource>
        });
        Self::new(
            source,
            config.static_token.clone(),
            config.lifetime,
            config.refresh_margin,
        )
    }

    pub async fn get_credential(&self) -> SyncResult<Credential> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if credential.is_usable(self.refresh_margin) {
                return Ok(credential.clone());
            }
        }
        self.refresh(&mut cached).await
    }

    pub async fn force_refresh(&self) -> SyncResult<Credential> {
        let mut cached = self.cached.lock().await;
        cached.take();
        self.refresh(&mut cached).await
    }

    pub async fn clear(&self) {
        self.cached.lock().await.take();
        info!("credential cache cleared");
    }

    pub async fn info(&self) -> CredentialInfo {
        let cached = self.cached.lock().await;
        let credential = cached.as_ref();
        CredentialInfo {
            cached: credential.is_some(),
            valid: credential.map_or(false, |c| c.is_usable(self.refresh_margin)),
            acquired_at: credential.map(Credential::acquired_at),
            expires_at: credential.map(Credential::expires_at),
            seconds_remaining: credential.map(|c| c.remaining().as_secs()),
            token_preview: credential.map(Credential::preview),
            token_api_configured: self.source.is_some(),
            fallback_configured: self.fallback.is_some(),
        }
    }

    async fn refresh(&self, cached: &mut Option<Credential>) -> SyncResult<Credential> {
        let Some(source) = &self.source else {
            return self.fallback_or(SyncError::Auth("no token endpoint configured".into()));
        };

        match source.fetch().await {
            Ok(fetched) => {
                let ttl = fetched.expires_in.unwrap_or(self.default_ttl);
                let credential = Credential::new(fetched.token, ttl);
                info!(
                    expires_at = %credential.expires_at(),
                    "access token refreshed"
                );
                *cached = Some(credential.clone());
                Ok(credential)
            }
            Err(err) => {
                *cached = None;
                self.fallback_or(err)
            }
        }
    }

    /// The static credential is handed out without caching it, so the next
    /// call tries the endpoint again.
    fn fallback_or(&self, err: SyncError) -> SyncResult<Credential> {
        match &self.fallback {
            Some(token) => {
                warn!(error = %err, "token endpoint unavailable; using static credential");
                Ok(Credential::new(token.clone(), self.default_ttl))
            }
            None => {
                warn!(error = %err, "unable to obtain access token");
                Err(err)
            }
        }
    }
}
