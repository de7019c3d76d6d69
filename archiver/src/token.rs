//! Token lifecycle: keeps `OAuthToken` rows fresh via a per-provider
//! jittered scheduler, and exposes a single-flight lazy accessor for
//! read-side callers (the video-API client, the upload adapter).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use archiver_log::log;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::types::EncryptionVersion;
use crate::db::Db;
use crate::secret::SecretStore;

/// Result of a successful provider-specific refresh call.
#[derive(Clone, Debug)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: Duration,
    pub scope: String,
}

/// Provider-specific primitive that exchanges a refresh token for a new
/// access token. Injected so the scheduler never hardcodes a provider's
/// wire format.
#[async_trait]
pub trait TokenRefresher: Send + Sync + std::fmt::Debug {
    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<RefreshedToken>;
}

/// Keeps one `(provider, channel)` `OAuthToken` row fresh.
#[derive(Debug)]
pub struct TokenLifecycle {
    db: Db,
    secret: Arc<SecretStore>,
    refresher: Arc<dyn TokenRefresher>,
    provider: String,
    channel: String,
    /// Refresh once `expiry - now` drops below this.
    margin: Duration,
    /// Scheduler tick is drawn uniformly from `[min_interval, max_interval]`.
    min_interval: Duration,
    max_interval: Duration,
    /// Serializes concurrent refresh attempts for this provider/channel so
    /// a scheduler tick and a lazy-accessor call never race.
    single_flight: Mutex<()>,
}

impl TokenLifecycle {
    #[must_use]
    pub fn new(
        db: Db,
        secret: Arc<SecretStore>,
        refresher: Arc<dyn TokenRefresher>,
        provider: impl Into<String>,
        channel: impl Into<String>,
        min_interval: Duration,
        max_interval: Duration,
        margin: Duration,
    ) -> Self {
        Self {
            db,
            secret,
            refresher,
            provider: provider.into(),
            channel: channel.into(),
            margin,
            min_interval,
            max_interval,
            single_flight: Mutex::new(()),
        }
    }

    /// Runs the scheduler loop until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            let jitter = jittered_interval(self.min_interval, self.max_interval);
            tokio::select! {
                () = token.cancelled() => {
                    log::info!("token lifecycle for {} shutting down", self.provider);
                    return;
                }
                () = tokio::time::sleep(jitter) => {}
            }

            if let Err(e) = self.tick().await {
                log::error!(
                    "token refresh tick failed for {}/{}: {}",
                    self.provider, self.channel, e,
                );
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let row = match self.db.get_token(&self.provider, &self.channel).await {
            Ok(row) => row,
            Err(crate::error::DbError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if row.expiry - Utc::now() < chrono::Duration::from_std(self.margin).unwrap_or_default() {
            self.refresh_now().await?;
        }
        Ok(())
    }

    /// Returns a currently-valid access token, triggering a single-flight
    /// refresh first if it is within 2 minutes of expiring.
    ///
    /// # Errors
    ///
    /// Propagates decryption or refresh failures.
    pub async fn access_token(&self) -> anyhow::Result<String> {
        let row = self.db.get_token(&self.provider, &self.channel).await?;
        if row.expiry - Utc::now() < chrono::Duration::minutes(2) {
            self.refresh_now().await?;
            let row = self.db.get_token(&self.provider, &self.channel).await?;
            return self.decrypt_access_token(&row).await;
        }
        self.decrypt_access_token(&row).await
    }

    async fn decrypt_access_token(
        &self,
        row: &crate::db::types::OAuthTokenRow,
    ) -> anyhow::Result<String> {
        let plaintext = self
            .secret
            .decrypt(&row.ciphertext, row.encryption_version, "oauth-access-token")
            .await
            .context("decrypting access token")?;
        String::from_utf8(plaintext).context("access token was not valid utf-8")
    }

    async fn refresh_now(&self) -> anyhow::Result<()> {
        let _guard = self.single_flight.lock().await;

        // Re-read after acquiring the lock: another caller may have just
        // refreshed while we waited.
        let row = self.db.get_token(&self.provider, &self.channel).await?;
        if row.expiry - Utc::now() >= chrono::Duration::minutes(2) {
            return Ok(());
        }

        let refresh_token_pt = self
            .secret
            .decrypt(
                &row.refresh_ciphertext,
                row.encryption_version,
                "oauth-refresh-token",
            )
            .await
            .context("decrypting refresh token")?;
        let refresh_token =
            String::from_utf8(refresh_token_pt).context("refresh token was not valid utf-8")?;

        let refreshed = self
            .refresher
            .refresh(&refresh_token)
            .await
            .context("provider refresh call failed")?;

        let (access_ct, version, key_id) = self
            .secret
            .encrypt(refreshed.access_token.as_bytes(), "oauth-access-token")
            .await
            .context("encrypting refreshed access token")?;
        let (refresh_ct, _version2, _key_id2) = self
            .secret
            .encrypt(refreshed.refresh_token.as_bytes(), "oauth-refresh-token")
            .await
            .context("encrypting refreshed refresh token")?;

        let expiry: DateTime<Utc> = Utc::now()
            + chrono::Duration::from_std(refreshed.expires_in).unwrap_or_default();

        self.db
            .upsert_token(
                &self.provider,
                &self.channel,
                &access_ct,
                &refresh_ct,
                expiry,
                &refreshed.scope,
                encryption_version_to_i16(version),
                &key_id,
            )
            .await
            .context("writing refreshed token back")?;

        log::info!("refreshed oauth token for {}/{}", self.provider, self.channel);
        Ok(())
    }
}

/// Production [`TokenRefresher`] for the upload target's OAuth2 token
/// endpoint (`grant_type=refresh_token`), the same shape as every other
/// OAuth2 refresh flow.
#[derive(Debug)]
pub struct OAuthTokenRefresher {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
}

impl OAuthTokenRefresher {
    #[must_use]
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for OAuthTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<RefreshedToken> {
        #[derive(serde::Deserialize)]
        struct Resp {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
            expires_in: u64,
            #[serde(default)]
            scope: String,
        }

        let resp = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("sending refresh request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("refresh request failed with {status}: {body}");
        }

        let parsed: Resp = resp.json().await.context("parsing refresh response")?;
        Ok(RefreshedToken {
            access_token: parsed.access_token,
            // Some providers omit a rotated refresh token, meaning the
            // existing one is still valid; keep it rather than erroring.
            refresh_token: parsed.refresh_token.unwrap_or_else(|| refresh_token.to_owned()),
            expires_in: Duration::from_secs(parsed.expires_in),
            scope: parsed.scope,
        })
    }
}

fn encryption_version_to_i16(v: EncryptionVersion) -> i16 {
    match v {
        EncryptionVersion::Plaintext => 0,
        EncryptionVersion::DirectAead => 1,
        EncryptionVersion::Envelope => 2,
    }
}

fn jittered_interval(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let d = jittered_interval(Duration::from_secs(10), Duration::from_secs(20));
            assert!(d >= Duration::from_secs(10) && d < Duration::from_secs(20));
        }
    }

    #[test]
    fn jitter_degenerates_to_min_when_range_empty() {
        let d = jittered_interval(Duration::from_secs(5), Duration::from_secs(5));
        assert_eq!(d, Duration::from_secs(5));
    }
}
