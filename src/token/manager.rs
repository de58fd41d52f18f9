use std::collections::BTreeSet;
use std::sync::RwLock;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, DeviceAuthorizationUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::bundle::TokenBundle;
use super::store::TokenStore;
use crate::upstream::UpstreamAdapter;

/// Scopes the mailbox must have granted for the proxy to be useful at all.
pub const REQUIRED_SCOPES: &[&str] = &[
    "Mail.Send",
    "Mail.Send.Shared",
    "Mail.ReadWrite",
    "Mail.ReadWrite.Shared",
];

/// A refreshed token is reused as-is within this window rather than spending
/// another round trip to the identity endpoint (§4.2).
const REFRESH_SKIP_WINDOW: Duration = Duration::hours(1);
const HEALTHY_REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(60 * 60 * 24 * 3);
const DEGRADED_RETRY_INTERVAL: StdDuration = StdDuration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("device authorization request failed: {0}")]
    DeviceFlow(String),
    #[error("token request failed: {0}")]
    Token(String),
    #[error("granted scopes {granted:?} do not cover the required scopes {required:?}")]
    InsufficientScope {
        granted: BTreeSet<String>,
        required: &'static [&'static str],
    },
    #[error("no token bundle available; run interactive login first")]
    NoBundle,
    #[error("upstream did not return a refresh token")]
    NoRefreshToken,
}

fn identity_urls(tenant_id: &str) -> (String, String, String) {
    let base = format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0");
    (
        format!("{base}/authorize"),
        format!("{base}/token"),
        format!("{base}/devicecode"),
    )
}

/// Owns the OAuth2 token bundle for a single mailbox: drives the initial
/// device-code login, keeps the access token fresh in the background, and
/// hands out the current bearer token to the Upstream Adapter.
pub struct TokenManager {
    client_id: String,
    tenant_id: String,
    store: TokenStore,
    bundle: RwLock<Option<TokenBundle>>,
}

impl TokenManager {
    pub fn new(client_id: String, tenant_id: String, store: TokenStore) -> Self {
        let bundle = store.load();
        Self {
            client_id,
            tenant_id,
            store,
            bundle: RwLock::new(bundle),
        }
    }

    /// Drives the OAuth2 device-code flow to completion, printing the
    /// verification URL and user code for the operator, then validates the
    /// granted scopes and persists the bundle.
    pub async fn login_interactive(&self) -> Result<(), ManagerError> {
        let (authorize_url, token_url, device_url) = identity_urls(&self.tenant_id);
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(authorize_url).map_err(|e| ManagerError::DeviceFlow(e.to_string()))?,
            )
            .set_token_uri(
                TokenUrl::new(token_url).map_err(|e| ManagerError::DeviceFlow(e.to_string()))?,
            )
            .set_device_authorization_url(
                DeviceAuthorizationUrl::new(device_url)
                    .map_err(|e| ManagerError::DeviceFlow(e.to_string()))?,
            );
        let http_client = reqwest::Client::new();

        let mut request = client.exchange_device_code();
        for scope in ["offline_access"].iter().chain(REQUIRED_SCOPES.iter()) {
            request = request.add_scope(Scope::new((*scope).to_string()));
        }

        let details: oauth2::StandardDeviceAuthorizationResponse = request
            .request_async(&http_client)
            .await
            .map_err(|e| ManagerError::DeviceFlow(e.to_string()))?;

        println!(
            "To sign in, open {} and enter the code: {}",
            details.verification_uri().as_str(),
            details.user_code().secret()
        );

        let token = client
            .exchange_device_access_token(&details)
            .request_async(&http_client, tokio::time::sleep, None)
            .await
            .map_err(|e| ManagerError::Token(e.to_string()))?;

        let scopes: BTreeSet<String> = token
            .scopes()
            .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        if !REQUIRED_SCOPES.iter().all(|s| scopes.contains(*s)) {
            return Err(ManagerError::InsufficientScope {
                granted: scopes,
                required: REQUIRED_SCOPES,
            });
        }

        let bundle = TokenBundle {
            access_token: token.access_token().secret().clone(),
            refresh_token: token
                .refresh_token()
                .ok_or(ManagerError::NoRefreshToken)?
                .secret()
                .clone(),
            expires_in: token
                .expires_in()
                .map(|d| d.as_secs() as i64)
                .unwrap_or(3600),
            last_refresh: Utc::now(),
            scopes,
            extra: Default::default(),
        };

        self.store.save(&bundle);
        *self.bundle.write().unwrap() = Some(bundle);
        info!("device-code login succeeded, token bundle persisted");
        Ok(())
    }

    /// Refreshes the access token over HTTPS using the stored refresh token,
    /// unless the current bundle was refreshed within the skip window and
    /// `force` is false (§4.2).
    pub async fn ensure_fresh(&self, force: bool) -> Result<(), ManagerError> {
        let current = self
            .bundle
            .read()
            .unwrap()
            .clone()
            .ok_or(ManagerError::NoBundle)?;

        if !force && Utc::now() - current.last_refresh < REFRESH_SKIP_WINDOW {
            return Ok(());
        }

        let (authorize_url, token_url, device_url) = identity_urls(&self.tenant_id);
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(authorize_url).map_err(|e| ManagerError::DeviceFlow(e.to_string()))?,
            )
            .set_token_uri(
                TokenUrl::new(token_url).map_err(|e| ManagerError::DeviceFlow(e.to_string()))?,
            )
            .set_device_authorization_url(
                DeviceAuthorizationUrl::new(device_url)
                    .map_err(|e| ManagerError::DeviceFlow(e.to_string()))?,
            );
        let http_client = reqwest::Client::new();

        let token = client
            .exchange_refresh_token(&RefreshToken::new(current.refresh_token.clone()))
            .request_async(&http_client)
            .await
            .map_err(|e| ManagerError::Token(e.to_string()))?;

        let scopes: BTreeSet<String> = token
            .scopes()
            .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
            .unwrap_or(current.scopes);

        let refreshed = TokenBundle {
            access_token: token.access_token().secret().clone(),
            refresh_token: token
                .refresh_token()
                .map(|t| t.secret().clone())
                .unwrap_or(current.refresh_token),
            expires_in: token
                .expires_in()
                .map(|d| d.as_secs() as i64)
                .unwrap_or(current.expires_in),
            last_refresh: Utc::now(),
            scopes,
            extra: current.extra,
        };

        self.store.save(&refreshed);
        *self.bundle.write().unwrap() = Some(refreshed);
        Ok(())
    }

    /// Returns the current bearer token, refreshing first if the bundle is
    /// outside the skip window (§4.2). A refresh failure here still falls
    /// back to whatever token is cached, since an expired-but-present token
    /// is more useful to the caller than `None`.
    pub async fn get_access_token(&self) -> Option<String> {
        if let Err(err) = self.ensure_fresh(false).await {
            warn!("token refresh on demand failed, using cached token: {err}");
        }

        self.bundle
            .read()
            .unwrap()
            .as_ref()
            .map(|b| b.access_token.clone())
    }

    pub fn has_bundle(&self) -> bool {
        self.bundle.read().unwrap().is_some()
    }

    #[cfg(test)]
    pub fn seed_for_test(&self, bundle: TokenBundle) {
        *self.bundle.write().unwrap() = Some(bundle);
    }

    /// Background refresh loop (§4.2 supplement): while the upstream is
    /// unreachable, back off and re-check rather than spending refresh
    /// attempts; once healthy, refresh on a multi-day cadence and signal the
    /// supervisor to shut down if a refresh ever fails outright.
    pub async fn run_refresh_loop(
        self: std::sync::Arc<Self>,
        adapter: std::sync::Arc<UpstreamAdapter>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                reachable = adapter.is_reachable() => {
                    if !reachable {
                        warn!("upstream unreachable, deferring token refresh");
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(DEGRADED_RETRY_INTERVAL) => continue,
                        }
                    }
                }
            }

            match self.ensure_fresh(false).await {
                Ok(()) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(HEALTHY_REFRESH_INTERVAL) => {}
                    }
                }
                Err(err) => {
                    error!("token refresh failed, requesting shutdown: {err}");
                    shutdown.cancel();
                    return;
                }
            }
        }
    }
}
