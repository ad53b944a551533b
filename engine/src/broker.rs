use crate::repository::ScheduleRepository;
use crate::upstream::PlatformClient;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::model::config::UpstreamConfig;
use common::model::entity::{AccountModel, ProxyModel, ProxyStatus};
use errors::{ProxyError, Result, TokenError};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Fresh token material. The broker never writes it back itself; the
/// caller persists, so there is exactly one owner of the account row.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub token_expiry: DateTime<Utc>,
}

/// Token refresh and proxy-bound transport construction (one client per
/// account per attempt; reqwest clients are cheap enough at this volume
/// and a shared client cannot switch proxies).
pub struct Broker {
    repo: Arc<ScheduleRepository>,
    platform: Arc<PlatformClient>,
    config: UpstreamConfig,
    /// Plain client for OAuth and probes; those go direct, not via proxy.
    direct: reqwest::Client,
}

impl Broker {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        platform: Arc<PlatformClient>,
        config: UpstreamConfig,
    ) -> Result<Self> {
        let direct = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProxyError::TransportBuild(Box::new(e)))?;
        Ok(Self {
            repo,
            platform,
            config,
            direct,
        })
    }

    /// OAuth refresh through the account's bound profile. Requires a
    /// refresh token; a missing one is a terminal token error.
    pub async fn refresh(&self, account: &AccountModel) -> Result<RefreshOutcome> {
        let refresh_token = account
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(TokenError::MissingRefreshToken)?;
        let profile_id = account.api_profile_id.ok_or(TokenError::MissingProfile)?;
        let profile = self
            .repo
            .load_api_profile(profile_id)
            .await?
            .ok_or(TokenError::MissingProfile)?;

        let (access_token, expires_in) = self
            .platform
            .refresh_access_token(
                &self.direct,
                &profile.client_id,
                &profile.client_secret,
                refresh_token,
            )
            .await?;

        // Unknown lifetime defaults to an hour.
        let token_expiry = Utc::now() + ChronoDuration::seconds(expires_in.unwrap_or(3600));
        debug!(
            "Refreshed token for account {} (expires {})",
            account.id, token_expiry
        );
        Ok(RefreshOutcome {
            access_token,
            token_expiry,
        })
    }

    /// Valid access token for the account, refreshing and persisting when
    /// the stored one is past expiry.
    pub async fn ensure_fresh_token(&self, account: &AccountModel) -> Result<String> {
        if !account.token_expired() {
            if let Some(token) = account.access_token.as_deref().filter(|t| !t.is_empty()) {
                return Ok(token.to_string());
            }
        }
        let outcome = self.refresh(account).await?;
        self.repo
            .persist_token(account.id, &outcome.access_token, outcome.token_expiry)
            .await?;
        Ok(outcome.access_token)
    }

    /// HTTP transport bound to the account's proxy. No assigned proxy, or
    /// an inactive proxy that fails its probe, is a proxy-class failure.
    pub async fn build_transport(&self, account: &AccountModel) -> Result<reqwest::Client> {
        let proxy_id = account.proxy_id.ok_or(ProxyError::NotAssigned)?;
        let proxy = self
            .repo
            .load_proxy(proxy_id)
            .await?
            .ok_or(ProxyError::NotAssigned)?;

        if proxy.status == ProxyStatus::Inactive {
            match self.probe_proxy(&proxy).await {
                Ok(speed_ms) => {
                    // Self-healing: a dead-marked proxy that answers gets
                    // put back to work without operator action.
                    info!("Proxy {} came back, reactivating ({}ms)", proxy.id, speed_ms);
                    self.repo
                        .update_proxy_probe(proxy.id, ProxyStatus::Active, Some(speed_ms))
                        .await?;
                }
                Err(e) => {
                    self.repo
                        .update_proxy_probe(proxy.id, ProxyStatus::Inactive, None)
                        .await?;
                    return Err(e);
                }
            }
        }

        self.client_via(&proxy)
    }

    fn client_via(&self, proxy: &ProxyModel) -> Result<reqwest::Client> {
        let proxy_url = proxy.to_string();
        let upstream_proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;
        reqwest::Client::builder()
            .proxy(upstream_proxy)
            .user_agent(random_user_agent())
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .build()
            .map_err(|e| ProxyError::TransportBuild(Box::new(e)).into())
    }

    /// Liveness probe against a neutral URL. Returns the roundtrip in
    /// milliseconds; also the entry point the admin proxy-check reuses.
    pub async fn probe_proxy(&self, proxy: &ProxyModel) -> Result<i32> {
        let client = self.client_via(proxy)?;
        let start = Instant::now();
        let response = client
            .get(&self.config.probe_url)
            .timeout(Duration::from_secs(self.config.probe_timeout_secs))
            .send()
            .await
            .map_err(|e| {
                debug!("Proxy {} probe failed: {}", proxy.id, e);
                ProxyError::ProbeFailed
            })?;

        if response.status().is_success() || response.status().is_redirection() {
            Ok(start.elapsed().as_millis() as i32)
        } else {
            Err(ProxyError::ProbeFailed.into())
        }
    }

    /// `channels.list(mine=true)` roundtrip for an account; persists the
    /// channel id/title it finds. Entry point for the external
    /// account-verify action.
    pub async fn verify_account(&self, account: &AccountModel) -> Result<(String, String)> {
        let token = self.ensure_fresh_token(account).await?;
        let transport = self.build_transport(account).await?;
        let (channel_id, channel_title) = self.platform.verify_channel(&transport, &token).await?;
        self.repo
            .persist_channel(account.id, &channel_id, &channel_title)
            .await?;
        Ok((channel_id, channel_title))
    }

    /// After a proxy-class posting failure: bind the account to a random
    /// other active proxy of the same user, when one exists.
    pub async fn rotate_account_proxy(&self, account: &AccountModel) -> Result<Option<ProxyModel>> {
        let replacement = self
            .repo
            .random_active_proxy(account.user_id, account.proxy_id)
            .await?;
        match replacement {
            Some(proxy) => {
                info!(
                    "Rotating account {} from proxy {:?} to proxy {}",
                    account.id, account.proxy_id, proxy.id
                );
                self.repo.assign_proxy(account.id, Some(proxy.id)).await?;
                Ok(Some(proxy))
            }
            None => {
                warn!(
                    "No replacement proxy available for account {} (user {})",
                    account.id, account.user_id
                );
                Ok(None)
            }
        }
    }

    pub fn platform(&self) -> Arc<PlatformClient> {
        self.platform.clone()
    }

    pub fn direct_client(&self) -> reqwest::Client {
        self.direct.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_pool_is_browser_shaped() {
        for _ in 0..20 {
            let ua = random_user_agent();
            assert!(ua.starts_with("Mozilla/5.0"));
        }
    }
}
