use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream;
use futures_util::StreamExt;
use http::{HeaderValue, StatusCode};
use riven::consts::RegionalRoute;
use riven::models::account_v1::Account;
use serde::de::DeserializeOwned;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::models::TftMatch;
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::riot_utils::{backoff_delay, retry_after};

/// Inclusive range of calendar days, turned into the epoch-second bounds the API expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn start_time(&self) -> i64 {
        self.start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default()
    }

    /// Exclusive end: midnight after the last day.
    pub fn end_time(&self) -> i64 {
        self.end
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(i64::MAX)
    }
}

/// The three read endpoints the leaderboard needs.
///
/// Identity and detail lookups that fail for any reason come back as `None`; callers skip
/// and move on. A listing that fails also comes back as `None`, so it is never mistaken
/// for an account with no matches.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn resolve_account(&self, game_name: &str, tag_line: &str) -> Option<Account>;

    async fn list_match_ids(
        &self,
        puuid: &str,
        offset: usize,
        page_size: usize,
        window: DateWindow,
    ) -> Option<Vec<String>>;

    async fn fetch_match_detail(&self, match_id: &str) -> Option<TftMatch>;

    fn page_size(&self) -> usize {
        100
    }

    /// Every id in the window, or `None` as soon as any page fails.
    async fn list_all_match_ids(&self, puuid: &str, window: DateWindow) -> Option<Vec<String>> {
        let page_size = self.page_size().max(1);
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.list_match_ids(puuid, offset, page_size, window).await?;
            let short_page = page.len() < page_size;
            offset += page.len();
            ids.extend(page);
            if short_page {
                break;
            }
        }
        Some(ids)
    }

    /// Fetches details in order; ids that fail come back paired with `None`.
    async fn fetch_match_details(&self, match_ids: &[String]) -> Vec<(String, Option<TftMatch>)> {
        stream::iter(match_ids)
            .then(|id| async move { (id.clone(), self.fetch_match_detail(id).await) })
            .collect::<Vec<_>>()
            .await
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

const RIOT_TOKEN_HEADER: &str = "X-Riot-Token";

// Keys for the per-endpoint method quotas.
const ACCOUNT_BY_RIOT_ID: &str = "account-v1.by-riot-id";
const MATCH_IDS_BY_PUUID: &str = "tft-match-v1.ids-by-puuid";
const MATCH_BY_ID: &str = "tft-match-v1.by-id";

enum Fetched<T> {
    Found(T),
    NotFound(StatusCode),
    Throttled(Option<Duration>),
}

pub struct RiotClient {
    http: reqwest::Client,
    api_key: HeaderValue,
    base_url: String,
    limiter: Arc<AdaptiveRateLimiter>,
    min_call_spacing: Duration,
    page_size: usize,
    retry: RetryPolicy,
}

impl RiotClient {
    pub fn new(
        api_key: &str,
        region: RegionalRoute,
        limiter: Arc<AdaptiveRateLimiter>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        let mut api_key =
            HeaderValue::from_str(api_key).context("The Riot API key is not a valid header")?;
        api_key.set_sensitive(true);
        Ok(Self {
            http,
            api_key,
            base_url: regional_base_url(region),
            limiter,
            min_call_spacing: Duration::from_millis(900),
            page_size: 100,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_min_call_spacing(mut self, spacing: Duration) -> Self {
        self.min_call_spacing = spacing;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn get<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Fetched<T>> {
        self.limiter.acquire(method).await;
        let started = Instant::now();
        let outcome = self.send(method, path, query).await;
        self.courtesy_pause(started).await;
        outcome
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Fetched<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header(RIOT_TOKEN_HEADER, self.api_key.clone())
            .query(query)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Request to {} failed", path))?;

        self.limiter.update_from_headers(method, response.headers());
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(Fetched::Throttled(retry_after(response.headers())));
        }
        if status == StatusCode::FORBIDDEN {
            error!("The Riot key was rejected on {}", path);
        }
        if status.is_client_error() {
            return Ok(Fetched::NotFound(status));
        }
        if !status.is_success() {
            return Err(anyhow!("Upstream returned {} for {}", status, path));
        }
        let body = response
            .json::<T>()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Unable to decode response from {}", path))?;
        Ok(Fetched::Found(body))
    }

    // Keeps at least `min_call_spacing` between the start of consecutive calls.
    async fn courtesy_pause(&self, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed < self.min_call_spacing {
            sleep(self.min_call_spacing - elapsed).await;
        }
    }

    /// Repeats a throttled call until it gets an answer or the retry budget is spent,
    /// waiting for `Retry-After` when it is given and backing off exponentially otherwise.
    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Fetched<T>> {
        let mut retries = 0;
        loop {
            match self.get::<T>(method, path, query).await? {
                Fetched::Throttled(wait) if retries < self.retry.max_retries => {
                    let wait =
                        wait.unwrap_or_else(|| backoff_delay(self.retry.base_delay, retries));
                    warn!(
                        "Rate limited on {} - waiting {:?} (retry {})",
                        path,
                        wait,
                        retries + 1
                    );
                    sleep(wait).await;
                    retries += 1;
                }
                other => return Ok(other),
            }
        }
    }

    async fn fetch_with_retry(&self, match_id: &str) -> Option<TftMatch> {
        match self
            .get_with_retry::<TftMatch>(MATCH_BY_ID, &match_path(match_id), &[])
            .await
        {
            Ok(Fetched::Found(found)) => Some(found),
            Ok(Fetched::NotFound(status)) => {
                info!("Match {} not available ({})", match_id, status);
                None
            }
            Ok(Fetched::Throttled(_)) => {
                warn!(
                    "Giving up on match {} after {} throttled retries",
                    match_id, self.retry.max_retries
                );
                None
            }
            Err(e) => {
                error!("Failed to fetch match {}: {:#}", match_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl UpstreamApi for RiotClient {
    async fn resolve_account(&self, game_name: &str, tag_line: &str) -> Option<Account> {
        let path = account_path(game_name, tag_line);
        match self.get::<Account>(ACCOUNT_BY_RIOT_ID, &path, &[]).await {
            Ok(Fetched::Found(account)) => Some(account),
            Ok(Fetched::NotFound(status)) => {
                info!("No account for {}#{} ({})", game_name, tag_line, status);
                None
            }
            Ok(Fetched::Throttled(_)) => {
                warn!("Rate limited resolving {}#{}", game_name, tag_line);
                None
            }
            Err(e) => {
                error!("Error resolving {}#{}: {:#}", game_name, tag_line, e);
                None
            }
        }
    }

    async fn list_match_ids(
        &self,
        puuid: &str,
        offset: usize,
        page_size: usize,
        window: DateWindow,
    ) -> Option<Vec<String>> {
        let path = format!("/tft/match/v1/matches/by-puuid/{}/ids", puuid);
        let query = [
            ("start", offset.to_string()),
            ("count", page_size.to_string()),
            ("startTime", window.start_time().to_string()),
            ("endTime", window.end_time().to_string()),
        ];
        match self
            .get_with_retry::<Vec<String>>(MATCH_IDS_BY_PUUID, &path, &query)
            .await
        {
            Ok(Fetched::Found(ids)) => {
                debug!("Listed {} match ids for {} at offset {}", ids.len(), puuid, offset);
                Some(ids)
            }
            Ok(Fetched::NotFound(StatusCode::NOT_FOUND)) => {
                info!("No match history for {}", puuid);
                Some(Vec::new())
            }
            Ok(Fetched::NotFound(status)) => {
                warn!("Listing matches for {} was refused ({})", puuid, status);
                None
            }
            Ok(Fetched::Throttled(_)) => {
                warn!(
                    "Giving up listing matches for {} after {} throttled retries",
                    puuid, self.retry.max_retries
                );
                None
            }
            Err(e) => {
                error!("Error listing matches for {}: {:#}", puuid, e);
                None
            }
        }
    }

    async fn fetch_match_detail(&self, match_id: &str) -> Option<TftMatch> {
        match self
            .get::<TftMatch>(MATCH_BY_ID, &match_path(match_id), &[])
            .await
        {
            Ok(Fetched::Found(found)) => Some(found),
            Ok(Fetched::NotFound(status)) => {
                info!("Match {} not available ({})", match_id, status);
                None
            }
            Ok(Fetched::Throttled(_)) => {
                warn!("Rate limited fetching match {}", match_id);
                None
            }
            Err(e) => {
                error!("Failed to fetch match {}: {:#}", match_id, e);
                None
            }
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_match_details(&self, match_ids: &[String]) -> Vec<(String, Option<TftMatch>)> {
        let mut results = Vec::with_capacity(match_ids.len());
        for match_id in match_ids {
            results.push((match_id.clone(), self.fetch_with_retry(match_id).await));
        }
        let failed = results.iter().filter(|(_, m)| m.is_none()).count();
        if failed > 0 {
            warn!("{} of {} match fetches failed", failed, results.len());
        }
        results
    }
}

pub fn regional_base_url(region: RegionalRoute) -> String {
    format!(
        "https://{}.api.riotgames.com",
        region.to_string().to_lowercase()
    )
}

fn account_path(game_name: &str, tag_line: &str) -> String {
    format!(
        "/riot/account/v1/accounts/by-riot-id/{}/{}",
        urlencoding::encode(game_name),
        urlencoding::encode(tag_line)
    )
}

fn match_path(match_id: &str) -> String {
    format!("/tft/match/v1/matches/{}", urlencoding::encode(match_id))
}
