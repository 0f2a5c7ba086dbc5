use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use crate::db::{AccountTotals, Store};
use crate::models::{CachedAccount, ProcessMode, ProcessSummary, RunConfiguration};
use crate::riot_client::{DateWindow, UpstreamApi};
use crate::scoring::score_match;

pub const ACCOUNT_NOT_FOUND: &str = "account not found";
const DEMO_ACCOUNTS: usize = 5;

/// Date range listed for an account in the given mode, or `None` when the mode has
/// nothing to look at yet.
pub fn window_for(mode: ProcessMode, config: &RunConfiguration, today: NaiveDate) -> Option<DateWindow> {
    match mode {
        ProcessMode::FullWindow => Some(DateWindow {
            start: config.start_date,
            end: config.end_date,
        }),
        ProcessMode::RefreshToday => {
            let day = today.min(config.end_date);
            (day >= config.start_date).then_some(DateWindow {
                start: day,
                end: day,
            })
        }
    }
}

/// First occurrence wins; order is otherwise kept.
pub fn dedupe_match_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Walks the stalest accounts one at a time, resolving identities, caching newly
/// scored matches and (in full-window mode) recomputing totals.
pub struct AccountProcessor {
    store: Arc<Store>,
    upstream: Arc<dyn UpstreamApi>,
}

impl AccountProcessor {
    pub fn new(store: Arc<Store>, upstream: Arc<dyn UpstreamApi>) -> Self {
        Self { store, upstream }
    }

    pub async fn process_batch(
        &self,
        config: &RunConfiguration,
        batch_size: usize,
        mode: ProcessMode,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<ProcessSummary> {
        let accounts = self.store.stale_accounts(batch_size, today)?;
        info!(
            "Processing {} accounts ({:?}) for {} to {}",
            accounts.len(),
            mode,
            config.start_date,
            config.end_date
        );

        for account in &accounts {
            if let Err(e) = self.process_account(account, config, mode, today, now).await {
                error!("Failed to process {}: {:#}", account.riot_id(), e);
                if let Err(e) = self.store.record_error(account.id, &format!("{:#}", e), now) {
                    error!("Failed to record error for {}: {:#}", account.riot_id(), e);
                }
            }
        }

        let mut demo5_accounts = Vec::with_capacity(DEMO_ACCOUNTS);
        for account in accounts.iter().take(DEMO_ACCOUNTS) {
            if let Some(current) = self.store.get_account_by_id(account.id)? {
                demo5_accounts.push(current);
            }
        }
        Ok(ProcessSummary {
            total_accounts: accounts.len(),
            demo5_accounts,
        })
    }

    async fn process_account(
        &self,
        account: &CachedAccount,
        config: &RunConfiguration,
        mode: ProcessMode,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(puuid) = self.resolve_puuid(account, now).await? else {
            return Ok(());
        };
        let mut account = account.clone();
        account.puuid = Some(puuid.clone());

        let Some(window) = window_for(mode, config, today) else {
            debug!("Campaign has not started yet, nothing to list for {}", account.riot_id());
            self.store.mark_refreshed(account.id, now)?;
            return Ok(());
        };

        let Some(listed) = self.upstream.list_all_match_ids(&puuid, window).await else {
            return Err(anyhow!("Match listing failed for {}", account.riot_id()));
        };
        let match_ids = dedupe_match_ids(listed);
        let mut cached = self.store.fetch_cached_matches(&match_ids)?;
        let missing: Vec<String> = match_ids
            .iter()
            .filter(|id| !cached.contains_key(*id))
            .cloned()
            .collect();
        debug!(
            "{}: {} match ids, {} cached, {} to fetch",
            account.riot_id(),
            match_ids.len(),
            cached.len(),
            missing.len()
        );

        if !missing.is_empty() {
            let scored: Vec<_> = self
                .upstream
                .fetch_match_details(&missing)
                .await
                .into_iter()
                .filter_map(|(_, fetched)| fetched)
                .filter_map(|raw| score_match(&raw))
                .collect();
            self.store.upsert_matches(&scored)?;
            cached.extend(scored.into_iter().map(|m| (m.match_id.clone(), m)));
        }

        match mode {
            ProcessMode::RefreshToday => self.store.mark_refreshed(account.id, now)?,
            ProcessMode::FullWindow => {
                let totals = AccountTotals {
                    total_points: match_ids
                        .iter()
                        .filter_map(|id| cached.get(id))
                        .map(|m| m.points_for(&account))
                        .sum(),
                    total_matches: match_ids.len() as i64,
                };
                info!(
                    "{}: {} points over {} matches",
                    account.riot_id(),
                    totals.total_points,
                    totals.total_matches
                );
                self.store.record_totals(account.id, totals, now, today)?;
            }
        }
        Ok(())
    }

    /// Returns the stored puuid, or looks it up and saves it. An identity the upstream
    /// does not know is marked and skipped.
    async fn resolve_puuid(&self, account: &CachedAccount, now: DateTime<Utc>) -> Result<Option<String>> {
        if let Some(puuid) = &account.puuid {
            return Ok(Some(puuid.clone()));
        }
        match self
            .upstream
            .resolve_account(&account.game_name, &account.tag_line)
            .await
        {
            Some(resolved) => {
                let puuid = resolved.puuid;
                if puuid.is_empty() {
                    return Err(anyhow!("Resolved {} without a puuid", account.riot_id()));
                }
                self.store.set_puuid(account.id, &puuid)?;
                info!("Resolved {}", account.riot_id());
                Ok(Some(puuid))
            }
            None => {
                warn!("Could not resolve {}", account.riot_id());
                self.store.record_error(account.id, ACCOUNT_NOT_FOUND, now)?;
                Ok(None)
            }
        }
    }
}
