use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;
use riven::consts::RegionalRoute;
use serde::Serialize;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter, prelude::*, Layer};

use crate::db::Store;
use crate::importer::{ImportRequest, Importer};
use crate::models::ProcessMode;
use crate::processor::AccountProcessor;
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::riot_client::{RetryPolicy, RiotClient};
use crate::run_config::RunConfigError;
use crate::scheduler::{Schedules, Scheduler, TriggerOutcome};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod db;
mod importer;
mod models;
mod processor;
mod rate_limiter;
mod riot_client;
mod riot_utils;
mod run_config;
mod scheduler;
mod scoring;

#[derive(Debug, Clone)]
struct Config {
    riot_api_token: String,
    region: RegionalRoute,
    log_path: PathBuf,
    db_path: PathBuf,
    run_config_path: PathBuf,
    uploads_dir: PathBuf,
    batch_size: usize,
    today_cron: String,
    full_cron: String,
    min_call_spacing: Duration,
    retry: RetryPolicy,
    match_page_size: usize,
    campaign_grace_days: u64,
    console_addr: Option<SocketAddr>,
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(default),
    }
}

fn load_config() -> Result<Config> {
    dotenv().ok();

    let riot_api_token = env::var("RIOT_API_TOKEN").context("Missing RIOT_API_TOKEN")?;

    let region = env::var("RIOT_REGION")
        .unwrap_or_else(|_| "AMERICAS".to_string())
        .to_uppercase()
        .parse::<RegionalRoute>()
        .context("Invalid RIOT_REGION (expected e.g. AMERICAS, EUROPE, ASIA, SEA)")?;

    let log_path_str = env::var("LOG_PATH").unwrap_or_else(|_| {
        if cfg!(target_os = "linux") {
            "/var/logs/tft-leaderboard"
        } else {
            "."
        }
        .to_string()
    });

    let console_addr = match env::var("TOKIO_CONSOLE_ADDR") {
        Ok(addr) => Some(
            addr.parse::<SocketAddr>()
                .context("Invalid TOKIO_CONSOLE_ADDR (must be host:port)")?,
        ),
        Err(_) => None,
    };

    Ok(Config {
        riot_api_token,
        region,
        log_path: PathBuf::from(log_path_str),
        db_path: env_or("DB_PATH", PathBuf::from("sqlite.db"))?,
        run_config_path: env_or("RUN_CONFIG_PATH", PathBuf::from("run-config.json"))?,
        uploads_dir: env_or("UPLOADS_DIR", PathBuf::from("uploads"))?,
        batch_size: env_or("BATCH_SIZE", 10)?,
        today_cron: env::var("TODAY_CRON").unwrap_or_else(|_| "0 */10 8-21 * * *".to_string()),
        full_cron: env::var("FULL_CRON").unwrap_or_else(|_| "0 5/10 0-7,22-23 * * *".to_string()),
        min_call_spacing: Duration::from_millis(env_or("MIN_CALL_SPACING_MS", 900)?),
        retry: RetryPolicy {
            max_retries: env_or("MAX_RETRIES", 3)?,
            base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 1000)?),
        },
        match_page_size: env_or("MATCH_PAGE_SIZE", 100)?,
        campaign_grace_days: env_or("CAMPAIGN_GRACE_DAYS", 2)?,
        console_addr,
    })
}

fn init_tracing(config: &Config) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&config.log_path, "server.log");
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);
    let console_layer = config
        .console_addr
        .map(|addr| console_subscriber::ConsoleLayer::builder().server_addr(addr).spawn());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_appender)
                .with_filter(filter::filter_fn(|metadata| {
                    metadata.target().starts_with("tft_leaderboard")
                })),
        )
        .init();
    guard
}

/// Seeds and drives the TFT campaign leaderboard.
#[derive(Debug, Parser)]
#[command(name = "tft-leaderboard", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run both scheduled passes until Ctrl-C.
    Serve,
    /// Load a roster file and set the campaign window.
    Import {
        roster: PathBuf,
        #[arg(long)]
        start_date: String,
        #[arg(long)]
        end_date: String,
        /// Drop every cached account and match first.
        #[arg(long)]
        clear_cache: bool,
    },
    /// Process one batch of stale accounts now.
    Process {
        #[arg(long)]
        batch_size: Option<usize>,
        /// Only refresh today's matches instead of recomputing totals.
        #[arg(long)]
        today: bool,
    },
    Leaderboard {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one cached account, by `name#tag` or `name-tag`.
    Lookup {
        riot_id: String,
    },
    Status,
    /// Pause scheduled processing.
    Stop,
    Resume,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    cache: models::CacheCounts,
    run_configuration: Option<models::RunConfiguration>,
    unresolved: Vec<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let store = Arc::new(Store::open(&config.db_path)?);
    let limiter = Arc::new(AdaptiveRateLimiter::new());
    let client = RiotClient::new(&config.riot_api_token, config.region, limiter)?
        .with_min_call_spacing(config.min_call_spacing)
        .with_page_size(config.match_page_size)
        .with_retry_policy(config.retry.clone());
    let processor = AccountProcessor::new(store, Arc::new(client));
    let lock_dir = config
        .db_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    Ok(Scheduler::new(
        processor,
        config.run_config_path.clone(),
        config.campaign_grace_days,
    )
    .with_lock_dir(lock_dir))
}

async fn run(command: Command, config: Arc<Config>) -> Result<()> {
    match command {
        Command::Serve => {
            let scheduler = Arc::new(build_scheduler(&config)?);
            let schedules = Schedules {
                today_cron: config.today_cron.clone(),
                full_cron: config.full_cron.clone(),
                batch_size: config.batch_size,
            };
            let mut sched = scheduler.schedule(&schedules).await?;
            sched.start().await.context("Failed to start job scheduler")?;
            info!("Scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down scheduler");
            sched
                .shutdown()
                .await
                .context("Failed to stop job scheduler")?;
            Ok(())
        }
        Command::Import {
            roster,
            start_date,
            end_date,
            clear_cache,
        } => {
            let store = Store::open(&config.db_path)?;
            let roster = std::fs::read(&roster)
                .with_context(|| format!("Failed to read roster {}", roster.display()))?;
            let importer = Importer::new(&store, &config.uploads_dir, &config.run_config_path);
            let summary = importer.import(&ImportRequest {
                roster,
                start_date,
                end_date,
                clear_cache,
            })?;
            info!("Import finished: {:?}", summary);
            print_json(&summary)
        }
        Command::Process { batch_size, today } => {
            let scheduler = build_scheduler(&config)?;
            let mode = if today {
                ProcessMode::RefreshToday
            } else {
                ProcessMode::FullWindow
            };
            match scheduler
                .trigger(mode, batch_size.unwrap_or(config.batch_size))
                .await?
            {
                TriggerOutcome::Completed(summary) => print_json(&summary),
                TriggerOutcome::Skipped(reason) => {
                    print_json(&serde_json::json!({ "skipped": reason }))
                }
                TriggerOutcome::AlreadyRunning => {
                    print_json(&serde_json::json!({ "skipped": "already running" }))
                }
            }
        }
        Command::Leaderboard { limit } => {
            let store = Store::open(&config.db_path)?;
            print_json(&store.leaderboard(limit)?)
        }
        Command::Lookup { riot_id } => {
            let id = riot_utils::parse_riot_id(&riot_id)?;
            let store = Store::open(&config.db_path)?;
            let account = store
                .get_account(&id.name, &id.tag)?
                .with_context(|| format!("{}#{} is not in the cache", id.name, id.tag))?;
            print_json(&account)
        }
        Command::Status => {
            let store = Store::open(&config.db_path)?;
            let run_configuration = match run_config::load(&config.run_config_path) {
                Ok(loaded) => Some(loaded),
                Err(RunConfigError::Missing(_)) => None,
                Err(e) => return Err(e.into()),
            };
            print_json(&StatusReport {
                cache: store.cache_counts()?,
                run_configuration,
                unresolved: store
                    .accounts_without_puuid()?
                    .iter()
                    .map(models::CachedAccount::riot_id)
                    .collect(),
            })
        }
        Command::Stop => print_json(&run_config::set_stop_job(&config.run_config_path, true)?),
        Command::Resume => print_json(&run_config::set_stop_job(&config.run_config_path, false)?),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    std::panic::set_hook(Box::new(|i| {
        error!("Panic'd: {}", i);
    }));

    let _guard = init_tracing(&config);
    info!("Running {:?}", cli.command);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("unable to process");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
pub mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;
    use clap::CommandFactory;
    use riven::models::account_v1::Account;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::models::{account_key, TftInfo, TftMatch, TftMetadata, TftParticipant};
    use crate::riot_client::{DateWindow, UpstreamApi};

    pub fn setup_in_memory_store() -> Result<Store> {
        Store::open_in_memory()
    }

    pub fn create_test_match(
        match_id: &str,
        end_of_game_result: &str,
        game_mode: &str,
        participants: Vec<TftParticipant>,
    ) -> TftMatch {
        TftMatch {
            metadata: TftMetadata {
                match_id: match_id.to_string(),
            },
            info: TftInfo {
                end_of_game_result: Some(end_of_game_result.to_string()),
                tft_game_type: Some(game_mode.to_string()),
                game_creation: Some(1_735_725_600_000),
                game_datetime: None,
                participants,
            },
        }
    }

    /// An empty `puuid` leaves the participant anonymous.
    pub fn create_test_participant(
        puuid: &str,
        game_name: &str,
        tag_line: &str,
        placement: i64,
        time_eliminated: f64,
        last_round: i64,
    ) -> TftParticipant {
        let puuid = (!puuid.is_empty()).then_some(puuid);
        serde_json::from_value(json!({
            "puuid": puuid,
            "riotIdGameName": game_name,
            "riotIdTagline": tag_line,
            "placement": placement,
            "time_eliminated": time_eliminated,
            "last_round": last_round,
            "level": 9,
        }))
        .unwrap()
    }

    /// In-memory upstream that serves canned accounts, match ids and details and
    /// records what it was asked for.
    pub struct FakeUpstream {
        page_size: usize,
        accounts: HashMap<String, String>,
        match_ids: HashMap<String, Vec<String>>,
        matches: HashMap<String, TftMatch>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
        failing_pages: HashSet<(String, usize)>,
        offsets: Mutex<Vec<usize>>,
        fetches: Mutex<HashMap<String, usize>>,
    }

    impl FakeUpstream {
        pub fn new() -> Self {
            Self {
                page_size: 100,
                accounts: HashMap::new(),
                match_ids: HashMap::new(),
                matches: HashMap::new(),
                gate: None,
                failing_pages: HashSet::new(),
                offsets: Mutex::new(Vec::new()),
                fetches: Mutex::new(HashMap::new()),
            }
        }

        pub fn with_page_size(mut self, page_size: usize) -> Self {
            self.page_size = page_size;
            self
        }

        pub fn with_account(mut self, game_name: &str, tag_line: &str, puuid: &str) -> Self {
            self.accounts
                .insert(account_key(game_name, tag_line), puuid.to_string());
            self
        }

        pub fn with_match_ids(mut self, puuid: &str, ids: Vec<String>) -> Self {
            self.match_ids.insert(puuid.to_string(), ids);
            self
        }

        pub fn with_match(mut self, tft_match: TftMatch) -> Self {
            self.matches
                .insert(tft_match.metadata.match_id.clone(), tft_match);
            self
        }

        /// Listing signals `entered`, then waits for `release`.
        pub fn with_gate(mut self, entered: Arc<Notify>, release: Arc<Notify>) -> Self {
            self.gate = Some((entered, release));
            self
        }

        /// The listing page at `offset` for `puuid` fails.
        pub fn with_listing_failure(mut self, puuid: &str, offset: usize) -> Self {
            self.failing_pages.insert((puuid.to_string(), offset));
            self
        }

        pub fn list_offsets(&self) -> Vec<usize> {
            self.offsets.lock().unwrap().clone()
        }

        pub fn fetch_count(&self, match_id: &str) -> usize {
            self.fetches
                .lock()
                .unwrap()
                .get(match_id)
                .copied()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl UpstreamApi for FakeUpstream {
        async fn resolve_account(&self, game_name: &str, tag_line: &str) -> Option<Account> {
            let puuid = self.accounts.get(&account_key(game_name, tag_line))?;
            serde_json::from_value(json!({
                "puuid": puuid,
                "gameName": game_name,
                "tagLine": tag_line,
            }))
            .ok()
        }

        async fn list_match_ids(
            &self,
            puuid: &str,
            offset: usize,
            page_size: usize,
            _window: DateWindow,
        ) -> Option<Vec<String>> {
            self.offsets.lock().unwrap().push(offset);
            if let Some((entered, release)) = self.gate.clone() {
                entered.notify_one();
                release.notified().await;
            }
            if self.failing_pages.contains(&(puuid.to_string(), offset)) {
                return None;
            }
            let ids = self.match_ids.get(puuid).cloned().unwrap_or_default();
            Some(ids.into_iter().skip(offset).take(page_size).collect())
        }

        async fn fetch_match_detail(&self, match_id: &str) -> Option<TftMatch> {
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(match_id.to_string())
                .or_default() += 1;
            self.matches.get(match_id).cloned()
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_import() {
        let cli = Cli::try_parse_from([
            "tft-leaderboard",
            "import",
            "roster.csv",
            "--start-date",
            "2025-01-01",
            "--end-date",
            "2025-01-31",
            "--clear-cache",
        ])
        .unwrap();
        match cli.command {
            Command::Import {
                roster,
                start_date,
                end_date,
                clear_cache,
            } => {
                assert_eq!(roster, PathBuf::from("roster.csv"));
                assert_eq!(start_date, "2025-01-01");
                assert_eq!(end_date, "2025-01-31");
                assert!(clear_cache);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_process_defaults() {
        let cli = Cli::try_parse_from(["tft-leaderboard", "process"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Process {
                batch_size: None,
                today: false
            }
        ));
    }

    #[tokio::test]
    async fn test_fake_upstream_resolves_case_insensitively() {
        let upstream = FakeUpstream::new().with_account("Alice", "NA1", "alice-puuid");
        let account = upstream.resolve_account("alice", "na1").await.unwrap();
        assert_eq!(account.puuid, "alice-puuid");
        assert!(upstream.resolve_account("bob", "na1").await.is_none());
    }
}
