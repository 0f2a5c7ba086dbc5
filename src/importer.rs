use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::Store;
use crate::models::{account_key, AccountUpsert, ImportSummary, RunConfiguration};
use crate::riot_utils::{parse_riot_id, GameId};
use crate::run_config;

pub const MAX_ROSTER_ROWS: usize = 5000;
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Problems that reject a whole import before anything is written.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("roster has {rows} rows, the limit is {limit}")]
    TooManyRows { rows: usize, limit: usize },

    #[error("roster is empty")]
    Empty,

    #[error("could not read roster: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid {field} '{value}', expected YYYY-MM-DD")]
    BadDate { field: &'static str, value: String },

    #[error("end date {end} is before start date {start}")]
    InvertedWindow { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub roster: Vec<u8>,
    pub start_date: String,
    pub end_date: String,
    pub clear_cache: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedRoster {
    pub accounts: Vec<GameId>,
    pub failed: usize,
}

pub struct Importer<'a> {
    store: &'a Store,
    uploads_dir: &'a Path,
    run_config_path: &'a Path,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a Store, uploads_dir: &'a Path, run_config_path: &'a Path) -> Self {
        Self {
            store,
            uploads_dir,
            run_config_path,
        }
    }

    pub fn import(&self, request: &ImportRequest) -> Result<ImportSummary> {
        let start_date = parse_date("start date", &request.start_date)?;
        let end_date = parse_date("end date", &request.end_date)?;
        if end_date < start_date {
            return Err(ImportError::InvertedWindow {
                start: start_date,
                end: end_date,
            }
            .into());
        }
        let roster = parse_roster(&request.roster)?;
        info!(
            "Roster parsed: {} accounts, {} rows rejected",
            roster.accounts.len(),
            roster.failed
        );

        let roster_path = self.persist_roster(&request.roster)?;

        if request.clear_cache {
            warn!("Clearing cache before import");
            self.store.clear_cache()?;
        }

        let batch: Vec<AccountUpsert> = roster
            .accounts
            .iter()
            .enumerate()
            .map(|(order, id)| AccountUpsert {
                import_order: Some(order as i64),
                ..AccountUpsert::new(&id.name, &id.tag)
            })
            .collect();
        self.store.upsert_accounts(&batch)?;

        run_config::save(
            self.run_config_path,
            &RunConfiguration {
                start_date,
                end_date,
                roster_path: roster_path.to_string_lossy().into_owned(),
                is_stop_job: false,
            },
        )?;

        let counts = self.store.cache_counts()?;
        Ok(ImportSummary {
            total_parsed: roster.accounts.len(),
            total_failed: roster.failed,
            total_cached: counts.total_accounts,
            with_puuid: counts.with_puuid,
            without_puuid: counts.without_puuid,
        })
    }

    /// Stores the upload under a random name and returns the path relative to the
    /// uploads directory's parent.
    fn persist_roster(&self, roster: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(self.uploads_dir).with_context(|| {
            format!(
                "Failed to create uploads directory {}",
                self.uploads_dir.display()
            )
        })?;
        let file_name = format!("{}.csv", random_name());
        let full_path = self.uploads_dir.join(&file_name);
        std::fs::write(&full_path, roster)
            .with_context(|| format!("Failed to write roster to {}", full_path.display()))?;
        let relative = self
            .uploads_dir
            .file_name()
            .map(|dir| Path::new(dir).join(&file_name))
            .unwrap_or_else(|| PathBuf::from(&file_name));
        Ok(relative)
    }
}

fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, ImportError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| ImportError::BadDate {
        field,
        value: value.to_string(),
    })
}

/// Reads one Riot ID per row (first column), dropping duplicates and counting bad rows.
pub fn parse_roster(raw: &[u8]) -> Result<ParsedRoster, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw);

    let mut tokens = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(token) = record.get(0).filter(|t| !t.is_empty()) {
            tokens.push(token.to_string());
        }
    }
    if tokens.is_empty() {
        return Err(ImportError::Empty);
    }
    if tokens.len() > MAX_ROSTER_ROWS {
        return Err(ImportError::TooManyRows {
            rows: tokens.len(),
            limit: MAX_ROSTER_ROWS,
        });
    }

    let mut roster = ParsedRoster::default();
    let mut seen = HashSet::new();
    for token in tokens {
        match parse_riot_id(&token) {
            Ok(id) => {
                if seen.insert(account_key(&id.name, &id.tag)) {
                    roster.accounts.push(id);
                }
            }
            Err(e) => {
                warn!("Skipping roster row '{}': {}", token, e);
                roster.failed += 1;
            }
        }
    }
    Ok(roster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::setup_in_memory_store;

    fn request(roster: &str) -> ImportRequest {
        ImportRequest {
            roster: roster.as_bytes().to_vec(),
            start_date: "2025-01-01".to_string(),
            end_date: "2025-01-31".to_string(),
            clear_cache: false,
        }
    }

    #[test]
    fn test_import_seeds_accounts_and_run_config() -> Result<()> {
        let store = setup_in_memory_store()?;
        let dir = tempfile::tempdir()?;
        let uploads = dir.path().join("uploads");
        let config_path = dir.path().join("run-config.json");
        let importer = Importer::new(&store, &uploads, &config_path);

        let summary = importer.import(&request("alice-na1\nbob#na1\nbad-row-no-tag\n"))?;

        assert_eq!(summary.total_parsed, 2);
        assert_eq!(summary.total_failed, 1);
        assert_eq!(summary.total_cached, 2);
        assert_eq!(summary.with_puuid, 0);
        assert_eq!(summary.without_puuid, 2);

        let alice = store.get_account("alice", "na1")?.unwrap();
        assert_eq!(alice.puuid, None);
        assert_eq!(alice.import_order, Some(0));
        assert!(store.get_account("bob", "NA1")?.is_some());

        let config = run_config::load(&config_path)?;
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(config.end_date, NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
        assert!(!config.is_stop_job);
        assert!(config.roster_path.starts_with("uploads"));
        assert!(dir.path().join(&config.roster_path).exists());
        Ok(())
    }

    #[test]
    fn test_reimport_keeps_resolved_identity() -> Result<()> {
        let store = setup_in_memory_store()?;
        let dir = tempfile::tempdir()?;
        let uploads = dir.path().join("uploads");
        let config_path = dir.path().join("run-config.json");
        let importer = Importer::new(&store, &uploads, &config_path);

        importer.import(&request("alice-na1"))?;
        store.upsert_accounts(&[AccountUpsert {
            puuid: Some("alice-puuid".to_string()),
            ..AccountUpsert::new("alice", "na1")
        }])?;
        let summary = importer.import(&request("Alice#NA1\ncarol-euw"))?;

        assert_eq!(summary.total_cached, 2);
        assert_eq!(summary.with_puuid, 1);
        Ok(())
    }

    #[test]
    fn test_clear_cache_drops_previous_accounts() -> Result<()> {
        let store = setup_in_memory_store()?;
        let dir = tempfile::tempdir()?;
        let uploads = dir.path().join("uploads");
        let config_path = dir.path().join("run-config.json");
        let importer = Importer::new(&store, &uploads, &config_path);

        importer.import(&request("alice-na1\nbob-na1"))?;
        let summary = importer.import(&ImportRequest {
            clear_cache: true,
            ..request("carol-na1")
        })?;

        assert_eq!(summary.total_cached, 1);
        assert!(store.get_account("alice", "na1")?.is_none());
        Ok(())
    }

    #[test]
    fn test_bad_dates_reject_before_writing() -> Result<()> {
        let store = setup_in_memory_store()?;
        let dir = tempfile::tempdir()?;
        let uploads = dir.path().join("uploads");
        let config_path = dir.path().join("run-config.json");
        let importer = Importer::new(&store, &uploads, &config_path);

        let bad_format = importer.import(&ImportRequest {
            start_date: "01/01/2025".to_string(),
            ..request("alice-na1")
        });
        assert!(bad_format.is_err());

        let inverted = importer.import(&ImportRequest {
            start_date: "2025-02-01".to_string(),
            ..request("alice-na1")
        });
        let err = inverted.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImportError>(),
            Some(ImportError::InvertedWindow { .. })
        ));

        assert_eq!(store.cache_counts()?.total_accounts, 0);
        assert!(!config_path.exists());
        assert!(!uploads.exists());
        Ok(())
    }

    #[test]
    fn test_oversized_roster_is_rejected() {
        let roster: String = (0..=MAX_ROSTER_ROWS)
            .map(|i| format!("player{}-na1\n", i))
            .collect();
        let result = parse_roster(roster.as_bytes());
        assert!(matches!(
            result,
            Err(ImportError::TooManyRows { rows, .. }) if rows == MAX_ROSTER_ROWS + 1
        ));
    }

    #[test]
    fn test_parse_roster_dedupes_and_reads_first_column() {
        let roster = parse_roster(b"Alice-NA1,extra\nalice#na1\n\n  bob-euw  \n").unwrap();
        assert_eq!(
            roster.accounts,
            vec![
                GameId {
                    name: "Alice".to_string(),
                    tag: "NA1".to_string()
                },
                GameId {
                    name: "bob".to_string(),
                    tag: "euw".to_string()
                },
            ]
        );
        assert_eq!(roster.failed, 0);
    }

    #[test]
    fn test_empty_roster_is_rejected() {
        assert!(matches!(parse_roster(b"\n\n"), Err(ImportError::Empty)));
    }
}
