use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{error, info};

use crate::models::{
    account_key, AccountUpsert, CacheCounts, CachedAccount, CachedMatch, LeaderboardEntry,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cached_account (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_key TEXT NOT NULL UNIQUE,
    game_name TEXT NOT NULL,
    tag_line TEXT NOT NULL,
    puuid TEXT,
    refreshed_at INTEGER,
    refreshed_date TEXT,
    total_points INTEGER NOT NULL DEFAULT 0,
    total_matches INTEGER NOT NULL DEFAULT 0,
    is_completed INTEGER NOT NULL DEFAULT 0,
    import_order INTEGER,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS cached_account_refreshed ON cached_account (refreshed_date, refreshed_at);
CREATE TABLE IF NOT EXISTS cached_match (
    match_id TEXT PRIMARY KEY,
    end_of_game_result TEXT NOT NULL,
    game_mode TEXT NOT NULL,
    game_creation INTEGER NOT NULL,
    participants TEXT NOT NULL
);
";

const ACCOUNT_COLUMNS: &str = "id, game_name, tag_line, puuid, refreshed_at, refreshed_date, \
     total_points, total_matches, is_completed, import_order, last_error";

/// Totals written at the end of a full-window pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountTotals {
    pub total_points: i64,
    pub total_matches: i64,
}

/// SQLite-backed cache of accounts and scored matches.
///
/// Every public write is its own transaction, so a failed call never leaves half a batch behind.
pub struct Store {
    connection: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(SCHEMA)
            .context("Failed to create cache tables")?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| anyhow!("Database connection lock was poisoned"))
    }

    /// Inserts new accounts and updates existing ones, matching `(game_name, tag_line)`
    /// without regard to case through the stored `account_key`. Only fields set on the
    /// incoming row are written.
    pub fn upsert_accounts(&self, accounts: &[AccountUpsert]) -> Result<usize> {
        if accounts.is_empty() {
            return Ok(0);
        }
        // Later rows for the same key win.
        let mut incoming: Vec<AccountUpsert> = Vec::with_capacity(accounts.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for account in accounts {
            match positions.get(&account.key()) {
                Some(&i) => merge_upsert(&mut incoming[i], account),
                None => {
                    positions.insert(account.key(), incoming.len());
                    incoming.push(account.clone());
                }
            }
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let keys: Vec<String> = incoming.iter().map(AccountUpsert::key).collect();
        let keys_json =
            serde_json::to_string(&keys).context("Failed to serialize account keys to JSON")?;
        let existing: HashMap<String, i64> = {
            let mut statement = tx.prepare(
                "SELECT account_key, id FROM cached_account \
                 WHERE account_key IN (SELECT value FROM json_each(?1))",
            )?;
            let rows = statement.query_map([keys_json], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for account in &incoming {
            match existing.get(&account.key()) {
                Some(id) => {
                    tx.execute(
                        "UPDATE cached_account SET \
                         puuid = COALESCE(?1, puuid), \
                         total_points = COALESCE(?2, total_points), \
                         import_order = COALESCE(?3, import_order) \
                         WHERE id = ?4",
                        params![account.puuid, account.total_points, account.import_order, id],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO cached_account (account_key, game_name, tag_line, puuid, total_points, import_order) \
                         VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 0), ?6)",
                        params![
                            account.key(),
                            account.game_name.trim(),
                            account.tag_line.trim(),
                            account.puuid,
                            account.total_points,
                            account.import_order,
                        ],
                    )?;
                }
            }
        }
        tx.commit().context("Failed to commit account upsert")?;
        Ok(incoming.len())
    }

    /// Inserts or overwrites matches by id.
    pub fn upsert_matches(&self, matches: &[CachedMatch]) -> Result<usize> {
        if matches.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut statement = tx.prepare(
                "INSERT INTO cached_match (match_id, end_of_game_result, game_mode, game_creation, participants) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(match_id) DO UPDATE SET \
                 end_of_game_result = excluded.end_of_game_result, \
                 game_mode = excluded.game_mode, \
                 game_creation = excluded.game_creation, \
                 participants = excluded.participants",
            )?;
            for cached in matches {
                let participants = serde_json::to_string(&cached.participants)
                    .context("Failed to serialize participants to JSON")?;
                statement.execute(params![
                    cached.match_id,
                    cached.end_of_game_result,
                    cached.game_mode,
                    cached.game_creation,
                    participants,
                ])?;
            }
        }
        tx.commit().context("Failed to commit match upsert")?;
        Ok(matches.len())
    }

    /// Cached matches among `match_ids`, keyed by id. Unknown ids are simply absent.
    pub fn fetch_cached_matches(&self, match_ids: &[String]) -> Result<HashMap<String, CachedMatch>> {
        if match_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids_json =
            serde_json::to_string(match_ids).context("Failed to serialize match IDs to JSON")?;
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT match_id, end_of_game_result, game_mode, game_creation, participants \
             FROM cached_match WHERE match_id IN (SELECT value FROM json_each(?1))",
        )?;
        let rows = statement.query_map([ids_json], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut cached = HashMap::new();
        for row in rows {
            let (match_id, end_of_game_result, game_mode, game_creation, participants) = row?;
            let participants = match serde_json::from_str(&participants) {
                Ok(p) => p,
                Err(e) => {
                    // Treated as a miss so the match gets fetched and rewritten.
                    error!("Failed to parse participants for match {}: {}", match_id, e);
                    continue;
                }
            };
            cached.insert(
                match_id.clone(),
                CachedMatch {
                    match_id,
                    end_of_game_result,
                    game_mode,
                    game_creation,
                    participants,
                },
            );
        }
        Ok(cached)
    }

    pub fn get_account(&self, game_name: &str, tag_line: &str) -> Result<Option<CachedAccount>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM cached_account WHERE account_key = ?1",
            ACCOUNT_COLUMNS
        );
        let account = conn
            .query_row(&sql, [account_key(game_name, tag_line)], account_from_row)
            .optional()?;
        Ok(account)
    }

    pub fn get_account_by_id(&self, id: i64) -> Result<Option<CachedAccount>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM cached_account WHERE id = ?1", ACCOUNT_COLUMNS);
        Ok(conn.query_row(&sql, [id], account_from_row).optional()?)
    }

    /// Highest scorers first; accounts with no points are left out.
    pub fn top_accounts(&self, limit: usize) -> Result<Vec<CachedAccount>> {
        let sql = format!(
            "SELECT {} FROM cached_account WHERE total_points > 0 \
             ORDER BY total_points DESC, total_matches ASC, game_name ASC LIMIT ?1",
            ACCOUNT_COLUMNS
        );
        self.query_accounts(&sql, params![limit as i64])
    }

    /// Accounts not refreshed on `today`, least recently refreshed first.
    pub fn stale_accounts(&self, limit: usize, today: NaiveDate) -> Result<Vec<CachedAccount>> {
        let sql = format!(
            "SELECT {} FROM cached_account \
             WHERE refreshed_date IS NULL OR refreshed_date <> ?1 \
             ORDER BY refreshed_at IS NOT NULL, refreshed_at ASC, import_order ASC, id ASC \
             LIMIT ?2",
            ACCOUNT_COLUMNS
        );
        self.query_accounts(&sql, params![today.to_string(), limit as i64])
    }

    pub fn accounts_without_puuid(&self) -> Result<Vec<CachedAccount>> {
        let sql = format!(
            "SELECT {} FROM cached_account WHERE puuid IS NULL ORDER BY import_order ASC, id ASC",
            ACCOUNT_COLUMNS
        );
        self.query_accounts(&sql, [])
    }

    fn query_accounts<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<CachedAccount>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(sql)?;
        let accounts = statement
            .query_map(params, account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn set_puuid(&self, account_id: i64, puuid: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE cached_account SET puuid = ?1, last_error = NULL WHERE id = ?2",
                params![puuid, account_id],
            )
            .context("Failed to store resolved puuid")?;
        Ok(())
    }

    /// Touches `refreshed_at` only; totals and `refreshed_date` are left alone.
    pub fn mark_refreshed(&self, account_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE cached_account SET refreshed_at = ?1 WHERE id = ?2",
                params![at.timestamp_millis(), account_id],
            )
            .context("Failed to mark account refreshed")?;
        Ok(())
    }

    pub fn record_totals(
        &self,
        account_id: i64,
        totals: AccountTotals,
        at: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE cached_account SET total_points = ?1, total_matches = ?2, \
                 refreshed_at = ?3, refreshed_date = ?4, is_completed = 1, last_error = NULL \
                 WHERE id = ?5",
                params![
                    totals.total_points,
                    totals.total_matches,
                    at.timestamp_millis(),
                    today.to_string(),
                    account_id,
                ],
            )
            .context("Failed to store account totals")?;
        Ok(())
    }

    /// Keeps the message and pushes the account to the back of the refresh queue.
    pub fn record_error(&self, account_id: i64, message: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE cached_account SET last_error = ?1, refreshed_at = ?2 WHERE id = ?3",
                params![message, at.timestamp_millis(), account_id],
            )
            .context("Failed to store account error")?;
        Ok(())
    }

    /// Empties both tables in one transaction.
    pub fn clear_cache(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cached_match", [])?;
        tx.execute("DELETE FROM cached_account", [])?;
        tx.commit().context("Failed to clear cache")?;
        info!("Cleared cached accounts and matches");
        Ok(())
    }

    pub fn cache_counts(&self) -> Result<CacheCounts> {
        let conn = self.conn()?;
        let (total_accounts, with_puuid, completed) = conn.query_row(
            "SELECT COUNT(*), COUNT(puuid), COALESCE(SUM(is_completed), 0) FROM cached_account",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )?;
        let cached_matches: i64 =
            conn.query_row("SELECT COUNT(*) FROM cached_match", [], |row| row.get(0))?;
        Ok(CacheCounts {
            total_accounts,
            with_puuid,
            without_puuid: total_accounts - with_puuid,
            completed,
            cached_matches,
        })
    }

    /// Ranked view of `top_accounts`. Tied totals share a rank and the next rank is skipped.
    pub fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let accounts = self.top_accounts(limit)?;
        let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(accounts.len());
        for (index, account) in accounts.into_iter().enumerate() {
            let rank = match entries.last() {
                Some(previous) if previous.total_points == account.total_points => previous.rank,
                _ => index + 1,
            };
            entries.push(LeaderboardEntry {
                rank,
                game_name: account.game_name,
                tag_line: account.tag_line,
                total_points: account.total_points,
                total_matches: account.total_matches,
            });
        }
        Ok(entries)
    }
}

fn merge_upsert(into: &mut AccountUpsert, from: &AccountUpsert) {
    if from.puuid.is_some() {
        into.puuid = from.puuid.clone();
    }
    if from.total_points.is_some() {
        into.total_points = from.total_points;
    }
    if into.import_order.is_none() {
        into.import_order = from.import_order;
    }
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<CachedAccount> {
    let refreshed_at: Option<i64> = row.get(4)?;
    let refreshed_date: Option<String> = row.get(5)?;
    Ok(CachedAccount {
        id: row.get(0)?,
        game_name: row.get(1)?,
        tag_line: row.get(2)?,
        puuid: row.get(3)?,
        refreshed_at: refreshed_at.and_then(DateTime::from_timestamp_millis),
        refreshed_date: refreshed_date.and_then(|d| d.parse().ok()),
        total_points: row.get(6)?,
        total_matches: row.get(7)?,
        is_completed: row.get(8)?,
        import_order: row.get(9)?,
        last_error: row.get(10)?,
    })
}
