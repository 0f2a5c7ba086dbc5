use chrono::{DateTime, NaiveDate, Utc};
use serde_derive::Deserialize;
use serde_derive::Serialize;

/// A tracked player, keyed case-insensitively by Riot ID.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAccount {
    pub id: i64,
    pub game_name: String,
    pub tag_line: String,
    pub puuid: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub refreshed_date: Option<NaiveDate>,
    pub total_points: i64,
    pub total_matches: i64,
    pub is_completed: bool,
    pub import_order: Option<i64>,
    pub last_error: Option<String>,
}

impl CachedAccount {
    pub fn riot_id(&self) -> String {
        format!("{}#{}", self.game_name, self.tag_line)
    }
}

/// One row of an account batch upsert. `None` fields leave the stored value alone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccountUpsert {
    pub game_name: String,
    pub tag_line: String,
    pub puuid: Option<String>,
    pub total_points: Option<i64>,
    pub import_order: Option<i64>,
}

impl AccountUpsert {
    pub fn new(game_name: &str, tag_line: &str) -> Self {
        Self {
            game_name: game_name.to_string(),
            tag_line: tag_line.to_string(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> String {
        account_key(&self.game_name, &self.tag_line)
    }
}

/// Lower-cased `name#tag`, the form both the store and the importer deduplicate on.
pub fn account_key(game_name: &str, tag_line: &str) -> String {
    format!(
        "{}#{}",
        game_name.trim().to_lowercase(),
        tag_line.trim().to_lowercase()
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchParticipant {
    #[serde(default)]
    pub puuid: Option<String>,
    pub game_name: String,
    pub tag_line: String,
    pub placement: i64,
    pub time_eliminated: f64,
    pub points: i64,
}

/// A scorable match. Only participants that earned points are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMatch {
    pub match_id: String,
    pub end_of_game_result: String,
    pub game_mode: String,
    pub game_creation: i64,
    pub participants: Vec<MatchParticipant>,
}

impl CachedMatch {
    /// Points the given account earned in this match, zero when it did not score.
    pub fn points_for(&self, account: &CachedAccount) -> i64 {
        self.participants
            .iter()
            .filter(|p| match (&p.puuid, &account.puuid) {
                (Some(theirs), Some(ours)) => theirs == ours,
                _ => {
                    account_key(&p.game_name, &p.tag_line)
                        == account_key(&account.game_name, &account.tag_line)
                }
            })
            .map(|p| p.points)
            .sum()
    }
}

/// Process-wide run settings, persisted as JSON next to the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfiguration {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub roster_path: String,
    #[serde(default)]
    pub is_stop_job: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessMode {
    RefreshToday,
    FullWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub total_accounts: usize,
    pub demo5_accounts: Vec<CachedAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub total_parsed: usize,
    pub total_failed: usize,
    pub total_cached: i64,
    pub with_puuid: i64,
    pub without_puuid: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheCounts {
    pub total_accounts: i64,
    pub with_puuid: i64,
    pub without_puuid: i64,
    pub completed: i64,
    pub cached_matches: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub game_name: String,
    pub tag_line: String,
    pub total_points: i64,
    pub total_matches: i64,
}

// Upstream TFT match payload. Only the fields used for scoring are mapped.

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TftMatch {
    pub metadata: TftMetadata,
    pub info: TftInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TftMetadata {
    pub match_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TftInfo {
    #[serde(rename = "endOfGameResult", default)]
    pub end_of_game_result: Option<String>,
    #[serde(default)]
    pub tft_game_type: Option<String>,
    #[serde(rename = "gameCreation", alias = "game_creation", default)]
    pub game_creation: Option<i64>,
    #[serde(default)]
    pub game_datetime: Option<i64>,
    #[serde(default)]
    pub participants: Vec<TftParticipant>,
}

impl TftInfo {
    /// Epoch millis the game started, whichever of the two fields the payload carries.
    pub fn created_at(&self) -> i64 {
        self.game_creation.or(self.game_datetime).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TftParticipant {
    #[serde(default)]
    pub puuid: Option<String>,
    #[serde(rename = "riotIdGameName", default)]
    pub riot_id_game_name: Option<String>,
    #[serde(rename = "riotIdTagline", default)]
    pub riot_id_tagline: Option<String>,
    pub placement: i64,
    #[serde(default)]
    pub time_eliminated: f64,
    #[serde(default)]
    pub last_round: i64,
}
