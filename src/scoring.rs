use tracing::debug;

use crate::models::{CachedMatch, MatchParticipant, TftMatch};

pub const GAME_COMPLETE: &str = "GameComplete";
pub const STANDARD_GAME_TYPE: &str = "standard";
/// Seconds a player has to survive before a placement counts (20 minutes).
pub const MIN_TIME_ELIMINATED_SECS: f64 = 1200.0;
pub const MIN_LAST_ROUND: i64 = 30;

pub fn placement_points(placement: i64) -> i64 {
    match placement {
        1 => 10,
        2 => 8,
        3 => 6,
        4 => 4,
        _ => 0,
    }
}

pub fn participant_points(
    placement: i64,
    time_eliminated: f64,
    last_round: i64,
    game_mode: &str,
    end_of_game_result: &str,
) -> i64 {
    if end_of_game_result != GAME_COMPLETE
        || game_mode != STANDARD_GAME_TYPE
        || time_eliminated <= MIN_TIME_ELIMINATED_SECS
        || last_round <= MIN_LAST_ROUND
    {
        return 0;
    }
    placement_points(placement)
}

/// Turns an upstream match into its cacheable form.
///
/// Returns `None` when the match did not finish normally; such a match is never stored.
/// A finished match with no scoring participants still produces a record so it is not
/// fetched again.
pub fn score_match(raw: &TftMatch) -> Option<CachedMatch> {
    let end_of_game_result = raw.info.end_of_game_result.as_deref().unwrap_or_default();
    if end_of_game_result != GAME_COMPLETE {
        debug!(
            "Match {} ended with '{}', not scoring it",
            raw.metadata.match_id, end_of_game_result
        );
        return None;
    }
    let game_mode = raw.info.tft_game_type.as_deref().unwrap_or_default();

    let participants = raw
        .info
        .participants
        .iter()
        .filter_map(|p| {
            let points = participant_points(
                p.placement,
                p.time_eliminated,
                p.last_round,
                game_mode,
                end_of_game_result,
            );
            (points > 0).then(|| MatchParticipant {
                puuid: p.puuid.clone(),
                game_name: p.riot_id_game_name.clone().unwrap_or_default(),
                tag_line: p.riot_id_tagline.clone().unwrap_or_default(),
                placement: p.placement,
                time_eliminated: p.time_eliminated,
                points,
            })
        })
        .collect();

    Some(CachedMatch {
        match_id: raw.metadata.match_id.clone(),
        end_of_game_result: end_of_game_result.to_string(),
        game_mode: game_mode.to_string(),
        game_creation: raw.info.created_at(),
        participants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{create_test_match, create_test_participant};

    #[test]
    fn test_first_place_with_long_game_scores_ten() {
        assert_eq!(
            participant_points(1, 1300.0, 35, "standard", "GameComplete"),
            10
        );
    }

    #[test]
    fn test_short_survival_scores_nothing() {
        assert_eq!(
            participant_points(1, 1000.0, 35, "standard", "GameComplete"),
            0
        );
    }

    #[test]
    fn test_fifth_place_scores_nothing() {
        assert_eq!(
            participant_points(5, 2000.0, 40, "standard", "GameComplete"),
            0
        );
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        assert_eq!(
            participant_points(1, 1200.0, 35, "standard", "GameComplete"),
            0
        );
        assert_eq!(
            participant_points(1, 1300.0, 30, "standard", "GameComplete"),
            0
        );
        assert_eq!(
            participant_points(1, 1200.5, 31, "standard", "GameComplete"),
            10
        );
    }

    #[test]
    fn test_other_modes_and_results_score_nothing() {
        assert_eq!(participant_points(1, 1300.0, 35, "pairs", "GameComplete"), 0);
        assert_eq!(participant_points(1, 1300.0, 35, "standard", "Abort"), 0);
    }

    #[test]
    fn test_placement_table() {
        let table: Vec<i64> = (1..=8).map(placement_points).collect();
        assert_eq!(table, vec![10, 8, 6, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_score_match_keeps_only_scoring_participants() {
        let raw = create_test_match(
            "NA1_100",
            "GameComplete",
            "standard",
            vec![
                create_test_participant("p1", "alice", "na1", 1, 1500.0, 32),
                create_test_participant("p2", "bob", "na1", 2, 1400.0, 31),
                create_test_participant("p3", "carol", "na1", 6, 1600.0, 36),
                create_test_participant("p4", "dave", "na1", 3, 900.0, 20),
            ],
        );
        let scored = score_match(&raw).unwrap();
        assert_eq!(scored.match_id, "NA1_100");
        assert_eq!(scored.game_mode, "standard");
        let points: Vec<(&str, i64)> = scored
            .participants
            .iter()
            .map(|p| (p.game_name.as_str(), p.points))
            .collect();
        assert_eq!(points, vec![("alice", 10), ("bob", 8)]);
    }

    #[test]
    fn test_score_match_rejects_incomplete_games() {
        let raw = create_test_match(
            "NA1_101",
            "Abort_TooFewPlayers",
            "standard",
            vec![create_test_participant("p1", "alice", "na1", 1, 1500.0, 32)],
        );
        assert!(score_match(&raw).is_none());
    }

    #[test]
    fn test_score_match_is_deterministic() {
        let raw = create_test_match(
            "NA1_102",
            "GameComplete",
            "standard",
            vec![create_test_participant("p1", "alice", "na1", 4, 1500.0, 32)],
        );
        assert_eq!(score_match(&raw), score_match(&raw));
    }
}
