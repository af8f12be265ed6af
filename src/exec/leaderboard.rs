use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Row, Value};

/// One period's grouped result for a single measure, keyed by a grouping
/// dimension (the member id for contributor leaderboards).
#[derive(Debug, Clone)]
pub struct PeriodSlice {
    pub measure: String,
    pub key_dimension: String,
    pub rows: Vec<Row>,
}

impl PeriodSlice {
    pub fn new(measure: &str, key_dimension: &str, rows: Vec<Row>) -> Self {
        Self {
            measure: measure.to_string(),
            key_dimension: key_dimension.to_string(),
            rows,
        }
    }

    fn key_of(&self, row: &Row) -> Option<String> {
        match row.get(&self.key_dimension) {
            Some(Value::Str(s)) => Some(s.clone()),
            Some(Value::Int(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn value_of(&self, row: &Row) -> i64 {
        row.get(&self.measure)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

/// One leaderboard line: current and previous value, delta and rounded share
/// of the current total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub member_id: String,
    pub username: Option<String>,
    pub logo_url: Option<String>,
    pub count: i64,
    pub previous_count: i64,
    pub count_diff: i64,
    pub share: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Leaderboard {
    pub measure: String,
    pub total_current: i64,
    pub total_previous: i64,
    /// Percentage change of the total; None is the sentinel for unbounded
    /// growth (previous total was zero while the current one is not).
    pub delta_percentage: Option<f64>,
    pub entries: Vec<LeaderboardEntry>,
}

/// Join two periods of the same measure into a ranked leaderboard.
///
/// Contributors absent from the previous period default to 0; contributors
/// with no activity in the current period are excluded entirely. Shares are
/// rounded per row and deliberately not renormalized, so they can sum to
/// slightly under 100.
pub fn build_leaderboard(
    total_current: i64,
    total_previous: i64,
    current: &PeriodSlice,
    previous: &PeriodSlice,
) -> Result<Leaderboard> {
    if current.measure != previous.measure {
        return Err(Error::IncomparablePeriods(format!(
            "measure '{}' vs '{}'",
            current.measure, previous.measure
        )));
    }
    if current.key_dimension != previous.key_dimension {
        return Err(Error::IncomparablePeriods(format!(
            "grouping key '{}' vs '{}'",
            current.key_dimension, previous.key_dimension
        )));
    }

    let previous_by_key: HashMap<String, i64> = previous
        .rows
        .iter()
        .filter_map(|row| previous.key_of(row).map(|k| (k, previous.value_of(row))))
        .collect();

    let mut entries: Vec<LeaderboardEntry> = current
        .rows
        .iter()
        .filter_map(|row| {
            let key = current.key_of(row)?;
            let count = current.value_of(row);
            // A zero row is not a leaderboard entry even if the grouped
            // query returned it.
            if count <= 0 {
                return None;
            }
            let previous_count = previous_by_key.get(&key).copied().unwrap_or(0);
            let share = if total_current > 0 {
                (count as f64 / total_current as f64 * 100.0).round() as i64
            } else {
                0
            };
            Some(LeaderboardEntry {
                member_id: key,
                username: row.get("username").and_then(|v| v.as_str()).map(String::from),
                logo_url: row
                    .get("member_logo_url")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                count,
                previous_count,
                count_diff: count - previous_count,
                share,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.member_id.cmp(&b.member_id))
    });

    let delta_percentage = if total_previous > 0 {
        Some((total_current - total_previous) as f64 / total_previous as f64 * 100.0)
    } else if total_current > 0 {
        None
    } else {
        Some(0.0)
    };

    Ok(Leaderboard {
        measure: current.measure.clone(),
        total_current,
        total_previous,
        delta_percentage,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(member_id: &str, username: &str, count: i64) -> Row {
        let mut r: Row = BTreeMap::new();
        r.insert("member_id".into(), Value::Str(member_id.into()));
        r.insert("username".into(), Value::Str(username.into()));
        r.insert(
            "member_logo_url".into(),
            Value::Str(format!("https://img/{username}.png")),
        );
        r.insert("contributions".into(), Value::Int(count));
        r
    }

    fn slice(rows: Vec<Row>) -> PeriodSlice {
        PeriodSlice::new("contributions", "member_id", rows)
    }

    #[test]
    fn test_delta_percentage_twenty() {
        let board = build_leaderboard(120, 100, &slice(vec![]), &slice(vec![])).unwrap();
        assert_eq!(board.delta_percentage, Some(20.0));
    }

    #[test]
    fn test_unbounded_growth_sentinel() {
        let board =
            build_leaderboard(40, 0, &slice(vec![row("m1", "a", 40)]), &slice(vec![])).unwrap();
        assert_eq!(board.delta_percentage, None);
        assert_eq!(board.total_previous, 0);
    }

    #[test]
    fn test_both_zero_is_zero_delta() {
        let board = build_leaderboard(0, 0, &slice(vec![]), &slice(vec![])).unwrap();
        assert_eq!(board.delta_percentage, Some(0.0));
        assert!(board.entries.is_empty());
    }

    #[test]
    fn test_first_time_contributor_defaults_previous_to_zero() {
        let board = build_leaderboard(
            50,
            20,
            &slice(vec![row("m1", "a", 30), row("m2", "b", 20)]),
            &slice(vec![row("m2", "b", 20)]),
        )
        .unwrap();
        let first = board.entries.iter().find(|e| e.member_id == "m1").unwrap();
        assert_eq!(first.previous_count, 0);
        assert_eq!(first.count_diff, 30);
    }

    #[test]
    fn test_zero_current_rows_excluded() {
        let board = build_leaderboard(
            10,
            10,
            &slice(vec![row("m1", "a", 10), row("m2", "b", 0)]),
            &slice(vec![row("m2", "b", 10)]),
        )
        .unwrap();
        assert_eq!(board.entries.len(), 1);
        assert_eq!(board.entries[0].member_id, "m1");
    }

    #[test]
    fn test_tie_breaks_by_grouping_key_ascending() {
        let board = build_leaderboard(
            20,
            0,
            &slice(vec![row("m9", "z", 10), row("m1", "a", 10)]),
            &slice(vec![]),
        )
        .unwrap();
        let ids: Vec<&str> = board.entries.iter().map(|e| e.member_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m9"]);
    }

    #[test]
    fn test_sorted_descending_by_count() {
        let board = build_leaderboard(
            60,
            0,
            &slice(vec![
                row("m1", "a", 10),
                row("m2", "b", 30),
                row("m3", "c", 20),
            ]),
            &slice(vec![]),
        )
        .unwrap();
        let counts: Vec<i64> = board.entries.iter().map(|e| e.count).collect();
        assert_eq!(counts, vec![30, 20, 10]);
    }

    #[test]
    fn test_share_rounding_never_exceeds_hundred() {
        // 3-way even split of 10: 33 + 33 + 33 <= 100.
        let board = build_leaderboard(
            10,
            0,
            &slice(vec![
                row("m1", "a", 3),
                row("m2", "b", 3),
                row("m3", "c", 4),
            ]),
            &slice(vec![]),
        )
        .unwrap();
        let total: i64 = board.entries.iter().map(|e| e.share).sum();
        assert!(total <= 100, "shares sum to {total}");
        let m3 = board.entries.iter().find(|e| e.member_id == "m3").unwrap();
        assert_eq!(m3.share, 40);
    }

    #[test]
    fn test_share_zero_when_total_zero() {
        // Degenerate: per-row counts without a total (filters can differ).
        let board =
            build_leaderboard(0, 0, &slice(vec![row("m1", "a", 5)]), &slice(vec![])).unwrap();
        assert_eq!(board.entries[0].share, 0);
    }

    #[test]
    fn test_incomparable_measures_rejected() {
        let other = PeriodSlice::new("count", "member_id", vec![]);
        match build_leaderboard(0, 0, &slice(vec![]), &other) {
            Err(Error::IncomparablePeriods(_)) => {}
            other => panic!("expected IncomparablePeriods, got {other:?}"),
        }
    }

    #[test]
    fn test_incomparable_keys_rejected() {
        let other = PeriodSlice::new("contributions", "username", vec![]);
        assert!(matches!(
            build_leaderboard(0, 0, &slice(vec![]), &other),
            Err(Error::IncomparablePeriods(_))
        ));
    }

    #[test]
    fn test_entry_fields_populated() {
        let board = build_leaderboard(
            40,
            25,
            &slice(vec![row("m1", "alice", 40)]),
            &slice(vec![row("m1", "alice", 25)]),
        )
        .unwrap();
        let e = &board.entries[0];
        assert_eq!(e.username.as_deref(), Some("alice"));
        assert_eq!(e.logo_url.as_deref(), Some("https://img/alice.png"));
        assert_eq!(e.count, 40);
        assert_eq!(e.previous_count, 25);
        assert_eq!(e.count_diff, 15);
        assert_eq!(e.share, 100);
        assert_eq!(board.delta_percentage, Some(60.0));
    }
}
