use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Activity, MemberProfile};
use crate::query::period::DateRange;
use crate::rollup::RollupRow;

fn json_to_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn json_from_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_date(s: &str) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ── Activities ─────────────────────────────────────────────────────

pub fn insert_activity(conn: &Connection, a: &Activity) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO activities (
            id, type, timestamp, date_key, username, object_member_username,
            object_member_id, platform, source_id, channel, tenant_id,
            member_id, url, is_contribution, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, datetime('now'))",
        params![
            a.id,
            a.kind,
            a.timestamp.to_rfc3339(),
            a.date().to_string(),
            a.username,
            a.object_member_username,
            a.object_member_id,
            a.platform,
            a.source_id,
            a.channel,
            a.tenant_id,
            a.member_id,
            a.url,
            a.is_contribution as i32,
        ],
    )?;
    Ok(())
}

pub fn insert_activities(conn: &Connection, activities: &[Activity]) -> Result<usize, rusqlite::Error> {
    for a in activities {
        insert_activity(conn, a)?;
    }
    Ok(activities.len())
}

/// Scan activities overlapping a day range, in arbitrary order.
pub fn scan_activities(
    conn: &Connection,
    range: Option<DateRange>,
) -> Result<Vec<Activity>, rusqlite::Error> {
    let base = "SELECT id, type, timestamp, username, object_member_username,
            object_member_id, platform, source_id, channel, tenant_id,
            member_id, url, is_contribution
         FROM activities";
    let map_row = |row: &rusqlite::Row<'_>| {
        let ts: String = row.get(2)?;
        Ok(Activity {
            id: row.get(0)?,
            kind: row.get(1)?,
            timestamp: parse_timestamp(&ts)?,
            username: row.get(3)?,
            object_member_username: row.get(4)?,
            object_member_id: row.get(5)?,
            platform: row.get(6)?,
            source_id: row.get(7)?,
            channel: row.get(8)?,
            tenant_id: row.get(9)?,
            member_id: row.get(10)?,
            url: row.get(11)?,
            is_contribution: row.get::<_, i32>(12)? != 0,
        })
    };

    let rows = match range {
        Some(r) => {
            let sql = format!("{base} WHERE date_key >= ?1 AND date_key <= ?2");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![r.start.to_string(), r.end.to_string()],
                map_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(base)?;
            let rows = stmt.query_map([], map_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(rows)
}

/// (min, max) activity date, or None when the log is empty.
pub fn activity_date_bounds(
    conn: &Connection,
) -> Result<Option<(NaiveDate, NaiveDate)>, rusqlite::Error> {
    let bounds: (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(date_key), MAX(date_key) FROM activities",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match bounds {
        (Some(min), Some(max)) => Ok(Some((parse_date(&min)?, parse_date(&max)?))),
        _ => Ok(None),
    }
}

/// (activity count, member count) for the status command.
pub fn warehouse_counts(conn: &Connection) -> Result<(i64, i64), rusqlite::Error> {
    let activities = conn.query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?;
    let members = conn.query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))?;
    Ok((activities, members))
}

// ── Members ────────────────────────────────────────────────────────

pub fn upsert_member(
    conn: &Connection,
    member_id: &str,
    display_name: Option<&str>,
    logo_url: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO members (member_id, display_name, logo_url, cached_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(member_id) DO UPDATE SET
           display_name = COALESCE(excluded.display_name, members.display_name),
           logo_url = COALESCE(excluded.logo_url, members.logo_url),
           cached_at = excluded.cached_at",
        params![member_id, display_name, logo_url],
    )?;
    Ok(())
}

pub fn load_members(conn: &Connection) -> Result<HashMap<String, MemberProfile>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT member_id, display_name, logo_url FROM members")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            MemberProfile {
                display_name: row.get(1)?,
                logo_url: row.get(2)?,
            },
        ))
    })?;
    rows.collect()
}

// ── Rollup rows ────────────────────────────────────────────────────

/// Atomically overwrite one rollup partition: delete + insert + refresh-log
/// upsert in a single transaction, so readers see the old rows or the new
/// rows, never a mix.
pub fn write_rollup_partition(
    conn: &mut Connection,
    rollup_id: &str,
    partition_key: &str,
    rows: &[RollupRow],
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM rollup_rows WHERE rollup_id = ?1 AND partition_key = ?2",
        params![rollup_id, partition_key],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO rollup_rows (rollup_id, partition_key, bucket, dims, measures)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for row in rows {
            let dims = serde_json::to_string(&row.dims).map_err(json_to_sql_err)?;
            let measures = serde_json::to_string(&row.measures).map_err(json_to_sql_err)?;
            stmt.execute(params![
                rollup_id,
                partition_key,
                row.bucket.to_string(),
                dims,
                measures
            ])?;
        }
    }
    tx.execute(
        "INSERT OR REPLACE INTO rollup_partitions (rollup_id, partition_key, refreshed_at)
         VALUES (?1, ?2, datetime('now'))",
        params![rollup_id, partition_key],
    )?;
    tx.commit()
}

/// Read the materialized rows of the given partitions.
pub fn read_rollup_rows(
    conn: &Connection,
    rollup_id: &str,
    partition_keys: &[String],
) -> Result<Vec<RollupRow>, rusqlite::Error> {
    if partition_keys.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = partition_keys
        .iter()
        .enumerate()
        .map(|(i, _)| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT bucket, dims, measures FROM rollup_rows
         WHERE rollup_id = ?1 AND partition_key IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.raw_bind_parameter(1, rollup_id)?;
    for (i, key) in partition_keys.iter().enumerate() {
        stmt.raw_bind_parameter(i + 2, key)?;
    }

    let mut out = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let bucket: String = row.get(0)?;
        let dims: String = row.get(1)?;
        let measures: String = row.get(2)?;
        out.push(RollupRow {
            bucket: parse_date(&bucket)?,
            dims: serde_json::from_str(&dims).map_err(json_from_sql_err)?,
            measures: serde_json::from_str(&measures).map_err(json_from_sql_err)?,
        });
    }
    Ok(out)
}

/// Drop all materialized rows and the refresh log for one rollup.
pub fn delete_rollup(conn: &mut Connection, rollup_id: &str) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM rollup_rows WHERE rollup_id = ?1", params![rollup_id])?;
    tx.execute(
        "DELETE FROM rollup_partitions WHERE rollup_id = ?1",
        params![rollup_id],
    )?;
    tx.commit()
}

// ── Rollup state ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RollupStateRow {
    pub rollup_id: String,
    pub def_hash: String,
    pub stale: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

pub fn load_rollup_states(conn: &Connection) -> Result<Vec<RollupStateRow>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT rollup_id, def_hash, stale, last_refresh FROM rollup_state")?;
    let rows = stmt.query_map([], |row| {
        let last: Option<String> = row.get(3)?;
        let last_refresh = match last {
            Some(s) => Some(parse_timestamp(&s)?),
            None => None,
        };
        Ok(RollupStateRow {
            rollup_id: row.get(0)?,
            def_hash: row.get(1)?,
            stale: row.get::<_, i32>(2)? != 0,
            last_refresh,
        })
    })?;
    rows.collect()
}

pub fn load_rollup_partitions(
    conn: &Connection,
) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT rollup_id, partition_key FROM rollup_partitions")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

pub fn set_rollup_state(
    conn: &Connection,
    rollup_id: &str,
    def_hash: &str,
    stale: bool,
    last_refresh: Option<DateTime<Utc>>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO rollup_state (rollup_id, def_hash, stale, last_refresh)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(rollup_id) DO UPDATE SET
           def_hash = excluded.def_hash,
           stale = excluded.stale,
           last_refresh = COALESCE(excluded.last_refresh, rollup_state.last_refresh)",
        params![
            rollup_id,
            def_hash,
            stale as i32,
            last_refresh.map(|t| t.to_rfc3339())
        ],
    )?;
    Ok(())
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use crate::storage::Database;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn activity(id: &str, day: u32) -> Activity {
        Activity {
            id: id.into(),
            kind: "star".into(),
            timestamp: Utc.with_ymd_and_hms(2023, 5, day, 10, 0, 0).unwrap(),
            username: Some("alice".into()),
            object_member_username: None,
            object_member_id: None,
            platform: Some("github".into()),
            source_id: None,
            channel: None,
            tenant_id: "t1".into(),
            member_id: Some("m1".into()),
            url: None,
            is_contribution: false,
        }
    }

    #[tokio::test]
    async fn test_insert_and_scan_by_range() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                insert_activity(conn, &activity("a1", 4))?;
                insert_activity(conn, &activity("a2", 11))?;
                insert_activity(conn, &activity("a3", 20))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let range = DateRange::parse("2023-05-04", "2023-05-11").unwrap();
        let rows = db
            .reader()
            .call(move |conn| scan_activities(conn, Some(range)))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let bounds = db
            .reader()
            .call(|conn| activity_date_bounds(conn))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bounds.0, NaiveDate::from_ymd_opt(2023, 5, 4).unwrap());
        assert_eq!(bounds.1, NaiveDate::from_ymd_opt(2023, 5, 20).unwrap());
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                insert_activity(conn, &activity("a1", 4))?;
                insert_activity(conn, &activity("a1", 4))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        let rows = db
            .reader()
            .call(|conn| scan_activities(conn, None))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_rollup_partition_overwrite() {
        let db = Database::open_memory().await.unwrap();
        let row = |n: i64| RollupRow {
            bucket: NaiveDate::from_ymd_opt(2023, 5, 4).unwrap(),
            dims: vec![Value::Str("alice".into())],
            measures: BTreeMap::from([("count".to_string(), n)]),
        };

        db.writer()
            .call(move |conn| write_rollup_partition(conn, "r1", "2023-Q2", &[row(1)]))
            .await
            .unwrap();
        db.writer()
            .call(move |conn| write_rollup_partition(conn, "r1", "2023-Q2", &[row(5)]))
            .await
            .unwrap();

        let rows = db
            .reader()
            .call(|conn| read_rollup_rows(conn, "r1", &["2023-Q2".to_string()]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].measures["count"], 5);
        assert_eq!(rows[0].dims, vec![Value::Str("alice".into())]);

        let partitions = db.reader().call(|conn| load_rollup_partitions(conn)).await.unwrap();
        assert_eq!(partitions, vec![("r1".to_string(), "2023-Q2".to_string())]);
    }

    #[tokio::test]
    async fn test_rollup_state_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let now = Utc.with_ymd_and_hms(2023, 5, 11, 0, 0, 0).unwrap();
        db.writer()
            .call(move |conn| set_rollup_state(conn, "r1", "abc", false, Some(now)))
            .await
            .unwrap();

        let states = db.reader().call(|conn| load_rollup_states(conn)).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].rollup_id, "r1");
        assert_eq!(states[0].def_hash, "abc");
        assert!(!states[0].stale);
        assert_eq!(states[0].last_refresh, Some(now));
    }

    #[tokio::test]
    async fn test_member_upsert_keeps_known_fields() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                upsert_member(conn, "m1", Some("Alice"), Some("https://img/a.png"))?;
                upsert_member(conn, "m1", None, None)?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        let members = db.reader().call(|conn| load_members(conn)).await.unwrap();
        assert_eq!(members["m1"].display_name.as_deref(), Some("Alice"));
        assert_eq!(members["m1"].logo_url.as_deref(), Some("https://img/a.png"));
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| set_config(conn, "default_tenant", "t1"))
            .await
            .unwrap();
        let value = db
            .reader()
            .call(|conn| get_config(conn, "default_tenant"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("t1"));
        let all = db.reader().call(|conn| list_config(conn)).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
