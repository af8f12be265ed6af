use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exec::executor::aggregate_activities;
use crate::model::Value;
use crate::query::period::{DateRange, Granularity};
use crate::schema::{MeasureDef, Predicate, SchemaRegistry};
use crate::storage::{repository, Database};

/// Partition key for rollups with no partition granularity.
pub const ALL_PARTITION: &str = "all";

const MAX_REFRESH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;

/// Refresh cadence and late-event tolerance for one rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPolicy {
    pub every_days: u32,
    /// How far back late-arriving events are re-aggregated. Partitions older
    /// than this are final and never recomputed outside a full rebuild.
    pub update_window_days: u32,
    pub incremental: bool,
}

/// A materialized, partitioned aggregate: measures × dimensions × segments at
/// a result granularity, partitioned by a coarser time granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupDef {
    pub id: String,
    pub measures: Vec<String>,
    pub dimensions: Vec<String>,
    pub segments: Vec<String>,
    /// None means a single unpartitioned materialization.
    pub partition_granularity: Option<Granularity>,
    pub granularity: Granularity,
    pub refresh: RefreshPolicy,
}

impl RollupDef {
    /// Check every referenced name resolves and the shape is materializable.
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        for name in &self.measures {
            let m = registry.measure(name)?;
            if m.is_derived() {
                return Err(Error::Config(format!(
                    "rollup '{}' cannot materialize derived measure '{name}'; list its dependencies instead",
                    self.id
                )));
            }
        }
        for name in &self.dimensions {
            registry.dimension(name)?;
        }
        for name in &self.segments {
            registry.segment(name)?;
        }
        if let Some(pg) = self.partition_granularity {
            if self.granularity > pg {
                return Err(Error::Config(format!(
                    "rollup '{}': result granularity {} is coarser than partition granularity {pg}",
                    self.id, self.granularity
                )));
            }
        }
        Ok(())
    }

    /// Fingerprint of this definition together with the resolved measure,
    /// dimension and segment definitions it references. Any change to any of
    /// them invalidates materialized rows and requires a full rebuild.
    pub fn def_hash(&self, registry: &SchemaRegistry) -> Result<String> {
        let measures = self
            .measures
            .iter()
            .map(|m| registry.measure(m).cloned())
            .collect::<Result<Vec<_>>>()?;
        let dimensions = self
            .dimensions
            .iter()
            .map(|d| registry.dimension(d).cloned())
            .collect::<Result<Vec<_>>>()?;
        let segments = self
            .segments
            .iter()
            .map(|s| registry.segment(s).cloned())
            .collect::<Result<Vec<_>>>()?;
        let payload = serde_json::to_string(&(self, measures, dimensions, segments))?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        payload.hash(&mut hasher);
        Ok(format!("{:016x}", hasher.finish()))
    }
}

/// One materialized row: a result-granularity bucket, the dimension tuple
/// (aligned with the definition's dimension order), and measure values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRow {
    pub bucket: NaiveDate,
    pub dims: Vec<Value>,
    pub measures: BTreeMap<String, i64>,
}

/// In-memory bookkeeping for one rollup.
#[derive(Debug, Clone, Default)]
struct RollupStatus {
    covered: BTreeSet<String>,
    stale: bool,
    rebuilding: bool,
    hash_ok: bool,
    def_hash: String,
    last_refresh: Option<DateTime<Utc>>,
}

/// Serializable status line for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RollupStatusReport {
    pub id: String,
    pub partitions: usize,
    pub stale: bool,
    pub rebuilding: bool,
    pub needs_rebuild: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Synchronous snapshot of rollup definitions and coverage, handed to the
/// query compiler so plan selection needs no storage round-trip.
#[derive(Debug, Clone, Default)]
pub struct RollupCatalog {
    pub entries: Vec<CatalogEntry>,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub def: RollupDef,
    pub usable: bool,
    pub covered: BTreeSet<String>,
}

impl CatalogEntry {
    /// Whether every partition overlapping `range` has been materialized.
    pub fn covers(&self, range: &DateRange) -> bool {
        match self.def.partition_granularity {
            None => self.covered.contains(ALL_PARTITION),
            Some(g) => g
                .buckets(range)
                .iter()
                .all(|b| self.covered.contains(&g.bucket_key(*b))),
        }
    }
}

/// Holds rollup definitions and drives their materialization.
///
/// The single writer connection serializes all partition writes, so a refresh
/// of one (rollup, partition) never interleaves with another write; readers
/// go through the WAL reader connection and see old or new partition rows,
/// never a mix.
#[derive(Clone)]
pub struct RollupStore {
    db: Database,
    registry: Arc<SchemaRegistry>,
    defs: Vec<RollupDef>,
    state: Arc<RwLock<HashMap<String, RollupStatus>>>,
}

impl RollupStore {
    /// Validate definitions and reload persisted refresh state. A stored
    /// definition hash that no longer matches marks the rollup as requiring
    /// a rebuild; its rows are never partially patched.
    pub async fn open(
        db: Database,
        registry: Arc<SchemaRegistry>,
        defs: Vec<RollupDef>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for def in &defs {
            if !seen.insert(def.id.clone()) {
                return Err(Error::DuplicateDefinition(format!("rollup '{}'", def.id)));
            }
            def.validate(&registry)?;
        }

        let (stored, partitions) = db
            .reader()
            .call(|conn| {
                let stored = repository::load_rollup_states(conn)?;
                let partitions = repository::load_rollup_partitions(conn)?;
                Ok::<_, rusqlite::Error>((stored, partitions))
            })
            .await?;

        let mut state = HashMap::new();
        for def in &defs {
            let hash = def.def_hash(&registry)?;
            let mut status = RollupStatus {
                def_hash: hash.clone(),
                hash_ok: true,
                ..Default::default()
            };
            if let Some(row) = stored.iter().find(|s| s.rollup_id == def.id) {
                status.stale = row.stale;
                status.last_refresh = row.last_refresh;
                status.hash_ok = row.def_hash == hash;
                if !status.hash_ok {
                    log::warn!(
                        "rollup '{}' definition changed since last refresh; rebuild required",
                        def.id
                    );
                }
                status.covered = partitions
                    .iter()
                    .filter(|(id, _)| *id == def.id)
                    .map(|(_, key)| key.clone())
                    .collect();
            }
            state.insert(def.id.clone(), status);
        }

        Ok(Self {
            db,
            registry,
            defs,
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn defs(&self) -> &[RollupDef] {
        &self.defs
    }

    fn def(&self, id: &str) -> Result<&RollupDef> {
        self.defs
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::UnknownMember(format!("rollup '{id}'")))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, HashMap<String, RollupStatus>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, HashMap<String, RollupStatus>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot for the query compiler. A rollup is usable only when it is
    /// not stale, not mid-rebuild, and its definition hash still matches.
    pub fn snapshot(&self) -> RollupCatalog {
        let state = self.read_state();
        RollupCatalog {
            entries: self
                .defs
                .iter()
                .map(|def| {
                    let status = state.get(&def.id).cloned().unwrap_or_default();
                    CatalogEntry {
                        def: def.clone(),
                        usable: !status.stale && !status.rebuilding && status.hash_ok,
                        covered: status.covered,
                    }
                })
                .collect(),
        }
    }

    pub fn status(&self) -> Vec<RollupStatusReport> {
        let state = self.read_state();
        self.defs
            .iter()
            .map(|def| {
                let status = state.get(&def.id).cloned().unwrap_or_default();
                RollupStatusReport {
                    id: def.id.clone(),
                    partitions: status.covered.len(),
                    stale: status.stale,
                    rebuilding: status.rebuilding,
                    needs_rebuild: !status.hash_ok,
                    last_refresh: status.last_refresh,
                }
            })
            .collect()
    }

    /// Incrementally refresh one rollup as of now.
    pub async fn refresh(&self, id: &str) -> Result<()> {
        self.refresh_as_of(id, Utc::now()).await
    }

    /// Recompute the partitions intersecting `[now - update_window, now]`,
    /// plus any partition never materialized. Older partitions are final.
    pub async fn refresh_as_of(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let def = self.def(id)?.clone();
        let covered = {
            let state = self.read_state();
            let status = state.get(id).cloned().unwrap_or_default();
            if status.rebuilding {
                return Err(Error::RebuildInProgress(id.to_string()));
            }
            if !status.hash_ok {
                return Err(Error::DefinitionChanged(id.to_string()));
            }
            status.covered
        };

        let partitions = match self.activity_bounds().await? {
            Some(data_range) => plan_partitions(&def, &covered, &data_range, now.date_naive(), false),
            None => Vec::new(),
        };

        let mut refreshed = Vec::new();
        for (key, prange) in partitions {
            if let Err(e) = self.materialize_with_retry(&def, &key, &prange).await {
                self.mark_stale(&def.id).await;
                return Err(e);
            }
            refreshed.push(key);
        }
        self.mark_refreshed(&def, now, &refreshed).await
    }

    /// Recompute every partition from scratch. Fails closed: a second rebuild
    /// of the same rollup is rejected, and the rollup is unusable by queries
    /// (raw fallback) while the rebuild runs.
    pub async fn rebuild(&self, id: &str) -> Result<()> {
        let def = self.def(id)?.clone();
        {
            let mut state = self.write_state();
            let status = state.entry(def.id.clone()).or_default();
            if status.rebuilding {
                return Err(Error::RebuildInProgress(id.to_string()));
            }
            status.rebuilding = true;
        }

        let now = Utc::now();
        let result = self.rebuild_inner(&def, now).await;

        {
            let mut state = self.write_state();
            if let Some(status) = state.get_mut(&def.id) {
                status.rebuilding = false;
            }
        }
        result
    }

    async fn rebuild_inner(&self, def: &RollupDef, now: DateTime<Utc>) -> Result<()> {
        // Drop existing rows first; the rollup is already fenced off.
        let id = def.id.clone();
        self.db
            .writer()
            .call(move |conn| repository::delete_rollup(conn, &id))
            .await?;
        {
            let mut state = self.write_state();
            if let Some(status) = state.get_mut(&def.id) {
                status.covered.clear();
            }
        }

        let mut refreshed = Vec::new();
        if let Some(data_range) = self.activity_bounds().await? {
            let partitions =
                plan_partitions(def, &BTreeSet::new(), &data_range, now.date_naive(), true);
            for (key, prange) in partitions {
                if let Err(e) = self.materialize_with_retry(def, &key, &prange).await {
                    self.mark_stale(&def.id).await;
                    return Err(e);
                }
                refreshed.push(key);
            }
        } else if def.partition_granularity.is_none() {
            // No events at all still materializes the single empty partition.
            self.materialize_with_retry(def, ALL_PARTITION, &unbounded_empty_range())
                .await?;
            refreshed.push(ALL_PARTITION.to_string());
        }

        self.mark_refreshed(def, now, &refreshed).await
    }

    /// Refresh every rollup whose cadence has elapsed; returns the ids
    /// refreshed. Per-rollup failures are logged, not fatal to the sweep.
    pub async fn refresh_due(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let due: Vec<String> = {
            let state = self.read_state();
            self.defs
                .iter()
                .filter(|def| {
                    let status = state.get(&def.id).cloned().unwrap_or_default();
                    match status.last_refresh {
                        None => true,
                        Some(last) => now - last >= Duration::days(def.refresh.every_days as i64),
                    }
                })
                .map(|def| def.id.clone())
                .collect()
        };

        let mut refreshed = Vec::new();
        for id in due {
            match self.refresh_as_of(&id, now).await {
                Ok(()) => refreshed.push(id),
                Err(e) => log::error!("refresh of rollup '{id}' failed: {e}"),
            }
        }
        Ok(refreshed)
    }

    async fn materialize_with_retry(
        &self,
        def: &RollupDef,
        key: &str,
        prange: &DateRange,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.materialize_partition(def, key, prange).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < MAX_REFRESH_ATTEMPTS => {
                    attempt += 1;
                    let delay = BACKOFF_BASE_MS << attempt;
                    log::warn!(
                        "refresh of rollup '{}' partition {key} failed (attempt {attempt}): {e}; retrying in {delay}ms",
                        def.id
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compute and atomically overwrite one partition.
    async fn materialize_partition(
        &self,
        def: &RollupDef,
        key: &str,
        prange: &DateRange,
    ) -> Result<()> {
        let range = *prange;
        let (activities, members) = {
            let needs_members = def.dimensions.iter().any(|name| {
                self.registry
                    .dimension(name)
                    .map(|dim| dim.expr.needs_member_join())
                    .unwrap_or(false)
            });
            self.db
                .reader()
                .call(move |conn| {
                    let activities = repository::scan_activities(conn, Some(range))?;
                    let members = if needs_members {
                        repository::load_members(conn)?
                    } else {
                        HashMap::new()
                    };
                    Ok::<_, rusqlite::Error>((activities, members))
                })
                .await?
        };

        let base = Predicate::all(
            def.segments
                .iter()
                .map(|s| self.registry.segment(s).cloned())
                .collect::<Result<Vec<_>>>()?,
        );
        let dimensions = def
            .dimensions
            .iter()
            .map(|d| self.registry.dimension(d).cloned())
            .collect::<Result<Vec<_>>>()?;
        let measures: Vec<MeasureDef> = def
            .measures
            .iter()
            .map(|m| self.registry.measure(m).cloned())
            .collect::<Result<Vec<_>>>()?;

        let groups = aggregate_activities(
            &activities,
            base.as_ref(),
            &[],
            &dimensions,
            Some(def.granularity),
            &measures,
            &members,
        );
        let rows: Vec<RollupRow> = groups
            .into_iter()
            .map(|g| RollupRow {
                bucket: g.bucket.unwrap_or(range.start),
                dims: g.dims,
                measures: g.measures.into_iter().collect(),
            })
            .collect();

        log::debug!(
            "materializing rollup '{}' partition {key}: {} rows",
            def.id,
            rows.len()
        );

        let (id, key) = (def.id.clone(), key.to_string());
        self.db
            .writer()
            .call(move |conn| repository::write_rollup_partition(conn, &id, &key, &rows))
            .await?;
        Ok(())
    }

    #[cfg(test)]
    fn force_rebuilding(&self, id: &str, on: bool) {
        let mut state = self.write_state();
        state.entry(id.to_string()).or_default().rebuilding = on;
    }

    async fn activity_bounds(&self) -> Result<Option<DateRange>> {
        let bounds = self
            .db
            .reader()
            .call(|conn| repository::activity_date_bounds(conn))
            .await?;
        match bounds {
            Some((min, max)) => Ok(Some(DateRange::new(min, max)?)),
            None => Ok(None),
        }
    }

    async fn mark_stale(&self, id: &str) {
        let hash = {
            let mut state = self.write_state();
            let status = state.entry(id.to_string()).or_default();
            status.stale = true;
            status.def_hash.clone()
        };
        log::warn!("rollup '{id}' marked stale; queries fall back to raw scans");
        let (id, hash) = (id.to_string(), hash);
        let persisted = self
            .db
            .writer()
            .call(move |conn| repository::set_rollup_state(conn, &id, &hash, true, None))
            .await;
        if let Err(e) = persisted {
            log::error!("failed to persist stale flag: {e}");
        }
    }

    async fn mark_refreshed(
        &self,
        def: &RollupDef,
        now: DateTime<Utc>,
        refreshed: &[String],
    ) -> Result<()> {
        let hash = {
            let mut state = self.write_state();
            let status = state.entry(def.id.clone()).or_default();
            status.covered.extend(refreshed.iter().cloned());
            status.stale = false;
            status.hash_ok = true;
            status.last_refresh = Some(now);
            status.def_hash.clone()
        };
        let id = def.id.clone();
        self.db
            .writer()
            .call(move |conn| repository::set_rollup_state(conn, &id, &hash, false, Some(now)))
            .await?;
        Ok(())
    }
}

/// Which (partition key, day range) pairs a refresh should recompute.
fn plan_partitions(
    def: &RollupDef,
    covered: &BTreeSet<String>,
    data_range: &DateRange,
    today: NaiveDate,
    force_all: bool,
) -> Vec<(String, DateRange)> {
    let Some(g) = def.partition_granularity else {
        return vec![(ALL_PARTITION.to_string(), *data_range)];
    };
    let window_start = today - Duration::days(def.refresh.update_window_days as i64);
    g.buckets(data_range)
        .into_iter()
        .filter_map(|bucket| {
            let key = g.bucket_key(bucket);
            let prange = g.bucket_range(bucket);
            let in_window = prange.end >= window_start && prange.start <= today;
            let keep = force_all
                || !def.refresh.incremental
                || in_window
                || !covered.contains(&key);
            keep.then_some((key, prange))
        })
        .collect()
}

fn unbounded_empty_range() -> DateRange {
    // A degenerate range used only when materializing the empty "all"
    // partition of an unpartitioned rollup with no events.
    let d = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    DateRange { start: d, end: d }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::period::Granularity;

    fn def(incremental: bool, pg: Option<Granularity>) -> RollupDef {
        RollupDef {
            id: "r".into(),
            measures: vec!["count".into()],
            dimensions: vec!["username".into()],
            segments: vec![],
            partition_granularity: pg,
            granularity: Granularity::Day,
            refresh: RefreshPolicy {
                every_days: 1,
                update_window_days: 7,
                incremental,
            },
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_plan_partitions_incremental_window() {
        let def = def(true, Some(Granularity::Quarter));
        let data = DateRange::new(d(2024, 1, 10), d(2025, 5, 20)).unwrap();
        let covered: BTreeSet<String> = ["2024-Q1", "2024-Q2", "2024-Q3", "2024-Q4", "2025-Q1"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        // Today mid-Q2 2025: only the partition intersecting the 7-day
        // window is recomputed; covered older partitions are final.
        let partitions = plan_partitions(&def, &covered, &data, d(2025, 5, 21), false);
        let keys: Vec<&str> = partitions.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["2025-Q2"]);
    }

    #[test]
    fn test_plan_partitions_window_spanning_boundary() {
        let def = def(true, Some(Granularity::Quarter));
        let data = DateRange::new(d(2025, 1, 1), d(2025, 4, 3)).unwrap();
        let covered: BTreeSet<String> =
            ["2025-Q1", "2025-Q2"].iter().map(|s| s.to_string()).collect();

        // April 3 with a 7-day window reaches back into Q1.
        let partitions = plan_partitions(&def, &covered, &data, d(2025, 4, 3), false);
        let keys: Vec<&str> = partitions.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["2025-Q1", "2025-Q2"]);
    }

    #[test]
    fn test_plan_partitions_bootstraps_uncovered() {
        let def = def(true, Some(Granularity::Quarter));
        let data = DateRange::new(d(2024, 11, 2), d(2025, 5, 20)).unwrap();

        // Nothing covered yet: every partition in the data range is built.
        let partitions = plan_partitions(&def, &BTreeSet::new(), &data, d(2025, 5, 21), false);
        let keys: Vec<&str> = partitions.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["2024-Q4", "2025-Q1", "2025-Q2"]);
    }

    #[test]
    fn test_plan_partitions_non_incremental_recomputes_all() {
        let def = def(false, Some(Granularity::Quarter));
        let data = DateRange::new(d(2025, 1, 1), d(2025, 5, 20)).unwrap();
        let covered: BTreeSet<String> =
            ["2025-Q1", "2025-Q2"].iter().map(|s| s.to_string()).collect();
        let partitions = plan_partitions(&def, &covered, &data, d(2025, 5, 21), false);
        assert_eq!(partitions.len(), 2);
    }

    #[test]
    fn test_plan_partitions_unpartitioned() {
        let def = def(false, None);
        let data = DateRange::new(d(2025, 1, 1), d(2025, 5, 20)).unwrap();
        let partitions = plan_partitions(&def, &BTreeSet::new(), &data, d(2025, 5, 21), false);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].0, ALL_PARTITION);
        assert_eq!(partitions[0].1, data);
    }

    #[test]
    fn test_catalog_coverage() {
        let entry = CatalogEntry {
            def: def(true, Some(Granularity::Quarter)),
            usable: true,
            covered: ["2025-Q1", "2025-Q2"].iter().map(|s| s.to_string()).collect(),
        };
        let inside = DateRange::new(d(2025, 2, 1), d(2025, 4, 15)).unwrap();
        assert!(entry.covers(&inside));
        let outside = DateRange::new(d(2024, 12, 20), d(2025, 1, 10)).unwrap();
        assert!(!entry.covers(&outside));
    }

    #[test]
    fn test_def_hash_tracks_measure_definitions() {
        let registry = crate::schema::community_schema();
        let a = def(true, Some(Granularity::Quarter));
        let mut b = a.clone();
        let h1 = a.def_hash(&registry).unwrap();
        assert_eq!(h1, b.def_hash(&registry).unwrap());

        b.measures.push("metric_contributor_prs".into());
        assert_ne!(h1, b.def_hash(&registry).unwrap());
    }

    #[test]
    fn test_validate_rejects_derived_measures() {
        let registry = crate::schema::community_schema();
        let mut r = def(true, None);
        r.measures = vec!["star_count".into()];
        assert!(matches!(r.validate(&registry), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_granularity() {
        let registry = crate::schema::community_schema();
        let mut r = def(true, Some(Granularity::Month));
        r.granularity = Granularity::Year;
        assert!(matches!(r.validate(&registry), Err(Error::Config(_))));
    }

    // ── Store lifecycle ────────────────────────────────────────────

    use crate::model::Activity;
    use crate::schema::community_schema;
    use chrono::TimeZone;

    fn event(id: &str, kind: &str, user: &str, month: u32, day: u32) -> Activity {
        Activity {
            id: id.into(),
            kind: kind.into(),
            timestamp: Utc.with_ymd_and_hms(2023, month, day, 12, 0, 0).unwrap(),
            username: Some(user.into()),
            object_member_username: None,
            object_member_id: None,
            platform: Some("github".into()),
            source_id: None,
            channel: None,
            tenant_id: "t1".into(),
            member_id: Some(format!("m-{user}")),
            url: None,
            is_contribution: true,
        }
    }

    async fn store_with_events(events: Vec<Activity>) -> (Database, RollupStore) {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(move |conn| repository::insert_activities(conn, &events))
            .await
            .unwrap();
        let store = RollupStore::open(
            db.clone(),
            Arc::new(community_schema()),
            crate::schema::community_rollups(),
        )
        .await
        .unwrap();
        (db, store)
    }

    fn d_utc(y: i32, m: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_materializes_partitions() {
        let (db, store) = store_with_events(vec![
            event("1", "issue-comment", "a", 2, 10),
            event("2", "pull_request-opened", "a", 5, 4),
            event("3", "issue-comment", "b", 5, 5),
        ])
        .await;

        store
            .refresh_as_of("contrlead", d_utc(2023, 5, 12))
            .await
            .unwrap();

        let snapshot = store.snapshot();
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.def.id == "contrlead")
            .unwrap();
        assert!(entry.usable);
        // Bootstrap builds Q1 (February event) as well as Q2.
        assert!(entry.covered.contains("2023-Q1"));
        assert!(entry.covered.contains("2023-Q2"));
        let range = DateRange::new(d(2023, 2, 1), d(2023, 5, 12)).unwrap();
        assert!(entry.covers(&range));

        let rows = db
            .reader()
            .call(|conn| {
                repository::read_rollup_rows(
                    conn,
                    "contrlead",
                    &["2023-Q2".to_string()],
                )
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_state_survives_reopen() {
        let (db, store) = store_with_events(vec![event("1", "issue-comment", "a", 5, 4)]).await;
        store
            .refresh_as_of("contrlead", d_utc(2023, 5, 12))
            .await
            .unwrap();
        drop(store);

        let reopened = RollupStore::open(
            db.clone(),
            Arc::new(community_schema()),
            crate::schema::community_rollups(),
        )
        .await
        .unwrap();
        let snapshot = reopened.snapshot();
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.def.id == "contrlead")
            .unwrap();
        assert!(entry.usable);
        assert!(entry.covered.contains("2023-Q2"));
    }

    #[tokio::test]
    async fn test_changed_definition_requires_rebuild() {
        let (db, store) = store_with_events(vec![event("1", "issue-comment", "a", 5, 4)]).await;
        store
            .refresh_as_of("contrlead", d_utc(2023, 5, 12))
            .await
            .unwrap();
        drop(store);

        // Simulate a definition change by corrupting the stored hash.
        db.writer()
            .call(|conn| repository::set_rollup_state(conn, "contrlead", "stale-hash", false, None))
            .await
            .unwrap();

        let store = RollupStore::open(
            db.clone(),
            Arc::new(community_schema()),
            crate::schema::community_rollups(),
        )
        .await
        .unwrap();
        let snapshot = store.snapshot();
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.def.id == "contrlead")
            .unwrap();
        assert!(!entry.usable);

        // Incremental refresh refuses to patch; a rebuild restores it.
        assert!(matches!(
            store.refresh_as_of("contrlead", d_utc(2023, 5, 12)).await,
            Err(Error::DefinitionChanged(_))
        ));
        store.rebuild("contrlead").await.unwrap();
        let snapshot = store.snapshot();
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.def.id == "contrlead")
            .unwrap();
        assert!(entry.usable);
    }

    #[tokio::test]
    async fn test_rebuild_in_progress_fails_closed() {
        let (_db, store) = store_with_events(vec![event("1", "issue-comment", "a", 5, 4)]).await;
        store.force_rebuilding("contrlead", true);

        assert!(matches!(
            store.rebuild("contrlead").await,
            Err(Error::RebuildInProgress(_))
        ));
        assert!(matches!(
            store.refresh_as_of("contrlead", d_utc(2023, 5, 12)).await,
            Err(Error::RebuildInProgress(_))
        ));

        // And the rollup is invisible to the planner meanwhile.
        let snapshot = store.snapshot();
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.def.id == "contrlead")
            .unwrap();
        assert!(!entry.usable);

        store.force_rebuilding("contrlead", false);
        store.rebuild("contrlead").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_rollup_not_usable() {
        let (_db, store) = store_with_events(vec![event("1", "issue-comment", "a", 5, 4)]).await;
        store
            .refresh_as_of("contrlead", d_utc(2023, 5, 12))
            .await
            .unwrap();
        store.mark_stale("contrlead").await;

        let snapshot = store.snapshot();
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.def.id == "contrlead")
            .unwrap();
        assert!(!entry.usable);

        // A successful refresh clears the flag.
        store
            .refresh_as_of("contrlead", d_utc(2023, 5, 12))
            .await
            .unwrap();
        assert!(store
            .snapshot()
            .entries
            .iter()
            .find(|e| e.def.id == "contrlead")
            .unwrap()
            .usable);
    }

    #[tokio::test]
    async fn test_refresh_due_respects_cadence() {
        let (_db, store) = store_with_events(vec![event("1", "issue-comment", "a", 5, 4)]).await;
        // Never refreshed: everything is due.
        let refreshed = store.refresh_due().await.unwrap();
        assert_eq!(refreshed.len(), store.defs().len());
        // Immediately after, nothing is due.
        let refreshed = store.refresh_due().await.unwrap();
        assert!(refreshed.is_empty());
    }

    #[tokio::test]
    async fn test_unpartitioned_rollup_covers_everything_after_refresh() {
        let (_db, store) = store_with_events(vec![
            event("1", "issues-opened", "a", 5, 4),
            event("2", "issues-closed", "b", 5, 5),
        ])
        .await;
        store
            .refresh_as_of("issues_by_month", d_utc(2023, 5, 12))
            .await
            .unwrap();
        let snapshot = store.snapshot();
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.def.id == "issues_by_month")
            .unwrap();
        assert!(entry.covered.contains(ALL_PARTITION));
        let far = DateRange::new(d(2020, 1, 1), d(2024, 12, 31)).unwrap();
        assert!(entry.covers(&far));
    }
}
