pub mod date_util;
pub mod error;
pub mod exec;
pub mod model;
pub mod query;
pub mod rollup;
pub mod schema;
pub mod storage;
pub mod url;

pub use error::{Error, Result};
pub use exec::{ExecOptions, Leaderboard, LeaderboardEntry};
pub use model::{Activity, MemberProfile, Row, Value};
pub use query::{
    CompiledQuery, DateRange, Granularity, OrderDirection, Period, PlanSource, QueryDescriptor,
};
pub use rollup::{RefreshPolicy, RollupDef, RollupStatusReport, RollupStore};
pub use schema::{community_rollups, community_schema, SchemaRegistry};
pub use storage::Database;

use std::sync::Arc;

use exec::leaderboard::PeriodSlice;
use storage::repository;

/// Main entry point for the activity data warehouse: schema registry, rollup
/// store and executor wired over one database.
pub struct ActivityDW {
    db: Database,
    registry: Arc<SchemaRegistry>,
    rollups: RollupStore,
    exec_options: ExecOptions,
}

impl ActivityDW {
    /// Open with the built-in community schema and rollups.
    pub async fn open(db: Database) -> Result<Self> {
        Self::with_schema(db, community_schema(), community_rollups()).await
    }

    /// Open with a caller-provided schema and rollup set.
    pub async fn with_schema(
        db: Database,
        registry: SchemaRegistry,
        rollups: Vec<RollupDef>,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let rollups = RollupStore::open(db.clone(), registry.clone(), rollups).await?;
        Ok(Self {
            db,
            registry,
            rollups,
            exec_options: ExecOptions::default(),
        })
    }

    pub fn with_exec_options(mut self, options: ExecOptions) -> Self {
        self.exec_options = options;
        self
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn rollups(&self) -> &RollupStore {
        &self.rollups
    }

    /// Compile a descriptor against the schema and the current rollup
    /// catalog. Synchronous and side-effect-free.
    pub fn compile(&self, q: &QueryDescriptor) -> Result<CompiledQuery> {
        query::compile(&self.registry, &self.rollups.snapshot(), q)
    }

    /// Compile and execute a query, returning grouped result rows.
    pub async fn query(&self, q: &QueryDescriptor) -> Result<Vec<Row>> {
        let plan = self.compile(q)?;
        exec::execute(&self.db, plan, &self.exec_options).await
    }

    /// Period-over-period contributor leaderboard for one measure.
    ///
    /// Runs the four slices the dashboard needs — scalar totals and per-member
    /// rows for both windows — and joins them per member id.
    pub async fn leaderboard(
        &self,
        tenant_ids: &[String],
        current: DateRange,
        previous: DateRange,
        measure: &str,
    ) -> Result<Leaderboard> {
        self.registry.measure(measure)?;
        let tenants: Vec<&str> = tenant_ids.iter().map(|s| s.as_str()).collect();

        let totals = |range: DateRange| {
            QueryDescriptor::new()
                .measure(measure)
                .filter_in("activity_tenant_id", &tenants)
                .time_range(range)
        };
        let per_member = |range: DateRange| {
            totals(range)
                .dimension("member_id")
                .dimension("username")
                .dimension("member_logo_url")
                .order_by(measure, OrderDirection::Desc)
        };

        let total_current = scalar(&self.query(&totals(current)).await?, measure);
        let total_previous = scalar(&self.query(&totals(previous)).await?, measure);
        let current_rows = self.query(&per_member(current)).await?;
        let previous_rows = self.query(&per_member(previous)).await?;

        exec::build_leaderboard(
            total_current,
            total_previous,
            &PeriodSlice::new(measure, "member_id", current_rows),
            &PeriodSlice::new(measure, "member_id", previous_rows),
        )
    }

    // ── Rollup maintenance ─────────────────────────────────────────

    pub async fn refresh_rollup(&self, id: &str) -> Result<()> {
        self.rollups.refresh(id).await
    }

    pub async fn refresh_due_rollups(&self) -> Result<Vec<String>> {
        self.rollups.refresh_due().await
    }

    pub async fn rebuild_rollup(&self, id: &str) -> Result<()> {
        self.rollups.rebuild(id).await
    }

    // ── Ingestion adapters ─────────────────────────────────────────

    /// Load activity events (the write path itself belongs to the ingestion
    /// collaborator; this seam exists for the CLI and tests).
    pub async fn import_activities(&self, activities: Vec<Activity>) -> Result<usize> {
        self.db
            .writer()
            .call(move |conn| repository::insert_activities(conn, &activities))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn upsert_member(
        &self,
        member_id: &str,
        display_name: Option<&str>,
        logo_url: Option<&str>,
    ) -> Result<()> {
        let member_id = member_id.to_string();
        let display_name = display_name.map(String::from);
        let logo_url = logo_url.map(String::from);
        self.db
            .writer()
            .call(move |conn| {
                repository::upsert_member(
                    conn,
                    &member_id,
                    display_name.as_deref(),
                    logo_url.as_deref(),
                )
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Config ─────────────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .writer()
            .call(move |conn| repository::set_config(conn, &key, &value))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

fn scalar(rows: &[Row], measure: &str) -> i64 {
    rows.first()
        .and_then(|row| row.get(measure))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}
