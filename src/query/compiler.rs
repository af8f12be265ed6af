use std::collections::HashSet;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::Value;
use crate::query::descriptor::{FilterOp, OrderDirection, QueryDescriptor};
use crate::query::period::{DateRange, Granularity};
use crate::rollup::{CatalogEntry, RollupCatalog, RollupDef};
use crate::schema::{
    Aggregation, DimensionDef, DimensionExpr, MeasureDef, Predicate, SchemaRegistry,
};

/// Lifecycle of a plan. Compilation is synchronous and side-effect-free;
/// the executor moves the plan through the remaining states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanState {
    Compiled,
    Executing,
    Complete,
    Failed,
}

/// Where the executor reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlanSource {
    Raw,
    Rollup { def: RollupDef },
}

impl PlanSource {
    pub fn rollup_id(&self) -> Option<&str> {
        match self {
            PlanSource::Rollup { def } => Some(&def.id),
            PlanSource::Raw => None,
        }
    }
}

/// A compiled equals/in filter on a dimension.
#[derive(Debug, Clone)]
pub struct RowFilter {
    pub dimension: DimensionDef,
    pub values: Vec<Value>,
}

impl RowFilter {
    pub fn matches(&self, v: &Value) -> bool {
        self.values.contains(v)
    }

    /// A single-value filter pins its dimension to one member, which lets a
    /// rollup with that extra dimension still serve non-additive measures.
    pub fn is_pinned(&self) -> bool {
        self.values.len() == 1
    }
}

/// An executable aggregation plan.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub measures: Vec<MeasureDef>,
    pub dimensions: Vec<DimensionDef>,
    /// AND of the query's segment predicates; rows must pass it to exist.
    pub base: Option<Predicate>,
    pub segments: Vec<String>,
    pub row_filters: Vec<RowFilter>,
    pub range: Option<DateRange>,
    pub granularity: Option<Granularity>,
    pub order: Vec<(String, OrderDirection)>,
    pub limit: Option<usize>,
    pub source: PlanSource,
    pub state: PlanState,
}

impl CompiledQuery {
    /// The effective predicate for one measure: the query's segments
    /// intersected with the measure's own filters. Different measures in the
    /// same query may carry different effective predicates, which is why
    /// filters live on measures rather than on the whole query.
    pub fn effective_predicate(&self, measure: &MeasureDef) -> Option<Predicate> {
        let mut parts = Vec::new();
        if let Some(base) = &self.base {
            parts.push(base.clone());
        }
        parts.extend(measure.filters.iter().cloned());
        Predicate::all(parts)
    }

    pub fn needs_member_join(&self) -> bool {
        self.dimensions
            .iter()
            .map(|d| &d.expr)
            .chain(self.row_filters.iter().map(|f| &f.dimension.expr))
            .any(|e| e.needs_member_join())
    }
}

/// Compile a query descriptor against the schema registry and the current
/// rollup catalog.
pub fn compile(
    registry: &SchemaRegistry,
    catalog: &RollupCatalog,
    q: &QueryDescriptor,
) -> Result<CompiledQuery> {
    // 1. Resolve every requested name.
    let measures: Vec<MeasureDef> = q
        .measures
        .iter()
        .map(|m| registry.measure(m).cloned())
        .collect::<Result<_>>()?;
    let dimensions: Vec<DimensionDef> = q
        .dimensions
        .iter()
        .map(|d| registry.dimension(d).cloned())
        .collect::<Result<_>>()?;
    let segment_predicates: Vec<Predicate> = q
        .segments
        .iter()
        .map(|s| registry.segment(s).cloned())
        .collect::<Result<_>>()?;

    // Derived measures need their dependencies computed in the same query.
    let requested: HashSet<&str> = q.measures.iter().map(|m| m.as_str()).collect();
    for m in &measures {
        if let Aggregation::Derived(expr) = &m.aggregation {
            for dep in expr.references() {
                if !requested.contains(dep.as_str()) {
                    return Err(Error::UnresolvedDependency {
                        measure: m.name.clone(),
                        dependency: dep,
                    });
                }
            }
        }
    }

    // 2. Time window and result granularity.
    let mut range: Option<DateRange> = None;
    let mut granularity: Option<Granularity> = None;
    for td in &q.time_dimensions {
        if td.dimension != "timestamp" {
            return Err(Error::UnknownMember(format!(
                "time dimension '{}'",
                td.dimension
            )));
        }
        let r = DateRange::parse(&td.date_range[0], &td.date_range[1])?;
        range = Some(intersect_ranges(range, r)?);
        if td.granularity.is_some() {
            granularity = td.granularity;
        }
    }

    // 3. Filters: inDateRange narrows the window, equals/in become row filters.
    let mut row_filters = Vec::new();
    for f in &q.filters {
        match f.operator {
            FilterOp::InDateRange => {
                if f.member != "timestamp" {
                    return Err(Error::Other(format!(
                        "inDateRange applies only to 'timestamp', not '{}'",
                        f.member
                    )));
                }
                if f.values.len() != 2 {
                    return Err(Error::DateRange(
                        "inDateRange expects [startDate, endDate]".into(),
                    ));
                }
                let r = DateRange::parse(&f.values[0], &f.values[1])?;
                range = Some(intersect_ranges(range, r)?);
            }
            FilterOp::Equals | FilterOp::In => {
                let dimension = registry.dimension(&f.member)?.clone();
                let values = f.values.iter().map(|v| coerce(&dimension, v)).collect();
                row_filters.push(RowFilter { dimension, values });
            }
        }
    }

    // 4. Ordering keys must be requested members (or the time bucket).
    for (member, _) in &q.order {
        let known = requested.contains(member.as_str())
            || q.dimensions.iter().any(|d| d == member)
            || (member == "timestamp" && granularity.is_some());
        if !known {
            return Err(Error::UnknownMember(format!("order key '{member}'")));
        }
    }

    // 5. Pick a serving rollup, if any qualifies.
    let source = select_rollup(
        registry,
        catalog,
        &measures,
        &dimensions,
        &q.segments,
        &row_filters,
        range,
        granularity,
    );
    if let PlanSource::Rollup { def } = &source {
        log::debug!("query served from rollup '{}'", def.id);
    }

    Ok(CompiledQuery {
        measures,
        dimensions,
        base: Predicate::all(segment_predicates),
        segments: q.segments.clone(),
        row_filters,
        range,
        granularity,
        order: q.order.clone(),
        limit: q.limit,
        source,
        state: PlanState::Compiled,
    })
}

fn intersect_ranges(current: Option<DateRange>, next: DateRange) -> Result<DateRange> {
    match current {
        None => Ok(next),
        Some(prev) => prev
            .intersect(&next)
            .ok_or_else(|| Error::DateRange(format!("{prev} and {next} do not overlap"))),
    }
}

fn coerce(dimension: &DimensionDef, raw: &str) -> Value {
    match dimension.expr {
        DimensionExpr::IsContribution => Value::Bool(raw == "true" || raw == "1"),
        DimensionExpr::ObjectMemberId => raw
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(raw.to_string())),
        _ => Value::Str(raw.to_string()),
    }
}

/// Search the catalog for a rollup that can answer the query, preferring the
/// finest granularity at or below the requested one, then the smallest
/// superset of columns.
#[allow(clippy::too_many_arguments)]
fn select_rollup(
    registry: &SchemaRegistry,
    catalog: &RollupCatalog,
    measures: &[MeasureDef],
    dimensions: &[DimensionDef],
    segments: &[String],
    row_filters: &[RowFilter],
    range: Option<DateRange>,
    granularity: Option<Granularity>,
) -> PlanSource {
    // An unbounded query can never be fully covered by partitions.
    let Some(range) = range else {
        return PlanSource::Raw;
    };

    let requested_segments: HashSet<&str> = segments.iter().map(|s| s.as_str()).collect();
    let mut candidates: Vec<&CatalogEntry> = Vec::new();

    'entries: for entry in &catalog.entries {
        if !entry.usable {
            continue;
        }
        let def = &entry.def;

        // Segments are baked into the materialized rows: the sets must match
        // exactly, or the rollup holds the wrong row population.
        let rollup_segments: HashSet<&str> = def.segments.iter().map(|s| s.as_str()).collect();
        if rollup_segments != requested_segments {
            continue;
        }

        // Every requested measure must be materialized; a derived measure is
        // recomputed at query time from its materialized dependencies.
        for m in measures {
            match &m.aggregation {
                Aggregation::Derived(expr) => {
                    for dep in expr.references() {
                        if !def.measures.contains(&dep) {
                            continue 'entries;
                        }
                    }
                }
                _ => {
                    if !def.measures.contains(&m.name) {
                        continue 'entries;
                    }
                }
            }
        }

        // Grouped and filtered dimensions must all be materialized.
        for d in dimensions {
            if !def.dimensions.contains(&d.name) {
                continue 'entries;
            }
        }
        for f in row_filters {
            if !def.dimensions.contains(&f.dimension.name) {
                continue 'entries;
            }
        }

        // The requested granularity must be at or above the rollup's, and the
        // window must tile exactly into rollup buckets — a bucket straddling
        // the window edge would mix in out-of-range events.
        if let Some(req) = granularity {
            if def.granularity > req {
                continue;
            }
        }
        if !def.granularity.aligns(&range) {
            continue;
        }

        // Non-additive measures (distinct counts) cannot be merged across
        // stored rows: serve them only when each output group maps to exactly
        // one stored row.
        if measures.iter().any(|m| !registry.is_additive(m)) {
            if granularity != Some(def.granularity) {
                continue;
            }
            for dim_name in &def.dimensions {
                let grouped = dimensions.iter().any(|d| d.name == *dim_name);
                let pinned = row_filters
                    .iter()
                    .any(|f| f.dimension.name == *dim_name && f.is_pinned());
                if !grouped && !pinned {
                    continue 'entries;
                }
            }
        }

        if !entry.covers(&range) {
            continue;
        }
        candidates.push(entry);
    }

    candidates.sort_by(|a, b| {
        (a.def.granularity, a.def.dimensions.len(), a.def.measures.len(), &a.def.id).cmp(&(
            b.def.granularity,
            b.def.dimensions.len(),
            b.def.measures.len(),
            &b.def.id,
        ))
    });

    match candidates.first() {
        Some(entry) => PlanSource::Rollup {
            def: entry.def.clone(),
        },
        None => PlanSource::Raw,
    }
}
