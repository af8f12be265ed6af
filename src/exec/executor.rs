use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::model::{Activity, MemberProfile, Row, Value};
use crate::query::compiler::{CompiledQuery, PlanSource, PlanState, RowFilter};
use crate::query::descriptor::OrderDirection;
use crate::query::period::Granularity;
use crate::rollup::{RollupDef, ALL_PARTITION};
use crate::schema::{Aggregation, DimensionDef, MeasureDef, Predicate};
use crate::storage::{repository, Database};

/// Execution knobs. The deadline applies to raw-source scans only; rollup
/// reads are bounded by partition size.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub raw_scan_deadline: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            raw_scan_deadline: Duration::from_secs(30),
        }
    }
}

/// One aggregated group before formatting: time bucket, dimension tuple and
/// non-derived measure values.
#[derive(Debug, Clone)]
pub(crate) struct GroupRow {
    pub bucket: Option<NaiveDate>,
    pub dims: Vec<Value>,
    pub measures: HashMap<String, i64>,
}

/// Execute a compiled plan against the rollup store or the raw event source.
/// Returns zero rows (not an error) when nothing matches. Both paths share
/// the derived/order/limit tail, so a covered query produces identical rows
/// either way.
pub async fn execute(db: &Database, mut plan: CompiledQuery, options: &ExecOptions) -> Result<Vec<Row>> {
    plan.state = PlanState::Executing;
    let result = match plan.source.clone() {
        PlanSource::Raw => {
            let deadline = options.raw_scan_deadline;
            match tokio::time::timeout(deadline, execute_raw(db, &plan)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(deadline)),
            }
        }
        PlanSource::Rollup { def } => execute_rollup(db, &plan, &def).await,
    };
    match result {
        Ok(rows) => {
            plan.state = PlanState::Complete;
            Ok(rows)
        }
        Err(e) => {
            plan.state = PlanState::Failed;
            Err(e)
        }
    }
}

async fn execute_raw(db: &Database, plan: &CompiledQuery) -> Result<Vec<Row>> {
    let range = plan.range;
    let needs_members = plan.needs_member_join();
    let (activities, members) = db
        .reader()
        .call(move |conn| {
            let activities = repository::scan_activities(conn, range)?;
            let members = if needs_members {
                repository::load_members(conn)?
            } else {
                HashMap::new()
            };
            Ok::<_, rusqlite::Error>((activities, members))
        })
        .await?;

    log::debug!("raw scan over {range:?}: {} events", activities.len());

    let groups = aggregate_activities(
        &activities,
        plan.base.as_ref(),
        &plan.row_filters,
        &plan.dimensions,
        plan.granularity,
        &plan.measures,
        &members,
    );
    finish_rows(plan, groups)
}

async fn execute_rollup(db: &Database, plan: &CompiledQuery, def: &RollupDef) -> Result<Vec<Row>> {
    // Rollup plans always carry a range; selection rejects unbounded queries.
    let range = plan
        .range
        .ok_or_else(|| Error::Other("rollup plan without a time range".into()))?;

    let partition_keys: Vec<String> = match def.partition_granularity {
        None => vec![ALL_PARTITION.to_string()],
        Some(g) => g
            .buckets(&range)
            .into_iter()
            .map(|b| g.bucket_key(b))
            .collect(),
    };

    let id = def.id.clone();
    let stored = db
        .reader()
        .call(move |conn| repository::read_rollup_rows(conn, &id, &partition_keys))
        .await?;

    let dim_index: HashMap<&str, usize> = def
        .dimensions
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut order: Vec<(Option<NaiveDate>, Vec<Value>)> = Vec::new();
    let mut groups: HashMap<(Option<NaiveDate>, Vec<Value>), HashMap<String, i64>> =
        HashMap::new();

    for row in stored {
        // Partitions may extend past the window; buckets may not (selection
        // guarantees the range tiles into rollup buckets).
        if !range.contains(row.bucket) {
            continue;
        }
        let passes = plan.row_filters.iter().all(|f| {
            dim_index
                .get(f.dimension.name.as_str())
                .and_then(|&i| row.dims.get(i))
                .is_some_and(|v| f.matches(v))
        });
        if !passes {
            continue;
        }

        let bucket = plan.granularity.map(|g| g.truncate(row.bucket));
        let dims: Vec<Value> = plan
            .dimensions
            .iter()
            .map(|d| {
                dim_index
                    .get(d.name.as_str())
                    .and_then(|&i| row.dims.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect();

        let key = (bucket, dims);
        if !groups.contains_key(&key) {
            order.push(key.clone());
            groups.insert(key.clone(), HashMap::new());
        }
        if let Some(acc) = groups.get_mut(&key) {
            for m in &plan.measures {
                if m.is_derived() {
                    continue;
                }
                let value = row.measures.get(&m.name).copied().unwrap_or(0);
                *acc.entry(m.name.clone()).or_insert(0) += value;
            }
        }
    }

    let groups = order
        .into_iter()
        .map(|key| {
            let measures = groups.remove(&key).unwrap_or_default();
            GroupRow {
                bucket: key.0,
                dims: key.1,
                measures,
            }
        })
        .collect();
    finish_rows(plan, groups)
}

/// Group a scanned event stream and reduce every non-derived measure.
/// `base` is the AND of the query's segment predicates: an event must pass it
/// (and the row filters) for its group to exist at all; each measure then
/// applies its own filters on top.
pub(crate) fn aggregate_activities(
    activities: &[Activity],
    base: Option<&Predicate>,
    row_filters: &[RowFilter],
    dimensions: &[DimensionDef],
    granularity: Option<Granularity>,
    measures: &[MeasureDef],
    members: &HashMap<String, MemberProfile>,
) -> Vec<GroupRow> {
    let mut order: Vec<(Option<NaiveDate>, Vec<Value>)> = Vec::new();
    let mut groups: HashMap<(Option<NaiveDate>, Vec<Value>), Vec<Option<crate::schema::Accumulator>>> =
        HashMap::new();

    for a in activities {
        if let Some(base) = base {
            if !base.matches(a) {
                continue;
            }
        }
        let passes = row_filters
            .iter()
            .all(|f| f.matches(&f.dimension.expr.eval(a, members)));
        if !passes {
            continue;
        }

        let bucket = granularity.map(|g| g.truncate(a.date()));
        let dims: Vec<Value> = dimensions.iter().map(|d| d.expr.eval(a, members)).collect();
        let key = (bucket, dims);

        if !groups.contains_key(&key) {
            order.push(key.clone());
            groups.insert(
                key.clone(),
                measures.iter().map(|m| m.accumulator()).collect(),
            );
        }
        if let Some(accumulators) = groups.get_mut(&key) {
            for (m, acc) in measures.iter().zip(accumulators.iter_mut()) {
                if let Some(acc) = acc {
                    if m.accepts(a) {
                        acc.observe(a);
                    }
                }
            }
        }
    }

    order
        .into_iter()
        .map(|key| {
            let accumulators = groups.remove(&key).unwrap_or_default();
            let values = measures
                .iter()
                .zip(accumulators.iter())
                .filter_map(|(m, acc)| acc.as_ref().map(|acc| (m.name.clone(), acc.value())))
                .collect();
            GroupRow {
                bucket: key.0,
                dims: key.1,
                measures: values,
            }
        })
        .collect()
}

/// Shared tail of both execution paths: derived measures, row formatting,
/// ordering and limit.
fn finish_rows(plan: &CompiledQuery, groups: Vec<GroupRow>) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(groups.len());
    for group in groups {
        let mut values = group.measures;

        // Derived measures may reference each other; resolve until settled.
        let mut pending: Vec<&MeasureDef> =
            plan.measures.iter().filter(|m| m.is_derived()).collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut failed: Option<Error> = None;
            pending.retain(|m| {
                let Aggregation::Derived(expr) = &m.aggregation else {
                    return false;
                };
                match expr.eval(&m.name, &values) {
                    Ok(v) => {
                        values.insert(m.name.clone(), v);
                        false
                    }
                    Err(e) => {
                        failed = Some(e);
                        true
                    }
                }
            });
            if pending.len() == before {
                // Compilation guarantees dependencies are requested, so this
                // only fires on genuinely unresolvable expressions.
                return Err(failed.unwrap_or_else(|| {
                    Error::Other("derived measures did not converge".into())
                }));
            }
        }

        let mut row: Row = BTreeMap::new();
        for (d, v) in plan.dimensions.iter().zip(group.dims.iter()) {
            row.insert(d.name.clone(), v.clone());
        }
        if let Some(bucket) = group.bucket {
            row.insert("timestamp".to_string(), Value::Str(bucket.to_string()));
        }
        for m in &plan.measures {
            let value = values.get(&m.name).copied().unwrap_or(0);
            row.insert(m.name.clone(), Value::Int(value));
        }
        rows.push(row);
    }

    if !plan.order.is_empty() {
        rows.sort_by(|a, b| compare_rows(a, b, plan));
    }
    if let Some(limit) = plan.limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

/// Order by the requested keys; break ties on the grouping key ascending so
/// results are deterministic regardless of scan order.
fn compare_rows(a: &Row, b: &Row, plan: &CompiledQuery) -> Ordering {
    for (member, direction) in &plan.order {
        let av = a.get(member);
        let bv = b.get(member);
        let ord = av.cmp(&bv);
        let ord = match direction {
            OrderDirection::Asc => ord,
            OrderDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    for d in &plan.dimensions {
        let ord = a.get(&d.name).cmp(&b.get(&d.name));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.get("timestamp").cmp(&b.get("timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(id: &str, kind: &str, user: &str, day: u32) -> Activity {
        Activity {
            id: id.into(),
            kind: kind.into(),
            timestamp: Utc.with_ymd_and_hms(2023, 5, day, 9, 0, 0).unwrap(),
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

    fn count_measure() -> MeasureDef {
        MeasureDef::count("count", vec![])
    }

    fn username_dim() -> DimensionDef {
        DimensionDef::new("username", crate::schema::DimensionExpr::Username)
    }

    #[test]
    fn test_groups_by_dimension() {
        let events = vec![
            event("1", "star", "alice", 4),
            event("2", "star", "bob", 4),
            event("3", "fork", "alice", 5),
        ];
        let groups = aggregate_activities(
            &events,
            None,
            &[],
            &[username_dim()],
            None,
            &[count_measure()],
            &HashMap::new(),
        );
        assert_eq!(groups.len(), 2);
        let alice = groups
            .iter()
            .find(|g| g.dims[0] == Value::Str("alice".into()))
            .unwrap();
        assert_eq!(alice.measures["count"], 2);
    }

    #[test]
    fn test_base_predicate_gates_group_existence() {
        let mut non_contribution = event("2", "star", "bob", 4);
        non_contribution.is_contribution = false;
        let events = vec![event("1", "star", "alice", 4), non_contribution];
        let groups = aggregate_activities(
            &events,
            Some(&Predicate::IsContribution),
            &[],
            &[username_dim()],
            None,
            &[count_measure()],
            &HashMap::new(),
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].dims[0], Value::Str("alice".into()));
    }

    #[test]
    fn test_bucketing_by_granularity() {
        let events = vec![
            event("1", "star", "alice", 4),
            event("2", "star", "alice", 5),
            event("3", "star", "alice", 5),
        ];
        let groups = aggregate_activities(
            &events,
            None,
            &[],
            &[],
            Some(Granularity::Day),
            &[count_measure()],
            &HashMap::new(),
        );
        assert_eq!(groups.len(), 2);
        let day5 = groups
            .iter()
            .find(|g| g.bucket == NaiveDate::from_ymd_opt(2023, 5, 5))
            .unwrap();
        assert_eq!(day5.measures["count"], 2);
    }

    #[test]
    fn test_zero_group_survives_when_no_measure_fires() {
        // The event passes the base predicate but no measure filter, so the
        // group exists with a zero value, as SQL filtered counts behave.
        let events = vec![event("1", "star", "alice", 4)];
        let merged = MeasureDef::count(
            "merged",
            vec![Predicate::TypeIs("pull_request-merged".into())],
        );
        let groups = aggregate_activities(
            &events,
            None,
            &[],
            &[username_dim()],
            None,
            &[merged],
            &HashMap::new(),
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].measures["merged"], 0);
    }
}
