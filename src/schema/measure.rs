use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Activity;
use crate::schema::segment::Predicate;
use crate::url::canonical_url;

/// Field a `count_distinct` measure distinguishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistinctField {
    Id,
    Username,
    MemberId,
    /// The activity URL with any `#fragment` stripped, so comment and review
    /// events on the same pull request collapse to one.
    ContributionUrl,
}

impl DistinctField {
    pub fn extract(&self, a: &Activity) -> Option<String> {
        match self {
            DistinctField::Id => Some(a.id.clone()),
            DistinctField::Username => a.username.clone(),
            DistinctField::MemberId => a.member_id.clone(),
            DistinctField::ContributionUrl => a.url.as_deref().map(canonical_url),
        }
    }
}

/// Closed-form arithmetic over other measures in the same query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Measure(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn sub(a: &str, b: &str) -> Expr {
        Expr::Sub(
            Box::new(Expr::Measure(a.into())),
            Box::new(Expr::Measure(b.into())),
        )
    }

    /// Names of every measure this expression references.
    pub fn references(&self) -> Vec<String> {
        fn walk(e: &Expr, out: &mut Vec<String>) {
            match e {
                Expr::Measure(name) => out.push(name.clone()),
                Expr::Add(a, b) | Expr::Sub(a, b) => {
                    walk(a, out);
                    walk(b, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }

    /// Evaluate against measure values already computed for a grouping key.
    pub fn eval(&self, measure: &str, values: &HashMap<String, i64>) -> Result<i64> {
        match self {
            Expr::Measure(name) => {
                values
                    .get(name)
                    .copied()
                    .ok_or_else(|| Error::UnresolvedDependency {
                        measure: measure.to_string(),
                        dependency: name.clone(),
                    })
            }
            Expr::Add(a, b) => Ok(a.eval(measure, values)? + b.eval(measure, values)?),
            Expr::Sub(a, b) => Ok(a.eval(measure, values)? - b.eval(measure, values)?),
        }
    }
}

/// The aggregation kind of a measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    CountDistinct(DistinctField),
    Derived(Expr),
}

/// A named aggregation definition: kind plus an AND-combined filter list
/// restricting which events contribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureDef {
    pub name: String,
    pub aggregation: Aggregation,
    pub filters: Vec<Predicate>,
}

impl MeasureDef {
    pub fn count(name: &str, filters: Vec<Predicate>) -> Self {
        Self {
            name: name.into(),
            aggregation: Aggregation::Count,
            filters,
        }
    }

    pub fn count_distinct(name: &str, field: DistinctField, filters: Vec<Predicate>) -> Self {
        Self {
            name: name.into(),
            aggregation: Aggregation::CountDistinct(field),
            filters,
        }
    }

    pub fn derived(name: &str, expr: Expr) -> Self {
        Self {
            name: name.into(),
            aggregation: Aggregation::Derived(expr),
            filters: Vec::new(),
        }
    }

    /// Whether this event passes the measure's own filters (AND-combined;
    /// an empty list passes everything).
    pub fn accepts(&self, a: &Activity) -> bool {
        self.filters.iter().all(|f| f.matches(a))
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.aggregation, Aggregation::Derived(_))
    }

    /// A fresh accumulator for this measure, or None for derived measures
    /// (computed after the reduction pass).
    pub fn accumulator(&self) -> Option<Accumulator> {
        match &self.aggregation {
            Aggregation::Count => Some(Accumulator::Count(0)),
            Aggregation::CountDistinct(field) => Some(Accumulator::Distinct {
                field: *field,
                seen: HashSet::new(),
            }),
            Aggregation::Derived(_) => None,
        }
    }
}

/// Streaming reducer: one scalar per grouping key.
#[derive(Debug, Clone)]
pub enum Accumulator {
    Count(u64),
    Distinct {
        field: DistinctField,
        seen: HashSet<String>,
    },
}

impl Accumulator {
    /// Fold one event that already passed the measure's filters.
    pub fn observe(&mut self, a: &Activity) {
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Distinct { field, seen } => {
                if let Some(v) = field.extract(a) {
                    seen.insert(v);
                }
            }
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Accumulator::Count(n) => *n as i64,
            Accumulator::Distinct { seen, .. } => seen.len() as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn pr_activity(id: &str, kind: &str, url: &str) -> Activity {
        Activity {
            id: id.into(),
            kind: kind.into(),
            timestamp: Utc.with_ymd_and_hms(2023, 5, 4, 12, 0, 0).unwrap(),
            username: Some("a".into()),
            object_member_username: None,
            object_member_id: None,
            platform: Some("github".into()),
            source_id: None,
            channel: None,
            tenant_id: "t1".into(),
            member_id: Some("m1".into()),
            url: Some(url.into()),
            is_contribution: true,
        }
    }

    #[test]
    fn test_count_accumulator() {
        let def = MeasureDef::count("count", vec![]);
        let mut acc = def.accumulator().unwrap();
        acc.observe(&pr_activity("1", "star", "https://x/1"));
        acc.observe(&pr_activity("2", "star", "https://x/2"));
        assert_eq!(acc.value(), 2);
    }

    #[test]
    fn test_distinct_collapses_same_pull_request() {
        // Two contribution events on the same PR count as one unique PR.
        let def = MeasureDef::count_distinct(
            "metric_contributor_prs",
            DistinctField::ContributionUrl,
            vec![
                Predicate::IsContribution,
                Predicate::TypePrefix("pull_request-".into()),
            ],
        );
        let events = [
            pr_activity("1", "pull_request-opened", "https://x/pull/1"),
            pr_activity(
                "2",
                "pull_request-comment",
                "https://x/pull/1#issuecomment-9",
            ),
        ];
        let mut acc = def.accumulator().unwrap();
        for e in &events {
            assert!(def.accepts(e));
            acc.observe(e);
        }
        assert_eq!(acc.value(), 1);
    }

    #[test]
    fn test_distinct_skips_missing_field() {
        let def = MeasureDef::count_distinct("m", DistinctField::ContributionUrl, vec![]);
        let mut acc = def.accumulator().unwrap();
        let mut a = pr_activity("1", "star", "https://x/1");
        a.url = None;
        acc.observe(&a);
        assert_eq!(acc.value(), 0);
    }

    #[test]
    fn test_filters_and_combined() {
        let def = MeasureDef::count(
            "merged_contributions",
            vec![
                Predicate::IsContribution,
                Predicate::TypeIs("pull_request-merged".into()),
            ],
        );
        assert!(def.accepts(&pr_activity("1", "pull_request-merged", "u")));
        assert!(!def.accepts(&pr_activity("1", "pull_request-opened", "u")));
        let mut non_contribution = pr_activity("1", "pull_request-merged", "u");
        non_contribution.is_contribution = false;
        assert!(!def.accepts(&non_contribution));
    }

    #[test]
    fn test_expr_eval_subtraction() {
        let expr = Expr::sub("star_activity", "unstar_activity");
        let mut values = HashMap::new();
        values.insert("star_activity".to_string(), 10);
        values.insert("unstar_activity".to_string(), 3);
        assert_eq!(expr.eval("star_count", &values).unwrap(), 7);
    }

    #[test]
    fn test_expr_eval_missing_dependency() {
        let expr = Expr::sub("star_activity", "unstar_activity");
        let values = HashMap::new();
        match expr.eval("star_count", &values) {
            Err(Error::UnresolvedDependency { measure, dependency }) => {
                assert_eq!(measure, "star_count");
                assert_eq!(dependency, "star_activity");
            }
            other => panic!("expected UnresolvedDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_expr_references() {
        let expr = Expr::Add(
            Box::new(Expr::sub("a", "b")),
            Box::new(Expr::Measure("c".into())),
        );
        assert_eq!(expr.references(), vec!["a", "b", "c"]);
    }
}
