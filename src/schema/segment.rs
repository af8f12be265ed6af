use serde::{Deserialize, Serialize};

use crate::model::Activity;

/// A named, reusable boolean predicate over an activity.
///
/// Predicates are data, not closures: every segment and measure filter in the
/// schema is a prefix, set-membership, equality or flag test (or an and/or of
/// those), so they can be hashed into rollup definitions and compared for
/// plan matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `type = 'x'`
    TypeIs(String),
    /// `type IN (...)`
    TypeIn(Vec<String>),
    /// `type LIKE 'x%'`
    TypePrefix(String),
    /// `isContribution = true`
    IsContribution,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, a: &Activity) -> bool {
        match self {
            Predicate::TypeIs(t) => a.kind == *t,
            Predicate::TypeIn(ts) => ts.iter().any(|t| a.kind == *t),
            Predicate::TypePrefix(p) => a.kind.starts_with(p.as_str()),
            Predicate::IsContribution => a.is_contribution,
            Predicate::And(ps) => ps.iter().all(|p| p.matches(a)),
            Predicate::Or(ps) => ps.iter().any(|p| p.matches(a)),
        }
    }

    /// AND-combine a filter list; an empty list means "all events pass".
    pub fn all(mut filters: Vec<Predicate>) -> Option<Predicate> {
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Predicate::And(filters)),
        }
    }
}
