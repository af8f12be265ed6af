pub mod dimension;
pub mod measure;
pub mod segment;

pub use dimension::{DimensionDef, DimensionExpr};
pub use measure::{Accumulator, Aggregation, DistinctField, Expr, MeasureDef};
pub use segment::Predicate;

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::Activity;
use crate::query::period::Granularity;
use crate::rollup::{RefreshPolicy, RollupDef};

/// Named registries for segments, dimensions and measures.
///
/// Registration happens once at startup and is append-only; queries resolve
/// names through a compilation pass instead of looking them up per row.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    segments: HashMap<String, Predicate>,
    dimensions: HashMap<String, DimensionDef>,
    measures: HashMap<String, MeasureDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_segment(&mut self, name: &str, predicate: Predicate) -> Result<()> {
        if self.segments.contains_key(name) {
            return Err(Error::DuplicateDefinition(format!("segment '{name}'")));
        }
        self.segments.insert(name.to_string(), predicate);
        Ok(())
    }

    pub fn register_dimension(&mut self, name: &str, expr: DimensionExpr) -> Result<()> {
        if self.dimensions.contains_key(name) {
            return Err(Error::DuplicateDefinition(format!("dimension '{name}'")));
        }
        self.dimensions
            .insert(name.to_string(), DimensionDef::new(name, expr));
        Ok(())
    }

    /// Register a measure. A derived measure may reference only measures that
    /// are already registered, which rules out cycles by construction.
    pub fn register_measure(&mut self, def: MeasureDef) -> Result<()> {
        if self.measures.contains_key(&def.name) {
            return Err(Error::DuplicateDefinition(format!("measure '{}'", def.name)));
        }
        if let Aggregation::Derived(expr) = &def.aggregation {
            for dep in expr.references() {
                if dep == def.name {
                    return Err(Error::CyclicDefinition(def.name.clone()));
                }
                if !self.measures.contains_key(&dep) {
                    return Err(Error::UnknownMember(format!(
                        "measure '{}' references undefined measure '{dep}'",
                        def.name
                    )));
                }
            }
        }
        self.measures.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn segment(&self, name: &str) -> Result<&Predicate> {
        self.segments
            .get(name)
            .ok_or_else(|| Error::UnknownMember(format!("segment '{name}'")))
    }

    pub fn dimension(&self, name: &str) -> Result<&DimensionDef> {
        self.dimensions
            .get(name)
            .ok_or_else(|| Error::UnknownMember(format!("dimension '{name}'")))
    }

    pub fn measure(&self, name: &str) -> Result<&MeasureDef> {
        self.measures
            .get(name)
            .ok_or_else(|| Error::UnknownMember(format!("measure '{name}'")))
    }

    /// Evaluate a named segment against one activity.
    pub fn evaluate_segment(&self, name: &str, a: &Activity) -> Result<bool> {
        let predicate = self
            .segments
            .get(name)
            .ok_or_else(|| Error::UnknownPredicate(name.to_string()))?;
        Ok(predicate.matches(a))
    }

    /// A measure is additive when values for fine buckets can be summed into
    /// coarser ones: plain counts are, distinct counts are not, and derived
    /// measures inherit from everything they reference.
    pub fn is_additive(&self, def: &MeasureDef) -> bool {
        match &def.aggregation {
            Aggregation::Count => true,
            Aggregation::CountDistinct(_) => false,
            Aggregation::Derived(expr) => expr.references().iter().all(|name| {
                self.measures
                    .get(name)
                    .is_some_and(|dep| self.is_additive(dep))
            }),
        }
    }
}

const COMMENT_TYPES: [&str; 3] = [
    "issue-comment",
    "pull_request-comment",
    "pull_request-review-thread-comment",
];

const COMMIT_TYPES: [&str; 3] = ["committed-commit", "co-authored-commit", "authored commit"];

const CONTRIBUTION_TYPES: [&str; 9] = [
    "issue-comment",
    "issues-closed",
    "issues-opened",
    "pull_request-closed",
    "pull_request-comment",
    "pull_request-merged",
    "pull_request-opened",
    "pull_request-review-thread-comment",
    "pull_request-reviewed",
];

fn type_in(types: &[&str]) -> Predicate {
    Predicate::TypeIn(types.iter().map(|t| t.to_string()).collect())
}

/// The community-activity schema: segments, dimensions and measures for the
/// issue/pull-request/star/commit event stream feeding the dashboards.
///
/// Several measures carry overlapping but deliberately different type lists
/// (e.g. `metric_contributor_contributors` also counts commit events while
/// `metric_contributor_contributions` does not); they are configured
/// independently on purpose.
pub fn community_schema() -> SchemaRegistry {
    let mut reg = SchemaRegistry::new();

    // ── Segments ───────────────────────────────────────────────────
    let segments: Vec<(&str, Predicate)> = vec![
        ("star", Predicate::TypeIs("star".into())),
        ("fork", Predicate::TypeIs("fork".into())),
        ("contributions_only", Predicate::IsContribution),
        ("comment_activities", type_in(&COMMENT_TYPES)),
        ("commits_activities", Predicate::TypeIs("commits".into())),
        (
            "contributions_activities",
            Predicate::Or(vec![
                Predicate::TypePrefix("issue".into()),
                Predicate::TypePrefix("pull_request-".into()),
            ]),
        ),
        ("issues_activities", Predicate::TypePrefix("issue".into())),
        (
            "pull_request_activities",
            Predicate::TypePrefix("pull_request-".into()),
        ),
        (
            "issues_only",
            type_in(&["issues-opened", "issues-closed"]),
        ),
    ];
    for (name, predicate) in segments {
        reg.register_segment(name, predicate).expect("static schema");
    }

    // ── Dimensions ─────────────────────────────────────────────────
    let dimensions: Vec<(&str, DimensionExpr)> = vec![
        ("id", DimensionExpr::Id),
        ("type", DimensionExpr::Type),
        ("username", DimensionExpr::Username),
        ("object_member_username", DimensionExpr::ObjectMemberUsername),
        ("object_member_id", DimensionExpr::ObjectMemberId),
        ("platform", DimensionExpr::Platform),
        ("source_id", DimensionExpr::SourceId),
        ("channel", DimensionExpr::Channel),
        ("activity_tenant_id", DimensionExpr::TenantId),
        ("member_id", DimensionExpr::MemberId),
        ("is_contribution", DimensionExpr::IsContribution),
        ("member_logo_url", DimensionExpr::MemberLogoUrl),
        ("member_display_name", DimensionExpr::MemberDisplayName),
    ];
    for (name, expr) in dimensions {
        reg.register_dimension(name, expr).expect("static schema");
    }

    // ── Measures ───────────────────────────────────────────────────
    let measures = vec![
        MeasureDef::count("count", vec![]),
        MeasureDef::count(
            "count_pr_activities",
            vec![type_in(&[
                "pull_request-closed",
                "pull_request-comment",
                "pull_request-merged",
                "pull_request-opened",
                "pull_request-review-thread-comment",
                "pull_request-reviewed",
            ])],
        ),
        MeasureDef::count(
            "count_metric_pr_authors",
            vec![Predicate::TypeIs("pull_request-opened".into())],
        ),
        MeasureDef::count(
            "count_metric_pr_reviewers",
            vec![Predicate::TypeIs("pull_request-reviewed".into())],
        ),
        MeasureDef::count(
            "count_metric_pr_reviews",
            vec![Predicate::TypeIs("pull_request-reviewed".into())],
        ),
        MeasureDef::count(
            "count_metric_pr_comments",
            vec![type_in(&[
                "pull_request-comment",
                "pull_request-review-thread-comment",
            ])],
        ),
        // Contributor leaderboard measures.
        MeasureDef::count(
            "metric_contributor_comments",
            vec![Predicate::IsContribution, type_in(&COMMENT_TYPES)],
        ),
        MeasureDef::count(
            "metric_contributor_contributions",
            vec![type_in(&CONTRIBUTION_TYPES)],
        ),
        MeasureDef::count("metric_contributor_contributors", {
            let mut types: Vec<&str> = CONTRIBUTION_TYPES.to_vec();
            types.extend(COMMIT_TYPES);
            vec![type_in(&types)]
        }),
        MeasureDef::count(
            "metric_org_issue_commenters",
            vec![Predicate::TypeIs("issue-comment".into())],
        ),
        MeasureDef::count(
            "metric_org_issue_opened",
            vec![Predicate::TypeIs("issues-opened".into())],
        ),
        MeasureDef::count(
            "metric_contributor_issues_closed",
            vec![Predicate::TypeIs("issues-closed".into())],
        ),
        MeasureDef::count(
            "metric_org_pr_closed",
            vec![Predicate::TypeIs("pull_request-closed".into())],
        ),
        MeasureDef::count(
            "metric_org_pr_merged",
            vec![Predicate::TypeIs("pull_request-merged".into())],
        ),
        MeasureDef::count(
            "metric_org_pr_opened",
            vec![Predicate::TypeIs("pull_request-opened".into())],
        ),
        MeasureDef::count("metric_org_commits", vec![type_in(&COMMIT_TYPES)]),
        MeasureDef::count(
            "metric_org_committers",
            vec![Predicate::TypeIs("committed-commit".into())],
        ),
        // Unique PRs where any contribution was made.
        MeasureDef::count_distinct(
            "metric_contributor_prs",
            DistinctField::ContributionUrl,
            vec![
                Predicate::IsContribution,
                Predicate::TypePrefix("pull_request-".into()),
            ],
        ),
        MeasureDef::count(
            "metric_contributor_prs_merged",
            vec![
                Predicate::IsContribution,
                Predicate::TypeIs("pull_request-merged".into()),
            ],
        ),
        MeasureDef::count(
            "metric_contributor_issues",
            vec![
                Predicate::IsContribution,
                Predicate::TypePrefix("issue-".into()),
            ],
        ),
        MeasureDef::count(
            "metric_contributor_issue_comments",
            vec![
                Predicate::IsContribution,
                Predicate::TypeIs("issue-comment".into()),
            ],
        ),
        MeasureDef::count(
            "metric_contributor_pr_comments",
            vec![
                Predicate::IsContribution,
                Predicate::TypeIs("pull_request-comment".into()),
            ],
        ),
        MeasureDef::count(
            "metric_contributor_pr_review_comments",
            vec![
                Predicate::IsContribution,
                Predicate::TypeIs("pull_request-review-thread-comment".into()),
            ],
        ),
        // Org metrics. Same nine types as contributor contributions, listed
        // in the org ordering.
        MeasureDef::count(
            "count_metric_contributions",
            vec![type_in(&[
                "issues-closed",
                "issues-opened",
                "issue-comment",
                "pull_request-closed",
                "pull_request-merged",
                "pull_request-opened",
                "pull_request-reviewed",
                "pull_request-comment",
                "pull_request-review-thread-comment",
            ])],
        ),
        MeasureDef::count(
            "count_metric_issue_commenters",
            vec![Predicate::TypeIs("issue-comment".into())],
        ),
        MeasureDef::count_distinct(
            "star_activity",
            DistinctField::Id,
            vec![Predicate::TypeIs("star".into())],
        ),
        MeasureDef::count_distinct(
            "unstar_activity",
            DistinctField::Id,
            vec![Predicate::TypeIs("unstar".into())],
        ),
        MeasureDef::derived("star_count", Expr::sub("star_activity", "unstar_activity")),
    ];
    for def in measures {
        reg.register_measure(def).expect("static schema");
    }

    reg
}

/// The rollups the dashboards rely on.
pub fn community_rollups() -> Vec<RollupDef> {
    vec![
        RollupDef {
            id: "contrlead".into(),
            measures: vec![
                "count_metric_contributions".into(),
                "metric_contributor_comments".into(),
                "metric_contributor_contributions".into(),
                "metric_contributor_issue_comments".into(),
                "metric_contributor_issues".into(),
                "metric_contributor_prs".into(),
                "metric_contributor_prs_merged".into(),
                "metric_contributor_pr_review_comments".into(),
            ],
            dimensions: vec![
                "activity_tenant_id".into(),
                "username".into(),
                "member_logo_url".into(),
            ],
            segments: vec![],
            partition_granularity: Some(Granularity::Quarter),
            granularity: Granularity::Day,
            refresh: RefreshPolicy {
                every_days: 1,
                update_window_days: 7,
                incremental: true,
            },
        },
        RollupDef {
            id: "issues_by_month".into(),
            measures: vec!["count".into()],
            dimensions: vec!["type".into()],
            segments: vec!["issues_only".into()],
            partition_granularity: None,
            granularity: Granularity::Month,
            refresh: RefreshPolicy {
                every_days: 1,
                update_window_days: 0,
                incremental: false,
            },
        },
        RollupDef {
            id: "actcount".into(),
            measures: vec!["count".into()],
            dimensions: vec![
                "activity_tenant_id".into(),
                "member_id".into(),
                "username".into(),
            ],
            segments: vec!["comment_activities".into()],
            partition_granularity: Some(Granularity::Year),
            granularity: Granularity::Year,
            refresh: RefreshPolicy {
                every_days: 1,
                update_window_days: 7,
                incremental: true,
            },
        },
    ]
}
