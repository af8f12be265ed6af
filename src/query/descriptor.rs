use serde::{Deserialize, Serialize};

use crate::query::period::{DateRange, Granularity};

/// Filter operator on a dimension member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Equals,
    In,
    InDateRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub member: String,
    pub operator: FilterOp,
    pub values: Vec<String>,
}

/// The time dimension of a query: a `[startDate, endDate]` pair over
/// `timestamp`, with an optional result granularity that buckets output rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimension {
    pub dimension: String,
    pub date_range: [String; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// A query as the transport layer sends it: member names plus filters,
/// a time window, ordering and a row limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub measures: Vec<String>,
    pub dimensions: Vec<String>,
    pub segments: Vec<String>,
    pub filters: Vec<Filter>,
    pub time_dimensions: Vec<TimeDimension>,
    /// Ordered list of (member, direction) pairs.
    pub order: Vec<(String, OrderDirection)>,
    pub limit: Option<usize>,
}

impl QueryDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measure(mut self, name: &str) -> Self {
        self.measures.push(name.to_string());
        self
    }

    pub fn dimension(mut self, name: &str) -> Self {
        self.dimensions.push(name.to_string());
        self
    }

    pub fn segment(mut self, name: &str) -> Self {
        self.segments.push(name.to_string());
        self
    }

    pub fn filter_equals(mut self, member: &str, value: &str) -> Self {
        self.filters.push(Filter {
            member: member.to_string(),
            operator: FilterOp::Equals,
            values: vec![value.to_string()],
        });
        self
    }

    pub fn filter_in(mut self, member: &str, values: &[&str]) -> Self {
        self.filters.push(Filter {
            member: member.to_string(),
            operator: FilterOp::In,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn time_range(mut self, range: DateRange) -> Self {
        self.time_dimensions.push(TimeDimension {
            dimension: "timestamp".to_string(),
            date_range: [range.start.to_string(), range.end.to_string()],
            granularity: None,
        });
        self
    }

    /// Result granularity for the most recently added time dimension.
    pub fn granularity(mut self, g: Granularity) -> Self {
        if let Some(td) = self.time_dimensions.last_mut() {
            td.granularity = Some(g);
        }
        self
    }

    pub fn order_by(mut self, member: &str, direction: OrderDirection) -> Self {
        self.order.push((member.to_string(), direction));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}
