use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One activity event: an issue opened, a pull request merged, a comment,
/// a star, a commit. Immutable once visible to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub object_member_username: Option<String>,
    #[serde(default)]
    pub object_member_id: Option<i64>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    pub tenant_id: String,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_contribution: bool,
}

impl Activity {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// A typed result cell. The variant order gives a total order used for
/// deterministic tie-breaking when sorting grouped rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        match v {
            Some(s) => Value::Str(s),
            None => Value::Null,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// One result row: requested member name → value.
pub type Row = BTreeMap<String, Value>;

/// Joined member attributes (the many-to-one `members` side of an activity).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberProfile {
    pub display_name: Option<String>,
    pub logo_url: Option<String>,
}
