use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{Activity, MemberProfile, Value};

/// Per-row projection of an activity or of its joined member record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionExpr {
    Id,
    Type,
    Username,
    ObjectMemberUsername,
    ObjectMemberId,
    Platform,
    SourceId,
    Channel,
    TenantId,
    MemberId,
    IsContribution,
    /// Joined many-to-one from the member directory.
    MemberLogoUrl,
    MemberDisplayName,
}

impl DimensionExpr {
    pub fn needs_member_join(&self) -> bool {
        matches!(
            self,
            DimensionExpr::MemberLogoUrl | DimensionExpr::MemberDisplayName
        )
    }

    pub fn eval(&self, a: &Activity, members: &HashMap<String, MemberProfile>) -> Value {
        match self {
            DimensionExpr::Id => Value::Str(a.id.clone()),
            DimensionExpr::Type => Value::Str(a.kind.clone()),
            DimensionExpr::Username => a.username.clone().into(),
            DimensionExpr::ObjectMemberUsername => a.object_member_username.clone().into(),
            DimensionExpr::ObjectMemberId => match a.object_member_id {
                Some(n) => Value::Int(n),
                None => Value::Null,
            },
            DimensionExpr::Platform => a.platform.clone().into(),
            DimensionExpr::SourceId => a.source_id.clone().into(),
            DimensionExpr::Channel => a.channel.clone().into(),
            DimensionExpr::TenantId => Value::Str(a.tenant_id.clone()),
            DimensionExpr::MemberId => a.member_id.clone().into(),
            DimensionExpr::IsContribution => Value::Bool(a.is_contribution),
            DimensionExpr::MemberLogoUrl => a
                .member_id
                .as_ref()
                .and_then(|id| members.get(id))
                .and_then(|m| m.logo_url.clone())
                .into(),
            DimensionExpr::MemberDisplayName => a
                .member_id
                .as_ref()
                .and_then(|id| members.get(id))
                .and_then(|m| m.display_name.clone())
                .into(),
        }
    }
}

/// A named dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDef {
    pub name: String,
    pub expr: DimensionExpr,
}

impl DimensionDef {
    pub fn new(name: &str, expr: DimensionExpr) -> Self {
        Self {
            name: name.into(),
            expr,
        }
    }
}
