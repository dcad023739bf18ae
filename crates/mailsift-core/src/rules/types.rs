use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Comparison operators a rule detail can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "EQUALS")]
    Equals,
    #[serde(alias = "NOT_EQUALS")]
    NotEquals,
    #[serde(alias = "CONTAINS")]
    Contains,
    #[serde(alias = "NOT_CONTAINS")]
    NotContains,
    #[serde(alias = "LESS_THAN")]
    LessThan,
    #[serde(alias = "GREATER_THAN")]
    GreaterThan,
    #[serde(alias = "LESS_THAN_EQUALS")]
    LessThanEquals,
    #[serde(alias = "GREATER_THAN_EQUALS")]
    GreaterThanEquals,
    #[serde(alias = "IN")]
    In,
    #[serde(alias = "NOT_IN")]
    NotIn,
}

impl Operator {
    pub const ALL: [Operator; 10] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::Contains,
        Operator::NotContains,
        Operator::LessThan,
        Operator::GreaterThan,
        Operator::LessThanEquals,
        Operator::GreaterThanEquals,
        Operator::In,
        Operator::NotIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::LessThan => "less_than",
            Operator::GreaterThan => "greater_than",
            Operator::LessThanEquals => "less_than_equals",
            Operator::GreaterThanEquals => "greater_than_equals",
            Operator::In => "in",
            Operator::NotIn => "not_in",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == value)
    }

    /// True for operators that keep records where the positive test fails.
    pub fn is_negated(&self) -> bool {
        matches!(
            self,
            Operator::NotEquals | Operator::NotContains | Operator::NotIn
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Datetime,
}

impl FieldType {
    /// The operators that make sense for values of this type at all. Catalog
    /// entries pick a non-empty subset.
    pub fn applicable_operators(&self) -> &'static [Operator] {
        use Operator::*;
        match self {
            FieldType::String => &[Equals, NotEquals, Contains, NotContains, In, NotIn],
            FieldType::Number | FieldType::Datetime => &[
                Equals,
                NotEquals,
                LessThan,
                GreaterThan,
                LessThanEquals,
                GreaterThanEquals,
                In,
                NotIn,
            ],
            FieldType::Boolean => &[Equals, NotEquals],
        }
    }
}

/// Unit of a relative-time literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldUnit {
    #[serde(alias = "MINUTES")]
    Minutes,
    #[serde(alias = "HOURS")]
    Hours,
    #[serde(alias = "DAYS")]
    Days,
    #[serde(alias = "MONTHS")]
    Months,
    #[serde(alias = "YEARS")]
    Years,
}

impl FieldUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldUnit::Minutes => "minutes",
            FieldUnit::Hours => "hours",
            FieldUnit::Days => "days",
            FieldUnit::Months => "months",
            FieldUnit::Years => "years",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "minutes" => Some(FieldUnit::Minutes),
            "hours" => Some(FieldUnit::Hours),
            "days" => Some(FieldUnit::Days),
            "months" => Some(FieldUnit::Months),
            "years" => Some(FieldUnit::Years),
            _ => None,
        }
    }
}

/// How a rule's details are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    #[serde(alias = "ALL")]
    All,
    #[serde(alias = "ANY")]
    Any,
}

impl Combinator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Combinator::All => "all",
            Combinator::Any => "any",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Combinator::All),
            "any" => Some(Combinator::Any),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[serde(alias = "MOVE")]
    Move,
    #[serde(alias = "MARK_READ", alias = "MARK_AS_READ", alias = "mark_as_read")]
    MarkRead,
    #[serde(alias = "MARK_UNREAD", alias = "MARK_AS_UNREAD", alias = "mark_as_unread")]
    MarkUnread,
    #[serde(alias = "DELETE")]
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Move => "move",
            ActionType::MarkRead => "mark_read",
            ActionType::MarkUnread => "mark_unread",
            ActionType::Delete => "delete",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "move" => Some(ActionType::Move),
            "mark_read" => Some(ActionType::MarkRead),
            "mark_unread" => Some(ActionType::MarkUnread),
            "delete" => Some(ActionType::Delete),
            _ => None,
        }
    }
}

/// Candidate rule as submitted for validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(alias = "predicate")]
    pub combinator: Combinator,
    pub details: Vec<NewRuleDetail>,
    pub actions: Vec<NewRuleAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRuleDetail {
    pub field_name: String,
    #[serde(alias = "operation")]
    pub operator: Operator,
    pub value: String,
    #[serde(default)]
    pub unit: Option<FieldUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRuleAction {
    pub action: ActionType,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub combinator: Combinator,
    pub details: Vec<RuleDetail>,
    pub actions: Vec<RuleAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleDetail {
    pub id: String,
    pub position: i64,
    pub field_name: String,
    pub operator: Operator,
    pub value: String,
    pub unit: Option<FieldUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleAction {
    pub id: String,
    pub position: i64,
    pub action: ActionType,
    pub value: Option<String>,
}

impl RuleAction {
    /// Label names listed in a MOVE value, trimmed, blanks dropped.
    pub fn label_names(&self) -> Vec<String> {
        split_list(self.value.as_deref().unwrap_or_default())
    }
}

/// Splits a comma-separated literal into trimmed, non-empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
