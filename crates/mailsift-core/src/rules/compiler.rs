use std::sync::Arc;

use chrono::{DateTime, Months, TimeDelta, Utc};
use libsql::Value;
use thiserror::Error;

use crate::constants::RECEIVED_AT_FIELD;
use crate::db::Page;
use crate::messages::QUALIFIED_MESSAGE_COLUMNS;
use crate::rules::catalog::{Entity, FieldCatalog, FieldDescriptor, FieldStorage};
use crate::rules::predicate::{ColumnRef, Literal, Predicate, RelOp, SqlParams, Test};
use crate::rules::types::{
    Combinator, FieldType, FieldUnit, NewRuleDetail, Operator, Rule, RuleDetail, split_list,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("operator {operator} is not allowed for field {field}")]
    InvalidOperationForField { field: String, operator: String },
    #[error("invalid value {value:?} for field {field}: {reason}")]
    InvalidValueType {
        field: String,
        value: String,
        reason: String,
    },
    #[error("invalid unit for field {field}: {reason}")]
    InvalidUnit { field: String, reason: String },
}

/// Borrowed view of one condition, shared by candidate and stored rules.
#[derive(Debug, Clone, Copy)]
pub struct Condition<'a> {
    pub field_name: &'a str,
    pub operator: Operator,
    pub value: &'a str,
    pub unit: Option<FieldUnit>,
}

impl<'a> From<&'a NewRuleDetail> for Condition<'a> {
    fn from(detail: &'a NewRuleDetail) -> Self {
        Self {
            field_name: &detail.field_name,
            operator: detail.operator,
            value: &detail.value,
            unit: detail.unit,
        }
    }
}

impl<'a> From<&'a RuleDetail> for Condition<'a> {
    fn from(detail: &'a RuleDetail) -> Self {
        Self {
            field_name: &detail.field_name,
            operator: detail.operator,
            value: &detail.value,
            unit: detail.unit,
        }
    }
}

/// A rule's predicate plus the entities that must be outer-joined to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub predicate: Predicate,
    /// Non-root entities in first-use order, each at most once.
    pub joins: Vec<Entity>,
}

impl CompiledQuery {
    fn from_clause(&self) -> String {
        let mut clause = String::from("FROM messages");
        for entity in &self.joins {
            let table = entity.table();
            clause.push_str(&format!(
                " LEFT OUTER JOIN {table} ON {table}.message_id = messages.message_id"
            ));
        }
        clause
    }

    /// Distinct matching messages, in a stable order for paging.
    pub fn select_sql(&self, page: Page) -> (String, Vec<Value>) {
        let mut params = SqlParams::new();
        let condition = self.predicate.render(&mut params);
        let sql = format!(
            "SELECT DISTINCT {QUALIFIED_MESSAGE_COLUMNS} {} WHERE {condition} ORDER BY messages.received_at, messages.message_id {}",
            self.from_clause(),
            page.limit_clause()
        );
        (sql, params.into_values())
    }

    pub fn count_sql(&self) -> (String, Vec<Value>) {
        let mut params = SqlParams::new();
        let condition = self.predicate.render(&mut params);
        let sql = format!(
            "SELECT COUNT(DISTINCT messages.id) {} WHERE {condition}",
            self.from_clause()
        );
        (sql, params.into_values())
    }
}

/// Turns rule conditions into a [`CompiledQuery`].
#[derive(Clone)]
pub struct PredicateCompiler {
    catalog: Arc<FieldCatalog>,
}

impl PredicateCompiler {
    pub fn new(catalog: Arc<FieldCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    /// Compiles a stored rule. Relative-time literals are resolved against `now`.
    pub fn compile(&self, rule: &Rule, now: DateTime<Utc>) -> Result<CompiledQuery, CompileError> {
        self.compile_conditions(
            rule.combinator,
            rule.details.iter().map(Condition::from),
            now,
        )
    }

    pub fn compile_conditions<'a>(
        &self,
        combinator: Combinator,
        conditions: impl IntoIterator<Item = Condition<'a>>,
        now: DateTime<Utc>,
    ) -> Result<CompiledQuery, CompileError> {
        let mut joins = Vec::new();
        let mut nodes = Vec::new();
        for condition in conditions {
            nodes.push(self.compile_condition(condition, now, &mut joins)?);
        }

        let predicate = match combinator {
            Combinator::All => Predicate::And(nodes),
            Combinator::Any => Predicate::Or(nodes),
        };
        Ok(CompiledQuery { predicate, joins })
    }

    /// Checks a condition against the catalog without keeping the result.
    pub fn check(&self, condition: Condition<'_>) -> Result<(), CompileError> {
        self.compile_condition(condition, Utc::now(), &mut Vec::new())
            .map(|_| ())
    }

    fn compile_condition(
        &self,
        condition: Condition<'_>,
        now: DateTime<Utc>,
        joins: &mut Vec<Entity>,
    ) -> Result<Predicate, CompileError> {
        let field = self
            .catalog
            .lookup(condition.field_name)
            .map_err(|_| CompileError::UnknownField(condition.field_name.to_string()))?;

        let relative_time = field.name == RECEIVED_AT_FIELD;
        match (relative_time, condition.unit) {
            (false, Some(unit)) => {
                return Err(CompileError::InvalidUnit {
                    field: field.name.to_string(),
                    reason: format!("unit {} is only allowed for {RECEIVED_AT_FIELD}", unit.as_str()),
                });
            }
            (true, None) => {
                return Err(CompileError::InvalidUnit {
                    field: field.name.to_string(),
                    reason: "a unit is required".to_string(),
                });
            }
            _ => {}
        }

        if !field.allows(condition.operator) {
            return Err(CompileError::InvalidOperationForField {
                field: field.name.to_string(),
                operator: condition.operator.as_str().to_string(),
            });
        }

        match field.storage {
            FieldStorage::Virtual { entity } => {
                let wanted = parse_bool(field, condition.value)?;
                let exists = wanted != condition.operator.is_negated();
                Ok(Predicate::Exists {
                    entity,
                    negated: !exists,
                })
            }
            FieldStorage::Column {
                entity,
                column,
                multi_valued,
            } => {
                if !entity.is_root() && !joins.contains(&entity) {
                    joins.push(entity);
                }
                let column = ColumnRef {
                    entity,
                    column,
                    multi_valued,
                };
                let test = build_test(field, &column, condition, now)?;
                Ok(Predicate::Compare { column, test })
            }
        }
    }
}

fn build_test(
    field: &FieldDescriptor,
    column: &ColumnRef,
    condition: Condition<'_>,
    now: DateTime<Utc>,
) -> Result<Test, CompileError> {
    let Condition {
        operator,
        value,
        unit,
        ..
    } = condition;

    if field.field_type == FieldType::Boolean {
        let flag = parse_bool(field, value)?;
        return match operator {
            Operator::Equals => Ok(Test::Is(flag)),
            Operator::NotEquals => Ok(Test::IsNot(flag)),
            _ => Err(invalid_operator(field, operator)),
        };
    }

    let test = match operator {
        Operator::Contains => Test::Contains(value.to_string()),
        Operator::NotContains => Test::NotContains(value.to_string()),
        Operator::In | Operator::NotIn => {
            let entries = split_list(value);
            if column.multi_valued {
                if operator == Operator::In {
                    Test::Member(entries)
                } else {
                    Test::NotMember(entries)
                }
            } else {
                let literals = entries
                    .iter()
                    .map(|entry| literal(field, entry, unit, now))
                    .collect::<Result<Vec<_>, _>>()?;
                if operator == Operator::In {
                    Test::In(literals)
                } else {
                    Test::NotIn(literals)
                }
            }
        }
        Operator::Equals if column.multi_valued => Test::Member(vec![value.to_string()]),
        Operator::NotEquals if column.multi_valued => Test::NotMember(vec![value.to_string()]),
        _ if column.multi_valued => return Err(invalid_operator(field, operator)),
        Operator::Equals => Test::Compare(RelOp::Eq, literal(field, value, unit, now)?),
        Operator::NotEquals => Test::Compare(RelOp::Ne, literal(field, value, unit, now)?),
        Operator::LessThan => Test::Compare(RelOp::Lt, literal(field, value, unit, now)?),
        Operator::LessThanEquals => Test::Compare(RelOp::Le, literal(field, value, unit, now)?),
        Operator::GreaterThan => Test::Compare(RelOp::Gt, literal(field, value, unit, now)?),
        Operator::GreaterThanEquals => {
            Test::Compare(RelOp::Ge, literal(field, value, unit, now)?)
        }
    };
    Ok(test)
}

fn invalid_operator(field: &FieldDescriptor, operator: Operator) -> CompileError {
    CompileError::InvalidOperationForField {
        field: field.name.to_string(),
        operator: operator.as_str().to_string(),
    }
}

fn invalid_value(field: &FieldDescriptor, value: &str, reason: impl Into<String>) -> CompileError {
    CompileError::InvalidValueType {
        field: field.name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn literal(
    field: &FieldDescriptor,
    raw: &str,
    unit: Option<FieldUnit>,
    now: DateTime<Utc>,
) -> Result<Literal, CompileError> {
    match field.field_type {
        FieldType::String => Ok(Literal::Text(raw.to_string())),
        FieldType::Boolean => Ok(Literal::Integer(i64::from(parse_bool(field, raw)?))),
        FieldType::Number => {
            let count = parse_number(field, raw)?;
            match unit {
                Some(unit) => relative_instant(now, count, unit)
                    .map(Literal::Timestamp)
                    .ok_or_else(|| invalid_value(field, raw, "relative time is out of range")),
                None => Ok(Literal::Integer(count)),
            }
        }
        FieldType::Datetime => DateTime::parse_from_rfc3339(raw.trim())
            .map(|at| Literal::Timestamp(at.with_timezone(&Utc)))
            .map_err(|err| invalid_value(field, raw, err.to_string())),
    }
}

pub(crate) fn parse_number(field: &FieldDescriptor, raw: &str) -> Result<i64, CompileError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| invalid_value(field, raw, "expected an integer"))
}

pub(crate) fn parse_bool(field: &FieldDescriptor, raw: &str) -> Result<bool, CompileError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid_value(field, raw, "expected true or false")),
    }
}

/// `now` moved back by `count` units. Months and years use calendar arithmetic,
/// clamping to the last day of shorter months.
pub fn relative_instant(now: DateTime<Utc>, count: i64, unit: FieldUnit) -> Option<DateTime<Utc>> {
    let delta = match unit {
        FieldUnit::Minutes => TimeDelta::try_minutes(count),
        FieldUnit::Hours => TimeDelta::try_hours(count),
        FieldUnit::Days => TimeDelta::try_days(count),
        FieldUnit::Months | FieldUnit::Years => {
            let per_unit: i64 = if unit == FieldUnit::Months { 1 } else { 12 };
            let months = u32::try_from(count.checked_mul(per_unit)?.unsigned_abs()).ok()?;
            return if count >= 0 {
                now.checked_sub_months(Months::new(months))
            } else {
                now.checked_add_months(Months::new(months))
            };
        }
    }?;
    now.checked_sub_signed(delta)
}
