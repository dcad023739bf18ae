//! Predicate expression tree and its rendering to parameterized SQL.
//!
//! Values never appear in the SQL text; every literal is bound as a `?N`
//! parameter. Column and table names come from the static field catalog only.

use chrono::{DateTime, Utc};
use libsql::Value;

use crate::db::format_timestamp;
use crate::rules::catalog::Entity;

/// A catalog column, qualified by the table it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRef {
    pub entity: Entity,
    pub column: &'static str,
    pub multi_valued: bool,
}

impl ColumnRef {
    fn qualified(&self) -> String {
        format!("{}.{}", self.entity.table(), self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    fn sql(&self) -> &'static str {
        match self {
            RelOp::Eq => "=",
            // A missing value is unequal to every literal.
            RelOp::Ne => "IS NOT",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl From<Literal> for Value {
    fn from(literal: Literal) -> Self {
        match literal {
            Literal::Text(text) => Value::Text(text),
            Literal::Integer(number) => Value::Integer(number),
            Literal::Timestamp(at) => Value::Text(format_timestamp(at)),
        }
    }
}

/// The test applied to one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Test {
    Compare(RelOp, Literal),
    /// Identity comparison against a boolean stored as 0/1.
    Is(bool),
    IsNot(bool),
    In(Vec<Literal>),
    NotIn(Vec<Literal>),
    /// Case-insensitive substring search. On multi-valued columns the elements
    /// are joined with single spaces first.
    Contains(String),
    NotContains(String),
    /// Some element of a multi-valued column equals one of the values.
    Member(Vec<String>),
    /// No element of a multi-valued column equals any of the values.
    NotMember(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare { column: ColumnRef, test: Test },
    /// Correlated existence check against rows of `entity` for the same message.
    Exists { entity: Entity, negated: bool },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// Collects bound parameters while SQL text is assembled.
#[derive(Debug, Default)]
pub struct SqlParams {
    values: Vec<Value>,
}

impl SqlParams {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&mut self, value: impl Into<Value>) -> String {
        self.values.push(value.into());
        format!("?{}", self.values.len())
    }

    fn bind_all<I, V>(&mut self, values: I) -> String
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        values
            .into_iter()
            .map(|value| self.bind(value))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl Predicate {
    pub fn render(&self, params: &mut SqlParams) -> String {
        match self {
            Predicate::Compare { column, test } => render_test(column, test, params),
            Predicate::Exists { entity, negated } => {
                let keyword = if *negated { "NOT EXISTS" } else { "EXISTS" };
                format!(
                    "{keyword} (SELECT 1 FROM {table} AS sub WHERE sub.message_id = messages.message_id)",
                    table = entity.table()
                )
            }
            Predicate::And(children) => render_group(children, " AND ", "1 = 1", params),
            Predicate::Or(children) => render_group(children, " OR ", "1 = 0", params),
        }
    }
}

fn render_group(
    children: &[Predicate],
    separator: &str,
    empty: &str,
    params: &mut SqlParams,
) -> String {
    if children.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = children
        .iter()
        .map(|child| format!("({})", child.render(params)))
        .collect();
    parts.join(separator)
}

fn render_test(column: &ColumnRef, test: &Test, params: &mut SqlParams) -> String {
    let col = column.qualified();
    match test {
        Test::Compare(op, literal) => {
            format!("{col} {} {}", op.sql(), params.bind(literal.clone()))
        }
        Test::Is(value) => format!("{col} IS {}", params.bind(i64::from(*value))),
        Test::IsNot(value) => format!("{col} IS NOT {}", params.bind(i64::from(*value))),
        Test::In(values) => format!("{col} IN ({})", params.bind_all(values.iter().cloned())),
        Test::NotIn(values) => {
            format!("{col} NOT IN ({})", params.bind_all(values.iter().cloned()))
        }
        Test::Contains(needle) => format!(
            "instr(lower({}), lower({})) > 0",
            haystack(column),
            params.bind(needle.clone())
        ),
        Test::NotContains(needle) => format!(
            "instr(lower({}), lower({})) = 0",
            haystack(column),
            params.bind(needle.clone())
        ),
        Test::Member(values) => format!(
            "EXISTS (SELECT 1 FROM json_each({col}) WHERE json_each.value IN ({}))",
            params.bind_all(values.iter().cloned())
        ),
        Test::NotMember(values) => format!(
            "NOT EXISTS (SELECT 1 FROM json_each({col}) WHERE json_each.value IN ({}))",
            params.bind_all(values.iter().cloned())
        ),
    }
}

/// Text searched by CONTAINS. A missing value searches as the empty string.
fn haystack(column: &ColumnRef) -> String {
    let col = column.qualified();
    if column.multi_valued {
        format!("(SELECT COALESCE(group_concat(json_each.value, ' '), '') FROM json_each({col}))")
    } else {
        format!("COALESCE({col}, '')")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> ColumnRef {
        ColumnRef {
            entity: Entity::Message,
            column: "subject",
            multi_valued: false,
        }
    }

    fn recipients() -> ColumnRef {
        ColumnRef {
            entity: Entity::Message,
            column: "to_json",
            multi_valued: true,
        }
    }

    #[test]
    fn parameters_are_numbered_in_render_order() {
        let predicate = Predicate::And(vec![
            Predicate::Compare {
                column: subject(),
                test: Test::Compare(RelOp::Eq, Literal::Text("Hi".into())),
            },
            Predicate::Compare {
                column: subject(),
                test: Test::In(vec![Literal::Text("a".into()), Literal::Text("b".into())]),
            },
        ]);

        let mut params = SqlParams::new();
        let sql = predicate.render(&mut params);
        assert_eq!(
            sql,
            "(messages.subject = ?1) AND (messages.subject IN (?2, ?3))"
        );
        assert_eq!(
            params.into_values(),
            vec![
                Value::Text("Hi".into()),
                Value::Text("a".into()),
                Value::Text("b".into())
            ]
        );
    }

    #[test]
    fn contains_on_multi_valued_column_searches_joined_text() {
        let predicate = Predicate::Compare {
            column: recipients(),
            test: Test::Contains("example.com".into()),
        };
        let mut params = SqlParams::new();
        let sql = predicate.render(&mut params);
        assert_eq!(
            sql,
            "instr(lower((SELECT COALESCE(group_concat(json_each.value, ' '), '') FROM json_each(messages.to_json))), lower(?1)) > 0"
        );
    }

    #[test]
    fn membership_and_identity_tests() {
        let mut params = SqlParams::new();
        let member = Predicate::Compare {
            column: recipients(),
            test: Test::NotMember(vec!["a@example.com".into()]),
        }
        .render(&mut params);
        assert_eq!(
            member,
            "NOT EXISTS (SELECT 1 FROM json_each(messages.to_json) WHERE json_each.value IN (?1))"
        );

        let active = ColumnRef {
            entity: Entity::Message,
            column: "is_active",
            multi_valued: false,
        };
        let identity = Predicate::Compare {
            column: active,
            test: Test::IsNot(true),
        }
        .render(&mut params);
        assert_eq!(identity, "messages.is_active IS NOT ?2");
        assert_eq!(params.into_values()[1], Value::Integer(1));
    }

    #[test]
    fn exists_and_empty_groups() {
        let mut params = SqlParams::new();
        let exists = Predicate::Exists {
            entity: Entity::MessageAttachment,
            negated: true,
        }
        .render(&mut params);
        assert_eq!(
            exists,
            "NOT EXISTS (SELECT 1 FROM message_attachments AS sub WHERE sub.message_id = messages.message_id)"
        );
        assert_eq!(Predicate::And(vec![]).render(&mut params), "1 = 1");
        assert_eq!(Predicate::Or(vec![]).render(&mut params), "1 = 0");
        assert!(params.into_values().is_empty());
    }

    #[test]
    fn timestamps_bind_as_sortable_text() {
        let at = DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
            .expect("parse")
            .with_timezone(&Utc);
        assert_eq!(
            Value::from(Literal::Timestamp(at)),
            Value::Text("2024-06-01T10:00:00.000Z".into())
        );
    }
}
