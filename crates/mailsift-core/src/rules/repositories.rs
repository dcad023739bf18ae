use libsql::{Connection, Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, Page, is_unique_violation, now_rfc3339, parse_timestamp};
use crate::rules::types::{ActionType, Combinator, FieldUnit, Operator, Rule, RuleAction, RuleDetail};
use crate::rules::validator::ValidatedRule;

const RULE_COLUMNS: &str = "id, name, description, combinator, created_at, updated_at";
const DETAIL_COLUMNS: &str = "id, position, field_name, operation, value, unit";
const ACTION_COLUMNS: &str = "id, position, action, value";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("a rule named {0:?} already exists")]
    DuplicateName(String),
    #[error("invalid {column} value in store: {value}")]
    InvalidStoredValue { column: &'static str, value: String },
}

/// Persists rules together with their ordered details and actions.
#[derive(Clone)]
pub struct RuleRepository {
    db: Database,
}

impl RuleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Writes the rule, its details and its actions in one transaction.
    pub async fn create(&self, rule: ValidatedRule) -> Result<Rule, RuleError> {
        let rule = rule.into_inner();
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!("INSERT INTO rules ({RULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?5)"),
            params![
                id.as_str(),
                rule.name.as_str(),
                rule.description.clone(),
                rule.combinator.as_str(),
                now
            ],
        )
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                RuleError::DuplicateName(rule.name.clone())
            } else {
                RuleError::Sql(err)
            }
        })?;

        for (position, detail) in rule.details.iter().enumerate() {
            tx.execute(
                "INSERT INTO rule_details (id, rule_id, position, field_name, operation, value, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    id.as_str(),
                    position as i64,
                    detail.field_name.as_str(),
                    detail.operator.as_str(),
                    detail.value.as_str(),
                    detail.unit.map(|unit| unit.as_str())
                ],
            )
            .await?;
        }

        for (position, action) in rule.actions.iter().enumerate() {
            tx.execute(
                "INSERT INTO rule_actions (id, rule_id, position, action, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    id.as_str(),
                    position as i64,
                    action.action.as_str(),
                    action.value.clone()
                ],
            )
            .await?;
        }

        tx.commit().await?;
        self.get_by_id(&id).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let header = row_to_header(&row)?;
                load_rule(&conn, header).await
            }
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE name = ?1"),
                params![name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let header = row_to_header(&row)?;
                load_rule(&conn, header).await
            }
            None => Err(RuleError::NotFound(name.to_string())),
        }
    }

    pub async fn exists_by_name(&self, name: &str) -> Result<bool, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("SELECT 1 FROM rules WHERE name = ?1", params![name])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Rules ordered by name.
    pub async fn list(&self, page: Page) -> Result<Vec<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules ORDER BY name, id {}",
                    page.limit_clause()
                ),
                (),
            )
            .await?;

        let mut headers = Vec::new();
        while let Some(row) = rows.next().await? {
            headers.push(row_to_header(&row)?);
        }

        let mut rules = Vec::with_capacity(headers.len());
        for header in headers {
            rules.push(load_rule(&conn, header).await?);
        }
        Ok(rules)
    }

    pub async fn count(&self) -> Result<i64, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM rules", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Removes the rule's actions, then its details, then the rule, in one transaction.
    pub async fn delete(&self, id: &str) -> Result<(), RuleError> {
        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        tx.execute("DELETE FROM rule_actions WHERE rule_id = ?1", params![id])
            .await?;
        tx.execute("DELETE FROM rule_details WHERE rule_id = ?1", params![id])
            .await?;
        let affected = tx
            .execute("DELETE FROM rules WHERE id = ?1", params![id])
            .await?;
        if affected == 0 {
            return Err(RuleError::NotFound(id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }
}

/// A `rules` row read out before its details and actions are fetched.
struct RuleHeader {
    id: String,
    name: String,
    description: Option<String>,
    combinator: Combinator,
    created_at: String,
    updated_at: String,
}

fn row_to_header(row: &Row) -> Result<RuleHeader, RuleError> {
    let combinator: String = row.get(3)?;
    Ok(RuleHeader {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        combinator: Combinator::from_str(&combinator).ok_or(RuleError::InvalidStoredValue {
            column: "combinator",
            value: combinator.clone(),
        })?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

async fn load_rule(conn: &Connection, header: RuleHeader) -> Result<Rule, RuleError> {
    let details = load_details(conn, &header.id).await?;
    let actions = load_actions(conn, &header.id).await?;

    Ok(Rule {
        created_at: parse_timestamp(&header.created_at)?,
        updated_at: parse_timestamp(&header.updated_at)?,
        id: header.id,
        name: header.name,
        description: header.description,
        combinator: header.combinator,
        details,
        actions,
    })
}

async fn load_details(conn: &Connection, rule_id: &str) -> Result<Vec<RuleDetail>, RuleError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {DETAIL_COLUMNS} FROM rule_details WHERE rule_id = ?1 ORDER BY position"
            ),
            params![rule_id],
        )
        .await?;

    let mut details = Vec::new();
    while let Some(row) = rows.next().await? {
        let operation: String = row.get(3)?;
        let unit: Option<String> = row.get(5)?;
        details.push(RuleDetail {
            id: row.get(0)?,
            position: row.get(1)?,
            field_name: row.get(2)?,
            operator: Operator::from_str(&operation).ok_or_else(|| {
                RuleError::InvalidStoredValue {
                    column: "operation",
                    value: operation.clone(),
                }
            })?,
            value: row.get(4)?,
            unit: unit
                .map(|unit| {
                    FieldUnit::from_str(&unit).ok_or(RuleError::InvalidStoredValue {
                        column: "unit",
                        value: unit.clone(),
                    })
                })
                .transpose()?,
        });
    }
    Ok(details)
}

async fn load_actions(conn: &Connection, rule_id: &str) -> Result<Vec<RuleAction>, RuleError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {ACTION_COLUMNS} FROM rule_actions WHERE rule_id = ?1 ORDER BY position"
            ),
            params![rule_id],
        )
        .await?;

    let mut actions = Vec::new();
    while let Some(row) = rows.next().await? {
        let action: String = row.get(2)?;
        actions.push(RuleAction {
            id: row.get(0)?,
            position: row.get(1)?,
            action: ActionType::from_str(&action).ok_or_else(|| RuleError::InvalidStoredValue {
                column: "action",
                value: action.clone(),
            })?,
            value: row.get(3)?,
        });
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LabelRepository, NewLabel};
    use crate::migrations::run_migrations;
    use crate::rules::catalog::FieldCatalog;
    use crate::rules::compiler::PredicateCompiler;
    use crate::rules::types::{NewRule, NewRuleAction, NewRuleDetail};
    use crate::rules::validator::RuleValidator;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        db: Database,
        repo: RuleRepository,
        validator: RuleValidator,
        _dir: TempDir,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("store.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");

        let labels = LabelRepository::new(db.clone());
        labels
            .upsert(NewLabel::user("Label_1", "Finance"))
            .await
            .expect("label");

        let repo = RuleRepository::new(db.clone());
        let compiler = PredicateCompiler::new(Arc::new(FieldCatalog::standard().expect("catalog")));
        Fixture {
            validator: RuleValidator::new(compiler, labels, repo.clone()),
            repo,
            db,
            _dir: dir,
        }
    }

    fn new_rule(name: &str) -> NewRule {
        NewRule {
            name: name.into(),
            description: None,
            combinator: Combinator::All,
            details: vec![
                NewRuleDetail {
                    field_name: "from_address".into(),
                    operator: Operator::Contains,
                    value: "billing".into(),
                    unit: None,
                },
                NewRuleDetail {
                    field_name: "received_at".into(),
                    operator: Operator::LessThan,
                    value: "2".into(),
                    unit: Some(FieldUnit::Months),
                },
                NewRuleDetail {
                    field_name: "has_attachment".into(),
                    operator: Operator::Equals,
                    value: "true".into(),
                    unit: None,
                },
            ],
            actions: vec![
                NewRuleAction {
                    action: ActionType::Move,
                    value: Some("Finance".into()),
                },
                NewRuleAction {
                    action: ActionType::MarkRead,
                    value: None,
                },
            ],
        }
    }

    async fn count_rows(db: &Database, table: &str) -> i64 {
        let conn = db.connection().await.expect("conn");
        let mut rows = conn
            .query(&format!("SELECT COUNT(*) FROM {table}"), ())
            .await
            .expect("count");
        rows.next()
            .await
            .expect("row")
            .expect("row value")
            .get(0)
            .expect("count")
    }

    #[tokio::test]
    async fn create_preserves_order_and_fields() {
        let fx = setup().await;
        let input = new_rule("Billing");
        let validated = fx.validator.validate(input.clone()).await.expect("valid");

        let rule = fx.repo.create(validated).await.expect("create");
        assert_eq!(rule.name, "Billing");
        assert_eq!(rule.combinator, Combinator::All);

        let fields: Vec<_> = rule.details.iter().map(|d| d.field_name.as_str()).collect();
        assert_eq!(fields, vec!["from_address", "received_at", "has_attachment"]);
        assert_eq!(rule.details[1].unit, Some(FieldUnit::Months));
        assert_eq!(rule.details[1].position, 1);

        let actions: Vec<_> = rule.actions.iter().map(|a| a.action).collect();
        assert_eq!(actions, vec![ActionType::Move, ActionType::MarkRead]);
        assert_eq!(rule.actions[0].value.as_deref(), Some("Finance"));

        let by_name = fx.repo.get_by_name("Billing").await.expect("by name");
        assert_eq!(by_name, rule);
    }

    #[tokio::test]
    async fn concurrent_duplicate_is_reported_as_duplicate_name() {
        let fx = setup().await;
        let first = fx.validator.validate(new_rule("Billing")).await.expect("valid");
        let second = fx.validator.validate(new_rule("Billing")).await.expect("valid");

        fx.repo.create(first).await.expect("create");
        let err = fx.repo.create(second).await.expect_err("duplicate");
        assert!(matches!(err, RuleError::DuplicateName(name) if name == "Billing"));
        assert_eq!(count_rows(&fx.db, "rule_details").await, 3);
    }

    #[tokio::test]
    async fn delete_removes_owned_rows() {
        let fx = setup().await;
        let validated = fx.validator.validate(new_rule("Billing")).await.expect("valid");
        let rule = fx.repo.create(validated).await.expect("create");

        fx.repo.delete(&rule.id).await.expect("delete");

        assert!(matches!(
            fx.repo.get_by_id(&rule.id).await,
            Err(RuleError::NotFound(_))
        ));
        assert_eq!(count_rows(&fx.db, "rules").await, 0);
        assert_eq!(count_rows(&fx.db, "rule_details").await, 0);
        assert_eq!(count_rows(&fx.db, "rule_actions").await, 0);

        assert!(matches!(
            fx.repo.delete(&rule.id).await,
            Err(RuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_pages_by_name() {
        let fx = setup().await;
        for name in ["Zeta", "Alpha", "Mid"] {
            let validated = fx.validator.validate(new_rule(name)).await.expect("valid");
            fx.repo.create(validated).await.expect("create");
        }

        let all = fx.repo.list(Page::default()).await.expect("list");
        let names: Vec<_> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Mid", "Zeta"]);
        assert!(all.iter().all(|r| r.details.len() == 3 && r.actions.len() == 2));

        let page = fx.repo.list(Page::new(1, 1)).await.expect("page");
        assert_eq!(page[0].name, "Mid");
        assert_eq!(fx.repo.count().await.expect("count"), 3);
    }
}
