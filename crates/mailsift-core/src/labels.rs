use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_timestamp};

const LABEL_COLUMNS: &str = "id, label_id, name, label_type, is_active, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    System,
    User,
}

impl LabelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::System => "system",
            LabelType::User => "user",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "system" => Some(LabelType::System),
            "user" => Some(LabelType::User),
            _ => None,
        }
    }
}

/// A mail label mirrored from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    pub id: String,
    /// Provider label id, used for association rows and for sync calls.
    pub label_id: String,
    pub name: String,
    pub label_type: LabelType,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLabel {
    pub label_id: String,
    pub name: String,
    pub label_type: LabelType,
}

impl NewLabel {
    pub fn system(name: &str) -> Self {
        Self {
            label_id: name.to_string(),
            name: name.to_string(),
            label_type: LabelType::System,
        }
    }

    pub fn user(label_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            label_id: label_id.into(),
            name: name.into(),
            label_type: LabelType::User,
        }
    }
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("label not found: {0}")]
    NotFound(String),
    #[error("invalid label type in store: {0}")]
    InvalidType(String),
}

#[derive(Clone)]
pub struct LabelRepository {
    db: Database,
}

impl LabelRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh a label keyed by its provider id. Upserting reactivates.
    pub async fn upsert(&self, new_label: NewLabel) -> Result<Label, LabelError> {
        let NewLabel {
            label_id,
            name,
            label_type,
        } = new_label;
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO labels (id, label_id, name, label_type, is_active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                     ON CONFLICT(label_id) DO UPDATE SET
                        name = excluded.name,
                        label_type = excluded.label_type,
                        is_active = 1,
                        updated_at = excluded.updated_at
                     RETURNING {LABEL_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    label_id.as_str(),
                    name,
                    label_type.as_str(),
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_label(row),
            None => Err(LabelError::NotFound(label_id)),
        }
    }

    pub async fn get_by_label_id(&self, label_id: &str) -> Result<Label, LabelError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {LABEL_COLUMNS} FROM labels WHERE label_id = ?1"),
                params![label_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_label(row),
            None => Err(LabelError::NotFound(label_id.to_string())),
        }
    }

    /// Case-insensitive lookup among active labels.
    pub async fn get_by_name(&self, name: &str) -> Result<Label, LabelError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LABEL_COLUMNS} FROM labels
                     WHERE lower(name) = lower(?1) AND is_active = 1
                     ORDER BY name = ?1 DESC
                     LIMIT 1"
                ),
                params![name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_label(row),
            None => Err(LabelError::NotFound(name.to_string())),
        }
    }

    pub async fn list_active(&self) -> Result<Vec<Label>, LabelError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LABEL_COLUMNS} FROM labels WHERE is_active = 1 ORDER BY label_type, name"
                ),
                (),
            )
            .await?;

        let mut labels = Vec::new();
        while let Some(row) = rows.next().await? {
            labels.push(row_to_label(row)?);
        }
        Ok(labels)
    }

    pub async fn set_active(&self, label_id: &str, active: bool) -> Result<Label, LabelError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE labels SET is_active = ?2, updated_at = ?3
                     WHERE label_id = ?1
                     RETURNING {LABEL_COLUMNS}"
                ),
                params![label_id, i64::from(active), now_rfc3339()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_label(row),
            None => Err(LabelError::NotFound(label_id.to_string())),
        }
    }

    /// Removes a label and, through the foreign key cascade, its associations.
    pub async fn delete(&self, label_id: &str) -> Result<(), LabelError> {
        let conn = self.db.connection().await?;
        let affected = conn
            .execute("DELETE FROM labels WHERE label_id = ?1", params![label_id])
            .await?;
        if affected == 0 {
            return Err(LabelError::NotFound(label_id.to_string()));
        }
        Ok(())
    }
}

fn row_to_label(row: Row) -> Result<Label, LabelError> {
    let label_type: String = row.get(3)?;
    let is_active: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(Label {
        id: row.get(0)?,
        label_id: row.get(1)?,
        name: row.get(2)?,
        label_type: LabelType::from_str(&label_type)
            .ok_or_else(|| LabelError::InvalidType(label_type.clone()))?,
        is_active: is_active == 1,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LABEL_INBOX;
    use crate::migrations::run_migrations;
    use tempfile::TempDir;

    async fn setup_repo() -> (LabelRepository, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("store.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        (LabelRepository::new(db), dir)
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_by_label_id() {
        let (repo, _dir) = setup_repo().await;

        let first = repo
            .upsert(NewLabel::user("Label_1", "Finance"))
            .await
            .expect("insert");
        let second = repo
            .upsert(NewLabel::user("Label_1", "Finance & Billing"))
            .await
            .expect("update");

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Finance & Billing");
        assert_eq!(second.label_type, LabelType::User);
        assert!(second.is_active);
    }

    #[tokio::test]
    async fn get_by_name_is_case_insensitive_and_skips_inactive() {
        let (repo, _dir) = setup_repo().await;
        repo.upsert(NewLabel::user("Label_9", "Receipts"))
            .await
            .expect("insert");

        let found = repo.get_by_name("receipts").await.expect("found");
        assert_eq!(found.label_id, "Label_9");

        repo.set_active("Label_9", false).await.expect("deactivate");
        let err = repo.get_by_name("Receipts").await.expect_err("inactive");
        assert!(matches!(err, LabelError::NotFound(_)));
    }

    #[tokio::test]
    async fn system_labels_use_name_as_id() {
        let (repo, _dir) = setup_repo().await;
        let inbox = repo
            .upsert(NewLabel::system(LABEL_INBOX))
            .await
            .expect("insert");
        assert_eq!(inbox.label_id, LABEL_INBOX);
        assert_eq!(inbox.label_type, LabelType::System);

        let listed = repo.list_active().await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_label_is_not_found() {
        let (repo, _dir) = setup_repo().await;
        let err = repo.delete("nope").await.expect_err("missing");
        assert!(matches!(err, LabelError::NotFound(id) if id == "nope"));
    }
}
