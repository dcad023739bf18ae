//! Message/label associations.
//!
//! A row in `message_labels` means the label is currently applied to the message.
//! The `(message_id, label_id)` unique index is the idempotency guard: the
//! explicit [`MessageLabelRepository::create`] rejects a duplicate pair, while
//! [`MessageLabelRepository::apply_change`] treats existing pairs as already done.

use std::collections::BTreeSet;

use libsql::{Connection, TransactionBehavior, Value, params};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339};

#[derive(Debug, Error)]
pub enum AssociationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("label {label_id} is already applied to message {message_id}")]
    Duplicate {
        message_id: String,
        label_id: String,
    },
    #[error("association not found: {message_id}/{label_id}")]
    NotFound {
        message_id: String,
        label_id: String,
    },
    #[error("message not found: {0}")]
    MessageNotFound(String),
}

/// Which current associations a change removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveSpec {
    /// Every label not in the change's `add` set.
    AllOthers,
    /// Only these label ids, when present.
    Labels(Vec<String>),
}

/// One atomic edit of a message's label set.
#[derive(Debug, Clone)]
pub struct LabelChange {
    pub message_id: String,
    pub remove: RemoveSpec,
    pub add: Vec<String>,
    /// Also clear the message's active flag.
    pub deactivate: bool,
}

/// Result of [`MessageLabelRepository::apply_change`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedChange {
    pub before: BTreeSet<String>,
    pub after: BTreeSet<String>,
    /// Label ids whose rows were created by this change.
    pub inserted: Vec<String>,
    /// Label ids whose rows were deleted by this change.
    pub removed: Vec<String>,
}

#[derive(Clone)]
pub struct MessageLabelRepository {
    db: Database,
}

impl MessageLabelRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, message_id: &str, label_id: &str) -> Result<(), AssociationError> {
        let conn = self.db.connection().await?;
        let inserted = insert_if_absent(&conn, message_id, label_id).await?;
        if !inserted {
            return Err(AssociationError::Duplicate {
                message_id: message_id.to_string(),
                label_id: label_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn delete(&self, message_id: &str, label_id: &str) -> Result<(), AssociationError> {
        let conn = self.db.connection().await?;
        let affected = conn
            .execute(
                "DELETE FROM message_labels WHERE message_id = ?1 AND label_id = ?2",
                params![message_id, label_id],
            )
            .await?;
        if affected == 0 {
            return Err(AssociationError::NotFound {
                message_id: message_id.to_string(),
                label_id: label_id.to_string(),
            });
        }
        Ok(())
    }

    /// Label ids currently applied to the message.
    pub async fn label_ids_for(&self, message_id: &str) -> Result<BTreeSet<String>, AssociationError> {
        let conn = self.db.connection().await?;
        current_label_ids(&conn, message_id).await
    }

    /// Message ids carrying the label, in id order.
    pub async fn message_ids_with(&self, label_id: &str) -> Result<Vec<String>, AssociationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT message_id FROM message_labels WHERE label_id = ?1 ORDER BY message_id",
                params![label_id],
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    /// Applies a label change in a single transaction: read the current set,
    /// delete the removed rows, insert the missing ones, optionally deactivate.
    pub async fn apply_change(&self, change: &LabelChange) -> Result<AppliedChange, AssociationError> {
        let conn = self.db.connection().await?;
        // Take the write lock up front so concurrent changes wait on busy_timeout
        // instead of failing on lock upgrade.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        let before = current_label_ids(&tx, &change.message_id).await?;
        let add: BTreeSet<&str> = change.add.iter().map(String::as_str).collect();

        let to_remove: Vec<String> = match &change.remove {
            RemoveSpec::AllOthers => before
                .iter()
                .filter(|id| !add.contains(id.as_str()))
                .cloned()
                .collect(),
            RemoveSpec::Labels(ids) => ids
                .iter()
                .filter(|id| before.contains(*id) && !add.contains(id.as_str()))
                .cloned()
                .collect(),
        };
        delete_labels(&tx, &change.message_id, &to_remove).await?;

        let mut inserted = Vec::new();
        for label_id in &add {
            if insert_if_absent(&tx, &change.message_id, label_id).await? {
                inserted.push(label_id.to_string());
            }
        }

        if change.deactivate {
            let affected = tx
                .execute(
                    "UPDATE messages SET is_active = 0, updated_at = ?2 WHERE message_id = ?1",
                    params![change.message_id.as_str(), now_rfc3339()],
                )
                .await?;
            if affected == 0 {
                return Err(AssociationError::MessageNotFound(change.message_id.clone()));
            }
        }

        let after = current_label_ids(&tx, &change.message_id).await?;
        tx.commit().await?;

        Ok(AppliedChange {
            before,
            after,
            inserted,
            removed: to_remove,
        })
    }
}

async fn current_label_ids(
    conn: &Connection,
    message_id: &str,
) -> Result<BTreeSet<String>, AssociationError> {
    let mut rows = conn
        .query(
            "SELECT label_id FROM message_labels WHERE message_id = ?1",
            params![message_id],
        )
        .await?;
    let mut ids = BTreeSet::new();
    while let Some(row) = rows.next().await? {
        ids.insert(row.get::<String>(0)?);
    }
    Ok(ids)
}

async fn delete_labels(
    conn: &Connection,
    message_id: &str,
    label_ids: &[String],
) -> Result<(), AssociationError> {
    if label_ids.is_empty() {
        return Ok(());
    }

    let placeholders: Vec<String> = (0..label_ids.len())
        .map(|i| format!("?{}", i + 2))
        .collect();
    let mut values: Vec<Value> = vec![Value::from(message_id.to_string())];
    values.extend(label_ids.iter().map(|id| Value::from(id.clone())));

    conn.execute(
        &format!(
            "DELETE FROM message_labels WHERE message_id = ?1 AND label_id IN ({})",
            placeholders.join(", ")
        ),
        values,
    )
    .await?;
    Ok(())
}

/// Returns whether a row was written; an existing pair is left untouched.
async fn insert_if_absent(
    conn: &Connection,
    message_id: &str,
    label_id: &str,
) -> Result<bool, AssociationError> {
    let affected = conn
        .execute(
            "INSERT INTO message_labels (id, message_id, label_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(message_id, label_id) DO NOTHING",
            params![Uuid::new_v4().to_string(), message_id, label_id, now_rfc3339()],
        )
        .await?;
    Ok(affected > 0)
}
