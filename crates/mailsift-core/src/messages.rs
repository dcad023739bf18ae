use chrono::{DateTime, Utc};
use libsql::{Row, Transaction, params};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, Page, format_timestamp, now_rfc3339, parse_timestamp};

pub(crate) const MESSAGE_COLUMNS: &str = "id, message_id, thread_id, from_address, to_json, cc_json, bcc_json, subject, received_at, is_active, created_at, updated_at";

/// Same column list, qualified for queries that join other tables.
pub(crate) const QUALIFIED_MESSAGE_COLUMNS: &str = "messages.id, messages.message_id, messages.thread_id, messages.from_address, messages.to_json, messages.cc_json, messages.bcc_json, messages.subject, messages.received_at, messages.is_active, messages.created_at, messages.updated_at";

const ATTACHMENT_COLUMNS: &str = "id, message_id, file_name, mime_type, size, attachment_id";

/// Stored metadata for one mail message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    /// Provider message id; the key used by associations and sync calls.
    pub message_id: String,
    pub thread_id: Option<String>,
    pub from_address: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageBody {
    pub text_body: Option<String>,
    pub html_body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub size: i64,
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub size: i64,
    pub attachment_id: Option<String>,
}

/// Message as handed over by the ingestion side, with its owned body and attachments.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub from_address: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub body: Option<MessageBody>,
    pub attachments: Vec<NewAttachment>,
}

impl NewMessage {
    pub fn new(message_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            thread_id: None,
            from_address: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: None,
            received_at,
            body: None,
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("message not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh a message by provider id. The body and attachment set are
    /// replaced wholesale in the same transaction; the active flag is left alone.
    pub async fn upsert(&self, new_message: NewMessage) -> Result<Message, MessageError> {
        let NewMessage {
            message_id,
            thread_id,
            from_address,
            to,
            cc,
            bcc,
            subject,
            received_at,
            body,
            attachments,
        } = new_message;
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        let mut rows = tx
            .query(
                &format!(
                    "INSERT INTO messages (
                        id, message_id, thread_id, from_address, to_json, cc_json, bcc_json,
                        subject, received_at, is_active, created_at, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)
                    ON CONFLICT(message_id) DO UPDATE SET
                        thread_id = excluded.thread_id,
                        from_address = excluded.from_address,
                        to_json = excluded.to_json,
                        cc_json = excluded.cc_json,
                        bcc_json = excluded.bcc_json,
                        subject = excluded.subject,
                        received_at = excluded.received_at,
                        updated_at = excluded.updated_at
                    RETURNING {MESSAGE_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    message_id.as_str(),
                    thread_id,
                    from_address,
                    serde_json::to_string(&to)?,
                    serde_json::to_string(&cc)?,
                    serde_json::to_string(&bcc)?,
                    subject,
                    format_timestamp(received_at),
                    now
                ],
            )
            .await?;

        let message = match rows.next().await? {
            Some(row) => row_to_message(row)?,
            None => return Err(MessageError::NotFound(message_id)),
        };
        drop(rows);

        replace_owned_rows(&tx, &message.message_id, body, attachments).await?;
        tx.commit().await?;

        Ok(message)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Message, MessageError> {
        self.get_one("id", id).await
    }

    pub async fn get_by_message_id(&self, message_id: &str) -> Result<Message, MessageError> {
        self.get_one("message_id", message_id).await
    }

    async fn get_one(&self, column: &str, value: &str) -> Result<Message, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {column} = ?1"),
                params![value],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(value.to_string())),
        }
    }

    /// Newest first.
    pub async fn list(&self, page: Page) -> Result<Vec<Message>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     ORDER BY received_at DESC, message_id
                     {}",
                    page.limit_clause()
                ),
                (),
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub async fn set_active(
        &self,
        message_id: &str,
        active: bool,
    ) -> Result<Message, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE messages SET is_active = ?2, updated_at = ?3
                     WHERE message_id = ?1
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![message_id, i64::from(active), now_rfc3339()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(message_id.to_string())),
        }
    }

    pub async fn get_body(&self, message_id: &str) -> Result<Option<MessageBody>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT text_body, html_body FROM message_bodies WHERE message_id = ?1",
                params![message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(MessageBody {
                text_body: row.get(0)?,
                html_body: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM message_attachments
                     WHERE message_id = ?1
                     ORDER BY file_name, id"
                ),
                params![message_id],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(Attachment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                file_name: row.get(2)?,
                mime_type: row.get(3)?,
                size: row.get(4)?,
                attachment_id: row.get(5)?,
            });
        }
        Ok(attachments)
    }

    /// Deletes the message together with its body, attachments and associations.
    pub async fn delete(&self, message_id: &str) -> Result<(), MessageError> {
        let conn = self.db.connection().await?;
        let affected = conn
            .execute(
                "DELETE FROM messages WHERE message_id = ?1",
                params![message_id],
            )
            .await?;
        if affected == 0 {
            return Err(MessageError::NotFound(message_id.to_string()));
        }
        Ok(())
    }
}

async fn replace_owned_rows(
    tx: &Transaction,
    message_id: &str,
    body: Option<MessageBody>,
    attachments: Vec<NewAttachment>,
) -> Result<(), MessageError> {
    tx.execute(
        "DELETE FROM message_bodies WHERE message_id = ?1",
        params![message_id],
    )
    .await?;
    if let Some(body) = body {
        tx.execute(
            "INSERT INTO message_bodies (id, message_id, text_body, html_body) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                message_id,
                body.text_body,
                body.html_body
            ],
        )
        .await?;
    }

    tx.execute(
        "DELETE FROM message_attachments WHERE message_id = ?1",
        params![message_id],
    )
    .await?;
    for attachment in attachments {
        tx.execute(
            &format!(
                "INSERT INTO message_attachments ({ATTACHMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                Uuid::new_v4().to_string(),
                message_id,
                attachment.file_name,
                attachment.mime_type,
                attachment.size,
                attachment.attachment_id
            ],
        )
        .await?;
    }
    Ok(())
}

pub(crate) fn row_to_message(row: Row) -> Result<Message, MessageError> {
    let to_json: String = row.get(4)?;
    let cc_json: String = row.get(5)?;
    let bcc_json: String = row.get(6)?;
    let received_at: String = row.get(8)?;
    let is_active: i64 = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(Message {
        id: row.get(0)?,
        message_id: row.get(1)?,
        thread_id: row.get(2)?,
        from_address: row.get(3)?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        bcc: serde_json::from_str(&bcc_json)?,
        subject: row.get(7)?,
        received_at: parse_timestamp(&received_at)?,
        is_active: is_active == 1,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
