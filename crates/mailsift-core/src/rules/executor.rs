use tracing::debug;

use crate::db::{Database, Page};
use crate::messages::{Message, MessageError, row_to_message};
use crate::rules::compiler::CompiledQuery;

/// Runs compiled rule queries against the message store.
#[derive(Clone)]
pub struct RuleQueryExecutor {
    db: Database,
}

impl RuleQueryExecutor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Distinct messages matching the query. Callers must not rely on the order
    /// beyond paging stability.
    pub async fn find(&self, query: &CompiledQuery, page: Page) -> Result<Vec<Message>, MessageError> {
        let (sql, params) = query.select_sql(page);
        debug!(%sql, params = params.len(), "running rule query");

        let conn = self.db.connection().await?;
        let mut rows = conn.query(&sql, params).await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub async fn count(&self, query: &CompiledQuery) -> Result<u64, MessageError> {
        let (sql, params) = query.count_sql();
        let conn = self.db.connection().await?;
        let mut rows = conn.query(&sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?.max(0) as u64),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LabelRepository, NewLabel};
    use crate::message_labels::MessageLabelRepository;
    use crate::messages::{MessageBody, MessageRepository, NewAttachment, NewMessage};
    use crate::migrations::run_migrations;
    use crate::rules::catalog::FieldCatalog;
    use crate::rules::compiler::{Condition, PredicateCompiler};
    use crate::rules::types::{Combinator, FieldUnit, Operator};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        executor: RuleQueryExecutor,
        compiler: PredicateCompiler,
        now: DateTime<Utc>,
        _dir: TempDir,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("store.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");

        let labels = LabelRepository::new(db.clone());
        labels.upsert(NewLabel::system("INBOX")).await.expect("label");
        labels
            .upsert(NewLabel::user("Label_1", "Newsletters"))
            .await
            .expect("label");

        let messages = MessageRepository::new(db.clone());
        let associations = MessageLabelRepository::new(db.clone());

        let mut invoice = NewMessage::new("m-invoice", now() - Duration::days(2));
        invoice.from_address = Some("billing@vendor.example".into());
        invoice.to = vec!["me@example.com".into()];
        invoice.subject = Some("Your Invoice".into());
        invoice.attachments = vec![NewAttachment {
            file_name: "invoice.pdf".into(),
            mime_type: Some("application/pdf".into()),
            size: 50_000,
            attachment_id: None,
        }];
        invoice.body = Some(MessageBody {
            text_body: Some("Amount due: 42".into()),
            html_body: None,
        });
        messages.upsert(invoice).await.expect("invoice");

        let mut photos = NewMessage::new("m-photos", now() - Duration::days(10));
        photos.from_address = Some("friend@example.org".into());
        photos.to = vec!["me@example.com".into(), "family@example.org".into()];
        photos.subject = Some("Holiday photos".into());
        photos.attachments = (1..=3)
            .map(|i| NewAttachment {
                file_name: format!("photo-{i}.jpg"),
                mime_type: Some("image/jpeg".into()),
                size: 2_000_000,
                attachment_id: None,
            })
            .collect();
        messages.upsert(photos).await.expect("photos");

        let mut digest = NewMessage::new("m-digest", now() - Duration::days(40));
        digest.from_address = Some("news@list.example".into());
        digest.to = vec!["exam".into(), "ple.com".into()];
        digest.subject = None;
        messages.upsert(digest).await.expect("digest");

        associations.create("m-digest", "Label_1").await.expect("assoc");
        associations.create("m-digest", "INBOX").await.expect("assoc");
        associations.create("m-invoice", "INBOX").await.expect("assoc");

        Fixture {
            executor: RuleQueryExecutor::new(db),
            compiler: PredicateCompiler::new(Arc::new(FieldCatalog::standard().expect("catalog"))),
            now: now(),
            _dir: dir,
        }
    }

    fn cond<'a>(field_name: &'a str, operator: Operator, value: &'a str) -> Condition<'a> {
        Condition {
            field_name,
            operator,
            value,
            unit: None,
        }
    }

    async fn matching(fx: &Fixture, combinator: Combinator, conditions: Vec<Condition<'_>>) -> Vec<String> {
        let query = fx
            .compiler
            .compile_conditions(combinator, conditions, fx.now)
            .expect("compiles");
        let mut ids: Vec<String> = fx
            .executor
            .find(&query, Page::all())
            .await
            .expect("query")
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn joined_rows_do_not_duplicate_results() {
        let fx = setup().await;
        let query = fx
            .compiler
            .compile_conditions(
                Combinator::All,
                [cond("file_name", Operator::Contains, "photo")],
                fx.now,
            )
            .expect("compiles");

        let found = fx.executor.find(&query, Page::all()).await.expect("query");
        assert_eq!(found.len(), 1, "three attachments, one message");
        assert_eq!(fx.executor.count(&query).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn all_is_intersection_and_any_is_union() {
        let fx = setup().await;
        let a = cond("to", Operator::Contains, "family");
        let b = cond("from_address", Operator::Contains, "BILLING");

        assert_eq!(matching(&fx, Combinator::Any, vec![a]).await, vec!["m-photos"]);
        assert_eq!(matching(&fx, Combinator::Any, vec![b]).await, vec!["m-invoice"]);
        assert_eq!(
            matching(&fx, Combinator::Any, vec![a, b]).await,
            vec!["m-invoice", "m-photos"]
        );
        assert!(matching(&fx, Combinator::All, vec![a, b]).await.is_empty());
    }

    #[tokio::test]
    async fn contains_on_recipients_does_not_glue_elements() {
        let fx = setup().await;
        let found = matching(
            &fx,
            Combinator::All,
            vec![cond("to", Operator::Contains, "example.com")],
        )
        .await;
        assert_eq!(found, vec!["m-invoice", "m-photos"]);
    }

    #[tokio::test]
    async fn relative_received_at_threshold() {
        let fx = setup().await;
        let recent = Condition {
            unit: Some(FieldUnit::Days),
            ..cond("received_at", Operator::GreaterThan, "7")
        };
        assert_eq!(
            matching(&fx, Combinator::All, vec![recent]).await,
            vec!["m-invoice"]
        );

        let older = Condition {
            unit: Some(FieldUnit::Months),
            ..cond("received_at", Operator::LessThan, "1")
        };
        assert_eq!(matching(&fx, Combinator::All, vec![older]).await, vec!["m-digest"]);
    }

    #[tokio::test]
    async fn virtual_and_label_fields() {
        let fx = setup().await;
        assert_eq!(
            matching(
                &fx,
                Combinator::All,
                vec![cond("has_attachment", Operator::Equals, "false")]
            )
            .await,
            vec!["m-digest"]
        );
        assert_eq!(
            matching(
                &fx,
                Combinator::All,
                vec![cond("label", Operator::In, "Newsletters, Promotions")]
            )
            .await,
            vec!["m-digest"]
        );
        // Exclusion is evaluated per association row.
        assert_eq!(
            matching(
                &fx,
                Combinator::All,
                vec![cond("label", Operator::NotIn, "INBOX")]
            )
            .await,
            vec!["m-digest"]
        );
    }

    #[tokio::test]
    async fn not_contains_treats_missing_values_as_empty() {
        let fx = setup().await;
        assert_eq!(
            matching(
                &fx,
                Combinator::All,
                vec![cond("subject", Operator::NotContains, "invoice")]
            )
            .await,
            vec!["m-digest", "m-photos"]
        );
        assert_eq!(
            matching(
                &fx,
                Combinator::All,
                vec![cond("text_body", Operator::Contains, "amount DUE")]
            )
            .await,
            vec!["m-invoice"]
        );
    }

    #[tokio::test]
    async fn not_equals_matches_missing_values() {
        let fx = setup().await;
        assert_eq!(
            matching(
                &fx,
                Combinator::All,
                vec![cond("subject", Operator::NotEquals, "Your Invoice")]
            )
            .await,
            vec!["m-digest", "m-photos"]
        );
        assert_eq!(
            matching(
                &fx,
                Combinator::All,
                vec![cond("subject", Operator::Equals, "Your Invoice")]
            )
            .await,
            vec!["m-invoice"]
        );
    }

    #[tokio::test]
    async fn paging_and_empty_results() {
        let fx = setup().await;
        let query = fx
            .compiler
            .compile_conditions(
                Combinator::All,
                [cond("is_active", Operator::Equals, "true")],
                fx.now,
            )
            .expect("compiles");

        let first = fx.executor.find(&query, Page::new(0, 2)).await.expect("page");
        let second = fx.executor.find(&query, Page::new(2, 2)).await.expect("page");
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(fx.executor.count(&query).await.expect("count"), 3);

        let none = fx
            .compiler
            .compile_conditions(
                Combinator::All,
                [cond("size", Operator::GreaterThan, "999999999")],
                fx.now,
            )
            .expect("compiles");
        assert!(fx.executor.find(&none, Page::all()).await.expect("query").is_empty());
    }
}
