//! Applies a rule's actions to its matched messages.
//!
//! Each action is a local label change committed in one transaction, followed by
//! one call to the external [`LabelSync`]. A sync failure does not undo the local
//! change; it is reported for that message and processing moves on.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::constants::{LABEL_INBOX, LABEL_READ, LABEL_TRASH, LABEL_UNREAD};
use crate::db::Database;
use crate::label_sync::LabelSync;
use crate::labels::{LabelError, LabelRepository, NewLabel};
use crate::message_labels::{AppliedChange, LabelChange, MessageLabelRepository, RemoveSpec};
use crate::messages::Message;
use crate::rules::types::{ActionType, RuleAction};

/// Why one action failed for one message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ActionFailure {
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("external sync failed: {0}")]
    ExternalSync(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub position: i64,
    pub action: ActionType,
    /// Label ids whose associations this action deleted.
    pub removed: Vec<String>,
    /// Label ids whose associations this action created.
    pub added: Vec<String>,
    pub local_applied: bool,
    pub synced: bool,
    pub error: Option<ActionFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageActionReport {
    pub message_id: String,
    pub outcomes: Vec<ActionOutcome>,
}

impl MessageActionReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.error.is_none())
    }
}

/// How the sync call's label sets are derived from the local change.
#[derive(Debug, Clone)]
enum SyncSets {
    /// The full label sets before and after the change.
    BeforeAfter,
    Fixed { from: Vec<String>, to: Vec<String> },
}

#[derive(Debug, Clone)]
enum Plan {
    Change {
        remove: RemoveSpec,
        add: Vec<String>,
        deactivate: bool,
        sync: SyncSets,
    },
    Unresolved(ActionFailure),
}

#[derive(Debug, Clone)]
struct PlannedAction {
    position: i64,
    action: ActionType,
    plan: Plan,
}

#[derive(Clone)]
pub struct ActionExecutor {
    labels: LabelRepository,
    associations: MessageLabelRepository,
    sync: Arc<dyn LabelSync>,
    concurrency: usize,
}

impl ActionExecutor {
    pub fn new(db: Database, sync: Arc<dyn LabelSync>, concurrency: usize) -> Self {
        Self {
            labels: LabelRepository::new(db.clone()),
            associations: MessageLabelRepository::new(db),
            sync,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs `actions` in order against every message and returns one report per
    /// message, in the order the messages were given.
    pub async fn apply(&self, actions: &[RuleAction], messages: &[Message]) -> Vec<MessageActionReport> {
        if actions.is_empty() || messages.is_empty() {
            return messages
                .iter()
                .map(|message| MessageActionReport {
                    message_id: message.message_id.clone(),
                    outcomes: Vec::new(),
                })
                .collect();
        }

        let mut ordered: Vec<&RuleAction> = actions.iter().collect();
        ordered.sort_by_key(|action| action.position);

        let mut plans = Vec::with_capacity(ordered.len());
        for action in ordered {
            plans.push(self.plan(action).await);
        }
        let plans = plans.as_slice();

        let pending: Vec<_> = messages
            .iter()
            .enumerate()
            .map(|(index, message)| async move { (index, self.run_message(plans, message).await) })
            .collect();
        let mut reports: Vec<(usize, MessageActionReport)> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        reports.sort_by_key(|(index, _)| *index);

        let failed = reports
            .iter()
            .filter(|(_, report)| !report.is_success())
            .count();
        info!(
            messages = reports.len(),
            actions = plans.len(),
            failed,
            "applied rule actions"
        );

        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Resolves an action's labels once for the whole batch. Labels are looked
    /// up again here because they may have changed since the rule was created.
    async fn plan(&self, action: &RuleAction) -> PlannedAction {
        let plan = match action.action {
            ActionType::Move => match self.resolve_names(&action.label_names()).await {
                Ok(targets) => Plan::Change {
                    remove: RemoveSpec::AllOthers,
                    add: targets,
                    deactivate: false,
                    sync: SyncSets::BeforeAfter,
                },
                Err(failure) => Plan::Unresolved(failure),
            },
            ActionType::MarkRead => self.read_state_plan(LABEL_UNREAD, LABEL_READ).await,
            ActionType::MarkUnread => self.read_state_plan(LABEL_READ, LABEL_UNREAD).await,
            ActionType::Delete => match self.resolve_ids(&[LABEL_INBOX, LABEL_TRASH]).await {
                Ok(_) => Plan::Change {
                    remove: RemoveSpec::Labels(vec![LABEL_INBOX.to_string()]),
                    add: vec![LABEL_TRASH.to_string()],
                    deactivate: true,
                    sync: SyncSets::Fixed {
                        from: vec![LABEL_INBOX.to_string()],
                        to: vec![LABEL_TRASH.to_string()],
                    },
                },
                Err(failure) => Plan::Unresolved(failure),
            },
        };

        if let Plan::Unresolved(failure) = &plan {
            warn!(
                position = action.position,
                action = action.action.as_str(),
                error = %failure,
                "action cannot run for any matched message"
            );
        }

        PlannedAction {
            position: action.position,
            action: action.action,
            plan,
        }
    }

    /// Only the label being added has to exist. Removing a label the store has
    /// never seen deletes nothing.
    async fn read_state_plan(&self, from: &str, to: &str) -> Plan {
        let resolved = if to == LABEL_READ {
            self.ensure_read_label().await
        } else {
            self.resolve_ids(&[to]).await
        };
        match resolved {
            Ok(_) => Plan::Change {
                remove: RemoveSpec::Labels(vec![from.to_string()]),
                add: vec![to.to_string()],
                deactivate: false,
                sync: SyncSets::Fixed {
                    from: vec![from.to_string()],
                    to: vec![to.to_string()],
                },
            },
            Err(failure) => Plan::Unresolved(failure),
        }
    }

    async fn resolve_names(&self, names: &[String]) -> Result<Vec<String>, ActionFailure> {
        if names.is_empty() {
            return Err(ActionFailure::UnknownLabel(String::new()));
        }
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let label = self
                .labels
                .get_by_name(name)
                .await
                .map_err(|err| label_failure(name, err))?;
            if !ids.contains(&label.label_id) {
                ids.push(label.label_id);
            }
        }
        Ok(ids)
    }

    /// READ never comes from the provider, so the store gains it on first use.
    async fn ensure_read_label(&self) -> Result<(), ActionFailure> {
        match self.labels.get_by_label_id(LABEL_READ).await {
            Ok(label) if label.is_active => Ok(()),
            Ok(_) | Err(LabelError::NotFound(_)) => {
                self.labels
                    .upsert(NewLabel::system(LABEL_READ))
                    .await
                    .map_err(|err| label_failure(LABEL_READ, err))?;
                info!(label_id = LABEL_READ, "created local read-state label");
                Ok(())
            }
            Err(err) => Err(label_failure(LABEL_READ, err)),
        }
    }

    async fn resolve_ids(&self, label_ids: &[&str]) -> Result<(), ActionFailure> {
        for label_id in label_ids {
            match self.labels.get_by_label_id(label_id).await {
                Ok(label) if label.is_active => {}
                Ok(_) => return Err(ActionFailure::UnknownLabel(label_id.to_string())),
                Err(err) => return Err(label_failure(label_id, err)),
            }
        }
        Ok(())
    }

    async fn run_message(&self, plans: &[PlannedAction], message: &Message) -> MessageActionReport {
        let mut outcomes = Vec::with_capacity(plans.len());
        for planned in plans {
            outcomes.push(self.run_action(planned, &message.message_id).await);
        }
        MessageActionReport {
            message_id: message.message_id.clone(),
            outcomes,
        }
    }

    async fn run_action(&self, planned: &PlannedAction, message_id: &str) -> ActionOutcome {
        let mut outcome = ActionOutcome {
            position: planned.position,
            action: planned.action,
            removed: Vec::new(),
            added: Vec::new(),
            local_applied: false,
            synced: false,
            error: None,
        };

        let (remove, add, deactivate, sync) = match &planned.plan {
            Plan::Unresolved(failure) => {
                outcome.error = Some(failure.clone());
                return outcome;
            }
            Plan::Change {
                remove,
                add,
                deactivate,
                sync,
            } => (remove, add, *deactivate, sync),
        };

        let change = LabelChange {
            message_id: message_id.to_string(),
            remove: remove.clone(),
            add: add.clone(),
            deactivate,
        };
        let applied = match self.associations.apply_change(&change).await {
            Ok(applied) => applied,
            Err(err) => {
                warn!(
                    message_id,
                    action = planned.action.as_str(),
                    error = %err,
                    "local label change failed"
                );
                outcome.error = Some(ActionFailure::Store(err.to_string()));
                return outcome;
            }
        };
        outcome.local_applied = true;

        let (from, to) = sync_sets(sync, &applied);
        outcome.removed = applied.removed;
        outcome.added = applied.inserted;

        match self.sync.move_labels(message_id, &from, &to).await {
            Ok(()) => outcome.synced = true,
            Err(err) => {
                warn!(
                    message_id,
                    action = planned.action.as_str(),
                    error = %err,
                    "label sync failed; local change kept"
                );
                outcome.error = Some(ActionFailure::ExternalSync(err.to_string()));
            }
        }
        outcome
    }
}

fn sync_sets(sync: &SyncSets, applied: &AppliedChange) -> (Vec<String>, Vec<String>) {
    match sync {
        SyncSets::BeforeAfter => (
            applied.before.iter().cloned().collect(),
            applied.after.iter().cloned().collect(),
        ),
        SyncSets::Fixed { from, to } => (from.clone(), to.clone()),
    }
}

fn label_failure(label: &str, err: LabelError) -> ActionFailure {
    match err {
        LabelError::NotFound(_) => ActionFailure::UnknownLabel(label.to_string()),
        other => ActionFailure::Store(other.to_string()),
    }
}
