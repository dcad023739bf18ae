use thiserror::Error;
use tracing::debug;

use crate::labels::{LabelError, LabelRepository};
use crate::rules::compiler::{CompileError, Condition, PredicateCompiler};
use crate::rules::repositories::{RuleError, RuleRepository};
use crate::rules::types::{ActionType, NewRule, NewRuleAction, split_list};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("rule must have at least one condition")]
    NoDetails,
    #[error("rule must have at least one action")]
    NoActions,
    #[error("a rule named {0:?} already exists")]
    DuplicateRuleName(String),
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
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    #[error("invalid value for action {action}: {reason}")]
    InvalidActionValue { action: String, reason: String },
    #[error("label lookup failed: {0}")]
    Label(LabelError),
    #[error("rule lookup failed: {0}")]
    Rule(#[from] RuleError),
}

impl From<CompileError> for ValidationError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::UnknownField(field) => ValidationError::UnknownField(field),
            CompileError::InvalidOperationForField { field, operator } => {
                ValidationError::InvalidOperationForField { field, operator }
            }
            CompileError::InvalidValueType {
                field,
                value,
                reason,
            } => ValidationError::InvalidValueType {
                field,
                value,
                reason,
            },
            CompileError::InvalidUnit { field, reason } => {
                ValidationError::InvalidUnit { field, reason }
            }
        }
    }
}

/// A rule that passed validation. Only [`RuleValidator`] can produce one, and
/// only a `ValidatedRule` can be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRule(NewRule);

impl ValidatedRule {
    pub fn rule(&self) -> &NewRule {
        &self.0
    }

    pub(crate) fn into_inner(self) -> NewRule {
        self.0
    }
}

#[derive(Clone)]
pub struct RuleValidator {
    compiler: PredicateCompiler,
    labels: LabelRepository,
    rules: RuleRepository,
}

impl RuleValidator {
    pub fn new(compiler: PredicateCompiler, labels: LabelRepository, rules: RuleRepository) -> Self {
        Self {
            compiler,
            labels,
            rules,
        }
    }

    /// Checks a candidate rule and returns it in persistable form. The name is
    /// trimmed; nothing else is rewritten.
    pub async fn validate(&self, candidate: NewRule) -> Result<ValidatedRule, ValidationError> {
        let mut candidate = candidate;
        candidate.name = candidate.name.trim().to_string();
        if candidate.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }

        if self.rules.exists_by_name(&candidate.name).await? {
            return Err(ValidationError::DuplicateRuleName(candidate.name));
        }

        if candidate.details.is_empty() {
            return Err(ValidationError::NoDetails);
        }
        if candidate.actions.is_empty() {
            return Err(ValidationError::NoActions);
        }

        for detail in &candidate.details {
            self.compiler.check(Condition::from(detail))?;
        }
        for action in &candidate.actions {
            self.check_action(action).await?;
        }

        debug!(
            rule = %candidate.name,
            details = candidate.details.len(),
            actions = candidate.actions.len(),
            "rule validated"
        );
        Ok(ValidatedRule(candidate))
    }

    async fn check_action(&self, action: &NewRuleAction) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidActionValue {
            action: action.action.as_str().to_string(),
            reason: reason.to_string(),
        };

        match action.action {
            ActionType::Move => {
                let names = split_list(action.value.as_deref().unwrap_or_default());
                if names.is_empty() {
                    return Err(invalid("at least one target label is required"));
                }
                for name in names {
                    match self.labels.get_by_name(&name).await {
                        Ok(_) => {}
                        Err(LabelError::NotFound(_)) => {
                            return Err(ValidationError::UnknownLabel(name));
                        }
                        Err(err) => return Err(ValidationError::Label(err)),
                    }
                }
                Ok(())
            }
            ActionType::MarkRead | ActionType::MarkUnread | ActionType::Delete => {
                match action.value.as_deref().map(str::trim) {
                    None | Some("") => Ok(()),
                    Some(_) => Err(invalid("this action takes no value")),
                }
            }
        }
    }
}
