use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::actions::{ActionExecutor, MessageActionReport};
use crate::config::EngineConfig;
use crate::db::{Database, Page};
use crate::label_sync::LabelSync;
use crate::labels::{Label, LabelError, LabelRepository};
use crate::messages::{Message, MessageError};
use crate::rules::catalog::{CatalogError, FieldCatalog, FieldDescriptor};
use crate::rules::compiler::{CompileError, PredicateCompiler};
use crate::rules::executor::RuleQueryExecutor;
use crate::rules::repositories::{RuleError, RuleRepository};
use crate::rules::types::{NewRule, Rule, RuleAction};
use crate::rules::validator::{RuleValidator, ValidatedRule, ValidationError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("rule query failed: {0}")]
    Query(#[from] MessageError),
    #[error("field catalog is invalid: {0}")]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Label(#[from] LabelError),
}

/// How a caller names the rule to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleRef {
    Id(String),
    Name(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleExecution {
    pub rule: Rule,
    pub matches: Vec<Message>,
    /// Present only when actions were requested.
    pub action_reports: Option<Vec<MessageActionReport>>,
}

/// Entry point for defining, querying and running rules.
#[derive(Clone)]
pub struct RuleEngine {
    compiler: PredicateCompiler,
    validator: RuleValidator,
    rules: RuleRepository,
    labels: LabelRepository,
    queries: RuleQueryExecutor,
    actions: ActionExecutor,
}

impl RuleEngine {
    pub fn new(
        db: Database,
        sync: Arc<dyn LabelSync>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let catalog = Arc::new(FieldCatalog::standard()?);
        let compiler = PredicateCompiler::new(catalog);
        let rules = RuleRepository::new(db.clone());
        let labels = LabelRepository::new(db.clone());
        let validator = RuleValidator::new(compiler.clone(), labels.clone(), rules.clone());

        Ok(Self {
            compiler,
            validator,
            rules,
            labels,
            queries: RuleQueryExecutor::new(db.clone()),
            actions: ActionExecutor::new(db, sync, config.action_concurrency),
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        self.compiler.catalog().list()
    }

    pub async fn labels(&self) -> Result<Vec<Label>, EngineError> {
        Ok(self.labels.list_active().await?)
    }

    pub async fn validate(&self, candidate: NewRule) -> Result<ValidatedRule, EngineError> {
        Ok(self.validator.validate(candidate).await?)
    }

    /// Validates and persists a rule. Nothing is written when validation fails.
    #[instrument(skip(self, candidate), fields(rule = %candidate.name))]
    pub async fn create_rule(&self, candidate: NewRule) -> Result<Rule, EngineError> {
        let validated = self.validator.validate(candidate).await?;
        let rule = self.rules.create(validated).await?;
        info!(rule_id = %rule.id, "rule created");
        Ok(rule)
    }

    pub async fn get_rule(&self, id: &str) -> Result<Rule, EngineError> {
        Ok(self.rules.get_by_id(id).await?)
    }

    pub async fn get_rule_by_name(&self, name: &str) -> Result<Rule, EngineError> {
        Ok(self.rules.get_by_name(name).await?)
    }

    /// One page of rules plus the total number stored.
    pub async fn list_rules(&self, page: Page) -> Result<(Vec<Rule>, i64), EngineError> {
        let rules = self.rules.list(page).await?;
        let total = self.rules.count().await?;
        Ok((rules, total))
    }

    #[instrument(skip(self))]
    pub async fn delete_rule(&self, id: &str) -> Result<(), EngineError> {
        self.rules.delete(id).await?;
        info!("rule deleted");
        Ok(())
    }

    /// Messages matching the rule's conditions, with relative times resolved
    /// against the current clock.
    #[instrument(skip(self, rule), fields(rule_id = %rule.id))]
    pub async fn compile_and_execute(&self, rule: &Rule, page: Page) -> Result<Vec<Message>, EngineError> {
        let query = self.compiler.compile(rule, Utc::now())?;
        Ok(self.queries.find(&query, page).await?)
    }

    pub async fn count_matches(&self, rule: &Rule) -> Result<u64, EngineError> {
        let query = self.compiler.compile(rule, Utc::now())?;
        Ok(self.queries.count(&query).await?)
    }

    pub async fn apply_actions(
        &self,
        actions: &[RuleAction],
        matches: &[Message],
    ) -> Vec<MessageActionReport> {
        self.actions.apply(actions, matches).await
    }

    /// Loads a stored rule, finds every match and, when asked, applies the
    /// rule's actions to them.
    #[instrument(skip(self))]
    pub async fn execute_rule(
        &self,
        rule_ref: RuleRef,
        execute_actions: bool,
    ) -> Result<RuleExecution, EngineError> {
        let rule = match &rule_ref {
            RuleRef::Id(id) => self.rules.get_by_id(id).await?,
            RuleRef::Name(name) => self.rules.get_by_name(name).await?,
        };

        let matches = self.compile_and_execute(&rule, Page::all()).await?;
        info!(rule_id = %rule.id, matches = matches.len(), "rule matched");

        let action_reports = if execute_actions {
            Some(self.actions.apply(&rule.actions, &matches).await)
        } else {
            None
        };

        Ok(RuleExecution {
            rule,
            matches,
            action_reports,
        })
    }
}
