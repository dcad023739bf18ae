pub mod actions;
pub mod config;
pub mod constants;
pub mod db;
pub mod engine;
pub mod gmail;
pub mod label_sync;
pub mod labels;
pub mod message_labels;
pub mod messages;
pub mod migrations;
pub mod rules;
pub mod telemetry;

pub use actions::{ActionExecutor, ActionFailure, ActionOutcome, MessageActionReport};
pub use config::{Config, EngineConfig, GmailConfig};
pub use db::{Database, DbError, Page};
pub use engine::{EngineError, RuleEngine, RuleExecution, RuleRef};
pub use gmail::GmailClient;
pub use label_sync::{LabelSync, LabelSyncError, NoopLabelSync};
pub use labels::{Label, LabelError, LabelRepository, LabelType, NewLabel};
pub use message_labels::{AssociationError, MessageLabelRepository};
pub use messages::{Message, MessageError, MessageRepository, NewMessage};
pub use migrations::{MigrationError, run_migrations};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
