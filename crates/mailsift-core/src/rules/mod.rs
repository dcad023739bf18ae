pub mod catalog;
pub mod compiler;
pub mod executor;
pub mod predicate;
pub mod repositories;
pub mod types;
pub mod validator;

pub use catalog::{CatalogError, Entity, FieldCatalog, FieldDescriptor, FieldStorage};
pub use compiler::{CompileError, CompiledQuery, Condition, PredicateCompiler, relative_instant};
pub use executor::RuleQueryExecutor;
pub use repositories::{RuleError, RuleRepository};
pub use types::{
    ActionType, Combinator, FieldType, FieldUnit, NewRule, NewRuleAction, NewRuleDetail,
    Operator, Rule, RuleAction, RuleDetail,
};
pub use validator::{RuleValidator, ValidatedRule, ValidationError};
