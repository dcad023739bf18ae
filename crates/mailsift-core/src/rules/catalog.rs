//! Registry of the fields a rule may filter on.
//!
//! Each entry says what type a field has, which operators it accepts and where it
//! lives: a column on one of the message entities, or a virtual field answered
//! by an existence check.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::rules::types::{FieldType, Operator};

/// Tables a field can live on. `Message` is the root every query starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Message,
    MessageBody,
    MessageAttachment,
    MessageLabel,
}

impl Entity {
    pub fn table(&self) -> &'static str {
        match self {
            Entity::Message => "messages",
            Entity::MessageBody => "message_bodies",
            Entity::MessageAttachment => "message_attachments",
            Entity::MessageLabel => "message_label_view",
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Entity::Message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldStorage {
    Column {
        entity: Entity,
        column: &'static str,
        /// JSON array of strings rather than a scalar.
        multi_valued: bool,
    },
    /// No column; true when a row of `entity` exists for the message.
    Virtual { entity: Entity },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub field_type: FieldType,
    pub operators: &'static [Operator],
    pub storage: FieldStorage,
}

impl FieldDescriptor {
    pub fn allows(&self, operator: Operator) -> bool {
        self.operators.contains(&operator)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("field {0} is declared more than once")]
    DuplicateField(&'static str),
    #[error("field {0} declares no operators")]
    NoOperators(&'static str),
    #[error("field {field} declares operator {operator} which does not apply to its type")]
    InapplicableOperator {
        field: &'static str,
        operator: &'static str,
    },
    #[error("virtual field {0} must be boolean")]
    VirtualNotBoolean(&'static str),
}

const TEXT_OPS: &[Operator] = &[
    Operator::Equals,
    Operator::NotEquals,
    Operator::Contains,
    Operator::NotContains,
];
const NUMBER_OPS: &[Operator] = &[
    Operator::Equals,
    Operator::NotEquals,
    Operator::GreaterThan,
    Operator::LessThan,
    Operator::GreaterThanEquals,
    Operator::LessThanEquals,
];
const BOOLEAN_OPS: &[Operator] = &[Operator::Equals, Operator::NotEquals];
const MEMBERSHIP_OPS: &[Operator] = &[Operator::In, Operator::NotIn];
const SEARCH_OPS: &[Operator] = &[Operator::Contains, Operator::NotContains];

const fn column(
    name: &'static str,
    field_type: FieldType,
    operators: &'static [Operator],
    entity: Entity,
    column: &'static str,
    multi_valued: bool,
) -> FieldDescriptor {
    FieldDescriptor {
        name,
        field_type,
        operators,
        storage: FieldStorage::Column {
            entity,
            column,
            multi_valued,
        },
    }
}

/// The standard field table.
pub const STANDARD_FIELDS: &[FieldDescriptor] = &[
    column("from_address", FieldType::String, TEXT_OPS, Entity::Message, "from_address", false),
    column("to", FieldType::String, TEXT_OPS, Entity::Message, "to_json", true),
    column("cc", FieldType::String, TEXT_OPS, Entity::Message, "cc_json", true),
    column("bcc", FieldType::String, TEXT_OPS, Entity::Message, "bcc_json", true),
    column("subject", FieldType::String, TEXT_OPS, Entity::Message, "subject", false),
    column("received_at", FieldType::Number, NUMBER_OPS, Entity::Message, "received_at", false),
    column("is_active", FieldType::Boolean, BOOLEAN_OPS, Entity::Message, "is_active", false),
    column("file_name", FieldType::String, TEXT_OPS, Entity::MessageAttachment, "file_name", false),
    column("size", FieldType::Number, NUMBER_OPS, Entity::MessageAttachment, "size", false),
    FieldDescriptor {
        name: "has_attachment",
        field_type: FieldType::Boolean,
        operators: BOOLEAN_OPS,
        storage: FieldStorage::Virtual {
            entity: Entity::MessageAttachment,
        },
    },
    column("label", FieldType::String, MEMBERSHIP_OPS, Entity::MessageLabel, "name", false),
    column("text_body", FieldType::String, SEARCH_OPS, Entity::MessageBody, "text_body", false),
];

/// Read-only field lookup, built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct FieldCatalog {
    fields: Vec<FieldDescriptor>,
    index: HashMap<&'static str, usize>,
}

impl FieldCatalog {
    pub fn new(fields: &[FieldDescriptor]) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(fields.len());
        for (position, field) in fields.iter().enumerate() {
            if index.insert(field.name, position).is_some() {
                return Err(CatalogError::DuplicateField(field.name));
            }
            if field.operators.is_empty() {
                return Err(CatalogError::NoOperators(field.name));
            }
            let applicable = field.field_type.applicable_operators();
            if let Some(op) = field.operators.iter().find(|op| !applicable.contains(*op)) {
                return Err(CatalogError::InapplicableOperator {
                    field: field.name,
                    operator: op.as_str(),
                });
            }
            if matches!(field.storage, FieldStorage::Virtual { .. })
                && field.field_type != FieldType::Boolean
            {
                return Err(CatalogError::VirtualNotBoolean(field.name));
            }
        }

        Ok(Self {
            fields: fields.to_vec(),
            index,
        })
    }

    pub fn standard() -> Result<Self, CatalogError> {
        Self::new(STANDARD_FIELDS)
    }

    pub fn lookup(&self, name: &str) -> Result<&FieldDescriptor, CatalogError> {
        self.index
            .get(name)
            .map(|&position| &self.fields[position])
            .ok_or_else(|| CatalogError::UnknownField(name.to_string()))
    }

    /// Descriptors in declaration order.
    pub fn list(&self) -> &[FieldDescriptor] {
        &self.fields
    }
}
