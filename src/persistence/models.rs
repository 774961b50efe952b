//! Row model for the `widget_states` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// The persisted state of one widget in one client session.
///
/// `(session_id, key)` is the primary key; repeated writes replace the
/// value and bump `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetStateRecord {
    /// Client session this state belongs to.
    pub session_id: String,
    /// Widget identifier within the session.
    pub key: String,
    /// Current widget value, as JSON.
    pub value: Value,
    /// Logical type of the value (e.g. `"text"`, `"number"`).
    pub type_tag: String,
    /// Whether the value passed client-side validation.
    pub is_valid: bool,
    /// Validation errors attached to the value.
    pub errors: Vec<String>,
    /// Validation warnings attached to the value.
    pub warnings: Vec<String>,
    /// When this row last changed.
    pub updated_at: DateTime<Utc>,
    /// Write counter, starts at 1 and grows with every stored write.
    pub version: i64,
}

impl WidgetStateRecord {
    /// A fresh, valid record at version 1.
    #[must_use]
    pub fn new(session_id: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            session_id: session_id.into(),
            key: key.into(),
            value,
            type_tag: "json".into(),
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            updated_at: Utc::now(),
            version: 1,
        }
    }

    /// Tags the record with a logical value type.
    #[must_use]
    pub fn with_type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = type_tag.into();
        self
    }

    /// Marks the record invalid with the given validation errors.
    #[must_use]
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.is_valid = errors.is_empty();
        self.errors = errors;
        self
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct WidgetStateRow {
    pub session_id: String,
    pub key: String,
    pub value: String,
    pub type_tag: String,
    pub is_valid: bool,
    pub errors: String,
    pub warnings: String,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl WidgetStateRow {
    pub(crate) fn into_record(self) -> Result<WidgetStateRecord, StoreError> {
        Ok(WidgetStateRecord {
            session_id: self.session_id,
            key: self.key,
            value: serde_json::from_str(&self.value)?,
            type_tag: self.type_tag,
            is_valid: self.is_valid,
            errors: serde_json::from_str(&self.errors)?,
            warnings: serde_json::from_str(&self.warnings)?,
            updated_at: self.updated_at,
            version: self.version,
        })
    }
}
