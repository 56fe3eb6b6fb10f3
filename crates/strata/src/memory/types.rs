//! Memory record types
//!
//! A `MemoryRecord` is immutable once written except for its supersession
//! pointer, which is the only field an update or delete ever touches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};

/// Free-form metadata carried through the store unchanged.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Value persisted in the `superseded_by` column for deleted records.
pub const TOMBSTONE: &str = "tombstone";

/// Forward pointer set on a record that is no longer live.
///
/// A live record has no pointer at all (`Option::None` on the record), so
/// exactly one of live / replaced / deleted holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersededBy {
    /// Logically replaced by another record
    Record(Uuid),
    /// Logically deleted
    Tombstone,
}

impl SupersededBy {
    /// Column encoding: the tombstone sentinel or the replacement's id.
    pub fn to_column(&self) -> String {
        match self {
            SupersededBy::Record(id) => id.to_string(),
            SupersededBy::Tombstone => TOMBSTONE.to_string(),
        }
    }

    /// Decode a nullable `superseded_by` column value.
    pub fn from_column(value: Option<&str>) -> Result<Option<Self>> {
        match value {
            None | Some("") => Ok(None),
            Some(TOMBSTONE) => Ok(Some(SupersededBy::Tombstone)),
            Some(raw) => Uuid::parse_str(raw)
                .map(|id| Some(SupersededBy::Record(id)))
                .map_err(|e| {
                    StrataError::Storage(format!("Invalid superseded_by value '{raw}': {e}"))
                }),
        }
    }
}

/// A single stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier, never reused
    pub id: Uuid,
    /// The original text, stored verbatim
    pub content: String,
    /// Vector embedding produced once at creation
    pub embedding: Vec<f32>,
    /// Caller metadata, opaque to the store
    pub metadata: Metadata,
    /// When this record was written
    pub created_at: DateTime<Utc>,
    /// When `superseded_by` last changed (equal to `created_at` until then)
    pub updated_at: DateTime<Utc>,
    /// Forward pointer; `None` while the record is live
    pub superseded_by: Option<SupersededBy>,
}

impl MemoryRecord {
    /// Create a new live record with a fresh id
    pub fn new(content: String, embedding: Vec<f32>, metadata: Metadata) -> Self {
        Self::with_id(Uuid::new_v4(), content, embedding, metadata)
    }

    /// Create a new live record with an id assigned ahead of time
    pub fn with_id(id: Uuid, content: String, embedding: Vec<f32>, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id,
            content,
            embedding,
            metadata,
            created_at: now,
            updated_at: now,
            superseded_by: None,
        }
    }

    /// The head of its chain: nothing points forward from here.
    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// Replaced or deleted.
    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.superseded_by == Some(SupersededBy::Tombstone)
    }

    /// Apply a partial update in place. Fields absent from the update are
    /// left untouched.
    pub fn apply(&mut self, update: &RecordUpdate) {
        if let Some(pointer) = update.superseded_by {
            self.superseded_by = pointer;
        }
        if let Some(updated_at) = update.updated_at {
            self.updated_at = updated_at;
        }
    }
}

/// Partial field update for an existing record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    /// `Some(None)` clears the pointer, `Some(Some(_))` sets it
    pub superseded_by: Option<Option<SupersededBy>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecordUpdate {
    /// Point a record forward and refresh its `updated_at`.
    pub fn supersede_with(pointer: SupersededBy) -> Self {
        Self {
            superseded_by: Some(Some(pointer)),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.superseded_by.is_none() && self.updated_at.is_none()
    }
}
