//! Proposed-but-unapproved domain entities awaiting human review.

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::intent::HandlerBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    NewIntent,
    NewWorkType,
    NewCustomer,
    NewContact,
}

impl SuggestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionKind::NewIntent => "new_intent",
            SuggestionKind::NewWorkType => "new_work_type",
            SuggestionKind::NewCustomer => "new_customer",
            SuggestionKind::NewContact => "new_contact",
        }
    }
}

impl Display for SuggestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_intent" => Ok(SuggestionKind::NewIntent),
            "new_work_type" => Ok(SuggestionKind::NewWorkType),
            "new_customer" => Ok(SuggestionKind::NewCustomer),
            "new_contact" => Ok(SuggestionKind::NewContact),
            other => Err(ModelError::InvalidField {
                field: "suggestion_kind",
                reason: format!("unknown suggestion kind: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
    Merged,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Merged => "merged",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SuggestionStatus::Pending)
    }
}

impl FromStr for SuggestionStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "approved" => Ok(SuggestionStatus::Approved),
            "rejected" => Ok(SuggestionStatus::Rejected),
            "merged" => Ok(SuggestionStatus::Merged),
            other => Err(ModelError::InvalidField {
                field: "suggestion_status",
                reason: format!("unknown suggestion status: {other}"),
            }),
        }
    }
}

/// The suggested entity itself, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuggestionPayload {
    NewIntent {
        name: String,
        label: String,
        description: String,
        #[serde(default)]
        handler: HandlerBinding,
    },
    NewWorkType {
        code: String,
        label: String,
        description: String,
    },
    NewCustomer {
        name: String,
        email: Option<String>,
        country: Option<String>,
    },
    NewContact {
        email: String,
        name: Option<String>,
        customer_name: Option<String>,
    },
}

impl SuggestionPayload {
    pub fn kind(&self) -> SuggestionKind {
        match self {
            SuggestionPayload::NewIntent { .. } => SuggestionKind::NewIntent,
            SuggestionPayload::NewWorkType { .. } => {
                SuggestionKind::NewWorkType
            }
            SuggestionPayload::NewCustomer { .. } => {
                SuggestionKind::NewCustomer
            }
            SuggestionPayload::NewContact { .. } => SuggestionKind::NewContact,
        }
    }

    /// Dedupe key: at most one pending suggestion per (kind, natural key).
    pub fn natural_key(&self) -> String {
        match self {
            SuggestionPayload::NewIntent { name, .. } => name.clone(),
            SuggestionPayload::NewWorkType { code, .. } => code.clone(),
            SuggestionPayload::NewCustomer { name, .. } => {
                name.trim().to_lowercase()
            }
            SuggestionPayload::NewContact { email, .. } => {
                email.trim().to_lowercase()
            }
        }
    }
}

/// A proposed entity plus its review lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionRecord {
    pub id: Uuid,
    pub kind: SuggestionKind,
    pub natural_key: String,
    pub payload: SuggestionPayload,
    pub status: SuggestionStatus,
    /// The approval hold workflow, when one was started for this record.
    pub workflow_id: Option<String>,
    /// Event that produced the suggestion, when known.
    pub source_event_id: Option<Uuid>,
    pub reviewer_id: Option<String>,
    pub review_note: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Id of the entity materialized on approval. Non-null iff approved.
    pub created_entity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
