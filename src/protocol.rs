use serde::{Deserialize, Serialize};

use crate::behavior::{ActionData, BehaviorReport};
use crate::guard::SecurityStatus;
use crate::query::{LoadOutcome, QueryOptions};
use crate::store::{Document, QueryFilter};
use crate::validator::{FeedbackInput, ValidationResult};

pub const PROTOCOL_VERSION: u8 = 1;

// Client message payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentPayload {
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingPayload {
    pub rating: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPayload {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ActionData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenQueryPayload {
    pub handle: String,
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<QueryOptions>,
}

fn default_use_cache() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadDataPayload {
    pub handle: String,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlePayload {
    pub handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidatePayload {
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

// Client message enum for deserialization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ValidateComment {
        v: u8,
        id: String,
        payload: CommentPayload,
    },
    ValidateRating {
        v: u8,
        id: String,
        payload: RatingPayload,
    },
    SubmitFeedback {
        v: u8,
        id: String,
        payload: FeedbackInput,
    },
    RecordAction {
        v: u8,
        id: String,
        payload: ActionPayload,
    },
    Status {
        v: u8,
        id: String,
        #[serde(default)]
        payload: EmptyPayload,
    },
    Reset {
        v: u8,
        id: String,
        #[serde(default)]
        payload: EmptyPayload,
    },
    OpenQuery {
        v: u8,
        id: String,
        payload: OpenQueryPayload,
    },
    LoadData {
        v: u8,
        id: String,
        payload: LoadDataPayload,
    },
    LoadMore {
        v: u8,
        id: String,
        payload: HandlePayload,
    },
    Refresh {
        v: u8,
        id: String,
        payload: HandlePayload,
    },
    InvalidateCache {
        v: u8,
        id: String,
        payload: InvalidatePayload,
    },
    ClearCache {
        v: u8,
        id: String,
        payload: HandlePayload,
    },
    Ping {
        v: u8,
        id: String,
        #[serde(default)]
        payload: EmptyPayload,
    },
}

// Server message payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultPayload {
    pub status: SubmitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Set when the session's behavior score crossed the suspicious threshold.
    #[serde(default)]
    pub requires_verification: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Cached,
    Fetched,
    Skipped,
    Failed,
}

impl From<LoadOutcome> for QueryOutcome {
    fn from(outcome: LoadOutcome) -> Self {
        match outcome {
            LoadOutcome::Cached => QueryOutcome::Cached,
            LoadOutcome::Fetched(_) => QueryOutcome::Fetched,
            LoadOutcome::Skipped => QueryOutcome::Skipped,
            LoadOutcome::Failed => QueryOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultPayload {
    pub handle: String,
    pub outcome: QueryOutcome,
    pub documents: Vec<Document>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

// Server message enum
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Validation {
        v: u8,
        id: String,
        payload: ValidationResult,
    },
    SubmitResult {
        v: u8,
        id: String,
        payload: SubmitResultPayload,
    },
    Behavior {
        v: u8,
        id: String,
        payload: BehaviorReport,
    },
    Status {
        v: u8,
        id: String,
        payload: SecurityStatus,
    },
    QueryResult {
        v: u8,
        id: String,
        payload: QueryResultPayload,
    },
    Ack {
        v: u8,
        id: String,
        payload: EmptyPayload,
    },
    Error {
        v: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: ErrorPayload,
    },
    Pong {
        v: u8,
        id: String,
        payload: EmptyPayload,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitStatus {
    Accepted,
    Rejected,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadFormat,
    RateLimit,
    UnknownQuery,
    TooManyQueries,
}

impl ServerMessage {
    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            v: PROTOCOL_VERSION,
            id,
            payload: ErrorPayload {
                code,
                message: message.into(),
            },
        }
    }

    pub fn ack(id: String) -> Self {
        Self::Ack {
            v: PROTOCOL_VERSION,
            id,
            payload: EmptyPayload {},
        }
    }
}
