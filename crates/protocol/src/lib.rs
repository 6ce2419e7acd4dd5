//! DealGrid Session Protocol — v1 Frozen Wire Format
//!
//! This crate defines the canonical protocol types for client ↔ server
//! communication. The wire format is JSONL (newline-delimited JSON) over TCP.
//!
//! # Protocol Version
//!
//! This is **protocol v1** — the wire format is frozen. Changes require:
//! 1. Version bump in PROTOCOL_VERSION
//! 2. Backward compatibility handling in the gateway
//!
//! # Usage
//!
//! ```ignore
//! use dealgrid_protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
//!
//! let msg = ClientMessage::Ping(PingMessage { id: "1".into() });
//! let json = serde_json::to_string(&msg)?;
//!
//! let response: ServerMessage = serde_json::from_str(&line)?;
//! ```

use serde::{Deserialize, Serialize};

/// Current protocol version. Increment for breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (1 MB). Oversized messages disconnect the client.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A row payload on the wire: column name → JSON value.
pub type RowData = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Client → Server Messages
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello(HelloMessage),
    Join(JoinMessage),
    Leave(LeaveMessage),
    MutateRow(MutateRowMessage),
    FetchRows(FetchRowsMessage),
    Ping(PingMessage),
    Stats(StatsMessage),
}

/// Initial handshake from client. Must be the first message on a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    pub id: String,
    /// Client identifier (e.g., "dealgrid-cli", "my-agent").
    pub client: String,
    /// Client version.
    pub version: String,
    /// Authentication token resolved to a verified actor id.
    pub token: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    1
}

/// Request to join a spreadsheet and receive its commit broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMessage {
    pub id: String,
    pub spreadsheet_id: String,
}

/// Request to leave a spreadsheet (stop receiving its broadcasts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveMessage {
    pub id: String,
    pub spreadsheet_id: String,
}

/// Request to mutate one row under optimistic concurrency.
///
/// `expected_version == 0` means the row must not yet exist (creation).
/// `row_data: null` deletes the row; otherwise `row_data` is a delta merged
/// onto the current row (a `null` value clears that field).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateRowMessage {
    pub id: String,
    pub spreadsheet_id: String,
    pub row_id: String,
    pub expected_version: u64,
    pub row_data: Option<RowData>,
}

/// Request the current full state of a spreadsheet (the ordinary read path).
///
/// There is no event replay: a reconnecting client issues this to catch up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRowsMessage {
    pub id: String,
    pub spreadsheet_id: String,
}

/// Ping for keepalive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingMessage {
    pub id: String,
}

/// Request server operational counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsMessage {
    pub id: String,
}

// =============================================================================
// Server → Client Messages
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome(WelcomeMessage),
    Joined(JoinedMessage),
    Left(LeftMessage),
    /// Broadcast to every joined session, in commit order. This is also the
    /// originator's success signal.
    RowCommitted(RowCommittedMessage),
    /// Sent to the originator only.
    RowRejected(RowRejectedMessage),
    Rows(RowsMessage),
    Pong(PongMessage),
    StatsResult(StatsResultMessage),
    Error(ErrorMessage),
}

/// Response to Hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub id: String,
    pub session_id: String,
    /// The verified actor id this session is bound to.
    pub actor: String,
    /// Protocol version in use (min of client and server).
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

/// Response to Join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedMessage {
    pub id: String,
    pub spreadsheet_id: String,
    /// Column definitions at join time.
    pub columns: Vec<ColumnSpec>,
}

/// Response to Leave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeftMessage {
    pub id: String,
    pub spreadsheet_id: String,
}

/// What a committed mutation did to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitAction {
    Insert,
    Update,
    Delete,
}

/// A committed row mutation, broadcast to all joined sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowCommittedMessage {
    pub spreadsheet_id: String,
    pub row_id: String,
    /// Row version after the commit.
    pub version: u64,
    /// Committed row state. Empty for `delete`.
    pub row_data: RowData,
    pub action: CommitAction,
    /// Actor (user id) who made the mutation.
    pub actor: String,
    /// Commit timestamp, RFC 3339.
    pub timestamp: String,
}

/// Why a mutation was rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// One or more fields failed schema validation. Nothing was persisted.
    ValidationError { errors: Vec<FieldError> },
    /// `expected_version` is stale. Refetch and retry.
    ConflictError,
    /// Actor lacks the required permission level.
    PermissionError,
    /// Transient storage failure during commit. Retryable by the client.
    PersistenceError,
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Rejection of a mutation, sent to the originator only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowRejectedMessage {
    pub id: String,
    pub spreadsheet_id: String,
    pub row_id: String,
    #[serde(flatten)]
    pub reason: RejectReason,
    /// Current stored version, present on conflict so the client can retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    /// Current stored row state, present on conflict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_row_data: Option<RowData>,
}

/// Response to FetchRows: the full current state of a spreadsheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsMessage {
    pub id: String,
    pub spreadsheet_id: String,
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<RowInfo>,
}

/// A row as returned by the read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowInfo {
    pub row_id: String,
    pub position: u32,
    pub version: u64,
    pub row_data: RowData,
    pub updated_by: String,
    pub updated_at: String,
}

/// Response to Ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongMessage {
    pub id: String,
}

/// Response to Stats: operational counters for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResultMessage {
    pub id: String,
    pub active_connections: u64,
    pub committed_mutations: u64,
    pub conflict_rejections: u64,
    pub validation_rejections: u64,
    pub permission_denials: u64,
    pub overflow_disconnects: u64,
    pub connections_closed_parse_failures: u64,
    pub connections_closed_oversize: u64,
    pub connections_refused_limit: u64,
}

// =============================================================================
// Column Specs (wire form of column definitions)
// =============================================================================

/// Column type on the wire, one variant per validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    Text {
        #[serde(skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Currency {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Date,
    Boolean,
    Select { options: Vec<String> },
}

/// A column definition as sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: ColumnKind,
    pub position: u32,
    pub required: bool,
}

// =============================================================================
// Error
// =============================================================================

/// Protocol-level error response (not a mutation rejection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Request ID (if available).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: String,
    pub message: String,
    /// Hint for rate-limited clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid or missing token.
    AuthFailed,
    /// Unsupported protocol version.
    ProtocolMismatch,
    /// Rate limit exceeded.
    RateLimited,
    /// Message too large.
    MessageTooLarge,
    /// Malformed JSON.
    MalformedMessage,
    /// Hello sent twice.
    AlreadyAuthenticated,
    /// Spreadsheet or row id is not a valid UUID.
    InvalidId,
    /// Actor may not access this spreadsheet (or it does not exist — the two
    /// are indistinguishable on the wire, by design of the gate).
    PermissionDenied,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::AuthFailed => "auth_failed",
            ProtocolError::ProtocolMismatch => "protocol_mismatch",
            ProtocolError::RateLimited => "rate_limited",
            ProtocolError::MessageTooLarge => "message_too_large",
            ProtocolError::MalformedMessage => "malformed_message",
            ProtocolError::AlreadyAuthenticated => "already_authenticated",
            ProtocolError::InvalidId => "invalid_id",
            ProtocolError::PermissionDenied => "permission_denied",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ProtocolError::AuthFailed => "Authentication failed",
            ProtocolError::ProtocolMismatch => "Unsupported protocol version",
            ProtocolError::RateLimited => "Rate limit exceeded",
            ProtocolError::MessageTooLarge => "Message exceeds size limit",
            ProtocolError::MalformedMessage => "Message is not valid JSON",
            ProtocolError::AlreadyAuthenticated => "Already authenticated",
            ProtocolError::InvalidId => "Invalid spreadsheet or row id",
            ProtocolError::PermissionDenied => "Access denied",
        }
    }

    pub fn to_error_message(self, id: Option<String>) -> ErrorMessage {
        ErrorMessage {
            id,
            code: self.code().to_string(),
            message: self.message().to_string(),
            retry_after_ms: None,
        }
    }

    /// Build a rate-limited error with a retry hint.
    pub fn rate_limited_error(id: Option<String>, retry_after_ms: u64) -> ErrorMessage {
        ErrorMessage {
            id,
            code: ProtocolError::RateLimited.code().to_string(),
            message: ProtocolError::RateLimited.message().to_string(),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}
