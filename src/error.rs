// src/error.rs
// Server error kinds and the numeric codes that cross the wire

use serde_json::{json, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by command handlers.
///
/// `Command` carries a numeric code that must reach the client unchanged;
/// `Silent` is a codeless failure whose server-side logging is suppressed
/// (the classic example is `drop` on a missing namespace). `Exception` is
/// a generic failure that turns into `errmsg` only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServerError {
    #[error("[Error {code}] {message}")]
    Command {
        code: i32,
        code_name: Option<String>,
        message: String,
    },

    #[error("{0}")]
    Silent(String),

    #[error("{0}")]
    Exception(String),

    #[error("collection '{0}' does not exist")]
    NoSuchCollection(String),

    #[error("no such command: '{0}'")]
    NoSuchCommand(String),

    /// Violated internal invariant (e.g. a result recorded into a slot
    /// that does not hold the pending sentinel).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Codeful error without a symbolic code name.
    pub fn command(code: i32, message: impl Into<String>) -> Self {
        ServerError::Command {
            code,
            code_name: None,
            message: message.into(),
        }
    }

    /// Codeful error with a symbolic code name.
    pub fn command_named(code: i32, code_name: &str, message: impl Into<String>) -> Self {
        ServerError::Command {
            code,
            code_name: Some(code_name.to_string()),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ServerError::Command { code, .. } => Some(*code),
            ServerError::NoSuchCommand(_) => Some(59),
            _ => None,
        }
    }

    pub fn code_name(&self) -> Option<&str> {
        match self {
            ServerError::Command { code_name, .. } => code_name.as_deref(),
            ServerError::NoSuchCommand(_) => Some("CommandNotFound"),
            _ => None,
        }
    }

    /// The message without the numeric code prefix, as written into
    /// `errmsg` and `err` fields.
    pub fn message(&self) -> String {
        match self {
            ServerError::Command { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether server-side logging is suppressed for this error.
    pub fn is_silent(&self) -> bool {
        matches!(self, ServerError::Silent(_))
    }

    /// Wire-shaped failure response: `{ok: 0, errmsg, code?, codeName?}`.
    pub fn to_response(&self) -> Value {
        let mut response = json!({
            "ok": 0,
            "errmsg": self.message(),
        });
        let obj = response.as_object_mut().unwrap();
        if let Some(code) = self.code() {
            obj.insert("code".to_string(), json!(code));
        }
        if let Some(code_name) = self.code_name() {
            obj.insert("codeName".to_string(), json!(code_name));
        }
        response
    }

    /// Error document recorded in a channel's last-error history:
    /// `{err, code?, codeName?, connectionId}`.
    pub fn to_last_error_document(&self, connection_id: u64) -> Value {
        let mut error = json!({ "err": self.message() });
        let obj = error.as_object_mut().unwrap();
        if let Some(code) = self.code() {
            obj.insert("code".to_string(), json!(code));
        }
        if let Some(code_name) = self.code_name() {
            obj.insert("codeName".to_string(), json!(code_name));
        }
        obj.insert("connectionId".to_string(), json!(connection_id));
        error
    }
}
