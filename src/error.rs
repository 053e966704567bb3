//! Unified application error model and mapping helpers.
//! This module provides the common error enum used across the control channel,
//! the dispatcher and the capture subsystems, along with the mapping of each
//! category onto the status push an operator sees.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::server::commands::StatusKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// Invalid setup code, missing/expired grant, bad credentials, bad username/password format.
    Auth { code: String, message: String },
    /// Camera unavailable, capture source failed to start.
    Resource { code: String, message: String },
    /// Push delivery to a connection that is already gone.
    Transient { code: String, message: String },
    /// Missing master code and similar startup problems.
    Config { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Auth { code, .. }
            | AppError::Resource { code, .. }
            | AppError::Transient { code, .. }
            | AppError::Config { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Auth { message, .. }
            | AppError::Resource { message, .. }
            | AppError::Transient { message, .. }
            | AppError::Config { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn auth(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn resource(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Resource { code: code.into(), message: msg.into() } }
    pub fn transient(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Transient { code: code.into(), message: msg.into() } }
    pub fn config(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Config { code: code.into(), message: msg.into() } }
    pub fn io(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Transient errors are swallowed at the relay boundary; everything else reaches the operator.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, AppError::Transient { .. })
    }

    /// Map to the (kind, success flag, message) triple of a `ReceiveStatus` push.
    /// `fallback` is used for categories that carry no subsystem of their own.
    pub fn status_fields(&self, fallback: StatusKind) -> (StatusKind, bool, String) {
        let msg = self.message().to_string();
        match self {
            AppError::Auth { .. } => (StatusKind::Auth, false, msg),
            AppError::Resource { .. } | AppError::Transient { .. } => (fallback, false, msg),
            AppError::Config { .. } => (StatusKind::System, false, msg),
            AppError::Io { .. } | AppError::Internal { .. } => (fallback, false, "Command failed on the agent.".to_string()),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: unexpected collaborator failure
        AppError::Internal { code: "internal_error".into(), message: err.to_string() }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io { code: "io_error".into(), message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let (kind, ok, msg) = AppError::auth("bad_code", "Master Code is not correct.").status_fields(StatusKind::Webcam);
        assert_eq!(kind, StatusKind::Auth);
        assert!(!ok);
        assert_eq!(msg, "Master Code is not correct.");

        let (kind, ok, _) = AppError::resource("camera_busy", "busy").status_fields(StatusKind::Webcam);
        assert_eq!(kind, StatusKind::Webcam);
        assert!(!ok);

        // Internal details never reach the operator
        let (_, _, msg) = AppError::internal("internal", "stack detail").status_fields(StatusKind::App);
        assert_eq!(msg, "Command failed on the agent.");
    }

    #[test]
    fn transient_is_not_reportable() {
        assert!(!AppError::transient("gone", "peer gone").is_reportable());
        assert!(AppError::config("missing", "x").is_reportable());
    }

    #[test]
    fn serializes_with_type_tag() {
        let v = serde_json::to_value(AppError::resource("camera_busy", "busy")).unwrap();
        assert_eq!(v["type"], "resource");
        assert_eq!(v["code"], "camera_busy");
    }
}
