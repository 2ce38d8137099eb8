use std::{fmt, time::Duration};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use garrison_proto::{ProtoError, RemoteError};
use serde::Serialize;

use crate::ledger::ServerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictScope {
    /// Another ledger row (possibly soft-deleted) holds the port.
    Ledger,
    /// Something on the agent host is bound to the port.
    Host,
}

impl fmt::Display for ConflictScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ledger => f.write_str("ledger"),
            Self::Host => f.write_str("host"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("agent is not connected")]
    AgentUnavailable,
    #[error("agent did not reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("port {port} is already in use ({scope}: {owner})")]
    PortConflict {
        scope: ConflictScope,
        port: u16,
        owner: String,
    },
    #[error("no free ports left in the configured ranges")]
    NoPortsAvailable,
    #[error("server {0} has no container and no data to recreate it from")]
    OrphanedServer(uuid::Uuid),
    #[error("cannot {op} a server in status {status}")]
    InvalidTransition {
        op: &'static str,
        status: ServerStatus,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("server name {0:?} is already taken on this agent")]
    NameTaken(String),
    #[error("agent error ({code}): {message}")]
    Remote { code: String, message: String },
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("unauthorized")]
    Unauthorized,
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentUnavailable => "agent_unavailable",
            Self::Timeout(_) => "timeout",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::PortConflict { .. } => "port_conflict",
            Self::NoPortsAvailable => "no_ports_available",
            Self::OrphanedServer(_) => "orphaned_server",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::NameTaken(_) => "name_taken",
            Self::Remote { .. } => "agent_error",
            Self::Ledger(_) => "ledger_error",
            Self::Unauthorized => "unauthorized",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AgentUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::MalformedEnvelope(_) | Self::Remote { .. } => StatusCode::BAD_GATEWAY,
            Self::PortConflict { .. }
            | Self::NameTaken(_)
            | Self::InvalidTransition { .. }
            | Self::OrphanedServer(_) => StatusCode::CONFLICT,
            Self::NoPortsAvailable => StatusCode::INSUFFICIENT_STORAGE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::PortConflict { scope, port, owner } => Some(serde_json::json!({
                "scope": scope,
                "port": port,
                "owner": owner,
            })),
            Self::InvalidTransition { op, status } => Some(serde_json::json!({
                "op": op,
                "status": status,
            })),
            Self::Remote { code, .. } => Some(serde_json::json!({ "remote_code": code })),
            _ => None,
        }
    }
}

impl From<RemoteError> for ControlError {
    fn from(value: RemoteError) -> Self {
        Self::Remote {
            code: value.code,
            message: value.message,
        }
    }
}

impl From<ProtoError> for ControlError {
    fn from(value: ProtoError) -> Self {
        Self::MalformedEnvelope(value.to_string())
    }
}

impl From<sea_orm::DbErr> for ControlError {
    fn from(value: sea_orm::DbErr) -> Self {
        Self::Ledger(value.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        };
        (self.status_code(), axum::Json(body)).into_response()
    }
}
