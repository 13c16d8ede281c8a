//! PlugDock Error Definitions
//!
//! Defines error types used throughout the host, and the wire error codes
//! returned to callers across the bridge.

use serde::{Deserialize, Serialize};
use specta::Type;
use thiserror::Error;

use super::{FunctionName, PluginId, SurfaceId};

/// Core host error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Registry / Routing Errors
    // =========================================================================
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(PluginId),

    #[error("Unknown function '{function}' on plugin {plugin_id}")]
    UnknownFunction {
        plugin_id: PluginId,
        function: FunctionName,
    },

    #[error("Plugin already registered: {0}")]
    DuplicateRegistration(PluginId),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Handler fault: {0}")]
    HandlerFault(String),

    // =========================================================================
    // Plugin Loading Errors
    // =========================================================================
    #[error("Plugin load failed: {0}")]
    PluginLoadFailed(String),

    #[error("Invalid plugin manifest: {0}")]
    InvalidPluginManifest(String),

    // =========================================================================
    // Event Errors
    // =========================================================================
    #[error("Invalid event name: {0:?}")]
    InvalidEventName(String),

    // =========================================================================
    // Template / Surface Errors
    // =========================================================================
    #[error("Surface creation failed: {0}")]
    SurfaceCreationFailed(String),

    #[error("Invalid template descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Surface not found: {0}")]
    SurfaceNotFound(SurfaceId),

    #[error("Template window not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Config store error: {0}")]
    Config(String),

    #[error("Market request failed: {0}")]
    Market(String),

    #[error("Settings error: {0}")]
    Settings(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core host result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Error code carried by a failed call outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
pub enum ErrorCode {
    UnknownPlugin,
    UnknownFunction,
    HandlerFault,
    DuplicateRegistration,
    SurfaceCreationFailed,
    InvalidDescriptor,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownPlugin => "UnknownPlugin",
            ErrorCode::UnknownFunction => "UnknownFunction",
            ErrorCode::HandlerFault => "HandlerFault",
            ErrorCode::DuplicateRegistration => "DuplicateRegistration",
            ErrorCode::SurfaceCreationFailed => "SurfaceCreationFailed",
            ErrorCode::InvalidDescriptor => "InvalidDescriptor",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    /// Convert to a user-friendly error message for IPC
    pub fn to_ipc_error(&self) -> String {
        self.to_string()
    }

    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::UnknownPlugin(_) => ErrorCode::UnknownPlugin,
            CoreError::UnknownFunction { .. } => ErrorCode::UnknownFunction,
            CoreError::DuplicateRegistration(_) => ErrorCode::DuplicateRegistration,
            CoreError::HandlerFault(_) | CoreError::PluginLoadFailed(_) => {
                ErrorCode::HandlerFault
            }
            CoreError::SurfaceCreationFailed(_) => ErrorCode::SurfaceCreationFailed,
            CoreError::InvalidDescriptor(_) => ErrorCode::InvalidDescriptor,
            CoreError::InvalidRegistration(_)
            | CoreError::InvalidPluginManifest(_)
            | CoreError::InvalidEventName(_)
            | CoreError::SurfaceNotFound(_)
            | CoreError::TemplateNotFound(_)
            | CoreError::InvalidOperation(_)
            | CoreError::JsonError(_) => ErrorCode::InvalidRequest,
            CoreError::Config(_)
            | CoreError::Market(_)
            | CoreError::Settings(_)
            | CoreError::IoError(_)
            | CoreError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message carried on the wire. Routing failures report the bare code
    /// name so callers can match on it.
    pub fn wire_message(&self) -> String {
        match self {
            CoreError::UnknownPlugin(_) | CoreError::UnknownFunction { .. } => {
                self.code().as_str().to_string()
            }
            CoreError::HandlerFault(message) => message.clone(),
            other => other.to_string(),
        }
    }
}
