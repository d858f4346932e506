// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the service RPC layer.
//!
//! Two families:
//! - [`RpcError`] for local lifecycle operations (binding a server port,
//!   building the I/O runtime, creating sessions on a stopped manager).
//! - [`CallError`] for the outcome of an individual remote call. Call errors
//!   are never unwound across the async boundary; they are reified into the
//!   response slot of the call they belong to.

use thiserror::Error;

/// Result type for lifecycle operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors from local creation and lifecycle operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failed to bind the server listen port.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Requested port (0 = ephemeral)
        port: u16,
        /// Underlying bind error
        source: std::io::Error,
    },

    /// Generic I/O failure during setup.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// A required collaborator was not supplied to a builder.
    #[error("missing builder field: {0}")]
    MissingField(&'static str),
}

/// Outcome classification for a single remote call.
///
/// Exactly one of these (or a decoded response) resolves every pending
/// call's completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Socket connect/read/write failed. The session is `Failed` afterwards.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or envelope. The session is closed afterwards.
    #[error("decode error: {0}")]
    Decode(String),

    /// The caller-side deadline elapsed before a response arrived.
    #[error("Timeout")]
    Timeout,

    /// The session or manager was stopped while the call was pending.
    #[error("session shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_display() {
        assert_eq!(CallError::Timeout.to_string(), "Timeout");
        assert_eq!(
            CallError::Transport("connection reset".into()).to_string(),
            "transport error: connection reset"
        );
        assert_eq!(CallError::Shutdown.to_string(), "session shut down");
    }

    #[test]
    fn rpc_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: RpcError = io.into();
        assert!(matches!(err, RpcError::Io(_)));
    }
}
