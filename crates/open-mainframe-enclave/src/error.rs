//! Enclave error types.

use miette::Diagnostic;
use thiserror::Error;

/// Errors surfaced by the enclave core.
///
/// Generic native failures are normally reported through logging and an
/// absent result; only the variants below travel up the call chain.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum EnclaveError {
    /// The security product refused the native request.
    #[error("{service} denied by security product: rc={return_code}, rsn={reason_code:#010x}")]
    #[diagnostic(code(enclave::security_denied))]
    SecurityDenied {
        service: String,
        return_code: i32,
        reason_code: i32,
    },

    /// The thread already has an enclave joined.
    #[error("thread is already classified: current={current}, requested={requested}")]
    #[diagnostic(
        code(enclave::already_classified),
        help("leave or remove the current enclave before joining another")
    )]
    AlreadyClassified { current: String, requested: String },

    /// No enclave is registered under the token key.
    #[error("enclave not found: {key}")]
    #[diagnostic(code(enclave::not_found))]
    EnclaveNotFound { key: String },

    /// A token key that is not valid hex.
    #[error("invalid enclave token '{key}'")]
    #[diagnostic(code(enclave::invalid_token))]
    InvalidToken { key: String },

    /// A native service failed where the caller needs a definite answer.
    #[error("{service} failed: rc={return_code}, rsn={reason_code:#010x}")]
    #[diagnostic(code(enclave::native_failure))]
    NativeServiceFailure {
        service: String,
        return_code: i32,
        reason_code: i32,
    },

    /// The one-time connect to WLM did not succeed.
    #[error("WLM connect failed for {subsystem}/{subsystem_name}: rc={return_code}, rsn={reason_code:#010x}")]
    #[diagnostic(code(enclave::connect_failed))]
    ConnectFailed {
        subsystem: String,
        subsystem_name: String,
        return_code: i32,
        reason_code: i32,
    },

    /// A service was used before `connect` or after `disconnect`.
    #[error("WLM services are not connected")]
    #[diagnostic(code(enclave::not_connected))]
    NotConnected,

    /// The durable connect worker is gone.
    #[error("WLM worker unavailable: {reason}")]
    #[diagnostic(code(enclave::worker_unavailable))]
    WorkerUnavailable { reason: String },

    /// Configuration could not be read or parsed.
    #[error("configuration error: {message}")]
    #[diagnostic(code(enclave::config))]
    Config { message: String },
}

/// Enclave result type alias.
pub type Result<T> = std::result::Result<T, EnclaveError>;
