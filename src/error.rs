//! Error types for the bootstrapper.
//!
//! Every error variant is a distinct failure mode of the bootstrap protocol.
//! Messages for cryptographic failures are minimal: they signal
//! *what* failed without revealing *why* in ways that could leak key state.
//!
//! Layer boundaries wrap errors with [`ResultExt::context`] so the outermost
//! caller can log the full chain ("setting up disk: opening disk: ...").

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The single error type for all bootstrapper operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A cryptographic key was invalid (wrong length, malformed, etc.).
    #[error("invalid key")]
    InvalidKey,

    /// Encryption or key wrapping failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// Decryption or key unwrapping failed. Wrong key, tampered ciphertext
    /// and a bad GCM tag are indistinguishable.
    #[error("decryption failed")]
    DecryptionFailure,

    /// Key derivation (HKDF) failed.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// No wrapped DEK is stored under the requested name.
    #[error("DEK not set")]
    DekUnset,

    /// The KMS has no key encryption key to work with.
    #[error("KEK not set")]
    KekUnset,

    /// A KMS or storage URI could not be parsed or has the wrong scheme.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// The URI names a backend this build does not know.
    #[error("unknown {kind} backend: {backend}")]
    UnknownBackend { kind: &'static str, backend: String },

    /// A required URI query parameter is absent or empty.
    #[error("missing URI parameter: {0}")]
    MissingParameter(String),

    /// The backend is known, but no client capability was supplied for it.
    #[error("no client available for backend: {0}")]
    NotConnected(String),

    /// A remote KMS or object store rejected the request.
    #[error("backend: {0}")]
    Backend(String),

    /// The metadata API failed or returned unusable data.
    #[error("metadata: {0}")]
    Metadata(String),

    /// The encrypted state disk reported an error.
    #[error("disk: {0}")]
    Disk(String),

    /// A peer could not be reached.
    #[error("transport: {0}")]
    Transport(String),

    /// A peer answered with an RPC error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The node lock is held by the other bootstrap path.
    #[error("node is already being {0}")]
    NodeLocked(&'static str),

    /// Input that violates a protocol invariant.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// An outbound call exceeded its per-call budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Base64 input could not be decoded.
    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An error annotated with the operation that failed.
    #[error("{context}: {error}")]
    Context { context: String, error: Box<Error> },
}

impl Error {
    /// Wrap this error with a description of the failed operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            error: Box::new(self),
        }
    }

    /// The innermost error, with every context layer stripped.
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { error, .. } => error.root(),
            other => other,
        }
    }

    /// Returns true if the root cause is a missing DEK.
    pub fn is_dek_unset(&self) -> bool {
        matches!(self.root(), Self::DekUnset)
    }
}

/// Context wrapping for results, in the spirit of `anyhow::Context` but
/// keeping the typed error.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

// ---------------------------------------------------------------------------
// RPC errors
// ---------------------------------------------------------------------------

/// Status codes the init and join services answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCode {
    /// The node is already being initialized or joined.
    FailedPrecondition,
    /// Attestation evidence was rejected.
    PermissionDenied,
    /// Any failure while serving an accepted request.
    Internal,
}

impl RpcCode {
    fn status(self) -> StatusCode {
        match self {
            Self::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FailedPrecondition => "failed precondition",
            Self::PermissionDenied => "permission denied",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error body carried over the wire as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(RpcCode::FailedPrecondition, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RpcCode::PermissionDenied, message)
    }

    /// An internal error carrying the full context chain of `err`.
    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(RpcCode::Internal, err.to_string())
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (self.code.status(), Json(self)).into_response()
    }
}
