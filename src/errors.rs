//! Central error taxonomy for the compressed swap tool
//!
//! Application-level failures are grouped into categories that map cleanly
//! onto log fields. The send/confirm core has its own narrower errors
//! (`SendError`, `ConfirmError`) because its callers branch on them.

use solana_sdk::signature::Signature;
use thiserror::Error;

/// High-level error categories for logs and exit reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or invalid configuration
    Configuration,
    /// Network/RPC related errors
    Network,
    /// Aggregator HTTP API errors
    Aggregator,
    /// Malformed instruction payloads
    Decode,
    /// Transaction assembly/signing errors
    Transaction,
    /// Data validation errors
    Validation,
}

impl ErrorCategory {
    /// Label used in structured log fields
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Network => "network",
            ErrorCategory::Aggregator => "aggregator",
            ErrorCategory::Decode => "decode",
            ErrorCategory::Transaction => "transaction",
            ErrorCategory::Validation => "validation",
        }
    }
}

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Network error: {message}")]
    Network { message: String, source: Option<anyhow::Error> },

    #[error("Aggregator error ({status}): {body}")]
    Aggregator { status: u16, body: String },

    #[error("Instruction decode failed for {field}: {reason}")]
    InstructionDecode { field: String, reason: String },

    #[error("Transaction build failed: {message}")]
    Build { message: String },

    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Insufficient compressed balance: need {required}, have {available}")]
    InsufficientCompressedBalance { required: u64, available: u64 },
}

impl SwapError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SwapError::Configuration { .. } => ErrorCategory::Configuration,
            SwapError::Network { .. } => ErrorCategory::Network,
            SwapError::Aggregator { .. } => ErrorCategory::Aggregator,
            SwapError::InstructionDecode { .. } => ErrorCategory::Decode,
            SwapError::Build { .. } => ErrorCategory::Transaction,
            SwapError::Validation { .. } | SwapError::InsufficientCompressedBalance { .. } => {
                ErrorCategory::Validation
            }
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source<S: Into<String>>(message: S, source: anyhow::Error) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn decode<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::InstructionDecode {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn build<S: Into<String>>(message: S) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Extension trait to attach a network category to foreign errors
pub trait ErrorContext {
    fn network_context<S: Into<String>>(self, message: S) -> SwapError;
}

impl ErrorContext for anyhow::Error {
    fn network_context<S: Into<String>>(self, message: S) -> SwapError {
        SwapError::network_with_source(message, self)
    }
}

impl ErrorContext for solana_client::client_error::ClientError {
    fn network_context<S: Into<String>>(self, message: S) -> SwapError {
        SwapError::network_with_source(message, anyhow::Error::new(self))
    }
}

/// Failure modes of a confirmation detector.
#[derive(Error, Debug)]
pub enum ConfirmError {
    /// The blockhash validity window closed before confirmation.
    #[error("block height exceeded: current {current} > last valid {last_valid_block_height}")]
    BlockHeightExceeded { current: u64, last_valid_block_height: u64 },

    /// The wait was cancelled through its token.
    #[error("confirmation wait aborted")]
    Aborted,

    #[error("confirmation wait failed: {0}")]
    Network(#[source] anyhow::Error),
}

/// Errors surfaced by the send/confirm core.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("initial submission failed: {0}")]
    Submission(#[source] anyhow::Error),

    #[error("confirmation of {signature} failed: {source}")]
    Wait {
        signature: Signature,
        #[source]
        source: ConfirmError,
    },

    #[error("fetching transaction {signature} failed: {source}")]
    Fetch {
        signature: Signature,
        #[source]
        source: anyhow::Error,
    },
}
