//! Standardized error handling for SatForge
//!
//! Every build, selection and broadcast path returns [`SatForgeError`]. The
//! domain variants (`InsufficientFunds`, `InvalidDraft`, `BroadcastRejected`,
//! `StaleCommit`) are terminal for the current build attempt: nothing in this
//! crate retries them. The caller decides whether to refresh UTXOs and try again.
//!
//! # Usage
//!
//! ```
//! use satforge_core::error::{SatForgeError, ErrorCategory};
//!
//! let err = SatForgeError::insufficient_funds(10_000, 4_000);
//! assert_eq!(err.category(), ErrorCategory::Funds);
//! assert!(err.user_message().contains("6000"));
//! assert_ne!(err.exit_code(), 0);
//! ```

use bitcoin::Txid;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for SatForge
#[derive(Debug, Error)]
pub enum SatForgeError {
    /// Coin selection ran out of UTXOs before covering the target
    #[error("Insufficient funds: needed {needed} sats, available {available} sats (short by {shortfall} sats)")]
    InsufficientFunds {
        needed: u64,
        available: u64,
        shortfall: u64,
    },

    /// A draft transaction or PSBT input is structurally unusable
    #[error("Invalid draft: {0}")]
    InvalidDraft(String),

    /// The node refused the transaction at test-accept or broadcast
    #[error("Broadcast rejected: {reason}")]
    BroadcastRejected { reason: String },

    /// A reveal referenced a commit output that cannot be resolved
    #[error("Stale commit: output {txid}:{vout} cannot be resolved")]
    StaleCommit { txid: Txid, vout: u32 },

    /// The caller's deadline passed between external calls
    #[error("Timed out: {context}")]
    Timeout { context: String },

    /// Configuration errors
    #[error("Configuration error: {context}")]
    Config {
        context: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// A chain source, signer or broadcaster failed
    #[error("External source error: {context}")]
    Source {
        context: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// Invalid addresses
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        context: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

/// Extension trait for adding context to error types
pub trait ErrorContext<T> {
    /// Add context to an error, keeping the original as the source
    fn context(self, context: impl Into<String>) -> Result<T, SatForgeError>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<SatForgeError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, SatForgeError> {
        self.map_err(|err| match err.into() {
            SatForgeError::Config { source, .. } => SatForgeError::Config {
                context: context.into(),
                source,
            },
            SatForgeError::Source { source, .. } => SatForgeError::Source {
                context: context.into(),
                source,
            },
            SatForgeError::Io { source, .. } => SatForgeError::Io {
                context: context.into(),
                source,
            },
            SatForgeError::Serialization { source, .. } => SatForgeError::Serialization {
                context: context.into(),
                source,
            },
            // Domain errors already carry their own meaning
            other => other,
        })
    }
}

impl From<io::Error> for SatForgeError {
    fn from(err: io::Error) -> Self {
        SatForgeError::Io {
            context: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for SatForgeError {
    fn from(err: serde_json::Error) -> Self {
        SatForgeError::Serialization {
            context: format!("JSON serialization error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl From<toml::de::Error> for SatForgeError {
    fn from(err: toml::de::Error) -> Self {
        SatForgeError::Serialization {
            context: format!("TOML deserialization error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl From<toml::ser::Error> for SatForgeError {
    fn from(err: toml::ser::Error) -> Self {
        SatForgeError::Serialization {
            context: format!("TOML serialization error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl From<bitcoin::consensus::encode::Error> for SatForgeError {
    fn from(err: bitcoin::consensus::encode::Error) -> Self {
        SatForgeError::Serialization {
            context: format!("Bitcoin serialization error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

impl From<bitcoin::psbt::Error> for SatForgeError {
    fn from(err: bitcoin::psbt::Error) -> Self {
        SatForgeError::InvalidDraft(format!("PSBT error: {}", err))
    }
}

impl From<bitcoin::address::Error> for SatForgeError {
    fn from(err: bitcoin::address::Error) -> Self {
        SatForgeError::InvalidAddress(err.to_string())
    }
}

impl From<hex::FromHexError> for SatForgeError {
    fn from(err: hex::FromHexError) -> Self {
        SatForgeError::Serialization {
            context: format!("hex decoding error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

/// Type alias for a Result with SatForgeError
pub type SatForgeResult<T> = Result<T, SatForgeError>;

/// Wrap an `anyhow` error (as returned by the config loader) as a config error
pub fn from_anyhow<T>(result: Result<T, anyhow::Error>, context: impl Into<String>) -> SatForgeResult<T> {
    result.map_err(|err| SatForgeError::Config {
        context: context.into(),
        source: Some(Box::new(ErrorWrapper(err))),
    })
}

// Wrapper for anyhow::Error to implement StdError
#[derive(Debug)]
struct ErrorWrapper(anyhow::Error);

impl fmt::Display for ErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ErrorWrapper {}

/// Create a new configuration error with context
pub fn config_error<S: Into<String>>(context: S) -> SatForgeError {
    SatForgeError::Config {
        context: context.into(),
        source: None,
    }
}

/// Create a new external source error with context
pub fn source_error<S: Into<String>>(context: S) -> SatForgeError {
    SatForgeError::Source {
        context: context.into(),
        source: None,
    }
}

/// Create a new external source error with context and source
pub fn source_error_with_source<S: Into<String>, E: StdError + Send + Sync + 'static>(
    context: S,
    source: E,
) -> SatForgeError {
    SatForgeError::Source {
        context: context.into(),
        source: Some(Box::new(source)),
    }
}

/// Error category for logging purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Not enough spendable value
    Funds,
    /// Malformed drafts, addresses or inputs
    Draft,
    /// Node rejections and unresolvable commits
    Broadcast,
    /// Deadlines
    Timeout,
    /// Configuration errors
    Config,
    /// Chain source, signer or broadcaster failures
    Source,
    /// I/O and serialization
    Io,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Funds => "Funds",
            ErrorCategory::Draft => "Draft",
            ErrorCategory::Broadcast => "Broadcast",
            ErrorCategory::Timeout => "Timeout",
            ErrorCategory::Config => "Config",
            ErrorCategory::Source => "Source",
            ErrorCategory::Io => "Io",
        }
    }
}

impl SatForgeError {
    /// Build an `InsufficientFunds` error, deriving the shortfall
    pub fn insufficient_funds(needed: u64, available: u64) -> Self {
        SatForgeError::InsufficientFunds {
            needed,
            available,
            shortfall: needed.saturating_sub(available),
        }
    }

    pub fn invalid_draft<S: Into<String>>(reason: S) -> Self {
        SatForgeError::InvalidDraft(reason.into())
    }

    pub fn broadcast_rejected<S: Into<String>>(reason: S) -> Self {
        SatForgeError::BroadcastRejected { reason: reason.into() }
    }

    pub fn timeout<S: Into<String>>(context: S) -> Self {
        SatForgeError::Timeout { context: context.into() }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        SatForgeError::Validation(message.into())
    }

    pub fn invalid_address<S: Into<String>>(message: S) -> Self {
        SatForgeError::InvalidAddress(message.into())
    }

    /// Get the category of this error for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            SatForgeError::InsufficientFunds { .. } => ErrorCategory::Funds,
            SatForgeError::InvalidDraft(_)
            | SatForgeError::InvalidAddress(_)
            | SatForgeError::Validation(_) => ErrorCategory::Draft,
            SatForgeError::BroadcastRejected { .. } | SatForgeError::StaleCommit { .. } => {
                ErrorCategory::Broadcast
            }
            SatForgeError::Timeout { .. } => ErrorCategory::Timeout,
            SatForgeError::Config { .. } => ErrorCategory::Config,
            SatForgeError::Source { .. } => ErrorCategory::Source,
            SatForgeError::Io { .. } | SatForgeError::Serialization { .. } => ErrorCategory::Io,
        }
    }

    /// Message suitable for a CLI or UI
    ///
    /// Includes the shortfall for funding errors and the node's reason, verbatim,
    /// for rejections.
    pub fn user_message(&self) -> String {
        match self {
            SatForgeError::InsufficientFunds { needed, shortfall, .. } => format!(
                "Insufficient balance: {} sats needed, {} sats short",
                needed, shortfall
            ),
            SatForgeError::InvalidDraft(reason) => format!("Cannot build transaction: {}", reason),
            SatForgeError::BroadcastRejected { reason } => {
                format!("Transaction rejected by node: {}", reason)
            }
            SatForgeError::StaleCommit { txid, vout } => format!(
                "Commit output {}:{} was not found; re-run the commit step",
                txid, vout
            ),
            SatForgeError::Timeout { context } => format!("Operation timed out: {}", context),
            SatForgeError::Config { context, .. } => format!("Configuration error: {}", context),
            SatForgeError::Source { context, .. } => format!("External service error: {}", context),
            SatForgeError::InvalidAddress(message) => format!("Invalid address: {}", message),
            SatForgeError::Validation(message) => format!("Validation error: {}", message),
            SatForgeError::Io { context, .. } => format!("File operation error: {}", context),
            SatForgeError::Serialization { context, .. } => format!("Data format error: {}", context),
        }
    }

    /// Process exit code for a CLI wrapping the builder
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Funds => 2,
            ErrorCategory::Draft => 3,
            ErrorCategory::Broadcast => 4,
            ErrorCategory::Timeout => 5,
            ErrorCategory::Config => 6,
            ErrorCategory::Source => 7,
            ErrorCategory::Io => 8,
        }
    }
}
