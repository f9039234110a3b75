//! Client-facing error taxonomy. Wraps `ark_core::Error` for data-model and cryptographic
//! failures, and adds the categories that only make sense once a provider is in the loop:
//! configuration, funds, and settlement-round outcomes.

use std::fmt;

/// Errors raised while driving a settlement round or otherwise coordinating with an Ark
/// server through the [`crate::provider::ArkProvider`] family of traits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("client has not been initialized: {0}")]
    NotInitialized(String),

    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: String, available: String },

    #[error("amount {0} is below the server's dust threshold")]
    AmountBelowDust(String),

    #[error("amount must be positive")]
    AmountNonPositive,

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] ark_core::Error),

    #[error("settlement failed: {reason}")]
    SettlementFailed { reason: String },

    #[error("settlement was cancelled")]
    Cancelled,

    #[error("{msg}: {source}")]
    Context {
        msg: String,
        #[source]
        source: Box<Error>,
    },
}

/// A failure surfaced by an [`crate::provider::ArkProvider`], [`crate::provider::ChainProvider`],
/// or [`crate::provider::Broadcaster`] implementation.
///
/// `transient` failures (a dropped connection, a timed-out request) are worth retrying;
/// `fatal` ones (the server rejected our registration, our nonces were invalid) are not.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub transient: bool,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transient {
            write!(f, "(transient) {}", self.message)
        } else {
            write!(f, "(fatal) {}", self.message)
        }
    }
}

impl Error {
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn not_initialized(msg: impl fmt::Display) -> Self {
        Self::NotInitialized(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    pub fn settlement_failed(reason: impl fmt::Display) -> Self {
        Self::SettlementFailed {
            reason: reason.to_string(),
        }
    }

    pub fn transient_provider(msg: impl fmt::Display) -> Self {
        Self::Provider(ProviderError {
            message: msg.to_string(),
            transient: true,
        })
    }

    pub fn fatal_provider(msg: impl fmt::Display) -> Self {
        Self::Provider(ProviderError {
            message: msg.to_string(),
            transient: false,
        })
    }

    /// Whether retrying the operation that produced this error is worthwhile. Only
    /// transient provider failures qualify; everything else (bad config, a protocol
    /// violation, insufficient funds) will fail again the same way.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Provider(ProviderError { transient: true, .. }))
    }
}

/// Attach static or lazily-computed context to a fallible result, matching the ergonomics
/// of `ark_core::ErrorContext`.
pub trait ErrorContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T, Error>;
    fn with_context<F, M>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>;
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn context(self, msg: impl Into<String>) -> Result<T, Error> {
        self.map_err(|source| Error::Context {
            msg: msg.into(),
            source: Box::new(source),
        })
    }

    fn with_context<F, M>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>,
    {
        self.map_err(|source| Error::Context {
            msg: f().into(),
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors_are_retryable() {
        let err = Error::transient_provider("connection reset");
        assert!(err.is_transient());

        let err = Error::fatal_provider("invalid signature");
        assert!(!err.is_transient());
    }

    #[test]
    fn context_wraps_and_displays_both_messages() {
        let result: Result<(), Error> = Err(Error::protocol("unexpected event"));
        let wrapped = result.context("joining settlement round");

        assert_eq!(
            wrapped.unwrap_err().to_string(),
            "joining settlement round: protocol error: unexpected event"
        );
    }
}
