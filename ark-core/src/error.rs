//! Crate-level error type and the `.context(...)` ergonomics used throughout `ark-core`.

use std::fmt;

/// Errors raised by the data model, tree validator, MuSig2 session, and forfeit builder.
///
/// This is not a 1:1 mirror of every failure a caller might see from a live Ark server —
/// transport and server-originated failures belong to `ark-client::Error`, which wraps
/// this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid tree structure at level {level}, index {index}: {reason}")]
    InvalidTreeStructure {
        level: usize,
        index: usize,
        reason: String,
    },

    #[error("signing stage violation: {0}")]
    SigningStageViolation(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("{0}")]
    AdHoc(String),

    #[error("{msg}: {source}")]
    Context {
        msg: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn ad_hoc(msg: impl fmt::Display) -> Self {
        Self::AdHoc(msg.to_string())
    }

    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn crypto(msg: impl fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    pub fn transaction(msg: impl fmt::Display) -> Self {
        Self::Transaction(msg.to_string())
    }

    pub fn signing_stage_violation(msg: impl fmt::Display) -> Self {
        Self::SigningStageViolation(msg.to_string())
    }

    pub fn invalid_tree_structure(level: usize, index: usize, reason: impl fmt::Display) -> Self {
        Self::InvalidTreeStructure {
            level,
            index,
            reason: reason.to_string(),
        }
    }
}

/// Attach static or lazily-computed context to a fallible result, in the style used
/// across this crate: `some_call().map_err(Error::crypto).context("computing sighash")?`.
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
    fn context_wraps_and_displays_both_messages() {
        let result: Result<(), Error> = Err(Error::ad_hoc("root cause"));
        let wrapped = result.context("doing the thing");

        let message = wrapped.unwrap_err().to_string();
        assert_eq!(message, "doing the thing: root cause");
    }

    #[test]
    fn invalid_tree_structure_names_the_offending_node() {
        let err = Error::invalid_tree_structure(2, 5, "amount mismatch");
        assert_eq!(
            err.to_string(),
            "invalid tree structure at level 2, index 5: amount mismatch"
        );
    }
}
