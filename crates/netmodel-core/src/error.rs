//! Unified error type for the network-model core.
//!
//! Structural, reference, and invariant violations are reported as values
//! (`ValidationReport`, `ActionResult`) wherever the base specification calls
//! for that; `NetModelError` exists for the smaller set of operations that
//! have no natural non-exceptional return, such as I/O on a snapshot file or
//! malformed canonical JSON.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("reference error: {0}")]
    Reference(String),

    #[error("solver error: {0}")]
    Solver(String),
}

pub type NetModelResult<T> = Result<T, NetModelError>;

impl From<serde_json::Error> for NetModelError {
    fn from(err: serde_json::Error) -> Self {
        NetModelError::Parse(err.to_string())
    }
}

impl From<String> for NetModelError {
    fn from(s: String) -> Self {
        NetModelError::Invariant(s)
    }
}

impl From<&str> for NetModelError {
    fn from(s: &str) -> Self {
        NetModelError::Invariant(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = NetModelError::Invariant("duplicate slack".into());
        assert!(err.to_string().contains("invariant violation"));
    }

    #[test]
    fn question_mark_propagation() {
        fn inner() -> NetModelResult<()> {
            Err(NetModelError::Reference("missing node".into()))
        }
        fn outer() -> NetModelResult<()> {
            inner()?;
            Ok(())
        }
        assert!(outer().is_err());
    }
}
