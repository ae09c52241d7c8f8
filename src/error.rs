// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Error type shared by every layer of the crate.

use std::io;

use thiserror::Error;

/// Failures surfaced by channels, bindings and invokers.
#[derive(Debug, Error)]
pub enum RsaError {
    /// A caller-supplied value was rejected before any state changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Admission control refused the request; retry later.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The requester-side wait bound expired.
    #[error("request timed out")]
    Timeout,

    /// The remote handler failed while serving the call.
    #[error("service exception: {0}")]
    ServiceException(String),

    /// An operating-system level failure (shm, mmap, pthread).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RsaError {
    /// Numeric status recorded in call logs and reply metadata; success is 0.
    pub fn code(&self) -> i32 {
        match self {
            RsaError::InvalidArgument(_) => 1,
            RsaError::InvalidState(_) => 2,
            RsaError::ResourceExhausted(_) => 3,
            RsaError::Timeout => 4,
            RsaError::ServiceException(_) => 5,
            RsaError::Io(_) => 6,
        }
    }
}

pub type Result<T> = std::result::Result<T, RsaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RsaError::InvalidArgument("x".into()).code(), 1);
        assert_eq!(RsaError::Timeout.code(), 4);
        assert_eq!(
            RsaError::from(io::Error::new(io::ErrorKind::Other, "boom")).code(),
            6
        );
    }

    #[test]
    fn io_errors_convert() {
        fn inner() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(inner(), Err(RsaError::Io(_))));
    }
}
