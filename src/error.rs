//! Errors produced while reading, linking and translating modules.

use thiserror::Error;

/// A convenient alias for a `Result` that uses [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The reasons a module can fail to load.
///
/// All three variants abort the translation; the driver rolls the
/// environment back to its pre-translation state regardless of which
/// one is raised.
#[derive(Debug, Error)]
pub enum Error {
    /// The binary itself is malformed. Carries the file offset at
    /// which decoding stopped.
    #[error("invalid wasm binary at offset {offset:#x}: {message}")]
    InvalidBinary {
        /// Description of the malformation.
        message: String,
        /// Byte offset into the input at which it was detected.
        offset: usize,
    },

    /// An import could not be resolved against the environment, or a
    /// resolved entity did not match what the module declared.
    #[error("link error: {message}")]
    Link {
        /// Description of the mismatch.
        message: String,
    },

    /// The module is structurally invalid: a type error, a missing
    /// table or memory, an out-of-range index, or a bad segment.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the violation.
        message: String,
    },
}

impl Error {
    pub(crate) fn invalid(offset: usize, message: impl Into<String>) -> Error {
        Error::InvalidBinary {
            message: message.into(),
            offset,
        }
    }

    pub(crate) fn link(message: impl Into<String>) -> Error {
        Error::Link {
            message: message.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Error {
        Error::Validation {
            message: message.into(),
        }
    }
}
