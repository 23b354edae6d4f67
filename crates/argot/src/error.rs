//! Error types for the Argot runtime.
//!
//! Dispatch itself never fails — a missing method routes through the
//! forwarding hooks and allocation failure aborts — so errors only surface
//! from the registration surface.

use std::fmt;

/// Errors that can occur while registering runtime metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A class with this name is already registered.
    ClassAlreadyExists {
        /// The contested class name.
        name: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClassAlreadyExists { name } => {
                write!(f, "class name already registered: {name}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for Argot registration operations.
pub type Result<T> = std::result::Result<T, Error>;
