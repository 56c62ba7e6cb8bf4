//! SCI Shared Library
//!
//! Wire-level types for the SCI testing protocol: constants, command
//! and control line parsing, header folding, and the challenge-response
//! authentication scheme.

pub mod auth;
pub mod error;
pub mod headers;
pub mod protocol;

pub use error::{Error, Result};
