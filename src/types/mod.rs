//! Shared types

pub mod error;

pub use error::{CascadeError, Result};
