//! Shared domain types and errors for the user service.

pub mod error;
pub mod types;
