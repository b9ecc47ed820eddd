//! Common types shared across HealMate crates.
//!
//! This crate provides the error taxonomy, the centralized retry policy and
//! the turn data model that every component speaks.

pub mod error;
pub mod message;
pub mod retry;

pub use error::{ErrorKind, HealmateError, Result};
pub use message::{
    Attachment, Modality, RouteKind, ToolCallRecord, ToolCallStatus, Turn, TurnInput,
    idempotency_key,
};
pub use retry::{RetryPolicy, with_retry};
