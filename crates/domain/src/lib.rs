//! Shared domain types for the Agora gateway.
//!
//! Everything in this crate is plain data: configuration, error taxonomy,
//! conversation enums, task identifiers, and the typed event model emitted
//! by the LLM runtime. No I/O lives here.

pub mod config;
pub mod error;
pub mod stream;
pub mod task;
pub mod types;

pub use error::{Error, Result};
pub use task::TaskIdentifier;
