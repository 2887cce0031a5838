//! LLM runtime client abstraction.
//!
//! The gateway never talks to a concrete model runtime directly; it goes
//! through the [`RuntimeClient`] trait, which models a long-lived
//! connection with session-resumption semantics. [`parser`] folds the
//! runtime's typed events into accumulated text and tool effects, and
//! [`testkit`] provides a scripted in-process runtime for tests.

pub mod client;
pub mod options;
pub mod parser;
pub mod process;
pub mod testkit;

pub use client::{RuntimeClient, RuntimeFactory};
pub use options::AgentOptions;
pub use parser::{parse_event, ParsedEvent};
