//! Parent-side supervision.
//!
//! Core owns the wait: deadline enforcement, reaping and the raw evidence
//! the verdict is derived from.

pub mod supervisor;
pub mod types;
