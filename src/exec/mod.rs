//! Execution control
//!
//! Builds the child plan, forks, and drives the type-state pre-exec chain.

pub mod executor;
pub mod preexec;
