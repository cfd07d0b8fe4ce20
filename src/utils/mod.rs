//! Utilities

pub mod fd_closure;
