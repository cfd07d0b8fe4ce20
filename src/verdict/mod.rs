//! Result classification
//!
//! Derives outcomes as pure functions over the evidence of one run.

pub mod verdict;
