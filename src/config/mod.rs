//! Request model, validation and named syscall presets.

pub mod presets;
pub mod types;
pub mod validator;
