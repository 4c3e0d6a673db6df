//! Extensions to external libraries and the standard library.

pub mod error_stack;
pub mod result;
