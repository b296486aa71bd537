//! # Code
//!
//! Machine code generation for hooks

pub mod arm64;
