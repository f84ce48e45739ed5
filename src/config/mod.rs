//! Configuration constants
//!
//! Runtime settings live in [`crate::core::global_config`]; this module only
//! holds the compiled-in defaults they fall back to.

pub mod defaults;
