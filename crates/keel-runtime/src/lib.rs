//! Keel Runtime - ownership-tracking foreign function layer
//!
//! This library lets host code call native C-ABI functions safely:
//! - Declarations validated once into an immutable table
//! - Marshal plans compiled per declaration
//! - Owned native handles finalized exactly once
//! - Native error conventions normalized into one error type
//! - Scope-local overrides that replace native calls in tests

/// Keel runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ffi;
pub mod logging;
pub mod security;
pub mod value;

pub use ffi::{FfiError, FfiErrorKind, FfiRuntime};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }
}
