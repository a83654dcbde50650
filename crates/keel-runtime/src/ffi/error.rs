//! The uniform error value handed back to host code
//!
//! Every failure a foreign call can produce at call time (marshalling,
//! native-reported errors, override contract violations, released
//! resources, capability denials) surfaces as one `FfiError`. Its `code`,
//! `message` and `source` fields are the stable public contract.

use crate::ffi::types::LibraryId;

/// Category of an `FfiError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfiErrorKind {
    /// Reported by native code through its error protocol
    Native,
    /// Argument or result conversion failed; no native code ran
    Marshal,
    /// A released resource was used
    ReleasedResource,
    /// A test override returned a value the declaration cannot produce
    OverrideContract,
    /// A finalizer was missing or failed
    Finalizer,
    /// The capability gate refused the call
    Denied,
    /// The call does not name a declared, linked function
    Unbound,
}

/// FFI call error
#[derive(Debug, Clone, PartialEq)]
pub struct FfiError {
    /// Native error code, or one of the reserved negative codes below
    pub code: i64,
    pub message: String,
    /// Library the failing call was declared in
    pub source: LibraryId,
    pub kind: FfiErrorKind,
}

impl FfiError {
    /// Failure without a more specific code
    pub const GENERIC: i64 = -1;
    pub const MARSHAL: i64 = -1000;
    pub const RELEASED: i64 = -1001;
    pub const OVERRIDE_CONTRACT: i64 = -1002;
    pub const FINALIZER: i64 = -1003;
    pub const DENIED: i64 = -1004;
    pub const UNBOUND: i64 = -1005;

    /// Error reported by native code
    pub fn native(code: i64, message: impl Into<String>, source: LibraryId) -> Self {
        Self {
            code,
            message: message.into(),
            source,
            kind: FfiErrorKind::Native,
        }
    }

    pub fn marshal(message: impl Into<String>, source: LibraryId) -> Self {
        Self {
            code: Self::MARSHAL,
            message: message.into(),
            source,
            kind: FfiErrorKind::Marshal,
        }
    }

    pub fn released(message: impl Into<String>, source: LibraryId) -> Self {
        Self {
            code: Self::RELEASED,
            message: message.into(),
            source,
            kind: FfiErrorKind::ReleasedResource,
        }
    }

    pub fn override_contract(message: impl Into<String>, source: LibraryId) -> Self {
        Self {
            code: Self::OVERRIDE_CONTRACT,
            message: message.into(),
            source,
            kind: FfiErrorKind::OverrideContract,
        }
    }

    pub fn finalizer(message: impl Into<String>, source: LibraryId) -> Self {
        Self {
            code: Self::FINALIZER,
            message: message.into(),
            source,
            kind: FfiErrorKind::Finalizer,
        }
    }

    pub fn denied(message: impl Into<String>, source: LibraryId) -> Self {
        Self {
            code: Self::DENIED,
            message: message.into(),
            source,
            kind: FfiErrorKind::Denied,
        }
    }

    pub fn unbound(message: impl Into<String>, source: LibraryId) -> Self {
        Self {
            code: Self::UNBOUND,
            message: message.into(),
            source,
            kind: FfiErrorKind::Unbound,
        }
    }

    /// True when the error came from native code rather than this layer
    pub fn is_native(&self) -> bool {
        self.kind == FfiErrorKind::Native
    }
}

impl std::fmt::Display for FfiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (code {})", self.source, self.message, self.code)
    }
}

impl std::error::Error for FfiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_display() {
        let err = FfiError::native(7, "disk full", LibraryId::new("store"));
        assert_eq!(err.to_string(), "store: disk full (code 7)");
        assert!(err.is_native());
    }

    #[test]
    fn test_reserved_codes() {
        let lib = LibraryId::new("m");
        assert_eq!(FfiError::marshal("x", lib.clone()).code, FfiError::MARSHAL);
        assert_eq!(FfiError::released("x", lib.clone()).code, FfiError::RELEASED);
        assert_eq!(FfiError::denied("x", lib.clone()).kind, FfiErrorKind::Denied);
        assert!(!FfiError::unbound("x", lib).is_native());
    }
}
