//! Capability gating for foreign calls
//!
//! When a project configures a `[security]` section, every foreign call is
//! denied unless a grant names its library or its symbol:
//!
//! ```
//! use keel_runtime::ffi::types::{LibraryId, SymbolName};
//! use keel_runtime::security::{CapabilityGate, SecurityContext};
//!
//! let mut ctx = SecurityContext::new();
//! ctx.grant_symbol("m", "cos");
//!
//! let m = LibraryId::new("m");
//! assert!(ctx.check(&m, &SymbolName::new("cos")).is_ok());
//! assert!(ctx.check(&m, &SymbolName::new("sin")).is_err());
//! ```

pub mod audit;
pub mod permissions;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, MemoryAuditLogger, NullAuditLogger};
pub use permissions::{
    AllowAll, CapabilityGate, Permission, PermissionSet, SecurityContext, SecurityError,
};
