//! Permission types and security context
//!
//! Foreign calls are gated per library or per symbol. A `SecurityContext`
//! denies everything it was not granted; `AllowAll` is the gate used when
//! no `[security]` section is configured.

use crate::ffi::types::{LibraryId, SymbolName};
use crate::security::audit::{AuditEvent, AuditLogger, NullAuditLogger};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Security errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecurityError {
    #[error("Permission denied: foreign call {library}::{symbol}")]
    ForeignCallDenied {
        library: LibraryId,
        symbol: SymbolName,
    },

    #[error("Invalid permission pattern: {0}")]
    InvalidPattern(String),
}

/// Permission types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Every symbol of a library; "*" matches every library
    ForeignLibrary { library: String },

    /// One symbol of one library
    ForeignSymbol { library: String, symbol: String },
}

impl Permission {
    /// Parse a grant: "library", "library::symbol" or "*"
    pub fn parse(grant: &str) -> Result<Self, SecurityError> {
        match grant.split_once("::") {
            Some((library, symbol)) if !library.is_empty() && !symbol.is_empty() => {
                Ok(Permission::ForeignSymbol {
                    library: library.to_string(),
                    symbol: symbol.to_string(),
                })
            }
            None if !grant.is_empty() => Ok(Permission::ForeignLibrary {
                library: grant.to_string(),
            }),
            _ => Err(SecurityError::InvalidPattern(grant.to_string())),
        }
    }

    /// Check if this permission allows calling `library::symbol`
    pub fn allows(&self, library: &LibraryId, symbol: &SymbolName) -> bool {
        match self {
            Permission::ForeignLibrary { library: allowed } => {
                allowed == "*" || allowed == library.as_str()
            }
            Permission::ForeignSymbol {
                library: allowed_lib,
                symbol: allowed_sym,
            } => allowed_lib == library.as_str() && allowed_sym == symbol.as_str(),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ForeignLibrary { library } => f.write_str(library),
            Permission::ForeignSymbol { library, symbol } => write!(f, "{}::{}", library, symbol),
        }
    }
}

/// Set of permissions
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    permissions: HashSet<Permission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, permission: Permission) {
        self.permissions.insert(permission);
    }

    pub fn is_granted(&self, library: &LibraryId, symbol: &SymbolName) -> bool {
        self.permissions.iter().any(|p| p.allows(library, symbol))
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    pub fn merge(&mut self, other: &PermissionSet) {
        self.permissions.extend(other.permissions.iter().cloned());
    }
}

/// Decides whether a foreign call may proceed
///
/// Consulted before any argument is marshalled.
pub trait CapabilityGate: Send + Sync {
    fn check(&self, library: &LibraryId, symbol: &SymbolName) -> Result<(), SecurityError>;
}

/// Gate that permits every call
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityGate for AllowAll {
    fn check(&self, _library: &LibraryId, _symbol: &SymbolName) -> Result<(), SecurityError> {
        Ok(())
    }
}

/// Security context managing foreign call grants (deny by default)
#[derive(Clone)]
pub struct SecurityContext {
    foreign: PermissionSet,
    audit_logger: Arc<dyn AuditLogger>,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self {
            foreign: PermissionSet::new(),
            audit_logger: Arc::new(NullAuditLogger::new()),
        }
    }
}

impl SecurityContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new security context with audit logging enabled
    pub fn with_audit_logger(logger: Arc<dyn AuditLogger>) -> Self {
        Self {
            foreign: PermissionSet::new(),
            audit_logger: logger,
        }
    }

    /// Context granting each of `grants` ("library", "library::symbol", "*")
    pub fn from_grants<S: AsRef<str>>(grants: &[S]) -> Result<Self, SecurityError> {
        let mut ctx = Self::new();
        for grant in grants {
            ctx.grant(Permission::parse(grant.as_ref())?);
        }
        Ok(ctx)
    }

    /// Permissive context
    ///
    /// **WARNING**: Only use for development/testing.
    pub fn allow_all() -> Self {
        let mut ctx = Self::new();
        ctx.grant_library("*");
        ctx
    }

    pub fn grant(&mut self, permission: Permission) {
        self.audit_logger.log(AuditEvent::GrantAdded {
            grant: permission.to_string(),
        });
        self.foreign.grant(permission);
    }

    pub fn grant_library(&mut self, library: impl Into<String>) {
        self.grant(Permission::ForeignLibrary {
            library: library.into(),
        });
    }

    pub fn grant_symbol(&mut self, library: impl Into<String>, symbol: impl Into<String>) {
        self.grant(Permission::ForeignSymbol {
            library: library.into(),
            symbol: symbol.into(),
        });
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.foreign
    }

    /// Get the audit logger (for testing)
    pub fn audit_logger(&self) -> Arc<dyn AuditLogger> {
        Arc::clone(&self.audit_logger)
    }
}

impl CapabilityGate for SecurityContext {
    fn check(&self, library: &LibraryId, symbol: &SymbolName) -> Result<(), SecurityError> {
        let target = (library.to_string(), symbol.to_string());
        if self.foreign.is_granted(library, symbol) {
            self.audit_logger.log(AuditEvent::ForeignCallGranted {
                library: target.0,
                symbol: target.1,
            });
            Ok(())
        } else {
            self.audit_logger.log(AuditEvent::ForeignCallDenied {
                library: target.0,
                symbol: target.1,
            });
            Err(SecurityError::ForeignCallDenied {
                library: library.clone(),
                symbol: symbol.clone(),
            })
        }
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("foreign", &self.foreign)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::audit::MemoryAuditLogger;
    use rstest::rstest;

    fn call(library: &str, symbol: &str) -> (LibraryId, SymbolName) {
        (LibraryId::new(library), SymbolName::new(symbol))
    }

    #[rstest]
    #[case("m", "m", "cos", true)]
    #[case("m", "libc", "cos", false)]
    #[case("*", "anything", "at_all", true)]
    #[case("m::cos", "m", "cos", true)]
    #[case("m::cos", "m", "sin", false)]
    fn test_permission_matching(
        #[case] grant: &str,
        #[case] library: &str,
        #[case] symbol: &str,
        #[case] allowed: bool,
    ) {
        let (lib, sym) = call(library, symbol);
        assert_eq!(Permission::parse(grant).unwrap().allows(&lib, &sym), allowed);
    }

    #[rstest]
    #[case("")]
    #[case("m::")]
    #[case("::cos")]
    fn test_malformed_grants(#[case] grant: &str) {
        assert!(matches!(
            Permission::parse(grant),
            Err(SecurityError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_security_context_default_denies() {
        let ctx = SecurityContext::new();
        let (lib, sym) = call("m", "cos");
        assert!(ctx.check(&lib, &sym).is_err());
    }

    #[test]
    fn test_from_grants() {
        let ctx = SecurityContext::from_grants(&["sqlite3", "m::cos"][..]).unwrap();
        assert_eq!(ctx.permissions().len(), 2);

        let (lib, sym) = call("sqlite3", "sqlite3_open");
        assert!(ctx.check(&lib, &sym).is_ok());
        let (lib, sym) = call("m", "cos");
        assert!(ctx.check(&lib, &sym).is_ok());
        let (lib, sym) = call("m", "sin");
        assert_eq!(
            ctx.check(&lib, &sym),
            Err(SecurityError::ForeignCallDenied {
                library: lib.clone(),
                symbol: sym.clone(),
            })
        );
    }

    #[test]
    fn test_allow_all() {
        let ctx = SecurityContext::allow_all();
        let (lib, sym) = call("libc", "getpid");
        assert!(ctx.check(&lib, &sym).is_ok());
        assert!(AllowAll.check(&lib, &sym).is_ok());
    }

    #[test]
    fn test_checks_are_audited() {
        let logger = Arc::new(MemoryAuditLogger::new());
        let mut ctx = SecurityContext::with_audit_logger(logger.clone());
        ctx.grant_symbol("m", "cos");

        let (lib, cos) = call("m", "cos");
        let sin = SymbolName::new("sin");
        ctx.check(&lib, &cos).unwrap();
        ctx.check(&lib, &sin).unwrap_err();

        let events: Vec<AuditEvent> = logger.entries().into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                AuditEvent::GrantAdded {
                    grant: "m::cos".to_string()
                },
                AuditEvent::ForeignCallGranted {
                    library: "m".to_string(),
                    symbol: "cos".to_string()
                },
                AuditEvent::ForeignCallDenied {
                    library: "m".to_string(),
                    symbol: "sin".to_string()
                },
            ]
        );
    }
}
