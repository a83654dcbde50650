//! Declaration table
//!
//! Declarations are registered into a `DeclarationTableBuilder` while the
//! program starts up, then frozen into an immutable `DeclarationTable`
//! that is shared read-only by every call. Marshal plans are compiled
//! lazily, once per declaration.

use crate::ffi::plan::{self, MarshalPlan, ParamRole};
use crate::ffi::types::{
    ErrorProtocol, ForeignDeclaration, LibraryDeclaration, LibraryId, LogicalType, Ownership,
    SymbolName,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Declaration-time errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeclError {
    #[error("duplicate declaration of '{symbol}' in library '{library}'")]
    DuplicateSymbol {
        library: LibraryId,
        symbol: SymbolName,
    },

    #[error("invalid ownership for parameter '{parameter}' of '{symbol}': {reason}")]
    InvalidOwnershipCombination {
        symbol: SymbolName,
        parameter: String,
        reason: String,
    },

    #[error(
        "cannot infer the length argument of buffer '{parameter}' in '{symbol}'; \
         declare it explicitly"
    )]
    AmbiguousLengthPairing { symbol: SymbolName, parameter: String },

    #[error("'{symbol}': a finalizer is required exactly when the return is an owned handle")]
    FinalizerMismatch { symbol: SymbolName },

    #[error("'{symbol}': error protocol {protocol} cannot judge a {return_type} return")]
    ProtocolMismatch {
        symbol: SymbolName,
        protocol: ErrorProtocol,
        return_type: LogicalType,
    },

    #[error("'{symbol}': parameter '{parameter}' of type {logical_type} cannot be in-out")]
    UnsupportedDirection {
        symbol: SymbolName,
        parameter: String,
        logical_type: LogicalType,
    },

    #[error("'{symbol}': output buffer '{parameter}' needs a capacity")]
    MissingCapacity { symbol: SymbolName, parameter: String },

    #[error(
        "'{symbol}': buffer '{parameter}' names length '{length}', \
         which is not a usable integer parameter"
    )]
    UnknownLengthParameter {
        symbol: SymbolName,
        parameter: String,
        length: String,
    },

    #[error("'{symbol}': {reason}")]
    UnsupportedReturn { symbol: SymbolName, reason: String },
}

/// Index of a registered declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(usize);

impl DeclId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for DeclId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry {
    decl: ForeignDeclaration,
    roles: Vec<ParamRole>,
    plan: OnceLock<Arc<MarshalPlan>>,
}

static NEXT_TABLE_UID: AtomicU64 = AtomicU64::new(1);

/// Collects declarations at startup
#[derive(Default)]
pub struct DeclarationTableBuilder {
    libraries: HashMap<LibraryId, LibraryDeclaration>,
    entries: Vec<Entry>,
    index: HashMap<(LibraryId, SymbolName), DeclId>,
}

impl DeclarationTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record library-wide defaults
    ///
    /// Defaults apply to declarations registered afterwards.
    pub fn declare_library(&mut self, library: LibraryDeclaration) -> &mut Self {
        self.libraries.insert(library.id.clone(), library);
        self
    }

    /// Validate and add a declaration
    pub fn register(&mut self, decl: ForeignDeclaration) -> Result<DeclId, DeclError> {
        let key = (decl.library.clone(), decl.symbol.clone());
        if self.index.contains_key(&key) {
            return Err(DeclError::DuplicateSymbol {
                library: decl.library,
                symbol: decl.symbol,
            });
        }

        let decl = self.apply_defaults(decl);
        validate_return(&decl)?;
        let roles = plan::classify(&decl)?;

        let id = DeclId(self.entries.len());
        tracing::debug!(
            library = %decl.library,
            symbol = %decl.symbol,
            protocol = %decl.error_protocol(),
            "registered foreign declaration"
        );
        self.entries.push(Entry {
            decl,
            roles,
            plan: OnceLock::new(),
        });
        self.index.insert(key, id);
        Ok(id)
    }

    fn apply_defaults(&self, mut decl: ForeignDeclaration) -> ForeignDeclaration {
        let defaults = self.libraries.get(&decl.library);
        if decl.error_protocol.is_none() {
            decl.error_protocol =
                Some(defaults.map(|l| l.default_protocol).unwrap_or_default());
        }
        if decl.finalizer.is_none() && decl.return_spec.is_owned_handle() {
            decl.finalizer = defaults.and_then(|l| l.default_finalizer.clone());
        }
        decl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the table
    pub fn build(self) -> DeclarationTable {
        DeclarationTable {
            uid: NEXT_TABLE_UID.fetch_add(1, Ordering::Relaxed),
            libraries: self.libraries,
            entries: self.entries,
            index: self.index,
        }
    }
}

fn validate_return(decl: &ForeignDeclaration) -> Result<(), DeclError> {
    let ret = &decl.return_spec;
    let unsupported = |reason: &str| DeclError::UnsupportedReturn {
        symbol: decl.symbol.clone(),
        reason: reason.to_string(),
    };

    match ret.logical_type {
        LogicalType::Bytes => {
            return Err(unsupported("byte buffers cannot be returned; use an out parameter"));
        }
        LogicalType::Handle if ret.ownership != Ownership::Owned => {
            return Err(DeclError::InvalidOwnershipCombination {
                symbol: decl.symbol.clone(),
                parameter: "return".to_string(),
                reason: "returned handles must be owned".to_string(),
            })
        }
        ty if ty != LogicalType::Handle && ret.ownership == Ownership::Owned => {
            return Err(DeclError::InvalidOwnershipCombination {
                symbol: decl.symbol.clone(),
                parameter: "return".to_string(),
                reason: format!("{} returns cannot be owned", ty),
            })
        }
        _ => {}
    }

    if ret.is_owned_handle() != decl.finalizer.is_some() {
        return Err(DeclError::FinalizerMismatch {
            symbol: decl.symbol.clone(),
        });
    }

    let protocol = decl.error_protocol();
    if !protocol.accepts(&ret.logical_type) {
        return Err(DeclError::ProtocolMismatch {
            symbol: decl.symbol.clone(),
            protocol,
            return_type: ret.logical_type,
        });
    }
    Ok(())
}

/// Immutable table of validated declarations
pub struct DeclarationTable {
    uid: u64,
    libraries: HashMap<LibraryId, LibraryDeclaration>,
    entries: Vec<Entry>,
    index: HashMap<(LibraryId, SymbolName), DeclId>,
}

impl DeclarationTable {
    pub fn builder() -> DeclarationTableBuilder {
        DeclarationTableBuilder::new()
    }

    /// Process-unique identity, used to key per-thread call caches
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn lookup(&self, library: &LibraryId, symbol: &SymbolName) -> Option<DeclId> {
        self.index
            .get(&(library.clone(), symbol.clone()))
            .copied()
    }

    pub fn declaration(&self, id: DeclId) -> Option<&ForeignDeclaration> {
        self.entries.get(id.0).map(|e| &e.decl)
    }

    pub fn library(&self, id: &LibraryId) -> Option<&LibraryDeclaration> {
        self.libraries.get(id)
    }

    /// Compiled plan for a declaration, built on first use
    pub fn plan_for(&self, id: DeclId) -> Option<Arc<MarshalPlan>> {
        let entry = self.entries.get(id.0)?;
        let plan = entry.plan.get_or_init(|| {
            tracing::trace!(symbol = %entry.decl.symbol, "compiling marshal plan");
            Arc::new(MarshalPlan::compile(&entry.decl, &entry.roles))
        });
        Some(Arc::clone(plan))
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeclId, &ForeignDeclaration)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (DeclId(i), &e.decl))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for DeclarationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclarationTable")
            .field("uid", &self.uid)
            .field("declarations", &self.entries.len())
            .finish()
    }
}
