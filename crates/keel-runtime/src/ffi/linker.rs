//! Startup linking of declared symbols
//!
//! Every declared function is resolved to an address once, before the
//! first call. A missing function is fatal at this point; a missing
//! finalizer is not, it is bound as a finalizer that reports itself
//! missing when a resource is released.
//!
//! Finalizers from a dynamically loaded library hold that library, so a
//! resource that outlives its runtime can still be finalized.

use crate::ffi::declaration::{DeclId, DeclarationTable};
use crate::ffi::ownership::{Finalizer, KeepAlive};
use crate::ffi::types::{LibraryId, SymbolName};
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use thiserror::Error;

/// Link-time errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("failed to load library '{library}': {reason}")]
    LoadFailed { library: LibraryId, reason: String },

    #[error("symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound {
        library: LibraryId,
        symbol: SymbolName,
    },
}

/// Maps declared (library, symbol) pairs to code addresses
pub trait SymbolResolver: Send + Sync {
    fn resolve(
        &mut self,
        library: &LibraryId,
        symbol: &SymbolName,
    ) -> Result<*const c_void, LinkError>;

    /// Handle that keeps `library`'s code mapped while it is held
    ///
    /// `None` for code that is never unloaded (statically linked symbols).
    fn keep_alive(&self, _library: &LibraryId) -> Option<KeepAlive> {
        None
    }
}

/// Explicit symbol table, for statically linked functions and tests
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    symbols: HashMap<(LibraryId, SymbolName), usize>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function address
    ///
    /// The caller guarantees `address` is a function whose C signature
    /// matches the declaration it will be bound to.
    pub fn with(
        mut self,
        library: impl Into<LibraryId>,
        symbol: impl Into<SymbolName>,
        address: *const c_void,
    ) -> Self {
        self.insert(library, symbol, address);
        self
    }

    pub fn insert(
        &mut self,
        library: impl Into<LibraryId>,
        symbol: impl Into<SymbolName>,
        address: *const c_void,
    ) {
        self.symbols
            .insert((library.into(), symbol.into()), address as usize);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for StaticResolver {
    fn resolve(
        &mut self,
        library: &LibraryId,
        symbol: &SymbolName,
    ) -> Result<*const c_void, LinkError> {
        self.symbols
            .get(&(library.clone(), symbol.clone()))
            .map(|addr| *addr as *const c_void)
            .ok_or_else(|| LinkError::SymbolNotFound {
                library: library.clone(),
                symbol: symbol.clone(),
            })
    }
}

/// A linked function
#[derive(Debug, Clone)]
pub struct BoundFunction {
    address: usize,
    finalizer: Option<Finalizer>,
}

impl BoundFunction {
    pub fn address(&self) -> *const c_void {
        self.address as *const c_void
    }

    /// Finalizer for an owned-handle return
    pub fn finalizer(&self) -> Option<&Finalizer> {
        self.finalizer.as_ref()
    }
}

/// Resolved addresses for every declaration of one table
///
/// Keeps the resolver alive, so dynamically loaded libraries stay mapped
/// as long as the bindings exist.
pub struct NativeBindings {
    table_uid: u64,
    functions: Vec<BoundFunction>,
    _resolver: Box<dyn SymbolResolver>,
}

impl NativeBindings {
    pub fn table_uid(&self) -> u64 {
        self.table_uid
    }

    pub fn get(&self, id: DeclId) -> Option<&BoundFunction> {
        self.functions.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for NativeBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBindings")
            .field("table_uid", &self.table_uid)
            .field("functions", &self.functions.len())
            .finish_non_exhaustive()
    }
}

/// Resolve every declared symbol of `table`
pub fn link<R>(table: &DeclarationTable, mut resolver: R) -> Result<NativeBindings, LinkError>
where
    R: SymbolResolver + 'static,
{
    let mut functions = Vec::with_capacity(table.len());
    for (_, decl) in table.iter() {
        let address = resolver.resolve(&decl.library, decl.native_symbol())?;
        let finalizer = decl.finalizer.as_ref().map(|symbol| {
            match resolver.resolve(&decl.library, symbol) {
                Ok(ptr) => {
                    // Safety: finalizers are declared as `void fn(handle)`
                    let finalizer = unsafe { Finalizer::native(symbol.clone(), ptr) };
                    match resolver.keep_alive(&decl.library) {
                        Some(library) => finalizer.keeping(library),
                        None => finalizer,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        library = %decl.library,
                        finalizer = %symbol,
                        error = %e,
                        "finalizer could not be resolved; release will report it"
                    );
                    Finalizer::missing(symbol.clone())
                }
            }
        });
        tracing::debug!(
            library = %decl.library,
            symbol = %decl.symbol,
            native = %decl.native_symbol(),
            "linked"
        );
        functions.push(BoundFunction {
            address: address as usize,
            finalizer,
        });
    }

    Ok(NativeBindings {
        table_uid: table.uid(),
        functions,
        _resolver: Box::new(resolver),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::ownership::{NativeHandle, OwnedResource};
    use crate::ffi::types::{ForeignDeclaration, LogicalType, ParameterSpec, ReturnSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};

    extern "C" fn answer() -> i32 {
        42
    }

    extern "C" fn make() -> *mut c_void {
        std::ptr::null_mut()
    }

    #[test]
    fn test_missing_symbol_is_fatal() {
        let mut builder = DeclarationTable::builder();
        builder
            .register(
                ForeignDeclaration::new("t", "absent")
                    .param(ParameterSpec::input("x", LogicalType::I32))
                    .returns(ReturnSpec::new(LogicalType::I32)),
            )
            .unwrap();
        let table = builder.build();

        let err = link(&table, StaticResolver::new()).unwrap_err();
        assert!(matches!(err, LinkError::SymbolNotFound { .. }));
    }

    #[test]
    fn test_missing_finalizer_is_bound_as_missing() {
        let mut builder = DeclarationTable::builder();
        let id = builder
            .register(
                ForeignDeclaration::new("t", "make")
                    .returns(ReturnSpec::owned(LogicalType::Handle))
                    .finalizer("destroy"),
            )
            .unwrap();
        let answer_id = builder
            .register(
                ForeignDeclaration::new("t", "answer").returns(ReturnSpec::new(LogicalType::I32)),
            )
            .unwrap();
        let table = builder.build();

        let resolver = StaticResolver::new()
            .with("t", "make", make as *const c_void)
            .with("t", "answer", answer as *const c_void);
        let bindings = link(&table, resolver).unwrap();

        assert_eq!(bindings.table_uid(), table.uid());
        let bound = bindings.get(id).unwrap();
        assert_eq!(bound.finalizer().unwrap().symbol().as_str(), "destroy");
        assert!(bindings.get(answer_id).unwrap().finalizer().is_none());
        assert_eq!(
            bindings.get(answer_id).unwrap().address(),
            answer as *const c_void
        );
    }

    #[test]
    fn test_link_name_resolves_native_symbol() {
        let mut builder = DeclarationTable::builder();
        let id = builder
            .register(
                ForeignDeclaration::new("t", "the_answer")
                    .link_name("answer")
                    .returns(ReturnSpec::new(LogicalType::I32)),
            )
            .unwrap();
        let table = builder.build();

        let resolver = StaticResolver::new().with("t", "answer", answer as *const c_void);
        let bindings = link(&table, resolver).unwrap();
        assert_eq!(bindings.get(id).unwrap().address(), answer as *const c_void);

        let err = link(&table, StaticResolver::new()).unwrap_err();
        assert_eq!(
            err,
            LinkError::SymbolNotFound {
                library: LibraryId::new("t"),
                symbol: SymbolName::new("answer"),
            }
        );
    }

    static CLOSED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn close(_: *mut c_void) {
        CLOSED.fetch_add(1, Ordering::SeqCst);
    }

    /// Static symbols standing in for a library that unloads when released
    struct UnloadingResolver {
        symbols: StaticResolver,
        library: Arc<()>,
    }

    impl SymbolResolver for UnloadingResolver {
        fn resolve(
            &mut self,
            library: &LibraryId,
            symbol: &SymbolName,
        ) -> Result<*const c_void, LinkError> {
            self.symbols.resolve(library, symbol)
        }

        fn keep_alive(&self, _library: &LibraryId) -> Option<KeepAlive> {
            Some(self.library.clone())
        }
    }

    #[test]
    fn test_finalizer_keeps_library_loaded() {
        let mut builder = DeclarationTable::builder();
        let id = builder
            .register(
                ForeignDeclaration::new("t", "make")
                    .returns(ReturnSpec::owned(LogicalType::Handle))
                    .finalizer("close"),
            )
            .unwrap();
        let table = builder.build();

        let library = Arc::new(());
        let mapped: Weak<()> = Arc::downgrade(&library);
        let resolver = UnloadingResolver {
            symbols: StaticResolver::new()
                .with("t", "make", make as *const c_void)
                .with("t", "close", close as *const c_void),
            library,
        };
        let bindings = link(&table, resolver).unwrap();
        let finalizer = bindings.get(id).unwrap().finalizer().unwrap().clone();
        let resource =
            OwnedResource::new(NativeHandle::from_addr(0x20), LibraryId::new("t"), finalizer);

        drop(bindings);
        drop(table);
        assert!(mapped.upgrade().is_some());

        drop(resource);
        assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
        assert!(mapped.upgrade().is_none());
    }
}
