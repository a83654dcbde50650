//! Ownership & finalization of native handles
//!
//! Every handle a native call returns as `Owned` is wrapped in an
//! [`OwnedResource`] before host code can see it. The wrapper carries the
//! declared finalizer and runs it exactly once: either on an explicit
//! [`OwnedResource::release`], or when the last host owner drops it.
//!
//! # Invariants
//!
//! - `released` goes false → true exactly once.
//! - A finalizer that is missing or fails still leaves the resource
//!   released; it is never retried.
//! - Any use of a released resource fails instead of touching the handle.

use crate::ffi::error::FfiError;
use crate::ffi::types::{ForeignDeclaration, LibraryId, SymbolName};
use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Raw opaque native handle
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(*mut c_void);

// Safety: the handle is an opaque token; this layer never dereferences it
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    /// Handle from an address, mostly useful for fakes in tests
    pub fn from_addr(addr: usize) -> Self {
        Self(addr as *mut c_void)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }

    pub fn addr(&self) -> usize {
        self.0 as usize
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({:#x})", self.addr())
    }
}

/// Finalizer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FinalizerError {
    #[error("finalizer '{0}' is not linked")]
    Missing(SymbolName),

    #[error("finalizer '{symbol}' failed: {reason}")]
    Failed { symbol: SymbolName, reason: String },
}

/// Callable that releases a native handle
pub type FinalizerFn = Arc<dyn Fn(NativeHandle) -> Result<(), FinalizerError> + Send + Sync>;

/// Whatever keeps a finalizer's code mapped (a loaded library)
pub type KeepAlive = Arc<dyn Any + Send + Sync>;

/// A finalizer symbol together with the code that runs it
#[derive(Clone)]
pub struct Finalizer {
    symbol: SymbolName,
    call: FinalizerFn,
    owner: Option<KeepAlive>,
}

impl Finalizer {
    /// Finalizer backed by host code (test doubles, host-side pools)
    pub fn new<F>(symbol: impl Into<SymbolName>, f: F) -> Self
    where
        F: Fn(NativeHandle) -> Result<(), FinalizerError> + Send + Sync + 'static,
    {
        Self {
            symbol: symbol.into(),
            call: Arc::new(f),
            owner: None,
        }
    }

    /// Finalizer backed by a native `void fn(void*)`
    ///
    /// # Safety
    ///
    /// `fn_ptr` must point to a function with exactly the signature
    /// `extern "C" fn(*mut c_void)` that stays loaded while this finalizer
    /// (or any resource holding it) is alive. For code in a dynamically
    /// loaded library, pass the library to [`Finalizer::keeping`].
    pub unsafe fn native(symbol: impl Into<SymbolName>, fn_ptr: *const c_void) -> Self {
        let f: extern "C" fn(*mut c_void) = std::mem::transmute(fn_ptr);
        Self::new(symbol, move |handle: NativeHandle| {
            f(handle.as_ptr());
            Ok(())
        })
    }

    /// Hold `owner` for as long as any copy of this finalizer exists
    ///
    /// A resource drops its finalizer only after running it, so the owner
    /// outlives the last finalization.
    pub fn keeping(mut self, owner: KeepAlive) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Placeholder for a finalizer symbol that could not be resolved
    pub fn missing(symbol: impl Into<SymbolName>) -> Self {
        let symbol = symbol.into();
        let reported = symbol.clone();
        Self::new(symbol, move |_| Err(FinalizerError::Missing(reported.clone())))
    }

    pub fn symbol(&self) -> &SymbolName {
        &self.symbol
    }

    fn run(&self, handle: NativeHandle) -> Result<(), FinalizerError> {
        (self.call)(handle)
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("symbol", &self.symbol)
            .field("pinned", &self.owner.is_some())
            .finish_non_exhaustive()
    }
}

/// Host-tracked owner of a native handle
pub struct OwnedResource {
    raw_handle: NativeHandle,
    finalizer: Finalizer,
    library: LibraryId,
    released: AtomicBool,
}

/// Shared host reference to an owned resource; dropping the last one finalizes
pub type Resource = Arc<OwnedResource>;

impl OwnedResource {
    pub fn new(raw_handle: NativeHandle, library: LibraryId, finalizer: Finalizer) -> Resource {
        Arc::new(Self {
            raw_handle,
            finalizer,
            library,
            released: AtomicBool::new(false),
        })
    }

    /// The live handle, or an error once released or transferred
    pub fn handle(&self) -> Result<NativeHandle, FfiError> {
        if self.is_released() {
            return Err(FfiError::released(
                format!(
                    "resource finalized by '{}' was already released",
                    self.finalizer.symbol()
                ),
                self.library.clone(),
            ));
        }
        Ok(self.raw_handle)
    }

    /// Run the finalizer now
    ///
    /// The first call finalizes; every later call is a no-op returning `Ok`.
    /// A failing finalizer is reported but the resource stays released.
    pub fn release(&self) -> Result<(), FfiError> {
        if !self.mark_released() {
            return Ok(());
        }
        self.finalizer
            .run(self.raw_handle)
            .map_err(|e| FfiError::finalizer(e.to_string(), self.library.clone()))
    }

    /// Hand ownership to native code (an `Owned` input parameter)
    ///
    /// Marks the resource released without running the finalizer; the
    /// receiving native function is now responsible for cleanup.
    pub fn transfer(&self) -> Result<NativeHandle, FfiError> {
        if !self.mark_released() {
            return Err(FfiError::released(
                format!(
                    "cannot transfer resource finalized by '{}': already released",
                    self.finalizer.symbol()
                ),
                self.library.clone(),
            ));
        }
        Ok(self.raw_handle)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn finalizer_symbol(&self) -> &SymbolName {
        self.finalizer.symbol()
    }

    pub fn library(&self) -> &LibraryId {
        &self.library
    }

    /// Returns true for the caller that performed the false → true transition
    fn mark_released(&self) -> bool {
        self.released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for OwnedResource {
    fn drop(&mut self) {
        if !self.mark_released() {
            return;
        }
        // No caller to report to; log instead
        if let Err(e) = self.finalizer.run(self.raw_handle) {
            tracing::warn!(
                library = %self.library,
                finalizer = %self.finalizer.symbol(),
                error = %e,
                "finalizer failed during automatic cleanup"
            );
        }
    }
}

impl fmt::Debug for OwnedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedResource")
            .field("raw_handle", &self.raw_handle)
            .field("finalizer", self.finalizer.symbol())
            .field("library", &self.library)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Wrap a handle returned by `decl` with the finalizer bound for it
pub fn wrap(raw: NativeHandle, decl: &ForeignDeclaration, finalizer: Finalizer) -> Resource {
    debug_assert!(decl.return_spec.is_owned_handle());
    debug_assert_eq!(decl.finalizer.as_ref(), Some(finalizer.symbol()));
    tracing::trace!(
        library = %decl.library,
        symbol = %decl.symbol,
        handle = ?raw,
        "wrapping owned handle"
    );
    OwnedResource::new(raw, decl.library.clone(), finalizer)
}
