//! Call routing and scope-local test overrides
//!
//! A `CallContext` is a per-thread stack of override frames. Installing an
//! override pushes a frame for the dynamic extent of a scope; leaving the
//! scope (normally, with an error, or by unwinding) pops it again. Nothing
//! is shared across threads unless a `ContextSnapshot` is carried over
//! explicitly.
//!
//! ```
//! use keel_runtime::ffi::router::{with_override, OverrideTarget};
//! use keel_runtime::value::Value;
//!
//! let result = with_override(
//!     OverrideTarget::symbol("m", "cos"),
//!     |_args: &[Value]| Ok(Value::Float(1.0)),
//!     || 42,
//! );
//! assert_eq!(result, 42);
//! ```

use crate::ffi::error::FfiError;
use crate::ffi::plan::MarshalPlan;
use crate::ffi::types::{LibraryId, SymbolName};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Replacement for a native function, called with caller-visible arguments
pub type Override = Arc<dyn Fn(&[Value]) -> Result<Value, FfiError> + Send + Sync>;

/// What an override replaces
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OverrideTarget {
    /// Every symbol of a library
    Library(LibraryId),
    /// One symbol
    Symbol(LibraryId, SymbolName),
}

impl OverrideTarget {
    pub fn library(library: impl Into<LibraryId>) -> Self {
        OverrideTarget::Library(library.into())
    }

    pub fn symbol(library: impl Into<LibraryId>, symbol: impl Into<SymbolName>) -> Self {
        OverrideTarget::Symbol(library.into(), symbol.into())
    }

    fn is_symbol(&self) -> bool {
        matches!(self, OverrideTarget::Symbol(..))
    }

    fn matches(&self, library: &LibraryId, symbol: &SymbolName) -> bool {
        match self {
            OverrideTarget::Library(lib) => lib == library,
            OverrideTarget::Symbol(lib, sym) => lib == library && sym == symbol,
        }
    }
}

impl fmt::Display for OverrideTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideTarget::Library(lib) => write!(f, "{}::*", lib),
            OverrideTarget::Symbol(lib, sym) => write!(f, "{}::{}", lib, sym),
        }
    }
}

#[derive(Clone)]
struct Frame {
    target: OverrideTarget,
    replacement: Override,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// The current thread's override scopes
pub struct CallContext;

impl CallContext {
    /// Install an override until the returned guard is dropped
    pub fn install<F>(target: OverrideTarget, replacement: F) -> OverrideGuard
    where
        F: Fn(&[Value]) -> Result<Value, FfiError> + Send + Sync + 'static,
    {
        Self::install_shared(target, Arc::new(replacement))
    }

    pub fn install_shared(target: OverrideTarget, replacement: Override) -> OverrideGuard {
        tracing::debug!(%target, "installing override");
        let depth = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(Frame {
                target,
                replacement,
            });
            frames.len() - 1
        });
        OverrideGuard {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Most specific active override for a symbol
    ///
    /// Symbol frames beat library frames; within each kind the innermost
    /// frame wins.
    pub fn resolve(library: &LibraryId, symbol: &SymbolName) -> Option<Override> {
        FRAMES.with(|frames| {
            let frames = frames.borrow();
            let innermost = |want_symbol: bool| {
                frames
                    .iter()
                    .rev()
                    .find(|f| {
                        f.target.is_symbol() == want_symbol && f.target.matches(library, symbol)
                    })
                    .map(|f| Arc::clone(&f.replacement))
            };
            innermost(true).or_else(|| innermost(false))
        })
    }

    /// Number of active frames on this thread
    pub fn depth() -> usize {
        FRAMES.with(|frames| frames.borrow().len())
    }

    /// Copy this thread's frames for explicit hand-off to another thread
    pub fn capture() -> ContextSnapshot {
        ContextSnapshot {
            frames: FRAMES.with(|frames| frames.borrow().clone()),
        }
    }
}

/// Active override scope; dropping it restores the previous mapping
///
/// Not `Send`: a scope belongs to the thread that opened it.
#[must_use = "the override is removed as soon as the guard is dropped"]
pub struct OverrideGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        // Also discards inner frames whose guards were leaked
        FRAMES.with(|frames| frames.borrow_mut().truncate(self.depth));
    }
}

/// Run `body` with an override installed, restoring the previous state on
/// every exit path
pub fn with_override<F, B, R>(target: OverrideTarget, replacement: F, body: B) -> R
where
    F: Fn(&[Value]) -> Result<Value, FfiError> + Send + Sync + 'static,
    B: FnOnce() -> R,
{
    let _guard = CallContext::install(target, replacement);
    body()
}

/// Frames captured on one thread, to be entered on another
#[derive(Clone)]
pub struct ContextSnapshot {
    frames: Vec<Frame>,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Run `body` with the captured frames stacked on top of the current ones
    pub fn enter<R>(&self, body: impl FnOnce() -> R) -> R {
        let depth = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            let depth = frames.len();
            frames.extend(self.frames.iter().cloned());
            depth
        });
        let _guard = OverrideGuard {
            depth,
            _not_send: PhantomData,
        };
        body()
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames.iter().map(|frame| frame.target.to_string()))
            .finish()
    }
}

/// Check an override's result against the shape the real call would produce
pub fn verify(plan: &MarshalPlan, value: &Value) -> Result<(), FfiError> {
    if plan.shape().accepts(value) {
        return Ok(());
    }
    Err(FfiError::override_contract(
        format!(
            "override for '{}' returned {} but the declaration produces {}",
            plan.symbol(),
            describe(value),
            plan.shape()
        ),
        plan.library().clone(),
    ))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Resource(r) if r.is_released() => "a released resource".to_string(),
        Value::Resource(r) => format!("a resource finalized by '{}'", r.finalizer_symbol()),
        Value::Tuple(items) => format!("a {}-tuple", items.len()),
        other => other.type_name().to_string(),
    }
}
