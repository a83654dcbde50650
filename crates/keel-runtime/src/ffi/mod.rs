//! Foreign function layer
//!
//! - `declaration`: validated, immutable table of declared functions
//! - `plan`: marshal plans compiled once per declaration
//! - `marshal`: argument conversion and per-call scratch memory
//! - `ownership`: owned native handles and their finalizers
//! - `protocol`: error protocol normalization
//! - `router`: scope-local overrides for tests
//! - `loader` / `linker`: startup symbol resolution
//! - `invoker`: the native crossing, via libffi
//! - `runtime`: the host entry point tying these together
//!
//! # Safety
//!
//! All `unsafe` code lives in this module behind safe wrappers. A linked
//! address is trusted to match its declaration; declaring a signature
//! that differs from the native function is undefined behavior.

pub mod declaration;
pub mod error;
pub mod invoker;
pub mod linker;
pub mod loader;
pub mod manifest;
pub mod marshal;
pub mod ownership;
pub mod plan;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod types;

pub use declaration::{DeclError, DeclId, DeclarationTable, DeclarationTableBuilder};
pub use error::{FfiError, FfiErrorKind};
pub use invoker::Invoker;
pub use linker::{link, LinkError, NativeBindings, StaticResolver, SymbolResolver};
pub use loader::LibraryLoader;
pub use manifest::{Applied, BindingsManifest, ManifestError};
pub use marshal::MarshalError;
pub use ownership::{Finalizer, FinalizerError, KeepAlive, NativeHandle, OwnedResource, Resource};
pub use plan::{MarshalPlan, ReturnShape};
pub use protocol::{RawReturn, SideChannel};
pub use router::{with_override, CallContext, ContextSnapshot, OverrideGuard, OverrideTarget};
pub use runtime::{FfiRuntime, RuntimeError};
pub use types::{
    Direction, ErrorProtocol, ForeignDeclaration, LibraryDeclaration, LibraryId, LogicalType,
    Ownership, ParameterSpec, ReturnSpec, SymbolName,
};
