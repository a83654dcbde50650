//! Host entry point for foreign calls
//!
//! Every call goes through the same pipeline:
//!
//! 1. the capability gate (denials never reach marshalling)
//! 2. argument checks against the plan
//! 3. the call router: an active override replaces the native call,
//!    after owned handle arguments are transferred as the native path
//!    would transfer them
//! 4. the native invoker

use crate::ffi::declaration::{DeclId, DeclarationTable};
use crate::ffi::error::FfiError;
use crate::ffi::invoker::Invoker;
use crate::ffi::linker::{self, LinkError, NativeBindings};
use crate::ffi::loader::LibraryLoader;
use crate::ffi::manifest::{BindingsManifest, ManifestError};
use crate::ffi::router::{self, CallContext};
use crate::ffi::types::{LibraryId, SymbolName};
use crate::security::{AllowAll, CapabilityGate, SecurityContext, SecurityError};
use crate::value::Value;
use keel_config::Config;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors building a runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("invalid security configuration: {0}")]
    Security(#[from] SecurityError),
}

/// Declarations, their linked functions and the gate in front of them
#[derive(Clone)]
pub struct FfiRuntime {
    table: Arc<DeclarationTable>,
    invoker: Invoker,
    gate: Arc<dyn CapabilityGate>,
    verify_overrides: bool,
    /// Declarations skipped while loading manifests
    rejected: Arc<[ManifestError]>,
}

impl FfiRuntime {
    /// Runtime permitting every call, with override verification on
    pub fn new(table: Arc<DeclarationTable>, bindings: Arc<NativeBindings>) -> Self {
        Self {
            invoker: Invoker::new(Arc::clone(&table), bindings),
            table,
            gate: Arc::new(AllowAll),
            verify_overrides: true,
            rejected: Arc::from(Vec::new()),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn CapabilityGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Turn the override return-shape check on or off
    pub fn verify_overrides(mut self, verify: bool) -> Self {
        self.verify_overrides = verify;
        self
    }

    /// Load manifests, link every declaration and pick the gate
    ///
    /// An invalid declaration is skipped and reported by [`rejected`];
    /// an unreadable manifest or an unresolved symbol fails the runtime.
    /// Without a `[security]` section every call is allowed; with one,
    /// only the listed grants are.
    ///
    /// [`rejected`]: FfiRuntime::rejected
    pub fn from_config(config: &Config) -> Result<Self, RuntimeError> {
        let mut builder = DeclarationTable::builder();
        let mut loader = LibraryLoader::with_search_paths(config.search_paths());
        let mut rejected = Vec::new();

        for path in config.manifests() {
            let manifest = BindingsManifest::load(&path)?;
            let applied = manifest.apply(&mut builder);
            tracing::debug!(
                manifest = %path.display(),
                registered = applied.registered.len(),
                rejected = applied.rejected.len(),
                "applied bindings manifest"
            );
            rejected.extend(applied.rejected_in(&path));
            for (library, file) in manifest.library_paths() {
                loader.register_path(library, file);
            }
        }

        let table = builder.build();
        let bindings = linker::link(&table, loader)?;
        tracing::info!(functions = bindings.len(), "linked foreign declarations");

        let gate: Arc<dyn CapabilityGate> = if config.restricts_foreign_calls() {
            Arc::new(SecurityContext::from_grants(config.foreign_grants())?)
        } else {
            Arc::new(AllowAll)
        };

        let mut runtime = Self::new(Arc::new(table), Arc::new(bindings))
            .with_gate(gate)
            .verify_overrides(config.verify_overrides());
        runtime.rejected = Arc::from(rejected);
        Ok(runtime)
    }

    /// Declarations that failed validation while loading manifests
    pub fn rejected(&self) -> &[ManifestError] {
        &self.rejected
    }

    pub fn table(&self) -> &DeclarationTable {
        &self.table
    }

    pub fn lookup(&self, library: &str, symbol: &str) -> Option<DeclId> {
        self.table
            .lookup(&LibraryId::new(library), &SymbolName::new(symbol))
    }

    /// Call a declared function by library and symbol name
    pub fn call_symbol(
        &self,
        library: &str,
        symbol: &str,
        args: &[Value],
    ) -> Result<Value, FfiError> {
        let id = self.lookup(library, symbol).ok_or_else(|| {
            FfiError::unbound(
                format!("'{}' is not declared in library '{}'", symbol, library),
                LibraryId::new(library),
            )
        })?;
        self.call(id, args)
    }

    /// Call a declared function
    pub fn call(&self, id: DeclId, args: &[Value]) -> Result<Value, FfiError> {
        let decl = self.table.declaration(id).ok_or_else(|| {
            FfiError::unbound(
                format!("unknown declaration {}", id),
                LibraryId::new("<unknown>"),
            )
        })?;
        let plan = self.table.plan_for(id).ok_or_else(|| {
            FfiError::unbound(format!("unknown declaration {}", id), decl.library.clone())
        })?;

        let span = tracing::debug_span!(
            "foreign_call",
            library = %decl.library,
            symbol = %decl.symbol
        );
        let _enter = span.enter();

        if let Err(denied) = self.gate.check(&decl.library, &decl.symbol) {
            tracing::warn!(error = %denied, "foreign call denied");
            return Err(FfiError::denied(denied.to_string(), decl.library.clone()));
        }

        plan.check_args(args)
            .map_err(|e| e.into_ffi(&decl.library))?;

        if let Some(replacement) = CallContext::resolve(&decl.library, &decl.symbol) {
            tracing::debug!("routed to override");
            for arg in plan.transferred_handles() {
                if let Value::Resource(resource) = &args[arg] {
                    resource.transfer()?;
                }
            }
            let value = replacement(args)?;
            if self.verify_overrides {
                router::verify(&plan, &value)?;
            }
            return Ok(value);
        }

        self.invoker.call_checked(id, decl, &plan, args)
    }
}

impl fmt::Debug for FfiRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfiRuntime")
            .field("declarations", &self.table.len())
            .field("verify_overrides", &self.verify_overrides)
            .field("rejected", &self.rejected.len())
            .finish_non_exhaustive()
    }
}
