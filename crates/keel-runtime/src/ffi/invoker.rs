//! Native call invoker
//!
//! Executes a compiled plan against a linked function:
//!
//! 1. marshal every argument into a `MarshalFrame` (fail fast, nothing called)
//! 2. commit ownership transfers
//! 3. reset errno, cross the boundary with libffi, capture the side channel
//! 4. normalize the primary return through the declared error protocol
//! 5. wrap an owned handle return before anything else can fail
//! 6. read `Out` values back and assemble the caller-visible result
//!
//! The frame is dropped on every path, freeing transient buffers.
//!
//! `Cif`s are cached per thread and per table. A thread drops the cached
//! `Cif`s of tables that no longer exist the next time it calls into a
//! table it has not called before.

use crate::ffi::declaration::{DeclId, DeclarationTable};
use crate::ffi::error::FfiError;
use crate::ffi::linker::{BoundFunction, NativeBindings};
use crate::ffi::marshal::{self, CValue, MarshalError, MarshalFrame};
use crate::ffi::ownership::{self, NativeHandle};
use crate::ffi::plan::MarshalPlan;
use crate::ffi::protocol::{self, RawReturn, SideChannel};
use crate::ffi::types::{ForeignDeclaration, LibraryId, LogicalType};
use crate::value::Value;
use libffi::middle::{Arg, Cif, CodePtr, Type};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_char;
use std::sync::{Arc, Weak};

struct TableCifs {
    table: Weak<DeclarationTable>,
    cifs: HashMap<DeclId, Cif>,
}

thread_local! {
    static CIF_CACHE: RefCell<HashMap<u64, TableCifs>> = RefCell::new(HashMap::new());
}

fn with_cif<R>(
    table: &Arc<DeclarationTable>,
    id: DeclId,
    plan: &MarshalPlan,
    use_cif: impl FnOnce(&Cif) -> R,
) -> R {
    CIF_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if !cache.contains_key(&table.uid()) {
            cache.retain(|_, cached| cached.table.strong_count() > 0);
        }
        let cifs = &mut cache
            .entry(table.uid())
            .or_insert_with(|| TableCifs {
                table: Arc::downgrade(table),
                cifs: HashMap::new(),
            })
            .cifs;
        use_cif(cifs.entry(id).or_insert_with(|| build_cif(plan)))
    })
}

/// Whether this thread holds cached `Cif`s for the table with `uid`
#[cfg(test)]
fn caches_table(uid: u64) -> bool {
    CIF_CACHE.with(|cache| cache.borrow().contains_key(&uid))
}

fn ffi_type(ty: LogicalType) -> Type {
    match ty {
        LogicalType::Void => Type::void(),
        LogicalType::Bool | LogicalType::U8 => Type::u8(),
        LogicalType::I8 => Type::i8(),
        LogicalType::I16 => Type::i16(),
        LogicalType::U16 => Type::u16(),
        LogicalType::I32 => Type::i32(),
        LogicalType::U32 => Type::u32(),
        LogicalType::I64 => Type::i64(),
        LogicalType::U64 => Type::u64(),
        LogicalType::F32 => Type::f32(),
        LogicalType::F64 => Type::f64(),
        LogicalType::Size => Type::usize(),
        LogicalType::Text | LogicalType::Bytes | LogicalType::Handle => Type::pointer(),
    }
}

fn build_cif(plan: &MarshalPlan) -> Cif {
    Cif::new(
        plan.steps().iter().map(|step| ffi_type(step.native_type())),
        ffi_type(plan.return_step().logical_type),
    )
}

/// Clear the thread's errno so a stale value is never reported
fn reset_errno() {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        *libc::__errno_location() = 0;
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        *libc::__error() = 0;
    }
}

/// Perform the call, widening the return
///
/// # Safety
///
/// `code` must point to a function whose C signature matches `cif`.
unsafe fn call_raw(cif: &Cif, code: CodePtr, args: &[Arg], ty: LogicalType) -> RawReturn {
    match ty {
        LogicalType::Void => {
            cif.call::<()>(code, args);
            RawReturn::Void
        }
        LogicalType::Bool | LogicalType::U8 => {
            RawReturn::UInt(cif.call::<u8>(code, args) as u64)
        }
        LogicalType::U16 => RawReturn::UInt(cif.call::<u16>(code, args) as u64),
        LogicalType::U32 => RawReturn::UInt(cif.call::<u32>(code, args) as u64),
        LogicalType::U64 => RawReturn::UInt(cif.call::<u64>(code, args)),
        LogicalType::Size => RawReturn::UInt(cif.call::<usize>(code, args) as u64),
        LogicalType::I8 => RawReturn::Int(cif.call::<i8>(code, args) as i64),
        LogicalType::I16 => RawReturn::Int(cif.call::<i16>(code, args) as i64),
        LogicalType::I32 => RawReturn::Int(cif.call::<i32>(code, args) as i64),
        LogicalType::I64 => RawReturn::Int(cif.call::<i64>(code, args)),
        LogicalType::F32 => RawReturn::Float(cif.call::<f32>(code, args) as f64),
        LogicalType::F64 => RawReturn::Float(cif.call::<f64>(code, args)),
        LogicalType::Text | LogicalType::Bytes | LogicalType::Handle => {
            RawReturn::Pointer(cif.call::<usize>(code, args))
        }
    }
}

/// Executes plans against linked native functions
#[derive(Debug, Clone)]
pub struct Invoker {
    table: Arc<DeclarationTable>,
    bindings: Arc<NativeBindings>,
}

impl Invoker {
    pub fn new(table: Arc<DeclarationTable>, bindings: Arc<NativeBindings>) -> Self {
        Self { table, bindings }
    }

    pub fn table(&self) -> &DeclarationTable {
        &self.table
    }

    /// Call a declared function natively, bypassing override routing
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
        plan.check_args(args)
            .map_err(|e| e.into_ffi(&decl.library))?;
        self.call_checked(id, decl, &plan, args)
    }

    /// Native path for arguments that already passed `check_args`
    pub(crate) fn call_checked(
        &self,
        id: DeclId,
        decl: &ForeignDeclaration,
        plan: &MarshalPlan,
        args: &[Value],
    ) -> Result<Value, FfiError> {
        let source = &decl.library;
        let bound = self
            .bindings
            .get(id)
            .filter(|_| self.bindings.table_uid() == self.table.uid())
            .ok_or_else(|| {
                FfiError::unbound(
                    format!("'{}' has no linked native function", decl.symbol),
                    source.clone(),
                )
            })?;

        let mut frame = MarshalFrame::new(plan);
        let native_args = frame
            .marshal(plan, args)
            .map_err(|e| e.into_ffi(source))?;
        frame.commit().map_err(|e| e.into_ffi(source))?;

        let code = CodePtr::from_ptr(bound.address());
        let return_type = plan.return_step().logical_type;
        let (raw, side) = with_cif(&self.table, id, plan, |cif| {
            let ffi_args: Vec<_> = native_args
                .iter()
                .map(|value| match value {
                    CValue::I8(v) => Arg::new(v),
                    CValue::I16(v) => Arg::new(v),
                    CValue::I32(v) => Arg::new(v),
                    CValue::I64(v) => Arg::new(v),
                    CValue::U8(v) => Arg::new(v),
                    CValue::U16(v) => Arg::new(v),
                    CValue::U32(v) => Arg::new(v),
                    CValue::U64(v) => Arg::new(v),
                    CValue::F32(v) => Arg::new(v),
                    CValue::F64(v) => Arg::new(v),
                    CValue::Size(v) => Arg::new(v),
                    CValue::Pointer(v) => Arg::new(v),
                })
                .collect();
            reset_errno();
            // Safety: the linker bound this address to this declaration
            let raw = unsafe { call_raw(cif, code, &ffi_args, return_type) };
            (raw, SideChannel::capture())
        });
        tracing::trace!(symbol = %decl.symbol, ?raw, ?side, "native call returned");

        let raw = protocol::normalize(plan.protocol(), raw, &side, source)?;
        let primary = self
            .primary_value(decl, bound, raw)
            .map_err(|e| e.into_ffi(source))?;
        let outs = frame.read_outputs(plan).map_err(|e| e.into_ffi(source))?;
        Ok(plan.assemble(primary, outs))
    }

    /// Host value of the normalized primary return (`None` for void)
    fn primary_value(
        &self,
        decl: &ForeignDeclaration,
        bound: &BoundFunction,
        raw: RawReturn,
    ) -> Result<Option<Value>, MarshalError> {
        let ty = decl.return_spec.logical_type;
        let value = match raw {
            RawReturn::Void => return Ok(None),
            RawReturn::Int(v) => Value::Int(v),
            RawReturn::UInt(v) => marshal::unsigned_return("return", v, ty)?,
            RawReturn::Float(x) => Value::Float(x),
            RawReturn::Pointer(0) => Value::Null,
            RawReturn::Pointer(addr) if ty == LogicalType::Handle => {
                let finalizer = bound
                    .finalizer()
                    .cloned()
                    .ok_or_else(|| MarshalError::NullPointer("finalizer".to_string()))?;
                Value::Resource(ownership::wrap(NativeHandle::from_addr(addr), decl, finalizer))
            }
            // Safety: text returns are declared as `const char*`
            RawReturn::Pointer(addr) => unsafe {
                marshal::read_text("return", addr as *const c_char)?
            },
        };
        Ok(Some(value))
    }
}
