//! Value marshaling - host `Value` ↔ C representations
//!
//! - `narrow_scalar()`: range-checked conversion of a host number to a C scalar
//! - `MarshalFrame`: per-call storage for everything a native call points into
//! - `read_*()`: reading native results back into host values
//!
//! # Memory Safety
//!
//! - C strings, scratch slots and output buffers are owned by the frame
//! - Owned text handed to native code is `malloc`ed and freed on drop unless
//!   the transfer was committed
//! - Nothing is allocated for a call whose arguments fail validation

use crate::ffi::error::FfiError;
use crate::ffi::ownership::Resource;
use crate::ffi::plan::{LengthSource, MarshalPlan, MarshalStep, OutputRead};
use crate::ffi::types::{LibraryId, LogicalType};
use crate::value::Value;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;
use thiserror::Error;

/// Marshal error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarshalError {
    #[error("type mismatch for '{parameter}': expected {expected}, got {got}")]
    TypeMismatch {
        parameter: String,
        expected: String,
        got: String,
    },

    #[error("unexpected null pointer for '{0}'")]
    NullPointer(String),

    #[error("invalid string for '{parameter}': {reason}")]
    InvalidString { parameter: String, reason: String },

    #[error("number {value} out of range for {target} ('{parameter}')")]
    NumberOutOfRange {
        parameter: String,
        value: String,
        target: &'static str,
    },

    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("resource passed as '{parameter}' was already released")]
    ReleasedResource { parameter: String },

    #[error("resource passed as '{parameter}' is already handed over by another argument")]
    DuplicateTransfer { parameter: String },
}

impl MarshalError {
    /// Convert into the host-facing error for a call into `source`
    pub fn into_ffi(self, source: &LibraryId) -> FfiError {
        match self {
            MarshalError::ReleasedResource { .. } => {
                FfiError::released(self.to_string(), source.clone())
            }
            _ => FfiError::marshal(self.to_string(), source.clone()),
        }
    }
}

/// A marshalled native argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Size(usize),
    Pointer(*mut c_void),
}

impl CValue {
    /// Store the value at the start of a scratch slot
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of the value's width and suitably aligned.
    unsafe fn write_to(&self, slot: *mut u64) {
        match *self {
            CValue::I8(v) => slot.cast::<i8>().write(v),
            CValue::I16(v) => slot.cast::<i16>().write(v),
            CValue::I32(v) => slot.cast::<i32>().write(v),
            CValue::I64(v) => slot.cast::<i64>().write(v),
            CValue::U8(v) => slot.cast::<u8>().write(v),
            CValue::U16(v) => slot.cast::<u16>().write(v),
            CValue::U32(v) => slot.cast::<u32>().write(v),
            CValue::U64(v) => slot.cast::<u64>().write(v),
            CValue::F32(v) => slot.cast::<f32>().write(v),
            CValue::F64(v) => slot.cast::<f64>().write(v),
            CValue::Size(v) => slot.cast::<usize>().write(v),
            CValue::Pointer(v) => slot.cast::<*mut c_void>().write(v),
        }
    }
}

fn out_of_range(parameter: &str, value: impl ToString, target: LogicalType) -> MarshalError {
    MarshalError::NumberOutOfRange {
        parameter: parameter.to_string(),
        value: value.to_string(),
        target: target.display_name(),
    }
}

fn mismatch(parameter: &str, expected: LogicalType, got: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        parameter: parameter.to_string(),
        expected: expected.display_name().to_string(),
        got: got.type_name().to_string(),
    }
}

/// Integer view of a host number; integral floats are accepted
fn integer_of(parameter: &str, value: &Value, target: LogicalType) -> Result<i64, MarshalError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(x) => {
            // i64::MAX is not representable as f64; the bound is exclusive
            let in_range = *x >= i64::MIN as f64 && *x < i64::MAX as f64;
            if x.fract() == 0.0 && in_range {
                Ok(*x as i64)
            } else {
                Err(out_of_range(parameter, x, target))
            }
        }
        _ => Err(mismatch(parameter, target, value)),
    }
}

fn float_of(parameter: &str, value: &Value, target: LogicalType) -> Result<f64, MarshalError> {
    match value {
        Value::Float(x) => Ok(*x),
        Value::Int(i) => Ok(*i as f64),
        _ => Err(mismatch(parameter, target, value)),
    }
}

macro_rules! narrow_int {
    ($parameter:expr, $value:expr, $target:expr, $ty:ty, $variant:ident) => {
        <$ty>::try_from($value)
            .map(CValue::$variant)
            .map_err(|_| out_of_range($parameter, $value, $target))
    };
}

/// Convert a host value to a C scalar of type `target`
///
/// Integer narrowing never wraps. Float to `F32` may lose precision, but a
/// finite value outside the `f32` range is rejected.
pub fn narrow_scalar(
    parameter: &str,
    value: &Value,
    target: LogicalType,
) -> Result<CValue, MarshalError> {
    match target {
        LogicalType::Bool => match value {
            Value::Bool(b) => Ok(CValue::U8(u8::from(*b))),
            _ => Err(mismatch(parameter, target, value)),
        },
        LogicalType::F32 => {
            let x = float_of(parameter, value, target)?;
            if x.is_finite() && x.abs() > f32::MAX as f64 {
                return Err(out_of_range(parameter, x, target));
            }
            Ok(CValue::F32(x as f32))
        }
        LogicalType::F64 => Ok(CValue::F64(float_of(parameter, value, target)?)),
        LogicalType::I8 => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, i8, I8)
        }
        LogicalType::I16 => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, i16, I16)
        }
        LogicalType::I32 => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, i32, I32)
        }
        LogicalType::I64 => Ok(CValue::I64(integer_of(parameter, value, target)?)),
        LogicalType::U8 => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, u8, U8)
        }
        LogicalType::U16 => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, u16, U16)
        }
        LogicalType::U32 => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, u32, U32)
        }
        LogicalType::U64 => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, u64, U64)
        }
        LogicalType::Size => {
            let i = integer_of(parameter, value, target)?;
            narrow_int!(parameter, i, target, usize, Size)
        }
        LogicalType::Void | LogicalType::Text | LogicalType::Bytes | LogicalType::Handle => {
            Err(mismatch(parameter, target, value))
        }
    }
}

/// Validate a text argument without allocating
pub fn check_text(parameter: &str, value: &Value) -> Result<(), MarshalError> {
    match value {
        Value::Text(s) if s.contains('\0') => Err(MarshalError::InvalidString {
            parameter: parameter.to_string(),
            reason: "string contains an interior null byte".to_string(),
        }),
        Value::Text(_) => Ok(()),
        _ => Err(mismatch(parameter, LogicalType::Text, value)),
    }
}

pub fn check_bytes(parameter: &str, value: &Value) -> Result<(), MarshalError> {
    match value {
        Value::Bytes(_) => Ok(()),
        _ => Err(mismatch(parameter, LogicalType::Bytes, value)),
    }
}

/// The resource behind a handle argument, if it is still live
pub fn check_handle<'a>(parameter: &str, value: &'a Value) -> Result<&'a Resource, MarshalError> {
    match value {
        Value::Resource(r) if r.is_released() => Err(MarshalError::ReleasedResource {
            parameter: parameter.to_string(),
        }),
        Value::Resource(r) => Ok(r),
        _ => Err(mismatch(parameter, LogicalType::Handle, value)),
    }
}

/// Copy a native C string into a host value (`Null` for a null pointer)
///
/// # Safety
///
/// A non-null `ptr` must point to a valid null-terminated string.
pub unsafe fn read_text(parameter: &str, ptr: *const c_char) -> Result<Value, MarshalError> {
    if ptr.is_null() {
        return Ok(Value::Null);
    }
    let s = CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| MarshalError::InvalidString {
            parameter: parameter.to_string(),
            reason: format!("invalid UTF-8: {}", e),
        })?;
    Ok(Value::text(s))
}

/// Host value of an unsigned native integer; values above `i64::MAX` fail
fn unsigned_value(parameter: &str, v: u64, ty: LogicalType) -> Result<Value, MarshalError> {
    i64::try_from(v)
        .map(Value::Int)
        .map_err(|_| out_of_range(parameter, v, ty))
}

/// Read a scalar of type `ty` from the start of a scratch slot
///
/// # Safety
///
/// `slot` must be valid for reads of `ty`'s width and suitably aligned.
pub unsafe fn read_scalar(
    parameter: &str,
    slot: *const u64,
    ty: LogicalType,
) -> Result<Value, MarshalError> {
    let value = match ty {
        LogicalType::Bool => Value::Bool(slot.cast::<u8>().read() != 0),
        LogicalType::I8 => Value::Int(slot.cast::<i8>().read() as i64),
        LogicalType::I16 => Value::Int(slot.cast::<i16>().read() as i64),
        LogicalType::I32 => Value::Int(slot.cast::<i32>().read() as i64),
        LogicalType::I64 => Value::Int(slot.cast::<i64>().read()),
        LogicalType::U8 => Value::Int(slot.cast::<u8>().read() as i64),
        LogicalType::U16 => Value::Int(slot.cast::<u16>().read() as i64),
        LogicalType::U32 => Value::Int(slot.cast::<u32>().read() as i64),
        LogicalType::U64 => return unsigned_value(parameter, slot.read(), ty),
        LogicalType::Size => {
            return unsigned_value(parameter, slot.cast::<usize>().read() as u64, ty)
        }
        LogicalType::F32 => Value::Float(slot.cast::<f32>().read() as f64),
        LogicalType::F64 => Value::Float(slot.cast::<f64>().read()),
        LogicalType::Void | LogicalType::Text | LogicalType::Bytes | LogicalType::Handle => {
            return Err(MarshalError::TypeMismatch {
                parameter: parameter.to_string(),
                expected: "scalar".to_string(),
                got: ty.display_name().to_string(),
            })
        }
    };
    Ok(value)
}

/// Host value of a widened unsigned return
pub(crate) fn unsigned_return(
    parameter: &str,
    v: u64,
    ty: LogicalType,
) -> Result<Value, MarshalError> {
    match ty {
        LogicalType::Bool => Ok(Value::Bool(v != 0)),
        _ => unsigned_value(parameter, v, ty),
    }
}

/// Length written back by native code, clamped to the buffer capacity
fn written_length(raw: Value, capacity: usize) -> usize {
    match raw {
        Value::Int(n) if n > 0 => (n as u64).min(capacity as u64) as usize,
        _ => 0,
    }
}

/// Storage backing one native call
///
/// Tracks every allocation the native arguments point into, so the call
/// can fail or return on any path without leaking.
pub struct MarshalFrame {
    strings: Vec<CString>,
    words: Vec<Box<u64>>,
    out_buffers: Vec<Box<[u8]>>,
    /// `malloc`ed copies of owned text, freed on drop unless committed
    owned_text: Vec<*mut c_char>,
    /// Owned handles to hand over on commit
    transfers: Vec<(String, Resource)>,
}

impl MarshalFrame {
    /// Allocate the scratch slots and output buffers `plan` needs
    pub fn new(plan: &MarshalPlan) -> Self {
        Self {
            strings: Vec::new(),
            words: (0..plan.word_slots()).map(|_| Box::new(0u64)).collect(),
            out_buffers: plan
                .buffer_capacities()
                .iter()
                .map(|cap| vec![0u8; *cap].into_boxed_slice())
                .collect(),
            owned_text: Vec::new(),
            transfers: Vec::new(),
        }
    }

    /// Execute the plan's steps, producing one native argument per step
    ///
    /// `args` must outlive the native call: buffer arguments are passed
    /// by pointer into the caller's bytes.
    pub fn marshal(
        &mut self,
        plan: &MarshalPlan,
        args: &[Value],
    ) -> Result<Vec<CValue>, MarshalError> {
        if args.len() != plan.visible_arity() {
            return Err(MarshalError::ArityMismatch {
                expected: plan.visible_arity(),
                got: args.len(),
            });
        }

        let mut native = Vec::with_capacity(plan.steps().len());
        for step in plan.steps() {
            tracing::trace!(?step, "marshal step");
            let value = match *step {
                MarshalStep::Scalar { arg, ty } => {
                    narrow_scalar(plan.parameter_name(arg), &args[arg], ty)?
                }
                MarshalStep::Text { arg, transfer } => {
                    self.text(plan.parameter_name(arg), &args[arg], transfer)?
                }
                MarshalStep::Buffer { arg } => match &args[arg] {
                    Value::Bytes(b) => CValue::Pointer(b.as_ptr() as *mut c_void),
                    other => {
                        let name = plan.parameter_name(arg);
                        return Err(mismatch(name, LogicalType::Bytes, other));
                    }
                },
                MarshalStep::SynthesizedLength { ty, from } => {
                    let len = match from {
                        LengthSource::Arg(arg) => match &args[arg] {
                            Value::Bytes(b) => b.len(),
                            _ => 0,
                        },
                        LengthSource::Capacity(n) => n,
                    };
                    let len = i64::try_from(len).map_err(|_| out_of_range("length", len, ty))?;
                    narrow_scalar("length", &Value::Int(len), ty)?
                }
                MarshalStep::Handle { arg, transfer } => {
                    let name = plan.parameter_name(arg);
                    let resource = check_handle(name, &args[arg])?;
                    let handle = resource
                        .handle()
                        .map_err(|_| MarshalError::ReleasedResource {
                            parameter: name.to_string(),
                        })?;
                    if transfer {
                        self.transfers.push((name.to_string(), resource.clone()));
                    }
                    CValue::Pointer(handle.as_ptr())
                }
                MarshalStep::OutScalar { slot, ty, seed } => {
                    if let Some(arg) = seed {
                        let initial = narrow_scalar(plan.parameter_name(arg), &args[arg], ty)?;
                        // Safety: word slots are 8 bytes and 8-aligned
                        unsafe { initial.write_to(self.word_ptr(slot)) };
                    }
                    CValue::Pointer(self.word_ptr(slot).cast())
                }
                MarshalStep::OutText { slot } => CValue::Pointer(self.word_ptr(slot).cast()),
                MarshalStep::OutBuffer { slot, .. } => {
                    CValue::Pointer(self.out_buffers[slot].as_mut_ptr().cast())
                }
                MarshalStep::OutLength { slot, ty, capacity } => {
                    let cap = i64::try_from(capacity)
                        .map_err(|_| out_of_range("length", capacity, ty))?;
                    let seed = narrow_scalar("length", &Value::Int(cap), ty)?;
                    // Safety: word slots are 8 bytes and 8-aligned
                    unsafe { seed.write_to(self.word_ptr(slot)) };
                    CValue::Pointer(self.word_ptr(slot).cast())
                }
            };
            native.push(value);
        }
        Ok(native)
    }

    fn text(
        &mut self,
        parameter: &str,
        value: &Value,
        transfer: bool,
    ) -> Result<CValue, MarshalError> {
        check_text(parameter, value)?;
        let s = value.as_text().unwrap_or_default();
        let c_string = CString::new(s).map_err(|e| MarshalError::InvalidString {
            parameter: parameter.to_string(),
            reason: e.to_string(),
        })?;

        if !transfer {
            let ptr = c_string.as_ptr() as *mut c_void;
            self.strings.push(c_string);
            return Ok(CValue::Pointer(ptr));
        }

        // Native code takes ownership and releases with free()
        let bytes = c_string.as_bytes_with_nul();
        let copy = unsafe { libc::malloc(bytes.len()) as *mut c_char };
        if copy.is_null() {
            return Err(MarshalError::NullPointer(parameter.to_string()));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, copy, bytes.len())
        };
        self.owned_text.push(copy);
        Ok(CValue::Pointer(copy.cast()))
    }

    /// `malloc`ed text this frame still frees on drop
    pub fn owned_allocations(&self) -> usize {
        self.owned_text.len()
    }

    fn word_ptr(&mut self, slot: usize) -> *mut u64 {
        &mut *self.words[slot] as *mut u64
    }

    /// Hand every owned input over to native code
    ///
    /// Called after all steps marshalled and immediately before the call.
    /// Owned handles are revoked on the host side; owned text is no longer
    /// freed by the frame.
    pub fn commit(&mut self) -> Result<(), MarshalError> {
        for (i, (parameter, resource)) in self.transfers.iter().enumerate() {
            if resource.is_released() {
                return Err(MarshalError::ReleasedResource {
                    parameter: parameter.clone(),
                });
            }
            if self.transfers[..i].iter().any(|(_, r)| Arc::ptr_eq(r, resource)) {
                return Err(MarshalError::DuplicateTransfer {
                    parameter: parameter.clone(),
                });
            }
        }
        for (parameter, resource) in self.transfers.drain(..) {
            resource
                .transfer()
                .map_err(|_| MarshalError::ReleasedResource { parameter })?;
        }
        self.owned_text.clear();
        Ok(())
    }

    /// Read the `Out` values back in declaration order
    pub fn read_outputs(&self, plan: &MarshalPlan) -> Result<Vec<Value>, MarshalError> {
        let mut outs = Vec::with_capacity(plan.outputs().len());
        for output in plan.outputs() {
            let value = match output {
                OutputRead::Scalar { slot, ty, name } => unsafe {
                    read_scalar(name, &*self.words[*slot] as *const u64, *ty)?
                },
                OutputRead::Text { slot, name } => unsafe {
                    let slot = &*self.words[*slot] as *const u64;
                    read_text(name, slot.cast::<*const c_char>().read())?
                },
                OutputRead::Buffer { slot, length, name } => {
                    let buffer = &self.out_buffers[*slot];
                    let len = match length {
                        Some((word, ty)) => {
                            let slot = &*self.words[*word] as *const u64;
                            let raw = unsafe { read_scalar(name, slot, *ty)? };
                            written_length(raw, buffer.len())
                        }
                        None => buffer.len(),
                    };
                    Value::bytes(&buffer[..len])
                }
            };
            outs.push(value);
        }
        Ok(outs)
    }
}

impl Drop for MarshalFrame {
    fn drop(&mut self) {
        for ptr in self.owned_text.drain(..) {
            unsafe { libc::free(ptr.cast()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Value::Int(42), LogicalType::I32, CValue::I32(42))]
    #[case(Value::Int(-1), LogicalType::I8, CValue::I8(-1))]
    #[case(Value::Int(255), LogicalType::U8, CValue::U8(255))]
    #[case(Value::Float(7.0), LogicalType::I64, CValue::I64(7))]
    #[case(Value::Int(3), LogicalType::F64, CValue::F64(3.0))]
    #[case(Value::Bool(true), LogicalType::Bool, CValue::U8(1))]
    #[case(Value::Int(4096), LogicalType::Size, CValue::Size(4096))]
    fn test_narrow_accepts(
        #[case] value: Value,
        #[case] ty: LogicalType,
        #[case] expected: CValue,
    ) {
        assert_eq!(narrow_scalar("x", &value, ty), Ok(expected));
    }

    #[rstest]
    #[case(Value::Int(128), LogicalType::I8)]
    #[case(Value::Int(-1), LogicalType::U32)]
    #[case(Value::Int(i64::from(i32::MAX) + 1), LogicalType::I32)]
    #[case(Value::Int(-5), LogicalType::Size)]
    #[case(Value::Float(1.5), LogicalType::I32)]
    #[case(Value::Float(1e300), LogicalType::F32)]
    fn test_narrow_rejects_out_of_range(#[case] value: Value, #[case] ty: LogicalType) {
        assert!(matches!(
            narrow_scalar("x", &value, ty),
            Err(MarshalError::NumberOutOfRange { .. })
        ));
    }

    #[test]
    fn test_f32_precision_loss_is_silent() {
        let result = narrow_scalar("x", &Value::Float(0.1), LogicalType::F32).unwrap();
        assert_eq!(result, CValue::F32(0.1f32));
        let inf = narrow_scalar("x", &Value::Float(f64::INFINITY), LogicalType::F32).unwrap();
        assert_eq!(inf, CValue::F32(f32::INFINITY));
    }

    #[test]
    fn test_type_mismatch() {
        let err = narrow_scalar("count", &Value::text("hello"), LogicalType::I32).unwrap_err();
        assert!(matches!(err, MarshalError::TypeMismatch { .. }));
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn test_text_with_null_byte() {
        let err = check_text("s", &Value::text("hello\0world")).unwrap_err();
        assert!(matches!(err, MarshalError::InvalidString { .. }));
    }

    #[test]
    fn test_read_text() {
        let c_string = CString::new("hello").unwrap();
        let value = unsafe { read_text("ret", c_string.as_ptr()) }.unwrap();
        assert_eq!(value, Value::text("hello"));
        assert_eq!(unsafe { read_text("ret", std::ptr::null()) }.unwrap(), Value::Null);
    }

    #[test]
    fn test_read_scalar_from_slot() {
        let mut slot = Box::new(0u64);
        unsafe { CValue::I16(-300).write_to(&mut *slot) };
        let value = unsafe { read_scalar("n", &*slot, LogicalType::I16) }.unwrap();
        assert_eq!(value, Value::Int(-300));

        *slot = u64::MAX;
        assert!(unsafe { read_scalar("n", &*slot, LogicalType::U64) }.is_err());
    }

    fn plan_of(decl: &crate::ffi::types::ForeignDeclaration) -> MarshalPlan {
        let roles = crate::ffi::plan::classify(decl).unwrap();
        MarshalPlan::compile(decl, &roles)
    }

    #[test]
    fn test_failed_marshal_keeps_owned_text_for_drop() {
        use crate::ffi::types::{ForeignDeclaration, Ownership, ParameterSpec};

        let decl = ForeignDeclaration::new("log", "emit")
            .param(ParameterSpec::input("msg", LogicalType::Text).ownership(Ownership::Owned))
            .param(ParameterSpec::input("level", LogicalType::I8));
        let plan = plan_of(&decl);

        // The level fails after the message was copied for native code
        let mut frame = MarshalFrame::new(&plan);
        let err = frame
            .marshal(&plan, &[Value::text("hello"), Value::Int(1000)])
            .unwrap_err();
        assert!(matches!(err, MarshalError::NumberOutOfRange { .. }));
        assert_eq!(frame.owned_allocations(), 1);
        drop(frame);

        let mut frame = MarshalFrame::new(&plan);
        let native = frame
            .marshal(&plan, &[Value::text("hello"), Value::Int(2)])
            .unwrap();
        frame.commit().unwrap();
        assert_eq!(frame.owned_allocations(), 0);
        drop(frame);

        // Committed text now belongs to the callee
        match native[0] {
            CValue::Pointer(ptr) => unsafe {
                assert_eq!(CStr::from_ptr(ptr.cast()).to_str(), Ok("hello"));
                libc::free(ptr.cast());
            },
            other => panic!("expected a pointer, got {:?}", other),
        }
    }

    #[test]
    fn test_commit_refuses_duplicate_transfer() {
        use crate::ffi::ownership::{Finalizer, NativeHandle, OwnedResource};
        use crate::ffi::types::{ForeignDeclaration, Ownership, ParameterSpec};

        let decl = ForeignDeclaration::new("pool", "merge")
            .param(ParameterSpec::input("a", LogicalType::Handle).ownership(Ownership::Owned))
            .param(ParameterSpec::input("b", LogicalType::Handle).ownership(Ownership::Owned));
        let plan = plan_of(&decl);
        let resource = OwnedResource::new(
            NativeHandle::from_addr(0x50),
            LibraryId::new("pool"),
            Finalizer::new("close", |_| Ok(())),
        );
        let args = [
            Value::Resource(resource.clone()),
            Value::Resource(resource.clone()),
        ];

        let mut frame = MarshalFrame::new(&plan);
        frame.marshal(&plan, &args).unwrap();
        assert!(matches!(
            frame.commit(),
            Err(MarshalError::DuplicateTransfer { .. })
        ));
        assert!(!resource.is_released());
    }

    #[test]
    fn test_marshal_error_into_ffi() {
        let lib = LibraryId::new("m");
        let err = MarshalError::ArityMismatch { expected: 1, got: 2 }.into_ffi(&lib);
        assert_eq!(err.code, FfiError::MARSHAL);
        let err = MarshalError::ReleasedResource {
            parameter: "h".to_string(),
        }
        .into_ffi(&lib);
        assert_eq!(err.code, FfiError::RELEASED);
    }
}
