//! Marshal plan compiler
//!
//! A declaration is classified once at registration (`classify`), which is
//! where every direction, ownership and length-pairing rule is checked. The
//! classified parameters compile into a `MarshalPlan`: one `MarshalStep` per
//! native argument, the output read-back list and the caller-visible return
//! shape. Plans are built once per declaration and shared by every call.

use crate::ffi::declaration::DeclError;
use crate::ffi::marshal::{self, MarshalError};
use crate::ffi::ownership::Resource;
use crate::ffi::types::{
    Direction, ErrorProtocol, ForeignDeclaration, LibraryId, LogicalType, Ownership, SymbolName,
};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Validated role of one declared parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    Scalar,
    Text { transfer: bool },
    Buffer,
    Handle { transfer: bool },
    /// Length partner of the buffer at this declaration index; hidden from callers
    Length { buffer: usize },
    /// `Out` scalar; `seed` for `InOut`
    OutScalar { seed: bool },
    OutText,
    OutBuffer { capacity: usize },
}

impl ParamRole {
    fn is_visible(&self) -> bool {
        matches!(
            self,
            ParamRole::Scalar
                | ParamRole::Text { .. }
                | ParamRole::Buffer
                | ParamRole::Handle { .. }
                | ParamRole::OutScalar { seed: true }
        )
    }
}

/// Where a synthesized length comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthSource {
    /// Byte length of the visible argument at this index
    Arg(usize),
    /// Fixed capacity of an output buffer
    Capacity(usize),
}

/// One native argument's conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalStep {
    /// Range-checked numeric or boolean argument
    Scalar { arg: usize, ty: LogicalType },
    /// Null-terminated copy; `transfer` hands a `malloc`ed copy to native code
    Text { arg: usize, transfer: bool },
    /// Pointer half of a pointer+length pair
    Buffer { arg: usize },
    /// Length half, filled in from the buffer
    SynthesizedLength { ty: LogicalType, from: LengthSource },
    /// Live handle of a resource; `transfer` revokes the host wrapper
    Handle { arg: usize, transfer: bool },
    /// Pointer to a scratch slot, seeded from the caller for `InOut`
    OutScalar {
        slot: usize,
        ty: LogicalType,
        seed: Option<usize>,
    },
    /// Pointer to a `char*` slot the native side fills in
    OutText { slot: usize },
    /// Pointer to a zeroed buffer of `capacity` bytes
    OutBuffer { slot: usize, capacity: usize },
    /// Pointer to a length slot seeded with the buffer capacity
    OutLength {
        slot: usize,
        ty: LogicalType,
        capacity: usize,
    },
}

impl MarshalStep {
    /// Type the native function sees for this argument
    pub fn native_type(&self) -> LogicalType {
        match self {
            MarshalStep::Scalar { ty, .. } | MarshalStep::SynthesizedLength { ty, .. } => *ty,
            _ => LogicalType::Handle,
        }
    }
}

/// Read-back of one `Out` value after the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRead {
    Scalar {
        slot: usize,
        ty: LogicalType,
        name: String,
    },
    Text {
        slot: usize,
        name: String,
    },
    Buffer {
        slot: usize,
        /// Word slot and type of a written-back length
        length: Option<(usize, LogicalType)>,
        name: String,
    },
}

/// Primary return conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnStep {
    pub logical_type: LogicalType,
    /// Finalizer for an owned handle return
    pub finalizer: Option<SymbolName>,
}

/// Caller-visible shape of a call's result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnShape {
    Null,
    Scalar(LogicalType),
    /// Text, or `Null` for a null pointer
    Text,
    Bytes,
    Resource {
        finalizer: SymbolName,
        nullable: bool,
    },
    Tuple(Vec<ReturnShape>),
}

impl ReturnShape {
    /// Whether a host value could have been produced by a call of this shape
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ReturnShape::Null, Value::Null) => true,
            (ReturnShape::Scalar(LogicalType::Bool), Value::Bool(_)) => true,
            (ReturnShape::Scalar(ty), Value::Int(_)) if ty.is_integral() => {
                marshal::narrow_scalar("return", value, *ty).is_ok()
            }
            (ReturnShape::Scalar(ty), Value::Float(_)) => ty.is_float(),
            (ReturnShape::Text, Value::Text(_) | Value::Null) => true,
            (ReturnShape::Bytes, Value::Bytes(_)) => true,
            (ReturnShape::Resource { finalizer, .. }, Value::Resource(r)) => {
                r.finalizer_symbol() == finalizer && !r.is_released()
            }
            (ReturnShape::Resource { nullable, .. }, Value::Null) => *nullable,
            (ReturnShape::Tuple(shapes), Value::Tuple(values)) => {
                shapes.len() == values.len()
                    && shapes.iter().zip(values).all(|(s, v)| s.accepts(v))
            }
            _ => false,
        }
    }
}

impl fmt::Display for ReturnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnShape::Null => write!(f, "void"),
            ReturnShape::Scalar(ty) => write!(f, "{}", ty),
            ReturnShape::Text => write!(f, "c_text"),
            ReturnShape::Bytes => write!(f, "c_bytes"),
            ReturnShape::Resource { finalizer, .. } => write!(f, "owned c_handle~{}", finalizer),
            ReturnShape::Tuple(shapes) => {
                write!(f, "(")?;
                for (i, shape) in shapes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", shape)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A caller-visible parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleParam {
    pub name: String,
    pub logical_type: LogicalType,
    role: ParamRole,
    /// Buffer whose length is synthesized
    paired: bool,
}

/// Classify every parameter of a declaration, checking direction,
/// ownership and length-pairing rules
pub fn classify(decl: &ForeignDeclaration) -> Result<Vec<ParamRole>, DeclError> {
    let mut roles = Vec::with_capacity(decl.parameters.len());
    for param in &decl.parameters {
        roles.push(classify_parameter(decl, param)?);
    }
    pair_lengths(decl, &mut roles)?;
    Ok(roles)
}

fn classify_parameter(
    decl: &ForeignDeclaration,
    param: &crate::ffi::types::ParameterSpec,
) -> Result<ParamRole, DeclError> {
    let invalid = |reason: &str| DeclError::InvalidOwnershipCombination {
        symbol: decl.symbol.clone(),
        parameter: param.name.clone(),
        reason: reason.to_string(),
    };
    let unsupported = || DeclError::UnsupportedDirection {
        symbol: decl.symbol.clone(),
        parameter: param.name.clone(),
        logical_type: param.logical_type,
    };

    let ty = param.logical_type;
    if ty == LogicalType::Void {
        return Err(invalid("void is not a parameter type"));
    }
    if param.ownership == Ownership::Owned {
        if param.direction != Direction::In {
            return Err(invalid("owned parameters must be inputs"));
        }
        if !matches!(ty, LogicalType::Text | LogicalType::Handle) {
            return Err(invalid("only text and handles can transfer ownership"));
        }
    }

    let transfer = param.ownership == Ownership::Owned;
    let role = match (ty, param.direction) {
        (LogicalType::Handle, Direction::In) => {
            if param.ownership == Ownership::None {
                return Err(invalid("handle parameters must be owned or borrowed"));
            }
            ParamRole::Handle { transfer }
        }
        (LogicalType::Handle, _) => return Err(invalid("handles cannot be written back")),
        (LogicalType::Text, Direction::In) => ParamRole::Text { transfer },
        (LogicalType::Text, Direction::Out) => ParamRole::OutText,
        (LogicalType::Bytes, Direction::In) => ParamRole::Buffer,
        (LogicalType::Bytes, Direction::Out) => match param.capacity {
            Some(capacity) => ParamRole::OutBuffer { capacity },
            None => {
                return Err(DeclError::MissingCapacity {
                    symbol: decl.symbol.clone(),
                    parameter: param.name.clone(),
                })
            }
        },
        (LogicalType::Text | LogicalType::Bytes, Direction::InOut) => return Err(unsupported()),
        (_, Direction::In) => ParamRole::Scalar,
        (_, Direction::Out) => ParamRole::OutScalar { seed: false },
        (_, Direction::InOut) => ParamRole::OutScalar { seed: true },
    };
    Ok(role)
}

/// Can parameter `len` carry the length of buffer `buffer`?
fn length_compatible(
    decl: &ForeignDeclaration,
    roles: &[ParamRole],
    buffer: usize,
    len: usize,
    require_size: bool,
) -> bool {
    let p = &decl.parameters[len];
    let type_ok = if require_size {
        p.logical_type == LogicalType::Size
    } else {
        p.logical_type.is_integral()
    };
    let direction_ok = match roles[buffer] {
        ParamRole::Buffer => roles[len] == ParamRole::Scalar,
        ParamRole::OutBuffer { .. } => {
            matches!(roles[len], ParamRole::Scalar | ParamRole::OutScalar { seed: true })
        }
        _ => false,
    };
    type_ok && direction_ok
}

fn pair_lengths(decl: &ForeignDeclaration, roles: &mut [ParamRole]) -> Result<(), DeclError> {
    let buffers: Vec<usize> = roles
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r, ParamRole::Buffer | ParamRole::OutBuffer { .. }))
        .map(|(i, _)| i)
        .collect();
    let mut claimed = vec![false; roles.len()];
    let mut paired = vec![false; roles.len()];

    // Explicit pairings first
    for &b in &buffers {
        let Some(name) = decl.parameters[b].length.as_deref() else {
            continue;
        };
        let unknown = || DeclError::UnknownLengthParameter {
            symbol: decl.symbol.clone(),
            parameter: decl.parameters[b].name.clone(),
            length: name.to_string(),
        };
        let len = decl.parameter_index(name).ok_or_else(unknown)?;
        if !length_compatible(decl, roles, b, len, false) {
            return Err(unknown());
        }
        if claimed[len] {
            return Err(DeclError::AmbiguousLengthPairing {
                symbol: decl.symbol.clone(),
                parameter: decl.parameters[b].name.clone(),
            });
        }
        claimed[len] = true;
        paired[b] = true;
        roles[len] = ParamRole::Length { buffer: b };
    }

    // Then an unclaimed size_t right after the buffer
    for &b in &buffers {
        let next = b + 1;
        if paired[b] || next >= roles.len() || claimed[next] {
            continue;
        }
        if length_compatible(decl, roles, b, next, true) {
            claimed[next] = true;
            paired[b] = true;
            roles[next] = ParamRole::Length { buffer: b };
        }
    }

    // Finally, one leftover buffer and one leftover size_t
    let unpaired: Vec<usize> = buffers.iter().copied().filter(|b| !paired[*b]).collect();
    let Some(&first) = unpaired.first() else {
        return Ok(());
    };
    let candidates: Vec<usize> = (0..roles.len())
        .filter(|i| !claimed[*i] && decl.parameters[*i].logical_type == LogicalType::Size)
        .collect();
    if unpaired.len() == 1
        && candidates.len() == 1
        && length_compatible(decl, roles, first, candidates[0], true)
    {
        roles[candidates[0]] = ParamRole::Length { buffer: first };
        return Ok(());
    }
    Err(DeclError::AmbiguousLengthPairing {
        symbol: decl.symbol.clone(),
        parameter: decl.parameters[first].name.clone(),
    })
}

/// Compiled, reusable conversion program for one declaration
#[derive(Debug, Clone, PartialEq)]
pub struct MarshalPlan {
    library: LibraryId,
    symbol: SymbolName,
    protocol: ErrorProtocol,
    steps: Vec<MarshalStep>,
    visible: Vec<VisibleParam>,
    outputs: Vec<OutputRead>,
    return_step: ReturnStep,
    shape: ReturnShape,
    word_slots: usize,
    buffer_capacities: Vec<usize>,
}

impl MarshalPlan {
    /// Compile a registered declaration from its validated roles
    pub fn compile(decl: &ForeignDeclaration, roles: &[ParamRole]) -> Self {
        let params = &decl.parameters;

        // Caller-visible argument index per declaration index
        let mut arg_of = vec![None; params.len()];
        let mut visible = Vec::new();
        for (i, role) in roles.iter().enumerate() {
            if role.is_visible() {
                arg_of[i] = Some(visible.len());
                visible.push(VisibleParam {
                    name: params[i].name.clone(),
                    logical_type: params[i].logical_type,
                    role: *role,
                    paired: roles
                        .iter()
                        .any(|r| *r == ParamRole::Length { buffer: i }),
                });
            }
        }

        // Scratch storage per declaration index
        let mut word_of = vec![None; params.len()];
        let mut buffer_of = vec![None; params.len()];
        let mut word_slots = 0;
        let mut buffer_capacities = Vec::new();
        for (i, role) in roles.iter().enumerate() {
            match role {
                ParamRole::OutScalar { .. } | ParamRole::OutText => {
                    word_of[i] = Some(word_slots);
                    word_slots += 1;
                }
                ParamRole::Length { buffer } if params[i].direction == Direction::InOut => {
                    if matches!(roles[*buffer], ParamRole::OutBuffer { .. }) {
                        word_of[i] = Some(word_slots);
                        word_slots += 1;
                    }
                }
                ParamRole::OutBuffer { capacity } => {
                    buffer_of[i] = Some(buffer_capacities.len());
                    buffer_capacities.push(*capacity);
                }
                _ => {}
            }
        }

        let mut steps = Vec::with_capacity(params.len());
        let mut outputs = Vec::new();
        for (i, role) in roles.iter().enumerate() {
            let ty = params[i].logical_type;
            let arg = arg_of[i].unwrap_or_default();
            let step = match *role {
                ParamRole::Scalar => MarshalStep::Scalar { arg, ty },
                ParamRole::Text { transfer } => MarshalStep::Text { arg, transfer },
                ParamRole::Buffer => MarshalStep::Buffer { arg },
                ParamRole::Handle { transfer } => MarshalStep::Handle { arg, transfer },
                ParamRole::Length { buffer } => match (roles[buffer], word_of[i]) {
                    (ParamRole::OutBuffer { capacity }, Some(slot)) => {
                        MarshalStep::OutLength { slot, ty, capacity }
                    }
                    (ParamRole::OutBuffer { capacity }, None) => MarshalStep::SynthesizedLength {
                        ty,
                        from: LengthSource::Capacity(capacity),
                    },
                    _ => MarshalStep::SynthesizedLength {
                        ty,
                        from: LengthSource::Arg(arg_of[buffer].unwrap_or_default()),
                    },
                },
                ParamRole::OutScalar { seed } => {
                    let slot = word_of[i].unwrap_or_default();
                    outputs.push(OutputRead::Scalar {
                        slot,
                        ty,
                        name: params[i].name.clone(),
                    });
                    MarshalStep::OutScalar {
                        slot,
                        ty,
                        seed: if seed { arg_of[i] } else { None },
                    }
                }
                ParamRole::OutText => {
                    let slot = word_of[i].unwrap_or_default();
                    outputs.push(OutputRead::Text {
                        slot,
                        name: params[i].name.clone(),
                    });
                    MarshalStep::OutText { slot }
                }
                ParamRole::OutBuffer { capacity } => {
                    let slot = buffer_of[i].unwrap_or_default();
                    let length = roles
                        .iter()
                        .position(|r| *r == ParamRole::Length { buffer: i })
                        .and_then(|l| word_of[l].map(|w| (w, params[l].logical_type)));
                    outputs.push(OutputRead::Buffer {
                        slot,
                        length,
                        name: params[i].name.clone(),
                    });
                    MarshalStep::OutBuffer { slot, capacity }
                }
            };
            steps.push(step);
        }

        let protocol = decl.error_protocol();
        let return_step = ReturnStep {
            logical_type: decl.return_spec.logical_type,
            finalizer: decl.finalizer.clone(),
        };
        let primary = primary_shape(&return_step, protocol);
        let outs: Vec<ReturnShape> = outputs
            .iter()
            .map(|o| match o {
                OutputRead::Scalar { ty, .. } => ReturnShape::Scalar(*ty),
                OutputRead::Text { .. } => ReturnShape::Text,
                OutputRead::Buffer { .. } => ReturnShape::Bytes,
            })
            .collect();
        let shape = fold(primary, outs, protocol, ReturnShape::Null, ReturnShape::Tuple);

        Self {
            library: decl.library.clone(),
            symbol: decl.symbol.clone(),
            protocol,
            steps,
            visible,
            outputs,
            return_step,
            shape,
            word_slots,
            buffer_capacities,
        }
    }

    pub fn library(&self) -> &LibraryId {
        &self.library
    }

    pub fn symbol(&self) -> &SymbolName {
        &self.symbol
    }

    pub fn protocol(&self) -> ErrorProtocol {
        self.protocol
    }

    pub fn steps(&self) -> &[MarshalStep] {
        &self.steps
    }

    pub fn visible_params(&self) -> &[VisibleParam] {
        &self.visible
    }

    /// Number of arguments the caller passes
    pub fn visible_arity(&self) -> usize {
        self.visible.len()
    }

    pub fn parameter_name(&self, arg: usize) -> &str {
        self.visible.get(arg).map(|p| p.name.as_str()).unwrap_or("?")
    }

    pub fn outputs(&self) -> &[OutputRead] {
        &self.outputs
    }

    pub fn return_step(&self) -> &ReturnStep {
        &self.return_step
    }

    /// Composite shape of the caller-visible result
    pub fn shape(&self) -> &ReturnShape {
        &self.shape
    }

    pub fn word_slots(&self) -> usize {
        self.word_slots
    }

    pub fn buffer_capacities(&self) -> &[usize] {
        &self.buffer_capacities
    }

    /// Caller-visible positions of handles whose ownership the call takes
    pub fn transferred_handles(&self) -> impl Iterator<Item = usize> + '_ {
        self.visible
            .iter()
            .enumerate()
            .filter(|(_, p)| p.role == ParamRole::Handle { transfer: true })
            .map(|(i, _)| i)
    }

    /// Validate caller arguments before anything is allocated
    ///
    /// A resource can be handed over at most once per call.
    pub fn check_args(&self, args: &[Value]) -> Result<(), MarshalError> {
        if args.len() != self.visible.len() {
            return Err(MarshalError::ArityMismatch {
                expected: self.visible.len(),
                got: args.len(),
            });
        }
        let mut transferred: Vec<&Resource> = Vec::new();
        for (param, arg) in self.visible.iter().zip(args) {
            let name = param.name.as_str();
            match param.role {
                ParamRole::Scalar | ParamRole::OutScalar { .. } => {
                    marshal::narrow_scalar(name, arg, param.logical_type)?;
                }
                ParamRole::Text { .. } => marshal::check_text(name, arg)?,
                ParamRole::Buffer => marshal::check_bytes(name, arg)?,
                ParamRole::Handle { transfer } => {
                    let resource = marshal::check_handle(name, arg)?;
                    if transfer {
                        if transferred.iter().any(|r| Arc::ptr_eq(r, resource)) {
                            return Err(MarshalError::DuplicateTransfer {
                                parameter: name.to_string(),
                            });
                        }
                        transferred.push(resource);
                    }
                }
                ParamRole::Length { .. } | ParamRole::OutText | ParamRole::OutBuffer { .. } => {}
            }
        }
        Ok(())
    }

    /// Fold the primary result and `Out` values into the caller-visible result
    pub fn assemble(&self, primary: Option<Value>, outs: Vec<Value>) -> Value {
        fold(primary, outs, self.protocol, Value::Null, Value::Tuple)
    }

    /// Stable human-readable signature, e.g. `(c_text,c_bytes+len)->c_int32 !non-zero`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .visible
            .iter()
            .map(|p| match p.role {
                ParamRole::OutScalar { seed: true } => format!("&{}", p.logical_type),
                ParamRole::Handle { transfer: true } => format!("owned {}", p.logical_type),
                _ if p.paired => format!("{}+len", p.logical_type),
                _ => p.logical_type.to_string(),
            })
            .collect();
        let mut sig = format!("({})->{}", params.join(","), self.shape);
        if self.protocol != ErrorProtocol::None {
            sig.push_str(&format!(" !{}", self.protocol));
        }
        sig
    }
}

fn primary_shape(step: &ReturnStep, protocol: ErrorProtocol) -> Option<ReturnShape> {
    match step.logical_type {
        LogicalType::Void => None,
        LogicalType::Text => Some(ReturnShape::Text),
        LogicalType::Bytes => Some(ReturnShape::Bytes),
        LogicalType::Handle => Some(ReturnShape::Resource {
            finalizer: step.finalizer.clone().unwrap_or_else(|| SymbolName::new("")),
            nullable: protocol != ErrorProtocol::NullPointer,
        }),
        ty => Some(ReturnShape::Scalar(ty)),
    }
}

/// Shared composite rule for shapes and values
///
/// No outputs: the primary (or null for void). One output and either a
/// void primary or a status consumed by the protocol: that output. Otherwise
/// a tuple of the primary (when not void) followed by every output.
fn fold<T>(
    primary: Option<T>,
    mut outs: Vec<T>,
    protocol: ErrorProtocol,
    null: T,
    tuple: impl FnOnce(Vec<T>) -> T,
) -> T {
    match (primary, outs.len()) {
        (None, 0) => null,
        (Some(p), 0) => p,
        (None, 1) => outs.remove(0),
        (Some(_), 1) if protocol != ErrorProtocol::None => outs.remove(0),
        (primary, _) => tuple(primary.into_iter().chain(outs).collect()),
    }
}
