//! FFI type system - the C-side vocabulary of foreign declarations
//!
//! Defines:
//! - `LibraryId` / `SymbolName`: names of native libraries and their exports
//! - `LogicalType`: the declarable C types
//! - `ParameterSpec` / `ReturnSpec`: per-slot type, direction and ownership
//! - `ErrorProtocol`: how a native function signals failure
//! - `ForeignDeclaration` / `LibraryDeclaration`: what the host front end hands us
//!
//! Type mapping:
//! - LogicalType::I8..I64, U8..U64 → fixed-width C integers
//! - LogicalType::Size → size_t
//! - LogicalType::F32 / F64 → float / double
//! - LogicalType::Bool → uint8_t holding 0 or 1
//! - LogicalType::Text → const char* (null-terminated)
//! - LogicalType::Bytes → pointer half of a pointer+length pair
//! - LogicalType::Handle → opaque void*

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

name_type!(
    /// Name of a native library as written in declarations ("m", "sqlite3")
    LibraryId
);

name_type!(
    /// Exported symbol name inside a native library
    SymbolName
);

/// C-compatible logical types for foreign declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalType {
    /// No value (return position only)
    Void,
    /// Boolean, passed with the integer convention (0 or 1)
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// size_t
    Size,
    /// Null-terminated string
    Text,
    /// Binary buffer, paired with a length argument
    Bytes,
    /// Opaque native handle
    Handle,
}

impl LogicalType {
    /// Get a display name for this logical type
    pub fn display_name(&self) -> &'static str {
        match self {
            LogicalType::Void => "c_void",
            LogicalType::Bool => "c_bool",
            LogicalType::I8 => "c_int8",
            LogicalType::I16 => "c_int16",
            LogicalType::I32 => "c_int32",
            LogicalType::I64 => "c_int64",
            LogicalType::U8 => "c_uint8",
            LogicalType::U16 => "c_uint16",
            LogicalType::U32 => "c_uint32",
            LogicalType::U64 => "c_uint64",
            LogicalType::F32 => "c_float",
            LogicalType::F64 => "c_double",
            LogicalType::Size => "c_size",
            LogicalType::Text => "c_text",
            LogicalType::Bytes => "c_bytes",
            LogicalType::Handle => "c_handle",
        }
    }

    /// Fixed-width integer or size_t
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            LogicalType::I8
                | LogicalType::I16
                | LogicalType::I32
                | LogicalType::I64
                | LogicalType::U8
                | LogicalType::U16
                | LogicalType::U32
                | LogicalType::U64
                | LogicalType::Size
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            LogicalType::I8 | LogicalType::I16 | LogicalType::I32 | LogicalType::I64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, LogicalType::F32 | LogicalType::F64)
    }

    /// Passed by value in a register-sized slot (numbers and booleans)
    pub fn is_scalar(&self) -> bool {
        self.is_integral() || self.is_float() || *self == LogicalType::Bool
    }

    /// Represented as a pointer at the ABI level
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            LogicalType::Text | LogicalType::Bytes | LogicalType::Handle
        )
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Data flow direction of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    In,
    /// Written by native code, folded into the composite return
    Out,
    /// Seeded by the caller, written by native code
    InOut,
}

/// Ownership transfer across the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ownership {
    /// Receiver becomes responsible for cleanup
    Owned,
    /// Valid for the duration of the call only
    Borrowed,
    /// Plain value, nothing to clean up
    #[default]
    None,
}

/// Convention a native function uses to signal failure through its return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorProtocol {
    /// Negative return is failure; details in errno
    Errno,
    /// Zero is success; any other value is the error code
    NonZero,
    /// Negative return is failure and is itself the error code
    Negative,
    /// Null pointer return is failure
    NullPointer,
    /// Exactly this value is success; anything else is the error code
    SuccessValue(i64),
    /// Every return is success
    #[default]
    None,
}

impl ErrorProtocol {
    /// Check whether this protocol can judge a return of the given type
    pub fn accepts(&self, return_type: &LogicalType) -> bool {
        match self {
            ErrorProtocol::Errno | ErrorProtocol::Negative => return_type.is_signed(),
            ErrorProtocol::NonZero | ErrorProtocol::SuccessValue(_) => {
                return_type.is_integral() || *return_type == LogicalType::Bool
            }
            ErrorProtocol::NullPointer => {
                matches!(return_type, LogicalType::Text | LogicalType::Handle)
            }
            ErrorProtocol::None => true,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            ErrorProtocol::Errno => "errno".to_string(),
            ErrorProtocol::NonZero => "non-zero".to_string(),
            ErrorProtocol::Negative => "negative".to_string(),
            ErrorProtocol::NullPointer => "null-pointer".to_string(),
            ErrorProtocol::SuccessValue(v) => format!("success-value({})", v),
            ErrorProtocol::None => "none".to_string(),
        }
    }
}

impl fmt::Display for ErrorProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// One declared parameter of a foreign function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub ownership: Ownership,
    /// Explicit length partner of a `Bytes` parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,
    /// Scratch size of an `Out` `Bytes` parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl ParameterSpec {
    /// Plain input parameter
    pub fn input(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            direction: Direction::In,
            ownership: Ownership::None,
            length: None,
            capacity: None,
        }
    }

    /// Output parameter, removed from the caller-visible signature
    pub fn output(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            direction: Direction::Out,
            ..Self::input(name, logical_type)
        }
    }

    /// Input/output parameter
    pub fn in_out(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            direction: Direction::InOut,
            ..Self::input(name, logical_type)
        }
    }

    pub fn ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn with_length(mut self, length: impl Into<String>) -> Self {
        self.length = Some(length.into());
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Declared return of a foreign function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReturnSpec {
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(default)]
    pub ownership: Ownership,
}

impl ReturnSpec {
    pub fn new(logical_type: LogicalType) -> Self {
        Self {
            logical_type,
            ownership: Ownership::None,
        }
    }

    pub fn void() -> Self {
        Self::new(LogicalType::Void)
    }

    /// Owned return; the caller becomes responsible for finalization
    pub fn owned(logical_type: LogicalType) -> Self {
        Self {
            logical_type,
            ownership: Ownership::Owned,
        }
    }

    /// Returns an owned opaque handle
    pub fn is_owned_handle(&self) -> bool {
        self.ownership == Ownership::Owned && self.logical_type == LogicalType::Handle
    }
}

impl Default for ReturnSpec {
    fn default() -> Self {
        Self::void()
    }
}

/// A declared foreign function
///
/// `error_protocol` and `finalizer` left as `None` inherit the library
/// defaults when the declaration is registered. `symbol` is the name host
/// code calls; `link_name`, when set, is the export actually linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignDeclaration {
    pub library: LibraryId,
    pub symbol: SymbolName,
    pub link_name: Option<SymbolName>,
    pub parameters: Vec<ParameterSpec>,
    pub return_spec: ReturnSpec,
    pub error_protocol: Option<ErrorProtocol>,
    pub finalizer: Option<SymbolName>,
}

impl ForeignDeclaration {
    pub fn new(library: impl Into<LibraryId>, symbol: impl Into<SymbolName>) -> Self {
        Self {
            library: library.into(),
            symbol: symbol.into(),
            link_name: None,
            parameters: Vec::new(),
            return_spec: ReturnSpec::void(),
            error_protocol: None,
            finalizer: None,
        }
    }

    pub fn param(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn returns(mut self, return_spec: ReturnSpec) -> Self {
        self.return_spec = return_spec;
        self
    }

    /// Per-declaration protocol, overriding the library default
    pub fn protocol(mut self, protocol: ErrorProtocol) -> Self {
        self.error_protocol = Some(protocol);
        self
    }

    pub fn finalizer(mut self, finalizer: impl Into<SymbolName>) -> Self {
        self.finalizer = Some(finalizer.into());
        self
    }

    /// Link against a differently named export
    pub fn link_name(mut self, link_name: impl Into<SymbolName>) -> Self {
        self.link_name = Some(link_name.into());
        self
    }

    /// Export resolved at link time
    pub fn native_symbol(&self) -> &SymbolName {
        self.link_name.as_ref().unwrap_or(&self.symbol)
    }

    /// Effective error protocol (`None` until a protocol is declared or inherited)
    pub fn error_protocol(&self) -> ErrorProtocol {
        self.error_protocol.unwrap_or_default()
    }

    /// Parameter position by name
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }
}

/// Library-wide defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryDeclaration {
    pub id: LibraryId,
    pub default_protocol: ErrorProtocol,
    pub default_finalizer: Option<SymbolName>,
}

impl LibraryDeclaration {
    pub fn new(id: impl Into<LibraryId>) -> Self {
        Self {
            id: id.into(),
            default_protocol: ErrorProtocol::None,
            default_finalizer: None,
        }
    }

    pub fn default_protocol(mut self, protocol: ErrorProtocol) -> Self {
        self.default_protocol = protocol;
        self
    }

    pub fn default_finalizer(mut self, finalizer: impl Into<SymbolName>) -> Self {
        self.default_finalizer = Some(finalizer.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_type_display_names() {
        assert_eq!(LogicalType::I32.display_name(), "c_int32");
        assert_eq!(LogicalType::Size.display_name(), "c_size");
        assert_eq!(LogicalType::Text.display_name(), "c_text");
        assert_eq!(LogicalType::Handle.to_string(), "c_handle");
    }

    #[test]
    fn test_logical_type_classes() {
        assert!(LogicalType::Size.is_integral());
        assert!(!LogicalType::Size.is_signed());
        assert!(LogicalType::Bool.is_scalar());
        assert!(!LogicalType::Bool.is_integral());
        assert!(LogicalType::Bytes.is_pointer());
        assert!(!LogicalType::F64.is_pointer());
    }

    #[test]
    fn test_protocol_accepts_return_types() {
        assert!(ErrorProtocol::Errno.accepts(&LogicalType::I32));
        assert!(!ErrorProtocol::Errno.accepts(&LogicalType::U32));
        assert!(ErrorProtocol::NonZero.accepts(&LogicalType::U32));
        assert!(ErrorProtocol::NullPointer.accepts(&LogicalType::Handle));
        assert!(!ErrorProtocol::NullPointer.accepts(&LogicalType::I64));
        assert!(ErrorProtocol::None.accepts(&LogicalType::Void));
        assert!(!ErrorProtocol::SuccessValue(1).accepts(&LogicalType::F64));
    }

    #[test]
    fn test_protocol_serde_names() {
        #[derive(Deserialize)]
        struct Holder {
            protocol: ErrorProtocol,
        }

        let errno: Holder = toml::from_str(r#"protocol = "errno""#).unwrap();
        assert_eq!(errno.protocol, ErrorProtocol::Errno);

        let non_zero: Holder = toml::from_str(r#"protocol = "non-zero""#).unwrap();
        assert_eq!(non_zero.protocol, ErrorProtocol::NonZero);

        let success: Holder = toml::from_str("protocol = { success-value = 1 }").unwrap();
        assert_eq!(success.protocol, ErrorProtocol::SuccessValue(1));
    }

    #[test]
    fn test_parameter_spec_from_toml() {
        let spec: ParameterSpec =
            toml::from_str("name = \"buf\"\ntype = \"bytes\"\nlength = \"n\"\n").unwrap();
        assert_eq!(spec.logical_type, LogicalType::Bytes);
        assert_eq!(spec.direction, Direction::In);
        assert_eq!(spec.ownership, Ownership::None);
        assert_eq!(spec.length.as_deref(), Some("n"));
    }

    #[test]
    fn test_declaration_builder() {
        let decl = ForeignDeclaration::new("sqlite3", "sqlite3_open")
            .param(ParameterSpec::input("path", LogicalType::Text))
            .returns(ReturnSpec::owned(LogicalType::Handle))
            .protocol(ErrorProtocol::NullPointer)
            .finalizer("sqlite3_close");

        assert_eq!(decl.library.as_str(), "sqlite3");
        assert_eq!(decl.error_protocol(), ErrorProtocol::NullPointer);
        assert!(decl.return_spec.is_owned_handle());
        assert_eq!(decl.parameter_index("path"), Some(0));
        assert_eq!(decl.parameter_index("missing"), None);
        assert_eq!(decl.native_symbol().as_str(), "sqlite3_open");

        let aliased = decl.link_name("sqlite3_open_v2");
        assert_eq!(aliased.symbol.as_str(), "sqlite3_open");
        assert_eq!(aliased.native_symbol().as_str(), "sqlite3_open_v2");
    }
}
