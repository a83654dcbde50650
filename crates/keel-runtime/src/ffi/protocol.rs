//! Error protocol normalization
//!
//! Native libraries report failure in many ways: a negative return plus
//! `errno`, a non-zero status, a null pointer. `normalize` folds all of them
//! into `Result<RawReturn, FfiError>`. It is a pure function of the declared
//! protocol, the raw return and the side channel captured right after the call.

use crate::ffi::error::FfiError;
use crate::ffi::types::{ErrorProtocol, LibraryId};

/// Raw primary return of a native call, widened to 64 bits
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawReturn {
    Void,
    /// Signed integer returns
    Int(i64),
    /// Unsigned integer, size_t and bool returns
    UInt(u64),
    Float(f64),
    /// Pointer-shaped returns (text, handles)
    Pointer(usize),
}

impl RawReturn {
    fn is_negative(&self) -> bool {
        matches!(self, RawReturn::Int(v) if *v < 0)
    }

    /// Integer view used as an error code
    fn as_code(&self) -> Option<i64> {
        match self {
            RawReturn::Int(v) => Some(*v),
            RawReturn::UInt(v) => Some(*v as i64),
            _ => None,
        }
    }

    fn is_null(&self) -> bool {
        matches!(self, RawReturn::Pointer(0))
    }
}

/// The errno-like channel captured immediately after a native call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideChannel {
    pub code: Option<i32>,
    pub message: Option<String>,
}

impl SideChannel {
    /// Read the thread's last OS error; zero means "nothing reported"
    pub fn capture() -> Self {
        let code = std::io::Error::last_os_error()
            .raw_os_error()
            .filter(|c| *c != 0);
        Self {
            code,
            message: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Explicit message, else the OS description of the code
    fn describe(&self) -> Option<String> {
        self.message.clone().or_else(|| {
            self.code
                .map(|c| std::io::Error::from_raw_os_error(c).to_string())
        })
    }
}

/// Decide success or failure of a raw native return
pub fn normalize(
    protocol: ErrorProtocol,
    raw: RawReturn,
    side: &SideChannel,
    source: &LibraryId,
) -> Result<RawReturn, FfiError> {
    match protocol {
        ErrorProtocol::None => Ok(raw),

        ErrorProtocol::Errno => {
            if !raw.is_negative() {
                return Ok(raw);
            }
            let code = side.code.map(i64::from).unwrap_or(FfiError::GENERIC);
            let message = side
                .describe()
                .unwrap_or_else(|| "native call failed without setting errno".to_string());
            Err(FfiError::native(code, message, source.clone()))
        }

        ErrorProtocol::NonZero => match raw.as_code() {
            Some(0) | None => Ok(raw),
            Some(code) => Err(status_error(code, side, source)),
        },

        ErrorProtocol::Negative => {
            if !raw.is_negative() {
                return Ok(raw);
            }
            let code = raw.as_code().unwrap_or(FfiError::GENERIC);
            Err(status_error(code, side, source))
        }

        ErrorProtocol::NullPointer => {
            if !raw.is_null() {
                return Ok(raw);
            }
            let code = side.code.map(i64::from).unwrap_or(FfiError::GENERIC);
            let message = side
                .describe()
                .unwrap_or_else(|| "native call returned a null pointer".to_string());
            Err(FfiError::native(code, message, source.clone()))
        }

        ErrorProtocol::SuccessValue(expected) => match raw.as_code() {
            Some(code) if code != expected => Err(status_error(code, side, source)),
            _ => Ok(raw),
        },
    }
}

/// The return value itself is the code; the side channel only adds text
fn status_error(code: i64, side: &SideChannel, source: &LibraryId) -> FfiError {
    let message = side
        .message
        .clone()
        .unwrap_or_else(|| format!("native call returned status {}", code));
    FfiError::native(code, message, source.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn lib() -> LibraryId {
        LibraryId::new("native")
    }

    #[rstest]
    #[case(ErrorProtocol::Errno, RawReturn::Int(0), true)]
    #[case(ErrorProtocol::Errno, RawReturn::Int(5), true)]
    #[case(ErrorProtocol::Errno, RawReturn::Int(-1), false)]
    #[case(ErrorProtocol::NonZero, RawReturn::Int(0), true)]
    #[case(ErrorProtocol::NonZero, RawReturn::UInt(3), false)]
    #[case(ErrorProtocol::Negative, RawReturn::Int(12), true)]
    #[case(ErrorProtocol::Negative, RawReturn::Int(-22), false)]
    #[case(ErrorProtocol::NullPointer, RawReturn::Pointer(0x10), true)]
    #[case(ErrorProtocol::NullPointer, RawReturn::Pointer(0), false)]
    #[case(ErrorProtocol::SuccessValue(1), RawReturn::Int(1), true)]
    #[case(ErrorProtocol::SuccessValue(1), RawReturn::Int(0), false)]
    #[case(ErrorProtocol::None, RawReturn::Int(-5), true)]
    #[case(ErrorProtocol::None, RawReturn::Pointer(0), true)]
    fn test_success_table(
        #[case] protocol: ErrorProtocol,
        #[case] raw: RawReturn,
        #[case] ok: bool,
    ) {
        let result = normalize(protocol, raw, &SideChannel::empty(), &lib());
        assert_eq!(result.is_ok(), ok);
        if ok {
            assert_eq!(result.unwrap(), raw);
        }
    }

    #[test]
    fn test_errno_uses_side_channel_code() {
        let err = normalize(
            ErrorProtocol::Errno,
            RawReturn::Int(-1),
            &SideChannel::with_code(9),
            &lib(),
        )
        .unwrap_err();
        assert_eq!(err.code, 9);
        assert_eq!(err.source, lib());
        assert!(err.is_native());
    }

    #[test]
    fn test_errno_without_code_is_generic() {
        let err = normalize(
            ErrorProtocol::Errno,
            RawReturn::Int(-1),
            &SideChannel::empty(),
            &lib(),
        )
        .unwrap_err();
        assert_eq!(err.code, FfiError::GENERIC);
    }

    #[test]
    fn test_status_value_becomes_code() {
        let err = normalize(
            ErrorProtocol::NonZero,
            RawReturn::Int(7),
            &SideChannel::with_code(2),
            &lib(),
        )
        .unwrap_err();
        assert_eq!(err.code, 7);

        let err = normalize(
            ErrorProtocol::SuccessValue(100),
            RawReturn::Int(101),
            &SideChannel::empty(),
            &lib(),
        )
        .unwrap_err();
        assert_eq!(err.code, 101);
    }

    #[test]
    fn test_null_pointer_messages() {
        let err = normalize(
            ErrorProtocol::NullPointer,
            RawReturn::Pointer(0),
            &SideChannel::empty(),
            &lib(),
        )
        .unwrap_err();
        assert_eq!(err.code, FfiError::GENERIC);
        assert_eq!(err.message, "native call returned a null pointer");

        let err = normalize(
            ErrorProtocol::NullPointer,
            RawReturn::Pointer(0),
            &SideChannel::with_code(12).with_message("out of memory"),
            &lib(),
        )
        .unwrap_err();
        assert_eq!(err.code, 12);
        assert_eq!(err.message, "out of memory");
    }

    #[test]
    fn test_capture_reads_last_os_error() {
        let side = SideChannel::capture();
        // Whatever the thread state, a reported code is never zero
        assert_ne!(side.code, Some(0));
    }
}
