//! Error types for `oledisp_core`.
//!
//! All Rust-side failures are funnelled through [`DispatchError`], which
//! uses `thiserror` for `Display` and `Error` derives.  PyO3 conversion
//! is handled in the `oledisp-pyo3` crate, keeping this crate PyO3-free.
//!
//! Soft failures ([`DispatchError::GenerationUnavailable`], failed identifier
//! discovery) are absorbed by the resolver and never reach callers of
//! `invoke`.  Everything else is surfaced as-is so callers can branch on it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::{DispId, Identifier};

// HRESULT-style status codes carried by `NativeError`.
pub const E_NOTIMPL: i32 = 0x8000_4001_u32 as i32;
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
pub const E_UNEXPECTED: i32 = 0x8000_FFFF_u32 as i32;
pub const DISP_E_MEMBERNOTFOUND: i32 = 0x8002_0003_u32 as i32;
pub const DISP_E_UNKNOWNNAME: i32 = 0x8002_0006_u32 as i32;
pub const DISP_E_TYPEMISMATCH: i32 = 0x8002_0005_u32 as i32;

/// The member a failed request was aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Name(String),
    Id(DispId),
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Name(name) => write!(f, "'{name}'"),
            Member::Id(id) => write!(f, "dispid {id}"),
        }
    }
}

impl From<&str> for Member {
    fn from(name: &str) -> Self {
        Member::Name(name.to_owned())
    }
}

impl From<DispId> for Member {
    fn from(id: DispId) -> Self {
        Member::Id(id)
    }
}

/// Opaque failure raised by a native collaborator.
///
/// `code` follows the HRESULT convention (negative means failure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("native call failed (0x{code:08X}): {description}")]
pub struct NativeError {
    pub code: i32,
    pub description: String,
}

impl NativeError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Top-level error type for the `oledisp_core` library.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No member with this name or dispatch ID is known to the binding.
    #[error("MemberNotFound: {0}")]
    MemberNotFound(Member),

    /// A property-put was aimed at a member that only has a getter.
    #[error("ReadOnlyMember: {0} is read-only")]
    ReadOnlyMember(Member),

    /// Flag combination or argument list does not form a valid request.
    #[error("InvalidRequestShape: {0}")]
    InvalidRequestShape(String),

    /// An argument or result could not be coerced to its declared type.
    #[error("TypeMismatch: {context}: expected {expected}")]
    TypeMismatch { context: String, expected: String },

    /// Opaque passthrough of whatever the underlying call raised.
    #[error("NativeCallFailed: {0}")]
    NativeCallFailed(#[from] NativeError),

    /// Code generation could not produce a descriptor for an identifier.
    #[error("GenerationUnavailable: {identifier}: {reason}")]
    GenerationUnavailable {
        identifier: Identifier,
        reason: String,
    },

    /// The wrapped object cannot be served by the requested policy.
    #[error("PolicyPrecondition: {0}")]
    PolicyPrecondition(String),

    /// A string could not be parsed as an identifier.
    #[error("InvalidIdentifier: {0}")]
    InvalidIdentifier(String),

    /// Descriptor metadata is internally inconsistent.
    #[error("InvalidDescriptor: {0}")]
    InvalidDescriptor(String),

    /// Reading or parsing a type-library file failed.
    #[error("LibraryError: {0}")]
    Library(String),
}

impl DispatchError {
    /// `true` for failures that an attribute-style caller should report as
    /// "no such attribute" rather than a hard error.
    pub fn is_member_not_found(&self) -> bool {
        matches!(self, DispatchError::MemberNotFound(_))
    }

    /// HRESULT-style status code a COM caller would see for this failure.
    pub fn scode(&self) -> i32 {
        match self {
            DispatchError::MemberNotFound(Member::Name(_)) => DISP_E_UNKNOWNNAME,
            DispatchError::MemberNotFound(Member::Id(_)) | DispatchError::ReadOnlyMember(_) => {
                DISP_E_MEMBERNOTFOUND
            }
            DispatchError::TypeMismatch { .. } => DISP_E_TYPEMISMATCH,
            DispatchError::NativeCallFailed(err) => err.code,
            DispatchError::GenerationUnavailable { .. } => E_NOTIMPL,
            DispatchError::InvalidRequestShape(_) => E_UNEXPECTED,
            _ => E_FAIL,
        }
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Library(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Library(format!("JSON error: {err}"))
    }
}

/// Convert a `windows::core::Error` (COM / Win32 HRESULT failure) into a
/// [`DispatchError::NativeCallFailed`].
#[cfg(windows)]
impl From<windows::core::Error> for DispatchError {
    fn from(err: windows::core::Error) -> Self {
        DispatchError::NativeCallFailed(NativeError::from(err))
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for NativeError {
    fn from(err: windows::core::Error) -> Self {
        NativeError::new(err.code().0, err.message())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_not_found_is_attribute_like() {
        let err = DispatchError::MemberNotFound("Visible".into());
        assert!(err.is_member_not_found());
        assert!(!DispatchError::ReadOnlyMember("Count".into()).is_member_not_found());
    }

    #[test]
    fn test_display_mentions_member() {
        let err = DispatchError::ReadOnlyMember(Member::Id(1001));
        assert_eq!(err.to_string(), "ReadOnlyMember: dispid 1001 is read-only");
    }

    #[test]
    fn test_native_error_passthrough_keeps_code() {
        let err: DispatchError = NativeError::new(E_FAIL, "boom").into();
        assert_eq!(err.scode(), E_FAIL);
        assert!(err.to_string().contains("0x80004005"));
    }

    #[test]
    fn test_scode_for_unknown_name() {
        let err = DispatchError::MemberNotFound("Nope".into());
        assert_eq!(err.scode(), DISP_E_UNKNOWNNAME);
    }
}
