//! Class identifiers, dispatch IDs, and invocation flags.
//!
//! [`Identifier`] stands in for a COM CLSID/IID: a 128-bit value printed in
//! the registry form `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`.  Parsing is
//! case-insensitive and accepts the braces as optional.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::DispatchError;

/// Numeric handle identifying a member for late-bound invocation.
pub type DispId = i32;

/// The default ("value") member.
pub const DISPID_VALUE: DispId = 0;
/// Unknown member; also the start marker for member enumeration.
pub const DISPID_UNKNOWN: DispId = -1;
/// Named-argument ID carried by property puts.
pub const DISPID_PROPERTYPUT: DispId = -3;
/// The member that returns a new enumerator.
pub const DISPID_NEWENUM: DispId = -4;
/// The member invoked for host evaluation requests.
pub const DISPID_EVALUATE: DispId = -5;
/// Start marker for `next_dispid` enumeration.
pub const DISPID_STARTENUM: DispId = DISPID_UNKNOWN;

/// First ID handed out to names allocated at run time.
pub const DYNAMIC_DISPID_BASE: DispId = 1000;

/// Returns `true` for the reserved sentinel IDs that bypass the name table.
pub fn is_sentinel(id: DispId) -> bool {
    matches!(id, DISPID_VALUE | DISPID_NEWENUM | DISPID_EVALUATE)
}

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

/// Opaque, globally unique class identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(u128);

impl Identifier {
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Split into the COM GUID field layout `(data1, data2, data3, data4)`.
    pub fn fields(&self) -> (u32, u16, u16, [u8; 8]) {
        let v = self.0;
        let data4 = ((v & 0xFFFF_FFFF_FFFF_FFFF) as u64).to_be_bytes();
        ((v >> 96) as u32, (v >> 80) as u16, (v >> 64) as u16, data4)
    }

    pub fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self(
            (u128::from(data1) << 96)
                | (u128::from(data2) << 80)
                | (u128::from(data3) << 64)
                | u128::from(u64::from_be_bytes(data4)),
        )
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (d1, d2, d3, d4) = self.fields();
        write!(
            f,
            "{{{d1:08X}-{d2:04X}-{d3:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            d4[0], d4[1], d4[2], d4[3], d4[4], d4[5], d4[6], d4[7]
        )
    }
}

impl FromStr for Identifier {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);

        let groups: Vec<&str> = inner.split('-').collect();
        let lengths = [8, 4, 4, 4, 12];
        if groups.len() != lengths.len()
            || groups.iter().zip(lengths).any(|(g, len)| g.len() != len)
        {
            return Err(DispatchError::InvalidIdentifier(s.to_owned()));
        }

        let hex: String = groups.concat();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DispatchError::InvalidIdentifier(s.to_owned()));
        }
        u128::from_str_radix(&hex, 16)
            .map(Identifier)
            .map_err(|_| DispatchError::InvalidIdentifier(s.to_owned()))
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Invocation flags
// ---------------------------------------------------------------------------

/// `wFlags` bitmask of an invocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvokeFlags(u16);

impl InvokeFlags {
    pub const METHOD: InvokeFlags = InvokeFlags(0x1);
    pub const PROPERTY_GET: InvokeFlags = InvokeFlags(0x2);
    pub const PROPERTY_PUT: InvokeFlags = InvokeFlags(0x4);
    pub const PROPERTY_PUTREF: InvokeFlags = InvokeFlags(0x8);

    /// "Call it or fetch it" -- what attribute-style callers send.
    pub const METHOD_OR_GET: InvokeFlags = InvokeFlags(0x1 | 0x2);

    pub const fn empty() -> Self {
        InvokeFlags(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        InvokeFlags(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: InvokeFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn intersects(&self, other: InvokeFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Put or put-ref.
    pub const fn is_put(&self) -> bool {
        self.intersects(InvokeFlags(0x4 | 0x8))
    }
}

impl BitOr for InvokeFlags {
    type Output = InvokeFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        InvokeFlags(self.0 | rhs.0)
    }
}

impl BitAnd for InvokeFlags {
    type Output = InvokeFlags;

    fn bitand(self, rhs: Self) -> Self::Output {
        InvokeFlags(self.0 & rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
