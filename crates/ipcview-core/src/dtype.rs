//! Data type definitions

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Supported element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    UInt8 = 0,
    Int8 = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    UInt64 = 6,
    Int64 = 7,
    Float16 = 8,
    Float32 = 9,
    Float64 = 10,
}

impl DType {
    /// Size in bytes
    pub const fn size(&self) -> usize {
        match self {
            DType::UInt8 | DType::Int8 => 1,
            DType::UInt16 | DType::Int16 | DType::Float16 => 2,
            DType::UInt32 | DType::Int32 | DType::Float32 => 4,
            DType::UInt64 | DType::Int64 | DType::Float64 => 8,
        }
    }

    /// Array-interface kind character
    pub const fn kind(&self) -> char {
        match self {
            DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64 => 'u',
            DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64 => 'i',
            DType::Float16 | DType::Float32 | DType::Float64 => 'f',
        }
    }

    /// Canonical array-interface type string, e.g. `<f4` or `|u1`
    pub fn typestr(&self) -> String {
        let order = if self.size() == 1 { '|' } else { '<' };
        format!("{}{}{}", order, self.kind(), self.size())
    }

    /// Whether a prefix-sum kernel exists for this type
    pub const fn supports_cumsum(&self) -> bool {
        !matches!(self, DType::Float16)
    }

    /// Parse an array-interface type string.
    ///
    /// Accepted byte orders are `<` (little), `=` (native, which every CUDA
    /// target is little-endian for) and `|` (single-byte types only). Big-endian
    /// data cannot be scanned in place by the device kernels and is rejected.
    pub fn parse_typestr(s: &str) -> Result<Self> {
        let unsupported = || Error::UnsupportedDtype(s.to_string());

        let mut chars = s.chars();
        let order = chars.next().ok_or_else(unsupported)?;
        let kind = chars.next().ok_or_else(unsupported)?;
        let digits = chars.as_str();
        // plain decimal only: no sign, no leading zero
        if digits.is_empty()
            || digits.starts_with('0')
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(unsupported());
        }
        let width: usize = digits.parse().map_err(|_| unsupported())?;

        let dtype = match (kind, width) {
            ('u', 1) => DType::UInt8,
            ('i', 1) => DType::Int8,
            ('u', 2) => DType::UInt16,
            ('i', 2) => DType::Int16,
            ('f', 2) => DType::Float16,
            ('u', 4) => DType::UInt32,
            ('i', 4) => DType::Int32,
            ('f', 4) => DType::Float32,
            ('u', 8) => DType::UInt64,
            ('i', 8) => DType::Int64,
            ('f', 8) => DType::Float64,
            _ => return Err(unsupported()),
        };

        match order {
            '<' | '=' => Ok(dtype),
            '|' if dtype.size() == 1 => Ok(dtype),
            _ => Err(unsupported()),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_typestr(s)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.typestr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_common_typestrs() {
        assert_eq!(DType::parse_typestr("<f4").unwrap(), DType::Float32);
        assert_eq!(DType::parse_typestr("<i4").unwrap(), DType::Int32);
        assert_eq!(DType::parse_typestr("<f8").unwrap(), DType::Float64);
        assert_eq!(DType::parse_typestr("|u1").unwrap(), DType::UInt8);
        assert_eq!(DType::parse_typestr("<i1").unwrap(), DType::Int8);
        assert_eq!(DType::parse_typestr("=u8").unwrap(), DType::UInt64);
        assert_eq!(DType::parse_typestr("<f2").unwrap(), DType::Float16);
    }

    #[test]
    fn test_reject_unsupported_typestrs() {
        for s in [
            "", "<", "<f", "f4", ">f4", "|f4", "<c8", "<b1", "<f16", "<i3", "<V8", "<f4 ",
            "<f+4", "<f04", "<u+1", "=f+8", "<f0", "<u-1",
        ] {
            match DType::parse_typestr(s) {
                Err(Error::UnsupportedDtype(got)) => assert_eq!(got, s),
                other => panic!("{:?} should be unsupported, got {:?}", s, other),
            }
        }
    }

    #[test]
    fn test_typestr_roundtrip_is_canonical() {
        assert_eq!(DType::Float32.typestr(), "<f4");
        assert_eq!(DType::UInt8.typestr(), "|u1");
        assert_eq!("=i8".parse::<DType>().unwrap().typestr(), "<i8");
    }

    #[test]
    fn test_cumsum_support() {
        assert!(DType::Float32.supports_cumsum());
        assert!(DType::Int64.supports_cumsum());
        assert!(!DType::Float16.supports_cumsum());
    }
}
