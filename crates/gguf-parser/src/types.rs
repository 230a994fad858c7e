//! GGUF format types and constants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Magic bytes `GGUF` (little-endian).
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Maximum GGUF version we support.
pub const GGUF_VERSION_MAX: u32 = 3;

/// Elements shown when an array value is rendered as text.
pub const ARRAY_PREVIEW_LEN: usize = 8;

//  Value type tag

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum GGUFValueType {
    Uint8 = 0,
    Int8 = 1,
    Uint16 = 2,
    Int16 = 3,
    Uint32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    Uint64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl GGUFValueType {
    /// Encoded width of a scalar of this type; `None` for strings and arrays.
    pub fn fixed_size(self) -> Option<u64> {
        match self {
            Self::Uint8 | Self::Int8 | Self::Bool => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(8),
            Self::String | Self::Array => None,
        }
    }
}

impl TryFrom<u32> for GGUFValueType {
    type Error = GGUFError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        const ALL: [GGUFValueType; 13] = [
            GGUFValueType::Uint8,
            GGUFValueType::Int8,
            GGUFValueType::Uint16,
            GGUFValueType::Int16,
            GGUFValueType::Uint32,
            GGUFValueType::Int32,
            GGUFValueType::Float32,
            GGUFValueType::Bool,
            GGUFValueType::String,
            GGUFValueType::Array,
            GGUFValueType::Uint64,
            GGUFValueType::Int64,
            GGUFValueType::Float64,
        ];
        ALL.get(v as usize)
            .copied()
            .ok_or(GGUFError::InvalidValueType(v))
    }
}

//  Header

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GGUFHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

//  Metadata KV

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GGUFMetadataKV {
    pub key: String,
    pub value: GGUFValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GGUFValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GGUFValue>),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl GGUFValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Uint8(v) => Some(v.into()),
            Self::Uint16(v) => Some(v.into()),
            Self::Uint32(v) => Some(v.into()),
            Self::Uint64(v) => Some(v),
            Self::Int32(v) => u64::try_from(v).ok(),
            Self::Int64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }
}

/// Text rendering used for metadata lookups.
///
/// Strings render verbatim; arrays show their first
/// [`ARRAY_PREVIEW_LEN`] elements, then `…` if there are more.
impl fmt::Display for GGUFValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint8(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::Uint16(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Uint32(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Uint64(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().take(ARRAY_PREVIEW_LEN).enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() > ARRAY_PREVIEW_LEN {
                    f.write_str(", …")?;
                }
                f.write_str("]")
            }
        }
    }
}

//  Error

#[derive(Debug, thiserror::Error)]
pub enum GGUFError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid GGUF magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid value type tag: {0}")]
    InvalidValueType(u32),

    #[error("Truncated header (file too small)")]
    TruncatedHeader,

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_tags_match_the_format() {
        assert_eq!(GGUFValueType::try_from(8).unwrap(), GGUFValueType::String);
        assert_eq!(GGUFValueType::try_from(12).unwrap(), GGUFValueType::Float64);
        assert!(matches!(
            GGUFValueType::try_from(13),
            Err(GGUFError::InvalidValueType(13))
        ));
        assert_eq!(GGUFValueType::Float32.fixed_size(), Some(4));
        assert_eq!(GGUFValueType::String.fixed_size(), None);
    }

    #[test]
    fn scalars_render_plainly() {
        assert_eq!(GGUFValue::String("Llama 3.2".into()).to_string(), "Llama 3.2");
        assert_eq!(GGUFValue::Uint32(131072).to_string(), "131072");
        assert_eq!(GGUFValue::Bool(true).to_string(), "true");
        assert_eq!(GGUFValue::Float32(0.5).to_string(), "0.5");
    }

    #[test]
    fn long_arrays_are_elided() {
        let short = GGUFValue::Array(vec![GGUFValue::Int32(1), GGUFValue::Int32(2)]);
        assert_eq!(short.to_string(), "[1, 2]");

        let long = GGUFValue::Array((0..20).map(GGUFValue::Uint8).collect());
        assert_eq!(long.to_string(), "[0, 1, 2, 3, 4, 5, 6, 7, …]");

        assert_eq!(GGUFValue::Array(Vec::new()).to_string(), "[]");
    }

    #[test]
    fn integer_views() {
        assert_eq!(GGUFValue::Uint32(7).as_u64(), Some(7));
        assert_eq!(GGUFValue::Int32(-1).as_u64(), None);
        assert_eq!(GGUFValue::String("x".into()).as_u64(), None);
    }
}
