//! Signal type descriptors: the basic numeric types plus registered
//! structured types.

use std::fmt;
use std::sync::Arc;

/// Fixed-size numeric element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl BasicType {
    pub const ALL: [BasicType; 10] = [
        BasicType::UInt8,
        BasicType::UInt16,
        BasicType::UInt32,
        BasicType::UInt64,
        BasicType::Int8,
        BasicType::Int16,
        BasicType::Int32,
        BasicType::Int64,
        BasicType::Float32,
        BasicType::Float64,
    ];

    pub const fn size(self) -> usize {
        match self {
            BasicType::UInt8 | BasicType::Int8 => 1,
            BasicType::UInt16 | BasicType::Int16 => 2,
            BasicType::UInt32 | BasicType::Int32 | BasicType::Float32 => 4,
            BasicType::UInt64 | BasicType::Int64 | BasicType::Float64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            BasicType::UInt8 => "uint8",
            BasicType::UInt16 => "uint16",
            BasicType::UInt32 => "uint32",
            BasicType::UInt64 => "uint64",
            BasicType::Int8 => "int8",
            BasicType::Int16 => "int16",
            BasicType::Int32 => "int32",
            BasicType::Int64 => "int64",
            BasicType::Float32 => "float32",
            BasicType::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Write `value` converted to this type into `out[..self.size()]`.
    /// Integer conversions saturate. Returns false if `out` is too short.
    pub fn encode(self, value: f64, out: &mut [u8]) -> bool {
        let Some(out) = out.get_mut(..self.size()) else {
            return false;
        };
        match self {
            BasicType::UInt8 => out.copy_from_slice(&(value as u8).to_ne_bytes()),
            BasicType::UInt16 => out.copy_from_slice(&(value as u16).to_ne_bytes()),
            BasicType::UInt32 => out.copy_from_slice(&(value as u32).to_ne_bytes()),
            BasicType::UInt64 => out.copy_from_slice(&(value as u64).to_ne_bytes()),
            BasicType::Int8 => out.copy_from_slice(&(value as i8).to_ne_bytes()),
            BasicType::Int16 => out.copy_from_slice(&(value as i16).to_ne_bytes()),
            BasicType::Int32 => out.copy_from_slice(&(value as i32).to_ne_bytes()),
            BasicType::Int64 => out.copy_from_slice(&(value as i64).to_ne_bytes()),
            BasicType::Float32 => out.copy_from_slice(&(value as f32).to_ne_bytes()),
            BasicType::Float64 => out.copy_from_slice(&value.to_ne_bytes()),
        }
        true
    }

    /// Inverse of `encode`. `None` if `bytes` is too short.
    pub fn decode(self, bytes: &[u8]) -> Option<f64> {
        let b = bytes.get(..self.size())?;
        Some(match self {
            BasicType::UInt8 => b[0] as f64,
            BasicType::UInt16 => u16::from_ne_bytes(b.try_into().ok()?) as f64,
            BasicType::UInt32 => u32::from_ne_bytes(b.try_into().ok()?) as f64,
            BasicType::UInt64 => u64::from_ne_bytes(b.try_into().ok()?) as f64,
            BasicType::Int8 => b[0] as i8 as f64,
            BasicType::Int16 => i16::from_ne_bytes(b.try_into().ok()?) as f64,
            BasicType::Int32 => i32::from_ne_bytes(b.try_into().ok()?) as f64,
            BasicType::Int64 => i64::from_ne_bytes(b.try_into().ok()?) as f64,
            BasicType::Float32 => f32::from_ne_bytes(b.try_into().ok()?) as f64,
            BasicType::Float64 => f64::from_ne_bytes(b.try_into().ok()?),
        })
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One member of a structured type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub type_name: String,
    /// Byte offset inside the parent structure.
    pub offset: usize,
    pub elements: usize,
}

impl Member {
    pub fn new(name: &str, type_name: &str, offset: usize, elements: usize) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            offset,
            elements,
        }
    }
}

/// Layout of a registered structured type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introspection {
    pub name: String,
    pub size: usize,
    pub members: Vec<Member>,
}

impl Introspection {
    pub fn new(name: &str, size: usize, members: Vec<Member>) -> Self {
        Self {
            name: name.to_string(),
            size,
            members,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    Basic(BasicType),
    Structured(Arc<Introspection>),
}

impl TypeDescriptor {
    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            TypeDescriptor::Basic(t) => t.size(),
            TypeDescriptor::Structured(s) => s.size,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TypeDescriptor::Basic(t) => t.name(),
            TypeDescriptor::Structured(s) => &s.name,
        }
    }

    pub fn basic(&self) -> Option<BasicType> {
        match self {
            TypeDescriptor::Basic(t) => Some(*t),
            TypeDescriptor::Structured(_) => None,
        }
    }
}

/// Numeric types that GAM code can read from and write to signal memory.
pub trait Scalar: Copy + Default + Send + 'static {
    const TYPE: BasicType;
    fn to_bytes(self, out: &mut [u8]);
    fn from_bytes(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Scalar for $t {
                const TYPE: BasicType = BasicType::$variant;

                #[inline]
                fn to_bytes(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_ne_bytes());
                }

                #[inline]
                fn from_bytes(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                    <$t>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_scalar!(
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for t in BasicType::ALL {
            assert_eq!(BasicType::parse(t.name()), Some(t));
        }
        assert_eq!(BasicType::parse("uint128"), None);
    }

    #[test]
    fn encode_saturates_integers() {
        let mut out = [0u8; 1];
        assert!(BasicType::UInt8.encode(300.0, &mut out));
        assert_eq!(out[0], 255);
        assert!(BasicType::Int8.encode(-1.0, &mut out));
        assert_eq!(BasicType::Int8.decode(&out), Some(-1.0));
    }

    #[test]
    fn encode_rejects_short_buffer() {
        let mut out = [0u8; 2];
        assert!(!BasicType::Float32.encode(1.0, &mut out));
        assert_eq!(BasicType::Float32.decode(&out), None);
    }

    #[test]
    fn scalar_matches_basic_type() {
        let mut raw = [0u8; 8];
        1.5f64.to_bytes(&mut raw);
        assert_eq!(BasicType::Float64.decode(&raw), Some(1.5));
        assert_eq!(f64::from_bytes(&raw), 1.5);
        assert_eq!(<u16 as Scalar>::TYPE.size(), 2);
    }
}
