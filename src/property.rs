use std::io::{self, Read, Write};

use crate::errors::Result;
use crate::pack::Pack;
use crate::volume_file::{RecordId, VolumeFile};

//-------------------------------------------------------------------------

/// What callers hand to set_property.  Byte payloads become blob side
/// records; everything else is stored inline in the node record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

macro_rules! value_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        }
    };
}

value_from!(i32, I32);
value_from!(u32, U32);
value_from!(i64, I64);
value_from!(u64, U64);
value_from!(f32, F32);
value_from!(f64, F64);
value_from!(String, Str);
value_from!(Vec<u8>, Bytes);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

//-------------------------------------------------------------------------

/// A blob's bytes live in their own slab record; the node only carries this
/// stub, which keeps node records small and bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobProperty {
    size: u64,
    record_id: RecordId,
}

impl BlobProperty {
    pub(crate) fn store(file: &VolumeFile, data: &[u8]) -> Result<Self> {
        let record_id = file.allocate_record(data)?;
        Ok(Self {
            size: data.len() as u64,
            record_id,
        })
    }

    pub(crate) fn load(&self, file: &VolumeFile) -> Result<Vec<u8>> {
        file.read_record(self.record_id, |r| {
            let mut bytes = vec![0u8; self.size as usize];
            r.read_exact(&mut bytes)?;
            Ok(bytes)
        })
    }

    pub(crate) fn remove(&self, file: &VolumeFile) -> Result<()> {
        file.free_record(self.record_id)
    }
}

impl Pack for BlobProperty {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.size.pack(w)?;
        self.record_id.pack(w)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let size = u64::unpack(r)?;
        let record_id = RecordId::unpack(r)?;
        Ok(Self { size, record_id })
    }
}

//-------------------------------------------------------------------------

/// Stored form of a property.  The tag written to disk is the variant's
/// position in this declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Blob(BlobProperty),
}

impl Pack for PropertyValue {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        use PropertyValue::*;
        match self {
            I32(v) => {
                0u64.pack(w)?;
                v.pack(w)
            }
            U32(v) => {
                1u64.pack(w)?;
                v.pack(w)
            }
            I64(v) => {
                2u64.pack(w)?;
                v.pack(w)
            }
            U64(v) => {
                3u64.pack(w)?;
                v.pack(w)
            }
            F32(v) => {
                4u64.pack(w)?;
                v.pack(w)
            }
            F64(v) => {
                5u64.pack(w)?;
                v.pack(w)
            }
            Str(v) => {
                6u64.pack(w)?;
                v.pack(w)
            }
            Blob(v) => {
                7u64.pack(w)?;
                v.pack(w)
            }
        }
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        use PropertyValue::*;
        let tag = u64::unpack(r)?;
        Ok(match tag {
            0 => I32(Pack::unpack(r)?),
            1 => U32(Pack::unpack(r)?),
            2 => I64(Pack::unpack(r)?),
            3 => U64(Pack::unpack(r)?),
            4 => F32(Pack::unpack(r)?),
            5 => F64(Pack::unpack(r)?),
            6 => Str(Pack::unpack(r)?),
            7 => Blob(Pack::unpack(r)?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad property tag {}", tag),
                ))
            }
        })
    }
}

//-------------------------------------------------------------------------

/// Conversion from a stored property to the caller's requested type.
/// Arithmetic pairs convert by the underlying cast; identical types pass
/// through; everything else fails.  Blob retrieval goes through from_bytes
/// after the side record is read.
pub trait FromValue: Sized {
    #[doc(hidden)]
    const IS_BYTES: bool = false;

    fn from_value(value: &PropertyValue) -> Option<Self>;

    #[doc(hidden)]
    fn from_bytes(_bytes: Vec<u8>) -> Option<Self> {
        None
    }
}

macro_rules! numeric_from_value {
    ($t:ty) => {
        impl FromValue for $t {
            fn from_value(value: &PropertyValue) -> Option<Self> {
                use PropertyValue::*;
                match value {
                    I32(v) => Some(*v as $t),
                    U32(v) => Some(*v as $t),
                    I64(v) => Some(*v as $t),
                    U64(v) => Some(*v as $t),
                    F32(v) => Some(*v as $t),
                    F64(v) => Some(*v as $t),
                    _ => None,
                }
            }
        }
    };
}

numeric_from_value!(i32);
numeric_from_value!(u32);
numeric_from_value!(i64);
numeric_from_value!(u64);
numeric_from_value!(f32);
numeric_from_value!(f64);

impl FromValue for String {
    fn from_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for Vec<u8> {
    const IS_BYTES: bool = true;

    fn from_value(_value: &PropertyValue) -> Option<Self> {
        None
    }

    fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        Some(bytes)
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
