use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::hash::Hash;
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

//-------------------------------------------------------------------------

/// Milliseconds since the unix epoch.  Zero means "never".
pub type Timestamp = i64;

pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

//-------------------------------------------------------------------------

/// Length-prefixed little-endian binary encoding.  unpack() is the exact
/// inverse of pack(); every container writes a u64 element count first.
pub trait Pack: Sized {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()>;
    fn unpack<R: Read>(r: &mut R) -> io::Result<Self>;
}

pub fn pack_to_vec<T: Pack>(value: &T) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    value.pack(&mut buf)?;
    Ok(buf)
}

//-------------------------------------------------------------------------

macro_rules! pack_primitive {
    ($t:ty, $write:ident, $read:ident) => {
        impl Pack for $t {
            fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
                w.$write::<LittleEndian>(*self)
            }

            fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
                r.$read::<LittleEndian>()
            }
        }
    };
}

pack_primitive!(u16, write_u16, read_u16);
pack_primitive!(u32, write_u32, read_u32);
pack_primitive!(u64, write_u64, read_u64);
pack_primitive!(i32, write_i32, read_i32);
pack_primitive!(i64, write_i64, read_i64);
pack_primitive!(f32, write_f32, read_f32);
pack_primitive!(f64, write_f64, read_f64);

impl Pack for u8 {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(*self)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_u8()
    }
}

//-------------------------------------------------------------------------

impl Pack for String {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.len() as u64)?;
        w.write_all(self.as_bytes())
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let len = r.read_u64::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        r.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not utf-8"))
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.len() as u64)?;
        for v in self {
            v.pack(w)?;
        }
        Ok(())
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let len = r.read_u64::<LittleEndian>()? as usize;
        let mut vs = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            vs.push(T::unpack(r)?);
        }
        Ok(vs)
    }
}

// Fixed-size arrays carry no length prefix; the width is part of the type.
impl<T: Pack, const N: usize> Pack for [T; N] {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for v in self {
            v.pack(w)?;
        }
        Ok(())
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut vs = Vec::with_capacity(N);
        for _ in 0..N {
            vs.push(T::unpack(r)?);
        }
        vs.try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "array length mismatch"))
    }
}

impl<A: Pack, B: Pack> Pack for (A, B) {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.0.pack(w)?;
        self.1.pack(w)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let a = A::unpack(r)?;
        let b = B::unpack(r)?;
        Ok((a, b))
    }
}

impl<K: Pack + Eq + Hash, V: Pack> Pack for HashMap<K, V> {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.len() as u64)?;
        for (k, v) in self {
            k.pack(w)?;
            v.pack(w)?;
        }
        Ok(())
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let len = r.read_u64::<LittleEndian>()? as usize;
        let mut map = HashMap::with_capacity(len.min(4096));
        for _ in 0..len {
            let k = K::unpack(r)?;
            let v = V::unpack(r)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
