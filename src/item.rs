/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Typed item serialization.
//!
//! Items are the unit of data flowing through writers, readers, files,
//! queues, and channels. The encoding is type directed and recursive:
//! fixed-size primitives are written in native byte order without any
//! framing, while variable-size containers (strings, sequences) carry an
//! unsigned LEB128 varint length prefix. Pairs, tuples, and fixed-length
//! arrays are the plain concatenation of their field encodings.
//!
//! Every [`Item`] type has a stable, structural typename and a 64-bit
//! fingerprint derived from it by city hashing. In self-verify mode,
//! writers prefix each item with the fingerprint and readers check it,
//! catching type confusion between producer and consumer at the cost of
//! eight bytes per item.
//!
//! The encoding assumes a homogeneous cluster: integers and floats are
//! exchanged in native byte order, exactly as they are laid out in memory.

use std::any::TypeId;
use std::sync::LazyLock;

use dashmap::DashMap;

use crate::error::Error;
use crate::error::Result;

/// A byte-oriented output cursor that items serialize themselves into.
/// Implemented by block writers and by plain byte vectors.
pub trait ItemWriter {
    /// Append a raw byte range.
    fn put_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Append a single byte.
    fn put_byte(&mut self, byte: u8) -> Result<()> {
        self.put_raw(&[byte])
    }

    /// Append an unsigned LEB128 varint.
    fn put_varint(&mut self, mut value: u64) -> Result<()> {
        while value >= 0x80 {
            self.put_byte((value as u8) | 0x80)?;
            value >>= 7;
        }
        self.put_byte(value as u8)
    }
}

/// A byte-oriented input cursor that items deserialize themselves from.
/// Implemented by block readers and by in-memory slice cursors.
pub trait ItemReader {
    /// Fill `out` with the next bytes of the stream. Fails with
    /// [`Error::Underflow`] when the stream ends early.
    fn read_raw(&mut self, out: &mut [u8]) -> Result<()>;

    /// Fetch a single byte.
    fn get_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_raw(&mut byte)?;
        Ok(byte[0])
    }

    /// Fetch an unsigned LEB128 varint.
    fn get_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.get_byte()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte < 0x80 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::protocol("varint exceeds 64 bits"));
            }
        }
    }
}

/// A serializable item.
///
/// `IS_FIXED_SIZE` holds only if every constituent type is fixed-size; in
/// that case all serialized forms occupy exactly `FIXED_SIZE` bytes, which
/// readers exploit to skip items without deserializing them.
pub trait Item: Sized + 'static {
    /// Whether every value of this type serializes to the same number of
    /// bytes.
    const IS_FIXED_SIZE: bool;

    /// The serialized size in bytes when `IS_FIXED_SIZE` is true; zero
    /// otherwise.
    const FIXED_SIZE: usize;

    /// The stable, structural name of this type, e.g. `"(u32, String)"`.
    fn typename() -> &'static str;

    /// The 64-bit fingerprint written ahead of each item in self-verify
    /// mode: the city hash of [`Item::typename`].
    fn typehash() -> u64 {
        cityhasher::hash(Self::typename())
    }

    /// Write the encoding of `self` to `writer`.
    fn serialize<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()>;

    /// Read back a value previously written by [`Item::serialize`].
    fn deserialize<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self>;
}

static TYPENAME_CACHE: LazyLock<DashMap<TypeId, &'static str>> = LazyLock::new(DashMap::new);

/// Intern the typename of a generic instantiation. The name is built once
/// per concrete type and cached for the lifetime of the process, so that
/// `typename()` can keep returning `&'static str`.
fn intern_typename<T: 'static>(make: impl FnOnce() -> String) -> &'static str {
    *TYPENAME_CACHE
        .entry(TypeId::of::<T>())
        .or_insert_with(|| &*make().leak())
}

macro_rules! impl_primitive {
    ($t:ty) => {
        impl Item for $t {
            const IS_FIXED_SIZE: bool = true;
            const FIXED_SIZE: usize = std::mem::size_of::<$t>();

            fn typename() -> &'static str {
                stringify!($t)
            }

            fn serialize<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
                writer.put_raw(&self.to_ne_bytes())
            }

            fn deserialize<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
                let mut bytes = [0u8; std::mem::size_of::<$t>()];
                reader.read_raw(&mut bytes)?;
                Ok(<$t>::from_ne_bytes(bytes))
            }
        }
    };
}

impl_primitive!(u8);
impl_primitive!(u16);
impl_primitive!(u32);
impl_primitive!(u64);
impl_primitive!(usize);
impl_primitive!(i8);
impl_primitive!(i16);
impl_primitive!(i32);
impl_primitive!(i64);
impl_primitive!(isize);
impl_primitive!(f32);
impl_primitive!(f64);

impl Item for bool {
    const IS_FIXED_SIZE: bool = true;
    const FIXED_SIZE: usize = 1;

    fn typename() -> &'static str {
        "bool"
    }

    fn serialize<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.put_byte(u8::from(*self))
    }

    fn deserialize<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(reader.get_byte()? != 0)
    }
}

impl Item for () {
    const IS_FIXED_SIZE: bool = true;
    const FIXED_SIZE: usize = 0;

    fn typename() -> &'static str {
        "()"
    }

    fn serialize<W: ItemWriter + ?Sized>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }

    fn deserialize<R: ItemReader + ?Sized>(_reader: &mut R) -> Result<Self> {
        Ok(())
    }
}

impl Item for String {
    const IS_FIXED_SIZE: bool = false;
    const FIXED_SIZE: usize = 0;

    fn typename() -> &'static str {
        "String"
    }

    fn serialize<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.put_varint(self.len() as u64)?;
        writer.put_raw(self.as_bytes())
    }

    fn deserialize<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = reader.get_varint()? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_raw(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| Error::protocol("invalid utf-8 in string item"))
    }
}

impl<T: Item> Item for Vec<T> {
    const IS_FIXED_SIZE: bool = false;
    const FIXED_SIZE: usize = 0;

    fn typename() -> &'static str {
        intern_typename::<Self>(|| format!("Vec<{}>", T::typename()))
    }

    fn serialize<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.put_varint(self.len() as u64)?;
        for element in self {
            element.serialize(writer)?;
        }
        Ok(())
    }

    fn deserialize<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = reader.get_varint()? as usize;
        let mut out = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            out.push(T::deserialize(reader)?);
        }
        Ok(out)
    }
}

impl<T: Item, const N: usize> Item for [T; N] {
    const IS_FIXED_SIZE: bool = T::IS_FIXED_SIZE;
    const FIXED_SIZE: usize = N * T::FIXED_SIZE;

    fn typename() -> &'static str {
        intern_typename::<Self>(|| format!("[{}; {}]", T::typename(), N))
    }

    fn serialize<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        for element in self {
            element.serialize(writer)?;
        }
        Ok(())
    }

    fn deserialize<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut out = Vec::with_capacity(N);
        for _ in 0..N {
            out.push(T::deserialize(reader)?);
        }
        match out.try_into() {
            Ok(array) => Ok(array),
            Err(_) => unreachable!("length checked above"),
        }
    }
}

macro_rules! tuple_format_string {
    ($a:ident,) => { "{}" };
    ($a:ident, $($rest:ident,)+) => { concat!("{}, ", tuple_format_string!($($rest,)+)) };
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Item),+> Item for ($($name,)+) {
            const IS_FIXED_SIZE: bool = $($name::IS_FIXED_SIZE &&)+ true;
            const FIXED_SIZE: usize = $($name::FIXED_SIZE +)+ 0;

            fn typename() -> &'static str {
                intern_typename::<Self>(|| {
                    format!(
                        concat!("(", tuple_format_string!($($name,)+), ")"),
                        $($name::typename()),+
                    )
                })
            }

            fn serialize<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                $($name.serialize(writer)?;)+
                Ok(())
            }

            fn deserialize<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
                Ok(($($name::deserialize(reader)?,)+))
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);

impl ItemWriter for Vec<u8> {
    fn put_raw(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// An [`ItemReader`] over an in-memory byte slice.
#[derive(Debug)]
pub struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl ItemReader for SliceReader<'_> {
    fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        if self.remaining() < out.len() {
            return Err(Error::underflow(out.len(), self.remaining()));
        }
        out.copy_from_slice(&self.data[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }
}
