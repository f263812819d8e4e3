//! Big-endian packing primitives.
//!
//! Every multi-byte scalar is written in network byte order. Strings carry a `u32` length that
//! includes a trailing NUL byte, so that a missing string (length zero) and an empty string can
//! be told apart. Arrays are prefixed by a `u32` element count.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::bitmap::Bitmap;
use crate::protocol::NO_VAL;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnpackError {
    #[error("Buffer ended while reading {0}")]
    Truncated(&'static str),
    #[error("Invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },
}

impl UnpackError {
    pub fn invalid(what: &'static str, detail: impl Into<String>) -> Self {
        UnpackError::Invalid {
            what,
            detail: detail.into(),
        }
    }
}

pub type UnpackResult<T> = std::result::Result<T, UnpackError>;

#[derive(Default)]
pub struct Packer {
    buffer: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn pack8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    #[inline]
    pub fn pack_bool(&mut self, value: bool) {
        self.buffer.put_u8(value as u8);
    }

    #[inline]
    pub fn pack16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    #[inline]
    pub fn pack32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    #[inline]
    pub fn pack_i32(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    #[inline]
    pub fn pack64(&mut self, value: u64) {
        self.buffer.put_u64(value);
    }

    pub fn pack_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.buffer.put_u32(value.len() as u32 + 1);
                self.buffer.put_slice(value.as_bytes());
                self.buffer.put_u8(0);
            }
            None => self.buffer.put_u32(0),
        }
    }

    /// Raw bytes with a `u32` length prefix.
    pub fn pack_bytes(&mut self, value: &[u8]) {
        self.buffer.put_u32(value.len() as u32);
        self.buffer.put_slice(value);
    }

    pub fn pack16_array(&mut self, values: &[u16]) {
        self.buffer.put_u32(values.len() as u32);
        for value in values {
            self.buffer.put_u16(*value);
        }
    }

    pub fn pack32_array(&mut self, values: &[u32]) {
        self.buffer.put_u32(values.len() as u32);
        for value in values {
            self.buffer.put_u32(*value);
        }
    }

    pub fn pack64_array(&mut self, values: &[u64]) {
        self.buffer.put_u32(values.len() as u32);
        for value in values {
            self.buffer.put_u64(*value);
        }
    }

    /// Bitmap size followed by its hex mask, or `NO_VAL` when the bitmap is missing.
    pub fn pack_bitmap_hex(&mut self, bitmap: Option<&Bitmap>) {
        match bitmap {
            Some(bitmap) => {
                self.buffer.put_u32(bitmap.len() as u32);
                self.pack_str(Some(&bitmap.fmt_hex()));
            }
            None => self.buffer.put_u32(NO_VAL),
        }
    }

    pub fn put_raw(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    pub fn into_inner(self) -> BytesMut {
        self.buffer
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }
}

pub struct Unpacker<'a> {
    data: &'a [u8],
}

impl<'a> Unpacker<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Unconsumed tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    fn ensure(&self, size: usize, what: &'static str) -> UnpackResult<()> {
        if self.data.len() < size {
            Err(UnpackError::Truncated(what))
        } else {
            Ok(())
        }
    }

    pub fn unpack8(&mut self) -> UnpackResult<u8> {
        self.ensure(1, "u8")?;
        Ok(self.data.get_u8())
    }

    pub fn unpack_bool(&mut self) -> UnpackResult<bool> {
        Ok(self.unpack8()? != 0)
    }

    pub fn unpack16(&mut self) -> UnpackResult<u16> {
        self.ensure(2, "u16")?;
        Ok(self.data.get_u16())
    }

    pub fn unpack32(&mut self) -> UnpackResult<u32> {
        self.ensure(4, "u32")?;
        Ok(self.data.get_u32())
    }

    pub fn unpack_i32(&mut self) -> UnpackResult<i32> {
        self.ensure(4, "i32")?;
        Ok(self.data.get_i32())
    }

    pub fn unpack64(&mut self) -> UnpackResult<u64> {
        self.ensure(8, "u64")?;
        Ok(self.data.get_u64())
    }

    pub fn unpack_str(&mut self) -> UnpackResult<Option<String>> {
        let size = self.unpack32()? as usize;
        if size == 0 {
            return Ok(None);
        }
        self.ensure(size, "string")?;
        let (value, rest) = self.data.split_at(size);
        self.data = rest;
        match value.split_last() {
            Some((0, text)) => String::from_utf8(text.to_vec())
                .map(Some)
                .map_err(|e| UnpackError::invalid("string", e.to_string())),
            _ => Err(UnpackError::invalid("string", "missing terminator")),
        }
    }

    pub fn unpack_bytes(&mut self) -> UnpackResult<Bytes> {
        let size = self.unpack32()? as usize;
        self.ensure(size, "bytes")?;
        let (value, rest) = self.data.split_at(size);
        self.data = rest;
        Ok(Bytes::copy_from_slice(value))
    }

    fn unpack_count(&mut self, element_size: usize, what: &'static str) -> UnpackResult<usize> {
        let count = self.unpack32()? as usize;
        self.ensure(count.saturating_mul(element_size), what)?;
        Ok(count)
    }

    pub fn unpack16_array(&mut self) -> UnpackResult<Vec<u16>> {
        let count = self.unpack_count(2, "u16 array")?;
        Ok((0..count).map(|_| self.data.get_u16()).collect())
    }

    pub fn unpack32_array(&mut self) -> UnpackResult<Vec<u32>> {
        let count = self.unpack_count(4, "u32 array")?;
        Ok((0..count).map(|_| self.data.get_u32()).collect())
    }

    pub fn unpack64_array(&mut self) -> UnpackResult<Vec<u64>> {
        let count = self.unpack_count(8, "u64 array")?;
        Ok((0..count).map(|_| self.data.get_u64()).collect())
    }

    pub fn unpack_bitmap_hex(&mut self) -> UnpackResult<Option<Bitmap>> {
        let size = self.unpack32()?;
        if size == NO_VAL {
            return Ok(None);
        }
        let mask = self
            .unpack_str()?
            .ok_or_else(|| UnpackError::invalid("bitmap", "missing hex mask"))?;
        let digits = mask
            .strip_prefix("0x")
            .or_else(|| mask.strip_prefix("0X"))
            .unwrap_or(&mask)
            .len();
        if size as usize > digits * 4 {
            return Err(UnpackError::invalid(
                "bitmap",
                format!("size {size} does not fit into a mask of {digits} digits"),
            ));
        }
        Bitmap::parse_hex(size as usize, &mask)
            .map(Some)
            .map_err(|e| UnpackError::invalid("bitmap", e.to_string()))
    }
}
