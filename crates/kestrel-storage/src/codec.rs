//! Binary encoding for keys and values stored in pages.
//!
//! Fixed-width integers are little-endian. Strings and byte arrays carry a
//! u32 length prefix. Every read is bounds-checked so a truncated page
//! surfaces as a codec error instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_common::{BlockId, KestrelError, Result, RowId};

/// A type that can be written into and read back from a page body.
pub trait Codec: Sized + Send + Sync + 'static {
    /// Appends the encoded form to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Reads one value from the front of `buf`, advancing it.
    fn decode(buf: &mut &[u8]) -> Result<Self>;

    /// Exact number of bytes `encode` writes.
    fn encoded_len(&self) -> usize;

    /// Encodes into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Fails unless `buf` holds at least `n` more bytes.
pub(crate) fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(KestrelError::Codec(format!(
            "truncated {what}: need {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut &[u8], what: &str) -> Result<u16> {
    need(buf, 2, what)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut &[u8], what: &str) -> Result<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

fn get_slice<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    let len = get_u32(buf, what)? as usize;
    need(buf, len, what)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

impl Codec for i32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(*self);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        need(buf, 4, "i32")?;
        Ok(buf.get_i32_le())
    }
    fn encoded_len(&self) -> usize {
        4
    }
}

impl Codec for i64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(*self);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        need(buf, 8, "i64")?;
        Ok(buf.get_i64_le())
    }
    fn encoded_len(&self) -> usize {
        8
    }
}

impl Codec for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        get_u32(buf, "u32")
    }
    fn encoded_len(&self) -> usize {
        4
    }
}

impl Codec for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        get_u64(buf, "u64")
    }
    fn encoded_len(&self) -> usize {
        8
    }
}

impl Codec for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        match get_u8(buf, "bool")? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(KestrelError::Codec(format!("invalid bool byte {other}"))),
        }
    }
    fn encoded_len(&self) -> usize {
        1
    }
}

impl Codec for f64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_f64_le(*self);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        need(buf, 8, "f64")?;
        Ok(buf.get_f64_le())
    }
    fn encoded_len(&self) -> usize {
        8
    }
}

impl Codec for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let raw = get_slice(buf, "string")?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| KestrelError::Codec(format!("invalid utf-8: {e}")))
    }
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }
}

impl Codec for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        get_slice(buf, "bytes").map(Bytes::copy_from_slice)
    }
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }
}

impl Codec for BlockId {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.0);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        get_u64(buf, "block id").map(BlockId)
    }
    fn encoded_len(&self) -> usize {
        8
    }
}

impl Codec for RowId {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.0);
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        get_u64(buf, "row id").map(RowId)
    }
    fn encoded_len(&self) -> usize {
        8
    }
}

impl<T: Codec> Codec for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(0),
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
        }
    }
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        match get_u8(buf, "option flag")? {
            0 => Ok(None),
            1 => T::decode(buf).map(Some),
            other => Err(KestrelError::Codec(format!("invalid option flag {other}"))),
        }
    }
    fn encoded_len(&self) -> usize {
        1 + self.as_ref().map_or(0, Codec::encoded_len)
    }
}
