//! Low level wire primitives.
//!
//! Layout rules (spec §4.1): fixed-size integers little-endian;
//! length-prefixed variable payloads (4-byte length + bytes); C-style
//! null-terminated strings only for the two fields that need them
//! (endpoint, aux); a one-byte version leads every extensible sub-message.
//!
//! Grounded on `srv_config::serialize`/`deserialize` in
//! `examples/original_source/src/srv_config.cxx`, which uses exactly this
//! layout for the cluster-server descriptor.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// A growable little-endian byte writer, the encode-side counterpart of
/// NuRaft's `buffer_serializer`.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(if v { 1 } else { 0 });
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    /// 4-byte length prefix followed by the raw bytes.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// Null-terminated string. `s` must not itself contain a NUL byte.
    pub fn put_cstr(&mut self, s: &str) {
        debug_assert!(!s.as_bytes().contains(&0), "cstr field contains NUL");
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }
}

/// A cursor over a borrowed byte slice, the decode-side counterpart of
/// `Writer`.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            Err(Error::Codec(format!(
                "short buffer: need {} bytes, have {}",
                n,
                self.remaining()
            )))
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    pub fn get_cstr(&mut self) -> Result<String> {
        let start = self.pos;
        let mut end = start;
        while end < self.buf.len() && self.buf[end] != 0 {
            end += 1;
        }
        if end >= self.buf.len() {
            return Err(Error::Codec("unterminated cstr field".into()));
        }
        let s = String::from_utf8(self.buf[start..end].to_vec())
            .map_err(|e| Error::Codec(format!("cstr not utf8: {e}")))?;
        self.pos = end + 1;
        Ok(s)
    }

    /// Assert that every byte was consumed.
    pub fn expect_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            Err(Error::Codec(format!(
                "{} trailing bytes after decode",
                self.remaining()
            )))
        } else {
            Ok(())
        }
    }
}

/// The current on-wire format version for extensible sub-messages
/// (custom notifications, snapshot sync requests).
pub const CURRENT_VERSION: u8 = 0x00;

/// Implemented by every wire type that round-trips: `decode(encode(x)) == x`
/// (spec §8, P1).
pub trait WireCodec: Sized {
    fn encode(&self, w: &mut Writer);
    fn decode(r: &mut Reader) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let v = Self::decode(&mut r)?;
        r.expect_exhausted()?;
        Ok(v)
    }
}
