use crate::audit::error::Error;
use bytes::Bytes;

/// A decoded msgpack value. Only the subset emitted by the audit log is
/// representable: fixmap, str16, bin32 and uint64.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Map(Vec<(Value, Value)>),
    Str(String),
    Bin(Bytes),
    UInt(u64),
}

impl Value {
    #[inline(always)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_bin(&self) -> Option<&Bytes> {
        match self {
            Value::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// Look up a map entry by string key. Maps in the audit log are small
    /// (a handful of keys), a linear scan is enough.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Streaming reader over the record buffer. Each [`MsgpackReader::read`]
/// returns the next decoded value or `None` at end of buffer.
pub struct MsgpackReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MsgpackReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset into the buffer.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn read(&mut self) -> Result<Option<Value>, Error> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let (value, consumed) = decode(self.buf, self.pos)?;
        self.pos += consumed;
        Ok(Some(value))
    }
}

/// Decode one value at `offset`, returning it together with the number of
/// consumed bytes.
pub fn decode(buf: &[u8], offset: usize) -> Result<(Value, usize), Error> {
    let tag = *buf.get(offset).ok_or(Error::Truncated { offset })?;
    match tag {
        0x80..=0x8f => {
            let npairs = (tag & 0x0f) as usize;
            let mut pos = offset + 1;
            let mut pairs = Vec::with_capacity(npairs);
            for _ in 0..npairs {
                let (key, n) = decode(buf, pos)?;
                pos += n;
                let (value, n) = decode(buf, pos)?;
                pos += n;
                pairs.push((key, value));
            }
            Ok((Value::Map(pairs), pos - offset))
        }
        0xda => {
            let len = read_be(buf, offset + 1, 2)? as usize;
            let payload = take(buf, offset + 3, len)?;
            let s = String::from_utf8(payload.to_vec())?;
            Ok((Value::Str(s), 3 + len))
        }
        0xc6 => {
            let len = read_be(buf, offset + 1, 4)? as usize;
            let payload = take(buf, offset + 5, len)?;
            Ok((Value::Bin(Bytes::copy_from_slice(payload)), 5 + len))
        }
        0xcf => {
            let v = read_be(buf, offset + 1, 8)?;
            Ok((Value::UInt(v), 9))
        }
        tag => Err(Error::UnsupportedTag { tag, offset }),
    }
}

fn take(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], Error> {
    buf.get(offset..offset + len)
        .ok_or(Error::Truncated { offset })
}

fn read_be(buf: &[u8], offset: usize, width: usize) -> Result<u64, Error> {
    let bytes = take(buf, offset, width)?;
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}
