//! Serialize data into the wire protocol.
use bytes::{BufMut, Bytes};

use crate::error::Result;

/// A value that knows how to render itself into a protocol buffer.
pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for u8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u8(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for u32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u32(*self);
        Ok(())
    }
}

impl ToByte for u64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u64(*self);
        Ok(())
    }
}

/// Strings are a u16 length followed by UTF-8 bytes.
impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u16(self.len() as u16);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

/// Nullable strings use an i16 length with -1 encoding null.
pub fn encode_nullable_string<T: BufMut>(buffer: &mut T, value: Option<&str>) -> Result<()> {
    match value {
        Some(s) => {
            buffer.put_i16(s.len() as i16);
            buffer.put(s.as_bytes());
        }
        None => buffer.put_i16(-1),
    }
    Ok(())
}

/// Raw byte blobs are an i32 length followed by the bytes.
impl ToByte for Bytes {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(self.len() as i32);
        buffer.put(self.as_ref());
        Ok(())
    }
}

/// Optional values prefixed by a one-byte presence flag.
pub fn encode_optional<V: ToByte, T: BufMut>(buffer: &mut T, value: Option<&V>) -> Result<()> {
    match value {
        Some(v) => {
            buffer.put_u8(1);
            v.encode(buffer)?;
        }
        None => buffer.put_u8(0),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_str_length_prefix() {
        let mut buf = Vec::new();
        "alpha".encode(&mut buf).unwrap();
        assert_eq!(&buf[..2], &5u16.to_be_bytes());
        assert_eq!(&buf[2..], b"alpha");
    }

    #[test]
    fn test_encode_nullable_string_null() {
        let mut buf = Vec::new();
        encode_nullable_string(&mut buf, None).unwrap();
        assert_eq!(buf, (-1i16).to_be_bytes());
    }

    #[test]
    fn test_encode_bytes_blob() {
        let mut buf = Vec::new();
        Bytes::from_static(b"xyz").encode(&mut buf).unwrap();
        assert_eq!(&buf[..4], &3i32.to_be_bytes());
        assert_eq!(&buf[4..], b"xyz");
    }

    #[test]
    fn test_encode_optional_flags() {
        let mut buf = Vec::new();
        encode_optional::<u32, _>(&mut buf, None).unwrap();
        assert_eq!(buf, [0]);

        let mut buf = Vec::new();
        encode_optional(&mut buf, Some(&7u32)).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..], &7u32.to_be_bytes());
    }
}
