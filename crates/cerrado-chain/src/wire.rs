//! Wire serialization: little-endian integers, compact (variable length)
//! integers and the [Readable]/[Writable] capability traits every
//! protocol structure implements. Byte-exact with the reference
//! protocol.

use std::io::Read;
use std::io::Write;

use cerrado_common::Hash256;

use crate::error::WireError;

/// Upper bound for any single length-prefixed allocation. Nothing in a
/// valid message is larger than a full block.
pub const MAX_ALLOCATION: u64 = 0x0800_0000; // 128 MiB

/// Types that serialize themselves into a byte sink.
pub trait Writable {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out).expect("writing to a Vec can't fail");
        out
    }

    fn serialized_size(&self) -> usize {
        self.serialize().len()
    }
}

/// Types that parse themselves from a byte source.
pub trait Readable: Sized {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError>;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = bytes;
        Self::read(&mut cursor)
    }
}

pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8, WireError> {
    let mut buf = [0; 1];
    reader
        .read_exact(&mut buf)
        .map_err(|_| WireError::UnexpectedEnd)?;
    Ok(buf[0])
}

pub fn read_u16<R: Read>(reader: &mut R) -> Result<u16, WireError> {
    let mut buf = [0; 2];
    reader
        .read_exact(&mut buf)
        .map_err(|_| WireError::UnexpectedEnd)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32, WireError> {
    let mut buf = [0; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| WireError::UnexpectedEnd)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64, WireError> {
    let mut buf = [0; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| WireError::UnexpectedEnd)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_i32<R: Read>(reader: &mut R) -> Result<i32, WireError> {
    Ok(read_u32(reader)? as i32)
}

pub fn read_i64<R: Read>(reader: &mut R) -> Result<i64, WireError> {
    Ok(read_u64(reader)? as i64)
}

/// Read exactly `len` bytes, refusing lengths no valid message carries.
pub fn read_bytes<R: Read>(reader: &mut R, len: u64) -> Result<Vec<u8>, WireError> {
    if len > MAX_ALLOCATION {
        return Err(WireError::OversizedAllocation(len));
    }
    let mut buf = vec![0; len as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|_| WireError::UnexpectedEnd)?;
    Ok(buf)
}

/// Size in bytes of the compact integer encoding for `value`.
pub fn compact_int_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Write a compact integer: one byte below 0xfd, otherwise a prefix byte
/// followed by 2, 4 or 8 little-endian bytes.
pub fn write_compact_int<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    match value {
        0..=0xfc => writer.write_all(&[value as u8]),
        0xfd..=0xffff => {
            writer.write_all(&[0xfd])?;
            writer.write_all(&(value as u16).to_le_bytes())
        }
        0x10000..=0xffff_ffff => {
            writer.write_all(&[0xfe])?;
            writer.write_all(&(value as u32).to_le_bytes())
        }
        _ => {
            writer.write_all(&[0xff])?;
            writer.write_all(&value.to_le_bytes())
        }
    }
}

pub fn read_compact_int<R: Read>(reader: &mut R) -> Result<u64, WireError> {
    match read_u8(reader)? {
        0xfd => Ok(read_u16(reader)? as u64),
        0xfe => Ok(read_u32(reader)? as u64),
        0xff => read_u64(reader),
        byte => Ok(byte as u64),
    }
}

/// A length-prefixed byte vector, as scripts appear on the wire.
pub fn write_var_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    write_compact_int(writer, bytes.len() as u64)?;
    writer.write_all(bytes)
}

pub fn read_var_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let len = read_compact_int(reader)?;
    read_bytes(reader, len)
}

impl Writable for Hash256 {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.as_bytes())
    }
}

impl Readable for Hash256 {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let mut buf = [0; 32];
        reader
            .read_exact(&mut buf)
            .map_err(|_| WireError::UnexpectedEnd)?;
        Ok(Hash256::from_bytes(buf))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(value: u64) -> u64 {
        let mut buf = Vec::new();
        write_compact_int(&mut buf, value).unwrap();
        assert_eq!(buf.len(), compact_int_size(value));
        read_compact_int(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn compact_int_round_trips() {
        for value in [
            0,
            1,
            0xfc,
            0xfd,
            0xffff,
            0x10000,
            0xffff_ffff,
            0x1_0000_0000,
            u64::MAX,
        ] {
            assert_eq!(round_trip(value), value);
        }
    }

    #[test]
    fn compact_int_prefixes() {
        let mut buf = Vec::new();
        write_compact_int(&mut buf, 0xfd).unwrap();
        assert_eq!(buf, [0xfd, 0xfd, 0x00]);

        buf.clear();
        write_compact_int(&mut buf, 0x10000).unwrap();
        assert_eq!(buf, [0xfe, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = [0xfd, 0x01];
        assert_eq!(
            read_compact_int(&mut bytes.as_slice()),
            Err(WireError::UnexpectedEnd)
        );
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        write_compact_int(&mut buf, u64::MAX).unwrap();
        // Claimed length is absurd, must not try to allocate it
        assert!(matches!(
            read_var_bytes(&mut buf.as_slice()),
            Err(WireError::OversizedAllocation(_))
        ));
    }

    #[test]
    fn var_bytes_round_trip() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, b"spend me").unwrap();
        assert_eq!(read_var_bytes(&mut buf.as_slice()).unwrap(), b"spend me");
    }
}
