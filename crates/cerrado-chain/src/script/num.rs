//! Script number encoding: little-endian, minimally encoded, sign in the
//! most significant bit of the highest byte.
//!
//! Reads accept at most four magnitude bytes, plus a fifth byte when it
//! only carries the sign (0x00 or 0x80). That fifth byte shows up in
//! practice on sequence comparisons and on values right at the 32-bit
//! boundary.

use super::ScriptError;

/// Decode a stack value into a number.
pub fn arithmetic_read(data: &[u8]) -> Result<i64, ScriptError> {
    if data.is_empty() {
        return Ok(0);
    }
    if data.len() > 8 {
        return Err(ScriptError::NumberTooLong(data.len()));
    }

    let top = *data.last().expect("checked non-empty");
    let negative = top & 0x80 != 0;
    // A pure sign byte extends the allowed width by one
    let sign_only_top = top == 0x80 || top == 0x00;
    let max_len = if sign_only_top { 5 } else { 4 };
    if data.len() > max_len {
        return Err(ScriptError::NumberTooLong(data.len()));
    }

    let mut magnitude: u64 = 0;
    for (i, byte) in data.iter().enumerate() {
        let mut byte = *byte;
        if i == data.len() - 1 {
            byte &= 0x7f;
        }
        magnitude |= (byte as u64) << (8 * i);
    }

    if negative {
        Ok(-(magnitude as i64))
    } else {
        Ok(magnitude as i64)
    }
}

/// Encode a number into minimal stack form. Zero is the empty vector.
pub fn arithmetic_write(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }

    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while magnitude > 0 {
        out.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }

    let top = *out.last().expect("non-zero value has bytes");
    if top & 0x80 != 0 {
        // Top bit is taken, append a pure sign byte
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *out.last_mut().expect("non-empty") |= 0x80;
    }
    out
}

/// A stack value is true when it has a byte that isn't zero, ignoring a
/// possible 0x80 sign marker in the last position.
pub fn is_truthy(data: &[u8]) -> bool {
    for (i, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // A lone sign bit on the last byte is negative zero
            if i == data.len() - 1 && *byte == 0x80 {
                return false;
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    fn read_hex(hex: &str) -> Result<i64, ScriptError> {
        arithmetic_read(&hex::decode(hex).unwrap())
    }

    fn write_hex(value: i64) -> String {
        hex::encode(arithmetic_write(value))
    }

    #[test]
    fn read_known_vectors() {
        assert_eq!(read_hex("ffffff7f").unwrap(), 0x7fffffff);
        assert_eq!(read_hex("ffffffff").unwrap(), -0x7fffffff);
        assert_eq!(read_hex("ffffffff80").unwrap(), -0xffffffff);
        assert_eq!(read_hex("feffffff80").unwrap(), -0xfffffffe);
        assert_eq!(read_hex("6e").unwrap(), 0x6e);
        assert_eq!(read_hex("feffffff00").unwrap(), 0xfffffffe);
        assert_eq!(read_hex("82").unwrap(), -2);
    }

    #[test]
    fn write_known_vectors() {
        assert_eq!(write_hex(0x7fffffff), "ffffff7f");
        assert_eq!(write_hex(-0x7fffffff), "ffffffff");
        assert_eq!(write_hex(-0xffffffff), "ffffffff80");
        assert_eq!(write_hex(-0xfffffffe), "feffffff80");
        assert_eq!(write_hex(0x6e), "6e");
        assert_eq!(write_hex(0xfffffffe), "feffffff00");
        assert_eq!(write_hex(-2), "82");
    }

    #[test]
    fn zero_is_empty() {
        assert_eq!(arithmetic_write(0), Vec::<u8>::new());
        assert_eq!(arithmetic_read(&[]).unwrap(), 0);
    }

    #[test]
    fn write_read_round_trip() {
        for value in [
            0,
            1,
            -1,
            127,
            128,
            -127,
            -128,
            255,
            256,
            0x7fffffff,
            -0x7fffffff,
            0xffffffff,
            -0xffffffff,
        ] {
            let bytes = arithmetic_write(value);
            assert_eq!(arithmetic_read(&bytes).unwrap(), value, "value {value}");
        }
    }

    #[test]
    fn oversized_reads_fail() {
        // Five bytes with a magnitude-carrying top byte
        assert!(read_hex("ffffffff7f").is_err());
        // Anything past eight bytes
        assert!(read_hex("ffffffffffffffffff").is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&[]));
        assert!(!is_truthy(&[0x00]));
        assert!(!is_truthy(&[0x00, 0x00]));
        assert!(!is_truthy(&[0x80])); // negative zero
        assert!(!is_truthy(&[0x00, 0x80])); // negative zero, wide
        assert!(is_truthy(&[0x01]));
        assert!(is_truthy(&[0x00, 0x01]));
        assert!(is_truthy(&[0x80, 0x00]));
    }
}
