//! Varint encoding and decoding functions.
//!
//! We use Protobuf's [Base-128 varint] encoding.
//!
//! Unsigned integers are split into 7-bit chunks, with the least significant
//! chunk first. Each chunk is placed in the low 7 bits of a byte.
//! Non-terminal bytes have the high bit set. The final byte in an integer has
//! the high bit zeroed.
//!
//! A useful consequence of the terminal-byte rule is that no varint encoding
//! is a strict prefix of another, so column layouts that lead with a varint
//! discriminator form contiguous lexicographic ranges per discriminator.
//!
//! [Base-128 varint]: https://protobuf.dev/programming-guides/encoding/#varints

use crate::buffer::{BufReader, BufWriter, DecodeError};

#[inline]
pub fn encode_varint(mut value: u64, out: &mut impl BufWriter) {
    loop {
        if value < 0x80 {
            out.put_u8(value as u8);
            break;
        } else {
            out.put_u8(((value & 0x7f) | 0x80) as u8);
            value >>= 7;
        }
    }
}

/// Number of bytes [`encode_varint`] produces for `value`.
#[inline]
pub fn varint_len(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        // ceil(bit_len / 7)
        (70 - value.leading_zeros() as usize) / 7
    }
}

#[inline]
pub fn decode_varint<'a>(reader: &mut impl BufReader<'a>) -> Result<u64, DecodeError> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let byte = reader.get_u8()?;
        if shift == 63 && byte > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        if (byte & 0x80) == 0 {
            result |= (byte as u64) << shift;
            return Ok(result);
        } else {
            result |= ((byte & 0x7f) as u64) << shift;
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::VarintOverflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn varint_roundtrip(val in any::<u64>()) {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf);
            assert_eq!(val, decode_varint(&mut buf.as_slice()).unwrap());
        }

        #[test]
        fn varint_len_matches(val in any::<u64>()) {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf);
            assert_eq!(buf.len(), varint_len(val));
        }
    }

    #[test]
    fn one_byte_boundary() {
        for (val, len) in [(0u64, 1), (0x7f, 1), (0x80, 2), (0x3fff, 2), (0x4000, 3)] {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf);
            assert_eq!(buf.len(), len, "value {val:#x}");
        }
    }

    #[test]
    fn overlong_input_is_rejected() {
        // 11 continuation bytes cannot fit into u64.
        let buf = [0xff; 11];
        assert_eq!(
            decode_varint(&mut buf.as_slice()),
            Err(DecodeError::VarintOverflow)
        );
    }
}
