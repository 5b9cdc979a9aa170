//! The extensible byte serialised ("BS") unsigned integer encoding.
//!
//! Values are written big-endian in 7 bit groups, every octet except the last one has its high
//! bit set. So `0` is `00`, `127` is `7f`, `128` is `81 00` and `16384` is `81 80 00`. The same
//! encoding is used for hash tags, block flags and spans, data record headers and index entries.

use std::io::{self, Read};

use crate::DecodeError;

/// The maximum number of octets a `u64` can occupy once encoded.
pub const MAX_ENCODED_LEN: usize = 10;

/// Append the encoding of `n` to `buf`.
pub fn put_uint(buf: &mut Vec<u8>, mut n: u64) {
    let mut tmp = [0u8; MAX_ENCODED_LEN];
    let mut i = MAX_ENCODED_LEN - 1;
    tmp[i] = (n & 0x7f) as u8;
    n >>= 7;
    while n > 0 {
        i -= 1;
        tmp[i] = 0x80 | (n & 0x7f) as u8;
        n >>= 7;
    }
    buf.extend_from_slice(&tmp[i..]);
}

/// Returns the encoding of `n` as a new vector.
pub fn encode_uint(n: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(n));
    put_uint(&mut buf, n);
    buf
}

/// Returns the number of octets used to encode `n`.
#[inline]
pub const fn encoded_len(n: u64) -> usize {
    let bits = 64 - n.leading_zeros() as usize;
    if bits == 0 { 1 } else { bits.div_ceil(7) }
}

/// Decode an unsigned integer starting at `offset`. Returns the value and the offset just past
/// the encoded integer.
pub fn get_uint(bs: &[u8], mut offset: usize) -> Result<(u64, usize), DecodeError> {
    let start = offset;
    let mut n: u64 = 0;
    loop {
        let Some(&b) = bs.get(offset) else {
            return Err(DecodeError::Truncated {
                offset: start,
                needed: 1,
            });
        };
        if n > (u64::MAX >> 7) {
            return Err(DecodeError::VarintOverflow { offset: start });
        }
        n = (n << 7) | (b & 0x7f) as u64;
        offset += 1;
        if b & 0x80 == 0 {
            return Ok((n, offset));
        }
    }
}

/// Append a run length encoded chunk of data: `BS(len) + data`.
pub fn put_data(buf: &mut Vec<u8>, data: &[u8]) {
    put_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Decode a run length encoded chunk of data, returning the payload slice and the offset just
/// past it.
pub fn get_data(bs: &[u8], offset: usize) -> Result<(&[u8], usize), DecodeError> {
    let (len, offset) = get_uint(bs, offset)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::VarintOverflow { offset })?;
    let end = offset.checked_add(len).ok_or(DecodeError::VarintOverflow { offset })?;
    if end > bs.len() {
        return Err(DecodeError::Truncated {
            offset,
            needed: end - bs.len(),
        });
    }
    Ok((&bs[offset..end], end))
}

/// Read one encoded integer from a stream. Returns `Ok(None)` on a clean end of stream before
/// the first octet, otherwise the value and the number of octets consumed.
pub fn read_uint<R: Read>(reader: &mut R) -> io::Result<Option<(u64, usize)>> {
    let mut n: u64 = 0;
    let mut consumed = 0;
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) if consumed == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if n > (u64::MAX >> 7) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint overflows a u64",
            ));
        }
        let b = byte[0];
        n = (n << 7) | (b & 0x7f) as u64;
        consumed += 1;
        if b & 0x80 == 0 {
            return Ok(Some((n, consumed)));
        }
    }
}
