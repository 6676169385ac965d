//! Safe little-endian slice decoders/encoders (§9: prefer safe slice-based
//! decoders over raw pointer arithmetic; the one place we still reach for
//! `unsafe` is isolated behind `read_at`/`write_at`-shaped helpers — here we
//! don't even need that, since every payload is a small fixed shape).

use crate::error::TraceFormatError;

pub fn need(buf: &[u8], n: usize) -> Result<(), TraceFormatError> {
    if buf.len() < n {
        Err(TraceFormatError::Truncated {
            needed: n,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}

pub fn read_u8(buf: &[u8]) -> Result<(u8, &[u8]), TraceFormatError> {
    need(buf, 1)?;
    Ok((buf[0], &buf[1..]))
}

pub fn read_i32(buf: &[u8]) -> Result<(i32, &[u8]), TraceFormatError> {
    need(buf, 4)?;
    let (head, rest) = buf.split_at(4);
    Ok((i32::from_le_bytes(head.try_into().unwrap()), rest))
}

pub fn read_u32(buf: &[u8]) -> Result<(u32, &[u8]), TraceFormatError> {
    need(buf, 4)?;
    let (head, rest) = buf.split_at(4);
    Ok((u32::from_le_bytes(head.try_into().unwrap()), rest))
}

pub fn read_u64(buf: &[u8]) -> Result<(u64, &[u8]), TraceFormatError> {
    need(buf, 8)?;
    let (head, rest) = buf.split_at(8);
    Ok((u64::from_le_bytes(head.try_into().unwrap()), rest))
}

pub fn push_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn push_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}
