//! Decoding of the native tracer's packed 32-byte raw record (§4.3).
//!
//! ```text
//! type: u32, flag: u8, pad[3]: u8, param1: u64, param2: u64, reserved[8]
//! ```
//! The trailing 8 bytes are unused padding bringing each record up to the
//! documented 32-byte stride.

use crate::error::TraceFormatError;

pub const RAW_RECORD_SIZE: usize = 32;

pub const FLAG_TAKEN: u8 = 1;
pub const FLAG_JUMP: u8 = 2;
pub const FLAG_CALL: u8 = 4;
pub const FLAG_RETURN: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawRecordType {
    MemRead,
    MemWrite,
    AllocSize,
    AllocRet,
    FreeParam,
    Branch,
    StackPtr,
}

impl RawRecordType {
    fn from_u32(v: u32) -> Result<Self, TraceFormatError> {
        match v {
            1 => Ok(RawRecordType::MemRead),
            2 => Ok(RawRecordType::MemWrite),
            3 => Ok(RawRecordType::AllocSize),
            4 => Ok(RawRecordType::AllocRet),
            5 => Ok(RawRecordType::FreeParam),
            6 => Ok(RawRecordType::Branch),
            7 => Ok(RawRecordType::StackPtr),
            other => Err(TraceFormatError::UnknownTag { tag: other as u8 }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawRecord {
    pub kind: RawRecordType,
    pub flag: u8,
    pub param1: u64,
    pub param2: u64,
}

impl RawRecord {
    pub fn taken(&self) -> bool {
        self.flag & FLAG_TAKEN != 0
    }

    pub fn is_jump(&self) -> bool {
        self.flag & FLAG_JUMP != 0
    }

    pub fn is_call(&self) -> bool {
        self.flag & FLAG_CALL != 0
    }

    pub fn is_return(&self) -> bool {
        self.flag & FLAG_RETURN != 0
    }

    fn decode(buf: &[u8; RAW_RECORD_SIZE]) -> Result<Self, TraceFormatError> {
        let kind = RawRecordType::from_u32(u32::from_le_bytes(buf[0..4].try_into().unwrap()))?;
        let flag = buf[4];
        let param1 = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let param2 = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        Ok(Self {
            kind,
            flag,
            param1,
            param2,
        })
    }
}

/// Splits `bytes` into fixed 32-byte records and decodes each in order.
/// A trailing partial record is a truncation error.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<RawRecord>, TraceFormatError> {
    if bytes.len() % RAW_RECORD_SIZE != 0 {
        return Err(TraceFormatError::Truncated {
            needed: RAW_RECORD_SIZE,
            have: bytes.len() % RAW_RECORD_SIZE,
        });
    }
    bytes
        .chunks_exact(RAW_RECORD_SIZE)
        .map(|chunk| RawRecord::decode(chunk.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_bytes(ty: u32, flag: u8, param1: u64, param2: u64) -> [u8; RAW_RECORD_SIZE] {
        let mut buf = [0u8; RAW_RECORD_SIZE];
        buf[0..4].copy_from_slice(&ty.to_le_bytes());
        buf[4] = flag;
        buf[8..16].copy_from_slice(&param1.to_le_bytes());
        buf[16..24].copy_from_slice(&param2.to_le_bytes());
        buf
    }

    #[test]
    fn decodes_a_branch_record_with_flags() {
        let bytes = record_bytes(6, FLAG_TAKEN | FLAG_CALL, 0x1010, 0x1020);
        let records = decode_all(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].kind, RawRecordType::Branch));
        assert!(records[0].taken());
        assert!(records[0].is_call());
        assert!(!records[0].is_return());
    }

    #[test]
    fn rejects_unknown_type() {
        let bytes = record_bytes(99, 0, 0, 0);
        assert!(decode_all(&bytes).is_err());
    }

    #[test]
    fn rejects_truncated_stream() {
        let bytes = vec![0u8; RAW_RECORD_SIZE - 1];
        assert!(decode_all(&bytes).is_err());
    }
}
