//! The canonical trace entry sum type (§3) and its exhaustive tagged
//! encoding/decoding (§6). Modeled as a sealed enum per §9: decode is a
//! match on the leading tag byte, encode is exhaustive so the compiler
//! catches a forgotten variant.

use super::le;
use crate::error::TraceFormatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    Jump = 0,
    Call = 1,
    Return = 2,
}

impl BranchKind {
    fn from_u8(v: u8) -> Result<Self, TraceFormatError> {
        match v {
            0 => Ok(BranchKind::Jump),
            1 => Ok(BranchKind::Call),
            2 => Ok(BranchKind::Return),
            _ => Err(TraceFormatError::UnknownTag { tag: v }),
        }
    }
}

/// Identity of an access site's *kind*, used (together with `instr_img`,
/// `instr_off`) as the key for an access-site child in the consolidated
/// call tree (§4.5). Deliberately drops `is_write` and the access target —
/// those vary per testcase and live in the histogram, not the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Image,
    Heap,
    Stack,
}

/// A single decoded/encodable trace record (§3's table). All offsets are
/// image-relative; resolving them to absolute addresses requires the
/// prefix image table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    ImageMemoryAccess {
        is_write: bool,
        instr_img: i32,
        instr_off: u32,
        mem_img: i32,
        mem_off: u32,
    },
    HeapMemoryAccess {
        is_write: bool,
        instr_img: i32,
        instr_off: u32,
        alloc_id: i32,
        mem_off: u32,
    },
    StackMemoryAccess {
        is_write: bool,
        instr_img: i32,
        instr_off: u32,
        mem_off: u32,
    },
    HeapAllocation {
        id: i32,
        size: u32,
        address: u64,
    },
    HeapFree {
        id: i32,
    },
    Branch {
        src_img: i32,
        src_off: u32,
        dst_img: i32,
        dst_off: u32,
        taken: bool,
        kind: BranchKind,
    },
    StackAllocation {
        instr_img: i32,
        instr_off: u32,
        sp: u64,
    },
}

impl TraceEntry {
    /// `(instr_img, instr_off, kind)` for memory-access variants; `None`
    /// for everything else. This is the access-site key from §4.5.
    pub fn access_site(&self) -> Option<(i32, u32, AccessKind)> {
        match *self {
            TraceEntry::ImageMemoryAccess {
                instr_img, instr_off, ..
            } => Some((instr_img, instr_off, AccessKind::Image)),
            TraceEntry::HeapMemoryAccess {
                instr_img, instr_off, ..
            } => Some((instr_img, instr_off, AccessKind::Heap)),
            TraceEntry::StackMemoryAccess {
                instr_img, instr_off, ..
            } => Some((instr_img, instr_off, AccessKind::Stack)),
            _ => None,
        }
    }

    /// The access target, used to build the per-site histogram.
    pub fn access_target(&self) -> Option<u64> {
        match *self {
            TraceEntry::ImageMemoryAccess { mem_img, mem_off, .. } => {
                Some(((mem_img as i64) << 32 | mem_off as i64) as u64)
            }
            TraceEntry::HeapMemoryAccess {
                alloc_id, mem_off, ..
            } => Some(((alloc_id as i64) << 32 | mem_off as i64) as u64),
            TraceEntry::StackMemoryAccess { mem_off, .. } => Some(mem_off as u64),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            TraceEntry::ImageMemoryAccess { .. } => 1,
            TraceEntry::HeapMemoryAccess { .. } => 2,
            TraceEntry::StackMemoryAccess { .. } => 3,
            TraceEntry::HeapAllocation { .. } => 4,
            TraceEntry::HeapFree { .. } => 5,
            TraceEntry::Branch { .. } => 6,
            TraceEntry::StackAllocation { .. } => 7,
        }
    }

    /// Append this entry's wire encoding (tag byte + fixed payload) to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        le::push_u8(out, self.tag());
        match *self {
            TraceEntry::ImageMemoryAccess {
                is_write,
                instr_img,
                instr_off,
                mem_img,
                mem_off,
            } => {
                le::push_u8(out, is_write as u8);
                le::push_i32(out, instr_img);
                le::push_u32(out, instr_off);
                le::push_i32(out, mem_img);
                le::push_u32(out, mem_off);
            }
            TraceEntry::HeapMemoryAccess {
                is_write,
                instr_img,
                instr_off,
                alloc_id,
                mem_off,
            } => {
                le::push_u8(out, is_write as u8);
                le::push_i32(out, instr_img);
                le::push_u32(out, instr_off);
                le::push_i32(out, alloc_id);
                le::push_u32(out, mem_off);
            }
            TraceEntry::StackMemoryAccess {
                is_write,
                instr_img,
                instr_off,
                mem_off,
            } => {
                le::push_u8(out, is_write as u8);
                le::push_i32(out, instr_img);
                le::push_u32(out, instr_off);
                le::push_u32(out, mem_off);
            }
            TraceEntry::HeapAllocation { id, size, address } => {
                le::push_i32(out, id);
                le::push_u32(out, size);
                le::push_u64(out, address);
            }
            TraceEntry::HeapFree { id } => {
                le::push_i32(out, id);
            }
            TraceEntry::Branch {
                src_img,
                src_off,
                dst_img,
                dst_off,
                taken,
                kind,
            } => {
                le::push_i32(out, src_img);
                le::push_u32(out, src_off);
                le::push_i32(out, dst_img);
                le::push_u32(out, dst_off);
                le::push_u8(out, taken as u8);
                le::push_u8(out, kind as u8);
            }
            TraceEntry::StackAllocation {
                instr_img,
                instr_off,
                sp,
            } => {
                le::push_i32(out, instr_img);
                le::push_u32(out, instr_off);
                le::push_u64(out, sp);
            }
        }
    }

    /// Decode one entry starting at `buf`. Returns the entry and the
    /// remaining (unconsumed) slice.
    pub fn decode(buf: &[u8]) -> Result<(TraceEntry, &[u8]), TraceFormatError> {
        let (tag, rest) = le::read_u8(buf)?;
        match tag {
            1 => {
                let (is_write, rest) = le::read_u8(rest)?;
                let (instr_img, rest) = le::read_i32(rest)?;
                let (instr_off, rest) = le::read_u32(rest)?;
                let (mem_img, rest) = le::read_i32(rest)?;
                let (mem_off, rest) = le::read_u32(rest)?;
                Ok((
                    TraceEntry::ImageMemoryAccess {
                        is_write: is_write != 0,
                        instr_img,
                        instr_off,
                        mem_img,
                        mem_off,
                    },
                    rest,
                ))
            }
            2 => {
                let (is_write, rest) = le::read_u8(rest)?;
                let (instr_img, rest) = le::read_i32(rest)?;
                let (instr_off, rest) = le::read_u32(rest)?;
                let (alloc_id, rest) = le::read_i32(rest)?;
                let (mem_off, rest) = le::read_u32(rest)?;
                Ok((
                    TraceEntry::HeapMemoryAccess {
                        is_write: is_write != 0,
                        instr_img,
                        instr_off,
                        alloc_id,
                        mem_off,
                    },
                    rest,
                ))
            }
            3 => {
                let (is_write, rest) = le::read_u8(rest)?;
                let (instr_img, rest) = le::read_i32(rest)?;
                let (instr_off, rest) = le::read_u32(rest)?;
                let (mem_off, rest) = le::read_u32(rest)?;
                Ok((
                    TraceEntry::StackMemoryAccess {
                        is_write: is_write != 0,
                        instr_img,
                        instr_off,
                        mem_off,
                    },
                    rest,
                ))
            }
            4 => {
                let (id, rest) = le::read_i32(rest)?;
                let (size, rest) = le::read_u32(rest)?;
                let (address, rest) = le::read_u64(rest)?;
                Ok((TraceEntry::HeapAllocation { id, size, address }, rest))
            }
            5 => {
                let (id, rest) = le::read_i32(rest)?;
                Ok((TraceEntry::HeapFree { id }, rest))
            }
            6 => {
                let (src_img, rest) = le::read_i32(rest)?;
                let (src_off, rest) = le::read_u32(rest)?;
                let (dst_img, rest) = le::read_i32(rest)?;
                let (dst_off, rest) = le::read_u32(rest)?;
                let (taken, rest) = le::read_u8(rest)?;
                let (kind, rest) = le::read_u8(rest)?;
                Ok((
                    TraceEntry::Branch {
                        src_img,
                        src_off,
                        dst_img,
                        dst_off,
                        taken: taken != 0,
                        kind: BranchKind::from_u8(kind)?,
                    },
                    rest,
                ))
            }
            7 => {
                let (instr_img, rest) = le::read_i32(rest)?;
                let (instr_off, rest) = le::read_u32(rest)?;
                let (sp, rest) = le::read_u64(rest)?;
                Ok((
                    TraceEntry::StackAllocation {
                        instr_img,
                        instr_off,
                        sp,
                    },
                    rest,
                ))
            }
            other => Err(TraceFormatError::UnknownTag { tag: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(e: TraceEntry) {
        let mut buf = Vec::new();
        e.encode(&mut buf);
        let (decoded, rest) = TraceEntry::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, e);
    }

    #[test]
    fn roundtrips_every_variant() {
        roundtrip(TraceEntry::ImageMemoryAccess {
            is_write: false,
            instr_img: 0,
            instr_off: 0x30,
            mem_img: 1,
            mem_off: 0x10,
        });
        roundtrip(TraceEntry::HeapMemoryAccess {
            is_write: true,
            instr_img: 2,
            instr_off: 4,
            alloc_id: 7,
            mem_off: 0,
        });
        roundtrip(TraceEntry::StackMemoryAccess {
            is_write: false,
            instr_img: 0,
            instr_off: 0,
            mem_off: 0,
        });
        roundtrip(TraceEntry::HeapAllocation {
            id: 3,
            size: 64,
            address: 0x10000,
        });
        roundtrip(TraceEntry::HeapFree { id: 3 });
        roundtrip(TraceEntry::Branch {
            src_img: 0,
            src_off: 0x10,
            dst_img: 0,
            dst_off: 0x20,
            taken: true,
            kind: BranchKind::Call,
        });
        roundtrip(TraceEntry::StackAllocation {
            instr_img: 0,
            instr_off: 0,
            sp: u64::MAX,
        });
    }

    #[test]
    fn roundtrips_max_size_offsets() {
        roundtrip(TraceEntry::ImageMemoryAccess {
            is_write: true,
            instr_img: i32::MAX,
            instr_off: u32::MAX,
            mem_img: i32::MIN,
            mem_off: u32::MAX,
        });
    }

    #[test]
    fn unknown_tag_is_a_format_error() {
        let buf = [0xFFu8];
        let err = TraceEntry::decode(&buf).unwrap_err();
        assert!(matches!(err, TraceFormatError::UnknownTag { tag: 0xFF }));
    }

    #[test]
    fn truncated_payload_is_a_format_error() {
        // Branch tag (6) with only 1 payload byte instead of 15.
        let buf = [6u8, 0u8];
        let err = TraceEntry::decode(&buf).unwrap_err();
        assert!(matches!(err, TraceFormatError::Truncated { .. }));
    }
}
