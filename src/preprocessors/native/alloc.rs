//! Per-testcase allocation bookkeeping (§4.3): a pending-size stack fed by
//! `AllocSize` records, and a live-allocation map keyed by address, seeded
//! from the prefix's own allocations and owned exclusively by the worker
//! processing one testcase (§5: "not shared across testcases; each worker
//! owns a copy seeded from the prefix map").

use std::collections::HashMap;

use crate::entity::Allocation;
use crate::error::ResolveError;
use crate::format::TraceEntry;

pub struct AllocState {
    pending_sizes: Vec<u32>,
    live: HashMap<u64, Allocation>,
    next_alloc_id: i32,
}

impl AllocState {
    pub fn seeded_from(prefix_allocations: &HashMap<i32, Allocation>, next_alloc_id: i32) -> Self {
        let live = prefix_allocations.values().map(|a| (a.address, *a)).collect();
        Self {
            pending_sizes: Vec::new(),
            live,
            next_alloc_id,
        }
    }

    pub fn on_alloc_size(&mut self, size: u32) {
        self.pending_sizes.push(size);
    }

    pub fn on_alloc_ret(&mut self, address: u64) -> Result<TraceEntry, ResolveError> {
        if self.live.contains_key(&address) {
            return Err(ResolveError::DoubleAllocReturn { address });
        }
        let size = self
            .pending_sizes
            .pop()
            .ok_or(ResolveError::EmptyAllocSizeStack)?;
        let id = self.next_alloc_id;
        self.next_alloc_id += 1;
        self.live.insert(address, Allocation { id, address, size });
        Ok(TraceEntry::HeapAllocation { id, size, address })
    }

    pub fn on_free(&mut self, address: u64) -> Result<TraceEntry, ResolveError> {
        match self.live.remove(&address) {
            Some(alloc) => Ok(TraceEntry::HeapFree { id: alloc.id }),
            None => Err(ResolveError::MissingAllocation { address }),
        }
    }

    /// Resolve a memory address to `(alloc_id, offset)` inside a live block.
    pub fn resolve(&self, addr: u64) -> Option<(i32, u32)> {
        self.live
            .values()
            .find(|a| addr >= a.address && addr < a.address + a.size as u64)
            .map(|a| (a.id, (addr - a.address) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_round_trips() {
        let mut state = AllocState::seeded_from(&HashMap::new(), 0);
        state.on_alloc_size(16);
        let entry = state.on_alloc_ret(0xA000).unwrap();
        assert!(matches!(
            entry,
            TraceEntry::HeapAllocation {
                id: 0,
                size: 16,
                address: 0xA000
            }
        ));
        assert_eq!(state.resolve(0xA008), Some((0, 8)));
        let freed = state.on_free(0xA000).unwrap();
        assert!(matches!(freed, TraceEntry::HeapFree { id: 0 }));
        assert_eq!(state.resolve(0xA008), None);
    }

    #[test]
    fn alloc_ret_without_pending_size_is_an_error() {
        let mut state = AllocState::seeded_from(&HashMap::new(), 0);
        assert!(matches!(
            state.on_alloc_ret(0xA000),
            Err(ResolveError::EmptyAllocSizeStack)
        ));
    }

    #[test]
    fn double_return_without_intervening_alloc_size_is_an_error() {
        let mut state = AllocState::seeded_from(&HashMap::new(), 0);
        state.on_alloc_size(16);
        state.on_alloc_ret(0xA000).unwrap();
        assert!(matches!(
            state.on_alloc_ret(0xA000),
            Err(ResolveError::DoubleAllocReturn { address: 0xA000 })
        ));
    }

    #[test]
    fn free_of_unknown_address_is_an_error() {
        let mut state = AllocState::seeded_from(&HashMap::new(), 0);
        assert!(matches!(
            state.on_free(0xBEEF),
            Err(ResolveError::MissingAllocation { address: 0xBEEF })
        ));
    }

    #[test]
    fn seeds_live_map_from_prefix_allocations() {
        let mut prefix = HashMap::new();
        prefix.insert(
            3,
            Allocation {
                id: 3,
                address: 0x1000,
                size: 32,
            },
        );
        let state = AllocState::seeded_from(&prefix, 4);
        assert_eq!(state.resolve(0x1010), Some((3, 0x10)));
    }
}
