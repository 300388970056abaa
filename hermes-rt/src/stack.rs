//!
//! Short traversal stacks.
//!
//! Stack pointers are entry indices that advance by `stride()` per push, so
//! that lanes sharing one memory region interleave (`slot = lane + k * lanes`)
//! without overlapping.
//!
use crate::config::{SCRATCH_STACK_ENTRIES, SHARED_STACK_ENTRIES};

pub trait TraversalStack {
    /// Initial stack pointer; always smaller than `stride()`.
    fn base(&self) -> i32;
    fn stride(&self) -> i32;
    /// Number of entries kept before older entries get overwritten.
    /// `None` if entries are never lost.
    fn capacity(&self) -> Option<u32>;
    fn store(&mut self, index: i32, node: u32);
    fn load(&mut self, index: i32) -> u32;
    /// Called before a box node pushes up to three entries.
    fn check_overflow(&mut self, _stack: i32) {}
}

///
/// Per-lane ring stack in private memory.
///
#[derive(Clone, Debug)]
pub struct ScratchStack {
    entries: Vec<u32>,
}

impl Default for ScratchStack {
    fn default() -> Self {
        Self::new(SCRATCH_STACK_ENTRIES)
    }
}

impl ScratchStack {
    pub fn new(entries: u32) -> Self {
        Self {
            entries: vec![0; entries.max(1) as usize],
        }
    }
    fn slot(&self, index: i32) -> usize {
        index.rem_euclid(self.entries.len() as i32) as usize
    }
}

impl TraversalStack for ScratchStack {
    fn base(&self) -> i32 {
        0
    }
    fn stride(&self) -> i32 {
        1
    }
    fn capacity(&self) -> Option<u32> {
        Some(self.entries.len() as u32)
    }
    fn store(&mut self, index: i32, node: u32) {
        let slot = self.slot(index);
        self.entries[slot] = node;
    }
    fn load(&mut self, index: i32) -> u32 {
        self.entries[self.slot(index)]
    }
}

///
/// Lane partition of a workgroup shared ring stack.
///
#[derive(Debug)]
pub struct SharedStack<'a> {
    memory: &'a mut [u32],
    lane: u32,
    lanes: u32,
    entries: u32,
}

impl<'a> SharedStack<'a> {
    /// `memory` has to hold at least `lanes * entries` words.
    pub fn new(memory: &'a mut [u32], lane: u32, lanes: u32) -> Self {
        let lanes = lanes.max(1);
        let entries = (memory.len() as u32 / lanes).min(SHARED_STACK_ENTRIES.max(1));
        Self::with_entries(memory, lane, lanes, entries)
    }
    pub fn with_entries(memory: &'a mut [u32], lane: u32, lanes: u32, entries: u32) -> Self {
        Self {
            memory,
            lane: lane % lanes.max(1),
            lanes: lanes.max(1),
            entries: entries.max(1),
        }
    }
    fn slot(&self, index: i32) -> usize {
        index.rem_euclid((self.lanes * self.entries) as i32) as usize
    }
}

impl<'a> TraversalStack for SharedStack<'a> {
    fn base(&self) -> i32 {
        self.lane as i32
    }
    fn stride(&self) -> i32 {
        self.lanes as i32
    }
    fn capacity(&self) -> Option<u32> {
        Some(self.entries)
    }
    fn store(&mut self, index: i32, node: u32) {
        let slot = self.slot(index);
        if let Some(entry) = self.memory.get_mut(slot) {
            *entry = node;
        }
    }
    fn load(&mut self, index: i32) -> u32 {
        let slot = self.slot(index);
        self.memory.get(slot).copied().unwrap_or(0)
    }
}

pub const SPILL_BATCH: i32 = 4;

///
/// Shared ring stack that spills its oldest entries to private memory
/// before they would be overwritten and fills them back in when popped.
///
#[derive(Debug)]
pub struct SpillingStack<'a> {
    shared: SharedStack<'a>,
    spill: &'a mut [u8],
    /// Lowest entry index still resident in shared memory.
    shared_base: i32,
}

impl<'a> SpillingStack<'a> {
    pub fn new(shared: SharedStack<'a>, spill: &'a mut [u8]) -> Self {
        let shared_base = shared.base();
        Self {
            shared,
            spill,
            shared_base,
        }
    }
    fn spill_offset(&self, index: i32) -> usize {
        ((index - self.shared.base()) / self.shared.stride()) as usize * 4
    }
    fn spill_entry(&mut self, index: i32) {
        let node = self.shared.load(index);
        let offset = self.spill_offset(index);
        match self.spill.get_mut(offset..offset + 4) {
            Some(dst) => dst.copy_from_slice(&node.to_le_bytes()),
            None => log::warn!("Traversal stack spill at entry {index} dropped!"),
        }
    }
    fn fill_entry(&mut self, index: i32) -> u32 {
        let offset = self.spill_offset(index);
        match self.spill.get(offset..offset + 4) {
            Some(src) => u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
            None => {
                log::warn!("Traversal stack fill at entry {index} out of bounds!");
                0
            }
        }
    }
}

impl<'a> TraversalStack for SpillingStack<'a> {
    fn base(&self) -> i32 {
        self.shared.base()
    }
    fn stride(&self) -> i32 {
        self.shared.stride()
    }
    fn capacity(&self) -> Option<u32> {
        None
    }
    fn store(&mut self, index: i32, node: u32) {
        self.shared.store(index, node)
    }
    fn load(&mut self, index: i32) -> u32 {
        if index < self.shared_base {
            self.shared_base = index;
            self.fill_entry(index)
        } else {
            self.shared.load(index)
        }
    }
    fn check_overflow(&mut self, stack: i32) {
        let stride = self.stride();
        let limit = stride * (self.shared.entries as i32 - 2);
        if stack - self.shared_base >= limit {
            for _ in 0..SPILL_BATCH {
                self.spill_entry(self.shared_base);
                self.shared_base += stride;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_lanes_are_disjoint() {
        let mut memory = vec![0; 4 * 8];
        for lane in 0..4 {
            let mut stack = SharedStack::new(&mut memory, lane, 4);
            let base = stack.base();
            for k in 0..8 {
                stack.store(base + k * 4, lane * 100 + k as u32);
            }
        }
        for lane in 0..4 {
            let mut stack = SharedStack::new(&mut memory, lane, 4);
            let base = stack.base();
            for k in 0..8 {
                assert_eq!(stack.load(base + k * 4), lane * 100 + k as u32);
            }
        }
    }

    #[test]
    fn spilling_round_trip() {
        let mut memory = vec![0; 2 * 6];
        let mut spill = vec![0u8; 256];
        let shared = SharedStack::with_entries(&mut memory, 1, 2, 6);
        let mut stack = SpillingStack::new(shared, &mut spill);

        let mut sp = stack.base();
        for node in 0..40u32 {
            stack.check_overflow(sp);
            stack.store(sp, node);
            sp += stack.stride();
        }
        for node in (0..40u32).rev() {
            sp -= stack.stride();
            assert_eq!(stack.load(sp), node);
        }
    }
}
