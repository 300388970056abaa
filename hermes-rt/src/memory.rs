use std::collections::BTreeMap;

use bytemuck::Pod;

/// All device addresses live in the canonical upper half, so that node ids
/// can be converted back to addresses by re-attaching the high bits.
pub const ADDRESS_BASE: u64 = 0xffff_0000_0001_0000;
pub const MIN_ALIGNMENT: u64 = 64;

pub const fn align_up(v: u64, base: u64) -> u64 {
    ((v + base - 1) / base) * base
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Allocation of {size} bytes would leave the addressable range!")]
    OutOfMemory { size: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

///
/// Emulated device address space.
/// Allocations never overlap and are at least 64 byte aligned, which is the
/// granularity of BVH nodes.
/// Accesses are robust: reads outside of any allocation return zeros and
/// writes outside of any allocation are dropped.
///
#[derive(Debug)]
pub struct GlobalMemory {
    allocations: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Default for GlobalMemory {
    fn default() -> Self {
        Self {
            allocations: Default::default(),
            next: ADDRESS_BASE,
        }
    }
}

impl GlobalMemory {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Result<u64> {
        let alignment = alignment.max(MIN_ALIGNMENT);
        let addr = align_up(self.next, alignment);
        let end = addr
            .checked_add(size.max(1))
            .ok_or(Error::OutOfMemory { size })?;
        self.allocations.insert(addr, vec![0; size as usize]);
        self.next = end;
        log::trace!("Allocated {size} bytes at {addr:#x}");
        Ok(addr)
    }
    pub fn alloc_slice<T: Pod>(&mut self, data: &[T]) -> Result<u64> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let addr = self.alloc(bytes.len() as u64, MIN_ALIGNMENT)?;
        self.write_bytes(addr, bytes);
        Ok(addr)
    }
    pub fn size_of(&self, addr: u64) -> Option<usize> {
        self.allocations.get(&addr).map(|a| a.len())
    }

    fn allocation(&self, addr: u64, size: usize) -> Option<(&[u8], usize)> {
        let (start, data) = self.allocations.range(..=addr).next_back()?;
        let offset = (addr - start) as usize;
        (offset + size <= data.len()).then_some((data.as_slice(), offset))
    }
    fn allocation_mut(&mut self, addr: u64, size: usize) -> Option<(&mut [u8], usize)> {
        let (start, data) = self.allocations.range_mut(..=addr).next_back()?;
        let offset = (addr - start) as usize;
        (offset + size <= data.len()).then_some((data.as_mut_slice(), offset))
    }

    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) {
        match self.allocation(addr, dst.len()) {
            Some((data, offset)) => dst.copy_from_slice(&data[offset..offset + dst.len()]),
            None => {
                log::warn!(
                    "Out of bounds read of {size} bytes at {addr:#x}!",
                    size = dst.len()
                );
                dst.fill(0);
            }
        }
    }
    pub fn write_bytes(&mut self, addr: u64, src: &[u8]) {
        match self.allocation_mut(addr, src.len()) {
            Some((data, offset)) => data[offset..offset + src.len()].copy_from_slice(src),
            None => log::warn!(
                "Out of bounds write of {size} bytes at {addr:#x} dropped!",
                size = src.len()
            ),
        }
    }
    pub fn read<T: Pod>(&self, addr: u64) -> T {
        let mut value = T::zeroed();
        self.read_bytes(addr, bytemuck::bytes_of_mut(&mut value));
        value
    }
    pub fn write<T: Pod>(&mut self, addr: u64, value: &T) {
        self.write_bytes(addr, bytemuck::bytes_of(value));
    }
    pub fn read_slice<T: Pod>(&self, addr: u64, len: usize) -> Vec<T> {
        let mut data = vec![T::zeroed(); len];
        self.read_bytes(addr, bytemuck::cast_slice_mut(&mut data));
        data
    }
}

///
/// Private per-lane byte memory, addressed by 32 bit offsets.
/// Holds the traversal spill area followed by the shader call stack.
///
#[derive(Debug, Clone)]
pub struct Scratch {
    data: Vec<u8>,
}

impl Scratch {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }
    pub fn size(&self) -> usize {
        self.data.len()
    }
    pub fn view(&mut self) -> ScratchView<'_> {
        ScratchView {
            data: &mut self.data,
            offset: 0,
        }
    }
}

///
/// A window into the tail of a lane's [`Scratch`] memory.
/// Offsets stay absolute so frames can be addressed the same way
/// regardless of how the memory has been split.
///
#[derive(Debug)]
pub struct ScratchView<'a> {
    data: &'a mut [u8],
    offset: u32,
}

impl<'a> ScratchView<'a> {
    /// Splits off the bytes below `offset`; the returned view keeps
    /// absolute addressing for everything at or above it.
    pub fn split_at(&mut self, offset: u32) -> (&mut [u8], ScratchView<'_>) {
        let mid = (offset.saturating_sub(self.offset) as usize).min(self.data.len());
        let (low, high) = self.data.split_at_mut(mid);
        (
            low,
            ScratchView {
                data: high,
                offset: self.offset + mid as u32,
            },
        )
    }
    pub fn reborrow(&mut self) -> ScratchView<'_> {
        ScratchView {
            data: &mut *self.data,
            offset: self.offset,
        }
    }
    fn range(&self, offset: u32, size: usize) -> Option<std::ops::Range<usize>> {
        let start = offset.checked_sub(self.offset)? as usize;
        (start + size <= self.data.len()).then_some(start..start + size)
    }
    pub fn read_bytes(&self, offset: u32, dst: &mut [u8]) {
        match self.range(offset, dst.len()) {
            Some(range) => dst.copy_from_slice(&self.data[range]),
            None => {
                log::warn!(
                    "Out of bounds scratch read of {size} bytes at {offset:#x}!",
                    size = dst.len()
                );
                dst.fill(0);
            }
        }
    }
    pub fn write_bytes(&mut self, offset: u32, src: &[u8]) {
        match self.range(offset, src.len()) {
            Some(range) => self.data[range].copy_from_slice(src),
            None => log::warn!(
                "Out of bounds scratch write of {size} bytes at {offset:#x} dropped!",
                size = src.len()
            ),
        }
    }
    pub fn read<T: Pod>(&self, offset: u32) -> T {
        let mut value = T::zeroed();
        self.read_bytes(offset, bytemuck::bytes_of_mut(&mut value));
        value
    }
    pub fn write<T: Pod>(&mut self, offset: u32, value: &T) {
        self.write_bytes(offset, bytemuck::bytes_of(value));
    }
}
