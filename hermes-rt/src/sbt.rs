use crate::config::SBT_HANDLE_SIZE;
use crate::memory::{self, align_up, GlobalMemory};
use crate::pipeline::Pipeline;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Shader group {0} does not exist in the pipeline!")]
    InvalidGroup(usize),
    #[error(transparent)]
    MemoryError(#[from] memory::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Record alignment inside a binding table region.
pub const SBT_RECORD_ALIGNMENT: u64 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SbtKind {
    Raygen,
    Miss,
    Hit,
    Callable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegion {
    pub addr: u64,
    pub stride: u64,
    pub size: u64,
}

///
/// Device addresses of the four binding table regions.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderBindingTable {
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub callable: SbtRegion,
}

impl ShaderBindingTable {
    pub fn region(&self, kind: SbtKind) -> &SbtRegion {
        match kind {
            SbtKind::Raygen => &self.raygen,
            SbtKind::Miss => &self.miss,
            SbtKind::Hit => &self.hit,
            SbtKind::Callable => &self.callable,
        }
    }
    /// Address of record `index`, the handle starts at offset 0 and the
    /// shader record data right after it.
    pub fn entry_addr(&self, kind: SbtKind, index: u32) -> u64 {
        let region = self.region(kind);
        region.addr.wrapping_add(region.stride.wrapping_mul(index as u64))
    }
    pub fn load_word(&self, mem: &GlobalMemory, kind: SbtKind, index: u32, word: u32) -> u32 {
        mem.read(self.entry_addr(kind, index) + word as u64 * 4)
    }
}

#[derive(Clone, Debug, Default)]
struct Record {
    group: Option<usize>,
    data: Vec<u8>,
}

///
/// Writes a shader binding table for a compiled pipeline into global
/// memory.
/// Records without a group get a zero handle and invoke no shader.
///
#[derive(Debug)]
pub struct SbtWriter<'a> {
    pipeline: &'a Pipeline,
    raygen: Vec<Record>,
    miss: Vec<Record>,
    hit: Vec<Record>,
    callable: Vec<Record>,
}

impl<'a> SbtWriter<'a> {
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self {
            pipeline,
            raygen: vec![],
            miss: vec![],
            hit: vec![],
            callable: vec![],
        }
    }
    fn records(&mut self, kind: SbtKind) -> &mut Vec<Record> {
        match kind {
            SbtKind::Raygen => &mut self.raygen,
            SbtKind::Miss => &mut self.miss,
            SbtKind::Hit => &mut self.hit,
            SbtKind::Callable => &mut self.callable,
        }
    }
    pub fn record(mut self, kind: SbtKind, group: Option<usize>, data: &[u8]) -> Self {
        self.records(kind).push(Record {
            group,
            data: data.to_vec(),
        });
        self
    }
    pub fn raygen(self, group: usize) -> Self {
        self.record(SbtKind::Raygen, Some(group), &[])
    }
    pub fn miss(self, group: Option<usize>) -> Self {
        self.record(SbtKind::Miss, group, &[])
    }
    pub fn hit(self, group: Option<usize>) -> Self {
        self.record(SbtKind::Hit, group, &[])
    }
    pub fn callable(self, group: usize) -> Self {
        self.record(SbtKind::Callable, Some(group), &[])
    }

    pub fn write(self, mem: &mut GlobalMemory) -> Result<ShaderBindingTable> {
        let pipeline = self.pipeline;
        let region = |mem: &mut GlobalMemory, records: &[Record]| -> Result<SbtRegion> {
            let data_size = records.iter().map(|r| r.data.len()).max().unwrap_or(0) as u64;
            let stride = align_up(SBT_HANDLE_SIZE as u64 + data_size, SBT_RECORD_ALIGNMENT);
            let size = stride * records.len() as u64;
            if records.is_empty() {
                return Ok(SbtRegion::default());
            }
            let addr = mem.alloc(size, SBT_RECORD_ALIGNMENT)?;
            for (i, record) in records.iter().enumerate() {
                let entry = addr + i as u64 * stride;
                if let Some(group) = record.group {
                    let handle = pipeline
                        .group_handle(group)
                        .ok_or(Error::InvalidGroup(group))?;
                    mem.write_bytes(entry, &handle);
                }
                mem.write_bytes(entry + SBT_HANDLE_SIZE as u64, &record.data);
            }
            Ok(SbtRegion { addr, stride, size })
        };
        let sbt = ShaderBindingTable {
            raygen: region(mem, &self.raygen)?,
            miss: region(mem, &self.miss)?,
            hit: region(mem, &self.hit)?,
            callable: region(mem, &self.callable)?,
        };
        log::trace!("Written shader binding table {sbt:?}");
        Ok(sbt)
    }
}
