/// Entries of the private traversal stack used by ray queries.
pub const SCRATCH_STACK_ENTRIES: u32 = 76;
/// Entries per lane of the shared traversal stack used by ray queries.
pub const SHARED_STACK_ENTRIES: u32 = 8;
/// Entries per lane of the shared traversal stack used by pipelines.
pub const LDS_STACK_ENTRIES: u32 = 16;
/// Traversal stack entries that can be spilled to private memory.
pub const SPILL_STACK_ENTRIES: u32 = 64;

pub const MAX_HIT_ATTRIB_SIZE: u32 = 32;
/// Return tag slot pushed by every call.
pub const CALL_RETURN_SIZE: u32 = 16;
/// Offset of the hit attributes relative to the callee stack pointer.
pub const HIT_ATTRIB_OFFSET: i32 = -((CALL_RETURN_SIZE + MAX_HIT_ATTRIB_SIZE) as i32);

pub const SBT_HANDLE_SIZE: u32 = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryStack {
    #[default]
    Scratch,
    Shared,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of lanes sharing one workgroup's shared memory.
    pub workgroup_size: u32,
    pub scratch_stack_entries: u32,
    pub shared_stack_entries: u32,
    pub lds_stack_entries: u32,
    pub spill_stack_entries: u32,
    /// Upper bound on loop iterations per lane before a launch is aborted.
    pub max_iterations: u64,
    pub query_stack: QueryStack,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workgroup_size: 64,
            scratch_stack_entries: SCRATCH_STACK_ENTRIES,
            shared_stack_entries: SHARED_STACK_ENTRIES,
            lds_stack_entries: LDS_STACK_ENTRIES,
            spill_stack_entries: SPILL_STACK_ENTRIES,
            max_iterations: 1 << 20,
            query_stack: QueryStack::Scratch,
        }
    }
}

impl Config {
    /// Bytes at the bottom of each lane's scratch reserved for traversal
    /// stack spills. The shader call stack starts right above.
    pub fn spill_size(&self) -> u32 {
        self.spill_stack_entries * 4
    }
}
