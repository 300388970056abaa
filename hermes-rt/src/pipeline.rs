use crate::config::SBT_HANDLE_SIZE;
use crate::ir::{Stmt, VarType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    RayGen,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

impl StageKind {
    /// Stages dispatched from the kernel loop. Any-hit and intersection
    /// stages are inlined into traversal instead.
    pub fn is_recursive(&self) -> bool {
        !matches!(self, StageKind::AnyHit | StageKind::Intersection)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    pub name: String,
    pub body: Vec<Stmt>,
    pub locals: Vec<VarType>,
    /// Bytes of frame memory declared by the stage, e.g. for payloads.
    pub scratch_size: u32,
    /// Lengths of the ray query arrays declared by the stage.
    pub queries: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderGroup {
    General {
        stage: usize,
    },
    Triangles {
        closest_hit: Option<usize>,
        any_hit: Option<usize>,
    },
    Procedural {
        closest_hit: Option<usize>,
        any_hit: Option<usize>,
        intersection: usize,
    },
}

impl ShaderGroup {
    fn offset(self, offset: usize) -> Self {
        let o = |s: usize| s + offset;
        match self {
            ShaderGroup::General { stage } => ShaderGroup::General { stage: o(stage) },
            ShaderGroup::Triangles {
                closest_hit,
                any_hit,
            } => ShaderGroup::Triangles {
                closest_hit: closest_hit.map(o),
                any_hit: any_hit.map(o),
            },
            ShaderGroup::Procedural {
                closest_hit,
                any_hit,
                intersection,
            } => ShaderGroup::Procedural {
                closest_hit: closest_hit.map(o),
                any_hit: any_hit.map(o),
                intersection: o(intersection),
            },
        }
    }
    /// Referenced stages together with the kind they are expected to have.
    pub fn stages(&self) -> Vec<(usize, &'static [StageKind])> {
        const GENERAL: &[StageKind] = &[StageKind::RayGen, StageKind::Miss, StageKind::Callable];
        match *self {
            ShaderGroup::General { stage } => vec![(stage, GENERAL)],
            ShaderGroup::Triangles {
                closest_hit,
                any_hit,
            } => closest_hit
                .map(|s| (s, &[StageKind::ClosestHit][..]))
                .into_iter()
                .chain(any_hit.map(|s| (s, &[StageKind::AnyHit][..])))
                .collect(),
            ShaderGroup::Procedural {
                closest_hit,
                any_hit,
                intersection,
            } => closest_hit
                .map(|s| (s, &[StageKind::ClosestHit][..]))
                .into_iter()
                .chain(any_hit.map(|s| (s, &[StageKind::AnyHit][..])))
                .chain([(intersection, &[StageKind::Intersection][..])])
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineDesc {
    pub stages: Vec<Stage>,
    pub groups: Vec<ShaderGroup>,
    pub max_recursion_depth: u32,
}

impl PipelineDesc {
    ///
    /// Appends the stages and groups of pipeline libraries.
    /// Group indices of the libraries follow the groups of `self` in order.
    ///
    pub fn link(mut self, libraries: &[PipelineDesc]) -> Self {
        for library in libraries {
            let offset = self.stages.len();
            self.stages.extend(library.stages.iter().cloned());
            self.groups
                .extend(library.groups.iter().map(|group| group.offset(offset)));
            self.max_recursion_depth = self.max_recursion_depth.max(library.max_recursion_depth);
        }
        self
    }
}

/// Shader of a group whose stack size is queried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupShader {
    General,
    ClosestHit,
    AnyHit,
    Intersection,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupStackSize {
    /// Stack usage of stages dispatched from the kernel loop.
    pub recursive_size: u32,
    /// Stack usage of the inlined any-hit and intersection stages.
    pub non_recursive_size: u32,
}

///
/// A compiled pipeline: one kernel that dispatches every stage.
///
#[derive(Clone, Debug)]
pub struct Pipeline {
    pub kernel: Vec<Stmt>,
    pub groups: Vec<ShaderGroup>,
    pub stage_kinds: Vec<StageKind>,
    /// Stack usage per stage.
    pub stage_sizes: Vec<u32>,
    pub group_stack_sizes: Vec<GroupStackSize>,
    pub max_recursion_depth: u32,
    /// Lengths of all ray query arrays, numbered across stages.
    pub query_sizes: Vec<u32>,
    pub spill_size: u32,
}

impl Pipeline {
    ///
    /// Returns the shader group handle as written into binding table
    /// records.
    /// Word 0 is the dispatch tag of the general or closest-hit stage,
    /// word 1 the traversal tag of the any-hit or intersection stage.
    /// Zero means no shader.
    ///
    pub fn group_handle(&self, group: usize) -> Option<[u8; SBT_HANDLE_SIZE as usize]> {
        let tag = |stage: Option<usize>| stage.map(|s| s as u32 + 2).unwrap_or(0);
        let group_tag = group as u32 + 2;
        let words: [u32; 2] = match *self.groups.get(group)? {
            ShaderGroup::General { stage } => [tag(Some(stage)), 0],
            ShaderGroup::Triangles {
                closest_hit,
                any_hit,
            } => [
                tag(closest_hit),
                if any_hit.is_some() { group_tag } else { 0 },
            ],
            ShaderGroup::Procedural { closest_hit, .. } => [tag(closest_hit), group_tag],
        };
        let mut handle = [0u8; SBT_HANDLE_SIZE as usize];
        handle[..8].copy_from_slice(bytemuck::cast_slice(&words));
        Some(handle)
    }

    pub fn group_stack_size(&self, group: usize, shader: GroupShader) -> u32 {
        let Some(sizes) = self.group_stack_sizes.get(group) else {
            return 0;
        };
        match shader {
            GroupShader::General | GroupShader::ClosestHit => sizes.recursive_size,
            GroupShader::AnyHit | GroupShader::Intersection => sizes.non_recursive_size,
        }
    }

    ///
    /// Default pipeline stack size:
    /// `raygen + depth * max(closest hit, miss, any hit + intersection) + 2 * callable`.
    ///
    pub fn stack_size(&self) -> u32 {
        let mut raygen = 0;
        let mut chit_miss = 0;
        let mut non_recursive = 0;
        let mut callable = 0;
        for (group, sizes) in self.groups.iter().zip(&self.group_stack_sizes) {
            match *group {
                ShaderGroup::General { stage } => match self.stage_kinds[stage] {
                    StageKind::RayGen => raygen = raygen.max(sizes.recursive_size),
                    StageKind::Miss => chit_miss = chit_miss.max(sizes.recursive_size),
                    _ => callable = callable.max(sizes.recursive_size),
                },
                _ => {
                    chit_miss = chit_miss.max(sizes.recursive_size);
                    non_recursive = non_recursive.max(sizes.non_recursive_size);
                }
            }
        }
        raygen + self.max_recursion_depth * chit_miss.max(non_recursive) + 2 * callable
    }

    /// Bytes of scratch memory each lane needs.
    pub fn scratch_size(&self) -> u32 {
        self.spill_size + self.stack_size()
    }
}
