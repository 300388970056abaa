use std::ops::ControlFlow;

use glam::{Vec2, Vec3};

use crate::ir::Value;
use crate::memory::GlobalMemory;
use crate::node::{
    addr_to_node, instance_column, instance_matrix, instance_u32, AccelHeader, InstanceField,
    INSTANCE_SBT_OFFSET_MASK,
};
use crate::policy::{geometry_index, RayFlags};
use crate::stack::{ScratchStack, TraversalStack};
use crate::traversal::{
    traverse, CandidateHandler, LeafIntersection, TraversalArgs, TraversalCursor,
    TriangleIntersection,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Ray query index {index} is out of range for an array of {len} queries!")]
    IndexOutOfRange { index: u32, len: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IntersectionType {
    #[default]
    None = 0,
    Triangle = 1,
    Aabb = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QueryIntersection {
    pub primitive_id: u32,
    pub geometry_id_and_flags: u32,
    pub instance_addr: u64,
    pub ty: IntersectionType,
    pub opaque: bool,
    pub frontface: bool,
    pub sbt_offset_and_flags: u32,
    pub barycentrics: Vec2,
    pub t: f32,
}

/// Values readable through [`RayQuery::load`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryValue {
    Flags,
    Tmin,
    WorldRayOrigin,
    WorldRayDirection,
    T,
    Type,
    Barycentrics,
    FrontFace,
    CandidateAabbOpaque,
    PrimitiveIndex,
    GeometryIndex,
    InstanceCustomIndex,
    InstanceId,
    InstanceSbtOffset,
    ObjectRayOrigin,
    ObjectRayDirection,
    ObjectToWorld(u8),
    WorldToObject(u8),
}

///
/// Inline ray query.
///
/// `initialize` resets the query, `proceed` advances the traversal until the
/// next candidate that needs a decision from the caller, `confirm` and
/// `generate` commit the current candidate.
///
#[derive(Clone, Debug)]
pub struct RayQuery {
    pub args: TraversalArgs,
    pub cursor: TraversalCursor,
    pub candidate: QueryIntersection,
    pub closest: QueryIntersection,
    pub incomplete: bool,
    stack: ScratchStack,
}

impl Default for RayQuery {
    fn default() -> Self {
        Self::with_stack(ScratchStack::default())
    }
}

impl RayQuery {
    pub fn with_stack(stack: ScratchStack) -> Self {
        let args = TraversalArgs {
            root_bvh_base: 0,
            flags: RayFlags::empty(),
            cull_mask: 0,
            origin: Vec3::ZERO,
            tmin: 0.,
            dir: Vec3::ZERO,
        };
        Self {
            cursor: TraversalCursor::new(&args, &stack),
            args,
            candidate: Default::default(),
            closest: Default::default(),
            incomplete: false,
            stack,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &mut self,
        mem: &GlobalMemory,
        accel: u64,
        flags: RayFlags,
        cull_mask: u32,
        origin: Vec3,
        tmin: f32,
        dir: Vec3,
        tmax: f32,
    ) {
        self.reset(mem, accel, flags, cull_mask, origin, tmin, dir, tmax);
        self.cursor = TraversalCursor::new(&self.args, &self.stack);
    }

    /// Initializes the query for traversal with an external stack of the
    /// same kind as the one later passed to [`RayQuery::proceed_with`].
    #[allow(clippy::too_many_arguments)]
    pub fn initialize_with(
        &mut self,
        mem: &GlobalMemory,
        accel: u64,
        flags: RayFlags,
        cull_mask: u32,
        origin: Vec3,
        tmin: f32,
        dir: Vec3,
        tmax: f32,
        stack: &impl TraversalStack,
    ) {
        self.reset(mem, accel, flags, cull_mask, origin, tmin, dir, tmax);
        self.cursor = TraversalCursor::new(&self.args, stack);
    }

    #[allow(clippy::too_many_arguments)]
    fn reset(
        &mut self,
        mem: &GlobalMemory,
        accel: u64,
        flags: RayFlags,
        cull_mask: u32,
        origin: Vec3,
        tmin: f32,
        dir: Vec3,
        tmax: f32,
    ) {
        let root_bvh_base = if accel != 0 {
            let header: AccelHeader = mem.read(accel);
            addr_to_node(accel + header.bvh_offset as u64)
        } else {
            0
        };
        self.args = TraversalArgs {
            root_bvh_base,
            flags,
            cull_mask: cull_mask & 0xff,
            origin,
            tmin,
            dir,
        };
        self.candidate = QueryIntersection::default();
        self.closest = QueryIntersection {
            t: tmax,
            ty: IntersectionType::None,
            ..Default::default()
        };
        self.incomplete = accel != 0;
    }

    /// Proceeds on the stack owned by the query.
    pub fn proceed(&mut self, mem: &mut GlobalMemory) -> bool {
        let RayQuery {
            args,
            cursor,
            candidate,
            closest,
            incomplete,
            stack,
        } = self;
        let handler = QueryHandler {
            flags: args.flags,
            candidate,
            closest,
            incomplete,
        };
        handler.proceed(mem, args, cursor, stack)
    }

    pub fn proceed_with(&mut self, mem: &mut GlobalMemory, stack: &mut impl TraversalStack) -> bool {
        let handler = QueryHandler {
            flags: self.args.flags,
            candidate: &mut self.candidate,
            closest: &mut self.closest,
            incomplete: &mut self.incomplete,
        };
        handler.proceed(mem, &self.args, &mut self.cursor, stack)
    }

    fn terminate_on_first_hit(&mut self) {
        if self.args.flags.contains(RayFlags::TERMINATE_ON_FIRST_HIT) {
            self.incomplete = false;
        }
    }

    pub fn confirm(&mut self) {
        self.closest = self.candidate;
        self.terminate_on_first_hit();
    }

    pub fn generate(&mut self, t: f32) {
        if self.closest.t >= t && t >= self.args.tmin {
            self.closest = self.candidate;
            self.closest.t = t;
            self.terminate_on_first_hit();
        }
    }

    pub fn terminate(&mut self) {
        self.incomplete = false;
    }

    pub fn load(&self, mem: &GlobalMemory, value: QueryValue, committed: bool) -> Value {
        let i = if committed {
            &self.closest
        } else {
            &self.candidate
        };
        match value {
            QueryValue::Flags => Value::U32(self.args.flags.bits()),
            QueryValue::Tmin => Value::F32(self.args.tmin),
            QueryValue::WorldRayOrigin => Value::Vec3(self.args.origin),
            QueryValue::WorldRayDirection => Value::Vec3(self.args.dir),
            QueryValue::T => Value::F32(i.t),
            QueryValue::Type => {
                let ty = i.ty as u32;
                Value::U32(if committed { ty } else { ty.wrapping_sub(1) })
            }
            QueryValue::Barycentrics => Value::Vec2(i.barycentrics),
            QueryValue::FrontFace => Value::Bool(i.frontface),
            QueryValue::CandidateAabbOpaque => Value::Bool(self.candidate.opaque),
            QueryValue::PrimitiveIndex => Value::U32(i.primitive_id),
            QueryValue::GeometryIndex => Value::U32(geometry_index(i.geometry_id_and_flags)),
            QueryValue::InstanceCustomIndex => {
                Value::U32(instance_u32(mem, i.instance_addr, InstanceField::CustomIndex))
            }
            QueryValue::InstanceId => {
                Value::U32(instance_u32(mem, i.instance_addr, InstanceField::Id))
            }
            QueryValue::InstanceSbtOffset => {
                Value::U32(i.sbt_offset_and_flags & INSTANCE_SBT_OFFSET_MASK)
            }
            QueryValue::ObjectRayOrigin => Value::Vec3(
                instance_matrix(mem, i.instance_addr, true).transform_point(self.args.origin),
            ),
            QueryValue::ObjectRayDirection => Value::Vec3(
                instance_matrix(mem, i.instance_addr, true).transform_vector(self.args.dir),
            ),
            QueryValue::ObjectToWorld(c) => Value::Vec3(instance_column(
                mem,
                i.instance_addr,
                InstanceField::ObjectToWorld(c),
            )),
            QueryValue::WorldToObject(c) => Value::Vec3(instance_column(
                mem,
                i.instance_addr,
                InstanceField::WorldToObject(c),
            )),
        }
    }
}

struct QueryHandler<'a> {
    flags: RayFlags,
    candidate: &'a mut QueryIntersection,
    closest: &'a mut QueryIntersection,
    incomplete: &'a mut bool,
}

impl<'a> QueryHandler<'a> {
    fn proceed(
        mut self,
        mem: &mut GlobalMemory,
        args: &TraversalArgs,
        cursor: &mut TraversalCursor,
        stack: &mut impl TraversalStack,
    ) -> bool {
        if !*self.incomplete {
            return false;
        }
        let incomplete = traverse(mem, args, cursor, stack, &mut self);
        *self.incomplete &= incomplete;
        log::trace!("Ray query proceeded, incomplete: {}", self.incomplete);
        *self.incomplete
    }
}

impl<'a> CandidateHandler for QueryHandler<'a> {
    fn tmax(&self) -> f32 {
        self.closest.t
    }
    fn triangle(
        &mut self,
        _mem: &mut GlobalMemory,
        hit: &TriangleIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        *self.candidate = QueryIntersection {
            primitive_id: hit.base.primitive_id,
            geometry_id_and_flags: hit.base.geometry_id_and_flags,
            instance_addr: cursor.instance_addr,
            ty: IntersectionType::Triangle,
            opaque: hit.base.opaque,
            frontface: hit.frontface,
            sbt_offset_and_flags: cursor.sbt_offset_and_flags,
            barycentrics: hit.barycentrics,
            t: hit.t,
        };
        if !hit.base.opaque {
            return ControlFlow::Break(());
        }
        *self.closest = *self.candidate;
        if self.flags.contains(RayFlags::TERMINATE_ON_FIRST_HIT) {
            *self.incomplete = false;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
    fn aabb(
        &mut self,
        _mem: &mut GlobalMemory,
        hit: &LeafIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        *self.candidate = QueryIntersection {
            primitive_id: hit.primitive_id,
            geometry_id_and_flags: hit.geometry_id_and_flags,
            instance_addr: cursor.instance_addr,
            ty: IntersectionType::Aabb,
            opaque: hit.opaque,
            frontface: false,
            sbt_offset_and_flags: cursor.sbt_offset_and_flags,
            barycentrics: Vec2::ZERO,
            t: self.closest.t,
        };
        ControlFlow::Break(())
    }
}

///
/// Queries declared as an array; every operation selects one element by a
/// runtime index.
///
#[derive(Clone, Debug, Default)]
pub struct RayQueryArray {
    queries: Vec<RayQuery>,
}

impl RayQueryArray {
    pub fn new(len: usize, stack_entries: u32) -> Self {
        Self {
            queries: (0..len)
                .map(|_| RayQuery::with_stack(ScratchStack::new(stack_entries)))
                .collect(),
        }
    }
    pub fn len(&self) -> usize {
        self.queries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
    pub fn get(&self, index: u32) -> Result<&RayQuery> {
        let len = self.queries.len();
        self.queries
            .get(index as usize)
            .ok_or(Error::IndexOutOfRange { index, len })
    }
    pub fn get_mut(&mut self, index: u32) -> Result<&mut RayQuery> {
        let len = self.queries.len();
        self.queries
            .get_mut(index as usize)
            .ok_or(Error::IndexOutOfRange { index, len })
    }
}
