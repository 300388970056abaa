use std::ops::ControlFlow;

use bitflags::bitflags;
use glam::{Vec2, Vec3};

use crate::intersect;
use crate::memory::GlobalMemory;
use crate::node::{
    AabbNode, GEOMETRY_ID_MASK, INSTANCE_FORCE_OPAQUE, INSTANCE_NO_FORCE_NOT_OPAQUE,
    INSTANCE_SBT_OFFSET_MASK, INSTANCE_TRIANGLE_FACING_CULL_DISABLE,
    INSTANCE_TRIANGLE_FLIP_FACING,
};
use crate::traversal::{
    traverse, CandidateHandler, LeafIntersection, TraversalArgs, TraversalCursor,
    TriangleIntersection,
};
use crate::stack::ScratchStack;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RayFlags: u32 {
        const OPAQUE = 0x1;
        const NO_OPAQUE = 0x2;
        const TERMINATE_ON_FIRST_HIT = 0x4;
        const SKIP_CLOSEST_HIT_SHADER = 0x8;
        const CULL_BACK_FACING_TRIANGLES = 0x10;
        const CULL_FRONT_FACING_TRIANGLES = 0x20;
        const CULL_OPAQUE = 0x40;
        const CULL_NO_OPAQUE = 0x80;
        const SKIP_TRIANGLES = 0x100;
        const SKIP_AABBS = 0x200;
    }
}

bitflags! {
    /// Per instance flags as given to the serializer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u32 {
        const TRIANGLE_FACING_CULL_DISABLE = 0x1;
        const TRIANGLE_FLIP_FACING = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NO_OPAQUE = 0x8;
    }
}

impl InstanceFlags {
    /// Encodes the flags into the high bits of `sbt_offset_and_flags`.
    pub fn encode(self) -> u32 {
        let mut bits = 0;
        if self.contains(Self::FORCE_OPAQUE) {
            bits |= INSTANCE_FORCE_OPAQUE;
        }
        if !self.contains(Self::FORCE_NO_OPAQUE) {
            bits |= INSTANCE_NO_FORCE_NOT_OPAQUE;
        }
        if self.contains(Self::TRIANGLE_FACING_CULL_DISABLE) {
            bits |= INSTANCE_TRIANGLE_FACING_CULL_DISABLE;
        }
        if self.contains(Self::TRIANGLE_FLIP_FACING) {
            bits |= INSTANCE_TRIANGLE_FLIP_FACING;
        }
        bits
    }
}

/// `sbt_offset_and_flags` in effect while no instance has been entered.
pub const NO_INSTANCE_FLAGS: u32 = INSTANCE_NO_FORCE_NOT_OPAQUE;

pub const HIT_KIND_FRONT_FACING_TRIANGLE: u32 = 0xfe;
pub const HIT_KIND_BACK_FACING_TRIANGLE: u32 = 0xff;

/// Resolves opacity; the ray flags override geometry and instance flags.
pub fn hit_is_opaque(sbt_offset_and_flags: u32, flags: RayFlags, geometry_id_and_flags: u32) -> bool {
    let mut opaque = (geometry_id_and_flags | sbt_offset_and_flags)
        >= (INSTANCE_FORCE_OPAQUE | INSTANCE_NO_FORCE_NOT_OPAQUE);
    if flags.contains(RayFlags::OPAQUE) {
        opaque = true;
    }
    if flags.contains(RayFlags::NO_OPAQUE) {
        opaque = false;
    }
    opaque
}

pub fn is_frontface(det: f32, sbt_offset_and_flags: u32) -> bool {
    (det > 0.) ^ (sbt_offset_and_flags & INSTANCE_TRIANGLE_FLIP_FACING != 0)
}

/// Face culling and triangle skipping.
pub fn triangle_not_culled(frontface: bool, flags: RayFlags, sbt_offset_and_flags: u32) -> bool {
    let facing_ok = if frontface {
        !flags.contains(RayFlags::CULL_FRONT_FACING_TRIANGLES)
    } else {
        !flags.contains(RayFlags::CULL_BACK_FACING_TRIANGLES)
    };
    let cull_disable = sbt_offset_and_flags & INSTANCE_TRIANGLE_FACING_CULL_DISABLE != 0;
    !flags.contains(RayFlags::SKIP_TRIANGLES) && (facing_ok || cull_disable)
}

pub fn opacity_not_culled(opaque: bool, flags: RayFlags) -> bool {
    if opaque {
        !flags.contains(RayFlags::CULL_OPAQUE)
    } else {
        !flags.contains(RayFlags::CULL_NO_OPAQUE)
    }
}

pub fn geometry_index(geometry_id_and_flags: u32) -> u32 {
    geometry_id_and_flags & GEOMETRY_ID_MASK
}

/// Hit group record index of a candidate.
pub fn sbt_index(
    ray_sbt_offset: u32,
    ray_sbt_stride: u32,
    sbt_offset_and_flags: u32,
    geometry_id_and_flags: u32,
) -> u32 {
    ray_sbt_offset
        .wrapping_add(sbt_offset_and_flags & INSTANCE_SBT_OFFSET_MASK)
        .wrapping_add(ray_sbt_stride.wrapping_mul(geometry_index(geometry_id_and_flags)))
}

pub fn hit_kind(frontface: bool) -> u32 {
    if frontface {
        HIT_KIND_FRONT_FACING_TRIANGLE
    } else {
        HIT_KIND_BACK_FACING_TRIANGLE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitType {
    Triangle,
    Aabb,
}

///
/// A committed hit as seen by host side tracing.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub ty: HitType,
    pub t: f32,
    pub primitive_id: u32,
    pub geometry_index: u32,
    pub instance_addr: u64,
    pub sbt_offset_and_flags: u32,
    pub barycentrics: Vec2,
    pub frontface: bool,
    pub opaque: bool,
}

///
/// Candidate handler committing the closest accepted hit.
/// Non-opaque candidates are passed to `any_hit`, which decides whether
/// they are accepted.
///
pub struct ClosestHit<F> {
    pub flags: RayFlags,
    pub tmin: f32,
    pub tmax: f32,
    pub hit: Option<Hit>,
    pub any_hit: F,
}

impl<F: FnMut(&Hit) -> bool> ClosestHit<F> {
    pub fn new(flags: RayFlags, tmin: f32, tmax: f32, any_hit: F) -> Self {
        Self {
            flags,
            tmin,
            tmax,
            hit: None,
            any_hit,
        }
    }
    fn offer(&mut self, hit: Hit) -> ControlFlow<()> {
        if !hit.opaque && !(self.any_hit)(&hit) {
            return ControlFlow::Continue(());
        }
        self.tmax = hit.t;
        self.hit = Some(hit);
        if self.flags.contains(RayFlags::TERMINATE_ON_FIRST_HIT) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

impl<F: FnMut(&Hit) -> bool> CandidateHandler for ClosestHit<F> {
    fn tmax(&self) -> f32 {
        self.tmax
    }
    fn triangle(
        &mut self,
        _mem: &mut GlobalMemory,
        candidate: &TriangleIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        self.offer(Hit {
            ty: HitType::Triangle,
            t: candidate.t,
            primitive_id: candidate.base.primitive_id,
            geometry_index: geometry_index(candidate.base.geometry_id_and_flags),
            instance_addr: cursor.instance_addr,
            sbt_offset_and_flags: cursor.sbt_offset_and_flags,
            barycentrics: candidate.barycentrics,
            frontface: candidate.frontface,
            opaque: candidate.base.opaque,
        })
    }
    fn aabb(
        &mut self,
        mem: &mut GlobalMemory,
        candidate: &LeafIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        let node: AabbNode = mem.read(candidate.node_addr);
        let [x0, y0, z0, x1, y1, z1] = node.aabb;
        let Some(t) = intersect::intersect_aabb(
            Vec3::new(x0, y0, z0),
            Vec3::new(x1, y1, z1),
            cursor.origin,
            cursor.dir,
            self.tmin,
            self.tmax,
        ) else {
            return ControlFlow::Continue(());
        };
        self.offer(Hit {
            ty: HitType::Aabb,
            t,
            primitive_id: candidate.primitive_id,
            geometry_index: geometry_index(candidate.geometry_id_and_flags),
            instance_addr: cursor.instance_addr,
            sbt_offset_and_flags: cursor.sbt_offset_and_flags,
            barycentrics: Vec2::ZERO,
            frontface: true,
            opaque: candidate.opaque,
        })
    }
}

///
/// Traces a ray on the host and returns the closest hit.
/// Non-opaque candidates are accepted as if every any-hit shader accepted.
///
#[profiling::function]
pub fn trace_closest(mem: &mut GlobalMemory, args: &TraversalArgs, tmax: f32) -> Option<Hit> {
    let mut handler = ClosestHit::new(args.flags, args.tmin, tmax, |_: &Hit| true);
    let mut stack = ScratchStack::default();
    let mut cursor = TraversalCursor::new(args, &stack);
    if traverse(mem, args, &mut cursor, &mut stack, &mut handler) {
        // Only a terminate-on-first-hit commit breaks out early.
        log::trace!("Traversal ended at the first committed hit");
    }
    handler.hit
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::GEOMETRY_OPAQUE;

    #[test]
    fn ray_flags_override_geometry() {
        assert!(hit_is_opaque(NO_INSTANCE_FLAGS, RayFlags::empty(), GEOMETRY_OPAQUE));
        assert!(!hit_is_opaque(NO_INSTANCE_FLAGS, RayFlags::NO_OPAQUE, GEOMETRY_OPAQUE));
        assert!(hit_is_opaque(NO_INSTANCE_FLAGS, RayFlags::OPAQUE, 0));
        assert!(!hit_is_opaque(
            INSTANCE_FORCE_OPAQUE | INSTANCE_NO_FORCE_NOT_OPAQUE,
            RayFlags::NO_OPAQUE,
            GEOMETRY_OPAQUE
        ));
        assert!(!hit_is_opaque(0, RayFlags::empty(), GEOMETRY_OPAQUE));
    }

    #[test]
    fn instance_flags_encoding() {
        assert_eq!(InstanceFlags::empty().encode(), INSTANCE_NO_FORCE_NOT_OPAQUE);
        assert_eq!(InstanceFlags::FORCE_NO_OPAQUE.encode(), 0);
    }
}
