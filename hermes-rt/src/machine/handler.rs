use std::ops::ControlFlow;

use glam::Vec3;

use crate::config::{HIT_ATTRIB_OFFSET, MAX_HIT_ATTRIB_SIZE};
use crate::intersect::intersect_aabb;
use crate::ir::{Case, Intrinsic, Reg, TraversalBlock};
use crate::memory::GlobalMemory;
use crate::node::AabbNode;
use crate::policy::{geometry_index, hit_kind, sbt_index, RayFlags};
use crate::sbt::SbtKind;
use crate::traversal::{
    CandidateHandler, LeafIntersection, TraversalCursor, TriangleIntersection,
};

use super::lane::Lane;
use super::{Error, Result};

///
/// Candidate handler of pipeline traversal.
/// Runs the inlined any-hit and intersection stages of the candidate's hit
/// group and commits accepted candidates to the lane registers.
///
pub struct PipelineHandler<'l, 'a> {
    pub lane: &'l mut Lane<'a>,
    pub block: &'l TraversalBlock,
    pub flags: RayFlags,
    /// First error raised by an inlined stage; traversal stops on errors.
    pub error: Option<Error>,
}

impl<'l, 'a> PipelineHandler<'l, 'a> {
    fn set_candidate(
        &mut self,
        leaf: &LeafIntersection,
        cursor: &TraversalCursor,
        t: f32,
        hit_kind: u32,
    ) -> Result<u32> {
        let regs = &mut *self.lane.regs;
        let record = sbt_index(
            regs.u32(Reg::SbtOffset)?,
            regs.u32(Reg::SbtStride)?,
            cursor.sbt_offset_and_flags,
            leaf.geometry_id_and_flags,
        );
        regs.set(Reg::CandT, t)?;
        regs.set(Reg::CandHitKind, hit_kind)?;
        regs.set(Reg::CandPrimitiveId, leaf.primitive_id)?;
        regs.set(
            Reg::CandGeometryIndex,
            geometry_index(leaf.geometry_id_and_flags),
        )?;
        regs.set(Reg::CandInstanceAddr, cursor.instance_addr)?;
        regs.set(Reg::CandOpaque, leaf.opaque)?;
        regs.set(Reg::CandSbtIdx, record)?;
        regs.set(Reg::CandObjectOrigin, cursor.origin)?;
        regs.set(Reg::CandObjectDir, cursor.dir)?;
        regs.set(Reg::AhitAccept, true)?;
        regs.candidate_attribs = [0; MAX_HIT_ATTRIB_SIZE as usize];
        Ok(record)
    }

    fn run(&mut self, mem: &mut GlobalMemory, cases: &[Case], tag: u32, record: u32) -> Result<()> {
        let case = cases
            .iter()
            .find(|case| case.tag == tag)
            .ok_or(Error::UnreachableDispatch {
                idx: tag,
                lane: self.lane.index,
            })?;
        let shader_record = self.lane.sbt.entry_addr(SbtKind::Hit, record) + 32;
        self.lane.regs.set(Reg::ShaderRecord, shader_record)?;
        self.lane.region(mem, case.label, &case.body)
    }

    fn terminates(&self) -> Result<bool> {
        Ok(self.flags.contains(RayFlags::TERMINATE_ON_FIRST_HIT)
            || self.lane.regs.bool(Reg::AhitTerminate)?)
    }

    fn on_triangle(
        &mut self,
        mem: &mut GlobalMemory,
        candidate: &TriangleIntersection,
        cursor: &TraversalCursor,
    ) -> Result<ControlFlow<()>> {
        let record = self.set_candidate(
            &candidate.base,
            cursor,
            candidate.t,
            hit_kind(candidate.frontface),
        )?;
        self.lane.regs.candidate_attribs[..8]
            .copy_from_slice(bytemuck::cast_slice(&candidate.barycentrics.to_array()));

        let any_hit = if candidate.base.opaque {
            0
        } else {
            self.lane.sbt.load_word(mem, SbtKind::Hit, record, 1)
        };
        if any_hit != 0 {
            self.lane.stats.any_hit_invocations += 1;
            self.lane.intrinsic(Intrinsic::StageHitAttribs)?;
            let block = self.block;
            self.run(mem, &block.any_hit, any_hit, record)?;
            if !self.lane.regs.bool(Reg::AhitAccept)? {
                self.lane.intrinsic(Intrinsic::RestoreHitAttribs)?;
                return Ok(ControlFlow::Continue(()));
            }
        } else {
            let slot = self
                .lane
                .regs
                .u32(Reg::StackPtr)?
                .wrapping_add(HIT_ATTRIB_OFFSET as u32);
            self.lane
                .scratch
                .write_bytes(slot, &self.lane.regs.candidate_attribs);
        }
        self.lane.intrinsic(Intrinsic::CommitCandidate)?;
        log::trace!("Committed triangle hit at t = {}", candidate.t);

        Ok(if self.terminates()? {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    }

    fn on_aabb(
        &mut self,
        mem: &mut GlobalMemory,
        candidate: &LeafIntersection,
        cursor: &TraversalCursor,
    ) -> Result<ControlFlow<()>> {
        let tmax = self.lane.regs.f32(Reg::Tmax)?;
        let record = self.set_candidate(candidate, cursor, tmax, 0)?;
        let intersection = self.lane.sbt.load_word(mem, SbtKind::Hit, record, 1);

        if intersection != 0 {
            self.lane.stats.intersection_invocations += 1;
            let block = self.block;
            self.run(mem, &block.intersection, intersection, record)?;
            return Ok(if self.lane.regs.bool(Reg::AhitTerminate)? {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            });
        }

        // Without an intersection stage the box itself is the primitive.
        let node: AabbNode = mem.read(candidate.node_addr);
        let [x0, y0, z0, x1, y1, z1] = node.aabb;
        let tmin = self.lane.regs.f32(Reg::Tmin)?;
        let Some(t) = intersect_aabb(
            Vec3::new(x0, y0, z0),
            Vec3::new(x1, y1, z1),
            cursor.origin,
            cursor.dir,
            tmin,
            tmax,
        ) else {
            return Ok(ControlFlow::Continue(()));
        };
        self.lane.regs.set(Reg::CandT, t)?;
        self.lane.intrinsic(Intrinsic::CommitCandidate)?;
        Ok(if self.terminates()? {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    }

    fn handle(&mut self, result: Result<ControlFlow<()>>) -> ControlFlow<()> {
        result.unwrap_or_else(|err| {
            self.error = Some(err);
            ControlFlow::Break(())
        })
    }
}

impl<'l, 'a> CandidateHandler for PipelineHandler<'l, 'a> {
    fn tmax(&self) -> f32 {
        self.lane.regs.f32(Reg::Tmax).unwrap_or(f32::INFINITY)
    }
    fn triangle(
        &mut self,
        mem: &mut GlobalMemory,
        candidate: &TriangleIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        let result = self.on_triangle(mem, candidate, cursor);
        self.handle(result)
    }
    fn aabb(
        &mut self,
        mem: &mut GlobalMemory,
        candidate: &LeafIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        let result = self.on_aabb(mem, candidate, cursor);
        self.handle(result)
    }
}
