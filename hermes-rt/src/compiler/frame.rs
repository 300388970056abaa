use indexmap::IndexMap;

use crate::config::{CALL_RETURN_SIZE, MAX_HIT_ATTRIB_SIZE};
use crate::ir::{Expr, LocalId, Reg, Stmt, SystemValue, VarType};
use crate::node::InstanceField;
use crate::pipeline::{Stage, StageKind};

use super::visit_exprs;

pub const fn align(v: u32, base: u32) -> u32 {
    (v + base - 1) / base * base
}

///
/// Layout of one stage's frame, relative to the stack pointer at entry:
/// the declared scratch bytes, the locals, then slots for system values
/// saved at entry and for the incoming payload address.
///
#[derive(Clone, Debug, Default)]
pub struct FrameLayout {
    /// Offset of the frame above the stack pointer.
    pub base: u32,
    pub locals: Vec<(u32, VarType)>,
    pub snapshots: IndexMap<SystemValue, u32>,
    pub payload: Option<u32>,
    /// Three words used while reporting intersections: `t`, hit kind and
    /// whether the hit was committed.
    pub report: Option<u32>,
    pub size: u32,
}

impl FrameLayout {
    pub fn new(stage: &Stage, base: u32) -> Self {
        let mut size = align(stage.scratch_size, 4);
        let mut alloc = |ty: VarType| {
            let offset = align(size, ty.alignment());
            size = offset + ty.size();
            offset
        };

        let locals = stage.locals.iter().map(|&ty| (alloc(ty), ty)).collect();

        let mut snapshots = IndexMap::new();
        let mut payload = None;
        let mut report = None;
        if stage.kind.is_recursive() {
            let mut values = vec![];
            let mut uses_payload = false;
            visit_exprs(&stage.body, &mut |expr| match expr {
                Expr::System(value) if !value.is_lane_constant() => values.push(*value),
                Expr::LoadPayload(..) => uses_payload = true,
                _ => {}
            });
            uses_payload |= contains_payload_store(&stage.body);
            for value in values {
                if !snapshots.contains_key(&value) {
                    snapshots.insert(value, alloc(value.ty()));
                }
            }
            if uses_payload && stage.kind != StageKind::RayGen {
                payload = Some(alloc(VarType::U32));
            }
        }
        if stage.kind == StageKind::Intersection {
            report = Some(alloc(VarType::F32));
            alloc(VarType::U32);
            alloc(VarType::Bool);
        }

        Self {
            base,
            locals,
            snapshots,
            payload,
            report,
            size: align(size, 4),
        }
    }

    pub fn local(&self, id: LocalId) -> Option<(u32, VarType)> {
        self.locals.get(id.0).copied()
    }

    /// Absolute scratch offset of a frame offset.
    pub fn addr(&self, offset: u32) -> Expr {
        Expr::reg(Reg::StackPtr).add(self.base + offset)
    }

    /// Bytes pushed by a call: the frame, the callee's hit attributes and
    /// the return tag which is pushed separately.
    pub fn call_size(&self) -> u32 {
        align(self.size, 16) + MAX_HIT_ATTRIB_SIZE
    }

    pub fn stack_size(&self, has_call: bool) -> u32 {
        if has_call {
            self.call_size() + CALL_RETURN_SIZE
        } else {
            align(self.size, 16)
        }
    }
}

fn contains_payload_store(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| {
        let mut found = matches!(stmt, Stmt::StorePayload { .. });
        stmt.for_each_block(|block| found |= contains_payload_store(block));
        found
    })
}

/// Where a recursive stage reads a system value from at entry.
pub fn committed_source(value: SystemValue) -> Expr {
    let instance = |field| Expr::InstanceField(field, Box::new(Expr::reg(Reg::InstanceAddr)));
    match value {
        SystemValue::LaunchId(_) | SystemValue::LaunchSize(_) => Expr::sys(value),
        SystemValue::WorldRayOrigin => Expr::reg(Reg::Origin),
        SystemValue::WorldRayDirection => Expr::reg(Reg::Dir),
        SystemValue::RayTmin => Expr::reg(Reg::Tmin),
        SystemValue::RayTmax | SystemValue::HitT => Expr::reg(Reg::Tmax),
        SystemValue::IncomingRayFlags => Expr::reg(Reg::RayFlags),
        SystemValue::CullMask => Expr::reg(Reg::CullMask),
        SystemValue::HitKind => Expr::reg(Reg::HitKind),
        SystemValue::PrimitiveId => Expr::reg(Reg::PrimitiveId),
        SystemValue::GeometryIndex => Expr::reg(Reg::GeometryIndex),
        SystemValue::InstanceId => instance(InstanceField::Id),
        SystemValue::InstanceCustomIndex => instance(InstanceField::CustomIndex),
        SystemValue::ObjectRayOrigin => Expr::reg(Reg::ObjectOrigin),
        SystemValue::ObjectRayDirection => Expr::reg(Reg::ObjectDir),
        SystemValue::ObjectToWorld(c) => instance(InstanceField::ObjectToWorld(c)),
        SystemValue::WorldToObject(c) => instance(InstanceField::WorldToObject(c)),
        SystemValue::ShaderRecordAddress => Expr::reg(Reg::ShaderRecord),
    }
}

/// Where any-hit and intersection stages read a system value from while
/// a candidate is being processed.
pub fn candidate_source(value: SystemValue, kind: StageKind) -> Expr {
    let instance = |field| Expr::InstanceField(field, Box::new(Expr::reg(Reg::CandInstanceAddr)));
    match value {
        SystemValue::HitT => Expr::reg(Reg::CandT),
        SystemValue::RayTmax if kind == StageKind::AnyHit => Expr::reg(Reg::CandT),
        SystemValue::HitKind => Expr::reg(Reg::CandHitKind),
        SystemValue::PrimitiveId => Expr::reg(Reg::CandPrimitiveId),
        SystemValue::GeometryIndex => Expr::reg(Reg::CandGeometryIndex),
        SystemValue::InstanceId => instance(InstanceField::Id),
        SystemValue::InstanceCustomIndex => instance(InstanceField::CustomIndex),
        SystemValue::ObjectRayOrigin => Expr::reg(Reg::CandObjectOrigin),
        SystemValue::ObjectRayDirection => Expr::reg(Reg::CandObjectDir),
        SystemValue::ObjectToWorld(c) => instance(InstanceField::ObjectToWorld(c)),
        SystemValue::WorldToObject(c) => instance(InstanceField::WorldToObject(c)),
        _ => committed_source(value),
    }
}

/// Whether a stage of `kind` may read `value`.
pub fn system_value_allowed(kind: StageKind, value: SystemValue) -> bool {
    use StageKind::*;
    match value {
        SystemValue::LaunchId(c) | SystemValue::LaunchSize(c) => c < 3,
        SystemValue::ShaderRecordAddress => true,
        SystemValue::WorldRayOrigin
        | SystemValue::WorldRayDirection
        | SystemValue::RayTmin
        | SystemValue::RayTmax
        | SystemValue::IncomingRayFlags
        | SystemValue::CullMask => matches!(kind, Miss | ClosestHit | AnyHit | Intersection),
        SystemValue::HitT | SystemValue::HitKind => matches!(kind, ClosestHit | AnyHit),
        SystemValue::ObjectToWorld(c) | SystemValue::WorldToObject(c) => {
            c < 4 && matches!(kind, ClosestHit | AnyHit | Intersection)
        }
        SystemValue::PrimitiveId
        | SystemValue::InstanceId
        | SystemValue::InstanceCustomIndex
        | SystemValue::GeometryIndex
        | SystemValue::ObjectRayOrigin
        | SystemValue::ObjectRayDirection => matches!(kind, ClosestHit | AnyHit | Intersection),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::ShaderBuilder;

    #[test]
    fn snapshots_follow_locals() {
        let mut b = ShaderBuilder::new(StageKind::ClosestHit, "chit");
        let payload = b.scratch(6);
        let t = b.let_(VarType::F32, SystemValue::HitT);
        b.store_payload(0, Expr::local(t));
        b.store_payload(4, SystemValue::PrimitiveId);
        b.store_payload(8, SystemValue::HitT);
        let frame = FrameLayout::new(&b.build(), 0);

        assert_eq!(payload, 0);
        assert_eq!(frame.locals, vec![(8, VarType::F32)]);
        assert_eq!(frame.snapshots[&SystemValue::HitT], 12);
        assert_eq!(frame.snapshots[&SystemValue::PrimitiveId], 16);
        assert_eq!(frame.payload, Some(20));
        assert_eq!(frame.size, 24);
        assert_eq!(frame.stack_size(false), 32);
        assert_eq!(frame.stack_size(true), 32 + 32 + 16);
    }
}
