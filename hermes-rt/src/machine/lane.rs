use glam::{Vec2, Vec3};

use crate::config::{Config, QueryStack, HIT_ATTRIB_OFFSET, MAX_HIT_ATTRIB_SIZE};
use crate::ir::{Expr, Intrinsic, Label, QueryId, QueryOp, Reg, Stmt, SystemValue, Value, VarType};
use crate::memory::{GlobalMemory, ScratchView};
use crate::node::{addr_to_node, instance_column, instance_u32, AccelHeader, InstanceField};
use crate::op;
use crate::pipeline::Pipeline;
use crate::policy::RayFlags;
use crate::query::RayQueryArray;
use crate::sbt::ShaderBindingTable;
use crate::stack::{SharedStack, SpillingStack};
use crate::traversal::{traverse, TraversalArgs, TraversalCursor};
use crate::ir::TraversalBlock;

use super::handler::PipelineHandler;
use super::report::LaneStats;
use super::{Error, Result};

///
/// Register file of one lane.
/// Besides the typed registers it holds the candidate hit attributes
/// written by intersection stages and the committed attributes saved
/// while a candidate is staged.
///
#[derive(Clone, Debug)]
pub struct Registers {
    values: Vec<Value>,
    pub candidate_attribs: [u8; MAX_HIT_ATTRIB_SIZE as usize],
    pub saved_attribs: [u8; MAX_HIT_ATTRIB_SIZE as usize],
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! typed_getter {
    ($name:ident, $as:ident, $ty:ty, $var:ident) => {
        pub fn $name(&self, reg: Reg) -> Result<$ty> {
            let value = self.get(reg);
            value.$as().ok_or(Error::TypeMismatch {
                expected: VarType::$var,
                found: value.ty(),
            })
        }
    };
}

impl Registers {
    pub fn new() -> Self {
        Self {
            values: Reg::ALL.iter().map(|reg| Value::zero(reg.ty())).collect(),
            candidate_attribs: Default::default(),
            saved_attribs: Default::default(),
        }
    }
    pub fn get(&self, reg: Reg) -> Value {
        self.values[reg as usize]
    }
    pub fn set(&mut self, reg: Reg, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if value.ty() != reg.ty() {
            return Err(Error::TypeMismatch {
                expected: reg.ty(),
                found: value.ty(),
            });
        }
        self.values[reg as usize] = value;
        Ok(())
    }
    typed_getter!(bool, as_bool, bool, Bool);
    typed_getter!(u32, as_u32, u32, U32);
    typed_getter!(f32, as_f32, f32, F32);
    typed_getter!(u64, as_u64, u64, U64);
    typed_getter!(vec3, as_vec3, Vec3, Vec3);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Break,
    Continue,
    Exit(Label),
}

pub struct Lane<'a> {
    pub pipeline: &'a Pipeline,
    pub sbt: &'a ShaderBindingTable,
    pub config: &'a Config,
    /// Linear index of the lane in the launch.
    pub index: u64,
    /// Index of the lane in its workgroup.
    pub lane: u32,
    pub launch_id: [u32; 3],
    pub launch_size: [u32; 3],
    pub regs: &'a mut Registers,
    pub scratch: ScratchView<'a>,
    /// Workgroup memory of the traversal stack.
    pub lds: &'a mut [u32],
    pub queries: &'a mut [RayQueryArray],
    pub query_lds: &'a mut [u32],
    pub stats: &'a mut LaneStats,
}

fn operands(op: impl std::fmt::Debug, values: &[Value]) -> Error {
    Error::InvalidOperands {
        op: format!("{op:?} {values:?}"),
    }
}

impl<'a> Lane<'a> {
    pub fn run(&mut self, mem: &mut GlobalMemory) -> Result<()> {
        let kernel = &self.pipeline.kernel;
        if let Flow::Exit(_) = self.exec_block(mem, kernel)? {
            return Err(Error::Unlowered("region exit outside of a region"));
        }
        let idx = self.regs.u32(Reg::Idx)?;
        if idx != 0 {
            return Err(Error::UnreachableDispatch {
                idx,
                lane: self.index,
            });
        }
        Ok(())
    }

    pub fn exec_block(&mut self, mem: &mut GlobalMemory, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            match self.exec(mem, stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    /// Runs `body` as the region `label`, consuming exits targeting it.
    pub fn region(&mut self, mem: &mut GlobalMemory, label: Label, body: &[Stmt]) -> Result<()> {
        match self.exec_block(mem, body)? {
            Flow::Exit(l) if l != label => Err(Error::Unlowered("exit of an enclosing region")),
            Flow::Break | Flow::Continue => Err(Error::Unlowered("loop control outside a loop")),
            _ => Ok(()),
        }
    }

    fn exec(&mut self, mem: &mut GlobalMemory, stmt: &Stmt) -> Result<Flow> {
        match stmt {
            Stmt::SetReg(reg, value) => {
                let value = self.eval(mem, value)?;
                self.regs.set(*reg, value)?;
            }
            Stmt::StoreScratch { offset, value } => {
                let offset = self.eval_u32(mem, offset)?;
                let value = self.eval(mem, value)?;
                self.scratch.write_bytes(offset, &value.to_bytes());
            }
            Stmt::StoreGlobal { addr, value } => {
                let addr = self.eval_u64(mem, addr)?;
                let value = self.eval(mem, value)?;
                mem.write_bytes(addr, &value.to_bytes());
            }
            Stmt::StoreCandidateAttrib { offset, value } => {
                let bytes = self.eval(mem, value)?.to_bytes();
                let start = (*offset as usize).min(MAX_HIT_ATTRIB_SIZE as usize);
                let end = (start + bytes.len()).min(MAX_HIT_ATTRIB_SIZE as usize);
                if end - start < bytes.len() {
                    log::warn!("Hit attribute write at offset {offset} truncated!");
                }
                self.regs.candidate_attribs[start..end].copy_from_slice(&bytes[..end - start]);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                return if self.eval_bool(mem, cond)? {
                    self.exec_block(mem, then)
                } else {
                    self.exec_block(mem, otherwise)
                };
            }
            Stmt::Loop(body) => loop {
                self.stats.iterations += 1;
                if self.stats.iterations > self.config.max_iterations {
                    return Err(Error::IterationLimit {
                        lane: self.index,
                        limit: self.config.max_iterations,
                    });
                }
                match self.exec_block(mem, body)? {
                    Flow::Normal | Flow::Continue => {}
                    Flow::Break => break,
                    flow => return Ok(flow),
                }
            },
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Region { label, body } => {
                return match self.exec_block(mem, body)? {
                    Flow::Exit(l) if l == *label => Ok(Flow::Normal),
                    flow => Ok(flow),
                };
            }
            Stmt::Exit(label) => return Ok(Flow::Exit(*label)),
            Stmt::LoadSbtEntry { kind, index } => {
                let index = self.eval_u32(mem, index)?;
                let addr = self.sbt.entry_addr(*kind, index);
                self.regs.set(Reg::Idx, mem.read::<u32>(addr))?;
                self.regs.set(Reg::ShaderRecord, addr.wrapping_add(32))?;
            }
            Stmt::Intrinsic(intrinsic) => self.intrinsic(*intrinsic)?,
            Stmt::Traverse(block) => self.traverse(mem, block)?,
            Stmt::RayQuery { query, index, op } => self.ray_query(mem, *query, index, op)?,
            Stmt::Assign(..) => return Err(Error::Unlowered("local assignment")),
            Stmt::StoreFrame { .. } => return Err(Error::Unlowered("frame store")),
            Stmt::StorePayload { .. } => return Err(Error::Unlowered("payload store")),
            Stmt::StoreHitAttrib { .. } => return Err(Error::Unlowered("hit attribute store")),
            Stmt::Return => return Err(Error::Unlowered("return")),
            Stmt::TraceRay(_) => return Err(Error::Unlowered("trace ray")),
            Stmt::ExecuteCallable { .. } => return Err(Error::Unlowered("execute callable")),
            Stmt::ReportIntersection { .. } => {
                return Err(Error::Unlowered("report intersection"))
            }
            Stmt::IgnoreIntersection => return Err(Error::Unlowered("ignore intersection")),
            Stmt::TerminateRay => return Err(Error::Unlowered("terminate ray")),
        }
        Ok(Flow::Normal)
    }

    fn hit_attrib_slot(&self) -> Result<u32> {
        Ok(self
            .regs
            .u32(Reg::StackPtr)?
            .wrapping_add(HIT_ATTRIB_OFFSET as u32))
    }

    pub fn intrinsic(&mut self, intrinsic: Intrinsic) -> Result<()> {
        match intrinsic {
            Intrinsic::StageHitAttribs => {
                let slot = self.hit_attrib_slot()?;
                self.scratch.read_bytes(slot, &mut self.regs.saved_attribs);
                self.scratch.write_bytes(slot, &self.regs.candidate_attribs);
            }
            Intrinsic::RestoreHitAttribs => {
                let slot = self.hit_attrib_slot()?;
                self.scratch.write_bytes(slot, &self.regs.saved_attribs);
            }
            Intrinsic::CommitCandidate => {
                let regs = &mut *self.regs;
                regs.set(Reg::Tmax, regs.get(Reg::CandT))?;
                regs.set(Reg::HitKind, regs.get(Reg::CandHitKind))?;
                regs.set(Reg::PrimitiveId, regs.get(Reg::CandPrimitiveId))?;
                regs.set(Reg::GeometryIndex, regs.get(Reg::CandGeometryIndex))?;
                regs.set(Reg::InstanceAddr, regs.get(Reg::CandInstanceAddr))?;
                regs.set(Reg::ObjectOrigin, regs.get(Reg::CandObjectOrigin))?;
                regs.set(Reg::ObjectDir, regs.get(Reg::CandObjectDir))?;
                regs.set(Reg::Idx, regs.get(Reg::CandSbtIdx))?;
                regs.set(Reg::Hit, true)?;
            }
        }
        Ok(())
    }

    #[profiling::function]
    fn traverse(&mut self, mem: &mut GlobalMemory, block: &TraversalBlock) -> Result<()> {
        self.stats.traversals += 1;
        let accel = self.regs.u64(Reg::Accel)?;
        let root_bvh_base = if accel != 0 {
            let header: AccelHeader = mem.read(accel);
            addr_to_node(accel + header.bvh_offset as u64)
        } else {
            0
        };
        let args = TraversalArgs {
            root_bvh_base,
            flags: RayFlags::from_bits_retain(self.regs.u32(Reg::RayFlags)?),
            cull_mask: self.regs.u32(Reg::CullMask)?,
            origin: self.regs.vec3(Reg::Origin)?,
            tmin: self.regs.f32(Reg::Tmin)?,
            dir: self.regs.vec3(Reg::Dir)?,
        };
        self.regs.set(Reg::Hit, false)?;
        self.regs.set(Reg::AhitTerminate, false)?;

        let (spill, frames) = self.scratch.split_at(self.pipeline.spill_size);
        let shared = SharedStack::with_entries(
            &mut *self.lds,
            self.lane,
            self.config.workgroup_size.max(1),
            self.config.lds_stack_entries,
        );
        let mut stack = SpillingStack::new(shared, spill);
        let mut lane = Lane {
            pipeline: self.pipeline,
            sbt: self.sbt,
            config: self.config,
            index: self.index,
            lane: self.lane,
            launch_id: self.launch_id,
            launch_size: self.launch_size,
            regs: &mut *self.regs,
            scratch: frames,
            lds: &mut [],
            queries: &mut *self.queries,
            query_lds: &mut *self.query_lds,
            stats: &mut *self.stats,
        };
        let mut cursor = TraversalCursor::new(&args, &stack);
        let mut handler = PipelineHandler {
            lane: &mut lane,
            block,
            flags: args.flags,
            error: None,
        };
        traverse(mem, &args, &mut cursor, &mut stack, &mut handler);
        match handler.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ray_query(
        &mut self,
        mem: &mut GlobalMemory,
        query: QueryId,
        index: &Expr,
        op: &QueryOp,
    ) -> Result<()> {
        let index = self.eval_u32(mem, index)?;
        let init = match op {
            QueryOp::Initialize {
                accel,
                flags,
                cull_mask,
                origin,
                tmin,
                dir,
                tmax,
            } => Some((
                self.eval_u64(mem, accel)?,
                RayFlags::from_bits_retain(self.eval_u32(mem, flags)?),
                self.eval_u32(mem, cull_mask)?,
                self.eval_vec3(mem, origin)?,
                self.eval_f32(mem, tmin)?,
                self.eval_vec3(mem, dir)?,
                self.eval_f32(mem, tmax)?,
            )),
            _ => None,
        };
        let generate_t = match op {
            QueryOp::Generate(t) => self.eval_f32(mem, t)?,
            _ => 0.,
        };

        let lanes = self.config.workgroup_size.max(1);
        let entries = self.config.shared_stack_entries.max(1);
        let element = self.pipeline.query_sizes.iter().take(query.0).sum::<u32>() + index;
        let region = (element * lanes * entries) as usize..((element + 1) * lanes * entries) as usize;
        let shared = self.config.query_stack == QueryStack::Shared;

        let q = self
            .queries
            .get_mut(query.0)
            .ok_or(Error::InvalidQuery(query.0))?
            .get_mut(index)?;
        let memory = self
            .query_lds
            .get_mut(region)
            .ok_or(Error::InvalidQuery(query.0))?;
        let mut stack = SharedStack::with_entries(memory, self.lane, lanes, entries);

        match op {
            QueryOp::Initialize { .. } => {
                if let Some((accel, flags, cull_mask, origin, tmin, dir, tmax)) = init {
                    if shared {
                        q.initialize_with(mem, accel, flags, cull_mask, origin, tmin, dir, tmax, &stack);
                    } else {
                        q.initialize(mem, accel, flags, cull_mask, origin, tmin, dir, tmax);
                    }
                }
            }
            QueryOp::Proceed => {
                let incomplete = if shared {
                    q.proceed_with(mem, &mut stack)
                } else {
                    q.proceed(mem)
                };
                self.regs.set(Reg::QueryStatus, incomplete)?;
            }
            QueryOp::Confirm => q.confirm(),
            QueryOp::Generate(_) => q.generate(generate_t),
            QueryOp::Terminate => q.terminate(),
        }
        Ok(())
    }

    fn eval_bool(&self, mem: &GlobalMemory, e: &Expr) -> Result<bool> {
        let v = self.eval(mem, e)?;
        v.as_bool().ok_or(Error::TypeMismatch {
            expected: VarType::Bool,
            found: v.ty(),
        })
    }
    fn eval_u32(&self, mem: &GlobalMemory, e: &Expr) -> Result<u32> {
        let v = self.eval(mem, e)?;
        v.as_u32().ok_or(Error::TypeMismatch {
            expected: VarType::U32,
            found: v.ty(),
        })
    }
    fn eval_u64(&self, mem: &GlobalMemory, e: &Expr) -> Result<u64> {
        let v = self.eval(mem, e)?;
        v.as_u64().ok_or(Error::TypeMismatch {
            expected: VarType::U64,
            found: v.ty(),
        })
    }
    fn eval_f32(&self, mem: &GlobalMemory, e: &Expr) -> Result<f32> {
        let v = self.eval(mem, e)?;
        v.as_f32().ok_or(Error::TypeMismatch {
            expected: VarType::F32,
            found: v.ty(),
        })
    }
    fn eval_vec3(&self, mem: &GlobalMemory, e: &Expr) -> Result<Vec3> {
        let v = self.eval(mem, e)?;
        v.as_vec3().ok_or(Error::TypeMismatch {
            expected: VarType::Vec3,
            found: v.ty(),
        })
    }

    pub fn eval(&self, mem: &GlobalMemory, e: &Expr) -> Result<Value> {
        Ok(match e {
            Expr::Lit(value) => *value,
            Expr::Reg(reg) => self.regs.get(*reg),
            Expr::System(SystemValue::LaunchId(c)) => {
                Value::U32(self.launch_id.get(*c as usize).copied().unwrap_or(0))
            }
            Expr::System(SystemValue::LaunchSize(c)) => {
                Value::U32(self.launch_size.get(*c as usize).copied().unwrap_or(0))
            }
            Expr::System(_) => return Err(Error::Unlowered("system value")),
            Expr::Unary(op, a) => {
                let a = self.eval(mem, a)?;
                op::unary(*op, a).ok_or_else(|| operands(op, &[a]))?
            }
            Expr::Binary(op, a, b) => {
                let a = self.eval(mem, a)?;
                let b = self.eval(mem, b)?;
                op::binary(*op, a, b).ok_or_else(|| operands(op, &[a, b]))?
            }
            Expr::Select(cond, a, b) => {
                if self.eval_bool(mem, cond)? {
                    self.eval(mem, a)?
                } else {
                    self.eval(mem, b)?
                }
            }
            Expr::Construct(elems) => {
                let values = elems
                    .iter()
                    .map(|e| self.eval_f32(mem, e))
                    .collect::<Result<Vec<_>>>()?;
                match values[..] {
                    [x, y] => Value::Vec2(Vec2::new(x, y)),
                    [x, y, z] => Value::Vec3(Vec3::new(x, y, z)),
                    _ => return Err(operands("construct", &[])),
                }
            }
            Expr::Extract(a, i) => {
                let a = self.eval(mem, a)?;
                let component = match a {
                    Value::Vec2(v) => v.to_array().get(*i as usize).copied(),
                    Value::Vec3(v) => v.to_array().get(*i as usize).copied(),
                    _ => None,
                };
                Value::F32(component.ok_or_else(|| operands("extract", &[a]))?)
            }
            Expr::LoadGlobal(ty, addr) => {
                let addr = self.eval_u64(mem, addr)?;
                let mut bytes = vec![0u8; ty.size() as usize];
                mem.read_bytes(addr, &mut bytes);
                Value::from_bytes(*ty, &bytes)
            }
            Expr::LoadScratch(ty, offset) => {
                let offset = self.eval_u32(mem, offset)?;
                let mut bytes = vec![0u8; ty.size() as usize];
                self.scratch.read_bytes(offset, &mut bytes);
                Value::from_bytes(*ty, &bytes)
            }
            Expr::InstanceField(field, addr) => {
                let addr = self.eval_u64(mem, addr)?;
                match field {
                    InstanceField::ObjectToWorld(_) | InstanceField::WorldToObject(_) => {
                        Value::Vec3(instance_column(mem, addr, *field))
                    }
                    _ => Value::U32(instance_u32(mem, addr, *field)),
                }
            }
            Expr::RayQueryLoad {
                query,
                index,
                value,
                committed,
            } => {
                let index = self.eval_u32(mem, index)?;
                self.queries
                    .get(query.0)
                    .ok_or(Error::InvalidQuery(query.0))?
                    .get(index)?
                    .load(mem, *value, *committed)
            }
            Expr::Local(_) => return Err(Error::Unlowered("local")),
            Expr::LoadFrame(..) => return Err(Error::Unlowered("frame load")),
            Expr::LoadPayload(..) => return Err(Error::Unlowered("payload load")),
            Expr::LoadHitAttrib(..) => return Err(Error::Unlowered("hit attribute load")),
        })
    }
}
