use crate::config::HIT_ATTRIB_OFFSET;
use crate::ir::{Case, Expr, Intrinsic, Label, LocalId, QueryId, QueryOp, Reg, Stmt, VarType};
use crate::pipeline::{Stage, StageKind};
use crate::policy::RayFlags;
use crate::sbt::SbtKind;

use super::frame::{align, candidate_source, committed_source, FrameLayout};
use super::{Error, Result};

/// Allocates dispatch tags and region labels across the whole pipeline and
/// collects the dispatch cases.
#[derive(Debug, Default)]
pub struct Context {
    pub next_tag: u32,
    pub next_label: u32,
    pub cases: Vec<Case>,
}

impl Context {
    pub fn new(first_tag: u32) -> Self {
        Self {
            next_tag: first_tag,
            ..Default::default()
        }
    }
    pub fn tag(&mut self) -> u32 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }
    pub fn label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }
}

#[derive(Clone, Copy, Debug)]
enum LoopTarget {
    /// A loop without calls, kept as a native loop.
    Structured,
    /// A loop split into continuations at `head` and `exit`.
    Split { head: u32, exit: u32 },
}

#[derive(Clone, Copy, Debug)]
enum Tail {
    Return,
    Goto(u32),
}

#[derive(Clone, Copy, Debug)]
pub enum Mode {
    /// Dispatched from the kernel loop, state saved in the frame.
    Recursive,
    /// Inlined into traversal, leaving the region with `label` accepts or
    /// ignores the candidate.
    AnyHit { label: Label },
    Intersection { label: Label },
}

#[derive(Clone, Copy, Debug)]
pub struct InlinedStage<'a> {
    pub stage: &'a Stage,
    pub query_base: usize,
}

pub struct StageLowering<'a> {
    stage: &'a Stage,
    frame: FrameLayout,
    mode: Mode,
    query_base: usize,
    /// Any-hit stage run for every intersection reported by this stage.
    any_hit: Option<InlinedStage<'a>>,
}

fn goto(tag: u32, label: Label) -> Vec<Stmt> {
    vec![Stmt::SetReg(Reg::Idx, Expr::lit(tag)), Stmt::Exit(label)]
}

impl<'a> StageLowering<'a> {
    pub fn new(
        stage: &'a Stage,
        base: u32,
        mode: Mode,
        query_base: usize,
        any_hit: Option<InlinedStage<'a>>,
    ) -> Self {
        Self {
            stage,
            frame: FrameLayout::new(stage, base),
            mode,
            query_base,
            any_hit,
        }
    }

    ///
    /// Lowers a recursive stage into its entry case tagged `tag`, and one
    /// case per continuation after calls and around call-containing control
    /// flow.
    ///
    pub fn lower_entry(&self, ctx: &mut Context, tag: u32) -> Result<()> {
        let label = ctx.label();
        let mut body = vec![];
        for (&value, &offset) in &self.frame.snapshots {
            body.push(Stmt::StoreScratch {
                offset: self.frame.addr(offset),
                value: committed_source(value),
            });
        }
        if let Some(offset) = self.frame.payload {
            body.push(Stmt::StoreScratch {
                offset: self.frame.addr(offset),
                value: Expr::reg(Reg::StackPtr).add(Reg::Arg),
            });
        }
        body.extend(self.seq(ctx, &self.stage.body, Tail::Return, &[], label)?);
        log::trace!("Lowered entry of stage {:?} with tag {tag}", self.stage.name);
        ctx.cases.push(Case { tag, label, body });
        Ok(())
    }

    /// Lowers an inlined any-hit or intersection stage into the body of the
    /// region `label`.
    pub fn lower_inlined(&self, ctx: &mut Context, label: Label) -> Result<Vec<Stmt>> {
        self.block(ctx, &self.stage.body, &[], label)
    }

    fn case(&self, ctx: &mut Context, tag: u32, body: impl FnOnce(&mut Context, Label) -> Result<Vec<Stmt>>) -> Result<()> {
        let label = ctx.label();
        let body = body(ctx, label)?;
        ctx.cases.push(Case { tag, label, body });
        Ok(())
    }

    fn seq(
        &self,
        ctx: &mut Context,
        stmts: &[Stmt],
        tail: Tail,
        loops: &[LoopTarget],
        label: Label,
    ) -> Result<Vec<Stmt>> {
        let mut out = vec![];
        for (i, stmt) in stmts.iter().enumerate() {
            if !stmt.contains_call() {
                self.structured(ctx, stmt, loops, label, &mut out)?;
                continue;
            }
            let rest = &stmts[i + 1..];
            match stmt {
                Stmt::TraceRay(_) | Stmt::ExecuteCallable { .. } => {
                    let resume = ctx.tag();
                    self.call(stmt, resume, label, &mut out)?;
                    let size = self.frame.call_size();
                    self.case(ctx, resume, |ctx, label| {
                        let mut body = vec![Stmt::SetReg(
                            Reg::StackPtr,
                            Expr::reg(Reg::StackPtr).sub(size),
                        )];
                        body.extend(self.seq(ctx, rest, tail, loops, label)?);
                        Ok(body)
                    })?;
                }
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let join = ctx.tag();
                    out.push(Stmt::If {
                        cond: self.expr(cond)?,
                        then: self.seq(ctx, then, Tail::Goto(join), loops, label)?,
                        otherwise: self.seq(ctx, otherwise, Tail::Goto(join), loops, label)?,
                    });
                    self.case(ctx, join, |ctx, label| self.seq(ctx, rest, tail, loops, label))?;
                }
                Stmt::Loop(body) => {
                    let head = ctx.tag();
                    let exit = ctx.tag();
                    out.extend(goto(head, label));
                    let mut inner = loops.to_vec();
                    inner.push(LoopTarget::Split { head, exit });
                    self.case(ctx, head, |ctx, label| {
                        self.seq(ctx, body, Tail::Goto(head), &inner, label)
                    })?;
                    self.case(ctx, exit, |ctx, label| self.seq(ctx, rest, tail, loops, label))?;
                }
                _ => return Err(self.invalid("call inside an unsupported statement")),
            }
            return Ok(out);
        }
        out.extend(match tail {
            Tail::Return => self.ret(label),
            Tail::Goto(tag) => goto(tag, label),
        });
        Ok(out)
    }

    fn block(
        &self,
        ctx: &mut Context,
        stmts: &[Stmt],
        loops: &[LoopTarget],
        label: Label,
    ) -> Result<Vec<Stmt>> {
        let mut out = vec![];
        for stmt in stmts {
            self.structured(ctx, stmt, loops, label, &mut out)?;
        }
        Ok(out)
    }

    fn invalid(&self, op: &'static str) -> Error {
        Error::InvalidOperation {
            stage: self.stage.name.clone(),
            kind: self.stage.kind,
            op,
        }
    }

    fn local(&self, id: LocalId) -> Result<(u32, VarType)> {
        self.frame.local(id).ok_or_else(|| Error::UndefinedLocal {
            stage: self.stage.name.clone(),
            local: id.0,
        })
    }

    fn query(&self, query: QueryId) -> Result<QueryId> {
        if query.0 < self.stage.queries.len() {
            Ok(QueryId(self.query_base + query.0))
        } else {
            Err(Error::UndefinedQuery {
                stage: self.stage.name.clone(),
                query: query.0,
            })
        }
    }

    fn payload_addr(&self, offset: u32) -> Result<Expr> {
        match self.mode {
            Mode::Recursive => {
                let slot = self.frame.payload.ok_or(self.invalid("payload access"))?;
                Ok(Expr::load_scratch(VarType::U32, self.frame.addr(slot)).add(offset))
            }
            _ => Ok(Expr::reg(Reg::StackPtr).add(Reg::Arg).add(offset)),
        }
    }

    fn ret(&self, label: Label) -> Vec<Stmt> {
        match self.mode {
            Mode::Recursive if self.stage.kind == StageKind::RayGen => {
                vec![Stmt::SetReg(Reg::Idx, Expr::lit(0u32)), Stmt::Exit(label)]
            }
            Mode::Recursive => vec![
                Stmt::SetReg(Reg::StackPtr, Expr::reg(Reg::StackPtr).sub(16u32)),
                Stmt::SetReg(
                    Reg::Idx,
                    Expr::load_scratch(VarType::U32, Reg::StackPtr),
                ),
                Stmt::Exit(label),
            ],
            Mode::AnyHit { label } | Mode::Intersection { label } => vec![Stmt::Exit(label)],
        }
    }

    fn call(&self, stmt: &Stmt, resume: u32, label: Label, out: &mut Vec<Stmt>) -> Result<()> {
        match stmt {
            Stmt::TraceRay(trace) => {
                let regs = [
                    (Reg::Accel, self.expr(&trace.accel)?),
                    (Reg::RayFlags, self.expr(&trace.flags)?),
                    (Reg::CullMask, self.expr(&trace.cull_mask)?.and(0xffu32)),
                    (Reg::SbtOffset, self.expr(&trace.sbt_offset)?.and(0xfu32)),
                    (Reg::SbtStride, self.expr(&trace.sbt_stride)?.and(0xfu32)),
                    (Reg::MissIndex, self.expr(&trace.miss_index)?.and(0xffffu32)),
                    (Reg::Origin, self.expr(&trace.origin)?),
                    (Reg::Tmin, self.expr(&trace.tmin)?),
                    (Reg::Dir, self.expr(&trace.dir)?),
                    (Reg::Tmax, self.expr(&trace.tmax)?),
                ];
                out.extend(regs.into_iter().map(|(reg, value)| Stmt::SetReg(reg, value)));
                self.push_frame(resume, trace.payload, out);
                out.push(Stmt::SetReg(Reg::Idx, Expr::lit(1u32)));
            }
            Stmt::ExecuteCallable { sbt_index, payload } => {
                out.push(Stmt::LoadSbtEntry {
                    kind: SbtKind::Callable,
                    index: self.expr(sbt_index)?,
                });
                self.push_frame(resume, *payload, out);
                // A null record returns straight to the resume case.
                out.push(Stmt::If {
                    cond: Expr::reg(Reg::Idx).eq(0u32),
                    then: vec![
                        Stmt::SetReg(Reg::StackPtr, Expr::reg(Reg::StackPtr).sub(16u32)),
                        Stmt::SetReg(Reg::Idx, Expr::lit(resume)),
                    ],
                    otherwise: vec![],
                });
            }
            _ => return Err(self.invalid("call")),
        }
        out.push(Stmt::Exit(label));
        Ok(())
    }

    /// Pushes the frame and the return tag, and passes the payload offset
    /// relative to the callee stack pointer.
    fn push_frame(&self, resume: u32, payload: u32, out: &mut Vec<Stmt>) {
        let size = self.frame.call_size();
        let sp = || Expr::reg(Reg::StackPtr);
        out.push(Stmt::SetReg(Reg::StackPtr, sp().add(size)));
        out.push(Stmt::StoreScratch {
            offset: sp(),
            value: Expr::lit(resume),
        });
        out.push(Stmt::SetReg(Reg::StackPtr, sp().add(16u32)));
        let arg = (self.frame.base + payload).wrapping_sub(size + 16);
        out.push(Stmt::SetReg(Reg::Arg, Expr::lit(arg)));
    }

    fn structured(
        &self,
        ctx: &mut Context,
        stmt: &Stmt,
        loops: &[LoopTarget],
        label: Label,
        out: &mut Vec<Stmt>,
    ) -> Result<()> {
        match stmt {
            Stmt::Assign(id, value) => {
                let (offset, _) = self.local(*id)?;
                out.push(Stmt::StoreScratch {
                    offset: self.frame.addr(offset),
                    value: self.expr(value)?,
                });
            }
            Stmt::StoreGlobal { addr, value } => out.push(Stmt::StoreGlobal {
                addr: self.expr(addr)?,
                value: self.expr(value)?,
            }),
            Stmt::StoreFrame { offset, value } => out.push(Stmt::StoreScratch {
                offset: self.frame.addr(*offset),
                value: self.expr(value)?,
            }),
            Stmt::StoreScratch { offset, value } => out.push(Stmt::StoreScratch {
                offset: self.expr(offset)?,
                value: self.expr(value)?,
            }),
            Stmt::StorePayload { offset, value } => out.push(Stmt::StoreScratch {
                offset: self.payload_addr(*offset)?,
                value: self.expr(value)?,
            }),
            Stmt::StoreHitAttrib { offset, value } => out.push(Stmt::StoreCandidateAttrib {
                offset: *offset,
                value: self.expr(value)?,
            }),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => out.push(Stmt::If {
                cond: self.expr(cond)?,
                then: self.block(ctx, then, loops, label)?,
                otherwise: self.block(ctx, otherwise, loops, label)?,
            }),
            Stmt::Loop(body) => {
                let mut inner = loops.to_vec();
                inner.push(LoopTarget::Structured);
                out.push(Stmt::Loop(self.block(ctx, body, &inner, label)?));
            }
            Stmt::Break | Stmt::Continue => {
                let target = loops.last().ok_or_else(|| Error::BreakOutsideLoop {
                    stage: self.stage.name.clone(),
                })?;
                match (*target, stmt) {
                    (LoopTarget::Structured, _) => out.push(stmt.clone()),
                    (LoopTarget::Split { exit, .. }, Stmt::Break) => out.extend(goto(exit, label)),
                    (LoopTarget::Split { head, .. }, _) => out.extend(goto(head, label)),
                }
            }
            Stmt::Return => out.extend(self.ret(label)),
            Stmt::IgnoreIntersection => {
                out.push(Stmt::SetReg(Reg::AhitAccept, Expr::lit(false)));
                out.extend(self.ret(label));
            }
            Stmt::TerminateRay => {
                out.push(Stmt::SetReg(Reg::AhitAccept, Expr::lit(true)));
                out.push(Stmt::SetReg(Reg::AhitTerminate, Expr::lit(true)));
                out.extend(self.ret(label));
            }
            Stmt::ReportIntersection {
                t,
                hit_kind,
                accepted,
            } => self.report(ctx, t, hit_kind, *accepted, out)?,
            Stmt::RayQuery { query, index, op } => {
                let op = match op {
                    QueryOp::Initialize {
                        accel,
                        flags,
                        cull_mask,
                        origin,
                        tmin,
                        dir,
                        tmax,
                    } => QueryOp::Initialize {
                        accel: self.expr(accel)?,
                        flags: self.expr(flags)?,
                        cull_mask: self.expr(cull_mask)?,
                        origin: self.expr(origin)?,
                        tmin: self.expr(tmin)?,
                        dir: self.expr(dir)?,
                        tmax: self.expr(tmax)?,
                    },
                    QueryOp::Generate(t) => QueryOp::Generate(self.expr(t)?),
                    op => op.clone(),
                };
                out.push(Stmt::RayQuery {
                    query: self.query(*query)?,
                    index: self.expr(index)?,
                    op,
                });
            }
            Stmt::TraceRay(_) | Stmt::ExecuteCallable { .. } => return Err(self.invalid("call")),
            Stmt::StoreCandidateAttrib { .. }
            | Stmt::SetReg(..)
            | Stmt::LoadSbtEntry { .. }
            | Stmt::Intrinsic(_)
            | Stmt::Region { .. }
            | Stmt::Exit(_)
            | Stmt::Traverse(_) => return Err(self.invalid("kernel statement")),
        }
        Ok(())
    }

    ///
    /// Reports an intersection from an intersection stage: checks the
    /// distance against the ray interval, runs the any-hit stage for
    /// non-opaque candidates and commits accepted ones.
    ///
    fn report(
        &self,
        ctx: &mut Context,
        t: &Expr,
        hit_kind: &Expr,
        accepted: Option<LocalId>,
        out: &mut Vec<Stmt>,
    ) -> Result<()> {
        let Mode::Intersection { label: isec_label } = self.mode else {
            return Err(self.invalid("report intersection"));
        };
        let slot = self.frame.report.ok_or(self.invalid("report intersection"))?;
        let t_addr = self.frame.addr(slot);
        let kind_addr = self.frame.addr(slot + 4);
        let committed_addr = self.frame.addr(slot + 8);
        let t_value = Expr::load_scratch(VarType::F32, t_addr.clone());

        out.push(Stmt::StoreScratch {
            offset: t_addr,
            value: self.expr(t)?,
        });
        out.push(Stmt::StoreScratch {
            offset: kind_addr.clone(),
            value: self.expr(hit_kind)?,
        });
        out.push(Stmt::StoreScratch {
            offset: committed_addr.clone(),
            value: Expr::lit(false),
        });

        let mut candidate = vec![
            Stmt::SetReg(Reg::AhitAccept, Expr::lit(true)),
            Stmt::SetReg(Reg::CandT, t_value.clone()),
            Stmt::SetReg(Reg::CandHitKind, Expr::load_scratch(VarType::U32, kind_addr)),
            Stmt::Intrinsic(Intrinsic::StageHitAttribs),
        ];
        if let Some(any_hit) = self.any_hit {
            let label = ctx.label();
            let lowering = StageLowering::new(
                any_hit.stage,
                self.frame.base + align(self.frame.size, 16),
                Mode::AnyHit { label },
                any_hit.query_base,
                None,
            );
            let body = lowering.lower_inlined(ctx, label)?;
            candidate.push(Stmt::If {
                cond: Expr::reg(Reg::CandOpaque).not(),
                then: vec![Stmt::Region { label, body }],
                otherwise: vec![],
            });
        }
        let terminate = Expr::reg(Reg::RayFlags)
            .and(RayFlags::TERMINATE_ON_FIRST_HIT.bits())
            .ne(0u32)
            .or(Reg::AhitTerminate);
        candidate.push(Stmt::If {
            cond: Expr::reg(Reg::AhitAccept),
            then: vec![
                Stmt::Intrinsic(Intrinsic::CommitCandidate),
                Stmt::StoreScratch {
                    offset: committed_addr.clone(),
                    value: Expr::lit(true),
                },
                Stmt::If {
                    cond: terminate,
                    then: vec![
                        Stmt::SetReg(Reg::AhitTerminate, Expr::lit(true)),
                        Stmt::Exit(isec_label),
                    ],
                    otherwise: vec![],
                },
            ],
            otherwise: vec![Stmt::Intrinsic(Intrinsic::RestoreHitAttribs)],
        });

        out.push(Stmt::If {
            cond: t_value
                .clone()
                .ge(Reg::Tmin)
                .and(t_value.le(Reg::Tmax)),
            then: candidate,
            otherwise: vec![],
        });
        if let Some(id) = accepted {
            let (offset, _) = self.local(id)?;
            out.push(Stmt::StoreScratch {
                offset: self.frame.addr(offset),
                value: Expr::load_scratch(VarType::Bool, committed_addr),
            });
        }
        Ok(())
    }

    fn boxed(&self, e: &Expr) -> Result<Box<Expr>> {
        Ok(Box::new(self.expr(e)?))
    }

    fn expr(&self, e: &Expr) -> Result<Expr> {
        Ok(match e {
            Expr::Lit(_) | Expr::Reg(_) => e.clone(),
            Expr::Local(id) => {
                let (offset, ty) = self.local(*id)?;
                Expr::load_scratch(ty, self.frame.addr(offset))
            }
            Expr::System(value) if value.is_lane_constant() => e.clone(),
            Expr::System(value) => match self.mode {
                Mode::Recursive => {
                    let offset = self
                        .frame
                        .snapshots
                        .get(value)
                        .copied()
                        .ok_or_else(|| Error::InvalidSystemValue {
                            stage: self.stage.name.clone(),
                            kind: self.stage.kind,
                            value: *value,
                        })?;
                    Expr::load_scratch(value.ty(), self.frame.addr(offset))
                }
                _ => candidate_source(*value, self.stage.kind),
            },
            Expr::Unary(op, a) => Expr::Unary(*op, self.boxed(a)?),
            Expr::Binary(op, a, b) => Expr::Binary(*op, self.boxed(a)?, self.boxed(b)?),
            Expr::Select(c, a, b) => Expr::Select(self.boxed(c)?, self.boxed(a)?, self.boxed(b)?),
            Expr::Construct(elems) => Expr::Construct(
                elems
                    .iter()
                    .map(|e| self.expr(e))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Expr::Extract(a, i) => Expr::Extract(self.boxed(a)?, *i),
            Expr::LoadGlobal(ty, addr) => Expr::LoadGlobal(*ty, self.boxed(addr)?),
            Expr::LoadFrame(ty, offset) => Expr::load_scratch(*ty, self.frame.addr(*offset)),
            Expr::LoadScratch(ty, offset) => Expr::LoadScratch(*ty, self.boxed(offset)?),
            Expr::LoadPayload(ty, offset) => Expr::load_scratch(*ty, self.payload_addr(*offset)?),
            Expr::LoadHitAttrib(ty, offset) => Expr::load_scratch(
                *ty,
                Expr::reg(Reg::StackPtr).add((HIT_ATTRIB_OFFSET as u32).wrapping_add(*offset)),
            ),
            Expr::InstanceField(field, addr) => Expr::InstanceField(*field, self.boxed(addr)?),
            Expr::RayQueryLoad {
                query,
                index,
                value,
                committed,
            } => Expr::RayQueryLoad {
                query: self.query(*query)?,
                index: self.boxed(index)?,
                value: *value,
                committed: *committed,
            },
        })
    }
}
