mod frame;
mod lower;
#[cfg(test)]
mod test;

use itertools::Itertools;

use crate::config::Config;
use crate::ir::{Case, Expr, Reg, Stmt, SystemValue, TraversalBlock};
use crate::pipeline::{
    GroupStackSize, Pipeline, PipelineDesc, ShaderGroup, Stage, StageKind,
};
use crate::policy::RayFlags;
use crate::sbt::SbtKind;

pub use frame::{align, FrameLayout};
use lower::{Context, InlinedStage, Mode, StageLowering};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("The pipeline has no ray generation stage!")]
    MissingRayGen,
    #[error("Group {group} references stage {stage}, which does not exist!")]
    InvalidStage { group: usize, stage: usize },
    #[error("Group {group} references stage {stage} of kind {kind:?}, which is not allowed there!")]
    StageKindMismatch {
        group: usize,
        stage: usize,
        kind: StageKind,
    },
    #[error("Operation `{op}` is not allowed in {kind:?} stage {stage:?}!")]
    InvalidOperation {
        stage: String,
        kind: StageKind,
        op: &'static str,
    },
    #[error("System value {value:?} is not available in {kind:?} stage {stage:?}!")]
    InvalidSystemValue {
        stage: String,
        kind: StageKind,
        value: SystemValue,
    },
    #[error("`break` or `continue` outside of a loop in stage {stage:?}!")]
    BreakOutsideLoop { stage: String },
    #[error("Local {local} is not declared in stage {stage:?}!")]
    UndefinedLocal { stage: String, local: usize },
    #[error("Ray query {query} is not declared in stage {stage:?}!")]
    UndefinedQuery { stage: String, query: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn visit_exprs(stmts: &[Stmt], f: &mut impl FnMut(&Expr)) {
    for stmt in stmts {
        stmt.for_each_expr(|e| visit_expr(e, f));
        stmt.for_each_block(|block| visit_exprs(block, f));
    }
}

fn visit_expr(e: &Expr, f: &mut impl FnMut(&Expr)) {
    f(e);
    e.for_each_child(|child| visit_expr(child, f));
}

fn check_stmts(stage: &Stage, stmts: &[Stmt]) -> Result<()> {
    use StageKind::*;
    let invalid = |op| Error::InvalidOperation {
        stage: stage.name.clone(),
        kind: stage.kind,
        op,
    };
    let kind = stage.kind;
    for stmt in stmts {
        let allowed = match stmt {
            Stmt::TraceRay(_) => matches!(kind, RayGen | ClosestHit | Miss),
            Stmt::ExecuteCallable { .. } => matches!(kind, RayGen | ClosestHit | Miss | Callable),
            Stmt::ReportIntersection { .. } | Stmt::StoreHitAttrib { .. } => kind == Intersection,
            Stmt::IgnoreIntersection | Stmt::TerminateRay => kind == AnyHit,
            Stmt::StorePayload { .. } => matches!(kind, Miss | ClosestHit | AnyHit | Callable),
            Stmt::StoreCandidateAttrib { .. }
            | Stmt::SetReg(..)
            | Stmt::LoadSbtEntry { .. }
            | Stmt::Intrinsic(_)
            | Stmt::Region { .. }
            | Stmt::Exit(_)
            | Stmt::Traverse(_) => false,
            _ => true,
        };
        if !allowed {
            return Err(invalid(stmt_name(stmt)));
        }

        let mut result = Ok(());
        stmt.for_each_expr(|e| {
            visit_expr(e, &mut |e| {
                if result.is_ok() {
                    result = check_expr(stage, e);
                }
            })
        });
        result?;

        let mut result = Ok(());
        stmt.for_each_block(|block| {
            if result.is_ok() {
                result = check_stmts(stage, block);
            }
        });
        result?;
    }
    Ok(())
}

fn check_expr(stage: &Stage, e: &Expr) -> Result<()> {
    use StageKind::*;
    let kind = stage.kind;
    let invalid = |op| Error::InvalidOperation {
        stage: stage.name.clone(),
        kind,
        op,
    };
    match e {
        Expr::System(value) if !frame::system_value_allowed(kind, *value) => {
            Err(Error::InvalidSystemValue {
                stage: stage.name.clone(),
                kind,
                value: *value,
            })
        }
        Expr::LoadPayload(..) if !matches!(kind, Miss | ClosestHit | AnyHit | Callable) => {
            Err(invalid("load payload"))
        }
        Expr::LoadHitAttrib(..) if !matches!(kind, ClosestHit | AnyHit) => {
            Err(invalid("load hit attribute"))
        }
        Expr::Reg(reg) if *reg != Reg::QueryStatus => Err(invalid("register")),
        _ => Ok(()),
    }
}

fn stmt_name(stmt: &Stmt) -> &'static str {
    match stmt {
        Stmt::TraceRay(_) => "trace ray",
        Stmt::ExecuteCallable { .. } => "execute callable",
        Stmt::ReportIntersection { .. } => "report intersection",
        Stmt::StoreHitAttrib { .. } => "store hit attribute",
        Stmt::IgnoreIntersection => "ignore intersection",
        Stmt::TerminateRay => "terminate ray",
        Stmt::StorePayload { .. } => "store payload",
        _ => "kernel statement",
    }
}

fn validate(desc: &PipelineDesc) -> Result<()> {
    if !desc.stages.iter().any(|s| s.kind == StageKind::RayGen) {
        return Err(Error::MissingRayGen);
    }
    for (group, g) in desc.groups.iter().enumerate() {
        for (stage, kinds) in g.stages() {
            let s = desc
                .stages
                .get(stage)
                .ok_or(Error::InvalidStage { group, stage })?;
            if !kinds.contains(&s.kind) {
                return Err(Error::StageKindMismatch {
                    group,
                    stage,
                    kind: s.kind,
                });
            }
        }
    }
    for stage in &desc.stages {
        check_stmts(stage, &stage.body)?;
    }
    Ok(())
}

/// Stack usage of a single stage.
pub fn stage_stack_size(stage: &Stage) -> u32 {
    let frame = FrameLayout::new(stage, 0);
    let has_call = stage.body.iter().any(Stmt::contains_call);
    frame.stack_size(has_call)
}

fn group_stack_size(group: &ShaderGroup, stage_sizes: &[u32]) -> GroupStackSize {
    let size = |stage: Option<usize>| stage.map(|s| stage_sizes[s]).unwrap_or(0);
    match *group {
        ShaderGroup::General { stage } => GroupStackSize {
            recursive_size: size(Some(stage)),
            non_recursive_size: 0,
        },
        ShaderGroup::Triangles {
            closest_hit,
            any_hit,
        } => GroupStackSize {
            recursive_size: size(closest_hit),
            non_recursive_size: size(any_hit),
        },
        ShaderGroup::Procedural {
            closest_hit,
            any_hit,
            intersection,
        } => GroupStackSize {
            recursive_size: size(closest_hit),
            non_recursive_size: size(Some(intersection)) + size(any_hit),
        },
    }
}

fn if_eq(reg: Reg, tag: u32, then: Vec<Stmt>) -> Stmt {
    Stmt::If {
        cond: Expr::reg(reg).eq(tag),
        then,
        otherwise: vec![],
    }
}

///
/// Compiles a pipeline into a single kernel.
///
/// Recursive stages are split at every call into continuations, each one
/// a case of a dispatch loop selected by [`Reg::Idx`]. Tag 0 ends the
/// lane, tag 1 starts a traversal, tag `stage + 2` enters a stage and
/// continuation tags follow from `stage count + 2` in stage order.
/// Any-hit and intersection stages are inlined into the traversal block,
/// keyed by `group + 2`.
///
#[profiling::function]
pub fn compile(desc: &PipelineDesc, config: &Config) -> Result<Pipeline> {
    validate(desc)?;

    let query_bases = desc
        .stages
        .iter()
        .scan(0, |base, stage| {
            let current = *base;
            *base += stage.queries.len();
            Some(current)
        })
        .collect_vec();
    let query_sizes = desc
        .stages
        .iter()
        .flat_map(|stage| stage.queries.iter().copied())
        .collect_vec();

    let mut ctx = Context::new(desc.stages.len() as u32 + 2);

    for (i, stage) in desc.stages.iter().enumerate() {
        if !stage.kind.is_recursive() {
            continue;
        }
        StageLowering::new(stage, 0, Mode::Recursive, query_bases[i], None)
            .lower_entry(&mut ctx, i as u32 + 2)?;
    }
    let cases = std::mem::take(&mut ctx.cases);

    let mut block = TraversalBlock::default();
    for (group, g) in desc.groups.iter().enumerate() {
        let tag = group as u32 + 2;
        match *g {
            ShaderGroup::Triangles {
                any_hit: Some(any_hit),
                ..
            } => {
                let label = ctx.label();
                let stage = &desc.stages[any_hit];
                let body = StageLowering::new(
                    stage,
                    0,
                    Mode::AnyHit { label },
                    query_bases[any_hit],
                    None,
                )
                .lower_inlined(&mut ctx, label)?;
                block.any_hit.push(Case { tag, label, body });
            }
            ShaderGroup::Procedural {
                any_hit,
                intersection,
                ..
            } => {
                let label = ctx.label();
                let stage = &desc.stages[intersection];
                let any_hit = any_hit.map(|s| InlinedStage {
                    stage: &desc.stages[s],
                    query_base: query_bases[s],
                });
                let body = StageLowering::new(
                    stage,
                    0,
                    Mode::Intersection { label },
                    query_bases[intersection],
                    any_hit,
                )
                .lower_inlined(&mut ctx, label)?;
                block.intersection.push(Case { tag, label, body });
            }
            _ => {}
        }
    }

    let pop_return = vec![
        Stmt::SetReg(Reg::StackPtr, Expr::reg(Reg::StackPtr).sub(16u32)),
        Stmt::SetReg(
            Reg::Idx,
            Expr::load_scratch(crate::ir::VarType::U32, Reg::StackPtr),
        ),
    ];
    let skip_closest_hit = Expr::reg(Reg::RayFlags)
        .and(RayFlags::SKIP_CLOSEST_HIT_SHADER.bits())
        .ne(0u32);

    let mut body = vec![
        Stmt::If {
            cond: Expr::reg(Reg::Idx)
                .eq(0u32)
                .or(Expr::reg(Reg::Visited).not()),
            then: vec![Stmt::Break],
            otherwise: vec![],
        },
        Stmt::SetReg(Reg::Visited, Expr::lit(false)),
        if_eq(
            Reg::Idx,
            1,
            vec![
                Stmt::SetReg(Reg::Visited, Expr::lit(true)),
                Stmt::Traverse(Box::new(block)),
                Stmt::If {
                    cond: Expr::reg(Reg::Hit),
                    then: vec![
                        Stmt::LoadSbtEntry {
                            kind: SbtKind::Hit,
                            index: Expr::reg(Reg::Idx),
                        },
                        Stmt::If {
                            cond: skip_closest_hit,
                            then: vec![Stmt::SetReg(Reg::Idx, Expr::lit(0u32))],
                            otherwise: vec![],
                        },
                    ],
                    otherwise: vec![Stmt::LoadSbtEntry {
                        kind: SbtKind::Miss,
                        index: Expr::reg(Reg::MissIndex),
                    }],
                },
                if_eq(Reg::Idx, 0, pop_return),
            ],
        ),
        Stmt::SetReg(Reg::DispatchIdx, Expr::reg(Reg::Idx)),
    ];
    let case_count = cases.len();
    body.extend(cases.into_iter().map(|case| {
        if_eq(
            Reg::DispatchIdx,
            case.tag,
            vec![
                Stmt::SetReg(Reg::Visited, Expr::lit(true)),
                Stmt::Region {
                    label: case.label,
                    body: case.body,
                },
            ],
        )
    }));

    let spill_size = config.spill_size();
    let kernel = vec![
        Stmt::LoadSbtEntry {
            kind: SbtKind::Raygen,
            index: Expr::lit(0u32),
        },
        Stmt::SetReg(Reg::StackPtr, Expr::lit(spill_size)),
        Stmt::SetReg(Reg::Visited, Expr::lit(true)),
        Stmt::Loop(body),
    ];

    let stage_sizes = desc.stages.iter().map(stage_stack_size).collect_vec();
    let group_stack_sizes = desc
        .groups
        .iter()
        .map(|group| group_stack_size(group, &stage_sizes))
        .collect_vec();

    log::debug!(
        "Compiled pipeline of {} stages into {case_count} cases",
        desc.stages.len()
    );

    Ok(Pipeline {
        kernel,
        groups: desc.groups.clone(),
        stage_kinds: desc.stages.iter().map(|s| s.kind).collect(),
        stage_sizes,
        group_stack_sizes,
        max_recursion_depth: desc.max_recursion_depth,
        query_sizes,
        spill_size,
    })
}
