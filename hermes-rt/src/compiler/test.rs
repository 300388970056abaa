use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rstest::rstest;

use crate::config::Config;
use crate::ir::{Expr, LocalId, Reg, ShaderBuilder, Stmt, SystemValue, TraceRay, Value, VarType};
use crate::op::BinOp;
use crate::pipeline::{GroupShader, PipelineDesc, ShaderGroup, Stage, StageKind};

use super::{compile, Error};

fn stage(kind: StageKind, name: &str, f: impl FnOnce(&mut ShaderBuilder)) -> Stage {
    let mut b = ShaderBuilder::new(kind, name);
    f(&mut b);
    b.build()
}

fn raygen() -> Stage {
    stage(StageKind::RayGen, "raygen", |b| {
        let payload = b.scratch(16);
        b.trace_ray(TraceRay::new(0u64, glam::Vec3::ZERO, glam::Vec3::Z, payload));
    })
}

fn miss() -> Stage {
    stage(StageKind::Miss, "miss", |b| b.store_payload(0, 1u32))
}

fn closest_hit() -> Stage {
    stage(StageKind::ClosestHit, "chit", |b| b.store_payload(0, SystemValue::HitT))
}

fn any_hit() -> Stage {
    stage(StageKind::AnyHit, "ahit", |b| {
        let t = b.let_(VarType::F32, SystemValue::HitT);
        b.if_(Expr::local(t).gt(10f32), |b| b.ignore_intersection());
    })
}

fn intersection() -> Stage {
    stage(StageKind::Intersection, "isec", |b| {
        b.report_intersection(1f32, 0u32);
    })
}

fn callable() -> Stage {
    stage(StageKind::Callable, "callable", |b| {
        b.store_payload(0, Expr::LoadPayload(VarType::U32, 0).add(1u32))
    })
}

fn dispatch_tags(kernel: &[Stmt]) -> Vec<u32> {
    let Some(Stmt::Loop(body)) = kernel.last() else {
        return vec![];
    };
    body.iter()
        .filter_map(|stmt| match stmt {
            Stmt::If {
                cond: Expr::Binary(BinOp::Eq, lhs, rhs),
                ..
            } if **lhs == Expr::Reg(Reg::DispatchIdx) => match **rhs {
                Expr::Lit(Value::U32(tag)) => Some(tag),
                _ => None,
            },
            _ => None,
        })
        .sorted()
        .collect()
}

#[test]
fn tags_and_handles() {
    let desc = PipelineDesc {
        stages: vec![raygen(), miss(), closest_hit(), any_hit(), intersection()],
        groups: vec![
            ShaderGroup::General { stage: 0 },
            ShaderGroup::General { stage: 1 },
            ShaderGroup::Triangles {
                closest_hit: Some(2),
                any_hit: Some(3),
            },
            ShaderGroup::Procedural {
                closest_hit: Some(2),
                any_hit: None,
                intersection: 4,
            },
            ShaderGroup::Triangles {
                closest_hit: Some(2),
                any_hit: None,
            },
        ],
        max_recursion_depth: 1,
    };
    let pipeline = compile(&desc, &Config::default()).unwrap();

    let handles = (0..desc.groups.len())
        .map(|group| {
            let handle = pipeline.group_handle(group).unwrap();
            let words: &[u32] = bytemuck::cast_slice(&handle[..8]);
            format!("{} {}", words[0], words[1])
        })
        .join(" | ");
    insta::assert_snapshot!(handles, @"2 0 | 3 0 | 4 4 | 4 5 | 4 0");
    assert_eq!(pipeline.group_handle(desc.groups.len()), None);

    // Stage entries use `stage + 2`, the continuation after the trace in
    // the ray generation stage follows the last stage tag.
    assert_eq!(dispatch_tags(&pipeline.kernel), vec![2, 3, 4, 7]);
}

#[test]
fn default_stack_size() {
    let desc = PipelineDesc {
        stages: vec![raygen(), miss(), closest_hit(), callable()],
        groups: vec![
            ShaderGroup::General { stage: 0 },
            ShaderGroup::General { stage: 1 },
            ShaderGroup::Triangles {
                closest_hit: Some(2),
                any_hit: None,
            },
            ShaderGroup::General { stage: 3 },
        ],
        max_recursion_depth: 2,
    };
    let config = Config::default();
    let pipeline = compile(&desc, &config).unwrap();

    // 16 bytes of payload, 32 bytes of callee hit attributes and the
    // return tag.
    assert_eq!(pipeline.stage_sizes[0], 64);
    assert_eq!(pipeline.stage_sizes[1], 16);
    assert_eq!(pipeline.stage_sizes[2], 16);
    assert_eq!(pipeline.stage_sizes[3], 16);
    assert_eq!(pipeline.group_stack_size(0, GroupShader::General), 64);
    assert_eq!(pipeline.group_stack_size(2, GroupShader::ClosestHit), 16);
    assert_eq!(pipeline.group_stack_size(2, GroupShader::AnyHit), 0);
    assert_eq!(pipeline.stack_size(), 64 + 2 * 16 + 2 * 16);
    assert_eq!(pipeline.scratch_size(), config.spill_size() + 128);
}

#[test]
fn shared_any_hit() {
    let desc = PipelineDesc {
        stages: vec![raygen(), closest_hit(), any_hit(), intersection()],
        groups: vec![
            ShaderGroup::General { stage: 0 },
            ShaderGroup::Triangles {
                closest_hit: Some(1),
                any_hit: Some(2),
            },
            ShaderGroup::Triangles {
                closest_hit: None,
                any_hit: Some(2),
            },
            ShaderGroup::Procedural {
                closest_hit: None,
                any_hit: Some(2),
                intersection: 3,
            },
        ],
        max_recursion_depth: 1,
    };
    let pipeline = compile(&desc, &Config::default()).unwrap();

    let ahit = pipeline.group_stack_size(1, GroupShader::AnyHit);
    assert!(ahit > 0);
    assert_eq!(pipeline.group_stack_size(2, GroupShader::AnyHit), ahit);
    assert_eq!(pipeline.group_stack_size(2, GroupShader::ClosestHit), 0);
    assert!(pipeline.group_stack_size(3, GroupShader::Intersection) > ahit);
}

#[test]
fn stack_size_ignores_stage_order() {
    let stages = vec![
        raygen(),
        miss(),
        closest_hit(),
        any_hit(),
        intersection(),
        callable(),
        stage(StageKind::ClosestHit, "chit2", |b| {
            let payload = b.scratch(40);
            b.trace_ray(TraceRay::new(0u64, glam::Vec3::ZERO, glam::Vec3::X, payload));
            b.store_payload(0, Expr::LoadFrame(VarType::U32, payload));
        }),
    ];
    let groups = vec![
        ShaderGroup::General { stage: 0 },
        ShaderGroup::General { stage: 1 },
        ShaderGroup::Triangles {
            closest_hit: Some(2),
            any_hit: Some(3),
        },
        ShaderGroup::Procedural {
            closest_hit: Some(6),
            any_hit: Some(3),
            intersection: 4,
        },
        ShaderGroup::General { stage: 5 },
    ];
    let desc = PipelineDesc {
        stages,
        groups,
        max_recursion_depth: 3,
    };
    let reference = compile(&desc, &Config::default()).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    for _ in 0..8 {
        let mut order = (0..desc.stages.len()).collect_vec();
        order.shuffle(&mut rng);
        // `order[new] = old`, groups are remapped to the new positions.
        let position = |old: usize| order.iter().position(|&o| o == old).unwrap();
        let remap = |stage: Option<usize>| stage.map(position);
        let shuffled = PipelineDesc {
            stages: order.iter().map(|&old| desc.stages[old].clone()).collect(),
            groups: desc
                .groups
                .iter()
                .map(|group| match *group {
                    ShaderGroup::General { stage } => ShaderGroup::General {
                        stage: position(stage),
                    },
                    ShaderGroup::Triangles {
                        closest_hit,
                        any_hit,
                    } => ShaderGroup::Triangles {
                        closest_hit: remap(closest_hit),
                        any_hit: remap(any_hit),
                    },
                    ShaderGroup::Procedural {
                        closest_hit,
                        any_hit,
                        intersection,
                    } => ShaderGroup::Procedural {
                        closest_hit: remap(closest_hit),
                        any_hit: remap(any_hit),
                        intersection: position(intersection),
                    },
                })
                .collect(),
            max_recursion_depth: desc.max_recursion_depth,
        };
        let pipeline = compile(&shuffled, &Config::default()).unwrap();

        assert_eq!(pipeline.stack_size(), reference.stack_size());
        assert_eq!(pipeline.group_stack_sizes, reference.group_stack_sizes);
        for (new, &old) in order.iter().enumerate() {
            assert_eq!(pipeline.stage_sizes[new], reference.stage_sizes[old]);
        }
    }
}

#[test]
fn missing_raygen() {
    let desc = PipelineDesc {
        stages: vec![miss()],
        groups: vec![ShaderGroup::General { stage: 0 }],
        max_recursion_depth: 1,
    };
    assert!(matches!(
        compile(&desc, &Config::default()),
        Err(Error::MissingRayGen)
    ));
}

#[rstest]
#[case(ShaderGroup::General { stage: 1 })]
#[case(ShaderGroup::Triangles { closest_hit: Some(0), any_hit: None })]
#[case(ShaderGroup::Procedural { closest_hit: None, any_hit: None, intersection: 1 })]
fn group_kind_mismatch(#[case] group: ShaderGroup) {
    let desc = PipelineDesc {
        stages: vec![raygen(), closest_hit()],
        groups: vec![ShaderGroup::General { stage: 0 }, group],
        max_recursion_depth: 1,
    };
    assert!(matches!(
        compile(&desc, &Config::default()),
        Err(Error::StageKindMismatch { group: 1, .. })
    ));
}

#[test]
fn group_stage_out_of_range() {
    let desc = PipelineDesc {
        stages: vec![raygen()],
        groups: vec![ShaderGroup::General { stage: 3 }],
        max_recursion_depth: 1,
    };
    assert!(matches!(
        compile(&desc, &Config::default()),
        Err(Error::InvalidStage { group: 0, stage: 3 })
    ));
}

fn single(stage: Stage) -> PipelineDesc {
    let kind = stage.kind;
    let mut stages = vec![raygen()];
    if kind != StageKind::RayGen {
        stages.push(stage);
    } else {
        stages[0] = stage;
    }
    PipelineDesc {
        stages,
        groups: vec![ShaderGroup::General { stage: 0 }],
        max_recursion_depth: 1,
    }
}

#[rstest]
#[case(StageKind::AnyHit, "trace ray")]
#[case(StageKind::Intersection, "trace ray")]
#[case(StageKind::Callable, "trace ray")]
fn trace_outside_recursive_stages(#[case] kind: StageKind, #[case] expected: &str) {
    let stage = stage(kind, "tracing", |b| {
        b.trace_ray(TraceRay::new(0u64, glam::Vec3::ZERO, glam::Vec3::Z, 0));
    });
    match compile(&single(stage), &Config::default()) {
        Err(Error::InvalidOperation { op, kind: k, .. }) => {
            assert_eq!(op, expected);
            assert_eq!(k, kind);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn stage_specific_operations() {
    let report = stage(StageKind::ClosestHit, "report", |b| {
        b.report_intersection(1f32, 0u32);
    });
    assert!(matches!(
        compile(&single(report), &Config::default()),
        Err(Error::InvalidOperation {
            op: "report intersection",
            ..
        })
    ));

    let ignore = stage(StageKind::Intersection, "ignore", |b| b.ignore_intersection());
    assert!(matches!(
        compile(&single(ignore), &Config::default()),
        Err(Error::InvalidOperation {
            op: "ignore intersection",
            ..
        })
    ));

    let payload = stage(StageKind::RayGen, "payload", |b| b.store_payload(0, 0u32));
    assert!(matches!(
        compile(&single(payload), &Config::default()),
        Err(Error::InvalidOperation {
            op: "store payload",
            ..
        })
    ));
}

#[rstest]
#[case(StageKind::RayGen, SystemValue::HitT)]
#[case(StageKind::RayGen, SystemValue::WorldRayOrigin)]
#[case(StageKind::Miss, SystemValue::PrimitiveId)]
#[case(StageKind::Callable, SystemValue::RayTmax)]
#[case(StageKind::Intersection, SystemValue::HitKind)]
#[case(StageKind::ClosestHit, SystemValue::LaunchId(3))]
fn unavailable_system_values(#[case] kind: StageKind, #[case] value: SystemValue) {
    let stage = stage(kind, "reader", |b| {
        b.let_(value.ty(), value);
    });
    assert!(matches!(
        compile(&single(stage), &Config::default()),
        Err(Error::InvalidSystemValue { value: v, .. }) if v == value
    ));
}

#[test]
fn break_outside_loop() {
    let outside = stage(StageKind::RayGen, "raygen", |b| b.break_());
    assert!(matches!(
        compile(&single(outside), &Config::default()),
        Err(Error::BreakOutsideLoop { .. })
    ));

    // Inside a loop that is split at a call it is fine.
    let inside = stage(StageKind::RayGen, "raygen", |b| {
        let payload = b.scratch(4);
        b.loop_(|b| {
            b.trace_ray(TraceRay::new(0u64, glam::Vec3::ZERO, glam::Vec3::Z, payload));
            b.break_();
        });
    });
    assert!(compile(&single(inside), &Config::default()).is_ok());
}

#[test]
fn undefined_local() {
    let stage = stage(StageKind::RayGen, "raygen", |b| {
        b.store_global(0u64, Expr::local(LocalId(4)));
    });
    assert!(matches!(
        compile(&single(stage), &Config::default()),
        Err(Error::UndefinedLocal { local: 4, .. })
    ));
}

#[test]
fn kernel_statements_are_rejected() {
    let stage = stage(StageKind::RayGen, "raygen", |b| {
        b.push(Stmt::SetReg(Reg::Idx, Expr::lit(0u32)));
    });
    assert!(matches!(
        compile(&single(stage), &Config::default()),
        Err(Error::InvalidOperation {
            op: "kernel statement",
            ..
        })
    ));
}
