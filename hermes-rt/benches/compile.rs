use criterion::{black_box, criterion_group, criterion_main, Criterion};
use criterion::{BenchmarkId, Throughput};
use glam::Vec3;
use hermes_rt::ir::{Expr, ShaderBuilder, SystemValue, TraceRay, VarType};
use hermes_rt::{compile, Config, PipelineDesc, ShaderGroup, StageKind};

mod benches {
    use super::*;

    /// Ray generation stage tracing `traces` rays in sequence, followed by
    /// `callables` callable stages that each invoke the next one.
    pub fn pipeline(traces: u32, callables: usize) -> PipelineDesc {
        let mut raygen = ShaderBuilder::new(StageKind::RayGen, "raygen");
        let payload = raygen.scratch(16);
        let sum = raygen.let_(VarType::U32, 0u32);
        for i in 0..traces {
            raygen.trace_ray(TraceRay::new(
                0u64,
                Vec3::new(i as f32, 0., 0.),
                Vec3::Z,
                payload,
            ));
            raygen.assign(
                sum,
                Expr::local(sum).add(Expr::LoadFrame(VarType::U32, payload)),
            );
        }
        if callables > 0 {
            raygen.execute_callable(0u32, payload);
        }
        raygen.store_global(0u64, sum);

        let mut miss = ShaderBuilder::new(StageKind::Miss, "miss");
        miss.store_payload(0, SystemValue::LaunchId(0));

        let mut stages = vec![raygen.build(), miss.build()];
        let mut groups = vec![
            ShaderGroup::General { stage: 0 },
            ShaderGroup::General { stage: 1 },
        ];
        for i in 0..callables {
            let mut callable = ShaderBuilder::new(StageKind::Callable, format!("callable{i}"));
            let p = callable.scratch(4);
            callable.store_frame(p, Expr::LoadPayload(VarType::U32, 0).add(1u32));
            if i + 1 < callables {
                callable.execute_callable(i as u32 + 1, p);
            }
            callable.store_payload(0, Expr::LoadFrame(VarType::U32, p));
            groups.push(ShaderGroup::General {
                stage: stages.len(),
            });
            stages.push(callable.build());
        }

        PipelineDesc {
            stages,
            groups,
            max_recursion_depth: 1,
        }
    }
}

pub fn traces(c: &mut Criterion) {
    let config = Config::default();
    let mut group = c.benchmark_group("compile_traces");
    for n in [1u32, 4, 16, 64] {
        let desc = benches::pipeline(n, 0);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &desc, |b, desc| {
            b.iter(|| black_box(compile(desc, &config).unwrap()))
        });
    }
    group.finish();
}

pub fn callables(c: &mut Criterion) {
    let config = Config::default();
    let mut group = c.benchmark_group("compile_callables");
    for n in [1usize, 8, 32] {
        let desc = benches::pipeline(1, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &desc, |b, desc| {
            b.iter(|| black_box(compile(desc, &config).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, traces, callables);
criterion_main!(benches);
