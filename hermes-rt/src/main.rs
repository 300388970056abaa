use glam::{Affine3A, Vec3};
use hermes_rt::accel::{self, BuildNode, InstanceDesc};
use hermes_rt::ir::{Expr, ShaderBuilder, SystemValue, TraceRay, VarType};
use hermes_rt::{compile, Config, Machine, PipelineDesc, SbtWriter, ShaderGroup, StageKind};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 24;

fn main() -> anyhow::Result<()> {
    pretty_env_logger::try_init().ok();

    let mut machine = Machine::new(Config::default());

    let floor = accel::write(
        &mut machine.memory,
        &BuildNode::tree(vec![
            BuildNode::triangle(
                [
                    Vec3::new(-4., -1., 0.),
                    Vec3::new(4., -1., 0.),
                    Vec3::new(4., -1., 12.),
                ],
                0,
            ),
            BuildNode::triangle(
                [
                    Vec3::new(-4., -1., 0.),
                    Vec3::new(4., -1., 12.),
                    Vec3::new(-4., -1., 12.),
                ],
                1,
            ),
        ]),
    )?;
    let sphere = accel::write(
        &mut machine.memory,
        &BuildNode::aabb(Vec3::splat(-1.), Vec3::splat(1.), 0),
    )?;

    let mut sphere_instance = InstanceDesc::new(sphere, Affine3A::from_translation(Vec3::new(0., 0., 6.)));
    sphere_instance.sbt_offset = 1;
    let scene = accel::write(
        &mut machine.memory,
        &BuildNode::tree(vec![
            BuildNode::instance(InstanceDesc::new(floor, Affine3A::IDENTITY)),
            BuildNode::instance(sphere_instance),
        ]),
    )?;

    let out = machine
        .memory
        .alloc(WIDTH as u64 * HEIGHT as u64 * 4, 64)?;

    let mut raygen = ShaderBuilder::new(StageKind::RayGen, "raygen");
    let payload = raygen.scratch(4);
    let x = Expr::sys(SystemValue::LaunchId(0));
    let y = Expr::sys(SystemValue::LaunchId(1));
    let u = x.clone().to_f32().div(WIDTH as f32).sub(0.5f32).mul(2f32);
    let v = Expr::lit(0.5f32).sub(y.clone().to_f32().div(HEIGHT as f32)).mul(1.2f32);
    raygen.trace_ray(TraceRay::new(
        scene.addr,
        Vec3::new(0., 0.5, 0.),
        Expr::vec3(u, v, 1f32).normalize(),
        payload,
    ));
    raygen.store_global(
        Expr::lit(out).add(x.add(y.mul(WIDTH)).mul(4u32)),
        Expr::LoadFrame(VarType::F32, payload),
    );

    let mut miss = ShaderBuilder::new(StageKind::Miss, "miss");
    miss.store_payload(0, -1f32);

    let mut chit = ShaderBuilder::new(StageKind::ClosestHit, "chit");
    chit.store_payload(0, SystemValue::HitT);

    // Unit sphere in object space.
    let mut isec = ShaderBuilder::new(StageKind::Intersection, "sphere");
    let o = isec.let_(VarType::Vec3, SystemValue::ObjectRayOrigin);
    let d = isec.let_(VarType::Vec3, SystemValue::ObjectRayDirection);
    let b = isec.let_(VarType::F32, Expr::local(o).dot(d));
    let c = isec.let_(VarType::F32, Expr::local(o).dot(o).sub(1f32));
    let disc = isec.let_(
        VarType::F32,
        Expr::local(b).mul(b).sub(Expr::local(d).dot(d).mul(c)),
    );
    isec.if_(Expr::local(disc).ge(0f32), |isec| {
        let t = Expr::local(b)
            .neg()
            .sub(Expr::local(disc).sqrt())
            .div(Expr::local(d).dot(d));
        isec.report_intersection(t, 0u32);
    });

    let desc = PipelineDesc {
        stages: vec![raygen.build(), miss.build(), chit.build(), isec.build()],
        groups: vec![
            ShaderGroup::General { stage: 0 },
            ShaderGroup::General { stage: 1 },
            ShaderGroup::Triangles {
                closest_hit: Some(2),
                any_hit: None,
            },
            ShaderGroup::Procedural {
                closest_hit: Some(2),
                any_hit: None,
                intersection: 3,
            },
        ],
        max_recursion_depth: 1,
    };
    let pipeline = compile(&desc, &machine.config)?;
    log::info!("Compiled pipeline with a stack size of {} bytes", pipeline.stack_size());

    let sbt = SbtWriter::new(&pipeline)
        .raygen(0)
        .miss(Some(1))
        .hit(Some(2))
        .hit(Some(3))
        .write(&mut machine.memory)?;

    let report = machine.launch(&pipeline, &sbt, [WIDTH, HEIGHT, 1])?;
    log::info!("{report:?}");

    let depth = machine
        .memory
        .read_slice::<f32>(out, (WIDTH * HEIGHT) as usize);
    let ramp = b"@%#*+=-:. ";
    for row in depth.chunks(WIDTH as usize) {
        let line = row
            .iter()
            .map(|&t| {
                if t < 0. {
                    ' '
                } else {
                    let i = ((t / 14.) * (ramp.len() - 1) as f32) as usize;
                    ramp[i.min(ramp.len() - 2)] as char
                }
            })
            .collect::<String>();
        println!("{line}");
    }

    Ok(())
}
