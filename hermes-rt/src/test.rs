use std::f32::consts::TAU;
use std::ops::ControlFlow;

use approx::assert_abs_diff_eq;
use glam::{Affine3A, Vec3};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rstest::{fixture, rstest};

use crate::accel::{self, Accel, BuildNode, InstanceDesc};
use crate::intersect::{intersect_box4, intersect_triangle};
use crate::memory::GlobalMemory;
use crate::node::{addr_to_node, Node, INVALID_NODE, ROOT_NODE};
use crate::policy::{trace_closest, ClosestHit, Hit, HitType, RayFlags};
use crate::query::{IntersectionType, QueryValue, RayQuery};
use crate::stack::{ScratchStack, TraversalStack};
use crate::traversal::{
    traverse, CandidateHandler, LeafIntersection, TraversalArgs, TraversalCursor,
    TriangleIntersection,
};

static DEBUG: Lazy<()> = Lazy::new(|| {
    pretty_env_logger::try_init().ok();
});

#[fixture]
#[once]
fn debug() {
    let _ = *DEBUG;
}

/// Triangle covering `[-1, 3]` in x and y around `center`, in the plane
/// `z = center.z`.
pub(crate) fn quad_triangle(center: Vec3, primitive_id: u32, opaque: bool) -> BuildNode {
    BuildNode::Triangle {
        vertices: [
            center + Vec3::new(-1., -1., 0.),
            center + Vec3::new(3., -1., 0.),
            center + Vec3::new(-1., 3., 0.),
        ],
        primitive_id,
        geometry_id: 0,
        opaque,
    }
}

fn args(accel: Option<&Accel>, origin: Vec3, dir: Vec3) -> TraversalArgs {
    let root_bvh_base = accel.map(|accel| addr_to_node(accel.bvh_addr)).unwrap_or(0);
    TraversalArgs {
        root_bvh_base,
        flags: RayFlags::empty(),
        cull_mask: 0xff,
        origin,
        tmin: 0.,
        dir,
    }
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(4)]
#[case(5)]
#[case(6)]
#[case(7)]
fn watertight_fan(_debug: (), #[case] spoke: u32) {
    let center = Vec3::new(0., 0., 1.);
    let rim = |k: u32| {
        let phi = TAU * k as f32 / 8.;
        Vec3::new(phi.cos(), phi.sin(), 1.)
    };
    let leaves = (0..8)
        .map(|k| BuildNode::triangle([center, rim(k), rim((k + 1) % 8)], k))
        .collect();

    let mut mem = GlobalMemory::new();
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();

    // Rays through the shared vertex and along a shared edge never slip
    // between neighbouring triangles.
    let through_center = args(Some(&accel), Vec3::ZERO, Vec3::Z);
    let hit = trace_closest(&mut mem, &through_center, f32::INFINITY).unwrap();
    assert_abs_diff_eq!(hit.t, 1., epsilon = 1e-6);

    let on_edge = center.lerp(rim(spoke), 0.5);
    let along_edge = args(Some(&accel), Vec3::ZERO, on_edge);
    let hit = trace_closest(&mut mem, &along_edge, f32::INFINITY).unwrap();
    assert_abs_diff_eq!(hit.t, 1., epsilon = 1e-5);
    let (prev, next) = ((spoke + 7) % 8, spoke);
    assert!(hit.primitive_id == prev || hit.primitive_id == next);
}

#[rstest]
fn fan_has_no_cracks(_debug: ()) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let center = Vec3::new(0.2, -0.1, 1.);
    let rim = |k: u32| {
        let phi = TAU * k as f32 / 8.;
        center + Vec3::new(phi.cos(), phi.sin(), 0.3 * phi.sin())
    };
    let fan = (0..8)
        .map(|k| [center, rim(k), rim((k + 1) % 8)])
        .collect::<Vec<_>>();

    // Every ray through a shared edge hits at least one of the two
    // triangles next to it.
    for _ in 0..4096 {
        let spoke = rng.gen_range(0..8);
        let target = center.lerp(rim(spoke), rng.gen_range(0f32..1.));
        let origin = Vec3::new(
            rng.gen_range(-1f32..1.),
            rng.gen_range(-1f32..1.),
            rng.gen_range(-2f32..0.),
        );
        let dir = target - origin;
        let hits = fan
            .iter()
            .filter(|vertices| intersect_triangle(vertices, origin, dir).x.is_finite())
            .count();
        assert!(
            hits >= 1,
            "Ray from {origin} towards {target} passed between the triangles of spoke {spoke}"
        );
    }
}

#[rstest]
fn null_accel(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let args = args(None, Vec3::ZERO, Vec3::Z);
    assert_eq!(trace_closest(&mut mem, &args, f32::INFINITY), None);

    let mut query = RayQuery::default();
    query.initialize(
        &mem,
        0,
        RayFlags::empty(),
        0xff,
        Vec3::ZERO,
        0.,
        Vec3::Z,
        f32::INFINITY,
    );
    assert!(!query.proceed(&mut mem));
    assert_eq!(
        query.load(&mem, QueryValue::Type, true).as_u32(),
        Some(IntersectionType::None as u32)
    );
}

#[rstest]
fn closest_of_two_leaves(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let leaves = vec![
        quad_triangle(Vec3::new(0., 0., 2.), 0, true),
        quad_triangle(Vec3::new(0., 0., 1.), 1, true),
    ];
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();

    let hit = trace_closest(&mut mem, &args(Some(&accel), Vec3::ZERO, Vec3::Z), 100.).unwrap();
    assert_eq!(hit.ty, HitType::Triangle);
    assert_eq!(hit.primitive_id, 1);
    assert_abs_diff_eq!(hit.t, 1., epsilon = 1e-6);
    assert_abs_diff_eq!(hit.barycentrics.x, 0.25, epsilon = 1e-6);
    assert_abs_diff_eq!(hit.barycentrics.y, 0.25, epsilon = 1e-6);

    // The far leaf is found once the near one is out of range.
    let hit = trace_closest(
        &mut mem,
        &TraversalArgs {
            tmin: 1.5,
            ..args(Some(&accel), Vec3::ZERO, Vec3::Z)
        },
        100.,
    )
    .unwrap();
    assert_eq!(hit.primitive_id, 0);
    assert_abs_diff_eq!(hit.t, 2., epsilon = 1e-6);

    assert_eq!(
        trace_closest(&mut mem, &args(Some(&accel), Vec3::ZERO, Vec3::Z), 0.5),
        None
    );
    assert_eq!(
        trace_closest(
            &mut mem,
            &args(Some(&accel), Vec3::new(10., 0., 0.), Vec3::Z),
            100.
        ),
        None
    );
}

/// Records the triangle candidates in the order traversal reports them.
struct VisitLog {
    tmax: f32,
    /// Node, primitive id, distance and stack pointer of each candidate.
    visits: Vec<(u32, u32, f32, i32)>,
}

impl CandidateHandler for VisitLog {
    fn tmax(&self) -> f32 {
        self.tmax
    }
    fn triangle(
        &mut self,
        _mem: &mut GlobalMemory,
        candidate: &TriangleIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        self.visits.push((
            cursor.previous_node,
            candidate.base.primitive_id,
            candidate.t,
            cursor.stack,
        ));
        self.tmax = self.tmax.min(candidate.t);
        ControlFlow::Continue(())
    }
    fn aabb(
        &mut self,
        _mem: &mut GlobalMemory,
        _candidate: &LeafIntersection,
        _cursor: &TraversalCursor,
    ) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

#[rstest]
fn backtracks_past_empty_near_leaf(_debug: ()) {
    let mut mem = GlobalMemory::new();
    // Both leaves span the unit square in x and y but cover opposite halves
    // of its diagonal, so the ray enters the near box without hitting its
    // triangle. The far triangle lies in the plane z = 3 + x / 2.
    let far = [
        Vec3::new(1., 1., 3.5),
        Vec3::new(0., 1., 3.),
        Vec3::new(1., 0., 3.5),
    ];
    let near = [
        Vec3::new(0., 0., 1.),
        Vec3::new(1., 0., 1.),
        Vec3::new(0., 1., 1.),
    ];
    let leaves = vec![BuildNode::triangle(far, 7), BuildNode::triangle(near, 3)];
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();

    let origin = Vec3::new(0.6, 0.6, 0.);
    let args = args(Some(&accel), origin, Vec3::Z);

    // The near child is entered first although it is stored second.
    let Node::Box32(root) = Node::decode(&mem, args.root_bvh_base, ROOT_NODE) else {
        panic!("Expected a box at the root");
    };
    let (far_node, near_node) = (root.children[0], root.children[1]);
    let order = intersect_box4(
        root.children,
        &root.coords,
        origin,
        Vec3::Z.recip(),
        f32::INFINITY,
    );
    assert_eq!(order.children, [near_node, far_node, INVALID_NODE, INVALID_NODE]);
    assert_abs_diff_eq!(order.distances[0], 1., epsilon = 1e-6);
    assert_abs_diff_eq!(order.distances[1], 3., epsilon = 1e-6);

    let mut log = VisitLog {
        tmax: f32::INFINITY,
        visits: vec![],
    };
    let mut stack = ScratchStack::default();
    let mut cursor = TraversalCursor::new(&args, &stack);
    assert!(!traverse(&mut mem, &args, &mut cursor, &mut stack, &mut log));

    // The far leaf is the only candidate and was popped off the stack after
    // the near leaf came up empty.
    assert_eq!(log.visits.len(), 1);
    let (node, primitive_id, t, sp) = log.visits[0];
    assert_eq!(node, far_node);
    assert_eq!(primitive_id, 7);
    assert_eq!(sp, stack.base());

    let normal = (far[1] - far[0]).cross(far[2] - far[0]);
    let expected = normal.dot(far[0] - origin) / normal.dot(Vec3::Z);
    assert_abs_diff_eq!(expected, 3.3, epsilon = 1e-6);
    assert_abs_diff_eq!(t, expected, epsilon = 1e-5);

    let hit = trace_closest(&mut mem, &args, f32::INFINITY).unwrap();
    assert_eq!(hit.primitive_id, 7);
    assert_abs_diff_eq!(hit.t, expected, epsilon = 1e-5);
}

#[rstest]
fn committed_distance_decreases(_debug: ()) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let depths = (0..24).map(|_| rng.gen_range(1f32..20.)).collect::<Vec<_>>();
    let leaves = depths
        .iter()
        .enumerate()
        .map(|(i, &z)| quad_triangle(Vec3::new(0., 0., z), i as u32, false))
        .collect();

    let mut mem = GlobalMemory::new();
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();
    let args = args(Some(&accel), Vec3::ZERO, Vec3::Z);

    let mut accepted = vec![];
    let mut handler = ClosestHit::new(args.flags, 0., f32::INFINITY, |hit: &Hit| {
        accepted.push(hit.t);
        true
    });
    let mut stack = ScratchStack::default();
    let mut cursor = TraversalCursor::new(&args, &stack);
    assert!(!traverse(&mut mem, &args, &mut cursor, &mut stack, &mut handler));
    let hit = handler.hit.unwrap();

    assert!(accepted.windows(2).all(|w| w[1] < w[0]), "{accepted:?}");
    let nearest = depths.iter().copied().fold(f32::INFINITY, f32::min);
    assert_abs_diff_eq!(hit.t, nearest, epsilon = 1e-5);
    assert_abs_diff_eq!(*accepted.last().unwrap(), nearest, epsilon = 1e-5);
}

#[rstest]
#[case(RayFlags::empty(), 0, 1.)]
#[case(RayFlags::TERMINATE_ON_FIRST_HIT, 1, 1.5)]
fn terminate_on_first_hit(
    _debug: (),
    #[case] flags: RayFlags,
    #[case] primitive_id: u32,
    #[case] t: f32,
) {
    let mut mem = GlobalMemory::new();
    // The tilted triangle's box is entered first although its hit is
    // behind the flat one.
    let leaves = vec![
        quad_triangle(Vec3::new(0., 0., 1.), 0, true),
        BuildNode::triangle(
            [
                Vec3::new(-1., -1., 0.5),
                Vec3::new(3., -1., 0.5),
                Vec3::new(-1., 3., 4.5),
            ],
            1,
        ),
    ];
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();
    let args = TraversalArgs {
        flags,
        ..args(Some(&accel), Vec3::ZERO, Vec3::Z)
    };

    let hit = trace_closest(&mut mem, &args, f32::INFINITY).unwrap();
    assert_eq!(hit.primitive_id, primitive_id);
    assert_abs_diff_eq!(hit.t, t, epsilon = 1e-5);

    // Only the first-hit flag leaves the traversal incomplete.
    let mut handler = ClosestHit::new(flags, 0., f32::INFINITY, |_: &Hit| true);
    let mut stack = ScratchStack::default();
    let mut cursor = TraversalCursor::new(&args, &stack);
    let incomplete = traverse(&mut mem, &args, &mut cursor, &mut stack, &mut handler);
    assert_eq!(incomplete, flags.contains(RayFlags::TERMINATE_ON_FIRST_HIT));
    assert_eq!(handler.hit, Some(hit));
}

#[rstest]
fn instanced_triangle(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let blas = accel::write(
        &mut mem,
        &BuildNode::triangle(
            [
                Vec3::new(-1., -1., 1.),
                Vec3::new(3., -1., 1.),
                Vec3::new(-1., 3., 1.),
            ],
            4,
        ),
    )
    .unwrap();
    let mut desc = InstanceDesc::new(blas, Affine3A::from_translation(Vec3::new(0., 0., 5.)));
    desc.custom_index = 9;
    desc.instance_id = 3;
    let tlas = accel::write(&mut mem, &BuildNode::tree(vec![BuildNode::instance(desc)])).unwrap();

    let args = args(Some(&tlas), Vec3::ZERO, Vec3::Z);
    let hit = trace_closest(&mut mem, &args, f32::INFINITY).unwrap();
    assert_eq!(hit.primitive_id, 4);
    assert_ne!(hit.instance_addr, 0);
    assert_abs_diff_eq!(hit.t, 6., epsilon = 1e-5);

    // Same ray through a query, which also exposes the instance fields.
    let mut query = RayQuery::default();
    query.initialize(
        &mem,
        tlas.addr,
        RayFlags::empty(),
        0xff,
        Vec3::ZERO,
        0.,
        Vec3::Z,
        f32::INFINITY,
    );
    assert!(!query.proceed(&mut mem));
    assert_eq!(query.load(&mem, QueryValue::InstanceCustomIndex, true).as_u32(), Some(9));
    assert_eq!(query.load(&mem, QueryValue::InstanceId, true).as_u32(), Some(3));
    let object_origin = query
        .load(&mem, QueryValue::ObjectRayOrigin, true)
        .as_vec3()
        .unwrap();
    assert_abs_diff_eq!(object_origin.z, -5., epsilon = 1e-5);
}

#[rstest]
fn instance_mask_culls(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let blas = accel::write(&mut mem, &quad_triangle(Vec3::new(0., 0., 1.), 0, true)).unwrap();
    let mut desc = InstanceDesc::new(blas, Affine3A::IDENTITY);
    desc.mask = 0x0f;
    let tlas = accel::write(&mut mem, &BuildNode::instance(desc)).unwrap();

    let visible = TraversalArgs {
        cull_mask: 0x01,
        ..args(Some(&tlas), Vec3::ZERO, Vec3::Z)
    };
    assert!(trace_closest(&mut mem, &visible, f32::INFINITY).is_some());
    let culled = TraversalArgs {
        cull_mask: 0xf0,
        ..visible
    };
    assert!(trace_closest(&mut mem, &culled, f32::INFINITY).is_none());
}

#[rstest]
fn half_precision_boxes(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let root = BuildNode::Box(vec![
        BuildNode::Box16(vec![
            quad_triangle(Vec3::new(0., 0., 3.), 0, true),
            quad_triangle(Vec3::new(0., 0., 1.25), 1, true),
        ]),
        quad_triangle(Vec3::new(0., 0., 2.), 2, true),
    ]);
    let accel = accel::write(&mut mem, &root).unwrap();

    let hit = trace_closest(&mut mem, &args(Some(&accel), Vec3::ZERO, Vec3::Z), 100.).unwrap();
    assert_eq!(hit.primitive_id, 1);
    assert_abs_diff_eq!(hit.t, 1.25, epsilon = 1e-6);
}

#[rstest]
fn procedural_leaf_slab(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let accel = accel::write(
        &mut mem,
        &BuildNode::aabb(Vec3::new(-1., -1., 2.), Vec3::new(1., 1., 4.), 5),
    )
    .unwrap();
    let hit = trace_closest(&mut mem, &args(Some(&accel), Vec3::ZERO, Vec3::Z), 100.).unwrap();
    assert_eq!(hit.ty, HitType::Aabb);
    assert_eq!(hit.primitive_id, 5);
    assert_abs_diff_eq!(hit.t, 2., epsilon = 1e-6);
}

#[rstest]
fn query_confirms_non_opaque(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let leaves = vec![
        quad_triangle(Vec3::new(0., 0., 2.), 0, true),
        quad_triangle(Vec3::new(0., 0., 1.), 1, false),
    ];
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();

    let mut query = RayQuery::default();
    query.initialize(
        &mem,
        accel.addr,
        RayFlags::empty(),
        0xff,
        Vec3::ZERO,
        0.,
        Vec3::Z,
        f32::INFINITY,
    );

    assert!(query.proceed(&mut mem));
    // Candidate types count from zero, committed ones from one.
    assert_eq!(query.load(&mem, QueryValue::Type, false).as_u32(), Some(0));
    assert_eq!(query.load(&mem, QueryValue::PrimitiveIndex, false).as_u32(), Some(1));
    query.confirm();

    assert!(!query.proceed(&mut mem));
    assert_eq!(query.load(&mem, QueryValue::Type, true).as_u32(), Some(1));
    assert_eq!(query.load(&mem, QueryValue::PrimitiveIndex, true).as_u32(), Some(1));
    assert_eq!(query.load(&mem, QueryValue::T, true).as_f32(), Some(1.));
}

#[rstest]
fn query_skips_rejected_candidate(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let leaves = vec![
        quad_triangle(Vec3::new(0., 0., 2.), 0, true),
        quad_triangle(Vec3::new(0., 0., 1.), 1, false),
    ];
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();

    let mut query = RayQuery::default();
    query.initialize(
        &mem,
        accel.addr,
        RayFlags::empty(),
        0xff,
        Vec3::ZERO,
        0.,
        Vec3::Z,
        f32::INFINITY,
    );
    let mut candidates = 0;
    while query.proceed(&mut mem) {
        candidates += 1;
    }
    assert_eq!(candidates, 1);
    assert_eq!(query.load(&mem, QueryValue::PrimitiveIndex, true).as_u32(), Some(0));
    assert_eq!(query.load(&mem, QueryValue::T, true).as_f32(), Some(2.));
}

#[rstest]
fn query_terminate_stops_traversal(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let leaves = vec![
        quad_triangle(Vec3::new(0., 0., 2.), 0, false),
        quad_triangle(Vec3::new(0., 0., 1.), 1, false),
    ];
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();

    let mut query = RayQuery::default();
    query.initialize(
        &mem,
        accel.addr,
        RayFlags::empty(),
        0xff,
        Vec3::ZERO,
        0.,
        Vec3::Z,
        100.,
    );
    assert!(query.proceed(&mut mem));
    query.terminate();

    assert!(!query.proceed(&mut mem));
    assert_eq!(query.load(&mem, QueryValue::Type, true).as_u32(), Some(0));
    assert_eq!(query.load(&mem, QueryValue::T, true).as_f32(), Some(100.));
}

#[rstest]
fn query_generates_procedural_hit(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let accel = accel::write(
        &mut mem,
        &BuildNode::Aabb {
            min: Vec3::new(-1., -1., 2.),
            max: Vec3::new(1., 1., 4.),
            primitive_id: 3,
            geometry_id: 0,
            opaque: false,
        },
    )
    .unwrap();

    let mut query = RayQuery::default();
    query.initialize(
        &mem,
        accel.addr,
        RayFlags::empty(),
        0xff,
        Vec3::ZERO,
        0.,
        Vec3::Z,
        10.,
    );
    assert!(query.proceed(&mut mem));
    assert_eq!(query.load(&mem, QueryValue::Type, false).as_u32(), Some(1));
    assert_eq!(
        query.load(&mem, QueryValue::CandidateAabbOpaque, false).as_bool(),
        Some(false)
    );
    // Out of range distances are ignored.
    query.generate(11.);
    assert_eq!(query.load(&mem, QueryValue::Type, true).as_u32(), Some(0));
    query.generate(3.);
    assert!(!query.proceed(&mut mem));
    assert_eq!(query.load(&mem, QueryValue::Type, true).as_u32(), Some(2));
    assert_eq!(query.load(&mem, QueryValue::T, true).as_f32(), Some(3.));
}

#[rstest]
fn suspended_traversal_resumes(_debug: ()) {
    let mut mem = GlobalMemory::new();
    let leaves = (0..16)
        .map(|i| quad_triangle(Vec3::new(0., 0., 1. + i as f32), i, false))
        .collect();
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();
    let args = args(Some(&accel), Vec3::ZERO, Vec3::Z);

    // Suspending on every candidate and resuming from the cursor reaches the
    // same result as an uninterrupted traversal.
    struct Stepper(f32, u32);
    impl CandidateHandler for Stepper {
        fn tmax(&self) -> f32 {
            self.0
        }
        fn triangle(
            &mut self,
            _mem: &mut GlobalMemory,
            candidate: &TriangleIntersection,
            _cursor: &TraversalCursor,
        ) -> ControlFlow<()> {
            self.0 = candidate.t;
            self.1 = candidate.base.primitive_id;
            ControlFlow::Break(())
        }
        fn aabb(
            &mut self,
            _mem: &mut GlobalMemory,
            _candidate: &LeafIntersection,
            _cursor: &TraversalCursor,
        ) -> ControlFlow<()> {
            ControlFlow::Continue(())
        }
    }

    let mut handler = Stepper(f32::INFINITY, u32::MAX);
    let mut stack = ScratchStack::default();
    let mut cursor = TraversalCursor::new(&args, &stack);
    let mut steps = 0;
    while traverse(&mut mem, &args, &mut cursor, &mut stack, &mut handler) {
        steps += 1;
        assert!(steps <= 16);
    }
    assert_eq!(handler.1, 0);
    assert_abs_diff_eq!(handler.0, 1., epsilon = 1e-6);
}

#[rstest]
fn query_on_short_stack_matches_host_trace(_debug: ()) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let leaves = (0..40)
        .map(|i| {
            let center = Vec3::new(
                rng.gen_range(-2f32..2.),
                rng.gen_range(-2f32..2.),
                rng.gen_range(0f32..5.),
            );
            let mut vertex = || {
                center
                    + Vec3::new(
                        rng.gen_range(-1f32..1.),
                        rng.gen_range(-1f32..1.),
                        rng.gen_range(-1f32..1.),
                    )
            };
            BuildNode::triangle([vertex(), vertex(), vertex()], i)
        })
        .collect();
    let mut mem = GlobalMemory::new();
    let accel = accel::write(&mut mem, &BuildNode::tree(leaves)).unwrap();

    // Two entries force the traversal back onto parent links.
    let mut query = RayQuery::with_stack(ScratchStack::new(2));
    for _ in 0..64 {
        let origin = Vec3::new(rng.gen_range(-2f32..2.), rng.gen_range(-2f32..2.), -1.);
        query.initialize(
            &mem,
            accel.addr,
            RayFlags::empty(),
            0xff,
            origin,
            0.,
            Vec3::Z,
            f32::INFINITY,
        );
        while query.proceed(&mut mem) {
            query.confirm();
        }

        let host = trace_closest(&mut mem, &args(Some(&accel), origin, Vec3::Z), f32::INFINITY);
        match host {
            Some(hit) => {
                assert_eq!(query.closest.ty, IntersectionType::Triangle);
                assert_eq!(query.closest.primitive_id, hit.primitive_id);
                assert_abs_diff_eq!(query.closest.t, hit.t, epsilon = 1e-6);
            }
            None => assert_eq!(query.closest.ty, IntersectionType::None),
        }
    }
}
