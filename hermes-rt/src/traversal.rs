use std::ops::ControlFlow;

use glam::{Vec2, Vec3};

use crate::intersect::{intersect_box4, intersect_triangle};
use crate::memory::GlobalMemory;
use crate::node::{
    fetch_parent, global_node_addr, node_to_addr, Node, INVALID_NODE,
    NO_INSTANCE_ROOT, ROOT_NODE,
};
use crate::policy::{
    hit_is_opaque, is_frontface, opacity_not_culled, triangle_not_culled, RayFlags,
    NO_INSTANCE_FLAGS,
};
use crate::stack::TraversalStack;

///
/// Ray state fixed for one traversal, in world space.
///
#[derive(Clone, Copy, Debug)]
pub struct TraversalArgs {
    /// Node-form address of the top level hierarchy; zero for a null
    /// acceleration structure.
    pub root_bvh_base: u64,
    pub flags: RayFlags,
    pub cull_mask: u32,
    pub origin: Vec3,
    pub tmin: f32,
    pub dir: Vec3,
}

///
/// Resumable traversal state of one lane.
///
#[derive(Clone, Copy, Debug)]
pub struct TraversalCursor {
    pub bvh_base: u64,
    pub origin: Vec3,
    pub dir: Vec3,
    pub inv_dir: Vec3,
    pub stack: i32,
    pub low_watermark: i32,
    /// Stack pointer at which the current instance was entered, -1 if none.
    pub top_stack: i32,
    pub current_node: u32,
    pub previous_node: u32,
    pub instance_top_node: u32,
    pub instance_bottom_node: u32,
    pub instance_addr: u64,
    pub sbt_offset_and_flags: u32,
}

impl TraversalCursor {
    pub fn new(args: &TraversalArgs, stack: &impl TraversalStack) -> Self {
        Self {
            bvh_base: args.root_bvh_base,
            origin: args.origin,
            dir: args.dir,
            inv_dir: args.dir.recip(),
            stack: stack.base(),
            low_watermark: stack.base(),
            top_stack: -1,
            current_node: ROOT_NODE,
            previous_node: INVALID_NODE,
            instance_top_node: INVALID_NODE,
            instance_bottom_node: NO_INSTANCE_ROOT,
            instance_addr: 0,
            sbt_offset_and_flags: NO_INSTANCE_FLAGS,
        }
    }

    fn leave_instance(&mut self, args: &TraversalArgs) {
        self.top_stack = -1;
        self.previous_node = self.instance_top_node;
        self.instance_bottom_node = NO_INSTANCE_ROOT;
        self.bvh_base = args.root_bvh_base;
        self.origin = args.origin;
        self.dir = args.dir;
        self.inv_dir = args.dir.recip();
        self.instance_addr = 0;
        self.sbt_offset_and_flags = NO_INSTANCE_FLAGS;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LeafIntersection {
    pub node_addr: u64,
    pub primitive_id: u32,
    pub geometry_id_and_flags: u32,
    pub opaque: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TriangleIntersection {
    pub base: LeafIntersection,
    pub t: f32,
    pub frontface: bool,
    pub barycentrics: Vec2,
}

///
/// Receives candidate hits found by [`traverse`].
/// Returning `Break` suspends the traversal, which can later be resumed
/// from the cursor.
///
pub trait CandidateHandler {
    /// Current committed distance, used to prune boxes and triangles.
    fn tmax(&self) -> f32;
    fn triangle(
        &mut self,
        mem: &mut GlobalMemory,
        candidate: &TriangleIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()>;
    fn aabb(
        &mut self,
        mem: &mut GlobalMemory,
        candidate: &LeafIntersection,
        cursor: &TraversalCursor,
    ) -> ControlFlow<()>;
}

///
/// Walks the hierarchy from the cursor until it is exhausted or a handler
/// breaks.
/// Returns whether the traversal is still incomplete, i.e. `true` after a
/// break and `false` once every node has been visited.
///
pub fn traverse(
    mem: &mut GlobalMemory,
    args: &TraversalArgs,
    cursor: &mut TraversalCursor,
    stack: &mut impl TraversalStack,
    handler: &mut impl CandidateHandler,
) -> bool {
    if args.root_bvh_base == 0 {
        return false;
    }
    let stride = stack.stride();
    let capacity = stack.capacity();

    loop {
        if cursor.current_node == INVALID_NODE {
            if cursor.stack < stride {
                return false;
            }

            if cursor.top_stack >= cursor.stack
                || cursor.previous_node == cursor.instance_bottom_node
            {
                cursor.leave_instance(args);
            }

            if cursor.low_watermark >= cursor.stack {
                let bvh_addr = node_to_addr(cursor.bvh_base);
                let parent = fetch_parent(mem, bvh_addr, cursor.previous_node);
                if parent == INVALID_NODE {
                    return false;
                }
                cursor.current_node = parent;
            } else {
                cursor.stack -= stride;
                cursor.current_node = stack.load(cursor.stack);
                cursor.previous_node = INVALID_NODE;
            }
        } else {
            cursor.previous_node = INVALID_NODE;
        }

        let node = cursor.current_node;
        let prev = cursor.previous_node;
        cursor.previous_node = node;
        cursor.current_node = INVALID_NODE;

        log::trace!("Visiting node {node:#x} from {prev:#x}");

        match Node::decode(mem, cursor.bvh_base, node) {
            Node::Box32(b) => {
                let tmax = handler.tmax();
                visit_box(cursor, stack, capacity, tmax, prev, b.children, &b.coords)
            }
            Node::Box16(b) => {
                let tmax = handler.tmax();
                visit_box(cursor, stack, capacity, tmax, prev, b.children, &b.coords_f32())
            }
            Node::Instance(instance) => {
                let mask = instance.custom_instance_and_mask >> 24;
                if mask & args.cull_mask == 0 {
                    continue;
                }
                cursor.top_stack = cursor.stack;
                cursor.bvh_base = instance.base_ptr;
                cursor.current_node = ROOT_NODE;
                cursor.instance_bottom_node = ROOT_NODE;
                cursor.instance_top_node = node;

                cursor.origin = instance.wto_matrix.transform_point(args.origin);
                cursor.dir = instance.wto_matrix.transform_vector(args.dir);
                cursor.inv_dir = cursor.dir.recip();

                cursor.sbt_offset_and_flags = instance.sbt_offset_and_flags;
                cursor.instance_addr = global_node_addr(args.root_bvh_base, node);
            }
            Node::Triangle(tri) => {
                let vertices = tri.coords.map(Vec3::from_array);
                let result = intersect_triangle(&vertices, cursor.origin, cursor.dir);
                let det = result.y;
                let t = result.x / det;
                if !(t < handler.tmax()) {
                    continue;
                }
                let frontface = is_frontface(det, cursor.sbt_offset_and_flags);
                let not_cull =
                    triangle_not_culled(frontface, args.flags, cursor.sbt_offset_and_flags);
                if !(args.tmin < t && not_cull) {
                    continue;
                }
                let opaque = hit_is_opaque(
                    cursor.sbt_offset_and_flags,
                    args.flags,
                    tri.geometry_id_and_flags,
                );
                if !opacity_not_culled(opaque, args.flags) {
                    continue;
                }
                let candidate = TriangleIntersection {
                    base: LeafIntersection {
                        node_addr: global_node_addr(cursor.bvh_base, node),
                        primitive_id: tri.triangle_id,
                        geometry_id_and_flags: tri.geometry_id_and_flags,
                        opaque,
                    },
                    t,
                    frontface,
                    barycentrics: Vec2::new(result.z, result.w) / det,
                };
                if handler.triangle(mem, &candidate, cursor).is_break() {
                    return true;
                }
            }
            Node::Aabb(aabb) => {
                let opaque = hit_is_opaque(
                    cursor.sbt_offset_and_flags,
                    args.flags,
                    aabb.geometry_id_and_flags,
                );
                if !opacity_not_culled(opaque, args.flags)
                    || args.flags.contains(RayFlags::SKIP_AABBS)
                {
                    continue;
                }
                let candidate = LeafIntersection {
                    node_addr: global_node_addr(cursor.bvh_base, node),
                    primitive_id: aabb.primitive_id,
                    geometry_id_and_flags: aabb.geometry_id_and_flags,
                    opaque,
                };
                if handler.aabb(mem, &candidate, cursor).is_break() {
                    return true;
                }
            }
        }
    }
}

fn visit_box(
    cursor: &mut TraversalCursor,
    stack: &mut impl TraversalStack,
    capacity: Option<u32>,
    tmax: f32,
    prev: u32,
    children: [u32; 4],
    coords: &[[f32; 6]; 4],
) {
    let hits = intersect_box4(children, coords, cursor.origin, cursor.inv_dir, tmax);
    let sorted = hits.children;

    if prev != INVALID_NODE {
        // Backtracking through a parent link: continue with the next sibling.
        cursor.current_node = (0..3)
            .find(|&i| sorted[i] == prev)
            .map(|i| sorted[i + 1])
            .unwrap_or(INVALID_NODE);
        return;
    }

    let stride = stack.stride();
    stack.check_overflow(cursor.stack);
    let pushed = (1..4).take_while(|&i| sorted[i] != INVALID_NODE).count();
    for i in (1..=pushed).rev() {
        stack.store(cursor.stack, sorted[i]);
        cursor.stack += stride;
        if i == 1 {
            if let Some(entries) = capacity {
                let watermark = cursor.stack - entries as i32 * stride;
                cursor.low_watermark = cursor.low_watermark.max(watermark);
            }
        }
    }
    cursor.current_node = sorted[0];
}
