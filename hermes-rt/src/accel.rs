use std::collections::VecDeque;

use glam::{Affine3A, Vec3};

use crate::memory::{self, align_up, GlobalMemory, MIN_ALIGNMENT};
use crate::node::{
    addr_to_node, pack_box16, parent_link_addr, AabbNode, AccelHeader, Box16Node, Box32Node,
    InstanceNode, Mat3x4, TriangleNode, GEOMETRY_ID_MASK, GEOMETRY_OPAQUE,
    INSTANCE_CUSTOM_INDEX_MASK, INSTANCE_SBT_OFFSET_MASK, INVALID_NODE, NODE_TYPE_AABB,
    NODE_TYPE_BOX16, NODE_TYPE_BOX32, NODE_TYPE_INSTANCE, NODE_TYPE_TRIANGLE_0, ROOT_NODE,
    ROOT_OFFSET,
};
use crate::policy::InstanceFlags;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("A box node can have at most 4 children, got {0}!")]
    TooManyChildren(usize),
    #[error(transparent)]
    MemoryError(#[from] memory::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const HEADER_SIZE: u64 = std::mem::size_of::<AccelHeader>() as u64;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::INFINITY,
        max: Vec3::NEG_INFINITY,
    };
    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
    pub fn grow(self, p: Vec3) -> Self {
        Self {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }
    pub fn transform(self, transform: &Affine3A) -> Self {
        if self.min.cmpgt(self.max).any() {
            return self;
        }
        (0..8).fold(Self::EMPTY, |aabb, i| {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            aabb.grow(transform.transform_point3(corner))
        })
    }
}

///
/// A serialized acceleration structure in device memory.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Accel {
    /// Address of the header, as passed to trace calls.
    pub addr: u64,
    /// Address of the node area.
    pub bvh_addr: u64,
    pub bounds: Aabb,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceDesc {
    pub accel: Accel,
    pub transform: Affine3A,
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_offset: u32,
    pub flags: InstanceFlags,
    pub instance_id: u32,
}

impl InstanceDesc {
    pub fn new(accel: Accel, transform: Affine3A) -> Self {
        Self {
            accel,
            transform,
            custom_index: 0,
            mask: 0xff,
            sbt_offset: 0,
            flags: InstanceFlags::empty(),
            instance_id: 0,
        }
    }
}

///
/// Host side description of a hierarchy.
///
#[derive(Clone, Debug, PartialEq)]
pub enum BuildNode {
    /// Box node with full precision bounds and up to 4 children.
    Box(Vec<BuildNode>),
    /// Box node with half precision bounds and up to 4 children.
    Box16(Vec<BuildNode>),
    Triangle {
        vertices: [Vec3; 3],
        primitive_id: u32,
        geometry_id: u32,
        opaque: bool,
    },
    Aabb {
        min: Vec3,
        max: Vec3,
        primitive_id: u32,
        geometry_id: u32,
        opaque: bool,
    },
    Instance(Box<InstanceDesc>),
}

impl BuildNode {
    pub fn triangle(vertices: [Vec3; 3], primitive_id: u32) -> Self {
        BuildNode::Triangle {
            vertices,
            primitive_id,
            geometry_id: 0,
            opaque: true,
        }
    }
    pub fn aabb(min: Vec3, max: Vec3, primitive_id: u32) -> Self {
        BuildNode::Aabb {
            min,
            max,
            primitive_id,
            geometry_id: 0,
            opaque: true,
        }
    }
    pub fn instance(desc: InstanceDesc) -> Self {
        BuildNode::Instance(Box::new(desc))
    }

    /// Groups leaves into a tree of 4-wide box nodes, in order.
    pub fn tree(leaves: Vec<BuildNode>) -> Self {
        let mut level = leaves;
        while level.len() > 4 {
            let mut chunks = vec![];
            let mut iter = level.into_iter().peekable();
            while iter.peek().is_some() {
                chunks.push(BuildNode::Box(iter.by_ref().take(4).collect()));
            }
            level = chunks;
        }
        BuildNode::Box(level)
    }

    pub fn bounds(&self) -> Aabb {
        match self {
            BuildNode::Box(children) | BuildNode::Box16(children) => children
                .iter()
                .fold(Aabb::EMPTY, |aabb, child| aabb.union(child.bounds())),
            BuildNode::Triangle { vertices, .. } => vertices
                .iter()
                .fold(Aabb::EMPTY, |aabb, v| aabb.grow(*v)),
            BuildNode::Aabb { min, max, .. } => Aabb {
                min: *min,
                max: *max,
            },
            BuildNode::Instance(desc) => desc.accel.bounds.transform(&desc.transform),
        }
    }

    fn node_type(&self) -> u32 {
        match self {
            BuildNode::Box(_) => NODE_TYPE_BOX32,
            BuildNode::Box16(_) => NODE_TYPE_BOX16,
            BuildNode::Triangle { .. } => NODE_TYPE_TRIANGLE_0,
            BuildNode::Aabb { .. } => NODE_TYPE_AABB,
            BuildNode::Instance(_) => NODE_TYPE_INSTANCE,
        }
    }

    fn size(&self) -> u64 {
        match self {
            BuildNode::Box(_) | BuildNode::Instance(_) => 128,
            _ => 64,
        }
    }

    fn children(&self) -> &[BuildNode] {
        match self {
            BuildNode::Box(children) | BuildNode::Box16(children) => children,
            _ => &[],
        }
    }
}

fn geometry_id_and_flags(geometry_id: u32, opaque: bool) -> u32 {
    (geometry_id & GEOMETRY_ID_MASK) | if opaque { GEOMETRY_OPAQUE } else { 0 }
}

struct Placed<'a> {
    node: &'a BuildNode,
    id: u32,
    parent: u32,
}

fn box_slots(
    children: &[BuildNode],
    ids: impl Iterator<Item = u32>,
) -> Result<([u32; 4], [Option<Aabb>; 4])> {
    if children.len() > 4 {
        return Err(Error::TooManyChildren(children.len()));
    }
    let mut slots = [INVALID_NODE; 4];
    let mut bounds = [None; 4];
    for (i, (child, id)) in children.iter().zip(ids).enumerate() {
        slots[i] = id;
        bounds[i] = Some(child.bounds());
    }
    Ok((slots, bounds))
}

///
/// Serializes a hierarchy: a 64 byte header, the parent link table and the
/// node area, whose root box node sits at offset 128.
/// A root that is not a full precision box is wrapped into one.
///
#[profiling::function]
pub fn write(mem: &mut GlobalMemory, root: &BuildNode) -> Result<Accel> {
    let wrapped;
    let root = match root {
        BuildNode::Box(_) => root,
        _ => {
            wrapped = BuildNode::Box(vec![root.clone()]);
            &wrapped
        }
    };

    // Breadth first placement, children of a box are placed together.
    let mut placed = vec![Placed {
        node: root,
        id: ROOT_NODE,
        parent: INVALID_NODE,
    }];
    let mut next = ROOT_OFFSET + root.size();
    let mut queue = VecDeque::from([0usize]);
    while let Some(i) = queue.pop_front() {
        let (node, parent) = (placed[i].node, placed[i].id);
        for child in node.children() {
            let id = ((next >> 3) as u32) | child.node_type();
            next += child.size();
            queue.push_back(placed.len());
            placed.push(Placed {
                node: child,
                id,
                parent,
            });
        }
    }
    let node_area = next;
    let parent_size = align_up(node_area / 64 * 4, MIN_ALIGNMENT);
    let bvh_offset = HEADER_SIZE + parent_size;

    let addr = mem.alloc(bvh_offset + node_area, MIN_ALIGNMENT)?;
    let bvh_addr = addr + bvh_offset;
    let bvh_base = addr_to_node(bvh_addr);
    let node_addr = |id: u32| bvh_addr + ((id & !7) as u64) * 8;

    let bounds = root.bounds();
    let instance_count = placed
        .iter()
        .filter(|p| matches!(p.node, BuildNode::Instance(_)))
        .count() as u32;
    mem.write(
        addr,
        &AccelHeader {
            bvh_offset: bvh_offset as u32,
            node_count: placed.len() as u32,
            instance_count,
            aabb: [
                bounds.min.x,
                bounds.min.y,
                bounds.min.z,
                bounds.max.x,
                bounds.max.y,
                bounds.max.z,
            ],
            ..Default::default()
        },
    );

    let mut child_ids = placed.iter().skip(1).map(|p| p.id);
    for p in &placed {
        let target = node_addr(p.id);
        match p.node {
            BuildNode::Box(children) => {
                let (slots, bounds) = box_slots(children, child_ids.by_ref().take(children.len()))?;
                let coords = bounds.map(|b| match b {
                    Some(b) => [b.min.x, b.min.y, b.min.z, b.max.x, b.max.y, b.max.z],
                    None => [f32::NAN; 6],
                });
                mem.write(
                    target,
                    &Box32Node {
                        children: slots,
                        coords,
                        reserved: [0; 4],
                    },
                );
            }
            BuildNode::Box16(children) => {
                let (slots, bounds) = box_slots(children, child_ids.by_ref().take(children.len()))?;
                let coords = bounds.map(|b| match b {
                    Some(b) => pack_box16(b.min.to_array(), b.max.to_array()),
                    None => pack_box16([f32::NAN; 3], [f32::NAN; 3]),
                });
                mem.write(
                    target,
                    &Box16Node {
                        children: slots,
                        coords,
                    },
                );
            }
            BuildNode::Triangle {
                vertices,
                primitive_id,
                geometry_id,
                opaque,
            } => mem.write(
                target,
                &TriangleNode {
                    coords: vertices.map(|v| v.to_array()),
                    reserved: [0; 3],
                    triangle_id: *primitive_id,
                    geometry_id_and_flags: geometry_id_and_flags(*geometry_id, *opaque),
                    reserved2: 0,
                    id: 0,
                },
            ),
            BuildNode::Aabb {
                min,
                max,
                primitive_id,
                geometry_id,
                opaque,
            } => mem.write(
                target,
                &AabbNode {
                    aabb: [min.x, min.y, min.z, max.x, max.y, max.z],
                    primitive_id: *primitive_id,
                    geometry_id_and_flags: geometry_id_and_flags(*geometry_id, *opaque),
                    reserved: [0; 8],
                },
            ),
            BuildNode::Instance(desc) => mem.write(
                target,
                &InstanceNode {
                    base_ptr: addr_to_node(desc.accel.bvh_addr),
                    custom_instance_and_mask: (desc.custom_index & INSTANCE_CUSTOM_INDEX_MASK)
                        | ((desc.mask as u32) << 24),
                    sbt_offset_and_flags: (desc.sbt_offset & INSTANCE_SBT_OFFSET_MASK)
                        | desc.flags.encode(),
                    wto_matrix: Mat3x4::from_affine(&desc.transform.inverse()),
                    instance_id: desc.instance_id,
                    reserved: [0; 3],
                    otw_matrix: Mat3x4::from_affine(&desc.transform),
                },
            ),
        }
        mem.write(parent_link_addr(bvh_addr, p.id), &p.parent);
    }

    log::trace!(
        "Wrote acceleration structure with {} nodes at {addr:#x}, node base {bvh_base:#x}",
        placed.len()
    );
    Ok(Accel {
        addr,
        bvh_addr,
        bounds,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{fetch_parent, Node};

    #[test]
    fn parent_links() {
        let mut mem = GlobalMemory::new();
        let tri = |x: f32, id| {
            BuildNode::triangle(
                [
                    Vec3::new(x, 0., 1.),
                    Vec3::new(x + 1., 0., 1.),
                    Vec3::new(x, 1., 1.),
                ],
                id,
            )
        };
        let root = BuildNode::Box(vec![tri(0., 0), BuildNode::Box16(vec![tri(2., 1), tri(4., 2)])]);
        let accel = write(&mut mem, &root).unwrap();

        let header: AccelHeader = mem.read(accel.addr);
        assert_eq!(header.node_count, 5);
        assert_eq!(accel.addr + header.bvh_offset as u64, accel.bvh_addr);

        let bvh_base = addr_to_node(accel.bvh_addr);
        let Node::Box32(root_node) = Node::decode(&mem, bvh_base, ROOT_NODE) else {
            panic!("root is not a box32 node");
        };
        assert_eq!(root_node.children[2], INVALID_NODE);
        assert!(root_node.coords[2][0].is_nan());
        let inner = root_node.children[1];
        assert_eq!(inner & 7, NODE_TYPE_BOX16);

        assert_eq!(fetch_parent(&mem, accel.bvh_addr, ROOT_NODE), INVALID_NODE);
        assert_eq!(fetch_parent(&mem, accel.bvh_addr, root_node.children[0]), ROOT_NODE);
        let Node::Box16(inner_node) = Node::decode(&mem, bvh_base, inner) else {
            panic!("inner node is not a box16 node");
        };
        assert_eq!(fetch_parent(&mem, accel.bvh_addr, inner_node.children[1]), inner);
        assert_eq!(accel.bounds.max, Vec3::new(5., 1., 1.));
    }
}
