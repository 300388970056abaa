use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Vec3};
use half::f16;

use crate::memory::GlobalMemory;

pub const NODE_TYPE_TRIANGLE_0: u32 = 0;
pub const NODE_TYPE_TRIANGLE_3: u32 = 3;
pub const NODE_TYPE_BOX16: u32 = 4;
pub const NODE_TYPE_BOX32: u32 = 5;
pub const NODE_TYPE_INSTANCE: u32 = 6;
pub const NODE_TYPE_AABB: u32 = 7;

pub const ROOT_NODE: u32 = 0x10 + NODE_TYPE_BOX32;
pub const INVALID_NODE: u32 = 0xffff_ffff;
pub const NO_INSTANCE_ROOT: u32 = 0xffff_fffe;

/// Byte offset of the root box from the start of the node area.
pub const ROOT_OFFSET: u64 = ((ROOT_NODE & !7) as u64) << 3;

pub const GEOMETRY_OPAQUE: u32 = 1 << 31;
pub const GEOMETRY_ID_MASK: u32 = 0x0fff_ffff;

pub const INSTANCE_FORCE_OPAQUE: u32 = 1 << 31;
pub const INSTANCE_NO_FORCE_NOT_OPAQUE: u32 = 1 << 30;
pub const INSTANCE_TRIANGLE_FACING_CULL_DISABLE: u32 = 1 << 29;
pub const INSTANCE_TRIANGLE_FLIP_FACING: u32 = 1 << 28;
pub const INSTANCE_SBT_OFFSET_MASK: u32 = 0x00ff_ffff;
pub const INSTANCE_CUSTOM_INDEX_MASK: u32 = 0x00ff_ffff;

pub fn node_type(node: u32) -> u32 {
    node & 7
}

/// Converts a node id (relative to a node-form base) to a device address.
pub fn node_to_addr(node: u64) -> u64 {
    ((node & !7) << 3) | (0xffff << 48)
}

/// Converts a 64 byte aligned device address into node form.
pub fn addr_to_node(addr: u64) -> u64 {
    (addr >> 3) & (((1 << 42) - 1) << 3)
}

/// Global node address of a node id within the hierarchy at `bvh_base`.
pub fn global_node_addr(bvh_base: u64, node: u32) -> u64 {
    node_to_addr(bvh_base + node as u64)
}

/// Address of the parent link of `node`, stored below the node area.
pub fn parent_link_addr(bvh_addr: u64, node: u32) -> u64 {
    bvh_addr - ((node as u64 / 8) * 4 + 4)
}

pub fn fetch_parent(mem: &GlobalMemory, bvh_addr: u64, node: u32) -> u32 {
    mem.read::<u32>(parent_link_addr(bvh_addr, node))
}

///
/// Row-major 3x4 affine matrix as stored in instance nodes.
///
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Mat3x4 {
    pub rows: [[f32; 4]; 3],
}

impl Default for Mat3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mat3x4 {
    pub const IDENTITY: Self = Self {
        rows: [
            [1., 0., 0., 0.],
            [0., 1., 0., 0.],
            [0., 0., 1., 0.],
        ],
    };

    pub fn from_affine(affine: &Affine3A) -> Self {
        let m = affine.matrix3;
        let t = affine.translation;
        Self {
            rows: [
                [m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x],
                [m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y],
                [m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z],
            ],
        }
    }
    pub fn to_affine(&self) -> Affine3A {
        let r = &self.rows;
        Affine3A::from_cols(
            Vec3::new(r[0][0], r[1][0], r[2][0]).into(),
            Vec3::new(r[0][1], r[1][1], r[2][1]).into(),
            Vec3::new(r[0][2], r[1][2], r[2][2]).into(),
            Vec3::new(r[0][3], r[1][3], r[2][3]).into(),
        )
    }

    /// `result[i] = (translation ? m[i][3] : 0) + sum_j v[j] * m[i][j]`
    pub fn mul_vec3(&self, v: Vec3, translation: bool) -> Vec3 {
        let row = |i: usize| {
            let r = &self.rows[i];
            let t = if translation { r[3] } else { 0. };
            t + v.x * r[0] + v.y * r[1] + v.z * r[2]
        };
        Vec3::new(row(0), row(1), row(2))
    }
    pub fn transform_point(&self, v: Vec3) -> Vec3 {
        self.mul_vec3(v, true)
    }
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        self.mul_vec3(v, false)
    }
    /// Column `c` of the matrix, `c == 3` being the translation.
    pub fn column(&self, c: usize) -> Vec3 {
        Vec3::new(self.rows[0][c], self.rows[1][c], self.rows[2][c])
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct AccelHeader {
    pub bvh_offset: u32,
    pub node_count: u32,
    pub instance_count: u32,
    pub reserved0: u32,
    pub aabb: [f32; 6],
    pub reserved1: [u32; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Box32Node {
    pub children: [u32; 4],
    pub coords: [[f32; 6]; 4],
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Box16Node {
    pub children: [u32; 4],
    pub coords: [[u32; 3]; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TriangleNode {
    pub coords: [[f32; 3]; 3],
    pub reserved: [u32; 3],
    pub triangle_id: u32,
    pub geometry_id_and_flags: u32,
    pub reserved2: u32,
    pub id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AabbNode {
    pub aabb: [f32; 6],
    pub primitive_id: u32,
    pub geometry_id_and_flags: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InstanceNode {
    /// Node-form address of the bottom level hierarchy.
    pub base_ptr: u64,
    pub custom_instance_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub wto_matrix: Mat3x4,
    pub instance_id: u32,
    pub reserved: [u32; 3],
    pub otw_matrix: Mat3x4,
}

pub const TRIANGLE_PRIMITIVE_OFFSET: u64 = 48;
pub const AABB_PRIMITIVE_OFFSET: u64 = 24;
pub const INSTANCE_CUSTOM_INDEX_OFFSET: u64 = 8;
pub const INSTANCE_WTO_OFFSET: u64 = 16;
pub const INSTANCE_ID_OFFSET: u64 = 64;
pub const INSTANCE_OTW_OFFSET: u64 = 80;

/// Packs a box into the three half-precision word pairs of a box16 slot.
pub fn pack_box16(min: [f32; 3], max: [f32; 3]) -> [u32; 3] {
    let pack = |lo: f16, hi: f16| lo.to_bits() as u32 | ((hi.to_bits() as u32) << 16);
    let min = min.map(round_down);
    let max = max.map(round_up);
    [
        pack(min[0], min[1]),
        pack(min[2], max[0]),
        pack(max[1], max[2]),
    ]
}

pub fn unpack_box16(words: [u32; 3]) -> [f32; 6] {
    let lo = |w: u32| f16::from_bits(w as u16).to_f32();
    let hi = |w: u32| f16::from_bits((w >> 16) as u16).to_f32();
    [
        lo(words[0]),
        hi(words[0]),
        lo(words[1]),
        hi(words[1]),
        lo(words[2]),
        hi(words[2]),
    ]
}

fn round_down(v: f32) -> f16 {
    let h = f16::from_f32(v);
    if h.to_f32() > v {
        next_toward(h, f16::NEG_INFINITY)
    } else {
        h
    }
}
fn round_up(v: f32) -> f16 {
    let h = f16::from_f32(v);
    if h.to_f32() < v {
        next_toward(h, f16::INFINITY)
    } else {
        h
    }
}
fn next_toward(h: f16, target: f16) -> f16 {
    if h.is_nan() || h == target {
        return h;
    }
    if h == f16::ZERO || h == f16::NEG_ZERO {
        let tiny = f16::from_bits(1);
        return if target > h { tiny } else { -tiny };
    }
    let bits = h.to_bits();
    let away_from_zero = (target > h) == h.is_sign_positive();
    f16::from_bits(if away_from_zero { bits + 1 } else { bits - 1 })
}

///
/// A decoded BVH node.
///
#[derive(Clone, Copy, Debug)]
pub enum Node {
    Triangle(TriangleNode),
    Box16(Box16Node),
    Box32(Box32Node),
    Instance(InstanceNode),
    Aabb(AabbNode),
}

impl Node {
    /// Decodes the node with id `node` relative to the node-form `bvh_base`.
    pub fn decode(mem: &GlobalMemory, bvh_base: u64, node: u32) -> Self {
        let addr = global_node_addr(bvh_base, node);
        match node_type(node) {
            NODE_TYPE_TRIANGLE_0..=NODE_TYPE_TRIANGLE_3 => Self::decode_triangle(mem, addr),
            NODE_TYPE_BOX16 => Self::decode_box16(mem, addr),
            NODE_TYPE_BOX32 => Self::decode_box32(mem, addr),
            NODE_TYPE_INSTANCE => Self::decode_instance(mem, addr),
            _ => Self::decode_aabb(mem, addr),
        }
    }
    pub fn decode_triangle(mem: &GlobalMemory, addr: u64) -> Self {
        Self::Triangle(mem.read(addr))
    }
    pub fn decode_box16(mem: &GlobalMemory, addr: u64) -> Self {
        Self::Box16(mem.read(addr))
    }
    pub fn decode_box32(mem: &GlobalMemory, addr: u64) -> Self {
        Self::Box32(mem.read(addr))
    }
    pub fn decode_instance(mem: &GlobalMemory, addr: u64) -> Self {
        Self::Instance(mem.read(addr))
    }
    pub fn decode_aabb(mem: &GlobalMemory, addr: u64) -> Self {
        Self::Aabb(mem.read(addr))
    }
}

impl Box16Node {
    pub fn coords_f32(&self) -> [[f32; 6]; 4] {
        self.coords.map(unpack_box16)
    }
}

///
/// Instance-relative values as seen through an instance address.
/// An address of zero stands for the implicit identity instance of a
/// hierarchy without instance nodes.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceField {
    CustomIndex,
    Id,
    SbtOffset,
    ObjectToWorld(u8),
    WorldToObject(u8),
}

pub fn instance_u32(mem: &GlobalMemory, instance_addr: u64, field: InstanceField) -> u32 {
    if instance_addr == 0 {
        return 0;
    }
    match field {
        InstanceField::CustomIndex => {
            mem.read::<u32>(instance_addr + INSTANCE_CUSTOM_INDEX_OFFSET)
                & INSTANCE_CUSTOM_INDEX_MASK
        }
        InstanceField::Id => mem.read::<u32>(instance_addr + INSTANCE_ID_OFFSET),
        InstanceField::SbtOffset => {
            mem.read::<u32>(instance_addr + INSTANCE_CUSTOM_INDEX_OFFSET + 4)
                & INSTANCE_SBT_OFFSET_MASK
        }
        _ => 0,
    }
}

pub fn instance_matrix(mem: &GlobalMemory, instance_addr: u64, world_to_object: bool) -> Mat3x4 {
    if instance_addr == 0 {
        return Mat3x4::IDENTITY;
    }
    let offset = if world_to_object {
        INSTANCE_WTO_OFFSET
    } else {
        INSTANCE_OTW_OFFSET
    };
    mem.read(instance_addr + offset)
}

pub fn instance_column(mem: &GlobalMemory, instance_addr: u64, field: InstanceField) -> Vec3 {
    match field {
        InstanceField::ObjectToWorld(c) => {
            instance_matrix(mem, instance_addr, false).column(c as usize)
        }
        InstanceField::WorldToObject(c) => {
            instance_matrix(mem, instance_addr, true).column(c as usize)
        }
        _ => Vec3::ZERO,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_address_encoding() {
        let addr = 0xffff_0000_0001_0040u64;
        let node = addr_to_node(addr);
        assert_eq!(node_to_addr(node), addr);
        assert_eq!(node_to_addr(node + ROOT_NODE as u64), addr + 128);
        assert_eq!(node_type(ROOT_NODE), NODE_TYPE_BOX32);
    }

    #[test]
    fn box16_packing_is_conservative() {
        let min = [0.1, -3.3, 7.77];
        let max = [0.2, 1.01, 9.99];
        let b = unpack_box16(pack_box16(min, max));
        for i in 0..3 {
            assert!(b[i] <= min[i]);
            assert!(b[i + 3] >= max[i]);
        }
    }

    #[test]
    fn identity_instance() {
        let mem = GlobalMemory::new();
        assert_eq!(instance_u32(&mem, 0, InstanceField::Id), 0);
        assert_eq!(instance_matrix(&mem, 0, true), Mat3x4::IDENTITY);
    }
}
