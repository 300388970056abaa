use glam::{Vec3, Vec4};

use crate::node::INVALID_NODE;

///
/// Result of testing a ray against the four children of a box node.
/// `children` is sorted by ascending entry distance; rejected and inactive
/// slots carry [`INVALID_NODE`] and an infinite distance.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxHits {
    pub children: [u32; 4],
    pub distances: [f32; 4],
}

/// Clamps a reciprocal direction so infinities do not produce NaNs in the
/// slab computations.
pub fn clamp_inv_dir(inv_dir: Vec3) -> Vec3 {
    inv_dir.clamp(Vec3::splat(-f32::MAX), Vec3::splat(f32::MAX))
}

/// Slab entry and exit distance of a ray against a single box.
pub fn slab(min: Vec3, max: Vec3, origin: Vec3, inv_dir: Vec3) -> (f32, f32) {
    let bound0 = (min - origin) * inv_dir;
    let bound1 = (max - origin) * inv_dir;
    let tmin = bound0.min(bound1).max_element();
    let tmax = bound0.max(bound1).min_element();
    (tmin, tmax)
}

///
/// Tests four child boxes (each `[min.xyz, max.xyz]`) at once and returns the
/// hit children ordered front to back.
/// A NaN `min.x` marks an inactive slot.
///
pub fn intersect_box4(
    children: [u32; 4],
    coords: &[[f32; 6]; 4],
    origin: Vec3,
    inv_dir: Vec3,
    ray_tmax: f32,
) -> BoxHits {
    let inv_dir = clamp_inv_dir(inv_dir);
    let mut hits = BoxHits {
        children: [INVALID_NODE; 4],
        distances: [f32::INFINITY; 4],
    };

    for i in 0..4 {
        let c = &coords[i];
        if c[0].is_nan() {
            continue;
        }
        let min = Vec3::new(c[0], c[1], c[2]);
        let max = Vec3::new(c[3], c[4], c[5]);
        let (tmin, tmax) = slab(min, max, origin, inv_dir);

        if tmax >= tmin.max(0.) && tmin < ray_tmax {
            hits.children[i] = children[i];
            hits.distances[i] = tmin;
        }
    }

    sort_box_hits(&mut hits);
    hits
}

/// Five comparator sorting network; equal distances keep their slot order.
pub fn sort_box_hits(hits: &mut BoxHits) {
    let mut slots = [0u8, 1, 2, 3];
    for (a, b) in [(0, 1), (2, 3), (0, 2), (1, 3), (1, 2)] {
        let (da, db) = (hits.distances[a], hits.distances[b]);
        if db < da || (db == da && slots[b] < slots[a]) {
            hits.distances.swap(a, b);
            hits.children.swap(a, b);
            slots.swap(a, b);
        }
    }
}

///
/// Watertight ray/triangle test.
/// Returns `(t, det, v, w)` with the hit distance being `t / det` and the
/// barycentrics `(v / det, w / det)`. A miss is reported as
/// `(inf, 1, 0, 0)`.
///
pub fn intersect_triangle(vertices: &[Vec3; 3], origin: Vec3, dir: Vec3) -> Vec4 {
    let miss = Vec4::new(f32::INFINITY, 1., 0., 0.);

    let abs_dir = dir.abs();
    let kz = if abs_dir.x >= abs_dir.y {
        if abs_dir.x >= abs_dir.z {
            0
        } else {
            2
        }
    } else if abs_dir.y >= abs_dir.z {
        1
    } else {
        2
    };
    let mut kx = (kz + 1) % 3;
    let mut ky = (kx + 1) % 3;
    if dir[kz] < 0. {
        std::mem::swap(&mut kx, &mut ky);
    }

    let sz = 1. / dir[kz];
    let sx = dir[kx] * sz;
    let sy = dir[ky] * sz;

    let va = vertices[0] - origin;
    let vb = vertices[1] - origin;
    let vc = vertices[2] - origin;

    let ax = va[kx] - sx * va[kz];
    let ay = va[ky] - sy * va[kz];
    let bx = vb[kx] - sx * vb[kz];
    let by = vb[ky] - sy * vb[kz];
    let cx = vc[kx] - sx * vc[kz];
    let cy = vc[ky] - sy * vc[kz];

    let mut u = cx * by - cy * bx;
    let mut v = ax * cy - ay * cx;
    let mut w = bx * ay - by * ax;

    // Edges through the ray are resolved in double precision.
    if u == 0. || v == 0. || w == 0. {
        let (ax, ay, bx, by, cx, cy) = (
            ax as f64, ay as f64, bx as f64, by as f64, cx as f64, cy as f64,
        );
        u = (cx * by - cy * bx) as f32;
        v = (ax * cy - ay * cx) as f32;
        w = (bx * ay - by * ax) as f32;
    }

    let any_negative = u < 0. || v < 0. || w < 0.;
    let any_positive = u > 0. || v > 0. || w > 0.;
    if any_negative && any_positive {
        return miss;
    }

    let det = u + (v + w);

    let az = sz * va[kz];
    let bz = sz * vb[kz];
    let cz = sz * vc[kz];
    let t = u * az + v * bz + w * cz;

    let det_sign = if det < 0. {
        -1.
    } else if det > 0. {
        1.
    } else {
        0.
    };
    if det_sign * t < 0. {
        return miss;
    }
    Vec4::new(t, det, v, w)
}

///
/// Slab test for procedural leaves without an intersection shader.
/// Axes with a zero direction component do not bound the interval.
/// Returns the reported hit distance `max(t_enter, tmin)`.
///
pub fn intersect_aabb(
    min: Vec3,
    max: Vec3,
    origin: Vec3,
    dir: Vec3,
    tmin: f32,
    tmax: f32,
) -> Option<f32> {
    let mut t_enter = f32::NEG_INFINITY;
    let mut t_exit = f32::INFINITY;
    for i in 0..3 {
        if dir[i] == 0. {
            continue;
        }
        let inv = 1. / dir[i];
        let t0 = (min[i] - origin[i]) * inv;
        let t1 = (max[i] - origin[i]) * inv;
        t_enter = t_enter.max(t0.min(t1));
        t_exit = t_exit.min(t0.max(t1));
    }
    (tmax >= t_enter && t_exit >= tmin).then(|| t_enter.max(tmin))
}
