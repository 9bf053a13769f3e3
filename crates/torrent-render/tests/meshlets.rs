// SPDX-License-Identifier: CEPL-1.0
use glam::Vec3;
use proptest::prelude::*;
use torrent_render::mesh::{deduplicate, optimize};
use torrent_render::meshlet::{DISPATCH_GRANULARITY, MAX_TRIANGLES, MAX_VERTICES};
use torrent_render::{build_meshlets, Meshlet, MeshletSet, Vertex};

fn sorted(t: [u32; 3]) -> [u32; 3] {
    let mut t = t;
    t.sort_unstable();
    t
}

fn triangles_of(set: &MeshletSet) -> Vec<[u32; 3]> {
    let mut out = Vec::new();
    for m in set.occupied() {
        let verts = m.vertices(&set.data);
        for t in m.triangles(&set.data) {
            out.push(sorted(t.map(|l| verts[l as usize])));
        }
    }
    out.sort_unstable();
    out
}

fn check(vertices: &[Vertex], indices: &[u32]) {
    let set = build_meshlets(vertices, indices).unwrap();

    let mut expected: Vec<[u32; 3]> = indices
        .chunks_exact(3)
        .map(|c| sorted([c[0], c[1], c[2]]))
        .collect();
    expected.sort_unstable();
    assert_eq!(triangles_of(&set), expected, "partition is not exact");

    assert_eq!(set.meshlets.len() % DISPATCH_GRANULARITY, 0);
    let used = set.occupied().count();
    assert!(set.meshlets[used..].iter().all(|m| m.triangle_count == 0 && m.vertex_count == 0));

    for m in set.occupied() {
        let vc = m.vertex_count as usize;
        assert!((1..=MAX_VERTICES).contains(&vc));
        assert!((1..=MAX_TRIANGLES).contains(&(m.triangle_count as usize)));
        assert!(m.triangles(&set.data).flatten().all(|l| (l as usize) < vc));

        let axis = m.cone_axis.map(|a| a as f32 / 127.0);
        let len = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
        assert!((len - 1.0).abs() < 0.02, "cone axis length {len}");
        assert!(m.cone_cutoff >= 0);

        let center = m.center;
        for &v in m.vertices(&set.data) {
            let p = vertices[v as usize].position();
            let d = ((p.x - center[0]).powi(2) + (p.y - center[1]).powi(2) + (p.z - center[2]).powi(2)).sqrt();
            assert!(d <= m.radius + 1e-3);
        }
    }
}

fn mesh_strategy() -> impl Strategy<Value = (Vec<Vertex>, Vec<u32>)> {
    (3usize..300).prop_flat_map(|n| {
        let verts = prop::collection::vec(
            (-100i16..100, -100i16..100, -100i16..100)
                .prop_map(|(x, y, z)| Vertex::new([x as f32, y as f32, z as f32], [0.0; 3], [0.0; 2])),
            n,
        );
        let tris = prop::collection::vec((0..n as u32, 0..n as u32, 0..n as u32), 1..600);
        (verts, tris).prop_map(|(v, t)| (v, t.into_iter().flat_map(|(a, b, c)| [a, b, c]).collect()))
    })
}

proptest! {
    #[test]
    fn clusters_partition_any_index_order((vertices, indices) in mesh_strategy()) {
        check(&vertices, &indices);
    }

    #[test]
    fn clusters_partition_after_reordering((vertices, indices) in mesh_strategy()) {
        // meshopt needs unique vertices to remap
        let stream: Vec<Vertex> = indices.iter().map(|&i| vertices[i as usize]).collect();
        let (mut unique, mut idx) = deduplicate(&stream);
        optimize(&mut unique, &mut idx);
        check(&unique, &idx);
    }
}

#[test]
fn grid_mesh_clusters_fill_up() {
    // 20x20 quad grid, 800 triangles
    let n = 21u32;
    let vertices: Vec<Vertex> = (0..n * n)
        .map(|i| Vertex::new([(i % n) as f32, (i / n) as f32, 0.0], [0.0, 0.0, 1.0], [0.0; 2]))
        .collect();
    let mut indices = Vec::new();
    for y in 0..n - 1 {
        for x in 0..n - 1 {
            let i = y * n + x;
            indices.extend([i, i + 1, i + n, i + 1, i + n + 1, i + n]);
        }
    }
    check(&vertices, &indices);

    let set = build_meshlets(&vertices, &indices).unwrap();
    // flat grid faces +Z everywhere; the cutoff keeps at most two steps of slack
    assert!(set
        .occupied()
        .all(|m| m.cone_axis == [0, 0, 127] && (1..=2).contains(&m.cone_cutoff)));
}

fn snorm(b: i8) -> f32 {
    (b as f32 / 127.0).max(-1.0)
}

/// Same rejection test the task stage runs, on the stored bytes.
fn stored_cone_culls(m: &Meshlet, camera: Vec3) -> bool {
    let axis = Vec3::from_array(m.cone_axis.map(snorm));
    let d = Vec3::from_array(m.center) - camera;
    d.dot(axis) >= snorm(m.cone_cutoff) * d.length() + m.radius
}

#[test]
fn tilted_patch_stays_visible_at_grazing_angles() {
    // plane facing (0.6, 0.8, 0), which has no exact snorm8 encoding
    let normal = Vec3::new(0.6, 0.8, 0.0);
    let u = Vec3::new(-0.8, 0.6, 0.0);
    let v = Vec3::Z;
    let corners = [Vec3::ZERO, u, v, u + v];
    let vertices: Vec<Vertex> = corners
        .iter()
        .map(|p| Vertex::new(p.to_array(), normal.to_array(), [0.0; 2]))
        .collect();
    let set = build_meshlets(&vertices, &[0, 1, 2, 1, 3, 2]).unwrap();
    let m = set.meshlets[0];
    assert_eq!(m.triangle_count, 2);

    let center = Vec3::from_array(m.center);
    for side in [u, -u, v, -v] {
        let camera = center + side * 1000.0 + normal * 0.1;
        assert!(!stored_cone_culls(&m, camera), "culled from {camera:?}");
    }
    // straight behind the patch it is still rejected
    assert!(stored_cone_culls(&m, center - normal * 10.0));
}
