// SPDX-License-Identifier: CEPL-1.0
//! Greedy triangle clustering.
//!
//! Triangles are visited once, in index order. A cluster is flushed as soon
//! as the next triangle would push it past [`MAX_VERTICES`] unique vertices
//! or it already holds [`MAX_TRIANGLES`] triangles. The meshlet list is then
//! padded with empty entries to a multiple of [`DISPATCH_GRANULARITY`] so the
//! task stage can always read a full group.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use torrent_math::{Cone, Sphere};

use crate::vertex::Vertex;
use crate::MeshError;

pub const MAX_VERTICES: usize = 64;
pub const MAX_TRIANGLES: usize = 124;
/// Meshlets handled by one task workgroup.
pub const DISPATCH_GRANULARITY: usize = 32;

const UNASSIGNED: u8 = u8::MAX;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Meshlet {
    pub center: [f32; 3],
    pub radius: f32,
    pub cone_axis: [i8; 3],
    pub cone_cutoff: i8,
    /// Offset into `meshlet_data`, in words.
    pub data_offset: u32,
    pub vertex_count: u8,
    pub triangle_count: u8,
    pub _pad: [u8; 2],
    pub _reserved: u32,
}

const _: () = assert!(std::mem::size_of::<Meshlet>() == 32);

impl Meshlet {
    pub fn is_empty(&self) -> bool {
        self.triangle_count == 0
    }

    /// Global vertex indices referenced by this meshlet.
    pub fn vertices<'a>(&self, data: &'a [u32]) -> &'a [u32] {
        let start = self.data_offset as usize;
        &data[start..start + self.vertex_count as usize]
    }

    /// Local triangles, each entry indexing [`Meshlet::vertices`].
    pub fn triangles<'a>(&self, data: &'a [u32]) -> impl Iterator<Item = [u8; 3]> + 'a {
        let start = self.data_offset as usize + self.vertex_count as usize;
        let words = packed_words(self.triangle_count as usize);
        let bytes: Vec<u8> = data[start..start + words]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let count = self.triangle_count as usize;
        (0..count).map(move |t| [bytes[t * 3], bytes[t * 3 + 1], bytes[t * 3 + 2]])
    }
}

/// Meshlets plus the flat buffer their `data_offset`s point into.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshletSet {
    pub meshlets: Vec<Meshlet>,
    pub data: Vec<u32>,
}

impl MeshletSet {
    /// Meshlets that carry triangles; padding is excluded.
    pub fn occupied(&self) -> impl Iterator<Item = &Meshlet> {
        self.meshlets.iter().filter(|m| !m.is_empty())
    }
}

#[inline]
fn packed_words(triangle_count: usize) -> usize {
    (triangle_count * 3).div_ceil(4)
}

#[derive(Default)]
struct Cluster {
    vertices: Vec<u32>,
    triangles: Vec<u8>,
}

impl Cluster {
    fn triangle_count(&self) -> usize {
        self.triangles.len() / 3
    }

    fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

pub fn build_meshlets(vertices: &[Vertex], indices: &[u32]) -> Result<MeshletSet, MeshError> {
    if indices.len() % 3 != 0 {
        return Err(MeshError::PartialTriangle { len: indices.len() });
    }
    if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
        return Err(MeshError::IndexOutOfRange { index, len: vertices.len() });
    }

    let mut out = MeshletSet::default();
    let mut marker = vec![UNASSIGNED; vertices.len()];
    let mut cluster = Cluster {
        vertices: Vec::with_capacity(MAX_VERTICES),
        triangles: Vec::with_capacity(MAX_TRIANGLES * 3),
    };

    for tri in indices.chunks_exact(3) {
        let fresh = tri
            .iter()
            .filter(|&&v| marker[v as usize] == UNASSIGNED)
            .count();

        if cluster.vertices.len() + fresh > MAX_VERTICES
            || cluster.triangle_count() >= MAX_TRIANGLES
        {
            flush(&mut out, &mut cluster, &mut marker, vertices);
        }

        for &v in tri {
            let slot = &mut marker[v as usize];
            if *slot == UNASSIGNED {
                *slot = cluster.vertices.len() as u8;
                cluster.vertices.push(v);
            }
            cluster.triangles.push(*slot);
        }
    }

    if !cluster.is_empty() {
        flush(&mut out, &mut cluster, &mut marker, vertices);
    }

    let padded = out.meshlets.len().next_multiple_of(DISPATCH_GRANULARITY);
    out.meshlets.resize(padded, Meshlet::default());

    tracing::debug!(
        triangles = indices.len() / 3,
        meshlets = out.occupied().count(),
        padded,
        data_words = out.data.len(),
        "meshlets built"
    );
    Ok(out)
}

fn flush(out: &mut MeshletSet, cluster: &mut Cluster, marker: &mut [u8], vertices: &[Vertex]) {
    let positions: Vec<Vec3> = cluster
        .vertices
        .iter()
        .map(|&v| vertices[v as usize].position())
        .collect();

    let sphere = Sphere::enclosing(positions.iter().copied());
    let normals: Vec<Vec3> = cluster
        .triangles
        .chunks_exact(3)
        .map(|t| {
            let (a, b, c) = (
                positions[t[0] as usize],
                positions[t[1] as usize],
                positions[t[2] as usize],
            );
            (b - a).cross(c - a).normalize_or_zero()
        })
        .collect();
    let (cone_axis, cone_cutoff) = Cone::from_normals(normals.iter().copied()).quantize();

    let data_offset = out.data.len() as u32;
    out.data.extend_from_slice(&cluster.vertices);

    let mut packed = cluster.triangles.clone();
    packed.resize(packed_words(cluster.triangle_count()) * 4, 0);
    out.data.extend(
        packed
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
    );

    out.meshlets.push(Meshlet {
        center: sphere.center.to_array(),
        radius: sphere.radius,
        cone_axis,
        cone_cutoff,
        data_offset,
        vertex_count: cluster.vertices.len() as u8,
        triangle_count: cluster.triangle_count() as u8,
        ..Meshlet::default()
    });

    for &v in &cluster.vertices {
        marker[v as usize] = UNASSIGNED;
    }
    cluster.vertices.clear();
    cluster.triangles.clear();
}
