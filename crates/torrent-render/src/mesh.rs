// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;

use thiserror::Error;
use tracing::info;

use crate::meshlet::{build_meshlets, Meshlet};
use crate::vertex::Vertex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("mesh has no triangles")]
    Empty,
    #[error("index {index} out of range for {len} vertices")]
    IndexOutOfRange { index: u32, len: usize },
    #[error("index count {len} is not a multiple of 3")]
    PartialTriangle { len: usize },
    #[error("faces reference {expected} corners but {actual} were supplied")]
    CornerCountMismatch { expected: usize, actual: usize },
}

/// Geometry as it comes out of a file loader: attribute arrays addressed by
/// per-corner indices, grouped into faces of `face_sizes[i]` corners.
///
/// `normals` and `texcoords` may be empty, in which case zeros are used.
/// An empty `face_sizes` means every face is a triangle.
#[derive(Clone, Debug, Default)]
pub struct MeshSource {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub texcoords: Vec<[f32; 2]>,
    pub corners: Vec<u32>,
    pub face_sizes: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IngestOptions {
    /// Reorder for post-transform cache and vertex fetch before clustering.
    pub optimize: bool,
    pub meshlets: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub meshlets: Vec<Meshlet>,
    pub meshlet_data: Vec<u32>,
}

impl Mesh {
    pub fn from_source(src: &MeshSource, opts: IngestOptions) -> Result<Mesh, MeshError> {
        let stream = triangulate(src)?;
        if stream.is_empty() {
            return Err(MeshError::Empty);
        }
        let (mut vertices, mut indices) = deduplicate(&stream);
        if opts.optimize {
            optimize(&mut vertices, &mut indices);
        }

        let mut mesh = Mesh { vertices, indices, ..Mesh::default() };
        if opts.meshlets {
            let set = build_meshlets(&mesh.vertices, &mesh.indices)?;
            mesh.meshlets = set.meshlets;
            mesh.meshlet_data = set.data;
        }

        info!(
            faces = src.face_count(),
            vertices = mesh.vertices.len(),
            indices = mesh.indices.len(),
            meshlets = mesh.meshlets.len(),
            optimized = opts.optimize,
            "mesh ingested"
        );
        Ok(mesh)
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Radius of the origin-centred sphere containing every vertex.
    pub fn extent(&self) -> f32 {
        self.vertices
            .iter()
            .map(|v| v.position().length())
            .fold(0.0f32, f32::max)
    }
}

impl MeshSource {
    pub fn face_count(&self) -> usize {
        if self.face_sizes.is_empty() {
            self.corners.len() / 3
        } else {
            self.face_sizes.len()
        }
    }

    fn vertex(&self, corner: u32) -> Result<Vertex, MeshError> {
        let i = corner as usize;
        let position = *self
            .positions
            .get(i)
            .ok_or(MeshError::IndexOutOfRange { index: corner, len: self.positions.len() })?;
        let normal = self.normals.get(i).copied().unwrap_or_default();
        let texcoord = self.texcoords.get(i).copied().unwrap_or_default();
        Ok(Vertex::new(position, normal, texcoord))
    }
}

/// Expands every face into a flat triangle list, fanning polygons around
/// their first corner. Only correct for convex faces. Faces with fewer than
/// three corners are dropped.
pub fn triangulate(src: &MeshSource) -> Result<Vec<Vertex>, MeshError> {
    let sizes: Vec<u32> = if src.face_sizes.is_empty() {
        if src.corners.len() % 3 != 0 {
            return Err(MeshError::PartialTriangle { len: src.corners.len() });
        }
        vec![3; src.corners.len() / 3]
    } else {
        src.face_sizes.clone()
    };

    let expected: usize = sizes.iter().map(|&n| n as usize).sum();
    if expected != src.corners.len() {
        return Err(MeshError::CornerCountMismatch { expected, actual: src.corners.len() });
    }

    let mut out = Vec::with_capacity(src.corners.len());
    let mut start = 0usize;
    for &n in &sizes {
        let face = &src.corners[start..start + n as usize];
        start += n as usize;
        if face.len() < 3 {
            continue;
        }
        let anchor = src.vertex(face[0])?;
        for pair in face[1..].windows(2) {
            out.push(anchor);
            out.push(src.vertex(pair[0])?);
            out.push(src.vertex(pair[1])?);
        }
    }
    Ok(out)
}

/// Collapses identical vertices. Unique vertices keep first-seen order.
pub fn deduplicate(stream: &[Vertex]) -> (Vec<Vertex>, Vec<u32>) {
    let mut remap: HashMap<Vertex, u32> = HashMap::with_capacity(stream.len());
    let mut vertices = Vec::new();
    let indices = stream
        .iter()
        .map(|v| {
            *remap.entry(*v).or_insert_with(|| {
                vertices.push(*v);
                (vertices.len() - 1) as u32
            })
        })
        .collect();
    (vertices, indices)
}

/// Post-transform cache ordering for indices, then fetch ordering for
/// vertices.
pub fn optimize(vertices: &mut Vec<Vertex>, indices: &mut Vec<u32>) {
    *indices = meshopt::optimize_vertex_cache(indices, vertices.len());

    let remap = meshopt::optimize_vertex_fetch_remap(indices, vertices.len());
    let used = remap.iter().filter(|&&r| r != u32::MAX).count();
    let mut reordered = vec![Vertex::default(); used];
    for (old, &new) in remap.iter().enumerate() {
        if new != u32::MAX {
            reordered[new as usize] = vertices[old];
        }
    }
    for i in indices.iter_mut() {
        *i = remap[*i as usize];
    }
    *vertices = reordered;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> MeshSource {
        MeshSource {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            texcoords: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
            corners: vec![0, 1, 2, 3],
            face_sizes: vec![4],
        }
    }

    #[test]
    fn quad_fans_into_two_triangles_over_four_vertices() {
        let mesh = Mesh::from_source(&quad(), IngestOptions::default()).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert!(mesh.meshlets.is_empty());
    }

    #[test]
    fn degenerate_faces_are_skipped() {
        let mut src = quad();
        src.corners = vec![0, 1, 0, 1, 2];
        src.face_sizes = vec![2, 3];
        let stream = triangulate(&src).unwrap();
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn missing_attributes_default_to_zero() {
        let mut src = quad();
        src.normals.clear();
        src.texcoords.clear();
        let mesh = Mesh::from_source(&src, IngestOptions::default()).unwrap();
        assert_eq!(mesh.vertices[0].texcoord, [0, 0]);
    }

    #[test]
    fn bad_corner_counts_are_reported() {
        let mut src = quad();
        src.face_sizes = vec![5];
        assert_eq!(
            triangulate(&src),
            Err(MeshError::CornerCountMismatch { expected: 5, actual: 4 })
        );

        src.face_sizes = vec![4];
        src.corners = vec![0, 1, 2, 9];
        assert_eq!(
            triangulate(&src),
            Err(MeshError::IndexOutOfRange { index: 9, len: 4 })
        );
    }

    #[test]
    fn empty_source_is_an_error() {
        assert_eq!(
            Mesh::from_source(&MeshSource::default(), IngestOptions::default()).unwrap_err(),
            MeshError::Empty
        );
    }

    #[test]
    fn duplicates_collapse_in_first_seen_order() {
        let a = Vertex::new([0.0; 3], [0.0; 3], [0.0; 2]);
        let b = Vertex::new([1.0; 3], [0.0; 3], [0.0; 2]);
        let (verts, idx) = deduplicate(&[a, b, a, b, b]);
        assert_eq!(verts, vec![a, b]);
        assert_eq!(idx, vec![0, 1, 0, 1, 1]);
    }

    #[test]
    fn optimize_preserves_triangles() {
        let src = MeshSource {
            positions: (0..6).map(|i| [i as f32, (i * i) as f32, 0.0]).collect(),
            corners: vec![0, 1, 2, 3, 4, 5, 2, 1, 4],
            ..MeshSource::default()
        };
        let plain = Mesh::from_source(&src, IngestOptions::default()).unwrap();
        let opt = Mesh::from_source(&src, IngestOptions { optimize: true, meshlets: true }).unwrap();

        let tris = |m: &Mesh| {
            let mut t: Vec<Vec<[u16; 4]>> = m
                .indices
                .chunks_exact(3)
                .map(|c| {
                    let mut tri: Vec<_> = c.iter().map(|&i| m.vertices[i as usize].position).collect();
                    tri.sort();
                    tri
                })
                .collect();
            t.sort();
            t
        };
        assert_eq!(tris(&plain), tris(&opt));
        assert_eq!(opt.vertices.len(), plain.vertices.len());
        assert_eq!(opt.meshlets.len(), 32);
    }
}
