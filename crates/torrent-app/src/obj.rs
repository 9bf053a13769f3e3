// SPDX-License-Identifier: CEPL-1.0
use std::path::Path;

use anyhow::{Context, Result};
use torrent_render::MeshSource;
use tracing::info;

fn load_options() -> tobj::LoadOptions {
    // Polygons are kept so the fan triangulator in torrent-render sees them
    tobj::LoadOptions {
        single_index: true,
        triangulate: false,
        ..Default::default()
    }
}

pub fn load_obj(path: &Path) -> Result<MeshSource> {
    let (models, _materials) =
        tobj::load_obj(path, &load_options()).with_context(|| format!("loading {}", path.display()))?;
    let source = merge_models(&models);
    info!(
        "{}: {} models, {} positions, {} faces",
        path.display(),
        models.len(),
        source.positions.len(),
        source.face_count()
    );
    Ok(source)
}

fn chunks3(v: &[f32]) -> impl Iterator<Item = [f32; 3]> + '_ {
    v.chunks_exact(3).map(|c| [c[0], c[1], c[2]])
}

/// Concatenates every model into one source. Attributes missing from a
/// model are zero-filled so corner indices stay aligned across models.
pub fn merge_models(models: &[tobj::Model]) -> MeshSource {
    let mut src = MeshSource::default();
    let mut polygons = false;

    for model in models {
        let m = &model.mesh;
        let base = src.positions.len() as u32;
        let count = m.positions.len() / 3;

        src.positions.extend(chunks3(&m.positions));
        if m.normals.len() == count * 3 {
            src.normals.extend(chunks3(&m.normals));
        } else {
            src.normals.resize(src.positions.len(), [0.0; 3]);
        }
        if m.texcoords.len() == count * 2 {
            src.texcoords
                .extend(m.texcoords.chunks_exact(2).map(|c| [c[0], c[1]]));
        } else {
            src.texcoords.resize(src.positions.len(), [0.0; 2]);
        }

        src.corners.extend(m.indices.iter().map(|&i| i + base));

        // Empty face_arities means all triangles; once one model has
        // polygons every face needs an explicit size.
        if !m.face_arities.is_empty() && !polygons {
            polygons = true;
            src.face_sizes = vec![3; (src.corners.len() - m.indices.len()) / 3];
        }
        if polygons {
            if m.face_arities.is_empty() {
                src.face_sizes.extend(std::iter::repeat(3).take(m.indices.len() / 3));
            } else {
                src.face_sizes.extend_from_slice(&m.face_arities);
            }
        }
    }
    src
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::*;

    fn parse(text: &str) -> Vec<tobj::Model> {
        let mut reader = BufReader::new(Cursor::new(text.as_bytes()));
        let (models, _) =
            tobj::load_obj_buf(&mut reader, &load_options(), |_| Err(tobj::LoadError::OpenFileFailed)).unwrap();
        models
    }

    #[test]
    fn quad_face_keeps_its_arity() {
        let models = parse(
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             f 1 2 3 4\n",
        );
        let src = merge_models(&models);
        assert_eq!(src.positions.len(), 4);
        assert_eq!(src.corners.len(), 4);
        assert_eq!(src.face_sizes, vec![4]);
        assert_eq!(src.face_count(), 1);
    }

    #[test]
    fn second_model_indices_are_offset() {
        let models = parse(
            "o a\nv 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n\
             o b\nv 0 0 1\nv 1 0 1\nv 0 1 1\nf 4 5 6\n",
        );
        assert_eq!(models.len(), 2);
        let src = merge_models(&models);
        assert_eq!(src.positions.len(), 6);
        assert_eq!(src.normals.len(), 6);
        assert_eq!(&src.corners[3..], &[3, 4, 5]);
        assert_eq!(src.face_count(), 2);
    }

    #[test]
    fn mixed_faces_get_explicit_sizes() {
        let models = parse(
            "o tri\nv 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n\
             o quad\nv 0 0 1\nv 1 0 1\nv 1 1 1\nv 0 1 1\nf 4 5 6 7\n",
        );
        let src = merge_models(&models);
        assert_eq!(src.face_sizes, vec![3, 4]);
        assert_eq!(src.corners.len(), 7);
    }
}
