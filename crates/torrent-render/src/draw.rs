// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};

use crate::frame::DrawPath;
use crate::meshlet::DISPATCH_GRANULARITY;
use crate::mesh::Mesh;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskArgs {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}

/// Host-side view of the indirect command slot. Only the arguments reach the
/// GPU; the variant is implied by which pipeline is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawCommand {
    Indexed(DrawIndexedArgs),
    ClusterTask(TaskArgs),
}

impl DrawCommand {
    /// Command for draw `draw_index` of a mesh with `index_count` indices
    /// and `meshlet_count` padded meshlets. The indexed form passes the draw
    /// index through `first_instance`.
    pub fn for_path(path: DrawPath, index_count: u32, meshlet_count: u32, draw_index: u32) -> Self {
        match path {
            DrawPath::Indexed => DrawCommand::Indexed(DrawIndexedArgs {
                index_count,
                instance_count: 1,
                first_index: 0,
                vertex_offset: 0,
                first_instance: draw_index,
            }),
            DrawPath::Cluster => DrawCommand::ClusterTask(TaskArgs {
                group_count_x: meshlet_count / DISPATCH_GRANULARITY as u32,
                group_count_y: 1,
                group_count_z: 1,
            }),
        }
    }

    fn encode(&self) -> [u32; 5] {
        match *self {
            DrawCommand::Indexed(a) => [
                a.index_count,
                a.instance_count,
                a.first_index,
                a.vertex_offset as u32,
                a.first_instance,
            ],
            DrawCommand::ClusterTask(t) => [t.group_count_x, t.group_count_y, t.group_count_z, 0, 0],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshDraw {
    pub position: Vec3,
    pub scale: f32,
    pub orientation: Quat,
    pub command: DrawCommand,
}

/// Storage-buffer record, 64 bytes. `command` starts at byte 32 so the
/// buffer can be fed straight to indirect draws with a 64-byte stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuMeshDraw {
    pub position: [f32; 3],
    pub scale: f32,
    pub orientation: [f32; 4],
    pub command: [u32; 5],
    pub _pad: [u32; 3],
}

const _: () = assert!(std::mem::size_of::<GpuMeshDraw>() == 64);

impl GpuMeshDraw {
    pub const COMMAND_OFFSET: u64 = 32;
    pub const STRIDE: u32 = std::mem::size_of::<GpuMeshDraw>() as u32;
}

impl MeshDraw {
    pub fn to_gpu(&self) -> GpuMeshDraw {
        GpuMeshDraw {
            position: self.position.to_array(),
            scale: self.scale,
            orientation: self.orientation.to_array(),
            command: self.command.encode(),
            _pad: [0; 3],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        let proj = Mat4::perspective_rh(self.fov_y, aspect.max(1e-3), self.near, self.far);
        let view = Mat4::look_at_rh(self.position, self.target, Vec3::Y);
        proj * view
    }
}

/// Push constants shared by every stage, 96 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameConstants {
    pub view_projection: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    pub meshlet_count: u32,
    pub cone_culling: u32,
    pub _pad: [u32; 2],
}

const _: () = assert!(std::mem::size_of::<FrameConstants>() == 96);

impl FrameConstants {
    pub fn new(camera: &Camera, aspect: f32, meshlet_count: u32, cone_culling: bool) -> Self {
        FrameConstants {
            view_projection: camera.view_projection(aspect).to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).to_array(),
            meshlet_count,
            cone_culling: cone_culling as u32,
            _pad: [0; 2],
        }
    }
}

/// The single object batch: one mesh instanced `draws.len()` times.
#[derive(Clone, Debug)]
pub struct Scene {
    pub draws: Vec<MeshDraw>,
    pub camera: Camera,
    index_count: u32,
    meshlet_count: u32,
}

impl Scene {
    /// Lays `draw_count` copies of `mesh` out on a square grid in the XZ
    /// plane, varying scale and yaw per instance. Deterministic.
    pub fn grid(mesh: &Mesh, draw_count: u32, path: DrawPath) -> Scene {
        let extent = mesh.extent().max(1e-3);
        let spacing = extent * 2.5;
        let side = (draw_count as f32).sqrt().ceil().max(1.0) as u32;
        let half = (side as f32 - 1.0) * 0.5;

        let index_count = mesh.indices.len() as u32;
        let meshlet_count = mesh.meshlets.len() as u32;
        let draws = (0..draw_count)
            .map(|i| {
                let (col, row) = (i % side, i / side);
                let position = Vec3::new(
                    (col as f32 - half) * spacing,
                    0.0,
                    (row as f32 - half) * spacing,
                );
                let yaw = (i as f32 * 0.618_034).fract() * std::f32::consts::TAU;
                MeshDraw {
                    position,
                    scale: 0.8 + 0.4 * (i as f32 * 0.381_966).fract(),
                    orientation: Quat::from_rotation_y(yaw),
                    command: DrawCommand::for_path(path, index_count, meshlet_count, i),
                }
            })
            .collect();

        let reach = (half + 1.0) * spacing;
        let camera = Camera {
            position: Vec3::new(0.0, reach * 0.9, reach * 1.8),
            target: Vec3::ZERO,
            fov_y: 60f32.to_radians(),
            near: extent * 0.01,
            far: reach * 8.0,
        };
        Scene { draws, camera, index_count, meshlet_count }
    }

    /// Rewrites every command for `path`, keeping transforms.
    pub fn retarget(&mut self, path: DrawPath) {
        for (i, d) in self.draws.iter_mut().enumerate() {
            d.command = DrawCommand::for_path(path, self.index_count, self.meshlet_count, i as u32);
        }
    }

    pub fn meshlet_count(&self) -> u32 {
        self.meshlet_count
    }

    pub fn gpu_draws(&self) -> Vec<GpuMeshDraw> {
        self.draws.iter().map(MeshDraw::to_gpu).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{IngestOptions, MeshSource};

    fn tri_mesh() -> Mesh {
        let src = MeshSource {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            corners: vec![0, 1, 2],
            ..MeshSource::default()
        };
        Mesh::from_source(&src, IngestOptions { optimize: false, meshlets: true }).unwrap()
    }

    #[test]
    fn command_lands_at_byte_32() {
        let draw = MeshDraw {
            position: Vec3::new(1.0, 2.0, 3.0),
            scale: 2.0,
            orientation: Quat::IDENTITY,
            command: DrawCommand::Indexed(DrawIndexedArgs {
                index_count: 36,
                instance_count: 1,
                first_index: 0,
                vertex_offset: -1,
                first_instance: 7,
            }),
        };
        let gpu = draw.to_gpu();
        let bytes = bytemuck::bytes_of(&gpu);
        let at = GpuMeshDraw::COMMAND_OFFSET as usize;
        let words: &[u32] = bytemuck::cast_slice(&bytes[at..at + 20]);
        assert_eq!(words, &[36, 1, 0, u32::MAX, 7]);
        assert_eq!(bytemuck::cast_slice::<u8, f32>(&bytes[..16]), &[1.0, 2.0, 3.0, 2.0]);
    }

    #[test]
    fn cluster_command_dispatches_whole_groups() {
        let mesh = tri_mesh();
        let cmd = DrawCommand::for_path(
            DrawPath::Cluster,
            mesh.indices.len() as u32,
            mesh.meshlets.len() as u32,
            3,
        );
        assert_eq!(
            cmd,
            DrawCommand::ClusterTask(TaskArgs { group_count_x: 1, group_count_y: 1, group_count_z: 1 })
        );
        assert_eq!(cmd.encode(), [1, 1, 1, 0, 0]);
    }

    #[test]
    fn grid_is_deterministic_and_indexes_draws() {
        let mesh = tri_mesh();
        let a = Scene::grid(&mesh, 10, DrawPath::Indexed);
        let b = Scene::grid(&mesh, 10, DrawPath::Indexed);
        assert_eq!(a.draws, b.draws);
        assert_eq!(a.draws.len(), 10);
        for (i, d) in a.draws.iter().enumerate() {
            assert!(matches!(d.command, DrawCommand::Indexed(args) if args.first_instance == i as u32));
            assert!((0.8..=1.2).contains(&d.scale));
        }
    }

    #[test]
    fn retarget_swaps_commands_only() {
        let mesh = tri_mesh();
        let mut scene = Scene::grid(&mesh, 4, DrawPath::Indexed);
        let before = scene.draws.clone();
        scene.retarget(DrawPath::Cluster);
        for (old, new) in before.iter().zip(&scene.draws) {
            assert_eq!(old.position, new.position);
            assert!(matches!(new.command, DrawCommand::ClusterTask(t) if t.group_count_x == 1));
        }
    }

    #[test]
    fn frame_constants_carry_camera() {
        let scene = Scene::grid(&tri_mesh(), 1, DrawPath::Indexed);
        let fc = FrameConstants::new(&scene.camera, 16.0 / 9.0, 32, true);
        assert_eq!(fc.camera_position[3], 1.0);
        assert_eq!(fc.cone_culling, 1);
        let clip = scene.camera.view_projection(16.0 / 9.0) * scene.camera.target.extend(1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!((0.0..=1.0).contains(&ndc.z));
    }
}
