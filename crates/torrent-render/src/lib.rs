// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod binding;
pub mod draw;
pub mod frame;
pub mod mesh;
pub mod meshlet;
pub mod reflect;
pub mod upload;
pub mod vertex;

pub use binding::{BindingError, BindingLayout, DescriptorArray, ShaderStages, SlotBinding, TemplateEntry};
pub use draw::{Camera, DrawCommand, DrawIndexedArgs, FrameConstants, GpuMeshDraw, MeshDraw, Scene, TaskArgs};
pub use frame::{
    force_recreate, resize_if_necessary, Capabilities, DeviceIdle, DrawPath, FrameCycle, FrameError, FramePhase,
    PresentSurface, ResizeOutcome, SwapchainInfo,
};
pub use mesh::{IngestOptions, Mesh, MeshError, MeshSource};
pub use meshlet::{build_meshlets, Meshlet, MeshletSet};
pub use reflect::{reflect, reflect_bytes, ReflectError, ShaderInterface, ShaderStage};
pub use upload::{upload_buffer, DeviceBuffer, StagingBuffer, TransferContext, UploadError};
pub use vertex::Vertex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }
}

/// Knobs read once from config; the culling toggles can change at runtime.
#[derive(Clone, Copy, Debug)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub cluster_culling: bool,
    pub cone_culling: bool,
    pub draw_count: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: true,
            cluster_culling: true,
            cone_culling: true,
            draw_count: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStats {
    pub cpu_ms: f64,
    /// `None` when the device has no timestamp support.
    pub gpu_ms: Option<f64>,
    pub frames: u64,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: RenderSettings,
        mesh: &Mesh,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}

    /// Requests the cluster path; returns the path actually in use.
    fn set_cluster_culling(&mut self, on: bool) -> Result<DrawPath>;
    fn set_cone_culling(&mut self, on: bool);
    fn capabilities(&self) -> Capabilities;
    fn draw_path(&self) -> DrawPath;
    fn cone_culling(&self) -> bool;
    fn last_frame(&self) -> FrameStats;
}
