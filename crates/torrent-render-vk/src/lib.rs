use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use torrent_render::frame::{force_recreate, resize_if_necessary, FramePhase, ResizeOutcome};
use torrent_render::{
    upload_buffer, Capabilities, DrawPath, FrameConstants, FrameCycle, FrameStats, GpuMeshDraw, Mesh,
    RenderSettings, RenderSize, Renderer, Scene,
};
use tracing::{info, warn};

pub mod device;
pub mod resources;
pub mod shaders;
pub mod swapchain;

use device::DeviceContext;
use resources::{
    create_command_pool, create_device_buffer, create_scratch_buffer, image_barrier, pipeline_barrier, Buffer,
    Uploader,
};
use shaders::{create_graphics_pipeline, DescriptorInfo, Program, Shader};
use swapchain::{Swapchain, SwapchainFactory};

const MESH_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
const MESH_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));
const MESHLET_TASK: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/meshlet.task.spv"));
const MESHLET_MESH: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/meshlet.mesh.spv"));

const PUSH_SIZE: u32 = std::mem::size_of::<FrameConstants>() as u32;

struct Pipeline {
    program: Program,
    raw: vk::Pipeline,
}

impl Pipeline {
    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.raw, None);
        self.program.destroy(device);
    }
}

/// The task/mesh pipeline and the buffers only it reads.
struct ClusterPath {
    pipeline: Pipeline,
    task: Shader,
    mesh: Shader,
    meshlets: Buffer,
    meshlet_data: Buffer,
}

struct Buffers {
    vertices: Buffer,
    indices: Buffer,
    draws: Buffer,
    scratch: Buffer,
}

pub struct VkRenderer {
    swapchain: Swapchain,

    frame_pool: vk::CommandPool,
    frame_cmd: vk::CommandBuffer,
    upload_pool: vk::CommandPool,
    upload_cmd: vk::CommandBuffer,
    image_ready: vk::Semaphore,
    timestamps: Option<vk::QueryPool>,

    vert: Shader,
    frag: Shader,
    indexed: Pipeline,
    cluster: Option<ClusterPath>,
    buffers: Buffers,

    scene: Scene,
    index_count: u32,
    settings: RenderSettings,
    path: DrawPath,
    size: RenderSize,
    cycle: FrameCycle,
    stats: FrameStats,

    // Declared last: dropped after everything above is destroyed.
    ctx: DeviceContext,
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.ctx.device;

            // STRICT TEARDOWN ORDER:
            // 1) QUIESCE DEVICE
            d.device_wait_idle().ok();

            // 2) PIPELINES, THEN THEIR LAYOUTS AND TEMPLATES, THEN MODULES
            if let Some(c) = &self.cluster {
                c.pipeline.destroy(d);
                c.task.destroy(d);
                c.mesh.destroy(d);
                c.meshlets.destroy(d);
                c.meshlet_data.destroy(d);
            }
            self.indexed.destroy(d);
            self.vert.destroy(d);
            self.frag.destroy(d);

            // 3) BUFFERS
            self.buffers.vertices.destroy(d);
            self.buffers.indices.destroy(d);
            self.buffers.draws.destroy(d);
            self.buffers.scratch.destroy(d);

            // 4) SYNC, QUERIES, COMMAND POOLS (frees their buffers)
            if let Some(q) = self.timestamps {
                d.destroy_query_pool(q, None);
            }
            d.destroy_semaphore(self.image_ready, None);
            d.destroy_command_pool(self.frame_pool, None);
            d.destroy_command_pool(self.upload_pool, None);

            // 5) SWAPCHAIN AND ITS VIEWS, DEPTH, PRESENT SEMAPHORES
            self.swapchain.destroy(&self.ctx);

            // 6) DEVICE, SURFACE, INSTANCE: DeviceContext::drop
        }
    }
}

unsafe fn upload(
    ctx: &DeviceContext,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    dst: &Buffer,
    scratch: &mut Buffer,
    data: &[u8],
) -> Result<()> {
    let mut uploader = Uploader {
        device: &ctx.device,
        queue: ctx.queue,
        pool,
        cmd,
    };
    upload_buffer(&mut uploader, dst, scratch, data).context("staged upload")?;
    Ok(())
}

unsafe fn build_cluster_path(
    ctx: &DeviceContext,
    mesh: &Mesh,
    frag: &Shader,
    upload_pool: vk::CommandPool,
    upload_cmd: vk::CommandBuffer,
    scratch: &mut Buffer,
) -> Result<ClusterPath> {
    let task = Shader::load(&ctx.device, MESHLET_TASK)?;
    let mesh_shader = Shader::load(&ctx.device, MESHLET_MESH)?;
    let program = Program::new(&ctx.device, &[&task, &mesh_shader, frag], PUSH_SIZE)?;
    let raw = create_graphics_pipeline(
        &ctx.device,
        &program,
        &[&task, &mesh_shader, frag],
        ctx.surface_format.format,
        ctx.depth_format,
    )?;

    let meshlet_bytes: &[u8] = bytemuck::cast_slice(&mesh.meshlets);
    let data_bytes: &[u8] = bytemuck::cast_slice(&mesh.meshlet_data);
    let meshlets = create_device_buffer(
        &ctx.device,
        &ctx.memory,
        meshlet_bytes.len() as u64,
        vk::BufferUsageFlags::STORAGE_BUFFER,
    )?;
    let meshlet_data = create_device_buffer(
        &ctx.device,
        &ctx.memory,
        data_bytes.len() as u64,
        vk::BufferUsageFlags::STORAGE_BUFFER,
    )?;
    upload(ctx, upload_pool, upload_cmd, &meshlets, scratch, meshlet_bytes)?;
    upload(ctx, upload_pool, upload_cmd, &meshlet_data, scratch, data_bytes)?;

    Ok(ClusterPath {
        pipeline: Pipeline { program, raw },
        task,
        mesh: mesh_shader,
        meshlets,
        meshlet_data,
    })
}

unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    settings: RenderSettings,
    mesh: &Mesh,
) -> Result<VkRenderer> {
    // STRICT ORDER:
    // 1) Device context (instance, surface, device, capabilities)
    // 2) Swapchain, because pipelines need its color format
    // 3) Command pools, then buffers filled through the upload pool
    // 4) Programs and pipelines for each draw path the device supports
    let ctx = DeviceContext::new(window, display)?;
    let d = &ctx.device;

    let swapchain = SwapchainFactory { ctx: &ctx, vsync: settings.vsync, hint: size }.create_initial()?;

    let (frame_pool, frame_cmd) = create_command_pool(d, ctx.queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
    let (upload_pool, upload_cmd) = create_command_pool(d, ctx.queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
    let sem_ci = vk::SemaphoreCreateInfo {
        s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
        ..Default::default()
    };
    let image_ready = d.create_semaphore(&sem_ci, None).context("create_semaphore")?;

    let timestamps = if ctx.caps.timestamps {
        let qci = vk::QueryPoolCreateInfo {
            s_type: vk::StructureType::QUERY_POOL_CREATE_INFO,
            query_type: vk::QueryType::TIMESTAMP,
            query_count: 2,
            ..Default::default()
        };
        Some(d.create_query_pool(&qci, None).context("create_query_pool")?)
    } else {
        None
    };

    let cluster_ready = ctx.caps.cluster_culling && !mesh.meshlets.is_empty();
    let path = DrawPath::select(
        Capabilities { cluster_culling: cluster_ready, ..ctx.caps },
        settings.cluster_culling,
    );
    let draw_count = settings.draw_count.max(1);
    let scene = Scene::grid(mesh, draw_count, path);

    let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
    let draw_bytes = scene.gpu_draws();
    let draw_bytes: &[u8] = bytemuck::cast_slice(&draw_bytes);
    let largest = [
        vertex_bytes.len(),
        index_bytes.len(),
        draw_bytes.len(),
        std::mem::size_of_val(mesh.meshlets.as_slice()),
        std::mem::size_of_val(mesh.meshlet_data.as_slice()),
    ]
    .into_iter()
    .max()
    .unwrap_or(0);

    let mut buffers = Buffers {
        vertices: create_device_buffer(d, &ctx.memory, vertex_bytes.len() as u64, vk::BufferUsageFlags::STORAGE_BUFFER)?,
        indices: create_device_buffer(d, &ctx.memory, index_bytes.len() as u64, vk::BufferUsageFlags::INDEX_BUFFER)?,
        draws: create_device_buffer(
            d,
            &ctx.memory,
            draw_bytes.len() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
        )?,
        scratch: create_scratch_buffer(d, &ctx.memory, largest as u64)?,
    };
    upload(&ctx, upload_pool, upload_cmd, &buffers.vertices, &mut buffers.scratch, vertex_bytes)?;
    upload(&ctx, upload_pool, upload_cmd, &buffers.indices, &mut buffers.scratch, index_bytes)?;
    upload(&ctx, upload_pool, upload_cmd, &buffers.draws, &mut buffers.scratch, draw_bytes)?;

    let vert = Shader::load(d, MESH_VERT)?;
    let frag = Shader::load(d, MESH_FRAG)?;
    let program = Program::new(d, &[&vert, &frag], PUSH_SIZE)?;
    let raw = create_graphics_pipeline(d, &program, &[&vert, &frag], ctx.surface_format.format, ctx.depth_format)?;
    let indexed = Pipeline { program, raw };

    let cluster = if cluster_ready {
        Some(build_cluster_path(&ctx, mesh, &frag, upload_pool, upload_cmd, &mut buffers.scratch)?)
    } else {
        if ctx.caps.cluster_culling {
            warn!("mesh has no meshlets; cluster culling disabled");
        }
        None
    };

    info!(
        "renderer ready: {} draws, {} triangles, {} meshlets, path={}",
        draw_count,
        mesh.triangle_count(),
        mesh.meshlets.len(),
        path.name()
    );

    Ok(VkRenderer {
        swapchain,
        frame_pool,
        frame_cmd,
        upload_pool,
        upload_cmd,
        image_ready,
        timestamps,
        vert,
        frag,
        indexed,
        cluster,
        buffers,
        scene,
        index_count: mesh.indices.len() as u32,
        settings: RenderSettings { draw_count, ..settings },
        path,
        size,
        cycle: FrameCycle::default(),
        stats: FrameStats::default(),
        ctx,
    })
}

impl VkRenderer {
    unsafe fn recreate_swapchain(&mut self) -> Result<()> {
        let mut factory = SwapchainFactory { ctx: &self.ctx, vsync: self.settings.vsync, hint: self.size };
        if let ResizeOutcome::Recreated { from, to } = force_recreate(&mut factory, &mut self.swapchain)? {
            info!("swapchain recreated {}x{} -> {}x{}", from.width, from.height, to.width, to.height);
        }
        Ok(())
    }

    unsafe fn record(&self, image_index: usize) -> Result<()> {
        let d = &self.ctx.device;
        let cmd = self.frame_cmd;
        let sc = &self.swapchain;

        d.reset_command_pool(self.frame_pool, vk::CommandPoolResetFlags::empty())
            .context("reset_command_pool")?;
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &bi).context("begin_command_buffer")?;

        if let Some(q) = self.timestamps {
            d.cmd_reset_query_pool(cmd, q, 0, 2);
            d.cmd_write_timestamp2(cmd, vk::PipelineStageFlags2::TOP_OF_PIPE, q, 0);
        }

        let image = sc.images[image_index];
        pipeline_barrier(
            d,
            cmd,
            &[],
            &[
                image_barrier(
                    image,
                    vk::ImageAspectFlags::COLOR,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::NONE,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
                image_barrier(
                    sc.depth.raw,
                    vk::ImageAspectFlags::DEPTH,
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ),
            ],
        );

        let color_att = vk::RenderingAttachmentInfo {
            s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
            image_view: sc.views[image_index],
            image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: self.settings.clear_color },
            },
            ..Default::default()
        };
        let depth_att = vk::RenderingAttachmentInfo {
            s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
            image_view: sc.depth.view,
            image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            clear_value: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
            ..Default::default()
        };
        let area = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: sc.extent };
        let rendering = vk::RenderingInfo {
            s_type: vk::StructureType::RENDERING_INFO,
            render_area: area,
            layer_count: 1,
            color_attachment_count: 1,
            p_color_attachments: &color_att,
            p_depth_attachment: &depth_att,
            ..Default::default()
        };
        d.cmd_begin_rendering(cmd, &rendering);

        // Negative height flips Y so clip space matches a right-handed view
        let viewport = vk::Viewport {
            x: 0.0,
            y: sc.extent.height as f32,
            width: sc.extent.width as f32,
            height: -(sc.extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        d.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
        d.cmd_set_scissor(cmd, 0, std::slice::from_ref(&area));

        let aspect = RenderSize { width: sc.extent.width, height: sc.extent.height }.aspect();
        let constants = FrameConstants::new(
            &self.scene.camera,
            aspect,
            self.scene.meshlet_count(),
            self.settings.cone_culling,
        );
        let draw_count = self.scene.draws.len() as u32;
        let draws = DescriptorInfo::buffer(self.buffers.draws.descriptor());
        let vertices = DescriptorInfo::buffer(self.buffers.vertices.descriptor());

        match self.path {
            DrawPath::Indexed => {
                let p = &self.indexed;
                d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, p.raw);
                p.program.push_constants(d, cmd, &constants);
                let descriptors = p
                    .program
                    .bindings
                    .descriptors()
                    .bind(0, draws)
                    .bind(3, vertices)
                    .finish()?;
                p.program.push_descriptors(&self.ctx.push_descriptor, cmd, &descriptors)?;
                d.cmd_bind_index_buffer(cmd, self.buffers.indices.raw, 0, vk::IndexType::UINT32);
                if self.ctx.multi_draw_indirect {
                    d.cmd_draw_indexed_indirect(
                        cmd,
                        self.buffers.draws.raw,
                        GpuMeshDraw::COMMAND_OFFSET,
                        draw_count,
                        GpuMeshDraw::STRIDE,
                    );
                } else {
                    for i in 0..draw_count as u64 {
                        d.cmd_draw_indexed_indirect(
                            cmd,
                            self.buffers.draws.raw,
                            GpuMeshDraw::COMMAND_OFFSET + i * GpuMeshDraw::STRIDE as u64,
                            1,
                            GpuMeshDraw::STRIDE,
                        );
                    }
                }
            }
            DrawPath::Cluster => {
                let c = self
                    .cluster
                    .as_ref()
                    .ok_or_else(|| anyhow!("cluster path selected without a cluster pipeline"))?;
                let loader = self
                    .ctx
                    .mesh_shader
                    .as_ref()
                    .ok_or_else(|| anyhow!("mesh shader loader missing"))?;
                let p = &c.pipeline;
                d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, p.raw);
                p.program.push_constants(d, cmd, &constants);
                let descriptors = p
                    .program
                    .bindings
                    .descriptors()
                    .bind(0, draws)
                    .bind(1, DescriptorInfo::buffer(c.meshlets.descriptor()))
                    .bind(2, DescriptorInfo::buffer(c.meshlet_data.descriptor()))
                    .bind(3, vertices)
                    .finish()?;
                p.program.push_descriptors(&self.ctx.push_descriptor, cmd, &descriptors)?;
                loader.cmd_draw_mesh_tasks_indirect(
                    cmd,
                    self.buffers.draws.raw,
                    GpuMeshDraw::COMMAND_OFFSET,
                    draw_count,
                    GpuMeshDraw::STRIDE,
                );
            }
        }

        d.cmd_end_rendering(cmd);

        pipeline_barrier(
            d,
            cmd,
            &[],
            &[image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            )],
        );

        if let Some(q) = self.timestamps {
            d.cmd_write_timestamp2(cmd, vk::PipelineStageFlags2::BOTTOM_OF_PIPE, q, 1);
        }

        d.end_command_buffer(cmd).context("end_command_buffer")?;
        Ok(())
    }

    unsafe fn gpu_time_ms(&self) -> Result<Option<f64>> {
        let Some(q) = self.timestamps else {
            return Ok(None);
        };
        let mut ticks = [0u64; 2];
        self.ctx
            .device
            .get_query_pool_results(q, 0, &mut ticks, vk::QueryResultFlags::TYPE_64)
            .context("get_query_pool_results")?;
        let ns = ticks[1].wrapping_sub(ticks[0]) as f64 * self.ctx.timestamp_period as f64;
        Ok(Some(ns / 1.0e6))
    }

    /// One full frame, drained before returning. Returns early without
    /// touching the cycle when the surface is minimized or out of date.
    unsafe fn draw_frame(&mut self) -> Result<()> {
        let start = Instant::now();

        let mut factory = SwapchainFactory { ctx: &self.ctx, vsync: self.settings.vsync, hint: self.size };
        match resize_if_necessary(&mut factory, &mut self.swapchain)? {
            ResizeOutcome::Minimized => return Ok(()),
            ResizeOutcome::Recreated { from, to } => {
                info!("resized {}x{} -> {}x{}", from.width, from.height, to.width, to.height)
            }
            ResizeOutcome::Unchanged => {}
        }

        let (image_index, acquire_suboptimal) = match self.ctx.swapchain_loader.acquire_next_image(
            self.swapchain.raw,
            u64::MAX,
            self.image_ready,
            vk::Fence::null(),
        ) {
            Ok(r) => r,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return self.recreate_swapchain(),
            Err(e) => return Err(anyhow!("acquire_next_image: {e:?}")),
        };
        self.cycle.advance(FramePhase::Acquired)?;

        self.cycle.advance(FramePhase::Recording)?;
        self.record(image_index as usize)?;

        let render_done = self.swapchain.render_done[image_index as usize];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.image_ready,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &self.frame_cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &render_done,
            ..Default::default()
        };
        self.ctx
            .device
            .queue_submit(self.ctx.queue, std::slice::from_ref(&si), vk::Fence::null())
            .context("queue_submit")?;
        self.cycle.advance(FramePhase::Submitted)?;
        let cpu_ms = start.elapsed().as_secs_f64() * 1.0e3;

        let pi = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &render_done,
            swapchain_count: 1,
            p_swapchains: &self.swapchain.raw,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let stale = match self.ctx.swapchain_loader.queue_present(self.ctx.queue, &pi) {
            Ok(suboptimal) => suboptimal || acquire_suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(anyhow!("queue_present: {e:?}")),
        };
        self.cycle.advance(FramePhase::Presented)?;

        // One frame in flight: drain before touching anything the frame used
        self.ctx
            .device
            .device_wait_idle()
            .context("device_wait_idle")?;
        let gpu_ms = self.gpu_time_ms()?;
        self.cycle.advance(FramePhase::Idle)?;

        self.stats = FrameStats { cpu_ms, gpu_ms, frames: self.cycle.completed() };

        if stale {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    unsafe fn upload_draws(&mut self) -> Result<()> {
        let draws = self.scene.gpu_draws();
        upload(
            &self.ctx,
            self.upload_pool,
            self.upload_cmd,
            &self.buffers.draws,
            &mut self.buffers.scratch,
            bytemuck::cast_slice(&draws),
        )
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: RenderSettings,
        mesh: &Mesh,
    ) -> Result<Self> {
        unsafe { build_renderer(window, display, size, settings, mesh) }
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        // Picked up by the check at the top of the next frame
        self.size = size;
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        let result = unsafe { self.draw_frame() };
        if result.is_err() {
            unsafe { self.ctx.device.device_wait_idle().ok() };
            self.cycle.abort();
        }
        result
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.settings.clear_color = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        if self.settings.vsync == on {
            return;
        }
        self.settings.vsync = on;
        if let Err(e) = unsafe { self.recreate_swapchain() } {
            warn!("vsync change deferred: {e:#}");
        }
    }

    fn set_cluster_culling(&mut self, on: bool) -> Result<DrawPath> {
        let caps = Capabilities {
            cluster_culling: self.cluster.is_some(),
            ..self.ctx.caps
        };
        let path = DrawPath::select(caps, on);
        if on && path == DrawPath::Indexed {
            info!("cluster culling unavailable on this device; staying on indexed path");
        }
        if path != self.path {
            self.settings.cluster_culling = on;
            self.scene.retarget(path);
            // Frames are drained on return, so the draw buffer is not in use
            unsafe { self.upload_draws()? };
            self.path = path;
            info!("draw path: {} ({} indices per draw)", path.name(), self.index_count);
        }
        Ok(self.path)
    }

    fn set_cone_culling(&mut self, on: bool) {
        self.settings.cone_culling = on;
    }

    fn capabilities(&self) -> Capabilities {
        self.ctx.caps
    }

    fn draw_path(&self) -> DrawPath {
        self.path
    }

    fn cone_culling(&self) -> bool {
        self.settings.cone_culling
    }

    fn last_frame(&self) -> FrameStats {
        self.stats
    }
}
