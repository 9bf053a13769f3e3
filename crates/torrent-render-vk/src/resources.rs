use std::ptr;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use torrent_render::upload::{DeviceBuffer, StagingBuffer, TransferContext};

/// A buffer plus its dedicated allocation. Host-visible buffers stay mapped
/// for their whole life.
pub struct Buffer {
    pub raw: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: *mut u8,
}

impl Buffer {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // freeing a mapped allocation implicitly unmaps it
        device.destroy_buffer(self.raw, None);
        device.free_memory(self.memory, None);
    }

    pub fn descriptor(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.raw,
            offset: 0,
            range: self.size,
        }
    }
}

impl DeviceBuffer for Buffer {
    fn capacity(&self) -> u64 {
        self.size
    }
}

impl StagingBuffer for Buffer {
    fn capacity(&self) -> u64 {
        self.size
    }

    fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        if self.mapped.is_null() {
            return None;
        }
        // SAFETY: the mapping covers `size` bytes and lives as long as `self`
        Some(unsafe { std::slice::from_raw_parts_mut(self.mapped, self.size as usize) })
    }
}

/// First memory type allowed by `type_bits` that has every flag in `required`.
pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

unsafe fn allocate(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    req: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = select_memory_type(props, req.memory_type_bits, flags)
        .ok_or_else(|| anyhow!("no memory type with {flags:?}"))?;
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index,
        ..Default::default()
    };
    device.allocate_memory(&mai, None).context("allocate_memory")
}

pub unsafe fn create_buffer(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    flags: vk::MemoryPropertyFlags,
) -> Result<Buffer> {
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let raw = device.create_buffer(&bci, None).context("create_buffer")?;
    let req = device.get_buffer_memory_requirements(raw);
    let memory = match allocate(device, props, req, flags) {
        Ok(m) => m,
        Err(e) => {
            device.destroy_buffer(raw, None);
            return Err(e);
        }
    };
    device
        .bind_buffer_memory(raw, memory, 0)
        .context("bind_buffer_memory")?;

    let mapped = if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        device
            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
            .context("map_memory")? as *mut u8
    } else {
        ptr::null_mut()
    };

    Ok(Buffer { raw, memory, size, mapped })
}

/// Device-local storage buffer that can also be a copy target.
pub unsafe fn create_device_buffer(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    create_buffer(
        device,
        props,
        size.max(4),
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
}

pub unsafe fn create_scratch_buffer(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
) -> Result<Buffer> {
    create_buffer(
        device,
        props,
        size.max(4),
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
}

pub struct Image {
    pub raw: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

impl Image {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.raw, None);
        device.free_memory(self.memory, None);
    }
}

pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: subresource_range(aspect),
        ..Default::default()
    };
    device
        .create_image_view(&view_ci, None)
        .context("create_image_view")
}

/// Device-local 2D image with a single mip and a matching view.
pub unsafe fn create_image(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
) -> Result<Image> {
    let img_ci = vk::ImageCreateInfo {
        s_type: vk::StructureType::IMAGE_CREATE_INFO,
        image_type: vk::ImageType::TYPE_2D,
        format,
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    };
    let raw = device.create_image(&img_ci, None).context("create_image")?;
    let req = device.get_image_memory_requirements(raw);
    let memory = allocate(device, props, req, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
    device
        .bind_image_memory(raw, memory, 0)
        .context("bind_image_memory")?;
    let view = create_image_view(device, raw, format, aspect)?;
    Ok(Image { raw, memory, view, format })
}

#[allow(clippy::too_many_arguments)]
pub fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask: src_stage,
        src_access_mask: src_access,
        dst_stage_mask: dst_stage,
        dst_access_mask: dst_access,
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: subresource_range(aspect),
        ..Default::default()
    }
}

pub fn buffer_barrier(
    buffer: vk::Buffer,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2 {
        s_type: vk::StructureType::BUFFER_MEMORY_BARRIER_2,
        src_stage_mask: src_stage,
        src_access_mask: src_access,
        dst_stage_mask: dst_stage,
        dst_access_mask: dst_access,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        buffer,
        offset: 0,
        size: vk::WHOLE_SIZE,
        ..Default::default()
    }
}

pub unsafe fn pipeline_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffers: &[vk::BufferMemoryBarrier2],
    images: &[vk::ImageMemoryBarrier2],
) {
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        buffer_memory_barrier_count: buffers.len() as u32,
        p_buffer_memory_barriers: buffers.as_ptr(),
        image_memory_barrier_count: images.len() as u32,
        p_image_memory_barriers: images.as_ptr(),
        ..Default::default()
    };
    device.cmd_pipeline_barrier2(cmd, &dep);
}

pub unsafe fn create_command_pool(
    device: &ash::Device,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: queue_family,
        flags,
        ..Default::default()
    };
    let pool = device
        .create_command_pool(&pool_info, None)
        .context("create_command_pool")?;
    let alloc_info = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = device
        .allocate_command_buffers(&alloc_info)
        .context("allocate_command_buffers")?[0];
    Ok((pool, cmd))
}

/// Records staged copies on a dedicated pool and drains the device after
/// every submit.
pub struct Uploader<'a> {
    pub device: &'a ash::Device,
    pub queue: vk::Queue,
    pub pool: vk::CommandPool,
    pub cmd: vk::CommandBuffer,
}

impl TransferContext for Uploader<'_> {
    type Buffer = Buffer;
    type Staging = Buffer;
    type Error = vk::Result;

    fn begin(&mut self) -> Result<(), vk::Result> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            self.device.begin_command_buffer(self.cmd, &bi)
        }
    }

    fn copy(&mut self, src: &Buffer, dst: &Buffer, size: u64) -> Result<(), vk::Result> {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(self.cmd, src.raw, dst.raw, std::slice::from_ref(&region));
        }
        Ok(())
    }

    fn visibility_barrier(&mut self, dst: &Buffer) -> Result<(), vk::Result> {
        let barrier = buffer_barrier(
            dst.raw,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::SHADER_STORAGE_READ
                | vk::AccessFlags2::INDEX_READ
                | vk::AccessFlags2::INDIRECT_COMMAND_READ,
        );
        unsafe { pipeline_barrier(self.device, self.cmd, &[barrier], &[]) };
        Ok(())
    }

    fn submit_and_wait_idle(&mut self) -> Result<(), vk::Result> {
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &self.cmd,
            ..Default::default()
        };
        unsafe {
            self.device.end_command_buffer(self.cmd)?;
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&si), vk::Fence::null())?;
            self.device.device_wait_idle()
        }
    }
}
