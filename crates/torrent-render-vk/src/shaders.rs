use std::ffi::c_void;
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use ash::khr::push_descriptor;
use ash::util::read_spv;
use ash::vk;
use torrent_render::reflect::reflect;
use torrent_render::{BindingLayout, DescriptorArray, ShaderInterface, ShaderStages};

pub struct Shader {
    pub module: vk::ShaderModule,
    pub interface: ShaderInterface,
}

impl Shader {
    /// Reflects `bytes` before handing them to the driver, so a malformed
    /// module never reaches `vkCreateShaderModule`.
    pub unsafe fn load(device: &ash::Device, bytes: &[u8]) -> Result<Shader> {
        let code = read_spv(&mut Cursor::new(bytes)).context("read_spv")?;
        let interface = reflect(&code).context("reflect shader")?;
        let ci = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            p_code: code.as_ptr(),
            code_size: code.len() * 4,
            ..Default::default()
        };
        let module = device
            .create_shader_module(&ci, None)
            .context("create_shader_module")?;
        Ok(Shader { module, interface })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_shader_module(self.module, None);
    }

    fn stage(&self) -> vk::ShaderStageFlags {
        stage_flags(self.interface.stage.flag())
    }
}

pub fn stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut out = vk::ShaderStageFlags::empty();
    for (flag, vk_flag) in [
        (ShaderStages::VERTEX, vk::ShaderStageFlags::VERTEX),
        (ShaderStages::FRAGMENT, vk::ShaderStageFlags::FRAGMENT),
        (ShaderStages::COMPUTE, vk::ShaderStageFlags::COMPUTE),
        (ShaderStages::TASK, vk::ShaderStageFlags::TASK_EXT),
        (ShaderStages::MESH, vk::ShaderStageFlags::MESH_EXT),
    ] {
        if stages.contains(flag) {
            out |= vk_flag;
        }
    }
    out
}

/// One element of the dense array fed to an update template.
#[repr(C)]
#[derive(Clone, Copy)]
pub union DescriptorInfo {
    pub buffer: vk::DescriptorBufferInfo,
    pub image: vk::DescriptorImageInfo,
}

impl DescriptorInfo {
    pub fn buffer(info: vk::DescriptorBufferInfo) -> Self {
        DescriptorInfo { buffer: info }
    }
}

/// Set layout, pipeline layout and push-descriptor template derived from
/// the reflected interfaces of one pipeline's shaders.
pub struct Program {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    /// Null when the program binds no buffers.
    pub template: vk::DescriptorUpdateTemplate,
    pub push_stages: vk::ShaderStageFlags,
    pub push_size: u32,
    pub bindings: BindingLayout,
}

impl Program {
    pub unsafe fn new(device: &ash::Device, shaders: &[&Shader], push_size: u32) -> Result<Program> {
        let interfaces: Vec<&ShaderInterface> = shaders.iter().map(|s| &s.interface).collect();
        let bindings = BindingLayout::from_shaders(&interfaces);

        let set_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .slots()
            .iter()
            .map(|slot| vk::DescriptorSetLayoutBinding {
                binding: slot.binding,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
                stage_flags: stage_flags(slot.stages),
                ..Default::default()
            })
            .collect();
        let set_ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            flags: vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR,
            binding_count: set_bindings.len() as u32,
            p_bindings: set_bindings.as_ptr(),
            ..Default::default()
        };
        let set_layout = device
            .create_descriptor_set_layout(&set_ci, None)
            .context("create_descriptor_set_layout")?;

        let push_stages = stage_flags(bindings.push_constant_stages());
        let push_range = vk::PushConstantRange {
            stage_flags: push_stages,
            offset: 0,
            size: push_size,
        };
        let has_push = !push_stages.is_empty() && push_size > 0;
        let layout_ci = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            push_constant_range_count: has_push as u32,
            p_push_constant_ranges: &push_range,
            ..Default::default()
        };
        let layout = device
            .create_pipeline_layout(&layout_ci, None)
            .context("create_pipeline_layout")?;

        let stride = std::mem::size_of::<DescriptorInfo>();
        let entries: Vec<vk::DescriptorUpdateTemplateEntry> = bindings
            .template_entries()
            .map(|e| vk::DescriptorUpdateTemplateEntry {
                dst_binding: e.binding,
                dst_array_element: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                offset: e.index * stride,
                stride,
            })
            .collect();
        let template = if entries.is_empty() {
            vk::DescriptorUpdateTemplate::null()
        } else {
            let bind_point = if bindings.stages().contains(ShaderStages::COMPUTE) {
                vk::PipelineBindPoint::COMPUTE
            } else {
                vk::PipelineBindPoint::GRAPHICS
            };
            let tci = vk::DescriptorUpdateTemplateCreateInfo {
                s_type: vk::StructureType::DESCRIPTOR_UPDATE_TEMPLATE_CREATE_INFO,
                descriptor_update_entry_count: entries.len() as u32,
                p_descriptor_update_entries: entries.as_ptr(),
                template_type: vk::DescriptorUpdateTemplateType::PUSH_DESCRIPTORS_KHR,
                descriptor_set_layout: set_layout,
                pipeline_bind_point: bind_point,
                pipeline_layout: layout,
                set: 0,
                ..Default::default()
            };
            device
                .create_descriptor_update_template(&tci, None)
                .context("create_descriptor_update_template")?
        };

        Ok(Program {
            set_layout,
            layout,
            template,
            push_stages,
            push_size: if has_push { push_size } else { 0 },
            bindings,
        })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        if self.template != vk::DescriptorUpdateTemplate::null() {
            device.destroy_descriptor_update_template(self.template, None);
        }
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }

    /// Pushes set 0 from `descriptors`, which must have been built against
    /// this program's layout.
    pub unsafe fn push_descriptors(
        &self,
        loader: &push_descriptor::Device,
        cmd: vk::CommandBuffer,
        descriptors: &DescriptorArray<DescriptorInfo>,
    ) -> Result<()> {
        let items = descriptors.check(&self.bindings)?;
        if items.is_empty() {
            return Ok(());
        }
        loader.cmd_push_descriptor_set_with_template(
            cmd,
            self.template,
            self.layout,
            0,
            items.as_ptr() as *const c_void,
        );
        Ok(())
    }

    pub unsafe fn push_constants<T: bytemuck::Pod>(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        data: &T,
    ) {
        if self.push_size == 0 {
            return;
        }
        let bytes = bytemuck::bytes_of(data);
        let len = bytes.len().min(self.push_size as usize);
        device.cmd_push_constants(cmd, self.layout, self.push_stages, 0, &bytes[..len]);
    }
}

/// Graphics pipeline for dynamic rendering. Mesh pipelines carry no vertex
/// input; vertices are pulled from storage buffers in every path.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    program: &Program,
    shaders: &[&Shader],
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::Pipeline> {
    // STRICT: color_attachment_formats MUST match the swapchain image format.
    let entry = c"main";
    let stages: Vec<vk::PipelineShaderStageCreateInfo> = shaders
        .iter()
        .map(|s| vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: s.stage(),
            module: s.module,
            p_name: entry.as_ptr(),
            ..Default::default()
        })
        .collect();
    let mesh_pipeline = stages
        .iter()
        .any(|s| s.stage == vk::ShaderStageFlags::MESH_EXT);

    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: vk::TRUE,
        depth_write_enable: vk::TRUE,
        depth_compare_op: vk::CompareOp::LESS,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };
    let rendering = vk::PipelineRenderingCreateInfo {
        s_type: vk::StructureType::PIPELINE_RENDERING_CREATE_INFO,
        color_attachment_count: 1,
        p_color_attachment_formats: &color_format,
        depth_attachment_format: depth_format,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        p_next: (&rendering as *const _) as *const _,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: if mesh_pipeline { std::ptr::null() } else { &vertex_input },
        p_input_assembly_state: if mesh_pipeline { std::ptr::null() } else { &input_assembly },
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout: program.layout,
        ..Default::default()
    };

    let pipelines = device
        .create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
        .map_err(|(_, err)| anyhow!("create_graphics_pipelines failed: {err:?}"))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_bits_map_one_to_one() {
        let flags = stage_flags(ShaderStages::TASK | ShaderStages::MESH | ShaderStages::FRAGMENT);
        assert_eq!(
            flags,
            vk::ShaderStageFlags::TASK_EXT | vk::ShaderStageFlags::MESH_EXT | vk::ShaderStageFlags::FRAGMENT
        );
        assert!(stage_flags(ShaderStages::empty()).is_empty());
    }

    #[test]
    fn descriptor_info_has_room_for_either_kind() {
        let size = std::mem::size_of::<DescriptorInfo>();
        assert!(size >= std::mem::size_of::<vk::DescriptorBufferInfo>());
        assert!(size >= std::mem::size_of::<vk::DescriptorImageInfo>());
    }

    #[test]
    fn shipped_shaders_reflect() {
        let task = reflect_bytes_of(include_bytes!(concat!(env!("OUT_DIR"), "/meshlet.task.spv")));
        let mesh = reflect_bytes_of(include_bytes!(concat!(env!("OUT_DIR"), "/meshlet.mesh.spv")));
        let vert = reflect_bytes_of(include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv")));
        assert_eq!(task.storage_buffers, 0b0011);
        assert_eq!(mesh.storage_buffers, 0b1111);
        assert_eq!(vert.storage_buffers, 0b1001);
        assert!(task.push_constants && mesh.push_constants && vert.push_constants);
    }

    fn reflect_bytes_of(bytes: &[u8]) -> ShaderInterface {
        torrent_render::reflect_bytes(bytes).unwrap()
    }
}
