use std::ffi::CStr;

use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::ext::mesh_shader;
use ash::khr::{push_descriptor, surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use torrent_render::Capabilities;
use tracing::{debug, error, info, warn};

#[cfg(debug_assertions)]
type DebugState = Option<vk::DebugUtilsMessengerEXT>;
#[cfg(not(debug_assertions))]
type DebugState = ();

/// Everything that lives for the whole renderer: instance, surface, device,
/// queue, extension loaders and what was learned about the GPU.
pub struct DeviceContext {
    pub entry: Entry,
    pub instance: Instance,
    debug: DebugState,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub swapchain_loader: swapchain::Device,
    pub push_descriptor: push_descriptor::Device,
    pub mesh_shader: Option<mesh_shader::Device>,

    pub caps: Capabilities,
    pub multi_draw_indirect: bool,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub depth_format: vk::Format,
}

// STRICT TEARDOWN ORDER:
// - Everything created from the device is gone before this runs
// - Device, then debug messenger, then surface, instance last
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            destroy_debug_messenger(&self.entry, &self.instance, self.debug);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance, enabled: bool) -> Result<DebugState> {
    if !enabled {
        return Ok(None);
    }
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    Ok(Some(
        loader
            .create_debug_utils_messenger(&ci, None)
            .context("create_debug_utils_messenger")?,
    ))
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance, _enabled: bool) -> Result<DebugState> {
    Ok(())
}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(entry: &Entry, instance: &Instance, dbg: DebugState) {
    if let Some(messenger) = dbg {
        ext_debug::Instance::new(entry, instance).destroy_debug_utils_messenger(messenger, None);
    }
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_entry: &Entry, _instance: &Instance, _dbg: DebugState) {}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Returns the instance and whether validation ended up enabled.
unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<(Instance, bool)> {
    let app = c"Torrent";

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let mut ext_vec = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();

    // Validation only in debug builds, and only if the layer is installed.
    let validation = cfg!(debug_assertions)
        && entry
            .enumerate_instance_layer_properties()
            .unwrap_or_default()
            .iter()
            .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
    if validation {
        ext_vec.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layers = [VALIDATION_LAYER.as_ptr()];

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_vec.len() as u32,
        pp_enabled_extension_names: ext_vec.as_ptr(),
        enabled_layer_count: if validation { 1 } else { 0 },
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    let instance = entry
        .create_instance(&create_info, None)
        .context("create_instance")?;
    Ok((instance, validation))
}

struct Candidate {
    phys: vk::PhysicalDevice,
    queue_family: u32,
    name: String,
    score: u32,
    mesh_shading: bool,
    multi_draw_indirect: bool,
    timestamps: bool,
    timestamp_period: f32,
}

unsafe fn has_extension(instance: &Instance, phys: vk::PhysicalDevice, name: &CStr) -> bool {
    instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == name)
}

/// Vulkan 1.3 with push descriptors, a graphics queue that can present,
/// and first-instance indirect draws. Discrete GPUs win ties.
unsafe fn probe_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Option<Candidate> {
    let props = instance.get_physical_device_properties(phys);
    let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy().into_owned();

    let api = props.api_version;
    if vk::api_version_major(api) == 1 && vk::api_version_minor(api) < 3 {
        info!("skipping {name}: Vulkan 1.3 required");
        return None;
    }
    if !has_extension(instance, phys, swapchain::NAME) || !has_extension(instance, phys, push_descriptor::NAME) {
        info!("skipping {name}: missing swapchain or push descriptor support");
        return None;
    }

    let features = instance.get_physical_device_features(phys);
    if features.draw_indirect_first_instance != vk::TRUE {
        info!("skipping {name}: drawIndirectFirstInstance unsupported");
        return None;
    }

    let qprops = instance.get_physical_device_queue_family_properties(phys);
    let (queue_family, qfam) = qprops.iter().enumerate().find(|(i, q)| {
        q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && surface_loader
                .get_physical_device_surface_support(phys, *i as u32, surface)
                .unwrap_or(false)
    })?;

    let mut mesh_feats = vk::PhysicalDeviceMeshShaderFeaturesEXT {
        s_type: vk::StructureType::PHYSICAL_DEVICE_MESH_SHADER_FEATURES_EXT,
        ..Default::default()
    };
    let mut feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        ..Default::default()
    };
    let has_mesh_ext = has_extension(instance, phys, mesh_shader::NAME);
    if has_mesh_ext {
        feats2.p_next = (&mut mesh_feats) as *mut _ as *mut _;
        instance.get_physical_device_features2(phys, &mut feats2);
    }
    let multi_draw_indirect = features.multi_draw_indirect == vk::TRUE;
    // the task stage reads DrawIndex, so every draw must be in one call
    let mesh_shading = has_mesh_ext
        && mesh_feats.task_shader == vk::TRUE
        && mesh_feats.mesh_shader == vk::TRUE
        && multi_draw_indirect;

    let timestamps = qfam.timestamp_valid_bits > 0;

    let score = match props.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    };

    Some(Candidate {
        phys,
        queue_family: queue_family as u32,
        name,
        score,
        mesh_shading,
        multi_draw_indirect,
        timestamps,
        timestamp_period: props.limits.timestamp_period,
    })
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .ok_or_else(|| anyhow!("surface reports no formats"))
}

unsafe fn pick_depth_format(instance: &Instance, phys: vk::PhysicalDevice) -> vk::Format {
    // Depth-only formats so barriers never need the stencil aspect
    let candidates = [
        vk::Format::D32_SFLOAT,
        vk::Format::X8_D24_UNORM_PACK32,
        vk::Format::D16_UNORM,
    ];
    for &fmt in &candidates {
        let props = instance.get_physical_device_format_properties(phys, fmt);
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return fmt;
        }
    }
    vk::Format::D16_UNORM // mandatory depth attachment format
}

impl DeviceContext {
    pub unsafe fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        // STRICT ORDER:
        // 1) Instance (WSI + optional debug)
        // 2) Surface from this instance
        // 3) Physical device chosen against this surface
        // 4) Device with the features that device actually has
        let dh = display.display_handle().map_err(|e| anyhow!("{e}"))?.as_raw();
        let wh = window.window_handle().map_err(|e| anyhow!("{e}"))?.as_raw();

        let entry = Entry::linked();
        let (instance, validation) = create_instance(&entry, dh)?;
        let debug = create_debug_messenger(&entry, &instance, validation)?;

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
            .context("ash_window::create_surface")?;

        let mut candidates: Vec<Candidate> = instance
            .enumerate_physical_devices()
            .context("enumerate_physical_devices")?
            .into_iter()
            .filter_map(|p| probe_device(&instance, &surface_loader, surface, p))
            .collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(c.score));
        let chosen = candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no Vulkan 1.3 device with push descriptors and presentation"))?;

        let caps = Capabilities {
            cluster_culling: chosen.mesh_shading,
            timestamps: chosen.timestamps,
        };
        info!(
            "GPU: {} (cluster culling: {}, timestamps: {}, multi-draw indirect: {})",
            chosen.name, caps.cluster_culling, caps.timestamps, chosen.multi_draw_indirect
        );

        let device = create_device(&instance, &chosen)?;
        let queue = device.get_device_queue(chosen.queue_family, 0);

        let formats = surface_loader
            .get_physical_device_surface_formats(chosen.phys, surface)
            .context("get_physical_device_surface_formats")?;
        let surface_format = choose_surface_format(&formats)?;
        let depth_format = pick_depth_format(&instance, chosen.phys);
        let memory = instance.get_physical_device_memory_properties(chosen.phys);

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let push_descriptor = push_descriptor::Device::new(&instance, &device);
        let mesh_shader = caps
            .cluster_culling
            .then(|| mesh_shader::Device::new(&instance, &device));

        Ok(DeviceContext {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys: chosen.phys,
            device,
            queue_family: chosen.queue_family,
            queue,
            swapchain_loader,
            push_descriptor,
            mesh_shader,
            caps,
            multi_draw_indirect: chosen.multi_draw_indirect,
            memory,
            timestamp_period: chosen.timestamp_period,
            surface_format,
            depth_format,
        })
    }
}

unsafe fn create_device(instance: &Instance, chosen: &Candidate) -> Result<ash::Device> {
    // STRICT ORDER (feature pNext chain):
    // feats2 -> feats11 -> feats13 [-> mesh_feats]
    // Every struct must outlive create_device.
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: chosen.queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let mut device_exts = vec![swapchain::NAME.as_ptr(), push_descriptor::NAME.as_ptr()];
    if chosen.mesh_shading {
        device_exts.push(mesh_shader::NAME.as_ptr());
    }

    let mut mesh_feats = vk::PhysicalDeviceMeshShaderFeaturesEXT {
        s_type: vk::StructureType::PHYSICAL_DEVICE_MESH_SHADER_FEATURES_EXT,
        task_shader: vk::TRUE,
        mesh_shader: vk::TRUE,
        ..Default::default()
    };
    let mut feats13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        synchronization2: vk::TRUE,
        dynamic_rendering: vk::TRUE,
        ..Default::default()
    };
    if chosen.mesh_shading {
        feats13.p_next = (&mut mesh_feats) as *mut _ as *mut _;
    }
    let mut feats11 = vk::PhysicalDeviceVulkan11Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_1_FEATURES,
        shader_draw_parameters: vk::TRUE,
        p_next: (&mut feats13) as *mut _ as *mut _,
        ..Default::default()
    };
    let feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        p_next: (&mut feats11) as *mut _ as *mut _,
        features: vk::PhysicalDeviceFeatures {
            multi_draw_indirect: chosen.multi_draw_indirect as vk::Bool32,
            draw_indirect_first_instance: vk::TRUE,
            ..Default::default()
        },
        ..Default::default()
    };

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&feats2) as *const _ as *const _,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    instance
        .create_device(chosen.phys, &dinfo, None)
        .context("create_device")
}
