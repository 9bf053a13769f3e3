use anyhow::{Context, Result};
use ash::vk;
use torrent_render::frame::{DeviceIdle, PresentSurface, SwapchainInfo};
use torrent_render::RenderSize;
use tracing::info;

use crate::device::DeviceContext;
use crate::resources::{create_image, create_image_view, Image};

/// Swapchain plus everything sized to it. `render_done` has one semaphore
/// per image so a semaphore is never re-signaled while a present on the same
/// image may still be waiting on it.
pub struct Swapchain {
    pub raw: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub depth: Image,
    pub render_done: Vec<vk::Semaphore>,
}

impl SwapchainInfo for Swapchain {
    fn extent(&self) -> RenderSize {
        RenderSize {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}

impl Swapchain {
    /// Caller guarantees the device no longer uses any of these objects.
    pub unsafe fn destroy(&self, ctx: &DeviceContext) {
        let device = &ctx.device;
        for &s in &self.render_done {
            device.destroy_semaphore(s, None);
        }
        self.depth.destroy(device);
        for &v in &self.views {
            device.destroy_image_view(v, None);
        }
        ctx.swapchain_loader.destroy_swapchain(self.raw, None);
    }
}

/// One `create` per item. If any call fails, the objects made so far go to
/// `destroy` before the error is returned.
fn create_each<I, T, E>(
    items: impl IntoIterator<Item = I>,
    mut create: impl FnMut(I) -> Result<T, E>,
    mut destroy: impl FnMut(T),
) -> Result<Vec<T>, E> {
    let mut out = Vec::new();
    for item in items {
        match create(item) {
            Ok(t) => out.push(t),
            Err(e) => {
                out.into_iter().for_each(&mut destroy);
                return Err(e);
            }
        }
    }
    Ok(out)
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [
        vk::PresentModeKHR::IMMEDIATE,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::FIFO,
    ]
    .into_iter()
    .find(|m| modes.contains(m))
    .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Builds swapchains against the context's surface. `hint` is the window's
/// inner size, used only when the surface leaves the extent to us.
pub struct SwapchainFactory<'a> {
    pub ctx: &'a DeviceContext,
    pub vsync: bool,
    pub hint: RenderSize,
}

impl SwapchainFactory<'_> {
    unsafe fn build(&self, extent: vk::Extent2D, old: vk::SwapchainKHR) -> Result<Swapchain> {
        let ctx = self.ctx;
        let caps = ctx
            .surface_loader
            .get_physical_device_surface_capabilities(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_capabilities")?;
        let modes = ctx
            .surface_loader
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_present_modes")?;
        let present_mode = choose_present_mode(&modes, self.vsync);

        let mut min_images = caps.min_image_count + 1;
        if caps.max_image_count != 0 {
            min_images = min_images.min(caps.max_image_count);
        }

        let sci = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface,
            min_image_count: min_images,
            image_format: ctx.surface_format.format,
            image_color_space: ctx.surface_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };
        let raw = ctx
            .swapchain_loader
            .create_swapchain(&sci, None)
            .context("create_swapchain")?;
        let swapchain = match self.attach(raw, extent) {
            Ok(s) => s,
            Err(e) => {
                ctx.swapchain_loader.destroy_swapchain(raw, None);
                return Err(e);
            }
        };

        info!(
            "swapchain {}x{} images={} present={:?} format={:?}",
            extent.width,
            extent.height,
            swapchain.images.len(),
            present_mode,
            ctx.surface_format.format
        );
        Ok(swapchain)
    }

    /// Views, depth and semaphores for a fresh `raw`. On error everything
    /// made here is released; `raw` stays with the caller.
    unsafe fn attach(&self, raw: vk::SwapchainKHR, extent: vk::Extent2D) -> Result<Swapchain> {
        let ctx = self.ctx;
        let device = &ctx.device;
        let images = ctx
            .swapchain_loader
            .get_swapchain_images(raw)
            .context("get_swapchain_images")?;

        let views = create_each(
            &images,
            |&img| create_image_view(device, img, ctx.surface_format.format, vk::ImageAspectFlags::COLOR),
            |v| device.destroy_image_view(v, None),
        )?;
        let destroy_views = |views: &[vk::ImageView]| {
            for &v in views {
                device.destroy_image_view(v, None);
            }
        };

        let depth = match create_image(
            device,
            &ctx.memory,
            extent,
            ctx.depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        ) {
            Ok(d) => d,
            Err(e) => {
                destroy_views(&views);
                return Err(e);
            }
        };

        let sem_ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        let render_done = match create_each(
            &images,
            |_| device.create_semaphore(&sem_ci, None).context("create_semaphore"),
            |s| device.destroy_semaphore(s, None),
        ) {
            Ok(r) => r,
            Err(e) => {
                depth.destroy(device);
                destroy_views(&views);
                return Err(e);
            }
        };

        Ok(Swapchain { raw, extent, images, views, depth, render_done })
    }

    pub unsafe fn create_initial(&mut self) -> Result<Swapchain> {
        let extent = self.current_extent()?;
        let extent = vk::Extent2D {
            width: extent.width.max(1),
            height: extent.height.max(1),
        };
        self.build(extent, vk::SwapchainKHR::null())
    }
}

impl PresentSurface for SwapchainFactory<'_> {
    type Swapchain = Swapchain;
    type Error = anyhow::Error;

    fn current_extent(&mut self) -> Result<RenderSize> {
        let caps = unsafe {
            self.ctx
                .surface_loader
                .get_physical_device_surface_capabilities(self.ctx.phys, self.ctx.surface)
        }
        .context("get_physical_device_surface_capabilities")?;
        let e = extent_from_caps(&caps, self.hint);
        Ok(RenderSize { width: e.width, height: e.height })
    }

    fn create_swapchain(&mut self, extent: RenderSize, old: Option<&Swapchain>) -> Result<Swapchain> {
        let extent = vk::Extent2D { width: extent.width, height: extent.height };
        let old = old.map_or(vk::SwapchainKHR::null(), |s| s.raw);
        unsafe { self.build(extent, old) }
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.ctx.device.device_wait_idle() }.context("device_wait_idle")
    }

    fn destroy_swapchain(&mut self, swapchain: Swapchain, _idle: DeviceIdle) {
        unsafe { swapchain.destroy(self.ctx) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    #[test]
    fn surface_extent_wins_when_defined() {
        let c = caps((800, 600), (1, 1), (4096, 4096));
        let e = extent_from_caps(&c, RenderSize { width: 1920, height: 1080 });
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn window_hint_is_clamped_when_surface_defers() {
        let c = caps((u32::MAX, u32::MAX), (64, 64), (1024, 1024));
        let e = extent_from_caps(&c, RenderSize { width: 1920, height: 10 });
        assert_eq!((e.width, e.height), (1024, 64));
    }

    #[test]
    fn minimized_surface_reports_zero() {
        let c = caps((0, 0), (0, 0), (4096, 4096));
        let e = extent_from_caps(&c, RenderSize::default());
        assert_eq!((e.width, e.height), (0, 0));
    }

    #[test]
    fn vsync_forces_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn failed_creation_releases_earlier_objects() {
        let mut destroyed = Vec::new();
        let res: Result<Vec<u32>, &str> = create_each(
            0..5u32,
            |i| if i == 3 { Err("out of memory") } else { Ok(i * 10) },
            |t| destroyed.push(t),
        );
        assert_eq!(res, Err("out of memory"));
        assert_eq!(destroyed, vec![0, 10, 20]);
    }

    #[test]
    fn successful_creation_destroys_nothing() {
        let mut destroyed = 0;
        let res: Result<Vec<u32>, ()> = create_each([1u32, 2, 3], Ok, |_| destroyed += 1);
        assert_eq!(res, Ok(vec![1, 2, 3]));
        assert_eq!(destroyed, 0);
    }
}
