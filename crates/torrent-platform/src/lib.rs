// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use torrent_render::RenderSize;
use winit::dpi::PhysicalSize;

/// Window inner size as the renderer sees it. Zero in either axis means the
/// window is minimized.
pub fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize {
        width: size.width,
        height: size.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimized_window_is_empty() {
        assert!(render_size(PhysicalSize::new(0, 720)).is_empty());
        assert!(!render_size(PhysicalSize::new(1280, 720)).is_empty());
    }
}
