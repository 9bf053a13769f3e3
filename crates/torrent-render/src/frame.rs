// SPDX-License-Identifier: CEPL-1.0
//! Frame sequencing and the swapchain replacement protocol.
//!
//! One frame is in flight at a time. A frame walks
//! `Idle -> Acquired -> Recording -> Submitted -> Presented -> Idle`, and
//! the resize check runs before acquisition. A swapchain is never mutated:
//! a new one is built from the old as a hint, the device is drained, and
//! only then is the old one destroyed.

use thiserror::Error;

use crate::RenderSize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Acquired,
    Recording,
    Submitted,
    Presented,
}

impl FramePhase {
    pub fn next(self) -> FramePhase {
        match self {
            FramePhase::Idle => FramePhase::Acquired,
            FramePhase::Acquired => FramePhase::Recording,
            FramePhase::Recording => FramePhase::Submitted,
            FramePhase::Submitted => FramePhase::Presented,
            FramePhase::Presented => FramePhase::Idle,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame cannot move from {from:?} to {to:?}")]
    OutOfOrder { from: FramePhase, to: FramePhase },
}

#[derive(Clone, Debug)]
pub struct FrameCycle {
    phase: FramePhase,
    completed: u64,
}

impl Default for FrameCycle {
    fn default() -> Self {
        FrameCycle { phase: FramePhase::Idle, completed: 0 }
    }
}

impl FrameCycle {
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Frames that made it back to `Idle`.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn advance(&mut self, to: FramePhase) -> Result<(), FrameError> {
        if self.phase.next() != to {
            return Err(FrameError::OutOfOrder { from: self.phase, to });
        }
        self.phase = to;
        if to == FramePhase::Idle {
            self.completed += 1;
        }
        Ok(())
    }

    /// Returns to `Idle` after a failed frame. The caller must already have
    /// drained the device.
    pub fn abort(&mut self) {
        self.phase = FramePhase::Idle;
    }
}

/// Device features probed once at setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Task and mesh shaders are available.
    pub cluster_culling: bool,
    pub timestamps: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawPath {
    Indexed,
    Cluster,
}

impl DrawPath {
    pub fn select(caps: Capabilities, want_cluster: bool) -> DrawPath {
        if caps.cluster_culling && want_cluster {
            DrawPath::Cluster
        } else {
            DrawPath::Indexed
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DrawPath::Indexed => "indexed",
            DrawPath::Cluster => "cluster",
        }
    }
}

pub trait SwapchainInfo {
    fn extent(&self) -> RenderSize;
}

/// Proof that the device was idle after the swapchain being destroyed was
/// last used. Only [`resize_if_necessary`] and [`force_recreate`] mint it.
#[derive(Debug)]
pub struct DeviceIdle {
    _private: (),
}

pub trait PresentSurface {
    type Swapchain: SwapchainInfo;
    type Error;

    fn current_extent(&mut self) -> Result<RenderSize, Self::Error>;
    fn create_swapchain(
        &mut self,
        extent: RenderSize,
        old: Option<&Self::Swapchain>,
    ) -> Result<Self::Swapchain, Self::Error>;
    fn wait_idle(&mut self) -> Result<(), Self::Error>;
    fn destroy_swapchain(&mut self, swapchain: Self::Swapchain, idle: DeviceIdle);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeOutcome {
    Unchanged,
    /// Zero-area surface; skip the frame and keep the current swapchain.
    Minimized,
    Recreated { from: RenderSize, to: RenderSize },
}

/// Top-of-frame check: replaces `swapchain` iff the surface extent differs.
pub fn resize_if_necessary<S: PresentSurface>(
    surface: &mut S,
    swapchain: &mut S::Swapchain,
) -> Result<ResizeOutcome, S::Error> {
    let extent = surface.current_extent()?;
    if extent.is_empty() {
        return Ok(ResizeOutcome::Minimized);
    }
    if extent == swapchain.extent() {
        return Ok(ResizeOutcome::Unchanged);
    }
    replace(surface, swapchain, extent)
}

/// Replaces `swapchain` even when the extent is unchanged, e.g. after the
/// presentation engine reported it out of date.
pub fn force_recreate<S: PresentSurface>(
    surface: &mut S,
    swapchain: &mut S::Swapchain,
) -> Result<ResizeOutcome, S::Error> {
    let extent = surface.current_extent()?;
    if extent.is_empty() {
        return Ok(ResizeOutcome::Minimized);
    }
    replace(surface, swapchain, extent)
}

fn replace<S: PresentSurface>(
    surface: &mut S,
    swapchain: &mut S::Swapchain,
    extent: RenderSize,
) -> Result<ResizeOutcome, S::Error> {
    let from = swapchain.extent();
    let fresh = surface.create_swapchain(extent, Some(&*swapchain))?;
    let old = std::mem::replace(swapchain, fresh);

    // If the idle-wait fails the old swapchain is leaked, never destroyed
    // while it may still be referenced.
    surface.wait_idle()?;
    surface.destroy_swapchain(old, DeviceIdle { _private: () });

    Ok(ResizeOutcome::Recreated { from, to: swapchain.extent() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Create { id: u32, old: Option<u32> },
        WaitIdle,
        Destroy(u32),
    }

    #[derive(Debug)]
    struct MockSwapchain {
        id: u32,
        extent: RenderSize,
    }

    impl SwapchainInfo for MockSwapchain {
        fn extent(&self) -> RenderSize {
            self.extent
        }
    }

    #[derive(Default)]
    struct MockSurface {
        extent: RenderSize,
        next_id: u32,
        events: Vec<Event>,
        fail_idle: bool,
    }

    impl PresentSurface for MockSurface {
        type Swapchain = MockSwapchain;
        type Error = &'static str;

        fn current_extent(&mut self) -> Result<RenderSize, Self::Error> {
            Ok(self.extent)
        }

        fn create_swapchain(
            &mut self,
            extent: RenderSize,
            old: Option<&MockSwapchain>,
        ) -> Result<MockSwapchain, Self::Error> {
            self.next_id += 1;
            self.events.push(Event::Create { id: self.next_id, old: old.map(|o| o.id) });
            Ok(MockSwapchain { id: self.next_id, extent })
        }

        fn wait_idle(&mut self) -> Result<(), Self::Error> {
            if self.fail_idle {
                return Err("device lost");
            }
            self.events.push(Event::WaitIdle);
            Ok(())
        }

        fn destroy_swapchain(&mut self, swapchain: MockSwapchain, _idle: DeviceIdle) {
            self.events.push(Event::Destroy(swapchain.id));
        }
    }

    fn size(width: u32, height: u32) -> RenderSize {
        RenderSize { width, height }
    }

    fn setup(w: u32, h: u32) -> (MockSurface, MockSwapchain) {
        let mut surface = MockSurface { extent: size(w, h), ..MockSurface::default() };
        let sc = surface.create_swapchain(size(w, h), None).unwrap();
        surface.events.clear();
        (surface, sc)
    }

    #[test]
    fn new_swapchain_before_idle_before_destroy() {
        let (mut surface, mut sc) = setup(800, 600);
        surface.extent = size(1024, 768);

        let out = resize_if_necessary(&mut surface, &mut sc).unwrap();
        assert_eq!(out, ResizeOutcome::Recreated { from: size(800, 600), to: size(1024, 768) });
        assert_eq!(
            surface.events,
            vec![Event::Create { id: 2, old: Some(1) }, Event::WaitIdle, Event::Destroy(1)]
        );
        assert_eq!(sc.id, 2);
        assert_eq!(sc.extent, size(1024, 768));
    }

    #[test]
    fn second_check_with_same_extent_is_a_no_op() {
        let (mut surface, mut sc) = setup(800, 600);
        surface.extent = size(640, 480);
        resize_if_necessary(&mut surface, &mut sc).unwrap();
        surface.events.clear();

        let out = resize_if_necessary(&mut surface, &mut sc).unwrap();
        assert_eq!(out, ResizeOutcome::Unchanged);
        assert!(surface.events.is_empty());
        assert_eq!((sc.id, sc.extent), (2, size(640, 480)));
    }

    #[test]
    fn minimized_surface_keeps_swapchain() {
        let (mut surface, mut sc) = setup(800, 600);
        surface.extent = size(0, 600);
        assert_eq!(resize_if_necessary(&mut surface, &mut sc).unwrap(), ResizeOutcome::Minimized);
        assert_eq!(force_recreate(&mut surface, &mut sc).unwrap(), ResizeOutcome::Minimized);
        assert!(surface.events.is_empty());
        assert_eq!(sc.id, 1);
    }

    #[test]
    fn out_of_date_forces_replacement_at_same_extent() {
        let (mut surface, mut sc) = setup(800, 600);
        let out = force_recreate(&mut surface, &mut sc).unwrap();
        assert_eq!(out, ResizeOutcome::Recreated { from: size(800, 600), to: size(800, 600) });
        assert_eq!(surface.events.last(), Some(&Event::Destroy(1)));
    }

    #[test]
    fn failed_idle_wait_never_destroys() {
        let (mut surface, mut sc) = setup(800, 600);
        surface.extent = size(100, 100);
        surface.fail_idle = true;
        assert_eq!(resize_if_necessary(&mut surface, &mut sc), Err("device lost"));
        assert!(!surface.events.iter().any(|e| matches!(e, Event::Destroy(_))));
        assert_eq!(sc.id, 2);
    }

    #[test]
    fn frame_phases_follow_the_cycle() {
        let mut cycle = FrameCycle::default();
        for phase in [
            FramePhase::Acquired,
            FramePhase::Recording,
            FramePhase::Submitted,
            FramePhase::Presented,
            FramePhase::Idle,
        ] {
            cycle.advance(phase).unwrap();
        }
        assert_eq!(cycle.completed(), 1);

        assert_eq!(
            cycle.advance(FramePhase::Submitted),
            Err(FrameError::OutOfOrder { from: FramePhase::Idle, to: FramePhase::Submitted })
        );
        cycle.advance(FramePhase::Acquired).unwrap();
        cycle.abort();
        assert_eq!(cycle.phase(), FramePhase::Idle);
        assert_eq!(cycle.completed(), 1);
    }

    #[test]
    fn cluster_path_needs_support_and_request() {
        let none = Capabilities::default();
        let mesh = Capabilities { cluster_culling: true, timestamps: false };
        assert_eq!(DrawPath::select(none, true), DrawPath::Indexed);
        assert_eq!(DrawPath::select(mesh, false), DrawPath::Indexed);
        assert_eq!(DrawPath::select(mesh, true), DrawPath::Cluster);
    }
}
