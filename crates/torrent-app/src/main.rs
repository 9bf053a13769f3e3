// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, Result};
use clap::{CommandFactory, Parser};
use serde::Deserialize;
use torrent_core::init_tracing;
use torrent_platform::render_size;
use torrent_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};
use torrent_render::{DrawPath, IngestOptions, Mesh, RenderSettings, RenderSize, Renderer};
use torrent_render_vk::VkRenderer;
use tracing::{error, info, warn};

mod obj;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Wavefront OBJ file to render
    mesh: PathBuf,
    /// Runtime settings (TOML); missing file means defaults
    #[arg(long, default_value = "torrent.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
struct RenderCfg {
    clear_color: [f32; 4],
    vsync: bool,
    cluster_culling: bool,
    cone_culling: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let d = RenderSettings::default();
        RenderCfg {
            clear_color: d.clear_color,
            vsync: d.vsync,
            cluster_culling: d.cluster_culling,
            cone_culling: d.cone_culling,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
struct SceneCfg {
    draw_count: u32,
    optimize_mesh: bool,
}

impl Default for SceneCfg {
    fn default() -> Self {
        SceneCfg {
            draw_count: RenderSettings::default().draw_count,
            optimize_mesh: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct AppCfg {
    render: RenderCfg,
    scene: SceneCfg,
}

impl AppCfg {
    fn settings(&self) -> RenderSettings {
        RenderSettings {
            clear_color: self.render.clear_color,
            vsync: self.render.vsync,
            cluster_culling: self.render.cluster_culling,
            cone_culling: self.render.cone_culling,
            draw_count: self.scene.draw_count,
        }
    }
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => {
            info!("{} not found; using defaults", path.display());
            AppCfg::default()
        }
    }
}

/// Per-second frame statistics for the log and the window title.
struct StatsWindow {
    since: Instant,
    frames: u32,
    cpu_ms: f64,
    gpu_ms: f64,
    gpu_frames: u32,
}

impl StatsWindow {
    fn new() -> Self {
        StatsWindow { since: Instant::now(), frames: 0, cpu_ms: 0.0, gpu_ms: 0.0, gpu_frames: 0 }
    }
}

struct App {
    mesh: Option<Mesh>,
    settings: RenderSettings,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    stats: StatsWindow,
    last_frame: u64,
    error: Option<anyhow::Error>,
}

impl App {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop.create_window(Window::default_attributes().with_title("torrent"))?;
        self.render_size = render_size(window.inner_size());

        let mesh = self.mesh.take().ok_or_else(|| anyhow!("renderer already created"))?;
        let renderer = VkRenderer::new(&window, &window, self.render_size, self.settings, &mesh)?;
        info!(
            "path={} cone_culling={} caps={:?}",
            renderer.draw_path().name(),
            renderer.cone_culling(),
            renderer.capabilities()
        );

        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.error = Some(e);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        // renderer holds the surface, so it goes before the window
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn on_key(&mut self, code: KeyCode, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match code {
            KeyCode::KeyM => {
                let want = renderer.draw_path() != DrawPath::Cluster;
                match renderer.set_cluster_culling(want) {
                    Ok(path) => info!("draw path: {}", path.name()),
                    Err(e) => self.fail(event_loop, e),
                }
            }
            KeyCode::KeyC => {
                let on = !renderer.cone_culling();
                renderer.set_cone_culling(on);
                info!("cone culling: {on}");
            }
            KeyCode::Escape => self.shutdown(event_loop),
            _ => {}
        }
    }

    fn record_frame(&mut self) {
        let (Some(renderer), Some(window)) = (&self.renderer, &self.window) else {
            return;
        };
        let frame = renderer.last_frame();
        if frame.frames != self.last_frame {
            self.last_frame = frame.frames;
            self.stats.frames += 1;
            self.stats.cpu_ms += frame.cpu_ms;
            if let Some(g) = frame.gpu_ms {
                self.stats.gpu_ms += g;
                self.stats.gpu_frames += 1;
            }
        }

        if self.stats.since.elapsed().as_secs_f32() < 1.0 {
            return;
        }
        let s = &self.stats;
        let cpu = s.cpu_ms / s.frames.max(1) as f64;
        let gpu = if s.gpu_frames > 0 {
            format!("{:.2} ms", s.gpu_ms / s.gpu_frames as f64)
        } else {
            "n/a".to_owned()
        };
        let path = renderer.draw_path().name();
        let cone = if renderer.cone_culling() { "on" } else { "off" };
        info!("fps={} cpu={cpu:.2} ms gpu={gpu} path={path} cone={cone}", s.frames);
        window.set_title(&format!(
            "torrent | {path} | cone {cone} | {} fps | cpu {cpu:.2} ms | gpu {gpu}",
            s.frames
        ));
        self.stats = StatsWindow::new();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.error.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        match &self.window {
            Some(w) if w.id() == window_id => {}
            _ => return,
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = render_size(new_size);
                if let Some(r) = self.renderer.as_mut() {
                    if let Err(e) = r.resize(self.render_size) {
                        self.fail(event_loop, e);
                    }
                }
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => self.on_key(code, event_loop),

            WindowEvent::RedrawRequested => {
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };
                if let Err(e) = renderer.render() {
                    self.fail(event_loop, e);
                    return;
                }
                self.record_frame();
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(window) = &self.window else {
            return;
        };
        // Minimized: sleep until a resize wakes us
        if self.render_size.is_empty() {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        window.request_redraw();
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);

    let source = match obj::load_obj(&args.mesh) {
        Ok(s) => s,
        Err(e) => {
            error!("{e:#}");
            eprintln!("{}", Args::command().render_usage());
            return ExitCode::FAILURE;
        }
    };

    match run(&source, &cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(source: &torrent_render::MeshSource, cfg: &AppCfg) -> Result<()> {
    let mesh = Mesh::from_source(
        source,
        IngestOptions {
            optimize: cfg.scene.optimize_mesh,
            meshlets: true,
        },
    )?;

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        mesh: Some(mesh),
        settings: cfg.settings(),
        window: None,
        renderer: None,
        render_size: RenderSize::default(),
        stats: StatsWindow::new(),
        last_frame: 0,
        error: None,
    };
    event_loop.run_app(&mut app)?;

    match app.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: AppCfg = toml::from_str("[render]\nvsync = false\n[scene]\ndraw_count = 9\n").unwrap();
        let s = cfg.settings();
        assert!(!s.vsync);
        assert!(s.cluster_culling && s.cone_culling);
        assert_eq!(s.draw_count, 9);
        assert!(cfg.scene.optimize_mesh);
    }

    #[test]
    fn empty_config_is_default() {
        let cfg: AppCfg = toml::from_str("").unwrap();
        assert_eq!(cfg.settings().draw_count, RenderSettings::default().draw_count);
    }

    #[test]
    fn mesh_argument_is_required() {
        assert!(Args::try_parse_from(["torrent"]).is_err());
        let args = Args::try_parse_from(["torrent", "bunny.obj"]).unwrap();
        assert_eq!(args.config, PathBuf::from("torrent.toml"));
    }
}
