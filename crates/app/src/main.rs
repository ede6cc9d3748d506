//! lumen - demo application for the frame pipeline.
//!
//! Opens a window, binds a small scene of cubes and quads and renders it
//! through the Vulkan backend until the window is closed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec3};
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use lumen_core::{RendererConfig, Timer};
use lumen_platform::Window;
use lumen_renderer::{FrameStatus, FrustumCuller, Renderer, RendererError};
use lumen_resources::{AlphaMode, InstanceDesc, Material, ModelData, ModelId};
use lumen_rhi::Extent2D;
use lumen_rhi::vulkan::{VulkanBackend, VulkanBackendDesc};
use lumen_scene::{NodeId, SceneGraph, Transform};

const CONFIG_ENV: &str = "LUMEN_CONFIG";
const DEFAULT_CONFIG: &str = "lumen.toml";
const GRID: i32 = 4;

/// Nodes the demo animates.
struct DemoScene {
    graph: SceneGraph,
    pivot: NodeId,
}

impl DemoScene {
    /// A pivot node with a grid of cubes under it, plus a transparent and a
    /// double-sided quad in front of the grid.
    fn build(renderer: &mut Renderer<VulkanBackend>) -> Result<Self> {
        let mut graph = SceneGraph::new();
        let pivot = graph.add_node("pivot", Transform::default(), None)?;

        let mut cubes = Vec::new();
        for x in -GRID / 2..GRID / 2 {
            for y in -GRID / 2..GRID / 2 {
                let position = Vec3::new(x as f32 * 2.5 + 1.25, y as f32 * 2.5 + 1.25, 0.0);
                let node = graph.add_node(
                    format!("cube {x},{y}"),
                    Transform::from_position(position),
                    Some(pivot),
                )?;
                cubes.push(InstanceDesc::attached(node));
            }
        }
        renderer.bind_model(&ModelData::cube(ModelId(1), Material::opaque(0), cubes))?;

        renderer.bind_model(&ModelData::quad(
            ModelId(2),
            Material::transparent(1),
            vec![InstanceDesc::at(Mat4::from_scale_rotation_translation(
                Vec3::splat(6.0),
                Quat::IDENTITY,
                Vec3::new(0.0, 0.0, 3.0),
            ))],
        ))?;
        renderer.bind_model(&ModelData::quad(
            ModelId(3),
            Material::new(AlphaMode::Opaque, true, 2),
            vec![InstanceDesc::at(Mat4::from_scale_rotation_translation(
                Vec3::splat(20.0),
                Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2),
                Vec3::new(0.0, -6.0, 0.0),
            ))],
        ))?;

        info!("Demo scene bound: {} nodes", graph.len());
        Ok(Self { graph, pivot })
    }

    fn animate(&mut self, seconds: f32) {
        let local = Transform::default().with_rotation(Quat::from_rotation_y(seconds * 0.5));
        if let Err(e) = self.graph.set_local(self.pivot, local) {
            warn!("Failed to animate pivot: {}", e);
        }
    }
}

struct App {
    config: RendererConfig,
    // Dropped before the window: the backend's surface refers to it
    renderer: Option<Renderer<VulkanBackend>>,
    scene: Option<DemoScene>,
    window: Option<Window>,
    timer: Timer,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        Self {
            config,
            renderer: None,
            scene: None,
            window: None,
            timer: Timer::new(),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Window::new(event_loop, &self.config.window)?;
        let handles = window.handles()?;

        // SAFETY: the window is stored in `self.window`, which is declared
        // after `self.renderer` and so outlives the backend.
        let backend = unsafe {
            VulkanBackend::new(VulkanBackendDesc {
                display: handles.display,
                window: handles.window,
                validation: self.config.validation,
                vsync: self.config.vsync,
                shader_dir: self.config.shader_dir.clone(),
            })
        }
        .context("failed to create Vulkan backend")?;

        let mut renderer = Renderer::with_visibility(
            Arc::new(backend),
            &self.config,
            Extent2D::new(window.width(), window.height()),
            Box::new(FrustumCuller::new()),
        )?;
        renderer.camera_mut().position = Vec3::new(0.0, 2.0, 14.0);
        renderer.camera_mut().look_at(Vec3::ZERO);

        self.scene = Some(DemoScene::build(&mut renderer)?);
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_mut()) else {
            return;
        };

        scene.animate(self.timer.elapsed_secs());
        renderer.sync_transforms(&scene.graph);

        match renderer.draw_frame() {
            Ok(FrameStatus::Presented) => {
                let (_, fps) = self.timer.tick();
                if let Some(fps) = fps {
                    let report = renderer.stats().last_compile.as_ref();
                    info!(
                        "{:.1} fps, {} draws, {} instances",
                        fps,
                        report.map_or(0, |r| r.draws_written),
                        report.map_or(0, |r| r.instances_written)
                    );
                }
            }
            Ok(FrameStatus::Skipped) => {}
            Err(e @ RendererError::SubmissionTimeout { .. }) => {
                error!("GPU stopped responding: {}", e);
                event_loop.exit();
            }
            Err(e) => error!("Render error: {}", e),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match self.init(event_loop) {
            Ok(()) => info!("Initialization complete, entering main loop"),
            Err(e) => {
                error!("Failed to initialize: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    window.resize(size.width, size.height);
                }
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.as_ref() {
            let stats = renderer.stats();
            info!(
                "Presented {} frames ({} skipped, {} swapchain recreations)",
                stats.frames_presented, stats.frames_skipped, stats.swapchain_recreations
            );
        }
        // Tear down in order while the event loop still owns the window
        self.renderer = None;
        self.scene = None;
        self.window = None;
    }
}

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn main() -> Result<()> {
    lumen_core::init_logging();
    info!("Starting lumen");

    let path = config_path();
    let config = RendererConfig::load_or_default(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}
