use std::path::PathBuf;

use anyhow::Result;
use log::info;

use crate::engine::framebuffer::EyeTarget;
use crate::engine::haptics::HapticsEngine;
use crate::engine::input::DeviceSnapshot;
use crate::engine::pose::{EyeMatrices, TrackedMotion};
use crate::engine::WgpuContext;

/// One-time boot parameters handed to the embedded engine after the first
/// flush frame has been submitted.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub writable_path: PathBuf,
    pub asset_path: PathBuf,
    pub eye_resolution: (u32, u32),
    pub display_frequency: f32,
    /// Display refreshes per submitted frame.
    pub swap_interval: u32,
    /// Requested clock levels, advisory on this runtime.
    pub cpu_level: u32,
    pub gpu_level: u32,
    /// Marketing name of the headset the session is running on.
    pub device_tag: String,
    pub color_format: wgpu::TextureFormat,
    pub depth_format: wgpu::TextureFormat,
    pub sample_count: u32,
    /// 2 when both eyes render in one multiview pass, 1 otherwise.
    pub view_layers: u32,
}

/// Per-frame state handed to the engine's update callback.
pub struct FrameUpdate<'a> {
    pub display_time: f64,
    pub display_period: f64,
    pub frame_index: i64,
    pub head: TrackedMotion,
    pub eyes: [EyeMatrices; 2],
    pub devices: &'a [DeviceSnapshot],
    /// Guardian play-area extent (width, depth) in meters, when available.
    pub boundary: Option<[f32; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineDirective {
    Continue,
    /// The engine wants the session to end after this frame.
    RequestExit,
}

/// Callback contract with the embedded engine. All calls are synchronous;
/// the frame loop does not proceed until they return. `update` runs once
/// per frame before any drawing, `draw` once per recorded eye pass.
pub trait EngineBridge: Send {
    fn boot(&mut self, ctx: &WgpuContext, boot: &BootInfo) -> Result<()>;

    fn update(&mut self, frame: &FrameUpdate, haptics: &mut HapticsEngine)
        -> Result<EngineDirective>;

    /// Records all drawing for the pass into `encoder`. `first_eye` is the
    /// index of the first eye the pass covers; `eyes` holds one matrix pair
    /// per covered layer.
    fn draw(
        &mut self,
        target: &EyeTarget,
        first_eye: usize,
        eyes: &[EyeMatrices],
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<()>;

    fn set_paused(&mut self, _paused: bool) {}

    fn shutdown(&mut self) {}
}

/// Minimal built-in engine: clears each eye to a slowly cycling color.
/// Useful for bringing up a headset before a real engine is attached.
#[derive(Default)]
pub struct ClearEngine {
    display_time: f64,
}

impl EngineBridge for ClearEngine {
    fn boot(&mut self, _ctx: &WgpuContext, boot: &BootInfo) -> Result<()> {
        info!(
            "Clear engine booted on {} at {}x{} per eye, {} Hz",
            boot.device_tag, boot.eye_resolution.0, boot.eye_resolution.1, boot.display_frequency
        );
        Ok(())
    }

    fn update(
        &mut self,
        frame: &FrameUpdate,
        _haptics: &mut HapticsEngine,
    ) -> Result<EngineDirective> {
        self.display_time = frame.display_time;
        Ok(EngineDirective::Continue)
    }

    fn draw(
        &mut self,
        target: &EyeTarget,
        _first_eye: usize,
        _eyes: &[EyeMatrices],
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<()> {
        let phase = self.display_time * 0.25;
        let clear = wgpu::Color {
            r: 0.5 + 0.5 * phase.sin(),
            g: 0.5 + 0.5 * (phase + 2.0).sin(),
            b: 0.5 + 0.5 * (phase + 4.0).sin(),
            a: 1.0,
        };
        let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target.color,
                resolve_target: target.resolve,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(clear),
                    store: true,
                },
            })],
            depth_stencil_attachment: Some(target.depth_attachment()),
        });
        drop(pass);
        Ok(())
    }
}
