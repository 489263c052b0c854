use anyhow::{Context, Result};
use log::warn;
use openxr as xr;

use crate::engine::bridge::{EngineBridge, EngineDirective, FrameUpdate};
use crate::engine::framebuffer::SwapchainFramebuffer;
use crate::engine::haptics::HapticsEngine;
use crate::engine::input::DeviceSnapshot;
use crate::engine::pose::{projection_from_fov, view_matrix, EyeMatrices, Pose, TrackedMotion};
use crate::engine::WgpuContext;

pub const VIEW_TYPE: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;
const NEAR_Z: f32 = 0.1;
const FAR_Z: f32 = 100.0;

/// Ring of GPU completion fences, one slot per frame that may still be in
/// flight. The depth exceeds the compositor's maximum frames in flight, so
/// a full ring means the oldest frame is long overdue and worth blocking
/// on before its slot is reused.
pub struct FenceRing {
    pending: Vec<Option<wgpu::SubmissionIndex>>,
    cursor: usize,
}

impl FenceRing {
    pub const DEPTH: usize = 4;

    pub fn new() -> Self {
        Self {
            pending: vec![None; Self::DEPTH],
            cursor: 0,
        }
    }

    /// Blocks until the submission occupying the cursor's slot has
    /// completed, freeing the slot for the next frame.
    pub fn retire_oldest(&mut self, device: &wgpu::Device) {
        if let Some(index) = self.pending[self.cursor].take() {
            device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        }
    }

    pub fn push(&mut self, index: wgpu::SubmissionIndex) {
        self.pending[self.cursor] = Some(index);
        self.cursor = (self.cursor + 1) % Self::DEPTH;
    }
}

impl Default for FenceRing {
    fn default() -> Self {
        Self::new()
    }
}

/// How eye passes are recorded. Both modes produce identical layer
/// geometry; multiview just folds the two passes into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoMode {
    PerEye,
    Multiview,
}

/// Parameters latched for one frame's render-and-submit pass. All fields
/// are owned so the whole struct can cross into a worker thread.
pub struct FrameRequest {
    pub display_time: xr::Time,
    pub display_period: f64,
    pub frame_index: i64,
    pub should_render: bool,
    pub devices: Vec<DeviceSnapshot>,
    pub boundary: Option<[f32; 2]>,
}

/// Owns the stereo swap chain and drives one frame from predicted poses to
/// compositor submission.
pub struct Renderer {
    session: xr::Session<xr::Vulkan>,
    stream: xr::FrameStream<xr::Vulkan>,
    stage_space: xr::Space,
    view_space: xr::Space,
    framebuffer: SwapchainFramebuffer,
    fences: FenceRing,
    stereo: StereoMode,
    blend_mode: xr::EnvironmentBlendMode,
}

impl Renderer {
    pub fn new(
        session: xr::Session<xr::Vulkan>,
        stream: xr::FrameStream<xr::Vulkan>,
        device: &wgpu::Device,
        resolution: (u32, u32),
        sample_count: u32,
        stereo: StereoMode,
        blend_mode: xr::EnvironmentBlendMode,
    ) -> Result<Self> {
        let stage_space = session
            .create_reference_space(xr::ReferenceSpaceType::STAGE, xr::Posef::IDENTITY)
            .context("Cannot create stage reference space")?;
        let view_space = session
            .create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY)
            .context("Cannot create view reference space")?;
        let framebuffer = SwapchainFramebuffer::new(&session, device, resolution, sample_count)?;
        Ok(Self {
            session,
            stream,
            stage_space,
            view_space,
            framebuffer,
            fences: FenceRing::new(),
            stereo,
            blend_mode,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.framebuffer.resolution()
    }

    pub fn stereo(&self) -> StereoMode {
        self.stereo
    }

    /// Submits an empty frame. Keeps the compositor paced while there is
    /// nothing to show: during boot before the engine exists, and for the
    /// final black frame before session exit.
    pub fn flush_frame(&mut self, display_time: xr::Time) -> Result<()> {
        self.stream.begin().context("Cannot begin flush frame")?;
        self.stream
            .end(display_time, self.blend_mode, &[])
            .context("Cannot end flush frame")
    }

    /// One steady-state frame: locate views, run the engine's update, record
    /// the eye passes, submit to the GPU and hand the layer to the
    /// compositor.
    pub fn render_frame(
        &mut self,
        ctx: &WgpuContext,
        bridge: &mut dyn EngineBridge,
        haptics: &mut HapticsEngine,
        frame: &FrameRequest,
    ) -> Result<EngineDirective> {
        self.stream.begin().context("Cannot begin frame")?;
        let (_flags, views) = self
            .session
            .locate_views(VIEW_TYPE, frame.display_time, &self.stage_space)
            .context("Cannot locate views")?;
        anyhow::ensure!(views.len() >= 2, "Runtime reported {} views", views.len());
        let head = match self.view_space.relate(&self.stage_space, frame.display_time) {
            Ok((location, velocity)) => TrackedMotion::from_xr(&location.pose, Some(&velocity)),
            Err(err) => {
                warn!("Head pose query failed: {}", err);
                TrackedMotion::default()
            }
        };
        let eyes = [
            eye_matrices(&views[0]),
            eye_matrices(&views[1]),
        ];

        let display_time_s = frame.display_time.as_nanos() as f64 * 1e-9;
        let directive = bridge.update(
            &FrameUpdate {
                display_time: display_time_s,
                display_period: frame.display_period,
                frame_index: frame.frame_index,
                head,
                eyes,
                devices: &frame.devices,
                boundary: frame.boundary,
            },
            haptics,
        )?;

        // The compositor can withhold rendering; the engine still ticked,
        // and pending vibrations still expire. Only the eye passes and the
        // layer are dropped.
        if !frame.should_render {
            haptics.post_frame(display_time_s);
            self.stream
                .end(frame.display_time, self.blend_mode, &[])
                .context("Cannot end idle frame")?;
            return Ok(directive);
        }

        self.framebuffer.acquire()?;
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame encoder"),
            });
        match self.stereo {
            StereoMode::Multiview => {
                let target = self.framebuffer.multiview_target()?;
                bridge.draw(&target, 0, &eyes, &mut encoder)?;
            }
            StereoMode::PerEye => {
                for eye in 0..2 {
                    let target = self.framebuffer.eye_target(eye)?;
                    bridge.draw(&target, eye, &eyes[eye..eye + 1], &mut encoder)?;
                }
            }
        }

        self.fences.retire_oldest(&ctx.device);
        let submission = ctx.queue.submit(Some(encoder.finish()));
        self.fences.push(submission);
        self.framebuffer.release()?;

        haptics.post_frame(display_time_s);

        let resolution = self.framebuffer.resolution();
        let rect = xr::Rect2Di {
            offset: xr::Offset2Di { x: 0, y: 0 },
            extent: xr::Extent2Di {
                width: resolution.0 as i32,
                height: resolution.1 as i32,
            },
        };
        let projection_views: Vec<_> = views
            .iter()
            .take(2)
            .enumerate()
            .map(|(eye, view)| {
                xr::CompositionLayerProjectionView::new()
                    .pose(view.pose)
                    .fov(view.fov)
                    .sub_image(
                        xr::SwapchainSubImage::new()
                            .swapchain(self.framebuffer.handle())
                            .image_rect(rect)
                            .image_array_index(eye as u32),
                    )
            })
            .collect();
        self.stream
            .end(
                frame.display_time,
                self.blend_mode,
                &[&xr::CompositionLayerProjection::new()
                    .space(&self.stage_space)
                    .views(&projection_views)],
            )
            .context("Cannot end frame")?;

        Ok(directive)
    }
}

fn eye_matrices(view: &xr::View) -> EyeMatrices {
    let pose = Pose::from_xr(&view.pose);
    EyeMatrices {
        view: view_matrix(&pose),
        projection: projection_from_fov(view.fov, NEAR_Z, FAR_Z),
    }
}
