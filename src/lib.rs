use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use openxr as xr;
use thread_priority::*;

use config::{AppConfig, ConfigContext};
use engine::actions::XrInputSource;
use engine::bridge::BootInfo;
use engine::framebuffer::{DEPTH_FORMAT, SWAPCHAIN_COLOR_FORMAT};
use engine::input::{DeviceClassifier, InputEnumerator};
use engine::renderer::{FrameRequest, Renderer, StereoMode, VIEW_TYPE};
use engine::submit::{
    DirectSubmitter, FrameSubmitter, RenderTask, SubmitOutcome, ThreadedSubmitter,
};
use engine::timeline::FrameTimeline;
use engine::vr::{enable_xr_runtime, GraphicsContext, RuntimePredictor, XrContext};

pub mod config;
mod conversions;
pub mod engine;
mod macros;
mod utils;

pub use engine::bridge::{ClearEngine, EngineBridge};

const APP_NAME: &str = "vr-frame-bridge";

pub fn launch(bridge: Box<dyn EngineBridge>) -> Result<()> {
    #[cfg(not(target_os = "android"))]
    utils::logging::setup_logging()?;

    try_elevate_priority();

    let mut config_context = config::ConfigContext::try_setup().unwrap_or(None);
    let config = config_context
        .as_ref()
        .and_then(|context| context.last_config.clone())
        .unwrap_or_else(AppConfig::parse);

    let xr_context = enable_xr_runtime(APP_NAME)?;

    info!("Finished initial setup, running main loop");
    run(&xr_context, config, &mut config_context, bridge)
}

fn try_elevate_priority() {
    log::info!("Trying to elevate main thread priority");
    if set_current_thread_priority(ThreadPriority::Max).is_err() {
        warn!("Failed to set thread priority to max!");
    }
}

fn run(
    xr_context: &XrContext,
    config: AppConfig,
    config_context: &mut Option<ConfigContext>,
    bridge: Box<dyn EngineBridge>,
) -> Result<()> {
    let mut graphics = GraphicsContext::new(xr_context, config.multiview)?;
    let session = graphics.session.clone();
    let frame_waiter = graphics
        .frame_waiter
        .take()
        .context("Frame waiter already taken")?;
    let frame_stream = graphics
        .frame_stream
        .take()
        .context("Frame stream already taken")?;

    let stereo = if graphics.multiview {
        StereoMode::Multiview
    } else {
        StereoMode::PerEye
    };
    let renderer = Renderer::new(
        session.clone(),
        frame_stream,
        &graphics.wgpu.device,
        graphics.resolution,
        config.sample_count,
        stereo,
        xr_context.blend_mode,
    )?;
    let eye_resolution = renderer.resolution();

    info!(
        "Session on {}: {}x{} per eye, {:?}, {} samples, clock levels cpu {} gpu {}",
        graphics.system_name,
        eye_resolution.0,
        eye_resolution.1,
        stereo,
        config.sample_count,
        config.cpu_level,
        config.gpu_level,
    );

    let boot_info = build_boot_info(&config, eye_resolution, graphics.system_name.clone(), stereo)?;

    let mut submitter: Box<dyn FrameSubmitter> = if config.threaded_renderer {
        Box::new(ThreadedSubmitter::new(
            Arc::clone(&graphics.wgpu),
            renderer,
            bridge,
        )?)
    } else {
        Box::new(DirectSubmitter::new(
            Arc::clone(&graphics.wgpu),
            renderer,
            bridge,
        ))
    };

    let mut input_source = XrInputSource::new(&xr_context.instance, session.clone())?;
    let mut enumerator = InputEnumerator::new(DeviceClassifier::standard());
    let mut predictor = RuntimePredictor::new(frame_waiter);
    let mut timeline = FrameTimeline::new(config.swap_interval);

    let mut event_storage = xr::EventDataBuffer::new();
    let mut session_running = false;
    let mut focused = false;
    let mut booted = false;
    let mut exit_pushed = false;
    let mut boundary: Option<[f32; 2]> = None;

    let result = 'main: loop {
        while let Some(event) = xr_context.instance.poll_event(&mut event_storage)? {
            match event {
                xr::Event::SessionStateChanged(e) => {
                    info!("Entered state {:?}", e.state());
                    match e.state() {
                        xr::SessionState::READY => {
                            session.begin(VIEW_TYPE)?;
                            session_running = true;
                            boundary = stage_bounds(&session);
                        }
                        xr::SessionState::FOCUSED => {
                            if !focused {
                                submitter.set_paused(false)?;
                                focused = true;
                            }
                        }
                        xr::SessionState::VISIBLE => {
                            if focused {
                                submitter.set_paused(true)?;
                                focused = false;
                            }
                        }
                        xr::SessionState::STOPPING => {
                            // The last latched frame may still be rendering
                            // on the worker; the session must outlive it.
                            submitter.flush();
                            session.end()?;
                            session_running = false;
                            enumerator.reset();
                        }
                        xr::SessionState::EXITING | xr::SessionState::LOSS_PENDING => {
                            break 'main Ok(());
                        }
                        _ => {}
                    }
                }
                xr::Event::InstanceLossPending(_) => break 'main Ok(()),
                xr::Event::EventsLost(e) => {
                    error!("Lost {} OpenXR events", e.lost_event_count());
                }
                xr::Event::ReferenceSpaceChangePending(_) => {
                    boundary = stage_bounds(&session);
                }
                _ => {}
            }
        }

        if let Some(config_ctx) = config_context.as_mut() {
            if check_config_changes(config_ctx) {
                // Swap interval is the only knob that takes effect without
                // rebuilding the session; the rest applies on next launch.
                if let Some(new_config) = &config_ctx.last_config {
                    timeline.set_swap_interval(new_config.swap_interval);
                }
            }
        }

        if !session_running {
            std::thread::sleep(std::time::Duration::from_millis(10));
            continue;
        }

        let predicted = timeline.begin_frame(&mut predictor)?;

        if !booted {
            // A placeholder frame keeps the compositor paced through boot.
            submitter.submit(RenderTask::LoadingIcon {
                display_time: predicted.time,
            })?;
            submitter.boot(boot_info.clone())?;
            booted = true;
            continue;
        }

        if exit_pushed {
            submitter.submit(RenderTask::FinalBlack {
                display_time: predicted.time,
            })?;
            continue;
        }

        input_source.set_display_time(predicted.time);
        let polled = enumerator.poll(&mut input_source, predicted.time);

        let request = FrameRequest {
            display_time: predicted.time,
            display_period: predicted.period.as_nanos() as f64 * 1e-9,
            frame_index: timeline.frame_index(),
            should_render: predicted.should_render,
            devices: polled.devices,
            boundary,
        };
        let outcome = submitter.submit(RenderTask::Frame {
            request,
            haptic_bindings: polled.haptic_bindings,
        })?;

        if polled.quit_requested || outcome == SubmitOutcome::ExitRequested {
            info!("Exit requested, winding the session down");
            exit_pushed = true;
            session.request_exit()?;
        }
    };

    submitter.shutdown()?;
    result
}

/// Reloads the watched config file when the watcher reports a change.
/// Returns true when a fresh config was parsed.
fn check_config_changes(context: &mut ConfigContext) -> bool {
    let changed = context
        .config_notifier
        .as_ref()
        .map(|notifier| notifier.try_recv().is_ok())
        .unwrap_or(false);
    if !changed {
        return false;
    }
    match context.update_config() {
        Ok(()) => {
            info!("Configuration file reloaded");
            true
        }
        Err(err) => {
            error!("Cannot reload configuration: {}", err);
            false
        }
    }
}

fn build_boot_info(
    config: &AppConfig,
    eye_resolution: (u32, u32),
    device_tag: String,
    stereo: StereoMode,
) -> Result<BootInfo> {
    Ok(BootInfo {
        writable_path: std::env::temp_dir(),
        asset_path: std::env::current_dir().unwrap_or_default(),
        eye_resolution,
        display_frequency: config.display_frequency,
        swap_interval: config.swap_interval,
        cpu_level: config.cpu_level,
        gpu_level: config.gpu_level,
        device_tag,
        color_format: SWAPCHAIN_COLOR_FORMAT.try_into()?,
        depth_format: DEPTH_FORMAT.try_into()?,
        sample_count: config.sample_count,
        view_layers: match stereo {
            StereoMode::Multiview => 2,
            StereoMode::PerEye => 1,
        },
    })
}

fn stage_bounds(session: &xr::Session<xr::Vulkan>) -> Option<[f32; 2]> {
    match session.reference_space_bounds_rect(xr::ReferenceSpaceType::STAGE) {
        Ok(Some(extent)) => Some([extent.width, extent.height]),
        Ok(None) => None,
        Err(err) => {
            warn!("Cannot query stage bounds: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boot_info_carries_pacing_and_clock_levels() {
        let config = AppConfig {
            swap_interval: 2,
            cpu_level: 4,
            gpu_level: 1,
            ..AppConfig::default()
        };
        let boot =
            build_boot_info(&config, (1024, 1024), "headset".into(), StereoMode::PerEye).unwrap();
        assert_eq!(boot.swap_interval, 2);
        assert_eq!(boot.cpu_level, 4);
        assert_eq!(boot.gpu_level, 1);
        assert_eq!(boot.view_layers, 1);

        let multiview =
            build_boot_info(&config, (1024, 1024), "headset".into(), StereoMode::Multiview)
                .unwrap();
        assert_eq!(multiview.view_layers, 2);
    }
}

#[cfg_attr(target_os = "android", ndk_glue::main(backtrace = "full"))]
pub fn main() {
    if let Err(err) = launch(Box::<ClearEngine>::default()) {
        log::error!("Frame bridge closed unexpectedly with an error: {}", err);
    }
}
