use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use ash::vk::{self, Handle};
use log::info;
use openxr as xr;
use wgpu_hal as hal;

use crate::engine::renderer::VIEW_TYPE;
use crate::engine::timeline::{DisplayTimePredictor, PredictedDisplay};
use crate::engine::{WgpuContext, TARGET_VULKAN_VERSION};

pub struct XrContext {
    pub instance: xr::Instance,
    pub props: xr::InstanceProperties,
    pub system: xr::SystemId,
    pub blend_mode: xr::EnvironmentBlendMode,
}

pub fn enable_xr_runtime(application_name: &str) -> Result<XrContext> {
    let entry =
        unsafe { xr::Entry::load() }.context("Cannot load the OpenXR runtime loader")?;

    #[cfg(target_os = "android")]
    entry
        .initialize_android_loader()
        .context("Cannot initialize the Android OpenXR loader")?;

    let available_extensions = entry
        .enumerate_extensions()
        .context("Cannot enumerate OpenXR extensions")?;
    info!("Available extensions: {:?}", available_extensions);
    ensure!(
        available_extensions.khr_vulkan_enable2,
        "OpenXR runtime has no Vulkan graphics binding"
    );

    let mut enabled_extensions = xr::ExtensionSet::default();
    enabled_extensions.khr_vulkan_enable2 = true;
    enabled_extensions.ext_hand_tracking = available_extensions.ext_hand_tracking;

    #[cfg(target_os = "android")]
    {
        enabled_extensions.khr_android_create_instance = true;
    }

    let instance = entry.create_instance(
        &xr::ApplicationInfo {
            application_name,
            application_version: 0,
            engine_name: "vr-frame-bridge",
            engine_version: 0,
        },
        &enabled_extensions,
        &[],
    )?;

    let props = instance.properties()?;
    info!(
        "Loaded OpenXR runtime: {} {}",
        props.runtime_name, props.runtime_version
    );

    let system = instance.system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)?;
    let blend_mode = instance.enumerate_environment_blend_modes(system, VIEW_TYPE)?[0];

    Ok(XrContext {
        instance,
        props,
        system,
        blend_mode,
    })
}

/// Session-lifetime graphics state: the wgpu stack built on the runtime's
/// Vulkan device, the session itself, and the frame pacing handles the
/// controller and renderer split between them.
pub struct GraphicsContext {
    pub wgpu: Arc<WgpuContext>,
    pub session: xr::Session<xr::Vulkan>,
    pub frame_waiter: Option<xr::FrameWaiter>,
    pub frame_stream: Option<xr::FrameStream<xr::Vulkan>>,
    pub resolution: (u32, u32),
    pub multiview: bool,
    pub system_name: String,
}

impl GraphicsContext {
    /// Builds the Vulkan instance and device through the runtime's
    /// `XR_KHR_vulkan_enable2` entry points, then wraps them in wgpu. The
    /// runtime must create both handles itself so it can pin the session to
    /// the headset's GPU.
    pub fn new(xr_context: &XrContext, prefer_multiview: bool) -> Result<Self> {
        let vk_target_version_xr = xr::Version::new(1, 1, 0);
        let reqs = xr_context
            .instance
            .graphics_requirements::<xr::Vulkan>(xr_context.system)?;
        if vk_target_version_xr < reqs.min_api_version_supported
            || vk_target_version_xr.major() > reqs.max_api_version_supported.major()
        {
            bail!(
                "OpenXR runtime requires Vulkan version > {}, < {}.0.0",
                reqs.min_api_version_supported,
                reqs.max_api_version_supported.major() + 1
            );
        }

        let vk_entry = unsafe { ash::Entry::load() }.context("Cannot load Vulkan")?;

        let mut flags = hal::InstanceFlags::empty();
        #[cfg(debug_assertions)]
        {
            flags |= hal::InstanceFlags::VALIDATION;
            flags |= hal::InstanceFlags::DEBUG;
        }

        let instance_extensions = <hal::api::Vulkan as hal::Api>::Instance::required_extensions(
            &vk_entry,
            TARGET_VULKAN_VERSION,
            flags,
        )?;
        info!("Requested instance extensions: {:?}", instance_extensions);
        let instance_extensions_ptrs = instance_extensions
            .iter()
            .map(|x| x.as_ptr())
            .collect::<Vec<_>>();

        let vk_app_info = vk::ApplicationInfo::builder()
            .application_version(0)
            .engine_version(0)
            .api_version(TARGET_VULKAN_VERSION);
        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&vk_app_info)
            .enabled_extension_names(&instance_extensions_ptrs);

        let vk_instance = unsafe {
            let vk_instance = xr_context
                .instance
                .create_vulkan_instance(
                    xr_context.system,
                    std::mem::transmute(vk_entry.static_fn().get_instance_proc_addr),
                    &create_info as *const _ as *const _,
                )
                .context("OpenXR error creating Vulkan instance")?
                .map_err(vk::Result::from_raw)
                .map_err(|err| anyhow::anyhow!("Vulkan error creating instance: {}", err))?;
            ash::Instance::load(
                vk_entry.static_fn(),
                vk::Instance::from_raw(vk_instance as _),
            )
        };

        let vk_physical_device = vk::PhysicalDevice::from_raw(unsafe {
            xr_context
                .instance
                .vulkan_graphics_device(xr_context.system, vk_instance.handle().as_raw() as _)
                .context("Cannot query the session's physical device")? as _
        });
        let vk_device_properties =
            unsafe { vk_instance.get_physical_device_properties(vk_physical_device) };
        if vk_device_properties.api_version < TARGET_VULKAN_VERSION {
            unsafe { vk_instance.destroy_instance(None) };
            bail!("The headset GPU does not support Vulkan 1.1");
        }

        let queue_family_index = unsafe {
            vk_instance
                .get_physical_device_queue_family_properties(vk_physical_device)
                .into_iter()
                .enumerate()
                .find_map(|(queue_family_index, info)| {
                    info.queue_flags
                        .contains(vk::QueueFlags::GRAPHICS)
                        .then_some(queue_family_index as u32)
                })
                .context("Vulkan device has no graphics queue")?
        };
        let queue_index = 0;

        let hal_instance = unsafe {
            <hal::api::Vulkan as hal::Api>::Instance::from_raw(
                vk_entry.clone(),
                vk_instance.clone(),
                TARGET_VULKAN_VERSION,
                0,
                None,
                instance_extensions,
                flags,
                false,
                None,
            )?
        };
        let hal_exposed_adapter = hal_instance
            .expose_adapter(vk_physical_device)
            .context("Cannot expose the session's adapter through wgpu-hal")?;

        let multiview = prefer_multiview
            && hal_exposed_adapter
                .features
                .contains(wgpu::Features::MULTIVIEW);
        let device_descriptor = wgpu::DeviceDescriptor {
            label: None,
            features: if multiview {
                wgpu::Features::MULTIVIEW
            } else {
                wgpu::Features::empty()
            },
            limits: wgpu::Limits::default(),
        };

        let device_extensions = hal_exposed_adapter
            .adapter
            .required_device_extensions(device_descriptor.features);
        info!("Requested device extensions: {:?}", device_extensions);
        let device_extensions_ptrs = device_extensions
            .iter()
            .map(|x| x.as_ptr())
            .collect::<Vec<_>>();

        let mut enabled_features = hal_exposed_adapter
            .adapter
            .physical_device_features(&device_extensions, device_descriptor.features);

        let family_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&[1.0])
            .build()];
        let mut multiview_features = vk::PhysicalDeviceMultiviewFeatures {
            multiview: vk::TRUE,
            ..Default::default()
        };
        let mut device_create_info = enabled_features.add_to_device_create_builder(
            vk::DeviceCreateInfo::builder()
                .queue_create_infos(&family_infos)
                .enabled_extension_names(&device_extensions_ptrs),
        );
        if multiview {
            device_create_info = device_create_info.push_next(&mut multiview_features);
        }

        let vk_device = unsafe {
            let vk_device = xr_context
                .instance
                .create_vulkan_device(
                    xr_context.system,
                    std::mem::transmute(vk_entry.static_fn().get_instance_proc_addr),
                    vk_physical_device.as_raw() as _,
                    &device_create_info as *const _ as *const _,
                )
                .context("OpenXR error creating Vulkan device")?
                .map_err(vk::Result::from_raw)
                .map_err(|err| anyhow::anyhow!("Vulkan error creating device: {}", err))?;
            ash::Device::load(vk_instance.fp_v1_0(), vk::Device::from_raw(vk_device as _))
        };

        let hal_device = unsafe {
            hal_exposed_adapter.adapter.device_from_raw(
                vk_device.clone(),
                true,
                &device_extensions,
                device_descriptor.features,
                queue_family_index,
                queue_index,
            )?
        };

        let wgpu_instance = unsafe { wgpu::Instance::from_hal::<hal::api::Vulkan>(hal_instance) };
        let wgpu_adapter = unsafe { wgpu_instance.create_adapter_from_hal(hal_exposed_adapter) };
        let (wgpu_device, wgpu_queue) = unsafe {
            wgpu_adapter.create_device_from_hal(hal_device, &device_descriptor, None)?
        };
        info!("Created the wgpu stack on the runtime's Vulkan device");

        let (session, frame_waiter, frame_stream) = unsafe {
            xr_context.instance.create_session::<xr::Vulkan>(
                xr_context.system,
                &xr::vulkan::SessionCreateInfo {
                    instance: vk_instance.handle().as_raw() as _,
                    physical_device: vk_physical_device.as_raw() as _,
                    device: vk_device.handle().as_raw() as _,
                    queue_family_index,
                    queue_index,
                },
            )?
        };

        let views = xr_context
            .instance
            .enumerate_view_configuration_views(xr_context.system, VIEW_TYPE)?;
        ensure!(views.len() == 2, "Expected a stereo view configuration");
        let resolution = (
            views[0].recommended_image_rect_width,
            views[0].recommended_image_rect_height,
        );
        let system_name = xr_context
            .instance
            .system_properties(xr_context.system)?
            .system_name;
        info!(
            "Session on {}: {}x{} per eye, multiview {}",
            system_name, resolution.0, resolution.1, multiview
        );

        Ok(Self {
            wgpu: Arc::new(WgpuContext {
                instance: wgpu_instance,
                adapter: wgpu_adapter,
                device: wgpu_device,
                queue: wgpu_queue,
            }),
            session,
            frame_waiter: Some(frame_waiter),
            frame_stream: Some(frame_stream),
            resolution,
            multiview,
            system_name,
        })
    }
}

/// Frame pacing through the runtime: `wait_frame` blocks until the
/// compositor wants the next frame and hands back its predicted display
/// time.
pub struct RuntimePredictor {
    waiter: xr::FrameWaiter,
}

impl RuntimePredictor {
    pub fn new(waiter: xr::FrameWaiter) -> Self {
        Self { waiter }
    }
}

impl DisplayTimePredictor for RuntimePredictor {
    fn predict(&mut self, _frame_index: i64) -> Result<PredictedDisplay> {
        let state = self.waiter.wait().context("Cannot wait for frame")?;
        Ok(PredictedDisplay {
            time: state.predicted_display_time,
            period: state.predicted_display_period,
            should_render: state.should_render,
        })
    }
}
