pub mod actions;
pub mod bridge;
pub mod formats;
pub mod framebuffer;
pub mod haptics;
pub mod input;
pub mod pose;
pub mod renderer;
pub mod submit;
pub mod timeline;
pub mod vr;

/// Vulkan 1.1 is the floor: it guarantees multiview support.
pub const TARGET_VULKAN_VERSION: u32 = ash::vk::make_api_version(0, 1, 1, 0);

/// The wgpu stack shared by everything that records or submits GPU work.
pub struct WgpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}
