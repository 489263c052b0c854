/// Color/depth formats the bridge negotiates between the OpenXR swapchain
/// (Vulkan formats) and wgpu render targets. Only the formats the eye
/// framebuffers can actually be created with are mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalColorFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgb10a2Unorm,
    Depth24PlusStencil8,
    Depth32Float,
}
