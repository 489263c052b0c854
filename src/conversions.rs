use ash::vk::{self, Format};
use wgpu::{Device, TextureDescriptor, TextureFormat};
use wgpu_hal::api::Vulkan;

use crate::{engine::formats::InternalColorFormat, macros::auto_map};

/// Wraps a Vulkan image owned by the OpenXR runtime in a wgpu texture.
/// The runtime keeps ownership; dropping the returned texture must not
/// destroy the underlying image, hence `texture_from_raw` with no drop
/// callback.
pub fn vulkan_image_to_texture(
    device: &Device,
    image: vk::Image,
    tex_desc: TextureDescriptor,
    hal_tex_desc: wgpu_hal::TextureDescriptor,
) -> wgpu::Texture {
    let texture = unsafe {
        <wgpu_hal::api::Vulkan as wgpu_hal::Api>::Device::texture_from_raw(
            image,
            &hal_tex_desc,
            None,
        )
    };

    unsafe { device.create_texture_from_hal::<Vulkan>(texture, &tex_desc) }
}

// Color Format Mappings
auto_map!(TextureFormat InternalColorFormat {
    (TextureFormat::Rgba8Unorm, InternalColorFormat::Rgba8Unorm),
    (TextureFormat::Rgba8UnormSrgb, InternalColorFormat::Rgba8UnormSrgb),
    (TextureFormat::Bgra8Unorm, InternalColorFormat::Bgra8Unorm),
    (TextureFormat::Bgra8UnormSrgb, InternalColorFormat::Bgra8UnormSrgb),
    (TextureFormat::Rgb10a2Unorm, InternalColorFormat::Rgb10a2Unorm),
    (TextureFormat::Depth24PlusStencil8, InternalColorFormat::Depth24PlusStencil8),
    (TextureFormat::Depth32Float, InternalColorFormat::Depth32Float)
});

auto_map!(InternalColorFormat Format {
    (InternalColorFormat::Rgba8Unorm, ash::vk::Format::R8G8B8A8_UNORM),
    (InternalColorFormat::Rgba8UnormSrgb, ash::vk::Format::R8G8B8A8_SRGB),
    (InternalColorFormat::Bgra8Unorm, ash::vk::Format::B8G8R8A8_UNORM),
    (InternalColorFormat::Bgra8UnormSrgb, ash::vk::Format::B8G8R8A8_SRGB),
    (InternalColorFormat::Rgb10a2Unorm, ash::vk::Format::A2B10G10R10_UNORM_PACK32),
    (InternalColorFormat::Depth24PlusStencil8, ash::vk::Format::D24_UNORM_S8_UINT),
    (InternalColorFormat::Depth32Float, ash::vk::Format::D32_SFLOAT)
});

#[cfg(test)]
mod test {
    use ash::vk::Format;
    use wgpu::TextureFormat;

    use crate::engine::formats::InternalColorFormat;

    #[test]
    fn color_format_round_trips() -> anyhow::Result<()> {
        let internal = InternalColorFormat::Rgba8UnormSrgb;

        let vk_format: Format = internal.try_into()?;
        assert_eq!(vk_format, Format::R8G8B8A8_SRGB);
        let back: InternalColorFormat = vk_format.try_into()?;
        assert_eq!(back, internal);

        let wgpu_format: TextureFormat = internal.try_into()?;
        assert_eq!(wgpu_format, TextureFormat::Rgba8UnormSrgb);

        Ok(())
    }
}
