use anyhow::{ensure, Context, Result};
use ash::vk::{self, Handle};
use log::trace;
use openxr as xr;

use crate::conversions::vulkan_image_to_texture;
use crate::engine::formats::InternalColorFormat;

pub const SWAPCHAIN_COLOR_FORMAT: InternalColorFormat = InternalColorFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: InternalColorFormat = InternalColorFormat::Depth24PlusStencil8;

/// Rotating frame-slot cursor. The compositor hands out swap-chain images
/// in order, so the slot in use cycles through `0..length` one step per
/// submitted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRing {
    length: usize,
    current: usize,
}

impl SlotRing {
    pub fn new(length: usize) -> Result<Self> {
        ensure!(length > 0, "A swap chain needs at least one slot");
        Ok(Self { length, current: 0 })
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.length;
    }

    fn resync(&mut self, index: usize) {
        self.current = index % self.length;
    }
}

/// Attachment set for one recorded eye pass. When multisampling is active
/// the pass renders into the transient MSAA target and resolves into the
/// swap-chain image; otherwise it renders into the swap-chain image
/// directly.
pub struct EyeTarget<'a> {
    pub color: &'a wgpu::TextureView,
    pub resolve: Option<&'a wgpu::TextureView>,
    pub depth: &'a wgpu::TextureView,
    pub resolution: (u32, u32),
    pub sample_count: u32,
    /// 1 for a per-eye pass, 2 when both eyes render in one multiview pass.
    pub layer_count: u32,
}

impl EyeTarget<'_> {
    pub fn color_attachment(&self) -> wgpu::RenderPassColorAttachment {
        wgpu::RenderPassColorAttachment {
            view: self.color,
            resolve_target: self.resolve,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                store: true,
            },
        }
    }

    /// Depth contents are never sampled after the pass, so they are
    /// discarded instead of stored.
    pub fn depth_attachment(&self) -> wgpu::RenderPassDepthStencilAttachment {
        wgpu::RenderPassDepthStencilAttachment {
            view: self.depth,
            depth_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(1.0),
                store: false,
            }),
            stencil_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(0),
                store: false,
            }),
        }
    }
}

struct FramebufferSlot {
    _color_texture: wgpu::Texture,
    color_array_view: wgpu::TextureView,
    color_layer_views: Vec<wgpu::TextureView>,
    _depth_texture: wgpu::Texture,
    depth_array_view: wgpu::TextureView,
    depth_layer_views: Vec<wgpu::TextureView>,
    msaa: Option<MsaaSlot>,
}

struct MsaaSlot {
    _texture: wgpu::Texture,
    array_view: wgpu::TextureView,
    layer_views: Vec<wgpu::TextureView>,
}

/// Stereo swap chain plus the per-slot render targets that pair with each
/// of its images. Color images are owned by the runtime and imported into
/// wgpu; depth and MSAA targets are allocated locally, one set per slot.
pub struct SwapchainFramebuffer {
    handle: xr::Swapchain<xr::Vulkan>,
    slots: Vec<FramebufferSlot>,
    ring: SlotRing,
    resolution: (u32, u32),
    sample_count: u32,
    acquired: bool,
}

const EYE_LAYERS: u32 = 2;

impl SwapchainFramebuffer {
    pub fn new(
        xr_session: &xr::Session<xr::Vulkan>,
        device: &wgpu::Device,
        resolution: (u32, u32),
        sample_count: u32,
    ) -> Result<Self> {
        let vk_color_format: vk::Format = SWAPCHAIN_COLOR_FORMAT.try_into()?;
        let handle = xr_session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT
                    | xr::SwapchainUsageFlags::SAMPLED,
                format: vk_color_format.as_raw() as u32,
                sample_count: 1,
                width: resolution.0,
                height: resolution.1,
                face_count: 1,
                array_size: EYE_LAYERS,
                mip_count: 1,
            })
            .context("Cannot create OpenXR swapchain")?;

        let images = handle
            .enumerate_images()
            .context("Cannot enumerate swapchain images")?;
        ensure!(!images.is_empty(), "Runtime returned an empty swapchain");

        let slots = images
            .into_iter()
            .enumerate()
            .map(|(index, image)| {
                Self::wrap_slot(device, image, index, resolution, sample_count)
            })
            .collect::<Result<Vec<_>>>()?;

        let ring = SlotRing::new(slots.len())?;
        trace!(
            "Created {}x{} stereo swapchain with {} slots",
            resolution.0,
            resolution.1,
            ring.len()
        );

        Ok(Self {
            handle,
            slots,
            ring,
            resolution,
            sample_count,
            acquired: false,
        })
    }

    fn wrap_slot(
        device: &wgpu::Device,
        image: u64,
        index: usize,
        resolution: (u32, u32),
        sample_count: u32,
    ) -> Result<FramebufferSlot> {
        let extent = wgpu::Extent3d {
            width: resolution.0,
            height: resolution.1,
            depth_or_array_layers: EYE_LAYERS,
        };
        let color_format: wgpu::TextureFormat = SWAPCHAIN_COLOR_FORMAT.try_into()?;
        let depth_format: wgpu::TextureFormat = DEPTH_FORMAT.try_into()?;

        let color_texture = vulkan_image_to_texture(
            device,
            vk::Image::from_raw(image),
            wgpu::TextureDescriptor {
                label: Some(&format!("Swapchain color {}", index)),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: color_format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
            wgpu_hal::TextureDescriptor {
                label: Some(&format!("Swapchain color {}", index)),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: color_format,
                usage: wgpu_hal::TextureUses::COLOR_TARGET | wgpu_hal::TextureUses::RESOURCE,
                memory_flags: wgpu_hal::MemoryFlags::empty(),
                view_formats: vec![],
            },
        );

        let depth_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Swapchain depth {}", index)),
            size: extent,
            mip_level_count: 1,
            sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: depth_format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let msaa = (sample_count > 1)
            .then(|| {
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&format!("Swapchain msaa color {}", index)),
                    size: extent,
                    mip_level_count: 1,
                    sample_count,
                    dimension: wgpu::TextureDimension::D2,
                    format: color_format,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                });
                MsaaSlot {
                    array_view: Self::array_view(&texture),
                    layer_views: Self::layer_views(&texture),
                    _texture: texture,
                }
            });

        Ok(FramebufferSlot {
            color_array_view: Self::array_view(&color_texture),
            color_layer_views: Self::layer_views(&color_texture),
            depth_array_view: Self::array_view(&depth_texture),
            depth_layer_views: Self::layer_views(&depth_texture),
            _color_texture: color_texture,
            _depth_texture: depth_texture,
            msaa,
        })
    }

    fn array_view(texture: &wgpu::Texture) -> wgpu::TextureView {
        texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            array_layer_count: Some(EYE_LAYERS),
            ..Default::default()
        })
    }

    fn layer_views(texture: &wgpu::Texture) -> Vec<wgpu::TextureView> {
        (0..EYE_LAYERS)
            .map(|layer| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect()
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub fn slot_count(&self) -> usize {
        self.ring.len()
    }

    pub fn handle(&self) -> &xr::Swapchain<xr::Vulkan> {
        &self.handle
    }

    /// Acquires the next image and blocks until the compositor is done
    /// reading it. The acquired index normally matches the ring's cursor;
    /// a runtime that hands images out in a different order wins.
    pub fn acquire(&mut self) -> Result<()> {
        let index = self
            .handle
            .acquire_image()
            .context("Cannot acquire swapchain image")? as usize;
        if index != self.ring.current_index() {
            trace!(
                "Swapchain returned slot {} while cursor was at {}",
                index,
                self.ring.current_index()
            );
            self.ring.resync(index);
        }
        self.handle
            .wait_image(xr::Duration::INFINITE)
            .context("Cannot wait for swapchain image")?;
        self.acquired = true;
        Ok(())
    }

    /// Hands the current image back to the compositor and moves the cursor
    /// to the next slot.
    pub fn release(&mut self) -> Result<()> {
        self.handle
            .release_image()
            .context("Cannot release swapchain image")?;
        self.acquired = false;
        self.ring.advance();
        Ok(())
    }

    /// Attachments for a single-eye pass into one array layer of the
    /// current slot.
    pub fn eye_target(&self, eye: usize) -> Result<EyeTarget> {
        ensure!(self.acquired, "No swapchain image acquired");
        ensure!(eye < EYE_LAYERS as usize, "Eye index out of range");
        let slot = &self.slots[self.ring.current_index()];
        Ok(match &slot.msaa {
            Some(msaa) => EyeTarget {
                color: &msaa.layer_views[eye],
                resolve: Some(&slot.color_layer_views[eye]),
                depth: &slot.depth_layer_views[eye],
                resolution: self.resolution,
                sample_count: self.sample_count,
                layer_count: 1,
            },
            None => EyeTarget {
                color: &slot.color_layer_views[eye],
                resolve: None,
                depth: &slot.depth_layer_views[eye],
                resolution: self.resolution,
                sample_count: 1,
                layer_count: 1,
            },
        })
    }

    /// Attachments for a multiview pass covering both array layers of the
    /// current slot at once.
    pub fn multiview_target(&self) -> Result<EyeTarget> {
        ensure!(self.acquired, "No swapchain image acquired");
        let slot = &self.slots[self.ring.current_index()];
        Ok(match &slot.msaa {
            Some(msaa) => EyeTarget {
                color: &msaa.array_view,
                resolve: Some(&slot.color_array_view),
                depth: &slot.depth_array_view,
                resolution: self.resolution,
                sample_count: self.sample_count,
                layer_count: EYE_LAYERS,
            },
            None => EyeTarget {
                color: &slot.color_array_view,
                resolve: None,
                depth: &slot.depth_array_view,
                resolution: self.resolution,
                sample_count: 1,
                layer_count: EYE_LAYERS,
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::SlotRing;

    #[test]
    fn ring_returns_to_origin_after_a_full_rotation() {
        for length in 1..=4 {
            let mut ring = SlotRing::new(length).unwrap();
            let origin = ring.current_index();
            for _ in 0..length {
                ring.advance();
            }
            assert_eq!(ring.current_index(), origin);
        }
    }

    #[test]
    fn ring_visits_every_slot_in_order() {
        let mut ring = SlotRing::new(3).unwrap();
        let mut visited = Vec::new();
        for _ in 0..6 {
            visited.push(ring.current_index());
            ring.advance();
        }
        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn zero_length_ring_is_rejected() {
        assert!(SlotRing::new(0).is_err());
    }

    #[test]
    fn constructed_ring_reports_its_length() {
        let ring = SlotRing::new(3).unwrap();
        assert_eq!(ring.len(), 3);
        assert!(!ring.is_empty());
    }
}
