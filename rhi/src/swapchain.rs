//! Swapchain and window surface (spec §4.5, feature "window").
//!
//! Grounded on the teacher's `VulkanSwapchain`/`VulkanSwapchainImage`
//! (`vulkan/swapchain.rs`) for image-view creation and acquire/present.
//! Generalized with the present-mode fallback chain and `oldSwapchain`
//! recreation path the teacher never implements (its swapchain is created
//! once, with a single hardcoded present mode, and never rebuilt).

use ash::khr::{surface as surface_khr, swapchain as swapchain_khr};
use ash::vk;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::resource::{ImageLayout, ResourceId};
use crate::scene_types::{texture_format_to_vk, vk_to_texture_format, TextureFormat};

pub struct SwapchainImage {
    pub id: ResourceId,
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// Per-swap-buffer state machine (spec §4.5): tracked by `ResourceContext`
/// via each image's `ResourceId`; `Undefined` on first acquire, transitioned
/// to `ColorAttachment` at render-pass begin, to `PresentSrc` by the driver
/// on present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapImageState {
    Undefined,
    Rendered,
    Presented,
}

pub struct Swapchain {
    device: Arc<ash::Device>,
    surface_loader: surface_khr::Instance,
    swapchain_loader: swapchain_khr::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    swapchain: vk::SwapchainKHR,
    format: TextureFormat,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    vsync: bool,
    images: Vec<SwapchainImage>,
    image_states: Vec<SwapImageState>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

fn pick_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    if !vsync && available.contains(&vk::PresentModeKHR::IMMEDIATE) {
        return vk::PresentModeKHR::IMMEDIATE;
    }
    vk::PresentModeKHR::FIFO
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<ash::Device>,
        instance: &ash::Instance,
        surface_loader: surface_khr::Instance,
        swapchain_loader: swapchain_khr::Device,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        requested_extent: (u32, u32),
        vsync: bool,
        next_id: Arc<std::sync::atomic::AtomicU64>,
    ) -> Result<Self> {
        let mut this = Self {
            device,
            surface_loader,
            swapchain_loader,
            surface,
            physical_device,
            queue_family_index,
            swapchain: vk::SwapchainKHR::null(),
            format: TextureFormat::Bgra8Unorm,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            extent: vk::Extent2D { width: requested_extent.0, height: requested_extent.1 },
            vsync,
            images: Vec::new(),
            image_states: Vec::new(),
            next_id,
        };
        let _ = instance;
        this.recreate(requested_extent, vk::SwapchainKHR::null())?;
        Ok(this)
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn image(&self, index: u32) -> &SwapchainImage {
        &self.images[index as usize]
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroys per-image views/framebuffers, then rebuilds the swapchain
    /// against `old` as the `oldSwapchain` hint (spec §4.5 recreation).
    /// Caller must have wait-idled the device first.
    pub fn recreate(&mut self, requested_extent: (u32, u32), old: vk::SwapchainKHR) -> Result<()> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(Error::from)?
        };
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(Error::from)?
        };
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(Error::from)?
        };

        let surface_format = formats
            .iter()
            .find(|f| f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .or_else(|| formats.first())
            .copied()
            .ok_or(Error::SurfaceOutOfDate)?;
        self.format = vk_to_texture_format(surface_format.format).unwrap_or(TextureFormat::Bgra8Unorm);
        self.color_space = surface_format.color_space;

        let present_mode = pick_present_mode(&present_modes, self.vsync);

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: requested_extent.0.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: requested_extent.1.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };
        self.extent = extent;

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe {
            self.swapchain_loader.create_swapchain(&create_info, None).map_err(Error::from)?
        };

        for img in self.images.drain(..) {
            unsafe { self.device.destroy_image_view(img.view, None) };
        }
        if old != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old, None) };
        }

        let vk_images = unsafe {
            self.swapchain_loader.get_swapchain_images(swapchain).map_err(Error::from)?
        };
        let mut images = Vec::with_capacity(vk_images.len());
        for image in vk_images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            let view = unsafe { self.device.create_image_view(&view_info, None).map_err(Error::from)? };
            let id = ResourceId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
            images.push(SwapchainImage { id, image, view });
        }
        self.image_states = vec![SwapImageState::Undefined; images.len()];
        self.images = images;
        self.swapchain = swapchain;
        log::debug!(
            "swapchain (re)created: {}x{}, {} images, present_mode={:?}, format={:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode,
            self.format
        );
        Ok(())
    }

    /// Returns the acquired image's index, its `ResourceId`, and whether the
    /// result was `SUBOPTIMAL` (caller should still present this frame but
    /// schedule a recreation soon).
    pub fn acquire_next_image(&mut self, signal_semaphore: vk::Semaphore) -> Result<(u32, ResourceId, bool)> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                signal_semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => {
                self.image_states[index as usize] = SwapImageState::Rendered;
                Ok((index, self.images[index as usize].id, suboptimal))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(Error::SurfaceOutOfDate),
            Err(e) => Err(Error::from(e)),
        }
    }

    pub fn present(&mut self, image_index: u32, wait_semaphore: vk::Semaphore, queue: vk::Queue) -> Result<()> {
        let wait = [wait_semaphore];
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };
        self.image_states[image_index as usize] = SwapImageState::Presented;
        match result {
            Ok(false) => Ok(()),
            Ok(true) => Err(Error::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(Error::SurfaceOutOfDate),
            Err(e) => Err(Error::from(e)),
        }
    }
}

pub fn swapchain_layout_for_state(state: SwapImageState) -> ImageLayout {
    match state {
        SwapImageState::Undefined => ImageLayout::Undefined,
        SwapImageState::Rendered => ImageLayout::ColorAttachment,
        SwapImageState::Presented => ImageLayout::PresentSrc,
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        for img in &self.images {
            unsafe { self.device.destroy_image_view(img.view, None) };
        }
        unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_off_prefers_mailbox_over_immediate() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(pick_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn vsync_off_falls_back_to_immediate_without_mailbox() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(pick_present_mode(&modes, false), vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn mailbox_preferred_even_with_vsync_on() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(pick_present_mode(&modes, true), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn vsync_on_without_mailbox_uses_fifo_not_immediate() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(pick_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn no_preferred_mode_available_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(pick_present_mode(&modes, false), vk::PresentModeKHR::FIFO);
    }
}
