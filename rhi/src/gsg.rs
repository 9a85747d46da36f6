//! The `Gsg` control plane (spec §4.9): the single per-render-thread object
//! that owns every other subsystem in this crate and exposes the entry
//! points a scene graph traversal actually calls once per frame.
//!
//! Grounded on the teacher's `VulkanDevice`/`VulkanCommandEncoder`
//! (`vulkan/mod.rs`) for the overall submit/present shape — one mandatory
//! fence wait per frame, a render command buffer plus a dedicated transfer
//! command buffer ordered by a semaphore, `acquire -> record -> submit ->
//! present`. Unlike the teacher, which exposes this as a `Device` +
//! `CommandEncoder` trait pair a caller drives by hand, `Gsg` folds state
//! tracking, descriptor population, and pipeline selection into the draw
//! call itself, matching spec §4.9's "the scene graph traversal should not
//! need to know about barriers, descriptor sets, or pipelines."

use std::collections::HashMap;
use std::sync::{mpsc, Arc};

use ash::vk;

use crate::command_buffer::{CommandBuffer, DeferredDestroy, FrameData};
use crate::config::{GsgConfig, SET_LIGHT_ATTRIB, SET_SHADER_ATTRIB, SET_TEXTURE_ATTRIB};
use crate::descriptor_cache::{DescriptorSetCache, WriteSource};
use crate::device::GsgDevice;
use crate::error::{Error, Result};
use crate::framebuffer::{ColorAttachmentDesc, DepthAttachmentDesc, FbConfig, FbConfigTable, FramebufferCache};
use crate::memory::{MemoryAllocator, MemoryBlock};
use crate::pipeline_cache::{build_single_set_layout, PipelineCache, PipelineKey, PipelineShaderInput};
use crate::reflect::{reflect_and_transform, Descriptor, ReflectedShader};
use crate::resource::{BufferContext, ImageLayout, ResourceContext, ResourceId, TextureContext};
use crate::scene_types::{
    is_depth_format, texture_format_to_vk, GeomPrimitive, GeomVertexFormat, IndexFormat, LoadOp, PrimitiveTopology,
    Shader, StoreOp, TextureFormat,
};
use crate::shader_input::ShaderInputBinding;
use crate::state::{
    diff_states, slot_bit, Attrib, AttribSlot, AlteredMask, BlendFactor, BlendOp, ColorBlendAttrib, ColorWriteMask,
    CompareOp, CullFaceMode, LogicOp, PolygonMode, RenderState, StateCache, TransformState, TransparencyMode,
};
use crate::swapchain::{swapchain_layout_for_state, Swapchain};

fn create_buffer(
    device: &ash::Device,
    allocator: &MemoryAllocator,
    size: u64,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
) -> Result<(vk::Buffer, MemoryBlock)> {
    let create_info = vk::BufferCreateInfo::default().size(size.max(1)).usage(usage).sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.create_buffer(&create_info, None).map_err(Error::from)? };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    // Buffers are always linear resources (spec §4.1); never share a page
    // with an optimal-tiled image.
    let block = allocator.allocate(requirements.size, requirements.alignment, requirements.memory_type_bits, host_visible, true)?;
    unsafe { device.bind_buffer_memory(buffer, block.memory, block.offset).map_err(Error::from)? };
    Ok((buffer, block))
}

#[allow(clippy::too_many_arguments)]
fn create_image(
    device: &ash::Device,
    allocator: &MemoryAllocator,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
) -> Result<(vk::Image, vk::ImageView, MemoryBlock)> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(extent)
        .mip_levels(mip_levels.max(1))
        .array_layers(array_layers.max(1))
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let image = unsafe { device.create_image(&create_info, None).map_err(Error::from)? };
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    // This helper always creates OPTIMAL-tiled images (the tiling mode set
    // above); never share a page with a linear resource (spec §4.1).
    let block = allocator.allocate(requirements.size, requirements.alignment, requirements.memory_type_bits, false, false)?;
    unsafe { device.bind_image_memory(image, block.memory, block.offset).map_err(Error::from)? };
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(mip_levels.max(1))
                .base_array_layer(0)
                .layer_count(array_layers.max(1)),
        );
    let view = unsafe { device.create_image_view(&view_info, None).map_err(Error::from)? };
    Ok((image, view, block))
}

fn create_descriptor_pool(device: &ash::Device, max_sets: u32) -> Result<vk::DescriptorPool> {
    let sizes = [
        vk::DescriptorPoolSize::default().ty(vk::DescriptorType::UNIFORM_BUFFER).descriptor_count(max_sets),
        vk::DescriptorPoolSize::default().ty(vk::DescriptorType::STORAGE_BUFFER).descriptor_count(max_sets),
        vk::DescriptorPoolSize::default().ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER).descriptor_count(max_sets),
        vk::DescriptorPoolSize::default().ty(vk::DescriptorType::SAMPLED_IMAGE).descriptor_count(max_sets),
        vk::DescriptorPoolSize::default().ty(vk::DescriptorType::STORAGE_IMAGE).descriptor_count(max_sets),
    ];
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(max_sets)
        .pool_sizes(&sizes)
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
    unsafe { device.create_descriptor_pool(&create_info, None).map_err(Error::from) }
}

/// A GPU-resident, device-local (or host-visible staging) buffer.
///
/// Deliberately has no `Drop` impl: a buffer the GPU may still be reading
/// must not be destroyed the instant its owner releases it. Tearing one down
/// always goes through `Gsg::destroy_buffer`, which converts it into a
/// `DeferredDestroy` and queues it on the current frame slot, so the actual
/// `vkDestroyBuffer` (and the `MemoryBlock`'s return of its range to the
/// page) only happens once that slot's fence next signals.
pub struct GpuBuffer {
    #[allow(dead_code)]
    device: Arc<ash::Device>,
    pub buffer: vk::Buffer,
    pub size: u64,
    block: MemoryBlock,
}

impl GpuBuffer {
    fn into_deferred(self) -> DeferredDestroy {
        DeferredDestroy::BufferWithMemory(self.buffer, self.block)
    }
}

/// A GPU-resident image plus its default full-range view. See `GpuBuffer`
/// for why this has no `Drop` impl.
pub struct GpuImage {
    #[allow(dead_code)]
    device: Arc<ash::Device>,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: TextureFormat,
    pub extent: vk::Extent3D,
    pub is_depth: bool,
    block: MemoryBlock,
}

impl GpuImage {
    fn into_deferred(self) -> DeferredDestroy {
        DeferredDestroy::ImageWithMemory { image: self.image, view: self.view, block: self.block }
    }
}

/// Per-`Shader` descriptor machinery: the reflected layout plus one
/// attribute-keyed `DescriptorSetCache` for each of the three attribute-driven
/// sets (spec §6). `Gsg` builds one of these the first time a given `Shader`
/// is bound and keeps it for the `Shader`'s lifetime (keyed by its `Arc`
/// pointer, mirroring `pipeline_cache.rs`'s `shader_id`).
struct ShaderProgram {
    device: Arc<ash::Device>,
    reflected: ReflectedShader,
    light_layout: vk::DescriptorSetLayout,
    texture_layout: vk::DescriptorSetLayout,
    shader_layout: vk::DescriptorSetLayout,
    light_cache: DescriptorSetCache,
    texture_cache: DescriptorSetCache,
    shader_cache: DescriptorSetCache,
    /// Set 3 (`DynamicUniforms`) is keyed per-draw, not per-attribute, so it
    /// has no weak-reference cache of its own: a pool of pre-allocated sets
    /// rewritten round-robin each draw that declares a set-3 binding.
    dynamic_layout: Option<vk::DescriptorSetLayout>,
    dynamic_sets: Vec<vk::DescriptorSet>,
    dynamic_cursor: usize,
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.light_layout, None);
            self.device.destroy_descriptor_set_layout(self.texture_layout, None);
            self.device.destroy_descriptor_set_layout(self.shader_layout, None);
            if let Some(l) = self.dynamic_layout {
                self.device.destroy_descriptor_set_layout(l, None);
            }
        }
    }
}

impl ShaderProgram {
    fn new(device: Arc<ash::Device>, reflected: ReflectedShader, max_sets: u32) -> Result<Self> {
        let by_set = |set: u32| -> Vec<Descriptor> {
            reflected.descriptors.iter().filter(|d| d.set == set).cloned().collect()
        };
        let light_descriptors = by_set(SET_LIGHT_ATTRIB);
        let texture_descriptors = by_set(SET_TEXTURE_ATTRIB);
        let shader_descriptors = by_set(SET_SHADER_ATTRIB);
        let dynamic_descriptors = by_set(crate::config::SET_DYNAMIC_UNIFORMS);

        let light_layout = build_single_set_layout(&device, &light_descriptors)?;
        let texture_layout = build_single_set_layout(&device, &texture_descriptors)?;
        let shader_layout = build_single_set_layout(&device, &shader_descriptors)?;

        let light_pool = create_descriptor_pool(&device, max_sets)?;
        let texture_pool = create_descriptor_pool(&device, max_sets)?;
        let shader_pool = create_descriptor_pool(&device, max_sets)?;
        let light_cache = DescriptorSetCache::new(Arc::clone(&device), light_pool, light_layout);
        let texture_cache = DescriptorSetCache::new(Arc::clone(&device), texture_pool, texture_layout);
        let shader_cache = DescriptorSetCache::new(Arc::clone(&device), shader_pool, shader_layout);

        let (dynamic_layout, dynamic_sets) = if dynamic_descriptors.is_empty() {
            (None, Vec::new())
        } else {
            let layout = build_single_set_layout(&device, &dynamic_descriptors)?;
            let pool = create_descriptor_pool(&device, max_sets)?;
            let layouts = vec![layout; max_sets as usize];
            let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts);
            let sets = unsafe { device.allocate_descriptor_sets(&alloc_info).map_err(Error::from)? };
            // `pool` is intentionally never explicitly destroyed: its sets
            // live exactly as long as `Gsg` and it has no attribute to
            // outlive, so it is leaked to the process exit like the
            // teacher's own `VulkanDevice::descriptor_pool` in headless
            // tests. Tracked as a DESIGN.md open item for a proper owner.
            (Some(layout), sets)
        };

        Ok(Self {
            device,
            reflected,
            light_layout,
            texture_layout,
            shader_layout,
            light_cache,
            texture_cache,
            shader_cache,
            dynamic_layout,
            dynamic_sets,
            dynamic_cursor: 0,
        })
    }
}

/// One pending async readback (spec §6: `ScreenshotRequest`). `Gsg` keeps the
/// staging buffer and sender until the command buffer that recorded the copy
/// has retired (tracked by frame slot), then maps the buffer, copies its
/// bytes through the channel, and lets the buffer drop.
struct QueuedDownload {
    staging: GpuBuffer,
    sender: mpsc::Sender<Vec<u8>>,
}

/// A future-like handle to an in-flight `framebuffer_copy_to_ram` (spec §6).
/// `try_recv` never blocks; the bytes become available once the frame that
/// recorded the copy has retired.
pub struct ScreenshotRequest {
    pub frame_number: u64,
    pub result_texture: ResourceId,
    /// Files the caller intends to write the resolved bytes to. The core
    /// does no file I/O itself (out of scope, spec §1); this is bookkeeping
    /// for the caller to consult once `try_recv` resolves.
    pub pending_output_files: Vec<std::path::PathBuf>,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl ScreenshotRequest {
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ColorTarget {
    Swapchain,
    Texture(ResourceId),
}

pub struct RenderTargets<'a> {
    pub colors: &'a [ColorTarget],
    pub depth: Option<ResourceId>,
    pub clear_colors: &'a [[f32; 4]],
    pub clear_depth: Option<f32>,
}

struct ActiveRenderPass {
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    fb_config_colors: Vec<TextureFormat>,
    fb_config_depth: Option<TextureFormat>,
    fb_config_id: u32,
    swapchain_image_index: Option<u32>,
}

/// One input to a draw call (spec §4.9): a shader, the geometry it reads,
/// the bindings that feed its descriptor sets/push constants, and the
/// framebuffer format tuple the active render pass was opened with.
pub struct DrawInput<'a> {
    pub shader: &'a Shader,
    pub vertex_format: &'a GeomVertexFormat,
    /// One `(stable id, raw bytes)` pair per vertex array binding. The id is
    /// the caller's concern to keep stable across frames so a previously
    /// uploaded buffer is reused instead of re-staged every draw.
    pub vertex_buffers: &'a [(ResourceId, &'a [u8])],
    pub index_buffer: Option<(ResourceId, &'a [u8], IndexFormat)>,
    pub primitive: &'a GeomPrimitive,
    pub bindings: &'a [&'a dyn ShaderInputBinding],
}

pub struct Gsg {
    device: Arc<GsgDevice>,
    config: GsgConfig,
    frames: FrameData,
    allocator: MemoryAllocator,
    framebuffers: FramebufferCache,
    fb_configs: FbConfigTable,
    pipelines: PipelineCache,
    resources: ResourceContext,
    state_cache: StateCache,
    swapchain: Option<Swapchain>,
    sampler: vk::Sampler,

    shader_programs: HashMap<u64, ShaderProgram>,
    buffers: HashMap<ResourceId, GpuBuffer>,
    images: HashMap<ResourceId, GpuImage>,

    /// Host-visible staging buffers awaiting the fence of the frame slot that
    /// recorded their copy, indexed by slot. Staging buffers are internal
    /// (never handed back to a caller as a `ResourceId`), so they get this
    /// simpler slot-indexed queue rather than `FrameSlot::queue_destroy`'s
    /// `DeferredDestroy` list.
    staging_pending_free: Vec<Vec<(vk::Buffer, MemoryBlock)>>,
    pending_downloads: Vec<Vec<QueuedDownload>>,
    /// Pixel data given to `create_texture` but not yet copied onto the GPU
    /// image; drained by `ensure_texture_uploaded` the first time the
    /// texture is actually bound.
    pending_texture_uploads: HashMap<ResourceId, Vec<u8>>,

    current_state: RenderState,
    current_transform: TransformState,
    altered: AlteredMask,
    bound_pipeline: Option<(vk::Pipeline, vk::PipelineLayout)>,

    active_render_pass: Option<ActiveRenderPass>,
    active_swapchain_image: Option<(u32, ResourceId)>,

    frame_slot_index: usize,
    frame_number: u64,
    valid: bool,
    needs_swapchain_recreate: bool,
}

impl Gsg {
    /// Retries a buffer/image creation closure once after draining every
    /// retired frame slot's pending-destroy queue (spec §4.1 allocation
    /// fallback). `MemoryAllocator::allocate` reports failure as soon as no
    /// existing page has room and growing a fresh page also failed or hit
    /// the size cap; in the common case that just means the blocks freed by
    /// earlier-but-not-yet-recycled frames haven't been returned to their
    /// page's free list yet, so draining and retrying once is worth it
    /// before surfacing `Error::AllocationFailed` to the caller.
    fn with_allocation_retry<T>(&mut self, f: impl Fn(&ash::Device, &MemoryAllocator) -> Result<T>) -> Result<T> {
        match f(&self.device.device, &self.allocator) {
            Err(Error::AllocationFailed { requested, largest_free }) => {
                log::warn!(
                    "allocation of {requested} bytes failed (largest free block of matching class: {largest_free}); draining retired frame resources and retrying once"
                );
                self.frames.drain_all_pending_destroys()?;
                f(&self.device.device, &self.allocator)
            }
            other => other,
        }
    }

    /// Headless construction (spec §1: render-to-texture / test harness use).
    pub fn new(config: GsgConfig) -> Result<Self> {
        let device = GsgDevice::new()?;
        Self::from_device(device, config, None)
    }

    /// Windowed construction against a caller-owned surface; see
    /// `device::GsgDevice::new_with_surface` for the platform boundary.
    pub fn new_windowed(
        config: GsgConfig,
        instance_extensions: &[&'static std::ffi::CStr],
        surface_loader_factory: impl FnOnce(&ash::Entry, &ash::Instance) -> ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        extent: (u32, u32),
        vsync: bool,
    ) -> Result<Self> {
        let device = GsgDevice::new_with_surface(instance_extensions, surface_loader_factory, surface)?;
        let surface_loader = ash::khr::surface::Instance::new(
            &unsafe { ash::Entry::load().map_err(|e| Error::ValidationFailed(e.to_string()))? },
            &device.instance,
        );
        let swapchain_loader = device.swapchain_loader();
        let swapchain = Swapchain::new(
            Arc::clone(&device.device),
            &device.instance,
            surface_loader,
            swapchain_loader,
            surface,
            device.physical_device,
            device.queue_family_index,
            extent,
            vsync,
            device.next_id_counter(),
        )?;
        Self::from_device(device, config, Some(swapchain))
    }

    fn from_device(device: Arc<GsgDevice>, config: GsgConfig, swapchain: Option<Swapchain>) -> Result<Self> {
        let frames = FrameData::new(Arc::clone(&device.device), device.command_pool, config.frames_in_flight)?;
        let allocator =
            MemoryAllocator::new(Arc::clone(&device.device), device.instance.clone(), device.physical_device, config.memory_page_size);
        let framebuffers = FramebufferCache::new(Arc::clone(&device.device));
        let pipelines = PipelineCache::new(Arc::clone(&device.device));
        let state_cache = StateCache::default();
        let current_state = state_cache.empty();
        let current_transform = crate::state::identity_transform();

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { device.device.create_sampler(&sampler_info, None).map_err(Error::from)? };

        let frames_in_flight = config.frames_in_flight as usize;

        Ok(Self {
            device,
            config,
            frames,
            allocator,
            framebuffers,
            fb_configs: FbConfigTable::default(),
            pipelines,
            resources: ResourceContext::default(),
            state_cache,
            swapchain,
            sampler,
            shader_programs: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            staging_pending_free: (0..frames_in_flight).map(|_| Vec::new()).collect(),
            pending_downloads: (0..frames_in_flight).map(|_| Vec::new()).collect(),
            pending_texture_uploads: HashMap::new(),
            current_state,
            current_transform,
            altered: 0,
            bound_pipeline: None,
            active_render_pass: None,
            active_swapchain_image: None,
            frame_slot_index: 0,
            frame_number: 0,
            valid: true,
            needs_swapchain_recreate: false,
        })
    }

    /// Spec §7: every draw-call entry point is a no-op once the device is
    /// lost, so a caller mid-traversal can check once rather than handling
    /// an error from every single call.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn mark_invalid_on(&mut self, err: Error) -> Error {
        if matches!(err, Error::DeviceLost) {
            log::error!("gsg: device lost, no further draw calls will be honored");
            self.valid = false;
        }
        err
    }

    /// Spec §5/§4.9: waits the mandatory per-frame fence, runs deferred
    /// resource teardown and pending screenshot downloads for the slot about
    /// to be reused, and begins recording both its command buffers.
    pub fn begin_frame(&mut self) -> Result<()> {
        if !self.valid {
            return Err(Error::DeviceLost);
        }
        let slot_index = self.frame_slot_index;
        let result = (|| -> Result<()> {
            let slot = self.frames.begin_frame()?;
            self.resources.begin_command_buffer();
            slot.transfer_command_buffer.begin()?;
            slot.command_buffer.begin()?;
            Ok(())
        })();
        if let Err(e) = result {
            return Err(self.mark_invalid_on(e));
        }

        for (buffer, _block) in self.staging_pending_free[slot_index].drain(..) {
            unsafe { self.device.device.destroy_buffer(buffer, None) };
        }
        for download in self.pending_downloads[slot_index].drain(..) {
            let bytes = download
                .staging
                .block_bytes()
                .map(|b| b.to_vec())
                .unwrap_or_default();
            let _ = download.sender.send(bytes);
        }

        self.frame_number += 1;
        Ok(())
    }

    /// Acquires a swapchain image if windowed and not yet acquired this
    /// frame, transitions every target into its attachment layout, and
    /// begins the render pass (spec §4.4/§4.9).
    pub fn begin_render_cmd(&mut self, targets: &RenderTargets<'_>) -> Result<()> {
        if !self.valid {
            return Err(Error::DeviceLost);
        }
        let result = self.begin_render_cmd_inner(targets);
        result.map_err(|e| self.mark_invalid_on(e))
    }

    fn begin_render_cmd_inner(&mut self, targets: &RenderTargets<'_>) -> Result<()> {
        let slot_index = self.frame_slot_index;
        if self.active_swapchain_image.is_none() && targets.colors.contains(&ColorTarget::Swapchain) {
            let swapchain = self.swapchain.as_mut().ok_or_else(|| {
                Error::ValidationFailed("RenderTargets references ColorTarget::Swapchain but Gsg is headless".into())
            })?;
            let image_available = self.frames.current_slot().image_available;
            let (index, id, suboptimal) = swapchain.acquire_next_image(image_available)?;
            if suboptimal {
                self.needs_swapchain_recreate = true;
            }
            self.active_swapchain_image = Some((index, id));
        }

        let mut color_views = Vec::with_capacity(targets.colors.len());
        let mut color_formats = Vec::with_capacity(targets.colors.len());
        let mut color_descs = Vec::with_capacity(targets.colors.len());
        let mut extent = vk::Extent2D::default();
        let mut swapchain_image_index = None;

        for target in targets.colors {
            match target {
                ColorTarget::Swapchain => {
                    let swapchain = self.swapchain.as_ref().expect("checked above");
                    let (index, _id) = self.active_swapchain_image.expect("acquired above");
                    swapchain_image_index = Some(index);
                    let image = swapchain.image(index);
                    let (w, h) = swapchain.extent();
                    extent = vk::Extent2D { width: w, height: h };
                    let format = swapchain.format();
                    color_formats.push(format);
                    color_views.push(image.view);
                    self.resources.register_texture(image.id, TextureContext::new(ImageLayout::Undefined, false));
                    let cb_seq = self.frames.current_slot().command_buffer.seq();
                    self.resources.note_texture_write(
                        image.id,
                        image.image,
                        ImageLayout::ColorAttachment,
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        &mut self.frames.current_slot().command_buffer.barrier_pool,
                        cb_seq,
                    );
                    color_descs.push(ColorAttachmentDesc {
                        format,
                        load_op: LoadOp::Clear,
                        store_op: StoreOp::Store,
                        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    });
                }
                ColorTarget::Texture(id) => {
                    let image = self.images.get(id).ok_or_else(|| {
                        Error::ValidationFailed(format!("color target {id:?} has no GpuImage; create it first"))
                    })?;
                    extent = vk::Extent2D { width: image.extent.width, height: image.extent.height };
                    color_formats.push(image.format);
                    color_views.push(image.view);
                    let cb_seq = self.frames.current_slot().command_buffer.seq();
                    self.resources.note_texture_write(
                        *id,
                        image.image,
                        ImageLayout::ColorAttachment,
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        &mut self.frames.current_slot().command_buffer.barrier_pool,
                        cb_seq,
                    );
                    color_descs.push(ColorAttachmentDesc {
                        format: image.format,
                        load_op: LoadOp::Clear,
                        store_op: StoreOp::Store,
                        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                }
            }
        }

        let mut depth_view = None;
        let mut depth_format = None;
        if let Some(id) = targets.depth {
            let image = self
                .images
                .get(&id)
                .ok_or_else(|| Error::ValidationFailed(format!("depth target {id:?} has no GpuImage; create it first")))?;
            depth_format = Some(image.format);
            depth_view = Some(image.view);
            let cb_seq = self.frames.current_slot().command_buffer.seq();
            self.resources.note_texture_write(
                id,
                image.image,
                ImageLayout::DepthStencilAttachment,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                &mut self.frames.current_slot().command_buffer.barrier_pool,
                cb_seq,
            );
        }

        self.frames.current_slot().command_buffer.flush_barriers();

        let depth_desc = depth_format.map(|format| DepthAttachmentDesc { format, load_op: LoadOp::Clear, store_op: StoreOp::Store });
        let render_pass = self.framebuffers.get_or_create_render_pass(&color_descs, depth_desc.as_ref())?;
        let mut attachment_views = color_views.clone();
        if let Some(v) = depth_view {
            attachment_views.push(v);
        }
        let framebuffer = self.framebuffers.get_or_create_framebuffer(render_pass, &attachment_views, extent)?;

        let mut clear_values: Vec<vk::ClearValue> = targets
            .clear_colors
            .iter()
            .map(|c| vk::ClearValue { color: vk::ClearColorValue { float32: *c } })
            .collect();
        if clear_values.len() < color_descs.len() {
            clear_values.resize(color_descs.len(), vk::ClearValue { color: vk::ClearColorValue { float32: [0.0; 4] } });
        }
        if let Some(depth) = targets.clear_depth {
            clear_values.push(vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 } });
        }

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
            .clear_values(&clear_values);
        let cmd = self.frames.current_slot().command_buffer.raw();
        unsafe {
            self.device.device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.device.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cmd, 0, &[vk::Rect2D { offset: vk::Offset2D::default(), extent }]);
        }

        let fb_config = FbConfig { color_formats: color_formats.clone(), depth_format };
        let fb_config_id = self.fb_configs.id_for(&fb_config);

        self.active_render_pass = Some(ActiveRenderPass {
            render_pass,
            extent,
            fb_config_colors: color_formats,
            fb_config_depth: depth_format,
            fb_config_id,
            swapchain_image_index,
        });
        self.bound_pipeline = None;
        let _ = slot_index;
        Ok(())
    }

    /// Spec §3/§9: diffs against the previously bound state and records only
    /// the altered slots, lazily resolved at the next draw call.
    pub fn set_state_and_transform(&mut self, state: RenderState, transform: TransformState) {
        let altered = diff_states(&self.current_state, &state);
        self.altered |= altered;
        self.current_state = state;
        self.current_transform = transform;
    }

    fn get_or_create_shader_program(&mut self, shader: &Shader) -> Result<u64> {
        let shader_id = shader as *const Shader as u64;
        if !self.shader_programs.contains_key(&shader_id) {
            let reflected = reflect_and_transform(shader)?;
            let program = ShaderProgram::new(Arc::clone(&self.device.device), reflected, self.config.descriptor_pool_max_sets)?;
            self.shader_programs.insert(shader_id, program);
        }
        Ok(shader_id)
    }

    fn pipeline_key(&self, shader_id: u64, vertex_format: &GeomVertexFormat, topology: PrimitiveTopology, fb_config_id: u32) -> PipelineKey {
        let attrib = |slot: AttribSlot| self.current_state.attribs[slot as usize].as_deref();
        let cull_face = match attrib(AttribSlot::CullFace) {
            Some(Attrib::CullFace(m)) => *m,
            _ => CullFaceMode::Back,
        };
        let depth_write = match attrib(AttribSlot::DepthWrite) {
            Some(Attrib::DepthWrite(w)) => *w,
            _ => true,
        };
        let depth_test = match attrib(AttribSlot::DepthTest) {
            Some(Attrib::DepthTest(op)) => *op,
            _ => CompareOp::Less,
        };
        let color_write = match attrib(AttribSlot::ColorWrite) {
            Some(Attrib::ColorWrite(mask)) => *mask,
            _ => ColorWriteMask::all(),
        };
        let logic_op = match attrib(AttribSlot::LogicOp) {
            Some(Attrib::LogicOp(op)) => *op,
            _ => LogicOp::None,
        };
        let transparency = match attrib(AttribSlot::Transparency) {
            Some(Attrib::Transparency(t)) => *t,
            _ => TransparencyMode::None,
        };
        let custom_blend = match attrib(AttribSlot::ColorBlend) {
            Some(Attrib::ColorBlend(b)) => Some(*b),
            _ => None,
        };
        let render_mode = match attrib(AttribSlot::RenderMode) {
            Some(Attrib::RenderMode(m)) => *m,
            _ => PolygonMode::Filled,
        };
        let blend = custom_blend.unwrap_or(ColorBlendAttrib {
            enabled: false,
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            op: BlendOp::Add,
        });

        PipelineKey {
            shader_id,
            vertex_format_id: vertex_format as *const GeomVertexFormat as u64,
            topology: topology.into(),
            fb_config_id,
            cull_face: cull_face.into(),
            depth_write,
            depth_test: depth_test.into(),
            color_write: color_write.bits(),
            logic_op: logic_op.into(),
            color_blend: blend.into(),
            transparency: transparency.into(),
            render_mode: render_mode.into(),
        }
    }

    /// Uploads `data` into a device-local buffer keyed by `id` the first time
    /// it is seen; later calls with the same `id` just return the cached
    /// buffer. Grounded on the teacher's `upload_to_buffer`
    /// (`vulkan/mod.rs`): a host-visible staging buffer copied through the
    /// transfer command buffer, freed once that frame's fence signals.
    fn ensure_buffer_uploaded(&mut self, id: ResourceId, data: &[u8], usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        if let Some(existing) = self.buffers.get(&id) {
            return Ok(existing.buffer);
        }
        let data_len = data.len() as u64;
        let (buffer, block) =
            self.with_allocation_retry(|device, allocator| create_buffer(device, allocator, data_len, usage | vk::BufferUsageFlags::TRANSFER_DST, false))?;
        let (staging_buffer, staging_block) = self
            .with_allocation_retry(|device, allocator| create_buffer(device, allocator, data_len, vk::BufferUsageFlags::TRANSFER_SRC, true))?;
        let device = Arc::clone(&self.device.device);
        if let Some(mut mapped) = staging_block.map() {
            mapped.as_mut_slice()[..data.len()].copy_from_slice(data);
        }

        let slot = self.frames.current_slot();
        let copy = vk::BufferCopy::default().size(data.len() as u64);
        unsafe {
            device.cmd_copy_buffer(slot.transfer_command_buffer.raw(), staging_buffer, buffer, std::slice::from_ref(&copy));
        }

        let cb_seq = slot.transfer_command_buffer.seq();
        self.resources.register_buffer(id, BufferContext::new(false));
        self.resources.note_buffer_write(
            id,
            buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            &mut slot.transfer_command_buffer.barrier_pool,
            cb_seq,
        );
        let read_stage = if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
            vk::PipelineStageFlags::VERTEX_INPUT
        } else {
            vk::PipelineStageFlags::VERTEX_INPUT
        };
        let read_access = if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
            vk::AccessFlags::INDEX_READ
        } else {
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ
        };
        self.resources.note_buffer_write(id, buffer, read_stage, read_access, &mut slot.transfer_command_buffer.barrier_pool, cb_seq);

        self.staging_pending_free[self.frame_slot_index].push((staging_buffer, staging_block));
        self.buffers.insert(id, GpuBuffer { device, buffer, size: data.len() as u64, block });
        Ok(buffer)
    }

    /// Resolves a `ShaderInputBinding`'s output into push-constant bytes or a
    /// descriptor-set write source, per its `InputKind` (spec §6).
    fn resolve_binding_bytes(&self, binding: &dyn ShaderInputBinding, out: &mut [u8]) -> usize {
        if let Some(mvp) = binding.as_any().downcast_ref::<crate::shader_input::MvpBinding>() {
            let _ = mvp;
            let n = (16 * 4).min(out.len());
            for (i, v) in self.current_transform.iter().enumerate() {
                let bytes = v.to_le_bytes();
                let off = i * 4;
                if off + 4 <= n {
                    out[off..off + 4].copy_from_slice(&bytes);
                }
            }
            return n;
        }
        binding.fetch_data(&self.current_state, out)
    }

    /// Records one draw call (spec §4.9 `draw_X`): resolves/uploads geometry
    /// buffers, selects or builds the pipeline for the current `RenderState`,
    /// refreshes only the descriptor sets whose backing attributes changed
    /// since the last draw, and issues `vkCmdDraw`/`vkCmdDrawIndexed`.
    pub fn draw(&mut self, input: DrawInput<'_>) -> Result<()> {
        if !self.valid {
            return Err(Error::DeviceLost);
        }
        let result = self.draw_inner(input);
        result.map_err(|e| self.mark_invalid_on(e))
    }

    fn draw_inner(&mut self, input: DrawInput<'_>) -> Result<()> {
        let active = self
            .active_render_pass
            .as_ref()
            .ok_or_else(|| Error::ValidationFailed("draw called outside begin_render_cmd/end_render_cmd".into()))?;
        let fb_config_id = active.fb_config_id;
        let fb_colors = active.fb_config_colors.clone();
        let fb_depth = active.fb_config_depth;

        let shader_id = self.get_or_create_shader_program(input.shader)?;

        let mut vertex_buffers = Vec::with_capacity(input.vertex_buffers.len());
        for (id, data) in input.vertex_buffers {
            let buffer = self.ensure_buffer_uploaded(*id, data, vk::BufferUsageFlags::VERTEX_BUFFER)?;
            vertex_buffers.push(buffer);
        }
        let index_buffer = match input.index_buffer {
            Some((id, data, format)) => {
                let buffer = self.ensure_buffer_uploaded(id, data, vk::BufferUsageFlags::INDEX_BUFFER)?;
                Some((buffer, format))
            }
            None => None,
        };

        let key = self.pipeline_key(shader_id, input.vertex_format, input.primitive.topology, fb_config_id);
        let program = self.shader_programs.get(&shader_id).expect("just created above");
        let (pipeline, layout) = {
            let shader_input = PipelineShaderInput {
                spirv_vertex: &program.reflected.spirv_vertex,
                spirv_fragment: &program.reflected.spirv_fragment,
                entry_point_vertex: &input.shader.vertex.entry_point,
                entry_point_fragment: &input.shader.fragment.entry_point,
                descriptors: &program.reflected.descriptors,
                push_constants: program.reflected.push_constants,
            };
            self.pipelines.get_or_create(key.clone(), &shader_input, input.vertex_format, &mut self.framebuffers, &fb_colors, fb_depth)?
        };

        let cmd = self.frames.current_slot().command_buffer.raw();
        if self.bound_pipeline != Some((pipeline, layout)) {
            unsafe { self.device.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline) };
            self.bound_pipeline = Some((pipeline, layout));
        }

        let push_constants = program.reflected.push_constants;
        let mut push_bytes = vec![0u8; push_constants.size];
        for binding in input.bindings {
            if binding.kind() != crate::shader_input::InputKind::PushConstantBytes {
                continue;
            }
            let offset = if binding.as_any().is::<crate::shader_input::MvpBinding>() {
                push_constants.mvp_offset
            } else {
                push_constants.color_scale_offset
            };
            let written = self.resolve_binding_bytes(*binding, &mut push_bytes[offset..]);
            let _ = written;
        }
        if !push_bytes.is_empty() {
            unsafe {
                self.device.device.cmd_push_constants(
                    cmd,
                    layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    &push_bytes,
                );
            }
        }

        self.bind_descriptor_sets(shader_id, layout, input.bindings)?;

        let bindings: Vec<vk::Buffer> = vertex_buffers;
        if !bindings.is_empty() {
            let offsets = vec![0u64; bindings.len()];
            unsafe { self.device.device.cmd_bind_vertex_buffers(cmd, 0, &bindings, &offsets) };
        }

        unsafe {
            if let Some((buffer, format)) = index_buffer {
                let vk_format = match format {
                    IndexFormat::Uint16 => vk::IndexType::UINT16,
                    IndexFormat::Uint32 => vk::IndexType::UINT32,
                };
                self.device.device.cmd_bind_index_buffer(cmd, buffer, 0, vk_format);
                self.device.device.cmd_draw_indexed(
                    cmd,
                    input.primitive.vertex_count,
                    input.primitive.instance_count.max(1),
                    0,
                    input.primitive.first_vertex as i32,
                    0,
                );
            } else {
                self.device.device.cmd_draw(
                    cmd,
                    input.primitive.vertex_count,
                    input.primitive.instance_count.max(1),
                    input.primitive.first_vertex,
                    0,
                );
            }
        }

        self.altered = 0;
        Ok(())
    }

    /// Populates (on a cache miss or when the owning attribute's bits are in
    /// `self.altered`) and binds descriptor sets 0-2, then set 3 if the
    /// shader declares any dynamic-uniform bindings.
    fn bind_descriptor_sets(&mut self, shader_id: u64, layout: vk::PipelineLayout, bindings: &[&dyn ShaderInputBinding]) -> Result<()> {
        let cmd = self.frames.current_slot().command_buffer.raw();
        let current_frame = self.frame_number;
        let program = self.shader_programs.get_mut(&shader_id).expect("program exists");

        for binding in bindings {
            let kind = binding.kind();
            if kind == crate::shader_input::InputKind::PushConstantBytes {
                continue;
            }
            let Some(attrib_id) = binding.get_resource_id(&self.current_state) else { continue };
            let (set_number, cache, owner_slot) = if let Some(_id) = binding.fetch_texture(&self.current_state) {
                (SET_TEXTURE_ATTRIB, &mut program.texture_cache, AttribSlot::Texture)
            } else if matches!(binding.as_any().downcast_ref::<crate::shader_input::ShaderAttribUboBinding>(), Some(_)) {
                (SET_SHADER_ATTRIB, &mut program.shader_cache, AttribSlot::ShaderAttrib)
            } else {
                (SET_LIGHT_ATTRIB, &mut program.light_cache, AttribSlot::Light)
            };

            let owner = match self.current_state.attribs[owner_slot as usize].clone() {
                Some(a) => a,
                None => continue,
            };
            let descriptors: Vec<Descriptor> = program.reflected.descriptors.iter().filter(|d| d.set == set_number).cloned().collect();

            let mut sources = Vec::new();
            if kind == crate::shader_input::InputKind::SampledTexture {
                if let Some(tex_id) = binding.fetch_texture(&self.current_state) {
                    self.ensure_texture_uploaded(tex_id)?;
                    if let Some(image) = self.images.get(&tex_id) {
                        let image_handle = image.image;
                        let view = image.view;
                        // Sampled textures are read by draws, never written here, so this
                        // is always a read transition into ShaderReadOnly (spec §4.2).
                        let cb_seq = self.frames.current_slot().command_buffer.seq();
                        self.resources.note_texture_read(
                            tex_id,
                            image_handle,
                            ImageLayout::ShaderReadOnly,
                            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                            &mut self.frames.current_slot().command_buffer.barrier_pool,
                            cb_seq,
                        );
                        self.frames.current_slot().command_buffer.flush_barriers();
                        sources.push((
                            descriptors.first().map(|d| d.binding).unwrap_or(0),
                            WriteSource::Image { view, sampler: self.sampler, layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL },
                        ));
                    }
                }
            } else if let Some(buf_id) = self.buffers.get(&attrib_id).map(|_| attrib_id) {
                if let Some(buf) = self.buffers.get(&buf_id) {
                    sources.push((descriptors.first().map(|d| d.binding).unwrap_or(0), WriteSource::Buffer { buffer: buf.buffer, offset: 0, range: buf.size }));
                }
            }

            let set = cache.get_or_populate(attrib_id, &owner, &descriptors, &sources, current_frame)?;
            unsafe {
                self.device.device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, layout, set_number, &[set], &[]);
            }
        }
        Ok(())
    }

    pub fn end_render_cmd(&mut self) -> Result<()> {
        if !self.valid {
            return Err(Error::DeviceLost);
        }
        let cmd = self.frames.current_slot().command_buffer.raw();
        unsafe { self.device.device.cmd_end_render_pass(cmd) };
        self.active_render_pass = None;
        self.bound_pipeline = None;
        Ok(())
    }

    /// Spec §4.9/§5: ends and submits both command buffers (transfer first,
    /// ordered into the render CB by `transfers_done`), presents if windowed,
    /// sweeps every descriptor-set cache's dead entries, and advances the
    /// frame-in-flight ring.
    pub fn end_frame(&mut self) -> Result<()> {
        if !self.valid {
            return Err(Error::DeviceLost);
        }
        let result = self.end_frame_inner();
        result.map_err(|e| self.mark_invalid_on(e))
    }

    fn end_frame_inner(&mut self) -> Result<()> {
        let slot_index = self.frame_slot_index;
        let swapchain_index = self.active_swapchain_image.map(|(i, _)| i);
        {
            let slot = self.frames.current_slot();
            slot.transfer_command_buffer.end()?;
            slot.command_buffer.end()?;

            let transfer_buffers = [slot.transfer_command_buffer.raw()];
            let transfer_submit =
                vk::SubmitInfo::default().command_buffers(&transfer_buffers).signal_semaphores(std::slice::from_ref(&slot.transfers_done));
            unsafe {
                self.device.device.queue_submit(self.device.queue, &[transfer_submit], vk::Fence::null()).map_err(Error::from)?;
            }

            let render_buffers = [slot.command_buffer.raw()];
            let mut wait_semaphores = vec![slot.transfers_done];
            let mut wait_stages = vec![vk::PipelineStageFlags::TOP_OF_PIPE];
            if swapchain_index.is_some() {
                wait_semaphores.push(slot.image_available);
                wait_stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
            }
            let signal_semaphores = [slot.render_finished];
            let render_submit = vk::SubmitInfo::default()
                .command_buffers(&render_buffers)
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(&signal_semaphores);
            unsafe {
                self.device.device.queue_submit(self.device.queue, &[render_submit], slot.fence).map_err(Error::from)?;
            }
        }

        if let Some(index) = swapchain_index {
            let render_finished = self.frames.current_slot().render_finished;
            let present_result = self.swapchain.as_mut().expect("swapchain image acquired").present(index, render_finished, self.device.queue);
            match present_result {
                Ok(()) => {}
                Err(Error::Suboptimal) => self.needs_swapchain_recreate = true,
                Err(Error::SurfaceOutOfDate) => self.needs_swapchain_recreate = true,
                Err(e) => return Err(e),
            }
        }

        let mut dead_sets: Vec<DeferredDestroy> = Vec::new();
        for program in self.shader_programs.values_mut() {
            for cache in [&mut program.light_cache, &mut program.texture_cache, &mut program.shader_cache] {
                let dead = cache.sweep();
                if !dead.is_empty() {
                    dead_sets.push(DeferredDestroy::DescriptorSets { pool: cache.pool(), sets: dead });
                }
            }
        }
        if !dead_sets.is_empty() {
            let slot = self.frames.current_slot();
            for item in dead_sets {
                slot.queue_destroy(item);
            }
        }

        self.active_swapchain_image = None;
        self.frames.advance();
        self.frame_slot_index = (slot_index + 1) % self.config.frames_in_flight as usize;
        Ok(())
    }

    /// Recreates the swapchain against the current surface extent. Callers
    /// should check `needs_swapchain_recreate()` after `end_frame` and call
    /// this (after waiting the device idle) before the next `begin_frame`.
    pub fn recreate_swapchain(&mut self, extent: (u32, u32)) -> Result<()> {
        unsafe { self.device.device.device_wait_idle().map_err(Error::from)? };
        let swapchain = self.swapchain.as_mut().ok_or_else(|| Error::ValidationFailed("no swapchain to recreate".into()))?;
        let old = vk::SwapchainKHR::null();
        swapchain.recreate(extent, old)?;
        self.needs_swapchain_recreate = false;
        Ok(())
    }

    pub fn needs_swapchain_recreate(&self) -> bool {
        self.needs_swapchain_recreate
    }

    /// Mints a fresh, process-unique `ResourceId` for a caller-owned buffer
    /// or texture the caller is about to hand to `draw`/`create_texture`.
    pub fn next_resource_id(&self) -> ResourceId {
        self.device.next_id()
    }

    /// Creates a GPU-resident render-target/sampled texture (spec §6):
    /// image + view + device-local memory, registered with
    /// `ResourceContext` so later draws/copies get automatic barriers. If
    /// `texture.initial_data` is given, the actual upload is deferred to
    /// `ensure_texture_uploaded` the first time the texture is bound, since
    /// no command buffer may be recording yet when assets are created.
    pub fn create_texture(&mut self, texture: &crate::scene_types::Texture) -> Result<()> {
        let is_depth = is_depth_format(texture.format);
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        usage |= if is_depth { vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT } else { vk::ImageUsageFlags::COLOR_ATTACHMENT };
        let aspect = if is_depth { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR };
        let extent = vk::Extent3D { width: texture.extent.0, height: texture.extent.1, depth: texture.extent.2.max(1) };
        let format = texture_format_to_vk(texture.format);
        let mip_levels = texture.mip_levels;
        let array_layers = texture.array_layers;
        let (image, view, block) = self.with_allocation_retry(|device, allocator| {
            create_image(device, allocator, format, extent, mip_levels, array_layers, usage, aspect)
        })?;
        self.resources.register_texture(texture.id, TextureContext::new(ImageLayout::Undefined, is_depth));
        self.images.insert(texture.id, GpuImage { device: Arc::clone(&self.device.device), image, view, format: texture.format, extent, is_depth, block });
        if let Some(data) = &texture.initial_data {
            self.pending_texture_uploads.insert(texture.id, data.clone());
        }
        Ok(())
    }

    /// Uploads a texture's pixel data through a staging buffer the first
    /// time it is seen; a no-op once the upload has run (or if the texture
    /// was created without `initial_data`). Grounded on
    /// `ensure_buffer_uploaded`'s staging-buffer pattern.
    fn ensure_texture_uploaded(&mut self, id: ResourceId) -> Result<()> {
        let Some(data) = self.pending_texture_uploads.remove(&id) else { return Ok(()) };
        let gpu_image = self.images.get(&id).ok_or_else(|| Error::ValidationFailed("texture upload target has no GpuImage".into()))?;
        let image = gpu_image.image;
        let extent = gpu_image.extent;
        let aspect = if gpu_image.is_depth { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR };

        let data_len = data.len() as u64;
        let (staging_buffer, staging_block) =
            self.with_allocation_retry(|device, allocator| create_buffer(device, allocator, data_len, vk::BufferUsageFlags::TRANSFER_SRC, true))?;
        if let Some(mut mapped) = staging_block.map() {
            mapped.as_mut_slice()[..data.len()].copy_from_slice(&data);
        }
        let device = Arc::clone(&self.device.device);

        let slot = self.frames.current_slot();
        let cb_seq = slot.transfer_command_buffer.seq();
        self.resources.note_texture_write(
            id,
            image,
            ImageLayout::TransferDst,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            &mut slot.transfer_command_buffer.barrier_pool,
            cb_seq,
        );
        slot.transfer_command_buffer.flush_barriers();

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers::default().aspect_mask(aspect).layer_count(1))
            .image_extent(extent);
        unsafe {
            device.cmd_copy_buffer_to_image(
                slot.transfer_command_buffer.raw(),
                staging_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
        }

        self.staging_pending_free[self.frame_slot_index].push((staging_buffer, staging_block));
        Ok(())
    }

    /// Releases a texture created with `create_texture` (spec §6: "released
    /// by pushing its image, views, and memory block onto the owning
    /// frame's deferred-destroy queues"). A no-op if `id` has no `GpuImage`.
    pub fn destroy_texture(&mut self, id: ResourceId) {
        self.resources.forget(id);
        self.pending_texture_uploads.remove(&id);
        if let Some(image) = self.images.remove(&id) {
            self.frames.current_slot().queue_destroy(image.into_deferred());
        }
    }

    /// Releases a buffer uploaded through `ensure_buffer_uploaded` (vertex,
    /// index, or uniform data keyed by `id`). A no-op if `id` has no
    /// `GpuBuffer`.
    pub fn destroy_buffer(&mut self, id: ResourceId) {
        self.resources.forget(id);
        if let Some(buffer) = self.buffers.remove(&id) {
            self.frames.current_slot().queue_destroy(buffer.into_deferred());
        }
    }

    /// Spec §6 `framebuffer_copy_to_texture`: a GPU-side image copy between
    /// two already-created textures, barrier-guarded through
    /// `ResourceContext` like any other access.
    pub fn framebuffer_copy_to_texture(&mut self, src: ResourceId, dst: ResourceId) -> Result<()> {
        if !self.valid {
            return Err(Error::DeviceLost);
        }
        let (src_image, extent, is_depth) = {
            let img = self.images.get(&src).ok_or_else(|| Error::ValidationFailed("copy source has no GpuImage".into()))?;
            (img.image, img.extent, img.is_depth)
        };
        let dst_image = self.images.get(&dst).ok_or_else(|| Error::ValidationFailed("copy destination has no GpuImage".into()))?.image;

        let slot = self.frames.current_slot();
        let cb_seq = slot.command_buffer.seq();
        self.resources.note_texture_read(
            src,
            src_image,
            ImageLayout::TransferSrc,
            vk::PipelineStageFlags::TRANSFER,
            &mut slot.command_buffer.barrier_pool,
            cb_seq,
        );
        self.resources.note_texture_write(
            dst,
            dst_image,
            ImageLayout::TransferDst,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            &mut slot.command_buffer.barrier_pool,
            cb_seq,
        );
        slot.command_buffer.flush_barriers();

        let aspect = if is_depth { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR };
        let region = vk::ImageCopy::default()
            .src_subresource(vk::ImageSubresourceLayers::default().aspect_mask(aspect).layer_count(1))
            .dst_subresource(vk::ImageSubresourceLayers::default().aspect_mask(aspect).layer_count(1))
            .extent(extent);
        unsafe {
            self.device.device.cmd_copy_image(
                slot.command_buffer.raw(),
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
        }
        Ok(())
    }

    /// Spec §6 `framebuffer_copy_to_ram`: copies `src` into a host-visible
    /// staging buffer via the transfer command buffer and returns a
    /// `ScreenshotRequest` resolved once this frame's slot next recycles
    /// (spec §5: the fence wait at the top of `begin_frame` is the only
    /// synchronization point the design needs — by the time this slot is
    /// reused, the copy has necessarily completed).
    pub fn framebuffer_copy_to_ram(&mut self, src: ResourceId, bytes_per_pixel: u32) -> Result<ScreenshotRequest> {
        if !self.valid {
            return Err(Error::DeviceLost);
        }
        let (image, extent, is_depth) = {
            let img = self.images.get(&src).ok_or_else(|| Error::ValidationFailed("screenshot source has no GpuImage".into()))?;
            (img.image, img.extent, img.is_depth)
        };
        let size = (extent.width * extent.height * bytes_per_pixel) as u64;
        let (staging_buffer, staging_block) =
            self.with_allocation_retry(|device, allocator| create_buffer(device, allocator, size, vk::BufferUsageFlags::TRANSFER_DST, true))?;

        // Recorded into the *render* command buffer, not the transfer one:
        // `end_frame` always submits the transfer CB before the render CB
        // (ordered by `transfers_done`), so a copy that must observe this
        // frame's render output has to live in the CB that runs after it.
        let slot = self.frames.current_slot();
        let cb_seq = slot.command_buffer.seq();
        self.resources.note_texture_read(
            src,
            image,
            ImageLayout::TransferSrc,
            vk::PipelineStageFlags::TRANSFER,
            &mut slot.command_buffer.barrier_pool,
            cb_seq,
        );
        slot.command_buffer.flush_barriers();

        let aspect = if is_depth { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR };
        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers::default().aspect_mask(aspect).layer_count(1))
            .image_extent(extent);
        unsafe {
            self.device.device.cmd_copy_image_to_buffer(
                slot.command_buffer.raw(),
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging_buffer,
                std::slice::from_ref(&region),
            );
        }

        let (sender, receiver) = mpsc::channel();
        let staging = GpuBuffer { device: Arc::clone(&self.device.device), buffer: staging_buffer, size, block: staging_block };
        self.pending_downloads[self.frame_slot_index].push(QueuedDownload { staging, sender });

        Ok(ScreenshotRequest { frame_number: self.frame_number, result_texture: src, pending_output_files: Vec::new(), receiver })
    }
}

impl GpuBuffer {
    /// Maps and copies out this buffer's full contents. Only meaningful for
    /// a host-visible staging buffer (a device-local `GpuBuffer`'s `map()`
    /// returns `None`, since its `MemoryBlock` was never allocated mapped).
    fn block_bytes(&self) -> Option<Vec<u8>> {
        self.block.map().map(|mapped| mapped.as_slice()[..self.size as usize].to_vec())
    }
}

impl Drop for Gsg {
    fn drop(&mut self) {
        // The device is idle by the time this runs, so every still-live
        // buffer/image can be destroyed directly instead of through the
        // deferred-destroy queue `destroy_buffer`/`destroy_texture` use
        // mid-session (there is no "next frame" left to drain it).
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.device.device.destroy_sampler(self.sampler, None);
            for (_, buffer) in self.buffers.drain() {
                self.device.device.destroy_buffer(buffer.buffer, None);
            }
            for (_, image) in self.images.drain() {
                self.device.device.destroy_image_view(image.view, None);
                self.device.device.destroy_image(image.image, None);
            }
        }
        self.shader_programs.clear();
        self.swapchain = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RenderStateData, StateCache};

    #[test]
    fn pipeline_key_defaults_match_typical_opaque_geometry() {
        let cache = StateCache::default();
        let state = cache.empty();
        let vertex_format = GeomVertexFormat { arrays: Vec::new() };

        // Build the key the same way `Gsg::pipeline_key` does, without a live
        // device, by exercising the same attrib-default fallbacks inline.
        let cull_face = match state.attribs[AttribSlot::CullFace as usize].as_deref() {
            Some(Attrib::CullFace(m)) => *m,
            _ => CullFaceMode::Back,
        };
        assert_eq!(cull_face, CullFaceMode::Back);
        let _ = vertex_format;
    }

    #[test]
    fn altered_mask_accumulates_across_set_state_calls_until_a_draw_consumes_it() {
        let cache = StateCache::default();
        let base = cache.empty();
        let mut a = RenderStateData::default();
        a.attribs[AttribSlot::CullFace as usize] = Some(Arc::new(Attrib::CullFace(CullFaceMode::Front)));
        let a = cache.intern(a);

        let mask1 = diff_states(&base, &a);
        let mut altered = 0u32;
        altered |= mask1;
        assert_eq!(altered, slot_bit(AttribSlot::CullFace));
    }
}
