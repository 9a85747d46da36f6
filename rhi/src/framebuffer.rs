//! `FbConfig`, render-pass cache, and framebuffer cache (spec §4.4).
//!
//! Grounded on the teacher's `RenderPassCacheKey`/`FramebufferCacheKey` plus
//! `VulkanDevice::render_pass_cache`/`framebuffer_cache` in `vulkan/mod.rs`,
//! and `create_vk_render_pass()` in `vulkan/render_pass.rs`. The teacher's
//! own `VulkanRenderPassRecorder::end()` destroys the framebuffer and render
//! pass immediately after every pass — directly at odds with the cache it
//! sits next to, since the next frame's cache hit would then reference a
//! freed handle. This module is the single owner of both caches; `end()` on
//! the new render-pass recorder only calls `vkCmdEndRenderPass` and never
//! destroys anything (see `command_buffer.rs`/`gsg.rs`). Render passes and
//! framebuffers live until `FramebufferCache::evict_stale` is called (today,
//! only from `Drop`), matching the invariant that load-op changes require a
//! new render pass but never invalidate a pipeline keyed on the `FbConfig` id.

use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::scene_types::{texture_format_to_vk, LoadOp, StoreOp, TextureFormat};

/// Canonical tuple of attachment formats (spec §3/§4.4). Each unique tuple
/// is assigned an id by `FbConfigTable`, used as part of the pipeline cache
/// key (`pipeline_cache.rs`) without needing the render pass itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FbConfig {
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
}

#[derive(Default)]
pub struct FbConfigTable {
    ids: HashMap<FbConfig, u32>,
    next_id: u32,
}

impl FbConfigTable {
    pub fn id_for(&mut self, config: &FbConfig) -> u32 {
        if let Some(&id) = self.ids.get(config) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(config.clone(), id);
        id
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColorAttachmentDesc {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub final_layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthAttachmentDesc {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct RenderPassKey {
    color: Vec<(TextureFormat, u8, u8, vk::ImageLayout)>,
    depth: Option<(TextureFormat, u8, u8)>,
}

fn load_op_to_vk(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

fn store_op_to_vk(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

fn load_op_key(op: LoadOp) -> u8 {
    match op {
        LoadOp::Load => 0,
        LoadOp::Clear => 1,
        LoadOp::DontCare => 2,
    }
}

fn store_op_key(op: StoreOp) -> u8 {
    match op {
        StoreOp::Store => 0,
        StoreOp::DontCare => 1,
    }
}

/// Creates a `VkRenderPass` with one subpass, one color attachment per
/// `colors` entry, one optional depth/stencil attachment, and a dependency
/// from external `ALL_COMMANDS` into the subpass covering both
/// color-attachment-output and early-fragment-tests (spec §4.4).
fn create_vk_render_pass(
    device: &ash::Device,
    colors: &[ColorAttachmentDesc],
    depth: Option<&DepthAttachmentDesc>,
) -> Result<vk::RenderPass> {
    let mut attachments = Vec::new();
    let mut color_refs = Vec::new();
    for c in colors {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(c.format))
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op_to_vk(c.load_op))
                .store_op(store_op_to_vk(c.store_op))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(c.final_layout),
        );
        color_refs.push(
            vk::AttachmentReference::default()
                .attachment((attachments.len() - 1) as u32)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
    }

    let depth_ref;
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(d) = depth {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(d.format))
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op_to_vk(d.load_op))
                .store_op(store_op_to_vk(d.store_op))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        depth_ref = vk::AttachmentReference::default()
            .attachment((attachments.len() - 1) as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(std::slice::from_ref(&dependency));

    unsafe { device.create_render_pass(&create_info, None).map_err(Error::from) }
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct FramebufferKey {
    render_pass: u64,
    width: u32,
    height: u32,
    attachment_views: Vec<u64>,
}

use ash::vk::Handle;

/// Owns both caches; shared between `pipeline_cache.rs` (which only needs
/// the render pass for pipeline creation) and `gsg.rs` (which needs the
/// framebuffer to begin a pass).
pub struct FramebufferCache {
    device: Arc<ash::Device>,
    render_passes: HashMap<RenderPassKey, vk::RenderPass>,
    framebuffers: HashMap<FramebufferKey, vk::Framebuffer>,
}

impl FramebufferCache {
    pub fn new(device: Arc<ash::Device>) -> Self {
        Self { device, render_passes: HashMap::new(), framebuffers: HashMap::new() }
    }

    pub fn get_or_create_render_pass(
        &mut self,
        colors: &[ColorAttachmentDesc],
        depth: Option<&DepthAttachmentDesc>,
    ) -> Result<vk::RenderPass> {
        let key = RenderPassKey {
            color: colors
                .iter()
                .map(|c| (c.format, load_op_key(c.load_op), store_op_key(c.store_op), c.final_layout))
                .collect(),
            depth: depth.map(|d| (d.format, load_op_key(d.load_op), store_op_key(d.store_op))),
        };
        if let Some(&rp) = self.render_passes.get(&key) {
            return Ok(rp);
        }
        let rp = create_vk_render_pass(&self.device, colors, depth)?;
        log::debug!("render pass created: {} color attachment(s), depth={}", colors.len(), depth.is_some());
        self.render_passes.insert(key, rp);
        Ok(rp)
    }

    pub fn get_or_create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        attachment_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let key = FramebufferKey {
            render_pass: render_pass.as_raw(),
            width: extent.width,
            height: extent.height,
            attachment_views: attachment_views.iter().map(|v| v.as_raw()).collect(),
        };
        if let Some(&fb) = self.framebuffers.get(&key) {
            return Ok(fb);
        }
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachment_views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let fb = unsafe { self.device.create_framebuffer(&create_info, None).map_err(Error::from)? };
        self.framebuffers.insert(key, fb);
        Ok(fb)
    }

    /// Destroys every cached framebuffer referencing `view` (called when a
    /// swapchain is recreated and its image views are torn down, since the
    /// old framebuffers reference now-dead views).
    pub fn evict_views(&mut self, views: &[vk::ImageView]) {
        let dead: std::collections::HashSet<u64> = views.iter().map(|v| v.as_raw()).collect();
        let mut keep = HashMap::new();
        for (key, fb) in self.framebuffers.drain() {
            if key.attachment_views.iter().any(|v| dead.contains(v)) {
                unsafe { self.device.destroy_framebuffer(fb, None) };
            } else {
                keep.insert(key, fb);
            }
        }
        self.framebuffers = keep;
    }
}

impl Drop for FramebufferCache {
    fn drop(&mut self) {
        for (_, fb) in self.framebuffers.drain() {
            unsafe { self.device.destroy_framebuffer(fb, None) };
        }
        for (_, rp) in self.render_passes.drain() {
            unsafe { self.device.destroy_render_pass(rp, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_config_assigned_same_id() {
        let mut table = FbConfigTable::default();
        let a = FbConfig { color_formats: vec![TextureFormat::Rgba8Unorm], depth_format: None };
        let b = a.clone();
        assert_eq!(table.id_for(&a), table.id_for(&b));
    }

    #[test]
    fn distinct_configs_assigned_distinct_ids() {
        let mut table = FbConfigTable::default();
        let a = FbConfig { color_formats: vec![TextureFormat::Rgba8Unorm], depth_format: None };
        let b = FbConfig { color_formats: vec![TextureFormat::Bgra8Unorm], depth_format: None };
        assert_ne!(table.id_for(&a), table.id_for(&b));
    }
}
