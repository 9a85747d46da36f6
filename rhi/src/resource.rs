//! Automatic resource-state tracking and barrier pooling (spec §4.2 — the
//! hard part of the system).
//!
//! The teacher's `image_barrier_stages_access()`/`image_layout_to_vk()`
//! (`vulkan/mod.rs`) hard-codes a `(src_stage, src_access, dst_stage,
//! dst_access)` tuple per layout-pair and `pipeline_barrier_texture` emits it
//! immediately, inline, on every call — it never looks at what the resource
//! was last doing. Spec §4.2 requires the opposite: `src_stage`/`src_access`
//! must come from the resource's own tracked write state (`write_stage_mask`/
//! `write_access_mask`), and a read only needs a fresh barrier for the
//! pipeline stages not already covered by an earlier read of the same write
//! (`read_stage_mask`). `image_layout_to_vk` is kept (it is a pure
//! enum-to-Vulkan-constant mapping, not a hazard decision); the per-pair
//! stage/access table is not. What the teacher also has no equivalent of is
//! pooling: every `note_*` call here defers the barrier into the active
//! `CommandBuffer`'s pending list instead of recording it, and
//! writes-after-writes / reads-after-reads needing no new visibility are
//! coalesced into one barrier at flush time rather than one per access.
//! `add_barrier_immediate` is the one-off counterpart for call sites with no
//! pool to defer into (spec §4.2 step 9).

use ash::vk;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderReadOnly,
    ColorAttachment,
    DepthStencilAttachment,
    General,
    PresentSrc,
}

pub fn image_layout_to_vk(l: ImageLayout) -> vk::ImageLayout {
    match l {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// The access mask a consumer needs once a resource sits in `layout` — pure
/// function of the layout itself, unlike `src_stage`/`src_access` which
/// depend on what the resource's last write actually was.
fn read_access_for_layout(layout: ImageLayout) -> vk::AccessFlags {
    match layout {
        ImageLayout::ShaderReadOnly | ImageLayout::General => vk::AccessFlags::SHADER_READ,
        ImageLayout::TransferSrc => vk::AccessFlags::TRANSFER_READ,
        ImageLayout::PresentSrc => vk::AccessFlags::MEMORY_READ,
        ImageLayout::ColorAttachment => vk::AccessFlags::COLOR_ATTACHMENT_READ,
        ImageLayout::DepthStencilAttachment => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ImageLayout::Undefined => vk::AccessFlags::empty(),
        ImageLayout::TransferDst => vk::AccessFlags::TRANSFER_READ,
    }
}

/// Emits a single, unpooled `vkCmdPipelineBarrier` for one image transition
/// right now (spec §4.2 step 9): the counterpart to `BarrierPool::flush` for
/// call sites that have no pool to defer into — this plus `note_texture_read`/
/// `note_texture_write`/`note_buffer_write` (which build on the same
/// `PooledImageBarrier` shape before deferring it) are the only places in the
/// crate that construct a `vkCmdPipelineBarrier` call.
#[allow(clippy::too_many_arguments)]
pub fn add_barrier_immediate(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            if src_stage.is_empty() { vk::PipelineStageFlags::TOP_OF_PIPE } else { src_stage },
            if dst_stage.is_empty() { vk::PipelineStageFlags::BOTTOM_OF_PIPE } else { dst_stage },
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }
}

/// Per-texture tracking state: current layout and the last read/write
/// "sequence" (a monotonic counter bumped per `note_read`/`note_write` call
/// within a command buffer), used to decide whether a fresh access needs a
/// barrier or can ride along with one already pooled this command buffer.
#[derive(Debug, Clone)]
pub struct TextureContext {
    pub layout: ImageLayout,
    pub is_depth: bool,
    pub write_stage_mask: vk::PipelineStageFlags,
    pub write_access_mask: vk::AccessFlags,
    /// Stages that already have a barrier making the *current* write's
    /// results visible to them. Reset to empty on every new write: visibility
    /// established for a previous write's contents says nothing about this
    /// one's.
    pub read_stage_mask: vk::PipelineStageFlags,
    pub read_seq: u64,
    pub write_seq: u64,
    /// Index into the owning CommandBuffer's pending barrier list, if a
    /// barrier for this resource is already pooled and can be widened
    /// in-place instead of appended again. Only trustworthy when
    /// `last_cb_seq` matches the command buffer making the new access — a
    /// command buffer that has since been submitted and flushed its pool no
    /// longer has an entry at this index.
    pub barrier_index: Option<usize>,
    pub last_cb_seq: u64,
}

impl TextureContext {
    pub fn new(initial_layout: ImageLayout, is_depth: bool) -> Self {
        Self {
            layout: initial_layout,
            is_depth,
            write_stage_mask: vk::PipelineStageFlags::empty(),
            write_access_mask: vk::AccessFlags::empty(),
            read_stage_mask: vk::PipelineStageFlags::empty(),
            read_seq: 0,
            write_seq: 0,
            barrier_index: None,
            last_cb_seq: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferContext {
    pub host_visible: bool,
    pub write_stage_mask: vk::PipelineStageFlags,
    pub write_access_mask: vk::AccessFlags,
    pub read_stage_mask: vk::PipelineStageFlags,
    pub read_seq: u64,
    pub write_seq: u64,
    pub barrier_index: Option<usize>,
    pub last_cb_seq: u64,
}

impl BufferContext {
    pub fn new(host_visible: bool) -> Self {
        Self {
            host_visible,
            write_stage_mask: vk::PipelineStageFlags::empty(),
            write_access_mask: vk::AccessFlags::empty(),
            read_stage_mask: vk::PipelineStageFlags::empty(),
            read_seq: 0,
            write_seq: 0,
            barrier_index: None,
            last_cb_seq: 0,
        }
    }
}

struct PooledImageBarrier {
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
}

struct PooledBufferBarrier {
    buffer: vk::Buffer,
    src_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
}

/// Per-command-buffer pending barrier pool. Owned by `CommandBuffer`
/// (spec §4.3); flushed by `ResourceContext::flush_barriers` right before a
/// render pass or dispatch that depends on the pooled transitions.
#[derive(Default)]
pub struct BarrierPool {
    images: Vec<PooledImageBarrier>,
    buffers: Vec<PooledBufferBarrier>,
}

impl BarrierPool {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }

    pub fn flush(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let mut src_stage = vk::PipelineStageFlags::empty();
        let mut dst_stage = vk::PipelineStageFlags::empty();
        let image_barriers: Vec<vk::ImageMemoryBarrier> = self
            .images
            .iter()
            .map(|b| {
                src_stage |= b.src_stage;
                dst_stage |= b.dst_stage;
                vk::ImageMemoryBarrier::default()
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .image(b.image)
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(b.aspect_mask)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    )
            })
            .collect();
        let buffer_barriers: Vec<vk::BufferMemoryBarrier> = self
            .buffers
            .iter()
            .map(|b| {
                src_stage |= b.src_stage;
                dst_stage |= b.dst_stage;
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(b.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
            })
            .collect();
        log::debug!(
            "flushing barrier pool: {} image, {} buffer barriers coalesced into one vkCmdPipelineBarrier",
            image_barriers.len(),
            buffer_barriers.len()
        );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                if src_stage.is_empty() { vk::PipelineStageFlags::TOP_OF_PIPE } else { src_stage },
                if dst_stage.is_empty() { vk::PipelineStageFlags::BOTTOM_OF_PIPE } else { dst_stage },
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
        }
        self.images.clear();
        self.buffers.clear();
    }
}

/// Side tables mapping resource id to tracking state, plus the sequence
/// counter used to decide read/write ordering within a command buffer.
#[derive(Default)]
pub struct ResourceContext {
    textures: HashMap<ResourceId, TextureContext>,
    buffers: HashMap<ResourceId, BufferContext>,
    seq: u64,
}

impl ResourceContext {
    pub fn register_texture(&mut self, id: ResourceId, ctx: TextureContext) {
        self.textures.insert(id, ctx);
    }

    pub fn register_buffer(&mut self, id: ResourceId, ctx: BufferContext) {
        self.buffers.insert(id, ctx);
    }

    pub fn forget(&mut self, id: ResourceId) {
        self.textures.remove(&id);
        self.buffers.remove(&id);
    }

    /// Records a read of `id` at `new_layout` into command buffer `cb_seq`
    /// (spec §4.2 steps 2-3, 5), pooling a barrier into `pool` only for the
    /// pipeline stages of `read_stage` not already covered by an earlier read
    /// of this same write (`read_stage_mask`), or unconditionally if the
    /// layout itself is changing. `src_stage`/`src_access` are always derived
    /// from the texture's own tracked write state, never a static per-pair
    /// table: the barrier only needs to wait on whatever actually last wrote
    /// this resource.
    pub fn note_texture_read(
        &mut self,
        id: ResourceId,
        image: vk::Image,
        new_layout: ImageLayout,
        read_stage: vk::PipelineStageFlags,
        pool: &mut BarrierPool,
        cb_seq: u64,
    ) {
        self.seq += 1;
        let seq = self.seq;
        let ctx = self.textures.get_mut(&id).expect("texture not registered with ResourceContext");

        let layout_changed = ctx.layout != new_layout;
        let uncovered_stage = if layout_changed { read_stage } else { read_stage & !ctx.read_stage_mask };

        if layout_changed || !uncovered_stage.is_empty() {
            let src_stage = if ctx.write_stage_mask.is_empty() { vk::PipelineStageFlags::TOP_OF_PIPE } else { ctx.write_stage_mask };
            let src_access = ctx.write_access_mask;
            let dst_access = read_access_for_layout(new_layout);
            let aspect_mask = if ctx.is_depth { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR };

            if !layout_changed {
                if let Some(idx) = ctx.barrier_index {
                    if ctx.last_cb_seq == cb_seq {
                        if let Some(existing) = pool.images.get_mut(idx) {
                            existing.dst_stage |= uncovered_stage;
                            existing.dst_access |= dst_access;
                            ctx.read_stage_mask |= read_stage;
                            ctx.read_seq = seq;
                            ctx.last_cb_seq = cb_seq;
                            return;
                        }
                    }
                }
            }

            let index = pool.images.len();
            pool.images.push(PooledImageBarrier {
                image,
                aspect_mask,
                old_layout: image_layout_to_vk(ctx.layout),
                new_layout: image_layout_to_vk(new_layout),
                src_stage,
                src_access,
                dst_stage: uncovered_stage,
                dst_access,
            });
            ctx.barrier_index = Some(index);
            ctx.layout = new_layout;
        }
        ctx.read_stage_mask |= read_stage;
        ctx.read_seq = seq;
        ctx.last_cb_seq = cb_seq;
    }

    /// Records a write of `id` into command buffer `cb_seq`. Writes-after-writes
    /// to the same layout, pooled in the same command buffer, coalesce into
    /// the already-pooled barrier (widening its access mask) instead of
    /// appending a second one. `src_stage`/`src_access` come from whatever
    /// this texture's last tracked write and not-yet-fully-consumed reads
    /// were — a write has to wait on prior readers just as much as it has to
    /// wait on a prior writer.
    pub fn note_texture_write(
        &mut self,
        id: ResourceId,
        image: vk::Image,
        new_layout: ImageLayout,
        write_stage: vk::PipelineStageFlags,
        write_access: vk::AccessFlags,
        pool: &mut BarrierPool,
        cb_seq: u64,
    ) {
        self.seq += 1;
        let seq = self.seq;
        let ctx = self.textures.get_mut(&id).expect("texture not registered with ResourceContext");

        if let Some(idx) = ctx.barrier_index {
            if ctx.layout == new_layout && ctx.last_cb_seq == cb_seq {
                if let Some(existing) = pool.images.get_mut(idx) {
                    existing.dst_stage |= write_stage;
                    existing.dst_access |= write_access;
                    ctx.write_stage_mask |= write_stage;
                    ctx.write_access_mask |= write_access;
                    ctx.write_seq = seq;
                    ctx.last_cb_seq = cb_seq;
                    return;
                }
            }
        }

        let src_stage = if ctx.write_stage_mask.is_empty() && ctx.read_stage_mask.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            ctx.write_stage_mask | ctx.read_stage_mask
        };
        let src_access = ctx.write_access_mask;
        let aspect_mask = if ctx.is_depth { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR };
        let index = pool.images.len();
        pool.images.push(PooledImageBarrier {
            image,
            aspect_mask,
            old_layout: image_layout_to_vk(ctx.layout),
            new_layout: image_layout_to_vk(new_layout),
            src_stage,
            src_access,
            dst_stage: write_stage,
            dst_access: write_access,
        });
        ctx.barrier_index = Some(index);
        ctx.layout = new_layout;
        ctx.write_stage_mask = write_stage;
        ctx.write_access_mask = write_access;
        ctx.write_seq = seq;
        ctx.read_stage_mask = vk::PipelineStageFlags::empty();
        ctx.last_cb_seq = cb_seq;
    }

    pub fn note_buffer_write(
        &mut self,
        id: ResourceId,
        buffer: vk::Buffer,
        write_stage: vk::PipelineStageFlags,
        write_access: vk::AccessFlags,
        pool: &mut BarrierPool,
        cb_seq: u64,
    ) {
        self.seq += 1;
        let seq = self.seq;
        let ctx = self.buffers.get_mut(&id).expect("buffer not registered with ResourceContext");
        let src_stage = if ctx.write_stage_mask.is_empty() && ctx.read_stage_mask.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            ctx.read_stage_mask | ctx.write_stage_mask
        };
        let index = pool.buffers.len();
        pool.buffers.push(PooledBufferBarrier {
            buffer,
            src_stage,
            src_access: ctx.write_access_mask,
            dst_stage: write_stage,
            dst_access: write_access,
        });
        ctx.barrier_index = Some(index);
        ctx.write_stage_mask = write_stage;
        ctx.write_access_mask = write_access;
        ctx.write_seq = seq;
        ctx.read_stage_mask = vk::PipelineStageFlags::empty();
        ctx.last_cb_seq = cb_seq;
    }

    /// Reset per-command-buffer-lifetime fields (`barrier_index`) at
    /// `CommandBuffer` begin; persistent state (`layout`, sequence numbers)
    /// survives across command buffers since the resource's actual GPU-side
    /// layout doesn't reset between frames.
    pub fn begin_command_buffer(&mut self) {
        for ctx in self.textures.values_mut() {
            ctx.barrier_index = None;
        }
        for ctx in self.buffers.values_mut() {
            ctx.barrier_index = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_read_same_layout_emits_no_new_barrier() {
        let mut rc = ResourceContext::default();
        let id = ResourceId(1);
        rc.register_texture(id, TextureContext::new(ImageLayout::ShaderReadOnly, false));
        let mut pool = BarrierPool::default();
        rc.note_texture_read(id, vk::Image::null(), ImageLayout::ShaderReadOnly, vk::PipelineStageFlags::FRAGMENT_SHADER, &mut pool, 1);
        assert_eq!(pool.images.len(), 0, "same layout, never written since: no barrier needed");
    }

    #[test]
    fn read_from_a_new_stage_widens_dst_stage_but_a_repeat_read_does_not() {
        let mut rc = ResourceContext::default();
        let id = ResourceId(4);
        rc.register_texture(id, TextureContext::new(ImageLayout::Undefined, false));
        let mut pool = BarrierPool::default();
        rc.note_texture_write(
            id,
            vk::Image::null(),
            ImageLayout::ShaderReadOnly,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            &mut pool,
            1,
        );
        rc.note_texture_read(id, vk::Image::null(), ImageLayout::ShaderReadOnly, vk::PipelineStageFlags::VERTEX_SHADER, &mut pool, 1);
        assert_eq!(pool.images.len(), 1, "still pending in this CB: widens in place instead of a second barrier");
        assert!(pool.images[0].dst_stage.contains(vk::PipelineStageFlags::VERTEX_SHADER));
        assert!(!pool.images[0].dst_stage.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));

        rc.note_texture_read(id, vk::Image::null(), ImageLayout::ShaderReadOnly, vk::PipelineStageFlags::FRAGMENT_SHADER, &mut pool, 1);
        assert!(pool.images[0].dst_stage.contains(vk::PipelineStageFlags::FRAGMENT_SHADER), "fragment is a new stage, must be added");

        let fragment_only_mask = pool.images[0].dst_stage;
        rc.note_texture_read(id, vk::Image::null(), ImageLayout::ShaderReadOnly, vk::PipelineStageFlags::FRAGMENT_SHADER, &mut pool, 1);
        assert_eq!(pool.images[0].dst_stage, fragment_only_mask, "repeat read of an already-covered stage changes nothing");
    }

    #[test]
    fn write_after_write_same_layout_coalesces() {
        let mut rc = ResourceContext::default();
        let id = ResourceId(2);
        rc.register_texture(id, TextureContext::new(ImageLayout::Undefined, false));
        let mut pool = BarrierPool::default();
        rc.note_texture_write(
            id,
            vk::Image::null(),
            ImageLayout::ColorAttachment,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            &mut pool,
            1,
        );
        rc.note_texture_write(
            id,
            vk::Image::null(),
            ImageLayout::ColorAttachment,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            &mut pool,
            1,
        );
        assert_eq!(pool.images.len(), 1, "second write at same layout widens the existing barrier");
    }

    #[test]
    fn write_in_a_later_command_buffer_does_not_widen_a_stale_pooled_index() {
        let mut rc = ResourceContext::default();
        let id = ResourceId(5);
        rc.register_texture(id, TextureContext::new(ImageLayout::Undefined, false));
        let mut pool_a = BarrierPool::default();
        rc.note_texture_write(
            id,
            vk::Image::null(),
            ImageLayout::ColorAttachment,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            &mut pool_a,
            1,
        );
        pool_a.images.clear(); // simulates pool_a having been flushed and the CB retired
        let mut pool_b = BarrierPool::default();
        rc.note_texture_write(
            id,
            vk::Image::null(),
            ImageLayout::ColorAttachment,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            &mut pool_b,
            2,
        );
        assert_eq!(pool_b.images.len(), 1, "a new command buffer's pool gets its own fresh barrier, not index 0 of the old one");
    }

    #[test]
    fn layout_change_forces_new_barrier() {
        let mut rc = ResourceContext::default();
        let id = ResourceId(3);
        rc.register_texture(id, TextureContext::new(ImageLayout::ShaderReadOnly, false));
        let mut pool = BarrierPool::default();
        rc.note_texture_write(
            id,
            vk::Image::null(),
            ImageLayout::ColorAttachment,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            &mut pool,
            1,
        );
        assert_eq!(pool.images.len(), 1);
    }
}
