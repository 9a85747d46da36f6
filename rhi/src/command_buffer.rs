//! CommandBuffer and FrameData lifecycle (spec §4.3, §5).
//!
//! Grounded on the teacher's `VulkanCommandEncoder`/`VulkanCommandBuffer`
//! (`vulkan/mod.rs`) for pool allocation and begin/end/submit plumbing.
//! Generalized with a `BarrierPool` (see `resource.rs`) and a pending-destroy
//! list: resources released mid-frame are not actually destroyed until the
//! command buffer that last touched them has retired, matching invariant
//! "a resource's Vulkan handles are not destroyed while any in-flight
//! command buffer may still reference them."

use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::MemoryBlock;
use crate::resource::BarrierPool;

/// One handle (or group of handles) queued for teardown once the frame slot
/// that last touched it has its fence signal (spec §3: "FrameData...
/// deferred-destroy queues for every Vulkan handle type"). Holding the
/// `MemoryBlock` variants alive in here, rather than dropping them at
/// release time, is what defers their page-range reclamation to the same
/// point — `MemoryBlock::drop` itself just returns the range to its page's
/// free list, which is only safe once the GPU is done with it.
pub enum DeferredDestroy {
    Buffer(vk::Buffer),
    BufferWithMemory(vk::Buffer, MemoryBlock),
    ImageWithMemory { image: vk::Image, view: vk::ImageView, block: MemoryBlock },
    DescriptorSets { pool: vk::DescriptorPool, sets: Vec<vk::DescriptorSet> },
}

impl DeferredDestroy {
    fn run(self, device: &ash::Device) {
        match self {
            DeferredDestroy::Buffer(buffer) => unsafe { device.destroy_buffer(buffer, None) },
            DeferredDestroy::BufferWithMemory(buffer, _block) => unsafe { device.destroy_buffer(buffer, None) },
            DeferredDestroy::ImageWithMemory { image, view, block: _ } => unsafe {
                device.destroy_image_view(view, None);
                device.destroy_image(image, None);
            },
            DeferredDestroy::DescriptorSets { pool, sets } => {
                if !sets.is_empty() {
                    if let Err(e) = unsafe { device.free_descriptor_sets(pool, &sets) } {
                        log::warn!("command_buffer: free_descriptor_sets failed: {e:?}");
                    }
                }
            }
        }
    }
}

/// Source of `CommandBuffer::seq` values: process-wide, so two
/// `CommandBuffer`s (render and transfer, or across frame slots) never
/// collide on the same generation number even though each has its own
/// `vk::CommandBuffer` handle and pool.
static NEXT_CB_SEQ: AtomicU64 = AtomicU64::new(1);

pub struct CommandBuffer {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
    pub(crate) buffer: vk::CommandBuffer,
    pub(crate) barrier_pool: BarrierPool,
    /// Monotonic id assigned in `begin()`, identifying this recording (spec
    /// §3/§4.3). Zero means "not yet recorded". `ResourceContext` compares
    /// this against a tracked resource's `last_cb_seq` to tell "this
    /// resource was touched earlier in this very command buffer" (its pooled
    /// barrier index is still valid to widen) from "touched in some earlier,
    /// already-submitted command buffer" (the index is stale).
    seq: u64,
}

impl CommandBuffer {
    pub fn allocate(device: Arc<ash::Device>, pool: vk::CommandPool) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { device.allocate_command_buffers(&alloc_info).map_err(Error::from)? };
        Ok(Self {
            device,
            pool,
            buffer: buffers[0],
            barrier_pool: BarrierPool::default(),
            seq: 0,
        })
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// This recording's sequence number (spec §3/§4.3). Zero before the
    /// first `begin()`.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn begin(&mut self) -> Result<()> {
        self.seq = NEXT_CB_SEQ.fetch_add(1, Ordering::Relaxed);
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.begin_command_buffer(self.buffer, &begin_info).map_err(Error::from)?;
        }
        Ok(())
    }

    /// Coalesce and emit every barrier pooled since the last flush. Called
    /// right before a render pass begins or a compute dispatch is recorded,
    /// per the deferred-to-command-buffer-boundary design in spec §4.2.
    pub fn flush_barriers(&mut self) {
        self.barrier_pool.flush(&self.device, self.buffer);
    }

    pub fn end(&mut self) -> Result<()> {
        self.flush_barriers();
        unsafe {
            self.device.end_command_buffer(self.buffer).map_err(Error::from)?;
        }
        Ok(())
    }

}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.free_command_buffers(self.pool, &[self.buffer]);
        }
    }
}

/// One slot in the N-frames-in-flight ring (spec §5): a render command
/// buffer, a transfer command buffer for staging uploads, the fence the GPU
/// signals on completion, and the semaphores used to order
/// transfer -> render -> present (`transfers_done` orders the transfer CB
/// before the render CB; `image_available`/`render_finished` order
/// acquire -> render -> present as in the teacher).
pub struct FrameSlot {
    pub command_buffer: CommandBuffer,
    pub transfer_command_buffer: CommandBuffer,
    pub fence: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub transfers_done: vk::Semaphore,
    /// Handles (and memory blocks) released while this slot's commands may
    /// still have been in flight, destroyed for real once this slot's fence
    /// next signals (spec §3).
    pending_destroy: Vec<DeferredDestroy>,
}

impl FrameSlot {
    pub fn queue_destroy(&mut self, item: DeferredDestroy) {
        self.pending_destroy.push(item);
    }
}

pub struct FrameData {
    device: Arc<ash::Device>,
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameData {
    pub fn new(device: Arc<ash::Device>, pool: vk::CommandPool, frames_in_flight: u32) -> Result<Self> {
        let mut slots = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            let command_buffer = CommandBuffer::allocate(Arc::clone(&device), pool)?;
            let transfer_command_buffer = CommandBuffer::allocate(Arc::clone(&device), pool)?;
            let fence = unsafe {
                device
                    .create_fence(&vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED), None)
                    .map_err(Error::from)?
            };
            let image_available = unsafe {
                device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None).map_err(Error::from)?
            };
            let render_finished = unsafe {
                device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None).map_err(Error::from)?
            };
            let transfers_done = unsafe {
                device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None).map_err(Error::from)?
            };
            slots.push(FrameSlot {
                command_buffer,
                transfer_command_buffer,
                fence,
                image_available,
                render_finished,
                transfers_done,
                pending_destroy: Vec::new(),
            });
        }
        Ok(Self { device, slots, current: 0 })
    }

    /// Waits on the selected slot's fence (the one mandatory sync point per
    /// frame, spec §5), runs its pending resource teardowns, resets the
    /// fence, and returns it ready for recording.
    pub fn begin_frame(&mut self) -> Result<&mut FrameSlot> {
        let slot = &mut self.slots[self.current];
        unsafe {
            self.device
                .wait_for_fences(&[slot.fence], true, u64::MAX)
                .map_err(Error::from)?;
            self.device.reset_fences(&[slot.fence]).map_err(Error::from)?;
        }
        for item in slot.pending_destroy.drain(..) {
            item.run(&self.device);
        }
        Ok(slot)
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Waits on every slot's fence *except the one currently being recorded*
    /// and drains its pending-destroy queue. Used as the out-of-memory
    /// fallback (spec §4.1): a `MemoryAllocator::allocate` failure may just
    /// mean the blocks freed by earlier frames are still sitting in a
    /// `FrameSlot::pending_destroy` list waiting for their fence, rather
    /// than a genuine out-of-memory condition. The current slot is skipped
    /// because its fence was reset by `begin_frame` and will not signal
    /// until this same frame's commands are submitted — waiting on it here
    /// would deadlock.
    pub fn drain_all_pending_destroys(&mut self) -> Result<()> {
        let current = self.current;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if index == current {
                continue;
            }
            unsafe {
                self.device.wait_for_fences(&[slot.fence], true, u64::MAX).map_err(Error::from)?;
            }
            for item in slot.pending_destroy.drain(..) {
                item.run(&self.device);
            }
        }
        Ok(())
    }

    pub fn current_slot(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }
}

impl Drop for FrameData {
    fn drop(&mut self) {
        // `Gsg::drop` has already waited the device idle by this point, so
        // any handles still sitting in a slot's queue (released this frame
        // but not yet drained by a following `begin_frame`) are safe to
        // destroy right now instead of leaking them.
        for slot in &mut self.slots {
            for item in slot.pending_destroy.drain(..) {
                item.run(&self.device);
            }
            unsafe {
                self.device.destroy_fence(slot.fence, None);
                self.device.destroy_semaphore(slot.image_available, None);
                self.device.destroy_semaphore(slot.render_finished, None);
                self.device.destroy_semaphore(slot.transfers_done, None);
            }
        }
    }
}
