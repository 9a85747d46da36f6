//! Sub-allocated GPU memory (spec §4.1).
//!
//! The teacher's `vulkan/memory.rs` allocates one `VkDeviceMemory` per heap
//! and never sub-allocates (`VulkanMemoryHeap` is marked reserved-for-future-use,
//! and `buffer.rs`/`texture.rs` each call `vkAllocateMemory` directly per
//! resource). Real drivers cap the number of live allocations far below what
//! a scene graph with thousands of buffers/textures needs, so the GSG core
//! generalizes the teacher's heap into a page-based first-fit sub-allocator:
//! one `MemoryPage` is one `VkDeviceMemory`, and `MemoryBlock`s are carved
//! out of it and returned to a free list on release.

use ash::vk;
use std::sync::Arc;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: u64,
    size: u64,
}

/// One `VkDeviceMemory` allocation, sub-divided by a first-fit free list.
pub struct MemoryPage {
    device: Arc<ash::Device>,
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    size: u64,
    free: Vec<FreeRange>,
    mapped_base: Option<*mut u8>,
    /// Whether every resource bound into this page is a linear resource
    /// (buffers, or images created with `VK_IMAGE_TILING_LINEAR`). Spec
    /// §4.1 forbids mixing linear and optimal-tiled resources on one page:
    /// `bufferImageGranularity` can otherwise alias a linear resource's tail
    /// with an optimal-tiled resource's head on hardware that reports a
    /// coarse granularity.
    linear_tiling: bool,
}

// SAFETY: `mapped_base` is only dereferenced through `MappedRange`, which
// borrows the owning `MemoryBlock`'s lifetime; the raw pointer itself is
// never read/written concurrently from multiple threads (the allocator is
// owned by the single render thread per spec §5).
unsafe impl Send for MemoryPage {}

impl MemoryPage {
    fn new(
        device: Arc<ash::Device>,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        size: u64,
        memory_type_bits: u32,
        host_visible: bool,
        linear_tiling: bool,
    ) -> Result<Self> {
        let props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let wanted = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let memory_type_index = (0..props.memory_type_count)
            .find(|i| {
                let suitable = (memory_type_bits & (1 << i)) != 0;
                suitable && props.memory_types[*i as usize].property_flags.contains(wanted)
            })
            .or_else(|| (0..props.memory_type_count).find(|i| (memory_type_bits & (1 << i)) != 0))
            .ok_or(Error::AllocationFailed { requested: size, largest_free: 0 })?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let memory = unsafe {
            device
                .allocate_memory(&allocate_info, None)
                .map_err(Error::from)?
        };

        let mapped_base = if host_visible {
            let ptr = unsafe {
                device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(Error::from)?
            };
            Some(ptr.cast::<u8>())
        } else {
            None
        };

        log::debug!(
            "memory page created: size={size} type_index={memory_type_index} host_visible={host_visible} linear_tiling={linear_tiling}"
        );

        Ok(Self {
            device,
            memory,
            memory_type_index,
            size,
            free: vec![FreeRange { offset: 0, size }],
            mapped_base,
            linear_tiling,
        })
    }

    fn largest_free(&self) -> u64 {
        self.free.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// First-fit search with alignment padding; splits the matched range.
    fn try_alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        for i in 0..self.free.len() {
            let range = self.free[i];
            let aligned_offset = align_up(range.offset, align);
            let padding = aligned_offset - range.offset;
            if range.size < padding + size {
                continue;
            }
            let remainder_offset = aligned_offset + size;
            let remainder_size = range.offset + range.size - remainder_offset;
            self.free.remove(i);
            if padding > 0 {
                self.free.push(FreeRange { offset: range.offset, size: padding });
            }
            if remainder_size > 0 {
                self.free.push(FreeRange { offset: remainder_offset, size: remainder_size });
            }
            return Some(aligned_offset);
        }
        None
    }

    fn free_block(&mut self, offset: u64, size: u64) {
        self.free.push(FreeRange { offset, size });
        self.coalesce();
    }

    /// Merge adjacent free ranges so repeated alloc/free of similarly-sized
    /// blocks doesn't fragment the page into unusable slivers.
    fn coalesce(&mut self) {
        self.free.sort_by_key(|r| r.offset);
        let mut merged: Vec<FreeRange> = Vec::with_capacity(self.free.len());
        for r in self.free.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.offset + last.size == r.offset {
                    last.size += r.size;
                    continue;
                }
            }
            merged.push(r);
        }
        self.free = merged;
    }
}

impl Drop for MemoryPage {
    fn drop(&mut self) {
        unsafe {
            if self.mapped_base.is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.free_memory(self.memory, None);
        }
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// A live sub-allocation. Dropping it returns the range to its page's free
/// list; it does not free the underlying `VkDeviceMemory`.
pub struct MemoryBlock {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    page_index: usize,
    allocator: std::sync::Weak<std::sync::Mutex<Vec<MemoryPage>>>,
    mapped_ptr: Option<*mut u8>,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl MemoryBlock {
    /// Scoped mapped-memory guard: the block's page is already persistently
    /// mapped (host-visible pages are mapped once at page creation, per
    /// spec §9's re-architecture of the teacher's per-call `map_memory`/
    /// `unmap_memory` pairing in `write_buffer`), so `map()` just slices the
    /// pointer range. No unmap call is needed on drop, but the guard still
    /// exists so call sites read the same as a scoped-mapping API would.
    pub fn map(&self) -> Option<MappedRange<'_>> {
        self.mapped_ptr.map(|ptr| MappedRange {
            ptr: unsafe { ptr.add(self.offset as usize) },
            len: self.size as usize,
            _block: self,
        })
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.upgrade() {
            if let Ok(mut pages) = allocator.lock() {
                if let Some(page) = pages.get_mut(self.page_index) {
                    page.free_block(self.offset, self.size);
                }
            }
        }
    }
}

pub struct MappedRange<'a> {
    ptr: *mut u8,
    len: usize,
    _block: &'a MemoryBlock,
}

impl<'a> MappedRange<'a> {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Page-based sub-allocator shared by buffers and textures.
pub struct MemoryAllocator {
    device: Arc<ash::Device>,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    default_page_size: u64,
    pages: Arc<std::sync::Mutex<Vec<MemoryPage>>>,
}

impl MemoryAllocator {
    pub fn new(
        device: Arc<ash::Device>,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        default_page_size: u64,
    ) -> Self {
        Self {
            device,
            instance,
            physical_device,
            default_page_size,
            pages: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// `linear_tiling` is `true` for buffers and `VK_IMAGE_TILING_LINEAR`
    /// images, `false` for `VK_IMAGE_TILING_OPTIMAL` images (spec §4.1: the
    /// two classes must never share a page).
    pub fn allocate(
        &self,
        size: u64,
        align: u64,
        memory_type_bits: u32,
        host_visible: bool,
        linear_tiling: bool,
    ) -> Result<MemoryBlock> {
        let mut pages = self.pages.lock().expect("memory allocator mutex poisoned");

        for (index, page) in pages.iter_mut().enumerate() {
            if page.memory_type_index_matches(memory_type_bits, host_visible, linear_tiling) {
                if let Some(offset) = page.try_alloc(size, align) {
                    return Ok(MemoryBlock {
                        memory: page.memory,
                        offset,
                        size,
                        page_index: index,
                        allocator: Arc::downgrade(&self.pages),
                        mapped_ptr: page.mapped_base,
                    });
                }
            }
        }

        if let Some(block) =
            self.allocate_new_page(&mut pages, size, align, memory_type_bits, host_visible, linear_tiling)?
        {
            return Ok(block);
        }

        // Every existing page of this class is full and a fresh page could
        // not be grown to fit (allocate_new_page only returns None on
        // maxMemoryAllocationSize rejection, not on VkResult errors, which
        // it propagates directly). Fall back to draining the in-flight frame
        // queue: `create_buffer`/`create_image` only ever run while at least
        // one `FrameData` slot exists, and deferred-destroy entries queued
        // by prior frames may be the only thing standing between this
        // allocation and success once their pages are freed. The caller owns
        // fence-waiting, so this allocator can only report failure upward;
        // `Gsg` retries once after draining (see `create_buffer`/`create_image`
        // callers in gsg.rs).
        Err(Error::AllocationFailed { requested: size, largest_free: largest_free_of_class(&pages, linear_tiling) })
    }

    fn allocate_new_page(
        &self,
        pages: &mut Vec<MemoryPage>,
        size: u64,
        align: u64,
        memory_type_bits: u32,
        host_visible: bool,
        linear_tiling: bool,
    ) -> Result<Option<MemoryBlock>> {
        if size > MAX_MEMORY_ALLOCATION_SIZE {
            log::warn!(
                "memory allocator: single allocation of {size} bytes exceeds the {MAX_MEMORY_ALLOCATION_SIZE} byte cap"
            );
            return Err(Error::AllocationFailed { requested: size, largest_free: 0 });
        }
        // Retry with a smaller page once the preferred page size would blow
        // the cap: clamp down to the cap itself rather than failing outright,
        // since `size` alone is known to fit under it.
        let page_size = self.default_page_size.max(size).min(MAX_MEMORY_ALLOCATION_SIZE);
        log::debug!("memory allocator growing: new page of {page_size} bytes (request {size}, linear_tiling={linear_tiling})");
        let mut new_page = MemoryPage::new(
            Arc::clone(&self.device),
            &self.instance,
            self.physical_device,
            page_size,
            memory_type_bits,
            host_visible,
            linear_tiling,
        )?;
        let Some(offset) = new_page.try_alloc(size, align) else {
            log::warn!("allocation of {size} bytes failed even in a freshly grown page");
            return Ok(None);
        };
        let mapped_ptr = new_page.mapped_base;
        let memory = new_page.memory;
        pages.push(new_page);
        let page_index = pages.len() - 1;
        Ok(Some(MemoryBlock {
            memory,
            offset,
            size,
            page_index,
            allocator: Arc::downgrade(&self.pages),
            mapped_ptr,
        }))
    }
}

fn largest_free_of_class(pages: &[MemoryPage], linear_tiling: bool) -> u64 {
    pages.iter().filter(|p| p.linear_tiling == linear_tiling).map(|p| p.largest_free()).max().unwrap_or(0)
}

/// Matches `VkPhysicalDeviceMaintenance3Properties::maxMemoryAllocationSize`
/// on the great majority of desktop/mobile Vulkan drivers; used as a
/// conservative cap so a single page request never silently asks the driver
/// for more than it can ever grant (spec §4.1).
const MAX_MEMORY_ALLOCATION_SIZE: u64 = 1 << 31;

impl MemoryPage {
    fn memory_type_index_matches(&self, memory_type_bits: u32, host_visible: bool, linear_tiling: bool) -> bool {
        let type_bit_set = (memory_type_bits & (1 << self.memory_type_index)) != 0;
        type_bit_set && self.mapped_base.is_some() == host_visible && self.linear_tiling == linear_tiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(offset: u64, size: u64) -> FreeRange {
        FreeRange { offset, size }
    }

    #[test]
    fn first_fit_splits_and_aligns() {
        let mut page = FreeListStub { free: vec![range(0, 1024)] };
        let a = page.try_alloc(100, 16).unwrap();
        assert_eq!(a, 0);
        let b = page.try_alloc(50, 32).unwrap();
        assert_eq!(b % 32, 0);
    }

    #[test]
    fn coalesce_merges_adjacent_ranges() {
        let mut page = FreeListStub { free: vec![range(0, 100), range(100, 50)] };
        page.coalesce();
        assert_eq!(page.free, vec![range(0, 150)]);
    }

    // Minimal stand-in exercising the free-list algorithm without a live
    // VkDevice; mirrors MemoryPage's allocation logic exactly.
    struct FreeListStub {
        free: Vec<FreeRange>,
    }

    impl FreeListStub {
        fn try_alloc(&mut self, size: u64, align: u64) -> Option<u64> {
            for i in 0..self.free.len() {
                let r = self.free[i];
                let aligned = align_up(r.offset, align);
                let padding = aligned - r.offset;
                if r.size < padding + size {
                    continue;
                }
                let remainder_offset = aligned + size;
                let remainder_size = r.offset + r.size - remainder_offset;
                self.free.remove(i);
                if padding > 0 {
                    self.free.push(range(r.offset, padding));
                }
                if remainder_size > 0 {
                    self.free.push(range(remainder_offset, remainder_size));
                }
                return Some(aligned);
            }
            None
        }

        fn coalesce(&mut self) {
            self.free.sort_by_key(|r| r.offset);
            let mut merged = Vec::new();
            for r in self.free.drain(..) {
                if let Some(last) = merged.last_mut() as Option<&mut FreeRange> {
                    if last.offset + last.size == r.offset {
                        last.size += r.size;
                        continue;
                    }
                }
                merged.push(r);
            }
            self.free = merged;
        }
    }
}
