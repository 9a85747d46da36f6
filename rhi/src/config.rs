//! Ambient tunables. The teacher hardcodes constants like
//! `DEFAULT_POOL_MULTIPLIER` (`vulkan/descriptor.rs`) inline; the GSG core
//! collects its equivalents into one struct so a caller can see and override
//! them instead of hunting for literals.

/// Descriptor set index conventions, fixed by the external shader contract.
/// A `RenderState` attribute's descriptors always land in the set matching
/// the attribute kind it came from; `DynamicUniforms` holds the per-draw MVP
/// / color-scale block allocated out of the UBO arena.
pub const SET_LIGHT_ATTRIB: u32 = 0;
pub const SET_TEXTURE_ATTRIB: u32 = 1;
pub const SET_SHADER_ATTRIB: u32 = 2;
pub const SET_DYNAMIC_UNIFORMS: u32 = 3;

#[derive(Debug, Clone)]
pub struct GsgConfig {
    /// Number of frames the CPU may have in flight before it must block on
    /// the oldest frame's fence at `begin_frame`.
    pub frames_in_flight: u32,
    /// Size in bytes of the ring-allocated dynamic-uniform arena backing
    /// `SET_DYNAMIC_UNIFORMS`; one slice is carved out per draw call.
    pub uniform_buffer_arena_size: u64,
    /// Size in bytes of the color-palette buffer (Open Question 3): a
    /// dedicated storage buffer of packed per-instance color scales, indexed
    /// by instance id rather than duplicated into push constants.
    pub color_palette_buffer_size: u64,
    /// Default page size requested when `MemoryAllocator` has no page with
    /// enough free space and must grow.
    pub memory_page_size: u64,
    /// Initial descriptor pool capacity (sets); grown by allocating
    /// additional pools rather than resizing one, mirroring the teacher's
    /// `DEFAULT_POOL_MULTIPLIER` headroom strategy.
    pub descriptor_pool_max_sets: u32,
}

impl Default for GsgConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            uniform_buffer_arena_size: 4 * 1024 * 1024,
            color_palette_buffer_size: 256 * 1024,
            memory_page_size: 64 * 1024 * 1024,
            descriptor_pool_max_sets: 256,
        }
    }
}
