//! External-collaborator stand-ins for the scene graph and asset layer
//! (spec §6): `GeomVertexFormat`, `GeomVertexArrayData`, `GeomPrimitive`,
//! `Texture`, `SamplerState`, `Shader`. These are not part of the GSG core;
//! the core only reads them through narrow accessors, matching the
//! teacher's `TextureDescriptor`/`BufferDescriptor` field shapes and the
//! `TextureFormat`/`PrimitiveTopology`/`LoadOp`/`StoreOp` enums in `lib.rs`.

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    R32Float,
    Rgba16Float,
    R16Float,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
}

pub fn texture_format_to_vk(f: TextureFormat) -> vk::Format {
    match f {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R16Float => vk::Format::R16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
        TextureFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub fn vk_to_texture_format(f: vk::Format) -> Option<TextureFormat> {
    Some(match f {
        vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
        vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
        vk::Format::R32_SFLOAT => TextureFormat::R32Float,
        vk::Format::R16G16B16A16_SFLOAT => TextureFormat::Rgba16Float,
        vk::Format::R16_SFLOAT => TextureFormat::R16Float,
        vk::Format::R32G32B32A32_SFLOAT => TextureFormat::Rgba32Float,
        vk::Format::D32_SFLOAT => TextureFormat::D32Float,
        vk::Format::D24_UNORM_S8_UINT => TextureFormat::D24UnormS8Uint,
        _ => return None,
    })
}

pub fn is_depth_format(f: TextureFormat) -> bool {
    matches!(f, TextureFormat::D32Float | TextureFormat::D24UnormS8Uint)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// `(numeric_type, num_components)` as carried by a `GeomVertexArrayFormat`
/// column (spec §4.8); maps deterministically to a `VkFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericType {
    Uint8,
    Uint16,
    Uint32,
    Float32,
    PackedDabc,
}

pub fn vertex_column_to_vk(numeric_type: NumericType, num_components: u8) -> vk::Format {
    use NumericType::*;
    match (numeric_type, num_components) {
        (Uint8, 1) => vk::Format::R8_UINT,
        (Uint8, 2) => vk::Format::R8G8_UINT,
        (Uint8, 3) => vk::Format::R8G8B8_UINT,
        (Uint8, 4) => vk::Format::R8G8B8A8_UINT,
        (Uint16, 1) => vk::Format::R16_UINT,
        (Uint16, 2) => vk::Format::R16G16_UINT,
        (Uint16, 3) => vk::Format::R16G16B16_UINT,
        (Uint16, 4) => vk::Format::R16G16B16A16_UINT,
        (Uint32, 1) => vk::Format::R32_UINT,
        (Uint32, 2) => vk::Format::R32G32_UINT,
        (Uint32, 3) => vk::Format::R32G32B32_UINT,
        (Uint32, 4) => vk::Format::R32G32B32A32_UINT,
        (Float32, 1) => vk::Format::R32_SFLOAT,
        (Float32, 2) => vk::Format::R32G32_SFLOAT,
        (Float32, 3) => vk::Format::R32G32B32_SFLOAT,
        (Float32, 4) => vk::Format::R32G32B32A32_SFLOAT,
        (PackedDabc, _) => vk::Format::A8B8G8R8_UINT_PACK32,
        _ => vk::Format::R32_SFLOAT,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexInputRate {
    PerVertex,
    PerInstance,
}

#[derive(Debug, Clone)]
pub struct GeomVertexColumn {
    pub name: &'static str,
    pub numeric_type: NumericType,
    pub num_components: u8,
    pub offset: u32,
    pub location: u32,
}

/// One vertex array within a `GeomVertexFormat` (spec calls this
/// `GeomVertexArrayData`): a stride, an input rate, and the columns packed
/// into it.
#[derive(Debug, Clone)]
pub struct GeomVertexArrayFormat {
    pub stride: u32,
    pub input_rate: VertexInputRate,
    pub columns: Vec<GeomVertexColumn>,
}

/// The full vertex format consumed by pipeline creation: one binding per
/// array, pointer-uniquified like the rest of the render-state graph so
/// `PipelineKey` equality can be a pointer compare.
#[derive(Debug, Clone)]
pub struct GeomVertexFormat {
    pub arrays: Vec<GeomVertexArrayFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    TriangleFan,
    LineList,
    LineStrip,
    PointList,
}

pub fn primitive_topology_to_vk(t: PrimitiveTopology) -> vk::PrimitiveTopology {
    match t {
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

/// Primitive-restart is only meaningful for strip/fan topologies (spec §4.8).
pub fn topology_allows_restart(t: PrimitiveTopology) -> bool {
    matches!(t, PrimitiveTopology::TriangleStrip | PrimitiveTopology::TriangleFan | PrimitiveTopology::LineStrip)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// A single draw's geometry: vertex data handle, optional indices, vertex
/// count, topology. The CPU-side buffers themselves are held by the scene
/// graph; the core only ever sees GPU-side `BufferContext`s derived from
/// them (see `gsg.rs::draw_triangles`).
#[derive(Debug, Clone)]
pub struct GeomPrimitive {
    pub topology: PrimitiveTopology,
    pub index_format: Option<IndexFormat>,
    pub vertex_count: u32,
    pub first_vertex: u32,
    pub instance_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    Repeat,
    ClampToEdge,
    MirroredRepeat,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerState {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub wrap_w: WrapMode,
    pub max_anisotropy: f32,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            wrap_u: WrapMode::Repeat,
            wrap_v: WrapMode::Repeat,
            wrap_w: WrapMode::Repeat,
            max_anisotropy: 1.0,
        }
    }
}

pub fn filter_to_vk(f: FilterMode) -> vk::Filter {
    match f {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

pub fn wrap_to_vk(w: WrapMode) -> vk::SamplerAddressMode {
    match w {
        WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
        WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        WrapMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

/// Asset-layer texture handle. Decoding compressed image formats (PNG, KTX,
/// ...) is out of scope (spec §1); `initial_data`, when given, is already
/// decoded pixels tightly packed in `format`'s layout, uploaded through a
/// staging buffer the first time the texture is actually used. Mip
/// generation is left to the caller.
#[derive(Debug)]
pub struct Texture {
    pub id: crate::resource::ResourceId,
    pub format: TextureFormat,
    pub extent: (u32, u32, u32),
    pub mip_levels: u32,
    pub array_layers: u32,
    pub initial_data: Option<Vec<u8>>,
}

/// One SPIR-V module per stage, pre-reflection. `Shader` itself is
/// pointer-uniquified by the caller; the core keys its pipeline cache per
/// shader instance.
#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub spirv: Vec<u32>,
    pub entry_point: String,
}

#[derive(Debug, Clone)]
pub struct Shader {
    pub vertex: ShaderStage,
    pub fragment: ShaderStage,
}
