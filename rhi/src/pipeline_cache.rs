//! Pipeline-state cache (spec §4.8): one `VkPipeline` per distinct
//! `(GeomVertexFormat, topology, RenderState subset, FbConfig)`.
//!
//! Grounded on the teacher's `VulkanGraphicsPipeline::create`
//! (`vulkan/pipeline/graphics.rs`) for the shape of
//! `GraphicsPipelineCreateInfo` construction — vertex input state, dynamic
//! viewport/scissor, one shader module per stage. Two changes from the
//! teacher: (1) the render pass is looked up from the shared
//! `framebuffer::FramebufferCache` instead of built fresh per pipeline (the
//! teacher's `create()` calls `create_vk_render_pass` itself and destroys it
//! in its own `Drop`, duplicating what `VulkanDevice`'s cache already holds);
//! (2) shader modules come from `reflect::reflect_and_transform`'s output
//! rather than raw pre-Vulkan-shaped SPIR-V, and the pipeline layout is built
//! from the reflected `Descriptor` list plus the push-constant range instead
//! of a caller-supplied `layout_bindings`.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::error::{Error, Result};
use crate::framebuffer::{ColorAttachmentDesc, DepthAttachmentDesc, FramebufferCache};
use crate::reflect::{Descriptor, DescriptorKind, PushConstantLayout};
use crate::scene_types::{
    primitive_topology_to_vk, topology_allows_restart, vertex_column_to_vk, GeomVertexFormat, PrimitiveTopology,
    TextureFormat, VertexInputRate,
};
use crate::state::{
    resolve_blend_state, BlendFactor, BlendOp, ColorBlendAttrib, ColorWriteMask, CompareOp, CullFaceMode, LogicOp,
    PolygonMode, TransparencyMode,
};

/// Everything a pipeline's fixed-function state depends on besides the
/// shader and render-pass-compatible attachment formats (spec §4.8). Derived
/// from a `RenderState` by `PipelineKey::from_state` in `gsg.rs`; kept here
/// as a flat, `Hash`-able struct rather than holding `Arc<Attrib>`s so two
/// different `RenderState`s with equal relevant slots still share one
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub shader_id: u64,
    pub vertex_format_id: u64,
    pub topology: PrimitiveTopologyKey,
    pub fb_config_id: u32,
    pub cull_face: CullFaceKey,
    pub depth_write: bool,
    pub depth_test: CompareOpKey,
    pub color_write: u32,
    pub logic_op: LogicOpKey,
    pub color_blend: ColorBlendKey,
    pub transparency: TransparencyKey,
    pub render_mode: RenderModeKey,
}

macro_rules! hashable_mirror {
    ($name:ident, $src:ty, [$($variant:ident),+ $(,)?]) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name { $($variant),+ }
        impl From<$src> for $name {
            fn from(v: $src) -> Self {
                match v { $(<$src>::$variant => $name::$variant),+ }
            }
        }
    };
}

hashable_mirror!(PrimitiveTopologyKey, PrimitiveTopology, [TriangleList, TriangleStrip, TriangleFan, LineList, LineStrip, PointList]);
hashable_mirror!(CullFaceKey, CullFaceMode, [None, Front, Back, FrontAndBack]);
hashable_mirror!(CompareOpKey, CompareOp, [Never, Less, Equal, LessOrEqual, Greater, NotEqual, GreaterOrEqual, Always]);
hashable_mirror!(LogicOpKey, LogicOp, [None, Copy, Invert, Xor]);
hashable_mirror!(TransparencyKey, TransparencyMode, [None, Alpha, Multisample, MultisampleMask, Dual]);
hashable_mirror!(RenderModeKey, PolygonMode, [Filled, Wireframe, Point]);
hashable_mirror!(BlendFactorKey, BlendFactor, [Zero, One, SrcAlpha, OneMinusSrcAlpha, DstAlpha, OneMinusDstAlpha]);
hashable_mirror!(BlendOpKey, BlendOp, [Add, Subtract, ReverseSubtract]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorBlendKey {
    pub enabled: bool,
    pub src: BlendFactorKey,
    pub dst: BlendFactorKey,
    pub op: BlendOpKey,
}

impl From<ColorBlendAttrib> for ColorBlendKey {
    fn from(c: ColorBlendAttrib) -> Self {
        Self { enabled: c.enabled, src: c.src_factor.into(), dst: c.dst_factor.into(), op: c.op.into() }
    }
}

struct CachedPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

/// A shader stage module plus its reflected descriptor/push-constant layout,
/// as produced by `reflect::reflect_and_transform` and held by the caller
/// alongside the `Shader` it came from.
pub struct PipelineShaderInput<'a> {
    pub spirv_vertex: &'a [u32],
    pub spirv_fragment: &'a [u32],
    pub entry_point_vertex: &'a str,
    pub entry_point_fragment: &'a str,
    pub descriptors: &'a [Descriptor],
    pub push_constants: PushConstantLayout,
}

pub struct PipelineCache {
    device: Arc<ash::Device>,
    pipelines: HashMap<PipelineKey, CachedPipeline>,
}

fn color_write_mask_to_vk(mask: ColorWriteMask) -> vk::ColorComponentFlags {
    let mut flags = vk::ColorComponentFlags::empty();
    if mask.contains(ColorWriteMask::R) {
        flags |= vk::ColorComponentFlags::R;
    }
    if mask.contains(ColorWriteMask::G) {
        flags |= vk::ColorComponentFlags::G;
    }
    if mask.contains(ColorWriteMask::B) {
        flags |= vk::ColorComponentFlags::B;
    }
    if mask.contains(ColorWriteMask::A) {
        flags |= vk::ColorComponentFlags::A;
    }
    flags
}

fn blend_factor_to_vk(f: BlendFactor) -> vk::BlendFactor {
    match f {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

fn blend_op_to_vk(o: BlendOp) -> vk::BlendOp {
    match o {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
    }
}

fn logic_op_to_vk(o: LogicOp) -> vk::LogicOp {
    match o {
        LogicOp::None => vk::LogicOp::NO_OP,
        LogicOp::Copy => vk::LogicOp::COPY,
        LogicOp::Invert => vk::LogicOp::INVERT,
        LogicOp::Xor => vk::LogicOp::XOR,
    }
}

fn cull_mode_to_vk(c: CullFaceMode) -> vk::CullModeFlags {
    match c {
        CullFaceMode::None => vk::CullModeFlags::NONE,
        CullFaceMode::Front => vk::CullModeFlags::FRONT,
        CullFaceMode::Back => vk::CullModeFlags::BACK,
        CullFaceMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

fn compare_op_to_vk(o: CompareOp) -> vk::CompareOp {
    match o {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

fn polygon_mode_to_vk(p: PolygonMode) -> vk::PolygonMode {
    match p {
        PolygonMode::Filled => vk::PolygonMode::FILL,
        PolygonMode::Wireframe => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

fn descriptor_kind_to_vk(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

fn shader_module_from_words(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(words);
    unsafe { device.create_shader_module(&create_info, None).map_err(Error::from) }
}

fn build_descriptor_set_layouts(
    device: &ash::Device,
    descriptors: &[Descriptor],
) -> Result<Vec<vk::DescriptorSetLayout>> {
    let max_set = descriptors.iter().map(|d| d.set).max().unwrap_or(0);
    let mut layouts = Vec::new();
    for set in 0..=max_set {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = descriptors
            .iter()
            .filter(|d| d.set == set)
            .map(|d| {
                let mut stages = vk::ShaderStageFlags::empty();
                if d.stages.contains(crate::reflect::StageFlags::VERTEX) {
                    stages |= vk::ShaderStageFlags::VERTEX;
                }
                if d.stages.contains(crate::reflect::StageFlags::FRAGMENT) {
                    stages |= vk::ShaderStageFlags::FRAGMENT;
                }
                vk::DescriptorSetLayoutBinding::default()
                    .binding(d.binding)
                    .descriptor_type(descriptor_kind_to_vk(d.kind))
                    .descriptor_count(d.count)
                    .stage_flags(stages)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&create_info, None).map_err(Error::from)? };
        layouts.push(layout);
    }
    Ok(layouts)
}

/// Builds one descriptor-set layout from descriptors already filtered to a
/// single set number (the `set` field is ignored, only `binding` matters).
/// Used by `gsg.rs` to build the standalone set-0/1/2 layouts its
/// `descriptor_cache::DescriptorSetCache` instances need, independent of any
/// one pipeline's layout (which owns and destroys its own copies).
pub(crate) fn build_single_set_layout(
    device: &ash::Device,
    descriptors_for_set: &[Descriptor],
) -> Result<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = descriptors_for_set
        .iter()
        .map(|d| {
            let mut stages = vk::ShaderStageFlags::empty();
            if d.stages.contains(crate::reflect::StageFlags::VERTEX) {
                stages |= vk::ShaderStageFlags::VERTEX;
            }
            if d.stages.contains(crate::reflect::StageFlags::FRAGMENT) {
                stages |= vk::ShaderStageFlags::FRAGMENT;
            }
            vk::DescriptorSetLayoutBinding::default()
                .binding(d.binding)
                .descriptor_type(descriptor_kind_to_vk(d.kind))
                .descriptor_count(d.count)
                .stage_flags(stages)
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None).map_err(Error::from) }
}

impl PipelineCache {
    pub fn new(device: Arc<ash::Device>) -> Self {
        Self { device, pipelines: HashMap::new() }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create(
        &mut self,
        key: PipelineKey,
        shader: &PipelineShaderInput<'_>,
        vertex_format: &GeomVertexFormat,
        framebuffers: &mut FramebufferCache,
        fb_config_colors: &[TextureFormat],
        fb_config_depth: Option<TextureFormat>,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        if let Some(cached) = self.pipelines.get(&key) {
            return Ok((cached.pipeline, cached.layout));
        }

        let colors: Vec<ColorAttachmentDesc> = fb_config_colors
            .iter()
            .map(|&format| ColorAttachmentDesc {
                format,
                load_op: crate::scene_types::LoadOp::Load,
                store_op: crate::scene_types::StoreOp::Store,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            })
            .collect();
        let depth = fb_config_depth.map(|format| DepthAttachmentDesc {
            format,
            load_op: crate::scene_types::LoadOp::Load,
            store_op: crate::scene_types::StoreOp::Store,
        });
        let render_pass = framebuffers.get_or_create_render_pass(&colors, depth.as_ref())?;

        let vs_module = shader_module_from_words(&self.device, shader.spirv_vertex)?;
        let fs_module = shader_module_from_words(&self.device, shader.spirv_fragment)?;

        let vs_entry = CString::new(shader.entry_point_vertex).unwrap_or_default();
        let fs_entry = CString::new(shader.entry_point_fragment).unwrap_or_default();
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs_module)
                .name(&vs_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs_module)
                .name(&fs_entry),
        ];

        let (bindings, attributes) = vertex_input_descriptions(vertex_format);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let vk_topology = primitive_topology_to_vk(key.topology_source());
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk_topology)
            .primitive_restart_enable(topology_allows_restart(key.topology_source()));

        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(polygon_mode_to_vk(key.render_mode.into_source()))
            .line_width(1.0)
            .cull_mode(cull_mode_to_vk(key.cull_face.into_source()))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let blend = resolve_blend_state(
            Some(ColorBlendAttrib {
                enabled: key.color_blend.enabled,
                src_factor: key.color_blend.src.into_source(),
                dst_factor: key.color_blend.dst.into_source(),
                op: key.color_blend.op.into_source(),
            }),
            key.transparency.into_source(),
        );
        let color_write_mask = color_write_mask_to_vk(ColorWriteMask::from_bits_truncate(key.color_write));
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(blend.enabled)
            .src_color_blend_factor(blend_factor_to_vk(blend.src_factor))
            .dst_color_blend_factor(blend_factor_to_vk(blend.dst_factor))
            .color_blend_op(blend_op_to_vk(blend.op))
            .src_alpha_blend_factor(blend_factor_to_vk(blend.src_factor))
            .dst_alpha_blend_factor(blend_factor_to_vk(blend.dst_factor))
            .alpha_blend_op(blend_op_to_vk(blend.op))
            .color_write_mask(color_write_mask);
        let color_blend_attachments = vec![color_blend_attachment; fb_config_colors.len()];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(key.logic_op.into_source() != LogicOp::None)
            .logic_op(logic_op_to_vk(key.logic_op.into_source()))
            .attachments(&color_blend_attachments);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(key.depth_test.into_source() != CompareOp::Always || fb_config_depth.is_some())
            .depth_write_enable(key.depth_write)
            .depth_compare_op(compare_op_to_vk(key.depth_test.into_source()))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let set_layouts = build_descriptor_set_layouts(&self.device, shader.descriptors)?;
        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(shader.push_constants.size as u32);
        let layout_create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_constant_range));
        let pipeline_layout =
            unsafe { self.device.create_pipeline_layout(&layout_create_info, None).map_err(Error::from)? };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend_state)
            .depth_stencil_state(&depth_stencil)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| Error::PipelineCreateFailed(e))?
        };
        let pipeline = pipelines[0];

        unsafe {
            self.device.destroy_shader_module(vs_module, None);
            self.device.destroy_shader_module(fs_module, None);
        }
        for layout in &set_layouts {
            unsafe { self.device.destroy_descriptor_set_layout(*layout, None) };
        }

        log::debug!("graphics pipeline created for key {key:?}");
        self.pipelines.insert(key, CachedPipeline { pipeline, layout: pipeline_layout });
        Ok((pipeline, pipeline_layout))
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        for (_, cached) in self.pipelines.drain() {
            unsafe {
                self.device.destroy_pipeline(cached.pipeline, None);
                self.device.destroy_pipeline_layout(cached.layout, None);
            }
        }
    }
}

fn vertex_input_descriptions(
    format: &GeomVertexFormat,
) -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    let mut bindings = Vec::with_capacity(format.arrays.len());
    let mut attributes = Vec::new();
    for (binding_index, array) in format.arrays.iter().enumerate() {
        bindings.push(
            vk::VertexInputBindingDescription::default()
                .binding(binding_index as u32)
                .stride(array.stride)
                .input_rate(match array.input_rate {
                    VertexInputRate::PerVertex => vk::VertexInputRate::VERTEX,
                    VertexInputRate::PerInstance => vk::VertexInputRate::INSTANCE,
                }),
        );
        for column in &array.columns {
            attributes.push(
                vk::VertexInputAttributeDescription::default()
                    .location(column.location)
                    .binding(binding_index as u32)
                    .format(vertex_column_to_vk(column.numeric_type, column.num_components))
                    .offset(column.offset),
            );
        }
    }
    (bindings, attributes)
}

impl PipelineKey {
    fn topology_source(&self) -> PrimitiveTopology {
        self.topology.into_source()
    }
}

macro_rules! into_source {
    ($name:ident, $src:ty, [$($variant:ident),+ $(,)?]) => {
        impl $name {
            pub fn into_source(self) -> $src {
                match self { $(Self::$variant => <$src>::$variant),+ }
            }
        }
    };
}

into_source!(PrimitiveTopologyKey, PrimitiveTopology, [TriangleList, TriangleStrip, TriangleFan, LineList, LineStrip, PointList]);
into_source!(CullFaceKey, CullFaceMode, [None, Front, Back, FrontAndBack]);
into_source!(CompareOpKey, CompareOp, [Never, Less, Equal, LessOrEqual, Greater, NotEqual, GreaterOrEqual, Always]);
into_source!(LogicOpKey, LogicOp, [None, Copy, Invert, Xor]);
into_source!(TransparencyKey, TransparencyMode, [None, Alpha, Multisample, MultisampleMask, Dual]);
into_source!(RenderModeKey, PolygonMode, [Filled, Wireframe, Point]);
into_source!(BlendFactorKey, BlendFactor, [Zero, One, SrcAlpha, OneMinusSrcAlpha, DstAlpha, OneMinusDstAlpha]);
into_source!(BlendOpKey, BlendOp, [Add, Subtract, ReverseSubtract]);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(color_write: u32) -> PipelineKey {
        PipelineKey {
            shader_id: 1,
            vertex_format_id: 1,
            topology: PrimitiveTopologyKey::TriangleList,
            fb_config_id: 0,
            cull_face: CullFaceKey::Back,
            depth_write: true,
            depth_test: CompareOpKey::Less,
            color_write,
            logic_op: LogicOpKey::None,
            color_blend: ColorBlendKey { enabled: false, src: BlendFactorKey::One, dst: BlendFactorKey::Zero, op: BlendOpKey::Add },
            transparency: TransparencyKey::None,
            render_mode: RenderModeKey::Filled,
        }
    }

    #[test]
    fn identical_keys_are_equal() {
        assert_eq!(sample_key(0b1111), sample_key(0b1111));
    }

    #[test]
    fn differing_color_write_mask_changes_key() {
        assert_ne!(sample_key(0b1111), sample_key(0b0111));
    }

    #[test]
    fn topology_key_round_trips_through_source_enum() {
        let key = PrimitiveTopologyKey::from(PrimitiveTopology::TriangleStrip);
        assert_eq!(key.into_source(), PrimitiveTopology::TriangleStrip);
    }
}
