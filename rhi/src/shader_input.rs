//! `ShaderInputBinding` capability interface (spec §6/§9).
//!
//! The source models each way of feeding a shader input (a named uniform, an
//! automatic matrix, a texture stage, a vertex column alias) as its own
//! subclass of a common base, dispatched virtually — on the order of thirty
//! concrete types. Per the re-architecture note in §9, this crate collapses
//! that hierarchy into one object-safe trait implemented by a handful of
//! concrete bindings, grounded on the teacher's `as_any(&self) -> &dyn Any`
//! downcast idiom (used throughout `vulkan/descriptor.rs`/`vulkan/mod.rs` to
//! recover a concrete Vulkan type from a trait object) — the same technique
//! applied here to let `gsg.rs` recover a concrete binding when it needs
//! binding-specific setup (e.g. allocating a sampler) without adding a method
//! to the trait for every special case.

use std::any::Any;

use crate::resource::ResourceId;
use crate::state::{AlteredMask, RenderState};

/// What kind of write a binding performs into a populated descriptor set or
/// push-constant range, resolved by `gsg.rs` into an actual
/// `descriptor_cache::WriteSource` or push-constant byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    PushConstantBytes,
    UniformBufferBytes,
    SampledTexture,
    StorageBuffer,
}

/// One shader input's binding interface (spec §6: "shader inputs bind to one
/// of a small number of kinds"). Implementations are typically zero-sized or
/// carry only the static facts needed to locate their source (a slot index,
/// a texture stage number); the actual resource lookup happens against the
/// `RenderState` passed to `fetch_*`.
pub trait ShaderInputBinding: std::fmt::Debug + Send + Sync {
    /// Bitmask of `AttribSlot`s this binding's output depends on. `gsg.rs`
    /// only re-fetches a binding when `diff_states` reports an overlap with
    /// this mask, per spec §8 invariant 5.
    fn state_dep(&self) -> AlteredMask;

    fn kind(&self) -> InputKind;

    /// One-time setup run the first time a binding is seen for a given
    /// `Shader` (e.g. nothing for a matrix, but descriptor-set-layout
    /// bookkeeping for a texture stage that needs a specific sampler).
    fn setup(&self) {}

    /// Writes this binding's raw byte value (push-constant or UBO member)
    /// into `out`. Returns the number of bytes written; callers size `out`
    /// from the `reflect` layout the binding targets.
    fn fetch_data(&self, state: &RenderState, out: &mut [u8]) -> usize {
        let _ = (state, out);
        0
    }

    /// Resolves the resource id of a texture binding's active texture,
    /// `None` if this binding is not texture-kinded or the state has no
    /// texture at the expected stage.
    fn fetch_texture(&self, state: &RenderState) -> Option<ResourceId> {
        let _ = state;
        None
    }

    /// As `fetch_texture` but for a storage-image-kinded binding.
    fn fetch_texture_image(&self, state: &RenderState) -> Option<ResourceId> {
        let _ = state;
        None
    }

    /// Resolves the resource id of a storage-buffer-kinded binding.
    fn fetch_shader_buffer(&self, state: &RenderState) -> Option<ResourceId> {
        let _ = state;
        None
    }

    /// Resource id this binding itself is keyed on for descriptor-set cache
    /// purposes (spec §4.7): for a `Texture`/`ShaderAttrib` binding this is
    /// the owning attribute's id, used as the cache key in
    /// `descriptor_cache::DescriptorSetCache`.
    fn get_resource_id(&self, state: &RenderState) -> Option<ResourceId>;

    fn as_any(&self) -> &dyn Any;
}

/// The model-view-projection matrix, always bound as push-constant bytes at
/// offset 0 (spec §6). Depends on the transform, not the `RenderState`, so
/// `state_dep()` is empty — `gsg.rs` refreshes it whenever the transform
/// changes, independent of attribute diffing.
#[derive(Debug, Default)]
pub struct MvpBinding;

impl ShaderInputBinding for MvpBinding {
    fn state_dep(&self) -> AlteredMask {
        0
    }

    fn kind(&self) -> InputKind {
        InputKind::PushConstantBytes
    }

    fn get_resource_id(&self, _state: &RenderState) -> Option<ResourceId> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The flat color-scale push-constant member, sourced from the
/// `ColorScale` attrib slot.
#[derive(Debug, Default)]
pub struct ColorScaleBinding;

impl ShaderInputBinding for ColorScaleBinding {
    fn state_dep(&self) -> AlteredMask {
        crate::state::slot_bit(crate::state::AttribSlot::ColorScale)
    }

    fn kind(&self) -> InputKind {
        InputKind::PushConstantBytes
    }

    fn fetch_data(&self, state: &RenderState, out: &mut [u8]) -> usize {
        let Some(attrib) = &state.attribs[crate::state::AttribSlot::ColorScale as usize] else {
            return 0;
        };
        if let crate::state::Attrib::ColorScale { r, g, b, a } = attrib.as_ref() {
            let bytes: [u8; 16] = bytemuck_like_cast(*r, *g, *b, *a);
            let n = bytes.len().min(out.len());
            out[..n].copy_from_slice(&bytes[..n]);
            n
        } else {
            0
        }
    }

    fn get_resource_id(&self, _state: &RenderState) -> Option<ResourceId> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn bytemuck_like_cast(r: f32, g: f32, b: f32, a: f32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&r.to_le_bytes());
    out[4..8].copy_from_slice(&g.to_le_bytes());
    out[8..12].copy_from_slice(&b.to_le_bytes());
    out[12..16].copy_from_slice(&a.to_le_bytes());
    out
}

/// One numbered texture stage (spec §6: `p3d_Texture0`, `p3d_Texture1`, ...).
/// Reads the `Texture` attrib slot and indexes into its `resource_ids` by
/// `stage`.
#[derive(Debug)]
pub struct TextureStageBinding {
    pub stage: usize,
}

impl ShaderInputBinding for TextureStageBinding {
    fn state_dep(&self) -> AlteredMask {
        crate::state::slot_bit(crate::state::AttribSlot::Texture)
    }

    fn kind(&self) -> InputKind {
        InputKind::SampledTexture
    }

    fn fetch_texture(&self, state: &RenderState) -> Option<ResourceId> {
        let attrib = state.attribs[crate::state::AttribSlot::Texture as usize].as_ref()?;
        let crate::state::Attrib::Texture { resource_ids, .. } = attrib.as_ref() else { return None };
        resource_ids.get(self.stage).copied()
    }

    fn get_resource_id(&self, state: &RenderState) -> Option<ResourceId> {
        let attrib = state.attribs[crate::state::AttribSlot::Texture as usize].as_ref()?;
        let crate::state::Attrib::Texture { attrib_id, .. } = attrib.as_ref() else { return None };
        Some(*attrib_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The shader-attribute UBO's resource id (spec §6, set=2 binding=0):
/// sourced from the `ShaderAttrib` slot, which carries whatever scalar
/// uniforms the shader's own source declared.
#[derive(Debug, Default)]
pub struct ShaderAttribUboBinding;

impl ShaderInputBinding for ShaderAttribUboBinding {
    fn state_dep(&self) -> AlteredMask {
        crate::state::slot_bit(crate::state::AttribSlot::ShaderAttrib)
    }

    fn kind(&self) -> InputKind {
        InputKind::UniformBufferBytes
    }

    fn get_resource_id(&self, state: &RenderState) -> Option<ResourceId> {
        let attrib = state.attribs[crate::state::AttribSlot::ShaderAttrib as usize].as_ref()?;
        let crate::state::Attrib::ShaderAttrib { attrib_id, .. } = attrib.as_ref() else { return None };
        Some(*attrib_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Attrib, AttribSlot, RenderStateData, StateCache};
    use std::sync::Arc;

    #[test]
    fn color_scale_binding_writes_16_bytes_from_attrib() {
        let cache = StateCache::default();
        let mut data = RenderStateData::default();
        data.attribs[AttribSlot::ColorScale as usize] =
            Some(Arc::new(Attrib::ColorScale { r: 1.0, g: 0.5, b: 0.25, a: 1.0 }));
        let state = cache.intern(data);

        let binding = ColorScaleBinding;
        let mut out = [0u8; 16];
        let written = binding.fetch_data(&state, &mut out);
        assert_eq!(written, 16);
        assert_eq!(f32::from_le_bytes(out[0..4].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_le_bytes(out[8..12].try_into().unwrap()), 0.25);
    }

    #[test]
    fn texture_stage_binding_indexes_resource_ids_by_stage() {
        let cache = StateCache::default();
        let mut data = RenderStateData::default();
        data.attribs[AttribSlot::Texture as usize] = Some(Arc::new(Attrib::Texture {
            attrib_id: ResourceId(1),
            resource_ids: vec![ResourceId(10), ResourceId(11)],
        }));
        let state = cache.intern(data);

        let stage0 = TextureStageBinding { stage: 0 };
        let stage1 = TextureStageBinding { stage: 1 };
        assert_eq!(stage0.fetch_texture(&state), Some(ResourceId(10)));
        assert_eq!(stage1.fetch_texture(&state), Some(ResourceId(11)));
    }

    #[test]
    fn mvp_binding_has_no_state_dependency() {
        assert_eq!(MvpBinding.state_dep(), 0);
    }
}
