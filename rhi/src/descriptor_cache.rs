//! Descriptor-set cache (spec §4.7): one Vulkan descriptor set per distinct
//! attribute identity, reused across frames until the attribute it was built
//! from is dropped.
//!
//! Grounded on the teacher's `VulkanDescriptorPool`/`VulkanDescriptorSet`
//! (`vulkan/descriptor.rs`) for allocation and `write_*` shape, generalized
//! two ways the teacher has no equivalent of: (1) the cache key is the
//! `Arc` pointer of the owning `Attrib`, not a call site decision, so a
//! `Texture`/`ShaderAttrib` bound by two different `RenderState`s resolves
//! to the same descriptor set; (2) every write for one populate pass is
//! batched into a single `vkUpdateDescriptorSets`, where the teacher issues
//! one call per `write_*` method.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use ash::vk;

use crate::error::{Error, Result};
use crate::reflect::{Descriptor, DescriptorKind};
use crate::resource::ResourceId;
use crate::state::Attrib;

fn descriptor_kind_to_vk(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

/// What a descriptor set write needs, resolved by the caller (`gsg.rs`) from
/// `ResourceId`s into live Vulkan handles just before `populate`.
pub enum WriteSource {
    Buffer { buffer: vk::Buffer, offset: u64, range: u64 },
    Image { view: vk::ImageView, sampler: vk::Sampler, layout: vk::ImageLayout },
}

struct CachedSet {
    set: vk::DescriptorSet,
    last_update_frame: u64,
    /// Weak back-reference to the `Attrib` this set was built for; once it
    /// drops, the next `sweep` call reclaims the set instead of updating it.
    owner: Weak<Attrib>,
}

/// One entry per `(layout identity, attribute pointer)`. Layout identity is
/// the `Vec<Descriptor>` slice from `reflect::ReflectedShader` for the set in
/// question; in practice one `Shader` has exactly one layout per Vulkan
/// descriptor set number, so keying on the attribute pointer alone is
/// sufficient as long as callers only ever look a given attribute up against
/// one layout (true here: `Texture`/`Light` always populate set 1,
/// `ShaderAttrib` always populates set 2).
pub struct DescriptorSetCache {
    device: Arc<ash::Device>,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    entries: HashMap<ResourceId, CachedSet>,
}

impl DescriptorSetCache {
    pub fn new(device: Arc<ash::Device>, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> Self {
        Self { device, pool, layout, entries: HashMap::new() }
    }

    /// Returns the descriptor set for `attrib_id`, allocating and populating
    /// it on first sight. On a cache hit within the same `current_frame` the
    /// set is returned as-is without touching Vulkan; on a hit from an older
    /// frame the set is still reused (its contents never change once
    /// written, since the `Attrib` is immutable) but `last_update_frame` is
    /// refreshed so `sweep` knows it is still live.
    pub fn get_or_populate(
        &mut self,
        attrib_id: ResourceId,
        owner: &Arc<Attrib>,
        descriptors: &[Descriptor],
        sources: &[(u32, WriteSource)],
        current_frame: u64,
    ) -> Result<vk::DescriptorSet> {
        if let Some(cached) = self.entries.get_mut(&attrib_id) {
            cached.last_update_frame = current_frame;
            return Ok(cached.set);
        }

        let set = self.allocate_set()?;
        self.populate(set, descriptors, sources);
        self.entries.insert(
            attrib_id,
            CachedSet { set, last_update_frame: current_frame, owner: Arc::downgrade(owner) },
        );
        Ok(set)
    }

    fn allocate_set(&self) -> Result<vk::DescriptorSet> {
        let layouts = [self.layout];
        let alloc_info =
            vk::DescriptorSetAllocateInfo::default().descriptor_pool(self.pool).set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info).map_err(Error::from)? };
        Ok(sets[0])
    }

    /// Issues one `vkUpdateDescriptorSets` call covering every binding in
    /// `descriptors`, rather than the teacher's one-call-per-write pattern.
    fn populate(&self, set: vk::DescriptorSet, descriptors: &[Descriptor], sources: &[(u32, WriteSource)]) {
        let mut buffer_infos = Vec::with_capacity(sources.len());
        let mut image_infos = Vec::with_capacity(sources.len());
        let mut writes = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let Some((_, source)) = sources.iter().find(|(b, _)| *b == descriptor.binding) else {
                log::warn!(
                    "descriptor_cache: no write source supplied for binding {} ({})",
                    descriptor.binding,
                    descriptor.name
                );
                continue;
            };
            match source {
                WriteSource::Buffer { buffer, offset, range } => {
                    buffer_infos.push(
                        vk::DescriptorBufferInfo::default().buffer(*buffer).offset(*offset).range(*range),
                    );
                    let info_idx = buffer_infos.len() - 1;
                    writes.push((descriptor.binding, descriptor.kind, Some(info_idx), None));
                }
                WriteSource::Image { view, sampler, layout } => {
                    image_infos.push(
                        vk::DescriptorImageInfo::default().image_view(*view).sampler(*sampler).image_layout(*layout),
                    );
                    let info_idx = image_infos.len() - 1;
                    writes.push((descriptor.binding, descriptor.kind, None, Some(info_idx)));
                }
            }
        }

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|(binding, kind, buf_idx, img_idx)| {
                let mut w = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(descriptor_kind_to_vk(*kind));
                if let Some(i) = buf_idx {
                    w = w.buffer_info(std::slice::from_ref(&buffer_infos[*i]));
                }
                if let Some(i) = img_idx {
                    w = w.image_info(std::slice::from_ref(&image_infos[*i]));
                }
                w
            })
            .collect();

        if !vk_writes.is_empty() {
            unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        }
    }

    /// Drops cache entries whose owning `Attrib` no longer has any strong
    /// reference and returns their descriptor sets for the caller to queue
    /// onto the current frame slot's deferred-destroy list (spec §4.7:
    /// "weak-reference invalidation... deferred via FrameData") — a set
    /// still referenced by an in-flight command buffer must not be freed
    /// back to the pool before that buffer retires. Called once per frame
    /// boundary from `gsg.rs::end_frame`.
    #[must_use]
    pub fn sweep(&mut self) -> Vec<vk::DescriptorSet> {
        let dead: Vec<vk::DescriptorSet> = self
            .entries
            .iter()
            .filter(|(_, cached)| cached.owner.strong_count() == 0)
            .map(|(_, cached)| cached.set)
            .collect();
        if !dead.is_empty() {
            self.entries.retain(|_, cached| cached.owner.strong_count() > 0);
        }
        dead
    }

    pub fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for DescriptorSetCache {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_kind_maps_combined_image_sampler() {
        assert_eq!(
            descriptor_kind_to_vk(DescriptorKind::CombinedImageSampler),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn descriptor_kind_maps_storage_buffer() {
        assert_eq!(descriptor_kind_to_vk(DescriptorKind::StorageBuffer), vk::DescriptorType::STORAGE_BUFFER);
    }
}
