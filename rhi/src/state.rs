//! `RenderState`/`TransformState` stand-ins (spec §3, §9).
//!
//! The source models `RenderAttrib` as a class hierarchy with virtual
//! dispatch per subclass and `RenderState` as a `CPT`-refcounted,
//! hash-consed pointer graph. Per the re-architecture note in §9, attributes
//! here are a tagged variant (`Attrib`) over the closed set of slots spec §3
//! lists, with a `Generic` fallback for anything else; `RenderState` is a
//! plain `Arc<RenderStateData>` produced by a hash-consing `StateCache` so
//! that `Arc::ptr_eq` is a valid state-equality check, matching the
//! teacher's builder-style descriptor structs (`TextureDescriptor`,
//! `GraphicsPipelineDescriptor`) for field shape.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use crate::resource::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum AttribSlot {
    Color = 0,
    ColorScale = 1,
    Texture = 2,
    Light = 3,
    Material = 4,
    CullFace = 5,
    DepthWrite = 6,
    DepthTest = 7,
    ColorWrite = 8,
    ColorBlend = 9,
    LogicOp = 10,
    Transparency = 11,
    RenderMode = 12,
    CullBin = 13,
    ClipPlane = 14,
    Fog = 15,
    Shader = 16,
    ShaderAttrib = 17,
    TexMatrix = 18,
    TexGen = 19,
}

pub const NUM_SLOTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullFaceMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    None,
    Copy,
    Invert,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransparencyMode {
    None,
    Alpha,
    Multisample,
    MultisampleMask,
    Dual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonMode {
    Filled,
    Wireframe,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorBlendAttrib {
    pub enabled: bool,
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub op: BlendOp,
}

/// Derives pipeline blend state from an explicit `ColorBlendAttrib` if
/// present, otherwise from the transparency mode (spec §4.8). Exercises the
/// round-trip law in §8: `ColorBlendAttrib::none() + Transparency::Alpha`
/// produces `SRC_ALPHA`/`ONE_MINUS_SRC_ALPHA` with blending enabled.
pub fn resolve_blend_state(
    custom: Option<ColorBlendAttrib>,
    transparency: TransparencyMode,
) -> ColorBlendAttrib {
    if let Some(c) = custom {
        if c.enabled {
            return c;
        }
    }
    match transparency {
        TransparencyMode::Alpha | TransparencyMode::Dual => ColorBlendAttrib {
            enabled: true,
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            op: BlendOp::Add,
        },
        _ => ColorBlendAttrib {
            enabled: false,
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            op: BlendOp::Add,
        },
    }
}

/// One rendering attribute. Variants that participate in descriptor-set
/// population (`Texture`, `Light`, `ShaderAttrib`) carry a stable resource id
/// the descriptor-set cache keys on; the rest only affect pipeline state.
#[derive(Debug, Clone, PartialEq)]
pub enum Attrib {
    Color { r: f32, g: f32, b: f32, a: f32 },
    ColorScale { r: f32, g: f32, b: f32, a: f32 },
    Texture { attrib_id: ResourceId, resource_ids: Vec<ResourceId> },
    Light { attrib_id: ResourceId, resource_ids: Vec<ResourceId> },
    Material { ambient: [f32; 4], diffuse: [f32; 4], specular: [f32; 4], shininess: f32 },
    CullFace(CullFaceMode),
    DepthWrite(bool),
    DepthTest(CompareOp),
    ColorWrite(ColorWriteMask),
    ColorBlend(ColorBlendAttrib),
    LogicOp(LogicOp),
    Transparency(TransparencyMode),
    RenderMode(PolygonMode),
    CullBin { bin_name: &'static str, draw_order: i32 },
    ClipPlane { plane_ids: Vec<ResourceId> },
    Fog { mode: u8, color: [f32; 3], density: f32 },
    Shader { attrib_id: ResourceId },
    ShaderAttrib { attrib_id: ResourceId, resource_ids: Vec<ResourceId> },
    TexMatrix { matrices: Vec<[f32; 16]> },
    TexGen { modes: Vec<u8> },
    /// Fallback for any slot not modeled above; carries only enough to
    /// participate in equality/altered-mask diffing.
    Generic { attrib_id: ResourceId, tag: u32 },
}

/// Bitmask of `AttribSlot`s, used both as the `altered` result of
/// `diff_states` and to declare a `ShaderInputBinding`'s `state_dep`.
pub type AlteredMask = u32;

pub fn slot_bit(slot: AttribSlot) -> AlteredMask {
    1 << (slot as usize)
}

#[derive(Debug, Default)]
pub struct RenderStateData {
    pub attribs: [Option<Arc<Attrib>>; NUM_SLOTS],
}

impl PartialEq for RenderStateData {
    fn eq(&self, other: &Self) -> bool {
        self.attribs.iter().zip(other.attribs.iter()).all(|(a, b)| match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        })
    }
}
impl Eq for RenderStateData {}

impl Hash for RenderStateData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for a in &self.attribs {
            match a {
                Some(attrib) => {
                    1u8.hash(state);
                    format!("{attrib:?}").hash(state);
                }
                None => 0u8.hash(state),
            }
        }
    }
}

/// Immutable, hash-consed `RenderState` (spec GLOSSARY). Equal content always
/// resolves to the same `Arc`, so comparing states by pointer (`Arc::ptr_eq`)
/// is valid — this is what `set_state_and_transform` relies on to skip
/// re-diffing identical states frame to frame.
pub type RenderState = Arc<RenderStateData>;

/// Computes the exact set of slots where `a.attrib[slot] != b.attrib[slot]`
/// (spec §8 invariant 5). Pointer comparison is sufficient because both
/// states are produced by the same `StateCache`.
pub fn diff_states(a: &RenderState, b: &RenderState) -> AlteredMask {
    if Arc::ptr_eq(a, b) {
        return 0;
    }
    let mut mask = 0;
    for i in 0..NUM_SLOTS {
        let changed = match (&a.attribs[i], &b.attribs[i]) {
            (None, None) => false,
            (Some(x), Some(y)) => !Arc::ptr_eq(x, y) && x != y,
            _ => true,
        };
        if changed {
            mask |= 1 << i;
        }
    }
    mask
}

/// Hash-conses `RenderStateData` values so that equivalent states share one
/// `Arc`. Holds only weak references (spec §9: "the uniquification cache
/// stays but holds weak references") so a state with no remaining strong
/// owner is dropped instead of leaking.
#[derive(Default)]
pub struct StateCache {
    table: Mutex<HashMap<u64, Vec<Weak<RenderStateData>>>>,
}

impl StateCache {
    pub fn intern(&self, data: RenderStateData) -> RenderState {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        let key = hasher.finish();

        let mut table = self.table.lock().expect("state cache mutex poisoned");
        let bucket = table.entry(key).or_default();
        bucket.retain(|w| w.strong_count() > 0);
        for existing in bucket.iter() {
            if let Some(arc) = existing.upgrade() {
                if *arc == data {
                    return arc;
                }
            }
        }
        let arc = Arc::new(data);
        bucket.push(Arc::downgrade(&arc));
        arc
    }

    pub fn empty(&self) -> RenderState {
        self.intern(RenderStateData::default())
    }
}

/// 4x4 column-major transform matrix. Hash-consing `TransformState` the same
/// way as `RenderState` is not load-bearing for correctness (matrices are
/// cheap to compare by value and pipeline selection never keys on them), so
/// it is kept as a plain `Arc<[f32; 16]>` for cheap clone/share without an
/// interning table.
pub type TransformState = Arc<[f32; 16]>;

pub fn identity_transform() -> TransformState {
    Arc::new([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_interns_to_same_arc() {
        let cache = StateCache::default();
        let mut a = RenderStateData::default();
        a.attribs[AttribSlot::DepthWrite as usize] = Some(Arc::new(Attrib::DepthWrite(true)));
        let s1 = cache.intern(a);

        let mut b = RenderStateData::default();
        b.attribs[AttribSlot::DepthWrite as usize] = Some(Arc::new(Attrib::DepthWrite(true)));
        let s2 = cache.intern(b);

        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[test]
    fn diff_reports_exactly_changed_slots() {
        let cache = StateCache::default();
        let base = cache.empty();
        let mut changed = RenderStateData::default();
        changed.attribs[AttribSlot::CullFace as usize] = Some(Arc::new(Attrib::CullFace(CullFaceMode::Back)));
        let changed = cache.intern(changed);

        let mask = diff_states(&base, &changed);
        assert_eq!(mask, slot_bit(AttribSlot::CullFace));
    }

    #[test]
    fn none_transparency_with_alpha_blend_attrib_sets_src_alpha() {
        let blend = resolve_blend_state(None, TransparencyMode::Alpha);
        assert!(blend.enabled);
        assert_eq!(blend.src_factor, BlendFactor::SrcAlpha);
        assert_eq!(blend.dst_factor, BlendFactor::OneMinusSrcAlpha);
    }
}
