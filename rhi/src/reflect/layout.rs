//! std140 offset/alignment calculator (spec §4.6 step 5, "make-block").
//!
//! Grounded on `examples/ennis-autograph-ng/spirv/src/layout.rs`'s
//! `Std140AlignAndSize`/`Std140LayoutBuilder`, re-expressed against a small
//! local `ScalarLayout` description instead of that crate's bespoke
//! `TypeDesc` AST, since the reflector here walks `rspirv::dr::Module`
//! types directly rather than that crate's type system.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Int,
    UInt,
    Float,
}

#[derive(Debug, Clone)]
pub enum MemberType {
    Scalar(Scalar),
    Vector(Scalar, u32),
    Matrix(Scalar, u32, u32),
    Array(Box<MemberType>, u32),
}

fn align_offset(ptr: usize, align: usize) -> usize {
    let rem = ptr % align;
    if rem == 0 {
        0
    } else {
        align - rem
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    let rem = value % multiple;
    if rem == 0 {
        value
    } else {
        value + multiple - rem
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlignAndSize {
    pub align: usize,
    pub size: usize,
}

impl AlignAndSize {
    fn of_array(elem: &MemberType, len: u32) -> AlignAndSize {
        let elem_layout = AlignAndSize::of(elem);
        let base_align = round_up(elem_layout.align, 16);
        let stride = elem_layout.size + align_offset(elem_layout.size, elem_layout.align);
        let array_size = round_up(len as usize * stride, base_align);
        AlignAndSize { align: base_align, size: array_size }
    }

    pub fn of(ty: &MemberType) -> AlignAndSize {
        match ty {
            MemberType::Scalar(_) => AlignAndSize { align: 4, size: 4 },
            MemberType::Vector(_, n) => match n {
                2 => AlignAndSize { align: 8, size: 8 },
                3 => AlignAndSize { align: 16, size: 12 },
                4 => AlignAndSize { align: 16, size: 16 },
                _ => panic!("unsupported vector width {n}"),
            },
            MemberType::Matrix(scalar, rows, cols) => {
                AlignAndSize::of_array(&MemberType::Vector(*scalar, *rows), *cols)
            }
            MemberType::Array(elem, len) => AlignAndSize::of_array(elem, *len),
        }
    }
}

/// Sequentially assigns std140 offsets to members in declaration order,
/// matching `Std140LayoutBuilder::add_member` (the make-block pass runs this
/// once per synthesized block: the push-constant struct, the ShaderAttrib
/// UBO, the dynamic UBO).
#[derive(Default)]
pub struct Std140LayoutBuilder {
    next_offset: usize,
}

impl Std140LayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, ty: &MemberType) -> usize {
        let layout = AlignAndSize::of(ty);
        self.next_offset += align_offset(self.next_offset, layout.align);
        let offset = self.next_offset;
        self.next_offset += layout.size;
        offset
    }

    pub fn total_size(&self) -> usize {
        round_up(self.next_offset, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec3_aligns_to_16_but_occupies_12() {
        let layout = AlignAndSize::of(&MemberType::Vector(Scalar::Float, 3));
        assert_eq!(layout.align, 16);
        assert_eq!(layout.size, 12);
    }

    #[test]
    fn mat4_is_four_vec4_columns() {
        let layout = AlignAndSize::of(&MemberType::Matrix(Scalar::Float, 4, 4));
        assert_eq!(layout.align, 16);
        assert_eq!(layout.size, 64);
    }

    #[test]
    fn sequential_members_pad_to_next_alignment() {
        let mut builder = Std140LayoutBuilder::new();
        let float_offset = builder.add_member(&MemberType::Scalar(Scalar::Float));
        let vec3_offset = builder.add_member(&MemberType::Vector(Scalar::Float, 3));
        assert_eq!(float_offset, 0);
        assert_eq!(vec3_offset, 16, "vec3 must start on a 16-byte boundary even after a lone float");
    }

    #[test]
    fn mvp_and_color_scale_push_constant_layout() {
        // Matches the spec's push-constant block: mat4 MVP + vec4 color scale.
        let mut builder = Std140LayoutBuilder::new();
        let mvp = builder.add_member(&MemberType::Matrix(Scalar::Float, 4, 4));
        let color_scale = builder.add_member(&MemberType::Vector(Scalar::Float, 4));
        assert_eq!(mvp, 0);
        assert_eq!(color_scale, 64);
        assert_eq!(builder.total_size(), 80);
    }
}
