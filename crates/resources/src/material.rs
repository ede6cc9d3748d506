//! Material description as seen by the frame pipeline.

use glam::Vec4;

use crate::pass::{Pass, PassSet};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlphaMode {
    #[default]
    Opaque,
    /// Alpha-tested; drawn with opaque geometry.
    Mask,
    Blend,
}

/// The parts of a material that decide how a primitive is drawn.
///
/// Texture and shading parameters live with the asset system; the renderer
/// only needs pass membership and the index it writes into instance data.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub alpha_mode: AlphaMode,
    pub double_sided: bool,
    /// Index into the material table the shaders read.
    pub material_index: u32,
    pub base_color: Vec4,
    passes: PassSet,
}

impl Default for Material {
    fn default() -> Self {
        Self::new(AlphaMode::Opaque, false, 0)
    }
}

impl Material {
    /// Build a material whose passes follow from its alpha mode and sidedness.
    pub fn new(alpha_mode: AlphaMode, double_sided: bool, material_index: u32) -> Self {
        Self {
            alpha_mode,
            double_sided,
            material_index,
            base_color: Vec4::ONE,
            passes: derive_passes(alpha_mode, double_sided),
        }
    }

    pub fn opaque(material_index: u32) -> Self {
        Self::new(AlphaMode::Opaque, false, material_index)
    }

    pub fn transparent(material_index: u32) -> Self {
        Self::new(AlphaMode::Blend, false, material_index)
    }

    pub fn with_base_color(mut self, base_color: Vec4) -> Self {
        self.base_color = base_color;
        self
    }

    /// Replace the derived pass membership.
    pub fn with_passes(mut self, passes: PassSet) -> Self {
        self.passes = passes;
        self
    }

    /// The passes primitives using this material are drawn in.
    #[inline]
    pub fn passes(&self) -> PassSet {
        self.passes
    }

    pub fn draws_in(&self, pass: Pass) -> bool {
        self.passes.contains(pass)
    }
}

fn derive_passes(alpha_mode: AlphaMode, double_sided: bool) -> PassSet {
    match (alpha_mode, double_sided) {
        (AlphaMode::Blend, _) => PassSet::of(&[Pass::Transparent]),
        (_, true) => PassSet::of(&[Pass::DepthPrepass, Pass::DoubleSided]),
        (_, false) => PassSet::of(&[Pass::DepthPrepass, Pass::Opaque]),
    }
}
