//! Render pass categories and pass membership sets.

use std::fmt;

/// Number of render pass categories.
pub const PASS_COUNT: usize = 4;

/// A render pass category. Declaration order is pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pass {
    /// Depth-only pass that lays down depth for opaque geometry.
    DepthPrepass,
    Opaque,
    /// Opaque geometry drawn without back-face culling.
    DoubleSided,
    /// Alpha-blended geometry, drawn last without depth writes.
    Transparent,
}

impl Pass {
    /// All passes in the order the renderer records them.
    pub const ALL: [Pass; PASS_COUNT] = [
        Pass::DepthPrepass,
        Pass::Opaque,
        Pass::DoubleSided,
        Pass::Transparent,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Pass::DepthPrepass => "depth-prepass",
            Pass::Opaque => "opaque",
            Pass::DoubleSided => "double-sided",
            Pass::Transparent => "transparent",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The set of passes a primitive is drawn in.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PassSet(u8);

impl PassSet {
    pub const EMPTY: PassSet = PassSet(0);

    pub fn of(passes: &[Pass]) -> Self {
        passes.iter().copied().collect()
    }

    #[inline]
    pub fn contains(self, pass: Pass) -> bool {
        self.0 & Self::bit(pass) != 0
    }

    pub fn insert(&mut self, pass: Pass) {
        self.0 |= Self::bit(pass);
    }

    pub fn remove(&mut self, pass: Pass) {
        self.0 &= !Self::bit(pass);
    }

    pub fn with(mut self, pass: Pass) -> Self {
        self.insert(pass);
        self
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Member passes in pipeline order.
    pub fn iter(self) -> impl Iterator<Item = Pass> + Clone {
        Pass::ALL.into_iter().filter(move |&p| self.contains(p))
    }

    #[inline]
    const fn bit(pass: Pass) -> u8 {
        1 << pass as u8
    }
}

impl FromIterator<Pass> for PassSet {
    fn from_iter<I: IntoIterator<Item = Pass>>(iter: I) -> Self {
        let mut set = PassSet::EMPTY;
        for pass in iter {
            set.insert(pass);
        }
        set
    }
}

impl fmt::Debug for PassSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
