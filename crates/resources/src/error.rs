//! Errors raised while validating model data.

use thiserror::Error;

use crate::model::ModelId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A model must carry at least one vertex, index and primitive.
    #[error("model {0:?} has no geometry")]
    EmptyModel(ModelId),

    /// A primitive's index or vertex window falls outside the model's arrays.
    #[error("model {model:?} primitive {primitive}: {what} range {start}..{end} exceeds {len}")]
    PrimitiveRange {
        model: ModelId,
        primitive: usize,
        what: &'static str,
        start: usize,
        end: usize,
        len: usize,
    },

    /// An index references a vertex outside its primitive's vertex window.
    #[error("model {model:?} primitive {primitive}: index {index} exceeds vertex count {vertex_count}")]
    IndexOutOfRange {
        model: ModelId,
        primitive: usize,
        index: u32,
        vertex_count: u32,
    },
}

pub type ResourceResult<T> = Result<T, ResourceError>;
