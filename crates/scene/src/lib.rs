//! Scene-side collaborators of the frame pipeline.
//!
//! - [`Camera`] supplies view and projection matrices
//! - [`SceneGraph`] owns the node hierarchy and answers world-transform
//!   lookups through [`TransformSource`]
//! - [`Aabb`] and [`Frustum`] back visibility tests

pub mod bounds;
pub mod camera;
mod error;
pub mod graph;
pub mod transform;

pub use bounds::{Aabb, Frustum};
pub use camera::{Camera, CameraMatrices, Projection};
pub use error::{SceneError, SceneResult};
pub use graph::{NodeId, SceneGraph, TransformSource};
pub use transform::Transform;
