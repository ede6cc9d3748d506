//! Model, primitive and material descriptions.
//!
//! These are CPU-side inputs to the renderer's scene binding table. Nothing
//! here owns GPU memory: vertex and index arrays are copied into the shared
//! scene buffers at bind time and the `ModelData` may be dropped afterwards.

mod error;
pub mod material;
pub mod model;
pub mod pass;

pub use error::{ResourceError, ResourceResult};
pub use material::{AlphaMode, Material};
pub use model::{InstanceDesc, ModelData, ModelId, PrimitiveDesc};
pub use pass::{PASS_COUNT, Pass, PassSet};
