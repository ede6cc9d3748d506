//! Scene graph errors.

use thiserror::Error;

use crate::graph::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("node {0:?} does not exist")]
    UnknownNode(NodeId),

    /// Reparenting `node` under `parent` would make it its own ancestor.
    #[error("parenting {node:?} under {parent:?} would create a cycle")]
    Cycle { node: NodeId, parent: NodeId },
}

pub type SceneResult<T> = std::result::Result<T, SceneError>;
