//! Node hierarchy with cached world matrices.

use glam::Mat4;

use crate::error::{SceneError, SceneResult};
use crate::transform::Transform;

/// Index of a node in a [`SceneGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Anything that can resolve a node to its current world matrix.
///
/// The renderer only sees this trait, so instance transforms can come from
/// a [`SceneGraph`] or from any other owner of node state.
pub trait TransformSource {
    fn world_transform(&self, node: NodeId) -> Option<Mat4>;
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    local: Transform,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    world: Mat4,
}

/// Arena of nodes. World matrices are refreshed eagerly on every mutation so
/// lookups are a single read.
#[derive(Debug, Clone, Default)]
pub struct SceneGraph {
    nodes: Vec<Node>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        local: Transform,
        parent: Option<NodeId>,
    ) -> SceneResult<NodeId> {
        let parent_world = match parent {
            Some(p) => self.node(p)?.world,
            None => Mat4::IDENTITY,
        };
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: name.into(),
            local,
            parent,
            children: Vec::new(),
            world: parent_world * local.matrix(),
        });
        if let Some(p) = parent {
            self.nodes[p.index()].children.push(id);
        }
        Ok(id)
    }

    pub fn name(&self, node: NodeId) -> SceneResult<&str> {
        Ok(&self.node(node)?.name)
    }

    pub fn parent(&self, node: NodeId) -> SceneResult<Option<NodeId>> {
        Ok(self.node(node)?.parent)
    }

    pub fn children(&self, node: NodeId) -> SceneResult<&[NodeId]> {
        Ok(&self.node(node)?.children)
    }

    pub fn local(&self, node: NodeId) -> SceneResult<Transform> {
        Ok(self.node(node)?.local)
    }

    pub fn set_local(&mut self, node: NodeId, local: Transform) -> SceneResult<()> {
        self.node(node)?;
        self.nodes[node.index()].local = local;
        self.propagate(node);
        Ok(())
    }

    /// Move `node` under `parent`, or to the root when `parent` is `None`.
    pub fn set_parent(&mut self, node: NodeId, parent: Option<NodeId>) -> SceneResult<()> {
        self.node(node)?;
        if let Some(p) = parent {
            self.node(p)?;
            let mut cursor = Some(p);
            while let Some(c) = cursor {
                if c == node {
                    return Err(SceneError::Cycle { node, parent: p });
                }
                cursor = self.nodes[c.index()].parent;
            }
        }
        if let Some(old) = self.nodes[node.index()].parent {
            self.nodes[old.index()].children.retain(|&c| c != node);
        }
        self.nodes[node.index()].parent = parent;
        if let Some(p) = parent {
            self.nodes[p.index()].children.push(node);
        }
        self.propagate(node);
        Ok(())
    }

    pub fn world_matrix(&self, node: NodeId) -> SceneResult<Mat4> {
        Ok(self.node(node)?.world)
    }

    fn node(&self, node: NodeId) -> SceneResult<&Node> {
        self.nodes
            .get(node.index())
            .ok_or(SceneError::UnknownNode(node))
    }

    fn propagate(&mut self, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let parent_world = self.nodes[id.index()]
                .parent
                .map_or(Mat4::IDENTITY, |p| self.nodes[p.index()].world);
            let node = &mut self.nodes[id.index()];
            node.world = parent_world * node.local.matrix();
            stack.extend_from_slice(&node.children);
        }
    }
}

impl TransformSource for SceneGraph {
    fn world_transform(&self, node: NodeId) -> Option<Mat4> {
        self.world_matrix(node).ok()
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;

    fn position(graph: &SceneGraph, node: NodeId) -> Vec3 {
        graph.world_matrix(node).unwrap().transform_point3(Vec3::ZERO)
    }

    #[test]
    fn child_inherits_parent_translation() {
        let mut graph = SceneGraph::new();
        let parent = graph
            .add_node("parent", Transform::from_position(Vec3::new(10.0, 0.0, 0.0)), None)
            .unwrap();
        let child = graph
            .add_node("child", Transform::from_position(Vec3::new(0.0, 5.0, 0.0)), Some(parent))
            .unwrap();
        assert!((position(&graph, child) - Vec3::new(10.0, 5.0, 0.0)).length() < 1e-5);
        assert_eq!(graph.children(parent).unwrap(), &[child]);
    }

    #[test]
    fn updating_parent_propagates_to_grandchildren() {
        let mut graph = SceneGraph::new();
        let a = graph.add_node("a", Transform::new(), None).unwrap();
        let b = graph
            .add_node("b", Transform::from_position(Vec3::X), Some(a))
            .unwrap();
        let c = graph
            .add_node("c", Transform::from_position(Vec3::X), Some(b))
            .unwrap();

        graph
            .set_local(a, Transform::new().with_rotation(Quat::from_rotation_z(90f32.to_radians())))
            .unwrap();
        assert!((position(&graph, c) - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn parent_scale_applies_to_child_offset() {
        let mut graph = SceneGraph::new();
        let parent = graph
            .add_node("p", Transform::new().with_scale(Vec3::splat(2.0)), None)
            .unwrap();
        let child = graph
            .add_node("c", Transform::from_position(Vec3::new(1.0, 0.0, 0.0)), Some(parent))
            .unwrap();
        assert!((position(&graph, child) - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn reparenting_rejects_cycles() {
        let mut graph = SceneGraph::new();
        let a = graph.add_node("a", Transform::new(), None).unwrap();
        let b = graph.add_node("b", Transform::new(), Some(a)).unwrap();
        assert_eq!(
            graph.set_parent(a, Some(b)),
            Err(SceneError::Cycle { node: a, parent: b })
        );
        assert_eq!(
            graph.set_parent(a, Some(a)),
            Err(SceneError::Cycle { node: a, parent: a })
        );
    }

    #[test]
    fn reparenting_moves_child_between_lists() {
        let mut graph = SceneGraph::new();
        let a = graph
            .add_node("a", Transform::from_position(Vec3::X), None)
            .unwrap();
        let b = graph
            .add_node("b", Transform::from_position(Vec3::Y), None)
            .unwrap();
        let c = graph.add_node("c", Transform::new(), Some(a)).unwrap();

        graph.set_parent(c, Some(b)).unwrap();
        assert!(graph.children(a).unwrap().is_empty());
        assert_eq!(graph.children(b).unwrap(), &[c]);
        assert_eq!(position(&graph, c), Vec3::Y);

        graph.set_parent(c, None).unwrap();
        assert_eq!(position(&graph, c), Vec3::ZERO);
    }

    #[test]
    fn unknown_nodes_are_reported() {
        let mut graph = SceneGraph::new();
        let missing = NodeId(7);
        assert_eq!(
            graph.add_node("x", Transform::new(), Some(missing)),
            Err(SceneError::UnknownNode(missing))
        );
        assert!(graph.world_transform(missing).is_none());
        assert!(graph.is_empty());
    }
}
