//! Integration tests for procedural models and pass membership.

use glam::{Mat4, Vec3};
use lumen_resources::{
    AlphaMode, InstanceDesc, Material, ModelData, ModelId, Pass, PassSet, PrimitiveDesc,
};
use lumen_rhi::Vertex;
use lumen_scene::{SceneGraph, Transform, TransformSource};

#[test]
fn test_multi_primitive_model_validates() {
    let vertices = vec![Vertex::default(); 7];
    let indices = vec![0, 1, 2, 0, 2, 3, 0, 1, 2];
    let model = ModelData::new(ModelId(10), vertices, indices)
        .with_primitive(PrimitiveDesc {
            first_index: 0,
            index_count: 6,
            vertex_offset: 0,
            vertex_count: 4,
            material: Material::opaque(0),
            instances: vec![InstanceDesc::default()],
        })
        .with_primitive(PrimitiveDesc {
            first_index: 6,
            index_count: 3,
            vertex_offset: 4,
            vertex_count: 3,
            material: Material::new(AlphaMode::Blend, false, 1),
            instances: vec![InstanceDesc::default(), InstanceDesc::default().hidden()],
        });

    model.validate().expect("model should validate");
    assert_eq!(model.instance_count(), 3);

    let passes: PassSet = model
        .primitives
        .iter()
        .flat_map(|p| p.material.passes().iter())
        .collect();
    assert_eq!(passes.len(), 3);
    assert!(!passes.contains(Pass::DoubleSided));
}

#[test]
fn test_attached_instances_follow_scene_graph() {
    let mut graph = SceneGraph::new();
    let node = graph
        .add_node("cube", Transform::from_position(Vec3::new(0.0, 3.0, 0.0)), None)
        .unwrap();
    let model = ModelData::cube(
        ModelId(1),
        Material::default(),
        vec![InstanceDesc::attached(node), InstanceDesc::at(Mat4::IDENTITY)],
    );

    let instances = &model.primitives[0].instances;
    let world = instances[0]
        .node
        .and_then(|n| graph.world_transform(n))
        .unwrap();
    assert_eq!(world.transform_point3(Vec3::ZERO), Vec3::new(0.0, 3.0, 0.0));
    assert!(instances[1].node.is_none());

    let bounds = model.primitive_bounds(&model.primitives[0]).unwrap();
    let moved = bounds.transformed(&world);
    assert_eq!(moved.center(), Vec3::new(0.0, 3.0, 0.0));
}
