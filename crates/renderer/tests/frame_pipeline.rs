//! End-to-end frame pipeline tests on the headless backend.

use std::sync::Arc;
use std::time::Duration;

use glam::{Mat4, Vec3};
use lumen_core::RendererConfig;
use lumen_renderer::{
    FrameStatus, FrameUniforms, FrustumCuller, InstanceData, Renderer, RendererError,
};
use lumen_resources::{
    AlphaMode, InstanceDesc, Material, ModelData, ModelId, Pass, PassSet, PrimitiveDesc,
};
use lumen_rhi::headless::{HeadlessBackend, HeadlessConfig};
use lumen_rhi::{Backend, DrawIndexedIndirectCommand, Extent2D, PresentOutcome, Vertex};

const EXTENT: Extent2D = Extent2D {
    width: 800,
    height: 600,
};

fn config(frames_in_flight: usize) -> RendererConfig {
    RendererConfig {
        frames_in_flight,
        max_draws: 64,
        max_instances: 256,
        vertex_capacity: 4096,
        index_capacity: 8192,
        fence_timeout_ms: 2000,
        ..RendererConfig::default()
    }
}

fn backend(config: HeadlessConfig) -> Arc<HeadlessBackend> {
    Arc::new(HeadlessBackend::new(config).unwrap())
}

fn renderer(backend: &Arc<HeadlessBackend>, config: &RendererConfig) -> Renderer<HeadlessBackend> {
    Renderer::new(Arc::clone(backend), config, EXTENT).unwrap()
}

fn opaque_cube(id: u64, instances: usize) -> ModelData {
    ModelData::cube(
        ModelId(id),
        Material::opaque(id as u32),
        vec![InstanceDesc::default(); instances],
    )
}

/// Two quads sharing one model: the first only in the depth prepass, the
/// second opaque.
fn prepass_and_opaque_model() -> ModelData {
    let quad = [0, 1, 2, 0, 2, 3];
    let indices = quad.iter().chain(quad.iter()).copied().collect();
    ModelData::new(ModelId(7), vec![Vertex::default(); 8], indices)
        .with_primitive(PrimitiveDesc {
            first_index: 0,
            index_count: 6,
            vertex_offset: 0,
            vertex_count: 4,
            material: Material::opaque(0).with_passes(PassSet::of(&[Pass::DepthPrepass])),
            instances: vec![InstanceDesc::at(Mat4::from_translation(Vec3::X))],
        })
        .with_primitive(PrimitiveDesc {
            first_index: 6,
            index_count: 6,
            vertex_offset: 4,
            vertex_count: 4,
            material: Material::opaque(1),
            instances: vec![InstanceDesc::at(Mat4::from_translation(Vec3::Y))],
        })
}

fn read_commands(
    renderer: &Renderer<HeadlessBackend>,
    slot: usize,
    count: u64,
) -> Vec<DrawIndexedIndirectCommand> {
    let slot = renderer.slots().slot(slot);
    let bytes = renderer
        .allocator()
        .read(slot.draw_commands(), 0, count * DrawIndexedIndirectCommand::SIZE)
        .unwrap();
    bytemuck::pod_collect_to_vec(&bytes)
}

fn read_counts(renderer: &Renderer<HeadlessBackend>, slot: usize) -> Vec<u32> {
    let slot = renderer.slots().slot(slot);
    let bytes = renderer
        .allocator()
        .read(slot.draw_counts(), 0, slot.draw_counts().size())
        .unwrap();
    bytemuck::pod_collect_to_vec(&bytes)
}

#[test]
fn test_host_writes_never_race_the_gpu() {
    let backend = backend(HeadlessConfig {
        gpu_latency: Duration::from_millis(2),
        ..HeadlessConfig::default()
    });
    let mut renderer = renderer(&backend, &config(2));
    renderer.bind_model(&opaque_cube(1, 3)).unwrap();

    for i in 0..30 {
        renderer.camera_mut().position = Vec3::new(0.0, 0.0, 5.0 + i as f32 * 0.1);
        assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    }
    backend.wait_idle().unwrap();

    let stats = backend.stats();
    assert_eq!(stats.host_write_hazards, 0);
    assert_eq!(stats.validation_errors, 0, "{:?}", backend.validation_messages());
    assert_eq!(stats.submissions, 30);
    assert_eq!(stats.presents, 30);
    // prepass + opaque, three instances each
    assert_eq!(stats.draws_executed, 60);
    assert_eq!(stats.instances_drawn, 180);
}

#[test]
fn test_compiled_draws_match_pass_membership() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = renderer(&backend, &config(2));
    renderer.bind_model(&prepass_and_opaque_model()).unwrap();

    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    backend.wait_idle().unwrap();

    assert_eq!(read_counts(&renderer, 0), vec![2, 1, 0, 0]);
    let commands = read_commands(&renderer, 0, 3);
    assert_eq!(
        commands[0],
        DrawIndexedIndirectCommand {
            index_count: 6,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        }
    );
    assert_eq!(commands[1].first_index, 6);
    assert_eq!(commands[1].vertex_offset, 4);
    assert_eq!(commands[1].first_instance, 1);
    assert_eq!(commands[2].first_index, 6);
    assert_eq!(commands[2].first_instance, 2);

    let slot = renderer.slots().slot(0);
    let bytes = renderer
        .allocator()
        .read(slot.instances(), 0, 3 * InstanceData::SIZE as u64)
        .unwrap();
    let instances: Vec<InstanceData> = bytemuck::pod_collect_to_vec(&bytes);
    assert_eq!(instances[0].world, Mat4::from_translation(Vec3::X));
    assert_eq!(instances[1].world, Mat4::from_translation(Vec3::Y));
    assert_eq!(instances[2].world, Mat4::from_translation(Vec3::Y));
    assert_eq!(
        instances.iter().map(|i| i.material_index).collect::<Vec<_>>(),
        vec![0, 1, 1]
    );

    let bytes = renderer
        .allocator()
        .read(slot.uniforms(), 0, FrameUniforms::SIZE as u64)
        .unwrap();
    let uniforms: FrameUniforms = bytemuck::pod_read_unaligned(&bytes);
    assert_eq!(uniforms.frame_index, 0);
    assert_eq!(uniforms.camera_position, renderer.camera().position);

    assert_eq!(backend.stats().draws_executed, 3);
}

#[test]
fn test_draws_past_capacity_are_dropped() {
    let backend = backend(HeadlessConfig::default());
    let config = RendererConfig {
        max_draws: 3,
        ..config(2)
    };
    let mut renderer = renderer(&backend, &config);
    let opaque_only = Material::opaque(0).with_passes(PassSet::of(&[Pass::Opaque]));
    for id in 0..5 {
        renderer
            .bind_model(&ModelData::cube(
                ModelId(id),
                opaque_only.clone(),
                vec![InstanceDesc::default()],
            ))
            .unwrap();
    }

    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    backend.wait_idle().unwrap();

    let report = renderer.stats().last_compile.clone().unwrap();
    assert_eq!(report.requested_draws, 5);
    assert_eq!(report.draws_written, 3);
    assert_eq!(report.dropped_draws, 2);
    assert!(matches!(
        report.check(),
        Err(RendererError::CapacityExceeded {
            what: "indirect draws",
            requested: 5,
            capacity: 3,
        })
    ));
    assert_eq!(renderer.stats().truncated_frames, 1);

    let stats = backend.stats();
    assert_eq!(stats.draws_executed, 3);
    assert_eq!(stats.validation_errors, 0);
}

#[test]
fn test_full_command_buffer_still_draws_color() {
    let backend = backend(HeadlessConfig::default());
    let config = RendererConfig {
        max_draws: 4,
        ..config(2)
    };
    let mut renderer = renderer(&backend, &config);
    for id in 0..4 {
        renderer.bind_model(&opaque_cube(id, 1)).unwrap();
    }

    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    backend.wait_idle().unwrap();

    // every cube asked for a prepass and an opaque draw; the opaque ones win
    assert_eq!(read_counts(&renderer, 0), vec![0, 4, 0, 0]);
    let report = renderer.stats().last_compile.clone().unwrap();
    assert_eq!(report.dropped_draws, 4);
    assert_eq!(backend.stats().draws_executed, 4);
}

#[test]
fn test_pass_regions_are_contiguous_and_ordered() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = renderer(&backend, &config(3));
    renderer.bind_model(&opaque_cube(1, 2)).unwrap();
    renderer
        .bind_model(&ModelData::quad(
            ModelId(2),
            Material::transparent(2),
            vec![InstanceDesc::default(); 2],
        ))
        .unwrap();
    renderer
        .bind_model(&ModelData::cube(
            ModelId(3),
            Material::new(AlphaMode::Opaque, true, 3),
            vec![InstanceDesc::default()],
        ))
        .unwrap();

    for _ in 0..4 {
        renderer.draw_frame().unwrap();
        let report = renderer.stats().last_compile.clone().unwrap();
        assert_eq!(report.draw_counts(), [2, 1, 1, 1]);
        let mut expected_offset = 0;
        for range in report.pass_ranges {
            assert_eq!(range.offset, expected_offset);
            expected_offset = range.end();
        }
    }
    backend.wait_idle().unwrap();
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_repeated_out_of_date_recreates_without_leaking() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = renderer(&backend, &config(2));
    renderer.bind_model(&opaque_cube(1, 1)).unwrap();

    backend.inject_acquire_out_of_date(2);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Skipped);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Skipped);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);

    assert_eq!(renderer.stats().swapchain_recreations, 2);
    assert_eq!(renderer.stats().frames_skipped, 2);
    assert_eq!(renderer.frame_index(), 1);

    let stats = backend.stats();
    assert_eq!(stats.live_swapchains, 1);
    assert_eq!(stats.live_image_views, 3);
    assert_eq!(stats.live_pipelines, 4);
    assert_eq!(stats.presents, 1);
    assert_eq!(stats.validation_errors, 0, "{:?}", backend.validation_messages());
}

#[test]
fn test_out_of_date_present_recreates_after_the_frame() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = renderer(&backend, &config(2));
    renderer.bind_model(&opaque_cube(1, 1)).unwrap();

    backend.inject_present(PresentOutcome::OutOfDate, 1);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    assert_eq!(renderer.stats().swapchain_recreations, 1);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);

    backend.wait_idle().unwrap();
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_resize_recreates_before_acquire() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = renderer(&backend, &config(2));
    renderer.bind_model(&opaque_cube(1, 1)).unwrap();
    renderer.draw_frame().unwrap();

    backend.set_surface_extent(Extent2D::new(1024, 768));
    renderer.resize(1024, 768);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    assert_eq!(renderer.extent(), Extent2D::new(1024, 768));
    assert_eq!(renderer.stats().swapchain_recreations, 1);

    backend.wait_idle().unwrap();
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_zero_sized_surface_skips_frames() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = renderer(&backend, &config(2));
    renderer.bind_model(&opaque_cube(1, 1)).unwrap();
    renderer.draw_frame().unwrap();

    renderer.resize(0, 0);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Skipped);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Skipped);
    assert_eq!(backend.stats().presents, 1);
    assert_eq!(renderer.stats().swapchain_recreations, 0);

    renderer.resize(800, 600);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    assert_eq!(backend.stats().presents, 2);
}

#[test]
fn test_every_slot_is_reused_across_frames() {
    let frames_in_flight = 3;
    let backend = backend(HeadlessConfig {
        gpu_latency: Duration::from_millis(1),
        ..HeadlessConfig::default()
    });
    let mut renderer = renderer(&backend, &config(frames_in_flight));

    let indices = vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 7, 8, 9];
    let model = ModelData::new(ModelId(1), vec![Vertex::default(); 10], indices).with_primitive(
        PrimitiveDesc {
            first_index: 0,
            index_count: 12,
            vertex_offset: 0,
            vertex_count: 10,
            material: Material::opaque(0),
            instances: vec![InstanceDesc::default(); 2],
        },
    );
    renderer.bind_model(&model).unwrap();

    for frame in 0..2 * frames_in_flight {
        assert_eq!(renderer.current_slot(), frame % frames_in_flight);
        assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    }
    assert_eq!(renderer.frame_index(), 6);
    backend.wait_idle().unwrap();

    let stats = backend.stats();
    assert_eq!(stats.submissions, 6);
    assert_eq!(stats.draws_executed, 12);
    assert_eq!(stats.instances_drawn, 24);
    assert_eq!(stats.validation_errors, 0, "{:?}", backend.validation_messages());
}

#[test]
fn test_models_bound_mid_run_are_drawn() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = renderer(&backend, &config(2));
    let first = renderer.bind_model(&opaque_cube(1, 1)).unwrap();
    renderer.draw_frame().unwrap();

    renderer.bind_model(&opaque_cube(2, 1)).unwrap();
    // the slot after the first frame may have compiled before the bind
    renderer.draw_frame().unwrap();
    renderer.draw_frame().unwrap();
    assert_eq!(
        renderer.stats().last_compile.as_ref().unwrap().draw_counts(),
        [2, 2, 0, 0]
    );

    renderer.unbind_model(first).unwrap();
    renderer.draw_frame().unwrap();
    renderer.draw_frame().unwrap();
    assert_eq!(
        renderer.stats().last_compile.as_ref().unwrap().draw_counts(),
        [1, 1, 0, 0]
    );
    assert!(matches!(
        renderer.unbind_model(first),
        Err(RendererError::NotBound(_))
    ));
}

#[test]
fn test_frustum_culling_limits_drawn_instances() {
    let backend = backend(HeadlessConfig::default());
    let mut renderer = Renderer::with_visibility(
        Arc::clone(&backend),
        &config(2),
        EXTENT,
        Box::new(FrustumCuller::new()),
    )
    .unwrap();
    renderer
        .bind_model(&ModelData::cube(
            ModelId(1),
            Material::opaque(0).with_passes(PassSet::of(&[Pass::Opaque])),
            vec![
                InstanceDesc::at(Mat4::IDENTITY),
                InstanceDesc::at(Mat4::from_translation(Vec3::new(0.0, 0.0, 50.0))),
            ],
        ))
        .unwrap();

    renderer.draw_frame().unwrap();
    backend.wait_idle().unwrap();
    assert_eq!(backend.stats().instances_drawn, 1);
}

#[test]
fn test_hung_gpu_reports_submission_timeout() {
    let backend = backend(HeadlessConfig::default());
    let config = RendererConfig {
        fence_timeout_ms: 50,
        ..config(2)
    };
    let mut renderer = renderer(&backend, &config);
    renderer.bind_model(&opaque_cube(1, 1)).unwrap();

    backend.stall();
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    assert_eq!(renderer.draw_frame().unwrap(), FrameStatus::Presented);
    let err = renderer.draw_frame().unwrap_err();
    assert!(matches!(err, RendererError::SubmissionTimeout { slot: 0, .. }));

    backend.resume();
    drop(renderer);
    assert_eq!(backend.stats().live_buffers, 0);
}

#[test]
fn test_exhausted_memory_budget_fails_creation() {
    let backend = backend(HeadlessConfig {
        memory_budget: Some(1024),
        ..HeadlessConfig::default()
    });
    let err = Renderer::new(Arc::clone(&backend), &config(2), EXTENT)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RendererError::AllocationFailure { ref label, size } if label == "scene vertices" && size == 4096 * 32
    ));
    assert_eq!(backend.stats().live_buffers, 0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let backend = backend(HeadlessConfig::default());
    let err = Renderer::new(Arc::clone(&backend), &config(0), EXTENT)
        .err()
        .unwrap();
    assert!(matches!(err, RendererError::Config(_)));

    let err = Renderer::new(Arc::clone(&backend), &config(2), Extent2D::new(0, 600))
        .err()
        .unwrap();
    assert!(matches!(err, RendererError::InvalidUsage(_)));
}

#[test]
fn test_drop_releases_every_resource() {
    let backend = backend(HeadlessConfig {
        gpu_latency: Duration::from_millis(1),
        ..HeadlessConfig::default()
    });
    let mut renderer = renderer(&backend, &config(2));
    let tracker = renderer.allocator().tracker().clone();
    let handle = renderer.bind_model(&opaque_cube(1, 4)).unwrap();
    for _ in 0..5 {
        renderer.draw_frame().unwrap();
    }
    renderer.unbind_model(handle).unwrap();
    renderer.draw_frame().unwrap();
    drop(renderer);

    tracker.assert_no_leaks().unwrap();
    let stats = backend.stats();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.live_swapchains, 0);
    assert_eq!(stats.live_image_views, 0);
    assert_eq!(stats.live_pipelines, 0);
    assert_eq!(stats.validation_errors, 0, "{:?}", backend.validation_messages());
}
