//! Frame loop behavior against the in-memory device and surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use ash::vk::{self, Handle};
use glam::Mat4;
use parking_lot::Mutex;

use inflight_core::RendererConfig;
use inflight_renderer::{
    DrawContext, FrameLoop, FrameOutcome, RenderObject, RendererError, SlotState, record_draws,
};
use inflight_rhi::device::{GraphicsDevice, SurfaceStatus};
use inflight_rhi::dummy::{DeviceCall, DummyDevice, DummySurface};
use inflight_rhi::pipeline::{PipelineConfig, ShaderStage};

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 640,
    height: 480,
};

fn config(frames_in_flight: usize) -> RendererConfig {
    RendererConfig {
        frames_in_flight,
        ..RendererConfig::default()
    }
}

fn frame_loop(device: &Arc<DummyDevice>, frames_in_flight: usize) -> Result<FrameLoop> {
    let _ = inflight_core::try_init_logging();
    Ok(FrameLoop::new(device.clone(), config(frames_in_flight))?)
}

fn pipeline_config(name: &str) -> PipelineConfig {
    PipelineConfig::new(
        name,
        ShaderStage::new(vk::ShaderModule::from_raw(1)),
        ShaderStage::new(vk::ShaderModule::from_raw(2)),
        vk::Format::B8G8R8A8_SRGB,
    )
}

fn count(device: &DummyDevice, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
    device.count_calls(predicate)
}

fn is_submit(call: &DeviceCall) -> bool {
    matches!(call, DeviceCall::Submit { .. })
}

#[test]
fn test_slot_zero_cleanup_runs_on_its_next_turns() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);

    let fence = frames.ring().slot(0).unwrap().completion_fence().handle();
    let flushed = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..5 {
        frames.render_frame(&mut surface, |ctx| {
            if ctx.slot_index() == 0 {
                let flushed = flushed.clone();
                let device = device.clone();
                let frame = ctx.frame_number();
                ctx.defer(move || {
                    let signaled = device.fence_signaled(fence).unwrap();
                    flushed.lock().push((frame, signaled));
                });
            }
            Ok(())
        })?;
    }

    // Deferred in frames 0 and 2, flushed when frames 2 and 4 reused slot 0.
    assert_eq!(*flushed.lock(), vec![(0, true), (2, true)]);
    assert_eq!(frames.ring().frame_counter(), 5);
    assert_eq!(surface.present_count(), 5);

    frames.shutdown()?;
    assert_eq!(flushed.lock().len(), 3);
    Ok(())
}

#[test]
fn test_out_of_date_acquire_skips_frame_without_advancing() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);
    surface.script_acquire(SurfaceStatus::OutOfDate);

    let recorded = AtomicUsize::new(0);
    let outcome = frames.render_frame(&mut surface, |_| {
        recorded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })?;

    assert_eq!(outcome, FrameOutcome::SurfaceRecreated);
    assert_eq!(recorded.load(Ordering::SeqCst), 0);
    assert_eq!(count(&device, is_submit), 0);
    assert_eq!(surface.present_count(), 0);
    assert_eq!(surface.recreate_count(), 1);

    // The counter does not advance and the slot is reusable immediately.
    assert_eq!(frames.ring().frame_counter(), 0);
    let slot = frames.ring().current();
    assert_eq!(slot.index(), 0);
    assert_eq!(slot.state(), SlotState::Idle);
    assert!(slot.completion_fence().is_signaled());

    let outcome = frames.render_frame(&mut surface, |_| Ok(()))?;
    assert!(matches!(outcome, FrameOutcome::Presented { recreated: false, .. }));
    assert_eq!(frames.ring().frame_counter(), 1);
    assert_eq!(count(&device, is_submit), 1);
    Ok(())
}

#[test]
fn test_slot_reset_always_follows_fence_wait() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(2, EXTENT);

    for _ in 0..6 {
        frames.render_frame(&mut surface, |_| Ok(()))?;
    }

    let calls = device.calls();
    for index in 0..2 {
        let slot = frames.ring().slot(index).unwrap();
        let fence = slot.completion_fence().handle();
        let pool = slot.command_pool().handle();

        let mut waited_since_submit = true;
        let mut resets = 0;
        for call in &calls {
            match call {
                DeviceCall::Submit { fence: f, .. } if *f == fence => waited_since_submit = false,
                DeviceCall::WaitFence(f) if *f == fence => waited_since_submit = true,
                DeviceCall::ResetCommandPool(p) if *p == pool => {
                    assert!(waited_since_submit, "slot {index} reset before its fence wait");
                    resets += 1;
                }
                _ => {}
            }
        }
        assert_eq!(resets, 3);
    }
    Ok(())
}

#[test]
fn test_fence_timeout_is_device_lost_and_stops_the_loop() -> Result<()> {
    let device = Arc::new(DummyDevice::with_manual_fences());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);
    let runs = Arc::new(AtomicUsize::new(0));

    let pool = frames.ring().slot(0).unwrap().command_pool().handle();
    frames.render_frame(&mut surface, |ctx| {
        let runs = runs.clone();
        ctx.defer(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    })?;
    frames.render_frame(&mut surface, |_| Ok(()))?;

    let resets_before = count(&device, |c| *c == DeviceCall::ResetCommandPool(pool));
    let err = frames.render_frame(&mut surface, |_| Ok(())).unwrap_err();
    assert!(matches!(err, RendererError::DeviceLost { slot: 0, .. }));
    assert!(frames.has_failed());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        count(&device, |c| *c == DeviceCall::ResetCommandPool(pool)),
        resets_before
    );
    assert_eq!(frames.ring().frame_counter(), 2);

    let err = frames.render_frame(&mut surface, |_| Ok(())).unwrap_err();
    assert!(matches!(err, RendererError::InvalidState(_)));
    assert_eq!(surface.acquire_count(), 2);

    // Once the work retires, shutdown still releases the deferred action.
    device.complete_submissions();
    frames.shutdown()?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_deferred_cleanup_runs_once_after_its_fence() -> Result<()> {
    let device = Arc::new(DummyDevice::with_manual_fences());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);
    let fence = frames.ring().slot(0).unwrap().completion_fence().handle();
    let runs = Arc::new(Mutex::new(Vec::new()));

    frames.render_frame(&mut surface, |ctx| {
        let runs = runs.clone();
        let device = device.clone();
        ctx.defer(move || runs.lock().push(device.fence_signaled(fence).unwrap()));
        Ok(())
    })?;

    device.complete_submissions();
    frames.render_frame(&mut surface, |_| Ok(()))?;
    assert!(runs.lock().is_empty());

    for _ in 0..5 {
        device.complete_submissions();
        frames.render_frame(&mut surface, |_| Ok(()))?;
    }
    assert_eq!(*runs.lock(), vec![true]);

    device.complete_submissions();
    frames.shutdown()?;
    assert_eq!(*runs.lock(), vec![true]);
    Ok(())
}

#[test]
fn test_stale_present_recreates_after_advancing() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);
    surface.script_present(SurfaceStatus::Suboptimal);

    let outcome = frames.render_frame(&mut surface, |_| Ok(()))?;
    assert_eq!(
        outcome,
        FrameOutcome::Presented {
            image_index: 0,
            recreated: true
        }
    );
    assert_eq!(surface.present_count(), 1);
    assert_eq!(surface.recreate_count(), 1);
    assert_eq!(frames.ring().frame_counter(), 1);

    // Recreation drained the ring before touching the surface.
    let calls = device.calls();
    let submit = calls.iter().position(is_submit).unwrap();
    let idle = calls.iter().position(|c| *c == DeviceCall::WaitIdle).unwrap();
    assert!(submit < idle);
    assert_eq!(frames.ring().slot(0).unwrap().state(), SlotState::Idle);
    Ok(())
}

#[test]
fn test_suboptimal_acquire_still_renders() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);
    surface.script_acquire(SurfaceStatus::Suboptimal);

    let outcome = frames.render_frame(&mut surface, |_| Ok(()))?;
    assert!(matches!(outcome, FrameOutcome::Presented { recreated: true, .. }));
    assert_eq!(count(&device, is_submit), 1);
    assert_eq!(surface.recreate_count(), 1);
    Ok(())
}

#[test]
fn test_frame_records_target_transitions_around_rendering() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);

    device.clear_calls();
    frames.render_frame(&mut surface, |_| Ok(()))?;

    let recorded: Vec<&str> = device
        .calls()
        .iter()
        .filter_map(|call| match call {
            DeviceCall::Record { command, .. } => Some(*command),
            _ => None,
        })
        .collect();
    assert_eq!(
        recorded,
        vec![
            "transition_image",
            "begin_rendering",
            "set_viewport_scissor",
            "end_rendering",
            "transition_image",
        ]
    );
    Ok(())
}

#[test]
fn test_uniform_upload_is_released_with_its_slot() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);
    let layout = vk::DescriptorSetLayout::null();

    frames.render_frame(&mut surface, |ctx| {
        ctx.upload_uniform(&[1.0f32, 2.0, 3.0, 4.0], layout)?;
        Ok(())
    })?;
    assert_eq!(device.live_buffers(), 1);
    assert_eq!(
        count(&device, |c| matches!(c, DeviceCall::UpdateDescriptorSet { writes: 1, .. })),
        1
    );

    frames.render_frame(&mut surface, |_| Ok(()))?;
    assert_eq!(device.live_buffers(), 1);

    frames.render_frame(&mut surface, |_| Ok(()))?;
    assert_eq!(device.live_buffers(), 0);
    Ok(())
}

#[test]
fn test_draws_bind_pipelines_and_sets() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);

    let _ = frames.pipelines_mut().build(pipeline_config("opaque"))?;
    let _ = frames
        .pipelines_mut()
        .build(pipeline_config("transparent").blend(true))?;

    let object = |pipeline: &str| RenderObject {
        index_count: 36,
        first_index: 0,
        index_buffer: vk::Buffer::from_raw(0xb0),
        pipeline: pipeline.to_string(),
        material_set: vk::DescriptorSet::from_raw(0xd0),
        transform: Mat4::IDENTITY,
        vertex_buffer_address: 0x1000,
    };
    let mut draws = DrawContext::new();
    draws.opaque.push(object("opaque"));
    draws.opaque.push(object("opaque"));
    draws.transparent.push(object("transparent"));

    device.clear_calls();
    let mut issued = 0;
    frames.render_frame(&mut surface, |ctx| {
        let scene = ctx.upload_uniform(&Mat4::IDENTITY, vk::DescriptorSetLayout::null())?;
        issued = record_draws(ctx, &draws, scene)?;
        Ok(())
    })?;

    let records = |name: &'static str| {
        count(&device, move |c| {
            matches!(c, DeviceCall::Record { command, .. } if *command == name)
        })
    };
    assert_eq!(issued, 3);
    assert_eq!(records("draw_indexed"), 3);
    assert_eq!(records("push_constants"), 3);
    assert_eq!(records("bind_pipeline"), 2);
    // Scene set once per pipeline, material set once per object.
    assert_eq!(records("bind_descriptor_sets"), 5);
    Ok(())
}

#[test]
fn test_failed_recording_stops_the_loop() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);

    let mut draws = DrawContext::new();
    draws.opaque.push(RenderObject {
        index_count: 3,
        first_index: 0,
        index_buffer: vk::Buffer::from_raw(0xb0),
        pipeline: "missing".into(),
        material_set: vk::DescriptorSet::null(),
        transform: Mat4::IDENTITY,
        vertex_buffer_address: 0,
    });

    let err = frames
        .render_frame(&mut surface, |ctx| {
            record_draws(ctx, &draws, vk::DescriptorSet::null())?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, RendererError::PipelineNotFound(ref name) if name == "missing"));
    assert!(frames.has_failed());
    assert_eq!(count(&device, is_submit), 0);
    assert_eq!(surface.present_count(), 0);
    assert_eq!(frames.ring().frame_counter(), 0);

    // The acquire semaphore still has a pending signal, so no new acquire
    // may be issued with it.
    let err = frames.render_frame(&mut surface, |_| Ok(())).unwrap_err();
    assert!(matches!(err, RendererError::InvalidState(_)));
    assert_eq!(surface.acquire_count(), 1);
    assert_eq!(count(&device, is_submit), 0);

    frames.shutdown()?;
    drop(frames);
    assert_eq!(device.live_handles(), 0);
    Ok(())
}

#[test]
fn test_submit_failure_is_fatal() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);

    device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
    let err = frames.render_frame(&mut surface, |_| Ok(())).unwrap_err();
    assert!(matches!(err, RendererError::Rhi(_)));
    assert_eq!(surface.present_count(), 0);

    let err = frames.render_frame(&mut surface, |_| Ok(())).unwrap_err();
    assert!(matches!(err, RendererError::InvalidState(_)));
    assert_eq!(count(&device, is_submit), 1);
    Ok(())
}

#[test]
fn test_shared_cleanup_runs_between_frame_cleanup_and_pipelines() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 2)?;
    let mut surface = DummySurface::new(3, EXTENT);
    let _ = frames.pipelines_mut().build(pipeline_config("opaque"))?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let destroyed_pipelines = |device: &DummyDevice| {
        count(device, |c| matches!(c, DeviceCall::DestroyPipeline(_)))
    };

    // Registered before any frame, still runs after every slot is drained.
    {
        let order = order.clone();
        let device = device.clone();
        frames.defer_shutdown(move || {
            order.lock().push(("shared", destroyed_pipelines(&device)));
        });
    }
    frames.render_frame(&mut surface, |ctx| {
        let order = order.clone();
        let device = device.clone();
        ctx.defer(move || order.lock().push(("frame", destroyed_pipelines(&device))));
        Ok(())
    })?;
    assert!(order.lock().is_empty());

    frames.shutdown()?;
    assert_eq!(*order.lock(), vec![("frame", 0), ("shared", 0)]);
    assert_eq!(destroyed_pipelines(&device), 1);

    // A second shutdown does not run anything again.
    frames.shutdown()?;
    assert_eq!(order.lock().len(), 2);
    Ok(())
}

#[test]
fn test_shutdown_releases_everything() -> Result<()> {
    let device = Arc::new(DummyDevice::new());
    let mut frames = frame_loop(&device, 3)?;
    let mut surface = DummySurface::new(3, EXTENT);
    let _ = frames.pipelines_mut().build(pipeline_config("opaque"))?;

    for _ in 0..4 {
        frames.render_frame(&mut surface, |ctx| {
            ctx.upload_uniform(&Mat4::IDENTITY, vk::DescriptorSetLayout::null())?;
            Ok(())
        })?;
    }

    frames.shutdown()?;
    assert_eq!(device.live_buffers(), 0);
    assert!(frames.pipelines().is_empty());

    let err = frames.render_frame(&mut surface, |_| Ok(())).unwrap_err();
    assert!(matches!(err, RendererError::InvalidState(_)));

    drop(frames);
    assert_eq!(device.live_handles(), 0);
    assert_eq!(device.double_destroys(), 0);
    Ok(())
}
