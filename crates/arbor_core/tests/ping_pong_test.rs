//! Integration test: double-buffered interop arrays driven the way a
//! physics loop drives them, with the writer on another thread.

use arbor_core::{
    handoff_slot, AllocOptions, DeviceBackend, DeviceContext, DeviceHostArray, DeviceId,
    Direction, EmulatedDevice, LocalGroup, MemoryTracker, ProcessGroup,
};
use arbor_shared::Real4;
use std::sync::Arc;
use std::thread;

fn setup(devices: u32) -> (Arc<EmulatedDevice>, DeviceContext) {
    let device = Arc::new(EmulatedDevice::new(devices));
    let backend: Arc<dyn DeviceBackend> = device.clone();
    let ctx = DeviceContext::new(backend, DeviceId(0)).with_tracker(MemoryTracker::new());
    (device, ctx)
}

#[test]
fn test_ping_pong_steps_keep_both_buffers() {
    let (device, ctx) = setup(1);
    let mut positions = DeviceHostArray::<Real4>::new(ctx);
    positions
        .alloc(64, AllocOptions::PLAIN.interop(true).double_buffer(true))
        .unwrap();

    for step in 0..4u8 {
        for p in positions.host_mut() {
            *p = Real4::position(f32::from(step), 0.0, 0.0, 1.0);
        }
        positions.copy(Direction::HostToDevice, 0, 0).unwrap();
        positions.swap();
    }

    // After an even number of swaps the read slot is the first buffer again,
    // which last received step 2.
    positions.copy(Direction::DeviceToHost, 0, 0).unwrap();
    assert!(positions.host().iter().all(|p| p.x == 2.0));

    positions.swap();
    positions.copy(Direction::DeviceToHost, 0, 0).unwrap();
    assert!(positions.host().iter().all(|p| p.x == 3.0));

    drop(positions);
    assert_eq!(device.live_graphics_buffers(), 0);
    assert_eq!(device.used_bytes(), 0);
}

#[test]
fn test_tracker_sees_every_rank() {
    let tracker = MemoryTracker::new();
    let device = Arc::new(EmulatedDevice::new(1));

    let handles: Vec<_> = LocalGroup::create(3)
        .into_iter()
        .map(|group| {
            let backend: Arc<dyn DeviceBackend> = device.clone();
            let ctx = DeviceContext::new(backend, DeviceId(0)).with_tracker(tracker.clone());
            thread::spawn(move || {
                let mut ids = DeviceHostArray::<u64>::new(ctx);
                ids.alloc(100, AllocOptions::PLAIN).unwrap();
                group.barrier().unwrap();
                let total = group.all_reduce_sum_u64(ids.size() as u64).unwrap();
                group.barrier().unwrap();
                total
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 300);
    }
    let usage = tracker.usage();
    assert_eq!(usage.device_peak, 3 * 800);
    assert_eq!(usage.device_bytes, 0);
}

#[test]
fn test_snapshot_handoff_from_array() {
    let (_device, ctx) = setup(1);
    let mut velocities = DeviceHostArray::<Real4>::new(ctx);
    velocities.alloc(8, AllocOptions::PLAIN).unwrap();
    velocities.host_mut()[3] = Real4::velocity(1.0, 2.0, 3.0);
    velocities.upload().unwrap();

    let (producer, consumer) = handoff_slot::<Vec<Real4>>();
    let writer = thread::spawn(move || {
        let staged = consumer.take().unwrap();
        staged[3]
    });

    velocities.download().unwrap();
    producer.stage(velocities.host().to_vec()).unwrap();
    // The physics side owns its buffers again immediately.
    velocities.host_mut().fill(Real4::ZERO);

    assert_eq!(writer.join().unwrap(), Real4::velocity(1.0, 2.0, 3.0));
}
