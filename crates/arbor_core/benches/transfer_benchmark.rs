//! # Host/Device Transfer Benchmark
//!
//! Measures what the physics loop pays per step for:
//! 1. Full-array uploads and downloads (plain and interop)
//! 2. Staging a snapshot into the handoff slot with an idle writer

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use arbor_core::{
    handoff_slot, AllocOptions, DeviceBackend, DeviceContext, DeviceHostArray, DeviceId,
    EmulatedDevice,
};
use arbor_shared::Real4;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const BODY_COUNT: usize = 1 << 20;

fn context() -> DeviceContext {
    let backend: Arc<dyn DeviceBackend> = Arc::new(EmulatedDevice::new(1));
    DeviceContext::new(backend, DeviceId(0))
}

fn filled(options: AllocOptions) -> DeviceHostArray<Real4> {
    let mut array = DeviceHostArray::new(context());
    array
        .alloc(BODY_COUNT, options)
        .expect("benchmark allocation");
    for (i, p) in array.host_mut().iter_mut().enumerate() {
        *p = Real4::position(i as f32, 0.5, -0.5, 1.0 / BODY_COUNT as f32);
    }
    array
}

fn bench_plain_roundtrip(c: &mut Criterion) {
    let mut array = filled(AllocOptions::PLAIN);
    c.bench_function("plain_upload_download_1M", |b| {
        b.iter(|| {
            array.upload().expect("upload");
            array.download().expect("download");
            black_box(array.host()[BODY_COUNT - 1])
        });
    });
}

fn bench_interop_roundtrip(c: &mut Criterion) {
    let mut array = filled(AllocOptions::PLAIN.interop(true));
    c.bench_function("interop_upload_download_1M", |b| {
        b.iter(|| {
            array.upload().expect("upload");
            array.download().expect("download");
            black_box(array.host()[0])
        });
    });
}

fn bench_handoff(c: &mut Criterion) {
    let (producer, consumer) = handoff_slot::<Vec<Real4>>();
    let writer = thread::spawn(move || {
        while let Ok(staged) = consumer.take() {
            black_box(staged.len());
        }
    });

    let array = filled(AllocOptions::PLAIN);
    c.bench_function("stage_snapshot_1M", |b| {
        b.iter(|| {
            producer.stage(array.host().to_vec()).expect("stage");
        });
    });

    drop(producer);
    writer.join().expect("writer thread");
}

criterion_group!(
    benches,
    bench_plain_roundtrip,
    bench_interop_roundtrip,
    bench_handoff
);
criterion_main!(benches);
