//! Entry Barrier Benchmarks
//!
//! Measures the inline check model and guard patching.
//! Run with: `cargo bench --package entry-barrier`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use entry_barrier::{
    codec_for, Arch, Backend, BarrierConfig, BarrierStateService, CodeBuffer, CodeCache,
    CompiledMethod, EmitContext, PatchingEpoch, PatchingType, ALL_BITS,
};
use std::sync::Arc;

fn setup(arch: Arch, patching: PatchingType) -> (BarrierStateService, CodeCache, Arc<CompiledMethod>) {
    let config = BarrierConfig {
        patching_type: Some(patching),
        verify_barriers: false,
        ..Default::default()
    };
    let service = BarrierStateService::with_codec(
        config,
        codec_for(arch, Some(patching)),
        Arc::new(PatchingEpoch::new()),
    )
    .unwrap();
    let cache = CodeCache::new(64 * 1024).unwrap();

    let ctx = EmitContext::new(service.epoch(), 0x1000);
    let mut buf = CodeBuffer::new(Backend::Optimizing);
    let stub = service.codec().emit_entry_barrier(&mut buf, &ctx).unwrap();
    buf.emit_u32(0);
    if let Some(stub) = stub {
        service.codec().emit_entry_stub(&mut buf, stub, &ctx).unwrap();
    }
    let cm = cache.install("bench", &buf).unwrap();
    (service, cache, cm)
}

fn bench_entry_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_check");

    for patching in [
        PatchingType::StwInstructionAndData,
        PatchingType::ConcInstructionAndData,
        PatchingType::ConcData,
    ] {
        let (service, _cache, cm) = setup(Arch::X86_64, patching);
        let thread = service.attach_thread();
        service.disarm(&cm);
        thread.observe_epoch(service.epoch().current());

        group.bench_function(patching.name(), |b| {
            b.iter(|| black_box(service.entry_check(black_box(&cm), &thread)))
        });
    }

    group.finish();
}

fn bench_patch(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch");

    for arch in [Arch::X86_64, Arch::AArch64] {
        let (service, _cache, cm) = setup(arch, PatchingType::ConcData);

        group.bench_function(format!("{}_full", arch.name()), |b| {
            let mut value = 1u32;
            b.iter(|| {
                value = value % 0x7fff_0000 + 1;
                black_box(service.set_guard_value(&cm, value, ALL_BITS))
            })
        });

        group.bench_function(format!("{}_masked", arch.name()), |b| {
            let mut value = 0u32;
            b.iter(|| {
                value ^= 0x1;
                black_box(service.set_guard_value(&cm, value, 0x1))
            })
        });
    }

    group.finish();
}

fn bench_arm_disarm(c: &mut Criterion) {
    let (service, _cache, cm) = setup(Arch::X86_64, PatchingType::ConcInstructionAndData);

    c.bench_function("arm_disarm_cycle", |b| {
        b.iter(|| {
            service.arm(&cm);
            service.disarm(&cm);
        })
    });
}

criterion_group!(benches, bench_entry_check, bench_patch, bench_arm_disarm);
criterion_main!(benches);
