//! Codec Tests - locate, verify and patch on every instruction set
//!
//! Every codec is a pure byte encoder, so all three run on any host.

mod common;

use common::{all_codec_configs, corrupt_barrier, BarrierFixture};
use entry_barrier::{
    Arch, Backend, BarrierConfig, BarrierError, PatchingType, ALL_BITS, NOT_ENTRANT,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const BACKENDS: [Backend; 3] = [Backend::Fast, Backend::Optimizing, Backend::External];

/// Emitted templates verify for every strategy and backend
#[test]
fn test_emitted_templates_verify() {
    for (arch, patching) in all_codec_configs() {
        let fixture = BarrierFixture::with(arch, patching);
        let codec = fixture.service().codec();

        for backend in BACKENDS {
            let cm = fixture.install("verify", backend);
            codec
                .verify(&cm)
                .unwrap_or_else(|e| panic!("{:?}/{}/{:?}: {}", arch, patching, backend, e));

            let site = codec.locate(&cm).unwrap();
            assert_eq!(site.guard % 4, 0);
            assert!(cm.contains(site.guard));
            if backend != Backend::External {
                let expected = cm.code_begin() as isize
                    + cm.frame_complete_offset() as isize
                    + codec.entry_barrier_offset(&cm);
                assert_eq!(site.instruction as isize, expected);
            }
        }
    }
}

/// Barrier length grows with the fencing the strategy needs
#[test]
fn test_offsets_follow_patching_type() {
    for arch in [Arch::AArch64, Arch::RiscV64] {
        let offsets: Vec<isize> = [
            PatchingType::StwInstructionAndData,
            PatchingType::ConcData,
            PatchingType::ConcInstructionAndData,
        ]
        .into_iter()
        .map(|patching| {
            let fixture = BarrierFixture::with(arch, patching);
            let cm = fixture.install("offset", Backend::Optimizing);
            fixture.service().codec().entry_barrier_offset(&cm)
        })
        .collect();

        assert!(offsets[0] > offsets[1], "{:?}: {:?}", arch, offsets);
        assert!(offsets[1] > offsets[2], "{:?}: {:?}", arch, offsets);
    }
}

/// Corrupted first instruction is an encoding mismatch
#[test]
fn test_corrupted_barrier_fails_verification() {
    for (arch, patching) in all_codec_configs() {
        let fixture = BarrierFixture::with(arch, patching);
        let cm = fixture.install("corrupt", Backend::Fast);
        corrupt_barrier(&fixture, &cm);

        let err = fixture.service().verify(&cm).unwrap_err();
        assert!(
            matches!(err, BarrierError::EncodingMismatch { .. }),
            "{:?}: {}",
            arch,
            err
        );
        assert!(err.is_fatal());
    }
}

/// With verification on, touching a corrupted barrier aborts
#[test]
#[should_panic(expected = "verifying entry barrier")]
fn test_verification_failure_is_fatal() {
    let fixture = BarrierFixture::with(Arch::AArch64, PatchingType::ConcInstructionAndData);
    let cm = fixture.install("fatal", Backend::Fast);
    corrupt_barrier(&fixture, &cm);

    fixture.service().arm(&cm);
}

/// Production configuration skips the check on the hot path
#[test]
fn test_unverified_locate_tolerates_corruption() {
    let fixture = BarrierFixture::with_config(
        Arch::X86_64,
        BarrierConfig {
            verify_barriers: false,
            wrong_method_stub: common::WRONG_METHOD_STUB,
            ..Default::default()
        },
    );
    let cm = fixture.install("unverified", Backend::Fast);
    corrupt_barrier(&fixture, &cm);

    fixture.service().disarm(&cm);
    assert!(!fixture.service().is_armed(&cm));
}

/// Randomized masked updates touch only the selected bits
#[test]
fn test_masked_update_preserves_untouched_bits() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for arch in [Arch::X86_64, Arch::AArch64, Arch::RiscV64] {
        let fixture = BarrierFixture::with(arch, PatchingType::ConcData);
        let service = fixture.service();
        let cm = fixture.install("masked", Backend::Optimizing);

        for _ in 0..500 {
            let old = rng.gen::<u32>() & !NOT_ENTRANT;
            let mask = match rng.gen::<u32>() & !NOT_ENTRANT {
                0 => 1,
                mask => mask,
            };
            let value = rng.gen::<u32>() & mask;

            service.set_guard_value(&cm, old, ALL_BITS);
            assert_eq!(service.guard_value(&cm), old);

            let outcome = service.set_guard_value(&cm, value, mask);
            let now = service.guard_value(&cm);
            assert_eq!(now, outcome.current);
            assert_eq!(now & !mask, old & !mask, "mask {:#x}", mask);
            assert_eq!(now & mask, value, "mask {:#x}", mask);
        }
    }
}

/// Missing relocations are reported, not guessed
#[test]
fn test_external_unit_without_patch_offset() {
    use entry_barrier::{CodeBuffer, EmitContext};

    let fixture = BarrierFixture::new();
    let codec = fixture.service().codec();
    let ctx = EmitContext::new(fixture.service().epoch(), common::ENTRY_BARRIER_STUB);

    // Fast template installed as an external unit that never published
    // its patch offset
    let mut fast = CodeBuffer::new(Backend::Fast);
    let _ = codec.emit_entry_barrier(&mut fast, &ctx).unwrap();
    let mut external = CodeBuffer::new(Backend::External);
    external.emit_bytes(fast.bytes());
    external.mark_frame_complete();
    external.emit_u32(0);
    let cm = fixture.cache().install("external", &external).unwrap();

    assert!(matches!(
        codec.locate(&cm),
        Err(BarrierError::MissingRelocation { .. })
    ));
}
