//! # Entry Barrier - Concurrent Method Entry Barriers
//!
//! Entry barriers let a collector intercept every future call into a
//! compiled method without stopping the world. Each compiled method starts
//! with a short inline check of a 32-bit guard word against a value the
//! calling thread trusts; the collector flips the guard to make entries
//! trap into a slow path that re-validates the method, or kills it.
//!
//! ## Overview
//!
//! - **Guard words**: `ARMED` (0) traps everyone, a phase value lets
//!   threads that know the phase through, the sticky `NOT_ENTRANT` bit
//!   traps forever
//! - **Per-architecture codecs**: locate, verify and patch the emitted
//!   barrier on x86_64, AArch64 and RISC-V 64
//! - **Patching epoch**: amortizes the cross-modify fence a thread needs
//!   after code was patched concurrently to once per disarm wave
//! - **Deoptimization**: rewrites the frame of a trapped call so it
//!   returns into a method resolution stub
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use entry_barrier::{
//!     codec_for, Arch, Backend, BarrierConfig, BarrierStateService, CodeBuffer, CodeCache,
//!     EmitContext, PatchingEpoch,
//! };
//!
//! fn main() -> entry_barrier::Result<()> {
//!     let service = BarrierStateService::with_codec(
//!         BarrierConfig::default(),
//!         codec_for(Arch::X86_64, None),
//!         Arc::new(PatchingEpoch::new()),
//!     )?;
//!     let cache = CodeCache::new(64 * 1024)?;
//!
//!     // Emit a method the way the code generator would
//!     let ctx = EmitContext::new(service.epoch(), 0x1000);
//!     let mut buf = CodeBuffer::new(Backend::Fast);
//!     let _ = service.codec().emit_entry_barrier(&mut buf, &ctx)?;
//!     buf.emit_u8(0xc3);
//!     let method = cache.install("answer", &buf)?;
//!
//!     // New code starts armed
//!     assert!(service.is_armed(&method));
//!     service.disarm(&method);
//!     assert!(!service.is_armed(&method));
//!
//!     // Once not entrant, nothing brings it back
//!     service.make_not_entrant(&method);
//!     service.disarm(&method);
//!     assert!(service.is_armed(&method));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Collector                            │
//! │      arm / disarm / make_not_entrant / arm_all            │
//! └─────────────────────────────┬─────────────────────────────┘
//!                               ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  BarrierStateService                      │
//! │   phase ─ thread registry ─ patching epoch ─ stats        │
//! └──────────────┬────────────────────────────┬───────────────┘
//!                ▼                            ▼
//! ┌───────────────────────────┐  ┌───────────────────────────┐
//! │     ArchBarrierCodec       │  │    EntryBarrierRuntime     │
//! │  locate / verify / patch   │  │  stub + OSR slow paths     │
//! │  x86_64 aarch64 riscv64    │  │  collector hook            │
//! └──────────────┬─────────────┘  └──────────────┬────────────┘
//!                ▼                               ▼
//! ┌───────────────────────────┐  ┌───────────────────────────┐
//! │   CodeRegion / CodeCache   │  │        Deoptimizer         │
//! │   executable memory        │  │   calling conventions      │
//! └───────────────────────────┘  └───────────────────────────┘
//! ```
//!
//! ### Entry Protocol
//!
//! 1. **Fast path** (inline): acquire-load the guard, compare with the
//!    thread's disarmed value (and epoch, under concurrent instruction
//!    patching), fall through on match
//! 2. **Slow path** (stub): find the method, run the collector hook for
//!    armed methods, fence and refresh the thread's cached values
//! 3. **Deoptimization**: a method that must not run has its caller's frame
//!    rewritten to return into the wrong-method stub
//!
//! ## Safety
//!
//! Guards are only ever written through [`CodeRegion`] and the codecs,
//! never through raw pointer stores. The slow path and the deoptimizer
//! operate on raw stack slots and are `unsafe`: callers must pass the
//! return slot of a live trapped activation laid out per the codec's
//! [`CallingConvention`].
//!
//! Encoding mismatches and unknown return addresses are defects: they abort
//! through [`guarantee!`] instead of being returned.
//!
//! ### Thread Safety
//!
//! - `BarrierStateService` is `Send + Sync`; guard updates of a method are
//!   serialized, masked updates are lock-free
//! - `ThreadBarrierState` is written by the collector (phase) and its owning
//!   thread (epoch) only
//!
//! ## Configuration
//!
//! See [`BarrierConfig`]; `EBAR_*` environment variables override the
//! diagnostic switches through [`BarrierConfig::from_env`].

pub mod code;
pub mod codec;
pub mod config;
pub mod deopt;
pub mod epoch;
pub mod error;
pub mod ffi;
pub mod guard;
pub mod logging;
pub mod slow_path;
pub mod state;
pub mod stats;
pub mod sync;
pub mod thread;

pub use code::{Backend, CodeBuffer, CodeCache, CodeRegion, CompiledMethod, MethodKind, Relocation};
pub use codec::{
    codec_for, host_codec, Arch, ArchBarrierCodec, BarrierSite, EmitContext, EntryStub,
    PatchOutcome, PatchingType,
};
pub use config::{BarrierConfig, ConfigError};
pub use deopt::{CallingConvention, Deoptimizer, FrameRewrite, DEOPT_COOKIE};
pub use epoch::PatchingEpoch;
pub use error::{BarrierError, Result};
pub use guard::{GuardState, ALL_BITS, ARMED, INITIAL_PHASE, NOT_ENTRANT};
pub use logging::{BarrierEvent, BarrierLogger, BarrierLoggerConfig, LogLevel};
pub use slow_path::{CollectorHook, EntryBarrierRuntime, KeepAliveHook, StubAction};
pub use state::{BarrierStateService, EntryDecision};
pub use stats::{AtomicEntryBarrierStats, EntryBarrierStats};
pub use thread::{ThreadBarrierState, ThreadRegistry};

// Used by the exported `guarantee!` and `fatal_on_err!` macros
#[doc(hidden)]
pub use log;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
