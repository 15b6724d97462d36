//! C ABI - entry points called by generated stubs
//!
//! Generated code cannot carry a Rust reference to the runtime, so one
//! [`EntryBarrierRuntime`] is installed per process and the stubs reach it
//! through these functions. Threads attach lazily on their first trap.

use crate::code::CodeCache;
use crate::config::BarrierConfig;
use crate::error::{BarrierError, Result};
use crate::logging::{configure_logger, BarrierLoggerConfig, LogLevel};
use crate::{fatal_on_err, guarantee};
use crate::slow_path::EntryBarrierRuntime;
use crate::state::BarrierStateService;
use crate::thread::{self, ThreadBarrierState};
use std::sync::{Arc, OnceLock};

static RUNTIME: OnceLock<EntryBarrierRuntime> = OnceLock::new();

/// Install the process-wide runtime
///
/// Fails if a runtime is already installed.
pub fn install(runtime: EntryBarrierRuntime) -> Result<&'static EntryBarrierRuntime> {
    RUNTIME
        .set(runtime)
        .map_err(|_| BarrierError::Configuration("entry barrier runtime already installed".into()))?;
    RUNTIME
        .get()
        .ok_or_else(|| BarrierError::Internal("runtime vanished after install".into()))
}

/// The installed runtime, if any
pub fn runtime() -> Option<&'static EntryBarrierRuntime> {
    RUNTIME.get()
}

/// State of the calling thread, attaching it on first use
fn current_thread(runtime: &EntryBarrierRuntime) -> Arc<ThreadBarrierState> {
    match thread::current() {
        Some(state) => state,
        None => {
            let state = runtime.service().attach_thread();
            thread::set_current(Arc::clone(&state));
            state
        }
    }
}

/// Install a runtime configured from the environment
///
/// `wrong_method_stub` is the resolution entry deoptimized activations
/// return into. Fails if it is null, or if a runtime bound to a different
/// stub is already installed.
#[no_mangle]
pub extern "C" fn ebar_init(wrong_method_stub: usize) -> bool {
    if let Some(runtime) = RUNTIME.get() {
        return bound_to(runtime, wrong_method_stub);
    }

    let build = || -> Result<EntryBarrierRuntime> {
        let mut config = BarrierConfig::from_env()?;
        config.wrong_method_stub = wrong_method_stub;
        if config.trace_events {
            configure_logger(BarrierLoggerConfig {
                level: LogLevel::Trace,
                ..Default::default()
            });
        }
        let cache = CodeCache::new(config.code_cache_size)?;
        let service = BarrierStateService::new(config)?;
        Ok(EntryBarrierRuntime::new(Arc::new(service), Arc::new(cache)))
    };

    match build() {
        Ok(runtime) => match install(runtime) {
            Ok(runtime) => bound_to(runtime, wrong_method_stub),
            // A concurrent init won the race
            Err(_) => RUNTIME
                .get()
                .map_or(false, |runtime| bound_to(runtime, wrong_method_stub)),
        },
        Err(e) => {
            eprintln!("Failed to create entry barrier runtime: {:?}", e);
            false
        }
    }
}

fn bound_to(runtime: &EntryBarrierRuntime, wrong_method_stub: usize) -> bool {
    let installed = runtime.service().config().wrong_method_stub;
    if installed != wrong_method_stub {
        eprintln!(
            "Entry barrier runtime already bound to wrong-method stub {:#x}, not {:#x}",
            installed, wrong_method_stub
        );
        return false;
    }
    true
}

/// Slow path of the entry barrier stub
///
/// Returns 0 to continue into the method body, 1 after the frame was
/// rewritten to return into the wrong-method stub.
///
/// # Safety
///
/// Must only be called by the entry barrier stub, with `return_slot`
/// pointing at the return address of the trapped call.
#[no_mangle]
pub unsafe extern "C" fn ebar_stub_entry_barrier(return_slot: *mut usize) -> i32 {
    guarantee!(!return_slot.is_null(), "entry barrier stub passed a null return slot");
    let runtime = fatal_on_err!(
        RUNTIME.get().ok_or_else(|| {
            BarrierError::Configuration("no runtime installed, call ebar_init first".into())
        }),
        "entry barrier stub"
    );

    let state = current_thread(runtime);
    runtime.stub_entry_barrier(&state, return_slot) as i32
}

/// Entry barrier of the OSR method starting at `code_begin`
#[no_mangle]
pub extern "C" fn ebar_osr_entry_barrier(code_begin: usize) -> bool {
    let Some(runtime) = RUNTIME.get() else {
        return false;
    };

    match runtime.cache().lookup(code_begin) {
        Some(cm) if !cm.is_osr() => {
            eprintln!("OSR entry into non-OSR method {}", cm.name());
            false
        }
        Some(cm) => {
            let state = current_thread(runtime);
            runtime.osr_entry_barrier(&state, &cm)
        }
        None => {
            eprintln!("OSR entry into unknown method at {:#x}", code_begin);
            false
        }
    }
}

/// Attach the calling thread; the result is the base generated code
/// addresses the disarmed value and epoch from
#[no_mangle]
pub extern "C" fn ebar_attach_thread() -> *const ThreadBarrierState {
    match RUNTIME.get() {
        Some(runtime) => Arc::as_ptr(&current_thread(runtime)),
        None => std::ptr::null(),
    }
}

#[no_mangle]
pub extern "C" fn ebar_detach_thread() {
    if let Some(state) = thread::clear_current() {
        if let Some(runtime) = RUNTIME.get() {
            runtime.service().detach_thread(&state);
        }
    }
}

/// Arm every method; returns the new phase, or 0 without a runtime
#[no_mangle]
pub extern "C" fn ebar_arm_all() -> u32 {
    match RUNTIME.get() {
        Some(runtime) => runtime.service().arm_all(),
        None => 0,
    }
}
