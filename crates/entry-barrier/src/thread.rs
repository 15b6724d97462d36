//! Per-Thread Barrier State
//!
//! Every thread that may enter compiled code owns a [`ThreadBarrierState`]:
//! the guard value it currently trusts (the disarmed phase) and the patching
//! epoch it last fenced at. Generated code reads both through fixed offsets
//! from the thread register, so the layout is `repr(C)`.
//!
//! The registry lets the collector publish a new phase to every attached
//! thread when it arms all methods at once.

use parking_lot::RwLock;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

/// Thread-local disarm value
///
/// Written by the collector (new phase) and by the owning thread's slow path
/// (new epoch); read by the owning thread's fast path.
///
/// Emitted barriers compare a single 64-bit word: the disarmed value in the
/// low half and the low 32 bits of the epoch in the high half. The full
/// epoch is kept next to it for the runtime.
#[derive(Debug)]
#[repr(C)]
pub struct ThreadBarrierState {
    /// Guard value this thread treats as disarmed
    disarmed_value: AtomicU32,
    /// Low word of `epoch`, paired with the disarmed value
    epoch_low: AtomicU32,
    /// Patching epoch this thread has fenced at
    epoch: AtomicU64,
    id: usize,
}

impl ThreadBarrierState {
    /// Create state trusting `disarmed_value` at epoch zero
    pub fn new(disarmed_value: u32) -> Self {
        Self {
            disarmed_value: AtomicU32::new(disarmed_value),
            epoch_low: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Registry-unique id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Guard value this thread currently trusts
    #[inline(always)]
    pub fn disarmed_value(&self) -> u32 {
        self.disarmed_value.load(Ordering::Relaxed)
    }

    /// Epoch this thread has fenced at
    #[inline(always)]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// The (value, epoch) pair the fast path compares against
    #[inline(always)]
    pub fn trusted_pair(&self) -> (u32, u64) {
        (self.disarmed_value(), self.epoch())
    }

    /// Publish a new phase to this thread
    pub fn set_disarmed_value(&self, value: u32) {
        self.disarmed_value.store(value, Ordering::Relaxed);
    }

    /// Record that this thread has fenced at `epoch`
    ///
    /// Only the owning thread calls this, from its slow path, after it has
    /// executed the fence the epoch stands for. Never moves backwards.
    pub fn observe_epoch(&self, epoch: u64) {
        let latest = self.epoch.fetch_max(epoch, Ordering::Relaxed).max(epoch);
        self.epoch_low.store(latest as u32, Ordering::Relaxed);
    }

    /// Byte offset of the disarmed value from the start of the state block
    pub const fn disarmed_value_offset() -> usize {
        std::mem::offset_of!(ThreadBarrierState, disarmed_value)
    }

    /// Byte offset of the epoch word paired with the disarmed value
    pub const fn paired_epoch_offset() -> usize {
        std::mem::offset_of!(ThreadBarrierState, epoch_low)
    }

    /// Byte offset of the full epoch from the start of the state block
    pub const fn epoch_offset() -> usize {
        std::mem::offset_of!(ThreadBarrierState, epoch)
    }
}

/// Set of threads attached to a barrier service
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: RwLock<Vec<Arc<ThreadBarrierState>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new thread trusting `disarmed_value`
    pub fn attach(&self, disarmed_value: u32) -> Arc<ThreadBarrierState> {
        let state = Arc::new(ThreadBarrierState::new(disarmed_value));
        self.threads.write().push(Arc::clone(&state));
        log::trace!("attached thread {} (disarmed value {})", state.id(), disarmed_value);
        state
    }

    /// Detach a thread; returns false if it was not attached
    pub fn detach(&self, state: &ThreadBarrierState) -> bool {
        let mut threads = self.threads.write();
        let before = threads.len();
        threads.retain(|t| t.id() != state.id());
        before != threads.len()
    }

    /// Number of attached threads
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to every attached thread
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ThreadBarrierState),
    {
        for thread in self.threads.read().iter() {
            f(thread);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadBarrierState>>> = const { RefCell::new(None) };
}

/// Bind `state` to the calling OS thread, replacing any previous binding
pub fn set_current(state: Arc<ThreadBarrierState>) {
    CURRENT.with(|current| *current.borrow_mut() = Some(state));
}

/// Remove the calling thread's binding
pub fn clear_current() -> Option<Arc<ThreadBarrierState>> {
    CURRENT.with(|current| current.borrow_mut().take())
}

/// State bound to the calling OS thread, if any
pub fn current() -> Option<Arc<ThreadBarrierState>> {
    CURRENT.with(|current| current.borrow().clone())
}
