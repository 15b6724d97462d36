//! Code Cache - owner of installed methods
//!
//! Installs [`CodeBuffer`]s into a single [`CodeRegion`] with bump
//! allocation and maps return addresses back to the method that contains
//! them, which is how the slow path identifies the trapped method.

use super::buffer::CODE_ENTRY_ALIGNMENT;
use super::{CodeBuffer, CodeRegion, CompiledMethod};
use crate::error::{BarrierError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct CodeCache {
    region: Arc<CodeRegion>,
    /// Next free offset in the region
    top: Mutex<usize>,
    /// Installed methods keyed by code start
    methods: RwLock<BTreeMap<usize, Arc<CompiledMethod>>>,
    next_id: AtomicU64,
}

impl CodeCache {
    /// Map a fresh region of `size` bytes
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            region: Arc::new(CodeRegion::anonymous(size)?),
            top: Mutex::new(0),
            methods: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn region(&self) -> &Arc<CodeRegion> {
        &self.region
    }

    /// Bytes still available for installation
    pub fn available(&self) -> usize {
        self.region.size() - *self.top.lock()
    }

    /// Copy `buffer` into the region and publish it as a compiled method
    pub fn install(&self, name: &str, buffer: &CodeBuffer) -> Result<Arc<CompiledMethod>> {
        let frame_complete_offset = buffer.frame_complete_offset().ok_or_else(|| {
            BarrierError::Internal(format!("method {} has no frame-complete offset", name))
        })?;

        let len = buffer.pc();
        let code_begin = {
            let mut top = self.top.lock();
            let start = (*top + CODE_ENTRY_ALIGNMENT - 1) & !(CODE_ENTRY_ALIGNMENT - 1);
            let available = self.region.size().saturating_sub(start);
            if len > available {
                return Err(BarrierError::CodeCacheFull {
                    requested: len,
                    available,
                });
            }
            *top = start + len;
            self.region.base() + start
        };

        // SAFETY: the range was just carved out under the lock and is not
        // reachable by any other thread until the method is published below.
        unsafe { self.region.write_bytes(code_begin, buffer.bytes())? };
        self.region.sync_icache(code_begin, len)?;

        let method = Arc::new(CompiledMethod {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            region: Arc::clone(&self.region),
            code_begin,
            code_size: len,
            frame_complete_offset,
            frame_size_words: buffer.frame_size_words(),
            backend: buffer.backend(),
            kind: buffer.kind(),
            is_osr: buffer.is_osr(),
            entry_patch_offset: buffer.entry_patch_offset(),
            relocations: buffer.relocations().to_vec(),
        });

        self.methods.write().insert(code_begin, Arc::clone(&method));

        log::debug!(
            "installed {} (id {}) at {:#x}, {} bytes, {:?}",
            name,
            method.id(),
            code_begin,
            len,
            method.backend()
        );

        Ok(method)
    }

    /// Method whose code contains `pc`
    pub fn find(&self, pc: usize) -> Option<Arc<CompiledMethod>> {
        let methods = self.methods.read();
        methods
            .range(..=pc)
            .next_back()
            .filter(|(_, m)| m.contains(pc))
            .map(|(_, m)| Arc::clone(m))
    }

    /// Method whose code starts exactly at `code_begin`
    pub fn lookup(&self, code_begin: usize) -> Option<Arc<CompiledMethod>> {
        self.methods.read().get(&code_begin).cloned()
    }

    /// Unpublish a method; its bytes are not reused
    pub fn remove(&self, method: &CompiledMethod) -> bool {
        self.methods.write().remove(&method.code_begin()).is_some()
    }

    /// Number of installed methods
    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all installed methods
    pub fn methods(&self) -> Vec<Arc<CompiledMethod>> {
        self.methods.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("region", &self.region)
            .field("methods", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Backend;

    fn buffer(len: usize) -> CodeBuffer {
        let mut buf = CodeBuffer::new(Backend::Fast);
        buf.emit_bytes(&vec![0x90; len]);
        buf.mark_frame_complete();
        buf
    }

    #[test]
    fn test_install_aligns_and_finds() {
        let cache = CodeCache::new(4096).unwrap();
        let a = cache.install("a", &buffer(10)).unwrap();
        let b = cache.install("b", &buffer(10)).unwrap();

        assert_eq!(a.code_begin() % CODE_ENTRY_ALIGNMENT, 0);
        assert_eq!(b.code_begin() % CODE_ENTRY_ALIGNMENT, 0);
        assert_ne!(a.id(), b.id());

        assert_eq!(cache.find(a.code_begin() + 5).map(|m| m.id()), Some(a.id()));
        assert_eq!(cache.find(b.code_begin()).map(|m| m.id()), Some(b.id()));
        assert!(cache.find(a.code_end() + 1).is_none());
        assert!(cache.find(cache.region().base() - 1).is_none());
    }

    #[test]
    fn test_install_copies_bytes() {
        let cache = CodeCache::new(4096).unwrap();
        let mut buf = CodeBuffer::new(Backend::Fast);
        buf.emit_bytes(&[1, 2, 3, 4]);
        buf.mark_frame_complete();
        let m = cache.install("copy", &buf).unwrap();

        let bytes = m.region().read_bytes(m.code_begin(), 4).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cache_full() {
        let cache = CodeCache::new(4096).unwrap();
        let size = cache.region().size();
        let err = cache.install("big", &buffer(size + 1)).unwrap_err();
        assert!(matches!(err, BarrierError::CodeCacheFull { .. }));
    }

    #[test]
    fn test_missing_frame_complete() {
        let cache = CodeCache::new(4096).unwrap();
        let buf = CodeBuffer::new(Backend::Fast);
        assert!(cache.install("broken", &buf).is_err());
    }

    #[test]
    fn test_remove() {
        let cache = CodeCache::new(4096).unwrap();
        let m = cache.install("gone", &buffer(8)).unwrap();
        assert!(cache.remove(&m));
        assert!(cache.find(m.code_begin()).is_none());
        assert!(cache.is_empty());
    }
}
