//! Compiled Method - installed unit of machine code
//!
//! A [`CompiledMethod`] describes where its code lives and the layout facts
//! the barrier codecs need: the frame-complete offset, which backend emitted
//! it, whether it is an OSR entry, and any relocations that publish the
//! guard location explicitly.

use super::CodeRegion;
use std::fmt;
use std::sync::Arc;

/// Which compiler produced the method
///
/// The backend decides the barrier template: the optimizing backend moves
/// the slow path into an out-of-line stub, the fast backend keeps it inline,
/// and externally compiled units record the barrier position themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Backend {
    /// Baseline compiler, inline slow path
    Fast,
    /// Optimizing compiler, out-of-line slow path stub
    Optimizing,
    /// Externally compiled unit, barrier published via relocation
    External,
}

/// Method flavour; some intrinsics are emitted without an entry barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MethodKind {
    Normal,
    /// Wrapper around a native function
    NativeWrapper,
    MethodHandleIntrinsic,
    ContinuationEnterIntrinsic,
    ContinuationYieldIntrinsic,
}

impl MethodKind {
    /// Check if methods of this kind carry an entry barrier
    pub fn has_entry_barrier(self) -> bool {
        matches!(self, MethodKind::Normal | MethodKind::NativeWrapper)
    }
}

/// Relocation records relevant to the entry barrier
///
/// Offsets are relative to the method's code start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// Guard word emitted in an out-of-line stub
    EntryGuard { offset: usize },
    /// A pc-relative data reference at `at` resolving to `target`
    SectionWord { at: usize, target: usize },
}

/// Installed compiled method
pub struct CompiledMethod {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) region: Arc<CodeRegion>,
    pub(crate) code_begin: usize,
    pub(crate) code_size: usize,
    pub(crate) frame_complete_offset: usize,
    pub(crate) frame_size_words: usize,
    pub(crate) backend: Backend,
    pub(crate) kind: MethodKind,
    pub(crate) is_osr: bool,
    pub(crate) entry_patch_offset: Option<usize>,
    pub(crate) relocations: Vec<Relocation>,
}

impl CompiledMethod {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region holding this method's code
    pub fn region(&self) -> &CodeRegion {
        &self.region
    }

    /// Address of the first code byte
    pub fn code_begin(&self) -> usize {
        self.code_begin
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn code_end(&self) -> usize {
        self.code_begin + self.code_size
    }

    /// Check if `pc` lies inside this method's code
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.code_begin && pc < self.code_end()
    }

    /// Byte offset at which the activation's frame is fully built
    pub fn frame_complete_offset(&self) -> usize {
        self.frame_complete_offset
    }

    /// Frame size in machine words, including return address and saved
    /// frame pointer
    pub fn frame_size_words(&self) -> usize {
        self.frame_size_words
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn produced_by_optimizing_backend(&self) -> bool {
        self.backend == Backend::Optimizing
    }

    pub fn is_external(&self) -> bool {
        self.backend == Backend::External
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_osr(&self) -> bool {
        self.is_osr
    }

    /// Offset of the barrier recorded by an externally compiled unit
    pub fn entry_patch_offset(&self) -> Option<usize> {
        self.entry_patch_offset
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Address of the first `EntryGuard` relocation
    pub fn entry_guard_reloc(&self) -> Option<usize> {
        self.relocations.iter().find_map(|r| match r {
            Relocation::EntryGuard { offset } => Some(self.code_begin + offset),
            _ => None,
        })
    }

    /// Target of the `SectionWord` relocation placed at code offset `at`
    pub fn section_word_at(&self, at: usize) -> Option<usize> {
        self.relocations.iter().find_map(|r| match *r {
            Relocation::SectionWord { at: pos, target } if pos == at => {
                Some(self.code_begin + target)
            }
            _ => None,
        })
    }
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("code_begin", &format_args!("{:#x}", self.code_begin))
            .field("code_size", &self.code_size)
            .field("frame_complete_offset", &self.frame_complete_offset)
            .field("backend", &self.backend)
            .field("kind", &self.kind)
            .field("is_osr", &self.is_osr)
            .finish()
    }
}
