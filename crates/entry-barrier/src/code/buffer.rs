//! Code Buffer - staging area for a method before installation
//!
//! Holds the raw bytes plus the layout metadata that becomes a
//! [`CompiledMethod`](super::CompiledMethod) once the buffer is installed
//! into the [`CodeCache`](super::CodeCache). Offsets are buffer-relative;
//! installation copies the bytes verbatim so pc-relative encodings survive.

use super::{Backend, MethodKind, Relocation};

/// Alignment of every installed method's first byte
pub const CODE_ENTRY_ALIGNMENT: usize = 64;

#[derive(Debug, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    backend: Backend,
    kind: MethodKind,
    is_osr: bool,
    frame_complete_offset: Option<usize>,
    frame_size_words: usize,
    entry_patch_offset: Option<usize>,
    relocations: Vec<Relocation>,
}

impl CodeBuffer {
    pub fn new(backend: Backend) -> Self {
        Self {
            bytes: Vec::with_capacity(256),
            backend,
            kind: MethodKind::Normal,
            is_osr: false,
            frame_complete_offset: None,
            frame_size_words: 4,
            entry_patch_offset: None,
            relocations: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: MethodKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_osr(mut self, is_osr: bool) -> Self {
        self.is_osr = is_osr;
        self
    }

    pub fn with_frame_size_words(mut self, words: usize) -> Self {
        self.frame_size_words = words;
        self
    }

    /// Current emission offset
    pub fn pc(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_osr(&self) -> bool {
        self.is_osr
    }

    pub fn frame_size_words(&self) -> usize {
        self.frame_size_words
    }

    pub fn frame_complete_offset(&self) -> Option<usize> {
        self.frame_complete_offset
    }

    pub fn entry_patch_offset(&self) -> Option<usize> {
        self.entry_patch_offset
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Emit a little-endian 32-bit word
    pub fn emit_u32(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    /// Pad with `fill` until `pc()` is a multiple of `alignment`
    pub fn align(&mut self, alignment: usize, fill: u8) {
        while self.bytes.len() % alignment != 0 {
            self.bytes.push(fill);
        }
    }

    /// Pad with a repeated 32-bit `word` until `pc()` is a multiple of
    /// `alignment`; `pc()` must already be 4-byte aligned
    pub fn align_words(&mut self, alignment: usize, word: u32) {
        while self.bytes.len() % alignment != 0 {
            self.emit_u32(word);
        }
    }

    /// Overwrite a previously emitted 32-bit word
    pub fn patch_u32(&mut self, offset: usize, word: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    /// Mark the current offset as the point where the frame is complete
    pub fn mark_frame_complete(&mut self) {
        self.frame_complete_offset = Some(self.pc());
    }

    /// Record where an externally compiled unit placed its barrier
    pub fn set_entry_patch_offset(&mut self, offset: usize) {
        self.entry_patch_offset = Some(offset);
    }

    pub fn add_relocation(&mut self, reloc: Relocation) {
        self.relocations.push(reloc);
    }
}
