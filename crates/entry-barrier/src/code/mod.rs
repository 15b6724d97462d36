//! Code Module - Compiled Methods & Executable Memory
//!
//! Compiled code lives in a [`CodeRegion`], the only place the subsystem
//! ever writes machine code. Methods are staged in a [`CodeBuffer`],
//! installed by the [`CodeCache`], and from then on described by an
//! immutable [`CompiledMethod`]. The guard word inside a method is the only
//! datum that changes after installation.

pub mod buffer;
pub mod cache;
pub mod method;
pub mod region;

pub use buffer::{CodeBuffer, CODE_ENTRY_ALIGNMENT};
pub use cache::CodeCache;
pub use method::{Backend, CompiledMethod, MethodKind, Relocation};
pub use region::CodeRegion;
