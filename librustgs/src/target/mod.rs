/*
    GPU-resident views of local memory: render targets and texture mirrors
*/

pub mod memory;
pub mod render;
mod resolve;

#[cfg(test)]
mod test;

pub use memory::{ClutDescriptor, MemoryTargetCache, MemoryTargetSurface, MirrorId, TextureDescriptor};
pub use render::{DrawBinding, RenderTargetCache, RenderTargetSurface, SurfaceId, TargetStats};

use bitflags::bitflags;

use crate::gpu::GpuBackend;
use crate::memory::{AddressTranslator, BackingStore};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TargetStatus: u32 {
        /// Local memory holds everything the surface holds
        const RESOLVED = 1 << 0;
        /// Local memory is newer than the surface
        const NEEDS_UPDATE = 1 << 1;
        /// Tracked for addressing only, no storage
        const VIRTUAL = 1 << 2;
        const FEEDBACK_READY = 1 << 3;
        const NEEDS_CONVERT16 = 1 << 4;
        const NEEDS_CONVERT32 = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TargetOptions: u32 {
        /// Only a surface of exactly the requested height is a hit
        const STRICT_HEIGHT = 1 << 0;
        /// Track the surface without allocating storage
        const VIRTUAL = 1 << 1;
    }
}

impl TargetStatus {
    pub const CONVERT: TargetStatus = TargetStatus::NEEDS_CONVERT16.union(TargetStatus::NEEDS_CONVERT32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Color,
    Depth,
}

/// Render targets are keyed by where they live, not by what they hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub kind: SurfaceKind,
    pub base: u32,
    pub stride: u32,
}

/// FRAME/ZBUF style description of a drawing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub psm: u8,
    pub base: u32,
    /// Buffer width in pixels
    pub stride: u32,
    pub height: u32,
    /// Bits set here are never written by draws (FBM)
    pub write_mask: u32,
}

impl FrameDescriptor {
    pub fn key(&self, kind: SurfaceKind) -> TargetKey {
        TargetKey { kind, base: self.base, stride: self.stride }
    }
}

/// Everything a render target operation may touch besides the cache itself.
pub struct TargetEnv<'a> {
    pub gpu: &'a mut dyn GpuBackend,
    pub store: &'a mut BackingStore,
    pub translator: &'a AddressTranslator,
    pub memory_targets: &'a mut MemoryTargetCache,
}
