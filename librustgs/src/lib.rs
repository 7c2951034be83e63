/* GS Video Memory Module */
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod gpu;
pub mod memory;
pub mod reconcile;
pub mod target;

pub use config::VramConfig;
pub use context::{
    BufferPos, ContextStats, DepthDescriptor, DrawRequest, DrawTargets, LocalCopy, ScanoutSource, TextureSource,
    VideoMemoryContext,
};
pub use error::{Result, VramError};
pub use format::{FormatTable, PixelFormatDescriptor};
pub use gpu::{BackendKind, GpuBackend, SoftwareBackend};
pub use memory::{AddressTranslator, BackingStore, ByteRange, DirtyRangeSet, Rect};
pub use reconcile::ReconciliationEngine;
pub use target::{FrameDescriptor, SurfaceKind, TargetKey, TargetOptions, TargetStatus, TextureDescriptor};
