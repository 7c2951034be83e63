/*
    Video memory context: local memory plus every GPU-resident view of it
*/

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::config::VramConfig;
use crate::error::{Result, VramError};
use crate::format::FormatTable;
use crate::gpu::{GpuBackend, GpuStats, TexRect, TextureId};
use crate::memory::translate::{load_pixel, store_pixel};
use crate::memory::{AddressTranslator, BackingStore, ByteRange, DirtyRangeSet, Rect, VramSnapshot, VRAM_SIZE};
use crate::reconcile::{ReconcileStats, ReconciliationEngine};
use crate::target::memory::MemoryTargetStats;
use crate::target::{
    FrameDescriptor, MemoryTargetCache, MirrorId, RenderTargetCache, SurfaceId, SurfaceKind, TargetEnv, TargetKey,
    TargetOptions, TargetStats, TargetStatus, TextureDescriptor,
};

/// ZBUF for a draw. The depth buffer shares the frame's stride and height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthDescriptor {
    pub psm: u8,
    pub base: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRequest {
    /// GS drawing context, 0 or 1
    pub context: usize,
    pub frame: FrameDescriptor,
    pub depth: Option<DepthDescriptor>,
    pub texture: Option<TextureDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSource {
    /// Sample a render target directly
    Target { surface: SurfaceId, texture: TextureId, row_offset: u32 },
    /// The texture is the draw's own target, sample a copy
    Feedback { surface: SurfaceId, texture: TextureId },
    Mirror(MirrorId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawTargets {
    pub color: Option<SurfaceId>,
    pub depth: Option<SurfaceId>,
    pub texture: Option<TextureSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutSource {
    Surface { surface: SurfaceId, texture: TextureId, row_offset: u32 },
    /// Nothing materialised there, read local memory directly
    BackingStore(ByteRange),
}

/// Pixel rectangle origin inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPos {
    pub base: u32,
    pub stride: u32,
    pub x: u32,
    pub y: u32,
}

/// Local to local transfer (TRXDIR 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCopy {
    pub psm: u8,
    pub src: BufferPos,
    pub dst: BufferPos,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub reconcile: ReconcileStats,
    pub targets: TargetStats,
    pub memory_targets: MemoryTargetStats,
    pub gpu: GpuStats,
    pub live_targets: usize,
    pub live_mirrors: usize,
}

struct Parts<'a> {
    env: TargetEnv<'a>,
    targets: &'a mut RenderTargetCache,
    dirty: &'a mut DirtyRangeSet,
    engine: &'a mut ReconciliationEngine,
    config: &'a VramConfig,
}

pub struct VideoMemoryContext {
    store: BackingStore,
    translator: AddressTranslator,
    config: VramConfig,
    gpu: Box<dyn GpuBackend>,
    dirty: DirtyRangeSet,
    targets: RenderTargetCache,
    memory_targets: MemoryTargetCache,
    engine: ReconciliationEngine,
}

impl VideoMemoryContext {
    pub fn new(config: VramConfig, gpu: Box<dyn GpuBackend>) -> Result<Self> {
        VideoMemoryContext::with_formats(config, Arc::new(FormatTable::standard()), gpu)
    }

    pub fn with_formats(config: VramConfig, formats: Arc<FormatTable>, gpu: Box<dyn GpuBackend>) -> Result<Self> {
        config.validate()?;

        info!(
            "Video memory context on the {} backend ({})",
            gpu.name(),
            match (config.exact_reconcile, config.heuristics_enabled()) {
                (true, _) => "reference mode",
                (false, true) => "heuristics on",
                (false, false) => "heuristics off",
            }
        );

        Ok(VideoMemoryContext {
            store: BackingStore::new(),
            translator: AddressTranslator::new(formats),
            targets: RenderTargetCache::new(&config),
            memory_targets: MemoryTargetCache::new(&config),
            config,
            gpu,
            dirty: DirtyRangeSet::new(),
            engine: ReconciliationEngine::new(),
        })
    }

    fn parts(&mut self) -> Parts<'_> {
        let VideoMemoryContext { store, translator, config, gpu, dirty, targets, memory_targets, engine } = self;
        Parts {
            env: TargetEnv { gpu: gpu.as_mut(), store, translator, memory_targets },
            targets,
            dirty,
            engine,
            config,
        }
    }

    pub fn store(&self) -> &BackingStore {
        &self.store
    }

    /// Raw local memory access. Writes made here must be reported with `mark_dirty`.
    pub fn store_mut(&mut self) -> &mut BackingStore {
        &mut self.store
    }

    pub fn config(&self) -> &VramConfig {
        &self.config
    }

    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    pub fn targets(&self) -> &RenderTargetCache {
        &self.targets
    }

    pub fn memory_targets(&self) -> &MemoryTargetCache {
        &self.memory_targets
    }

    pub fn dirty(&self) -> &DirtyRangeSet {
        &self.dirty
    }

    pub fn gpu(&self) -> &dyn GpuBackend {
        self.gpu.as_ref()
    }

    pub fn gpu_mut(&mut self) -> &mut dyn GpuBackend {
        self.gpu.as_mut()
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            reconcile: self.engine.stats(),
            targets: self.targets.stats(),
            memory_targets: self.memory_targets.stats(),
            gpu: self.gpu.stats(),
            live_targets: self.targets.live_count(),
            live_mirrors: self.memory_targets.len(),
        }
    }

    pub fn query_byte_range(&self, rect: &Rect) -> ByteRange {
        self.translator.query(rect)
    }

    /// Host to local transfer. Targets under the written bytes are copied
    /// back first so the rest of their pages survive.
    pub fn write_local(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let end = addr as usize + data.len();
        if end > VRAM_SIZE {
            return Err(VramError::OutOfBounds { addr, len: data.len() });
        }

        if !self.dirty.is_empty() {
            self.reconcile(None);
        }

        let range = ByteRange::new(addr, end as u32);
        let mut p = self.parts();
        for id in p.targets.intersecting(range) {
            p.targets.resolve(&mut p.env, id);
        }

        self.store.write(addr, data)?;
        self.dirty.insert_range(range);
        Ok(())
    }

    pub fn write_palette(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.store.write_clut(offset, data)
    }

    pub fn mark_dirty(&mut self, range: ByteRange) {
        self.dirty.insert_range(range.clamp_to(ByteRange::full()));
    }

    pub fn reconcile(&mut self, texture: Option<ByteRange>) {
        let Parts { mut env, targets, dirty, engine, config } = self.parts();
        engine.run(dirty, targets, &mut env, config, texture);
    }

    pub fn get_or_create(
        &mut self,
        desc: &FrameDescriptor,
        kind: SurfaceKind,
        options: TargetOptions,
        max_height: u32,
    ) -> Option<SurfaceId> {
        let mut p = self.parts();
        p.targets.get_or_create(&mut p.env, desc, kind, options, max_height)
    }

    pub fn get_or_build(&mut self, desc: &TextureDescriptor, force_validate: bool) -> Option<MirrorId> {
        self.memory_targets
            .get_or_build(self.gpu.as_mut(), &self.store, &self.translator, desc, force_validate)
    }

    pub fn promote(&mut self, key: TargetKey) -> Option<SurfaceId> {
        let mut p = self.parts();
        p.targets.promote(&mut p.env, key)
    }

    pub fn resolve(&mut self, id: SurfaceId) -> bool {
        let mut p = self.parts();
        p.targets.resolve(&mut p.env, id)
    }

    pub fn update(&mut self, id: SurfaceId) -> bool {
        let mut p = self.parts();
        p.targets.update(&mut p.env, id)
    }

    /// Get everything a draw touches ready on the GPU.
    pub fn begin_draw(&mut self, request: &DrawRequest) -> DrawTargets {
        let texture_range = request.texture.map(|t| {
            self.translator.compute_byte_range(t.psm, 0, t.y, t.stride, t.height, t.base, t.stride)
        });
        self.reconcile(texture_range);

        let mut p = self.parts();
        let max_height = p.config.max_texture_height;

        let color = p.targets.get_or_create(&mut p.env, &request.frame, SurfaceKind::Color, TargetOptions::empty(), max_height);
        // Bound surfaces are never evicted, so making room for depth keeps the new colour target
        let previous_depth = p.targets.binding(request.context).depth;
        p.targets.bind(request.context, color, previous_depth);
        let depth = request.depth.and_then(|d| {
            let desc = FrameDescriptor {
                psm: d.psm,
                base: d.base,
                stride: request.frame.stride,
                height: request.frame.height,
                write_mask: 0,
            };
            p.targets.get_or_create(&mut p.env, &desc, SurfaceKind::Depth, TargetOptions::empty(), max_height)
        });

        for id in [color, depth].into_iter().flatten() {
            p.targets.update(&mut p.env, id);
        }
        p.targets.bind(request.context, color, depth);

        let texture = request.texture.and_then(|t| Self::texture_source(&mut p, &t, color));
        trace!("Draw on context {}: {:?} {:?} {:?}", request.context, color, depth, texture);

        DrawTargets { color, depth, texture }
    }

    fn texture_source(p: &mut Parts<'_>, t: &TextureDescriptor, color: Option<SurfaceId>) -> Option<TextureSource> {
        let translator = p.env.translator;
        let sampleable = translator.format(t.psm).is_ok_and(|f| f.can_render());
        let key = TargetKey { kind: SurfaceKind::Color, base: t.base, stride: t.stride };

        let rows_end = t.y.checked_add(t.height);
        let surface = p
            .targets
            .lookup(&key)
            .filter(|&id| sampleable && p.targets.get(id).zip(rows_end).is_some_and(|(s, end)| s.height >= end));

        if let Some(id) = surface {
            p.targets.update(&mut p.env, id);
            if Some(id) == color {
                let texture = p.targets.create_feedback(&mut p.env, id)?;
                return Some(TextureSource::Feedback { surface: id, texture });
            }

            let s = p.targets.get(id)?;
            return Some(TextureSource::Target { surface: id, texture: s.texture?, row_offset: s.row_offset() });
        }

        // Targets drawn over the texture have to reach local memory first
        let range = translator.compute_byte_range(t.psm, 0, t.y, t.stride, t.height, t.base, t.stride);
        for id in p.targets.intersecting(range) {
            p.targets.resolve(&mut p.env, id);
        }

        p.env
            .memory_targets
            .get_or_build(&mut *p.env.gpu, &*p.env.store, translator, t, false)
            .map(TextureSource::Mirror)
    }

    /// Primitives went to the surfaces bound on `context`.
    pub fn mark_drawn(&mut self, context: usize) {
        let binding = self.targets.binding(context);
        if let Some(color) = binding.color {
            self.targets.mark_drawn(color);
        }

        let (depth_write, _) = self.targets.depth_usage();
        if let (Some(depth), true) = (binding.depth, depth_write) {
            self.targets.mark_drawn(depth);
        }
    }

    /// Fill the bound colour target with one value, standing in for a draw.
    pub fn fill(&mut self, context: usize, value: u32) -> bool {
        let Some(color) = self.targets.binding(context).color else {
            return false;
        };
        let Some(surface) = self.targets.get(color) else {
            return false;
        };
        let Some(texture) = surface.texture else {
            return false;
        };

        let rect = TexRect::new(0, surface.row_offset(), surface.key.stride, surface.height);
        self.gpu.fill(texture, rect, value);
        self.targets.mark_drawn(color);
        true
    }

    /// Current bytes of `range`, with every target over it copied back.
    pub fn read_back(&mut self, range: ByteRange) -> Vec<u8> {
        self.reconcile(None);

        let range = range.clamp_to(ByteRange::full());
        let mut p = self.parts();
        for id in p.targets.intersecting(range) {
            p.targets.force_resolve(&mut p.env, id);
        }

        self.store.vram()[range.start as usize..range.end as usize].to_vec()
    }

    /// Local to local copy. Targets covering exactly the destination are
    /// refreshed right away.
    pub fn copy_local(&mut self, copy: &LocalCopy) -> Result<()> {
        let translator = &self.translator;
        let format = translator.format(copy.psm)?.clone();
        let src_range = translator.compute_byte_range(copy.psm, copy.src.x, copy.src.y, copy.width, copy.height, copy.src.base, copy.src.stride);
        let dst_range = translator.compute_byte_range(copy.psm, copy.dst.x, copy.dst.y, copy.width, copy.height, copy.dst.base, copy.dst.stride);

        self.reconcile(None);

        let mut p = self.parts();
        for id in p.targets.intersecting(src_range).into_iter().chain(p.targets.intersecting(dst_range)) {
            p.targets.force_resolve(&mut p.env, id);
        }

        let vram = self.store.vram_mut();
        let pixels: Vec<u32> = (0..copy.height)
            .flat_map(|y| (0..copy.width).map(move |x| (x, y)))
            .map(|(x, y)| load_pixel(vram, &format, copy.src.x + x, copy.src.y + y, copy.src.base, copy.src.stride))
            .collect();

        for (i, value) in pixels.into_iter().enumerate() {
            let (x, y) = (i as u32 % copy.width, i as u32 / copy.width);
            store_pixel(vram, &format, copy.dst.x + x, copy.dst.y + y, copy.dst.base, copy.dst.stride, value, 0);
        }

        debug!(
            "Local copy of {}x{} {} from 0x{:06X} to 0x{:06X}",
            copy.width, copy.height, format.name, copy.src.base, copy.dst.base
        );

        self.dirty.insert_range(dst_range);
        self.reconcile(None);

        let mut p = self.parts();
        let spanning: Vec<SurfaceId> = p
            .targets
            .intersecting(dst_range)
            .into_iter()
            .filter(|&id| p.targets.get(id).is_some_and(|s| s.range == dst_range))
            .collect();

        for id in spanning {
            p.targets.update(&mut p.env, id);
        }
        Ok(())
    }

    /// What presentation should read for a display buffer.
    pub fn scanout(&mut self, frame: &FrameDescriptor) -> ScanoutSource {
        self.reconcile(None);

        let range = self.translator.compute_byte_range(frame.psm, 0, 0, frame.stride, frame.height, frame.base, frame.stride);
        let mut p = self.parts();
        let Some(id) = p.targets.lookup(&frame.key(SurfaceKind::Color)) else {
            return ScanoutSource::BackingStore(range);
        };

        p.targets.update(&mut p.env, id);
        match p.targets.get(id) {
            Some(s) if !s.status.contains(TargetStatus::NEEDS_UPDATE) => match s.texture {
                Some(texture) => ScanoutSource::Surface { surface: id, texture, row_offset: s.row_offset() },
                None => ScanoutSource::BackingStore(range),
            },
            _ => ScanoutSource::BackingStore(range),
        }
    }

    pub fn end_frame(&mut self) {
        self.targets.end_frame();
        self.memory_targets.sweep(self.gpu.as_mut());
    }

    pub fn set_depth_usage(&mut self, write: bool, test: bool) {
        self.targets.set_depth_usage(write, test);
    }

    /// Local memory and palette, with every drawn target copied back first.
    pub fn save_state(&mut self) -> VramSnapshot {
        self.reconcile(None);

        let mut p = self.parts();
        let ids: Vec<SurfaceId> = p.targets.iter().map(|(id, _)| id).collect();
        for id in ids {
            p.targets.force_resolve(&mut p.env, id);
        }

        self.store.snapshot()
    }

    /// Load saved memory. Both caches start over empty.
    pub fn restore_state(&mut self, snapshot: &VramSnapshot) -> Result<()> {
        self.targets.clear(self.gpu.as_mut());
        self.memory_targets.clear(self.gpu.as_mut());
        self.dirty.clear();
        self.store.restore(snapshot)
    }
}
