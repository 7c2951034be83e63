/*
    Render target cache
*/

use std::collections::HashMap;
use std::num::NonZero;

use lru::LruCache;
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, trace, warn};

use super::{FrameDescriptor, SurfaceKind, TargetEnv, TargetKey, TargetOptions, TargetStatus};
use crate::config::VramConfig;
use crate::error::VramError;
use crate::format::{FormatTable, PixelFormatDescriptor};
use crate::gpu::{GpuBackend, TexRect, TextureId};
use crate::memory::translate::footprint;
use crate::memory::{AddressTranslator, ByteRange};

new_key_type! {
    pub struct SurfaceId;
}

const DEFAULT_RECYCLED: NonZero<usize> = NonZero::new(8).unwrap();

/// Storage shared with a parent surface, `row_offset` rows down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mimic {
    pub parent: SurfaceId,
    pub row_offset: u32,
}

#[derive(Debug)]
pub struct RenderTargetSurface {
    pub key: TargetKey,
    pub psm: u8,
    pub height: u32,
    pub range: ByteRange,
    pub status: TargetStatus,
    pub last_used: u64,
    pub write_mask: u32,
    /// `None` while virtual
    pub texture: Option<TextureId>,
    pub feedback: Option<TextureId>,
    pub mimic: Option<Mimic>,
    pub(super) update_source: Option<SurfaceId>,
    /// Layout the texels are in, which lags `psm` until a pending conversion runs
    pub(super) texel_psm: u8,
}

impl RenderTargetSurface {
    pub fn kind(&self) -> SurfaceKind {
        self.key.kind
    }

    pub fn is_virtual(&self) -> bool {
        self.status.contains(TargetStatus::VIRTUAL)
    }

    pub fn row_offset(&self) -> u32 {
        self.mimic.map_or(0, |m| m.row_offset)
    }

    pub fn texel_psm(&self) -> u8 {
        self.texel_psm
    }
}

/// Surfaces bound by one GS drawing context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawBinding {
    pub color: Option<SurfaceId>,
    pub depth: Option<SurfaceId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub created: u64,
    pub hits: u64,
    pub virtual_created: u64,
    pub promoted: u64,
    pub mimics: u64,
    pub evicted: u64,
    pub recycled_reuses: u64,
    pub full_resolves: u64,
    pub partial_resolves: u64,
    pub skipped_resolves: u64,
    pub gpu_updates: u64,
    pub memory_updates: u64,
    pub conversions: u64,
    pub allocation_failures: u64,
}

/// Point a surface at a new storage mode. Texels are converted lazily when
/// the bit depth class changes.
fn reinterpret(surface: &mut RenderTargetSurface, formats: &FormatTable, format: &PixelFormatDescriptor) {
    surface.status.remove(TargetStatus::CONVERT);

    if surface.texel_psm != format.psm {
        if surface.status.contains(TargetStatus::NEEDS_UPDATE) || formats.same_half_class(surface.texel_psm, format.psm) {
            surface.texel_psm = format.psm;
        } else if format.is_half() {
            surface.status.insert(TargetStatus::NEEDS_CONVERT16);
        } else {
            surface.status.insert(TargetStatus::NEEDS_CONVERT32);
        }
    }

    surface.psm = format.psm;
    surface.range = footprint(format, 0, 0, surface.key.stride, surface.height, surface.key.base, surface.key.stride);
}

pub struct RenderTargetCache {
    pub(super) surfaces: SlotMap<SurfaceId, RenderTargetSurface>,
    by_key: HashMap<TargetKey, SurfaceId>,
    virtual_by_key: HashMap<TargetKey, SurfaceId>,
    /// Storage of retired surfaces, keyed by kind and texture size
    recycled: LruCache<(SurfaceKind, u32, u32), TextureId>,
    bindings: [DrawBinding; 2],
    pub(super) config: VramConfig,
    clock: u64,
    pub(super) resolves_this_frame: u32,
    pub(super) depth_write: bool,
    pub(super) depth_test: bool,
    pub(super) stats: TargetStats,
}

impl RenderTargetCache {
    pub fn new(config: &VramConfig) -> Self {
        RenderTargetCache {
            surfaces: SlotMap::with_key(),
            by_key: HashMap::new(),
            virtual_by_key: HashMap::new(),
            recycled: LruCache::new(NonZero::new(config.recycled_pool_capacity).unwrap_or(DEFAULT_RECYCLED)),
            bindings: [DrawBinding::default(); 2],
            config: config.clone(),
            clock: 0,
            resolves_this_frame: 0,
            depth_write: true,
            depth_test: true,
            stats: TargetStats::default(),
        }
    }

    pub fn get(&self, id: SurfaceId) -> Option<&RenderTargetSurface> {
        self.surfaces.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SurfaceId, &RenderTargetSurface)> {
        self.surfaces.iter()
    }

    /// Presentation lookup. Never creates and never returns a virtual surface.
    pub fn lookup(&self, key: &TargetKey) -> Option<SurfaceId> {
        self.by_key.get(key).copied()
    }

    pub fn lookup_virtual(&self, key: &TargetKey) -> Option<SurfaceId> {
        self.virtual_by_key.get(key).copied()
    }

    pub fn stats(&self) -> TargetStats {
        self.stats
    }

    pub fn recycled_len(&self) -> usize {
        self.recycled.len()
    }

    /// Surfaces with storage of their own.
    pub fn live_count(&self) -> usize {
        self.surfaces
            .values()
            .filter(|s| s.texture.is_some() && s.mimic.is_none())
            .count()
    }

    /// Non-virtual surfaces whose footprint overlaps `range`.
    pub fn intersecting(&self, range: ByteRange) -> Vec<SurfaceId> {
        self.surfaces
            .iter()
            .filter(|(_, s)| !s.is_virtual() && s.range.intersects(range))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn bind(&mut self, context: usize, color: Option<SurfaceId>, depth: Option<SurfaceId>) {
        self.bindings[context & 1] = DrawBinding { color, depth };
    }

    pub fn binding(&self, context: usize) -> DrawBinding {
        self.bindings[context & 1]
    }

    /// Bound surfaces, and the parents of bound mimics, are never evicted.
    pub fn is_bound(&self, id: SurfaceId) -> bool {
        self.bindings
            .iter()
            .flat_map(|b| [b.color, b.depth])
            .flatten()
            .any(|bound| bound == id || self.surfaces.get(bound).and_then(|s| s.mimic).is_some_and(|m| m.parent == id))
    }

    pub fn set_depth_usage(&mut self, write: bool, test: bool) {
        self.depth_write = write;
        self.depth_test = test;
    }

    /// Current (write, test) state of the depth buffer.
    pub fn depth_usage(&self) -> (bool, bool) {
        (self.depth_write, self.depth_test)
    }

    pub fn end_frame(&mut self) {
        self.resolves_this_frame = 0;
    }

    /// The surface now holds draws local memory has not seen.
    pub fn mark_drawn(&mut self, id: SurfaceId) {
        let Some(surface) = self.surfaces.get_mut(id) else {
            return;
        };

        surface.status.remove(TargetStatus::RESOLVED | TargetStatus::FEEDBACK_READY);
        let parent = surface.mimic.map(|m| m.parent);

        if let Some(parent) = parent.and_then(|p| self.surfaces.get_mut(p)) {
            parent.status.remove(TargetStatus::RESOLVED | TargetStatus::FEEDBACK_READY);
        }
    }

    pub fn mark_status(&mut self, id: SurfaceId, status: TargetStatus) {
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.status.insert(status);
        }
    }

    /// Find the surface for `desc`, creating, promoting or replacing one as needed.
    pub fn get_or_create(
        &mut self,
        env: &mut TargetEnv<'_>,
        desc: &FrameDescriptor,
        kind: SurfaceKind,
        options: TargetOptions,
        max_height: u32,
    ) -> Option<SurfaceId> {
        let translator = env.translator;
        let format = match translator.format(desc.psm) {
            Ok(format) if format.can_render() => format,
            Ok(_) => {
                warn!("{}", VramError::UnsupportedTargetFormat { psm: desc.psm });
                return None;
            }
            Err(err) => {
                warn!("Render target at 0x{:06X}: {}", desc.base, err);
                return None;
            }
        };

        if desc.stride == 0 || desc.height == 0 {
            return None;
        }

        let key = desc.key(kind);
        self.clock += 1;

        let mut replaced = None;
        if let Some(&id) = self.by_key.get(&key) {
            if self.accepts(id, desc, options, max_height) {
                self.refresh_hit(translator, id, desc, format);
                return Some(id);
            }
            replaced = Some(id);
        }

        if options.contains(TargetOptions::VIRTUAL) {
            if let Some(old) = replaced {
                self.retire(env, old, true);
            }

            if let Some(&vid) = self.virtual_by_key.get(&key) {
                self.reshape(translator, vid, desc);
                return Some(vid);
            }

            return Some(self.create_virtual(desc, kind, format));
        }

        if let Some(&vid) = self.virtual_by_key.get(&key) {
            if let Some(old) = replaced {
                self.retire(env, old, true);
            }
            self.reshape(translator, vid, desc);
            return self.promote(env, key);
        }

        self.create(env, desc, kind, options, format, replaced)
    }

    fn accepts(&self, id: SurfaceId, desc: &FrameDescriptor, options: TargetOptions, max_height: u32) -> bool {
        let Some(surface) = self.surfaces.get(id) else {
            return false;
        };

        if options.contains(TargetOptions::STRICT_HEIGHT) {
            return surface.height == desc.height;
        }

        (surface.height >= desc.height || desc.height > self.config.height_tolerance)
            && surface.height <= max_height.max(desc.height)
    }

    fn refresh_hit(&mut self, translator: &AddressTranslator, id: SurfaceId, desc: &FrameDescriptor, format: &PixelFormatDescriptor) {
        let newer = self.newer_encloser(translator.formats(), id);
        let clock = self.clock;
        let Some(surface) = self.surfaces.get_mut(id) else {
            return;
        };

        if surface.psm != desc.psm {
            reinterpret(surface, translator.formats(), format);
            if surface.status.intersects(TargetStatus::CONVERT) {
                debug!("Target 0x{:06X} reinterpreted as {}, conversion pending", desc.base, format.name);
            }
        }

        surface.write_mask &= desc.write_mask;
        surface.last_used = clock;

        if let Some(source) = newer {
            trace!("Target 0x{:06X} is enclosed by a newer surface, refreshing from it", desc.base);
            surface.status.remove(TargetStatus::RESOLVED);
            surface.status.insert(TargetStatus::NEEDS_UPDATE);
            surface.update_source = Some(source);
        }

        self.stats.hits += 1;
    }

    /// Apply a request's format and height to a virtual surface.
    fn reshape(&mut self, translator: &AddressTranslator, id: SurfaceId, desc: &FrameDescriptor) {
        let clock = self.clock;
        let Some(surface) = self.surfaces.get_mut(id) else {
            return;
        };

        if let Ok(format) = translator.format(desc.psm) {
            surface.psm = desc.psm;
            surface.texel_psm = desc.psm;
            surface.height = surface.height.max(desc.height);
            surface.range = footprint(format, 0, 0, desc.stride, surface.height, desc.base, desc.stride);
        }
        surface.write_mask &= desc.write_mask;
        surface.last_used = clock;
    }

    /// Row in `source`'s texture where a buffer at `base` starts, if the two
    /// share a layout and `source` holds all `height` rows.
    pub(super) fn source_row(
        formats: &FormatTable,
        source: &RenderTargetSurface,
        psm: u8,
        base: u32,
        stride: u32,
        height: u32,
    ) -> Option<u32> {
        if source.key.stride != stride
            || source.texture.is_none()
            || source.status.intersects(TargetStatus::CONVERT | TargetStatus::VIRTUAL)
            || !formats.same_half_class(source.texel_psm, psm)
            || base < source.key.base
        {
            return None;
        }

        let format = formats.get(psm)?;
        let row_bytes = format.page_row_bytes(stride);
        let delta = (base - source.key.base) as u64;
        if delta % row_bytes != 0 {
            return None;
        }

        let rows = (delta / row_bytes) as u32 * format.page_height;
        (rows + height <= source.height).then_some(source.row_offset() + rows)
    }

    fn newer_encloser(&self, formats: &FormatTable, id: SurfaceId) -> Option<SurfaceId> {
        let surface = self.surfaces.get(id)?;
        if surface.is_virtual() {
            return None;
        }

        self.surfaces
            .iter()
            .filter(|&(other_id, other)| {
                other_id != id
                    && other.key.kind == surface.key.kind
                    && other.last_used > surface.last_used
                    && other.texture != surface.texture
                    && !other.status.contains(TargetStatus::NEEDS_UPDATE)
                    && other.range.contains_range(surface.range)
                    && Self::source_row(formats, other, surface.psm, surface.key.base, surface.key.stride, surface.height)
                        .is_some()
            })
            .max_by_key(|(_, other)| other.last_used)
            .map(|(other_id, _)| other_id)
    }

    fn create_virtual(&mut self, desc: &FrameDescriptor, kind: SurfaceKind, format: &PixelFormatDescriptor) -> SurfaceId {
        let key = desc.key(kind);
        let id = self.surfaces.insert(RenderTargetSurface {
            key,
            psm: desc.psm,
            height: desc.height,
            range: footprint(format, 0, 0, desc.stride, desc.height, desc.base, desc.stride),
            status: TargetStatus::VIRTUAL | TargetStatus::NEEDS_UPDATE,
            last_used: self.clock,
            write_mask: desc.write_mask,
            texture: None,
            feedback: None,
            mimic: None,
            update_source: None,
            texel_psm: desc.psm,
        });

        trace!("Tracking virtual target at 0x{:06X}", desc.base);
        self.virtual_by_key.insert(key, id);
        self.stats.virtual_created += 1;
        id
    }

    fn create(
        &mut self,
        env: &mut TargetEnv<'_>,
        desc: &FrameDescriptor,
        kind: SurfaceKind,
        options: TargetOptions,
        format: &PixelFormatDescriptor,
        replaced: Option<SurfaceId>,
    ) -> Option<SurfaceId> {
        let translator = env.translator;
        let formats = translator.formats();
        let range = footprint(format, 0, 0, desc.stride, desc.height, desc.base, desc.stride);

        if self.config.partial_pointers
            && replaced.is_none()
            && !options.contains(TargetOptions::STRICT_HEIGHT)
            && desc.height <= self.config.mimic_max_height
        {
            if let Some(id) = self.create_mimic(formats, desc, kind, range) {
                return Some(id);
            }
        }

        let enclosers: Vec<SurfaceId> = self
            .surfaces
            .iter()
            .filter(|(_, s)| {
                s.key.kind == kind
                    && s.mimic.is_none()
                    && s.range.contains_range(range)
                    && Self::source_row(formats, s, desc.psm, desc.base, desc.stride, desc.height).is_some()
            })
            .map(|(id, _)| id)
            .collect();

        if let (Some(old), [single]) = (replaced, enclosers.as_slice()) {
            if *single == old {
                return self.replace_in_place(env, desc, kind, format, range, old);
            }
        }

        if let Some(old) = replaced {
            self.retire(env, old, true);
        }

        let source = match enclosers.iter().filter(|&&id| Some(id) != replaced).collect::<Vec<_>>().as_slice() {
            [single] => Some(**single),
            _ => {
                self.resolve_intersecting(env, range, kind);
                None
            }
        };

        let protect: Vec<SurfaceId> = source.into_iter().collect();
        self.make_room(env, &protect);

        let texture = self.allocate(env, kind, desc.stride, desc.height, &protect)?;
        let status = match source {
            Some(_) => TargetStatus::NEEDS_UPDATE,
            None => TargetStatus::NEEDS_UPDATE | TargetStatus::RESOLVED,
        };

        let id = self.insert_surface(desc, kind, range, status, texture);
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.update_source = source;
        }

        trace!(
            "Created {:?} target {} at 0x{:06X} stride {} height {}{}",
            kind,
            format.name,
            desc.base,
            desc.stride,
            desc.height,
            if source.is_some() { ", filled from an enclosing surface" } else { "" }
        );
        Some(id)
    }

    /// New storage for an existing key, seeded straight from the surface it replaces.
    fn replace_in_place(
        &mut self,
        env: &mut TargetEnv<'_>,
        desc: &FrameDescriptor,
        kind: SurfaceKind,
        format: &PixelFormatDescriptor,
        range: ByteRange,
        old: SurfaceId,
    ) -> Option<SurfaceId> {
        self.make_room(env, &[old]);
        let texture = self.allocate(env, kind, desc.stride, desc.height, &[old])?;

        let (status, texel_psm) = match self.surfaces.get(old) {
            Some(prev) => {
                if let Some(src) = prev.texture {
                    let rect = TexRect::new(0, prev.row_offset(), desc.stride, desc.height.min(prev.height));
                    env.gpu.copy_texture(src, rect, texture, 0, 0);
                }
                (
                    prev.status & (TargetStatus::RESOLVED | TargetStatus::NEEDS_UPDATE | TargetStatus::CONVERT),
                    prev.texel_psm,
                )
            }
            None => (TargetStatus::NEEDS_UPDATE | TargetStatus::RESOLVED, desc.psm),
        };

        self.retire(env, old, false);

        let id = self.insert_surface(desc, kind, range, status, texture);
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.texel_psm = texel_psm;
            reinterpret(surface, env.translator.formats(), format);
        }

        trace!("Replaced target at 0x{:06X} with a {} row surface", desc.base, desc.height);
        Some(id)
    }

    fn insert_surface(
        &mut self,
        desc: &FrameDescriptor,
        kind: SurfaceKind,
        range: ByteRange,
        status: TargetStatus,
        texture: TextureId,
    ) -> SurfaceId {
        let key = desc.key(kind);
        let id = self.surfaces.insert(RenderTargetSurface {
            key,
            psm: desc.psm,
            height: desc.height,
            range,
            status,
            last_used: self.clock,
            write_mask: desc.write_mask,
            texture: Some(texture),
            feedback: None,
            mimic: None,
            update_source: None,
            texel_psm: desc.psm,
        });

        self.by_key.insert(key, id);
        self.stats.created += 1;
        id
    }

    fn create_mimic(&mut self, formats: &FormatTable, desc: &FrameDescriptor, kind: SurfaceKind, range: ByteRange) -> Option<SurfaceId> {
        let (parent, row_offset) = self
            .surfaces
            .iter()
            .filter(|(_, s)| s.key.kind == kind && s.mimic.is_none() && s.range.contains_range(range))
            .filter_map(|(id, s)| {
                Self::source_row(formats, s, desc.psm, desc.base, desc.stride, desc.height)
                    .filter(|&row| row > 0)
                    .map(|row| (id, row, s.last_used))
            })
            .max_by_key(|&(_, _, used)| used)
            .map(|(id, row, _)| (id, row))?;

        let (texture, status, texel_psm) = {
            let p = self.surfaces.get(parent)?;
            (p.texture, p.status & (TargetStatus::RESOLVED | TargetStatus::NEEDS_UPDATE), p.texel_psm)
        };

        let key = desc.key(kind);
        let id = self.surfaces.insert(RenderTargetSurface {
            key,
            psm: desc.psm,
            height: desc.height,
            range,
            status,
            last_used: self.clock,
            write_mask: desc.write_mask,
            texture,
            feedback: None,
            mimic: Some(Mimic { parent, row_offset }),
            update_source: None,
            texel_psm,
        });

        debug!("Target at 0x{:06X} shares storage {} rows into its parent", desc.base, row_offset);
        self.by_key.insert(key, id);
        self.stats.mimics += 1;
        Some(id)
    }

    /// Resolve everything overlapping `range` and retire the unbound surfaces of `kind`.
    fn resolve_intersecting(&mut self, env: &mut TargetEnv<'_>, range: ByteRange, kind: SurfaceKind) {
        for id in self.intersecting(range) {
            let Some(surface) = self.surfaces.get(id) else {
                continue;
            };
            let (same_kind, is_mimic) = (surface.key.kind == kind, surface.mimic.is_some());

            self.resolve(env, id);
            if same_kind && !is_mimic && !self.is_bound(id) {
                self.retire(env, id, false);
            }
        }
    }

    /// Turn a virtual surface into a real one.
    pub fn promote(&mut self, env: &mut TargetEnv<'_>, key: TargetKey) -> Option<SurfaceId> {
        let vid = *self.virtual_by_key.get(&key)?;
        let (range, stride, height) = {
            let surface = self.surfaces.get(vid)?;
            (surface.range, surface.key.stride, surface.height)
        };

        // Real surfaces kept drawing while this one was only tracked
        for id in self.intersecting(range) {
            self.resolve(env, id);
        }

        if let Some(&existing) = self.by_key.get(&key) {
            self.virtual_by_key.remove(&key);
            self.surfaces.remove(vid);
            return Some(existing);
        }

        self.make_room(env, &[]);
        let Some(texture) = self.allocate(env, key.kind, stride, height, &[]) else {
            warn!("Virtual target at 0x{:06X} stays virtual, no storage", key.base);
            return None;
        };

        self.virtual_by_key.remove(&key);
        let clock = self.clock;
        if let Some(surface) = self.surfaces.get_mut(vid) {
            surface.texture = Some(texture);
            surface.status.remove(TargetStatus::VIRTUAL);
            surface.status.insert(TargetStatus::NEEDS_UPDATE | TargetStatus::RESOLVED);
            surface.last_used = clock;
        }

        self.by_key.insert(key, vid);
        self.stats.promoted += 1;
        trace!("Promoted virtual target at 0x{:06X}", key.base);
        Some(vid)
    }

    /// Remove a surface and its mimics, recycling its storage.
    pub fn retire(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId, resolve_first: bool) {
        if resolve_first {
            self.resolve(env, id);
        }

        self.destroy_children(env, id);

        let Some(surface) = self.surfaces.remove(id) else {
            return;
        };

        if self.by_key.get(&surface.key) == Some(&id) {
            self.by_key.remove(&surface.key);
        }
        if self.virtual_by_key.get(&surface.key) == Some(&id) {
            self.virtual_by_key.remove(&surface.key);
        }

        for binding in self.bindings.iter_mut() {
            if binding.color == Some(id) {
                binding.color = None;
            }
            if binding.depth == Some(id) {
                binding.depth = None;
            }
        }

        if let Some(feedback) = surface.feedback {
            env.gpu.destroy_texture(feedback);
        }

        if surface.mimic.is_none() {
            if let Some(texture) = surface.texture {
                self.recycle(&mut *env.gpu, surface.key.kind, texture);
            }
        }
    }

    /// Drop every mimic of `parent` in one pass.
    pub fn destroy_children(&mut self, env: &mut TargetEnv<'_>, parent: SurfaceId) {
        let children: Vec<SurfaceId> = self
            .surfaces
            .iter()
            .filter(|(_, s)| s.mimic.is_some_and(|m| m.parent == parent))
            .map(|(id, _)| id)
            .collect();

        for child in children {
            self.retire(env, child, false);
        }
    }

    fn recycle(&mut self, gpu: &mut dyn GpuBackend, kind: SurfaceKind, texture: TextureId) {
        let Some((width, height)) = gpu.texture_size(texture) else {
            return;
        };

        if let Some((_, displaced)) = self.recycled.push((kind, width, height), texture) {
            if displaced != texture {
                gpu.destroy_texture(displaced);
            }
        }
    }

    fn make_room(&mut self, env: &mut TargetEnv<'_>, protect: &[SurfaceId]) {
        while self.live_count() >= self.config.render_target_cap {
            let Some(victim) = self.oldest_evictable(protect) else {
                break;
            };

            trace!("Evicting least recently used target {:?}", victim);
            self.stats.evicted += 1;
            self.retire(env, victim, true);
        }
    }

    fn oldest_evictable(&self, protect: &[SurfaceId]) -> Option<SurfaceId> {
        self.surfaces
            .iter()
            .filter(|(id, s)| {
                s.texture.is_some() && s.mimic.is_none() && !protect.contains(id) && !self.is_bound(*id)
            })
            .min_by_key(|(_, s)| s.last_used)
            .map(|(id, _)| id)
    }

    /// Storage for a new surface: recycled first, then fresh, reclaiming
    /// pools and evicting until the device gives in or nothing is left.
    fn allocate(
        &mut self,
        env: &mut TargetEnv<'_>,
        kind: SurfaceKind,
        width: u32,
        height: u32,
        protect: &[SurfaceId],
    ) -> Option<TextureId> {
        if let Some(texture) = self.recycled.pop(&(kind, width, height)) {
            self.stats.recycled_reuses += 1;
            return Some(texture);
        }

        loop {
            let err = match env.gpu.create_texture(width, height) {
                Ok(texture) => return Some(texture),
                Err(err) => err,
            };

            if let Some((_, texture)) = self.recycled.pop_lru() {
                env.gpu.destroy_texture(texture);
                continue;
            }

            if env.memory_targets.release_for_allocation(&mut *env.gpu) {
                continue;
            }

            if let Some(victim) = self.oldest_evictable(protect) {
                self.stats.evicted += 1;
                self.retire(env, victim, true);
                continue;
            }

            self.stats.allocation_failures += 1;
            warn!("Render target skipped, every pool is exhausted: {}", err);
            return None;
        }
    }

    /// Drop every surface without writing anything back.
    pub fn clear(&mut self, gpu: &mut dyn GpuBackend) {
        for (_, surface) in self.surfaces.drain() {
            if let Some(feedback) = surface.feedback {
                gpu.destroy_texture(feedback);
            }
            if let (None, Some(texture)) = (surface.mimic, surface.texture) {
                gpu.destroy_texture(texture);
            }
        }

        while let Some((_, texture)) = self.recycled.pop_lru() {
            gpu.destroy_texture(texture);
        }

        self.by_key.clear();
        self.virtual_by_key.clear();
        self.bindings = [DrawBinding::default(); 2];
    }
}
