/*
    Texture mirrors of local memory used as sampling sources
*/

use std::cmp::Reverse;
use std::collections::VecDeque;

use slotmap::{new_key_type, SlotMap};
use tracing::{debug, trace, warn};

use crate::config::VramConfig;
use crate::error::VramError;
use crate::format::{psm, PixelFormatDescriptor};
use crate::gpu::{GpuBackend, TexRect, TextureId};
use crate::memory::translate::{footprint, load_pixel, palette_index};
use crate::memory::{AddressTranslator, BackingStore, ByteRange};

new_key_type! {
    pub struct MirrorId;
}

/// TEX0.CSA is five bits wide
const CSA_MASK: u32 = 0x1F;

/// CLUT selection for indexed textures (TEX0 CPSM/CSA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClutDescriptor {
    pub cpsm: u8,
    /// Palette offset in units of 16 entries, only the low five bits count
    pub csa: u32,
}

/// Rows `[y, y + height)` of a buffer, full stride wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub psm: u8,
    pub base: u32,
    pub stride: u32,
    pub y: u32,
    pub height: u32,
    pub clut: Option<ClutDescriptor>,
}

#[derive(Debug)]
pub struct MemoryTargetSurface {
    pub psm: u8,
    pub base: u32,
    pub stride: u32,
    /// Rows currently mirrored, always inside the allocated rows
    pub start_y: u32,
    pub height: u32,
    pub real_y: u32,
    pub real_height: u32,
    pub texture: TextureId,
    pub tex_width: u32,
    pub tex_height: u32,
    /// Row blocks laid side by side when the mirror is taller than a texture may be
    pub width_multiplier: u32,
    pub clut: Option<ClutDescriptor>,
    palette: Option<Vec<u8>>,
    /// Pending invalidation window, empty when `clear_max_y <= clear_min_y`
    clear_min_y: u32,
    clear_max_y: u32,
    page_height: u32,
    page_row_bytes: u64,
    footprint: ByteRange,
    /// Local memory bytes the texture was built from
    contents: Vec<u8>,
    pub validate_count: u32,
    last_used: u64,
    used_frame: u64,
}

impl MemoryTargetSurface {
    pub fn end_y(&self) -> u32 {
        self.start_y + self.height
    }

    pub fn covers(&self, y: u32, height: u32) -> bool {
        y.checked_add(height).is_some_and(|end| self.start_y <= y && end <= self.end_y())
    }

    pub fn footprint(&self) -> ByteRange {
        self.footprint
    }

    pub fn pending(&self) -> Option<(u32, u32)> {
        (self.clear_max_y > self.clear_min_y).then_some((self.clear_min_y, self.clear_max_y))
    }

    fn clear_pending(&mut self) {
        self.clear_min_y = 0;
        self.clear_max_y = 0;
    }

    /// Texture position of a mirrored row.
    pub fn texel_row(&self, y: u32) -> (u32, u32) {
        let row = y - self.real_y;
        ((row / self.tex_height) * self.stride, row % self.tex_height)
    }
}

#[derive(Debug)]
struct PooledTexture {
    texture: TextureId,
    width: u32,
    height: u32,
    freed_frame: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryTargetStats {
    pub hits: u64,
    pub misses: u64,
    pub validations: u64,
    pub inconclusive: u64,
    pub narrowed: u64,
    pub destroyed: u64,
    pub pool_reuses: u64,
}

enum Compare {
    Match,
    Mismatch,
}

pub struct MemoryTargetCache {
    surfaces: SlotMap<MirrorId, MemoryTargetSurface>,
    pool: VecDeque<PooledTexture>,
    config: VramConfig,
    tick: u64,
    frame: u64,
    stats: MemoryTargetStats,
}

impl MemoryTargetCache {
    pub fn new(config: &VramConfig) -> Self {
        MemoryTargetCache {
            surfaces: SlotMap::with_key(),
            pool: VecDeque::new(),
            config: config.clone(),
            tick: 0,
            frame: 0,
            stats: MemoryTargetStats::default(),
        }
    }

    pub fn get(&self, id: MirrorId) -> Option<&MemoryTargetSurface> {
        self.surfaces.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MirrorId, &MemoryTargetSurface)> {
        self.surfaces.iter()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn stats(&self) -> MemoryTargetStats {
        self.stats
    }

    /// Find a mirror covering `desc`, or build one from local memory.
    pub fn get_or_build(
        &mut self,
        gpu: &mut dyn GpuBackend,
        store: &BackingStore,
        translator: &AddressTranslator,
        desc: &TextureDescriptor,
        force_validate: bool,
    ) -> Option<MirrorId> {
        let format = match translator.format(desc.psm) {
            Ok(format) => format,
            Err(err) => {
                warn!("Cannot mirror texture at 0x{:06X}: {}", desc.base, err);
                return None;
            }
        };

        if desc.height == 0 || desc.stride == 0 {
            return None;
        }

        // Whole page rows past the last requested row must stay addressable
        let rows_end = desc.y.checked_add(desc.height).and_then(|end| end.checked_next_multiple_of(format.page_height));
        if rows_end.is_none() {
            warn!("Texture rows {}+{} at 0x{:06X} are out of range", desc.y, desc.height, desc.base);
            return None;
        }

        let palette = format
            .indexed
            .then(|| palette_bytes(store.clut(), format, desc.clut.unwrap_or_default()));

        self.tick += 1;

        let mut candidates: Vec<(MirrorId, u64)> = self
            .surfaces
            .iter()
            .filter(|(_, s)| s.base == desc.base && s.stride == desc.stride && s.covers(desc.y, desc.height))
            .map(|(id, s)| (id, s.last_used))
            .collect();
        candidates.sort_by_key(|&(_, used)| Reverse(used));

        for (id, _) in candidates {
            if let Compare::Mismatch = self.compare(gpu, id, desc, palette.as_deref()) {
                continue;
            }

            if !self.settle_pending(gpu, store, id, desc, force_validate) {
                continue;
            }

            if let Some(surface) = self.surfaces.get_mut(id) {
                surface.last_used = self.tick;
                surface.used_frame = self.frame;
            }
            self.stats.hits += 1;
            return Some(id);
        }

        self.stats.misses += 1;
        self.build(gpu, store, format, desc, palette)
    }

    fn compare(&mut self, gpu: &mut dyn GpuBackend, id: MirrorId, desc: &TextureDescriptor, palette: Option<&[u8]>) -> Compare {
        let threshold = self.config.validate_threshold;
        let Some(surface) = self.surfaces.get_mut(id) else {
            return Compare::Mismatch;
        };

        if surface.psm != desc.psm {
            surface.validate_count += 1;
            if surface.validate_count > threshold {
                trace!("Mirror at 0x{:06X} reinterpreted too often, destroying", surface.base);
                self.destroy(gpu, id);
            }
            return Compare::Mismatch;
        }

        if let Some(palette) = palette {
            // Past the threshold the palette is not even compared
            if surface.validate_count > threshold {
                return Compare::Mismatch;
            }

            if surface.clut != Some(desc.clut.unwrap_or_default()) || surface.palette.as_deref() != Some(palette) {
                surface.validate_count += 1;
                return Compare::Mismatch;
            }
        }

        Compare::Match
    }

    /// Apply the pending invalidation window. Returns false when the mirror
    /// can no longer serve `desc`.
    fn settle_pending(
        &mut self,
        gpu: &mut dyn GpuBackend,
        store: &BackingStore,
        id: MirrorId,
        desc: &TextureDescriptor,
        force_validate: bool,
    ) -> bool {
        let threshold = self.config.validate_threshold;
        let Some(surface) = self.surfaces.get_mut(id) else {
            return false;
        };

        let Some((min_y, max_y)) = surface.pending() else {
            return true;
        };

        if force_validate {
            self.stats.validations += 1;
            surface.validate_count += 1;

            if surface.validate_count > threshold {
                self.stats.inconclusive += 1;
                debug!(
                    "Mirror at 0x{:06X}: {}, assuming dirty",
                    surface.base,
                    VramError::ValidationInconclusive
                );
            } else if window_unchanged(surface, store, min_y, max_y) {
                surface.clear_pending();
                return true;
            }
        }

        // Keep whichever untouched side still serves the request
        if desc.y + desc.height <= min_y && desc.y >= surface.start_y {
            surface.height = min_y - surface.start_y;
            surface.clear_pending();
            self.stats.narrowed += 1;
            true
        } else if desc.y >= max_y && desc.y + desc.height <= surface.end_y() {
            surface.height = surface.end_y() - max_y;
            surface.start_y = max_y;
            surface.clear_pending();
            self.stats.narrowed += 1;
            true
        } else {
            self.destroy(gpu, id);
            false
        }
    }

    fn build(
        &mut self,
        gpu: &mut dyn GpuBackend,
        store: &BackingStore,
        format: &PixelFormatDescriptor,
        desc: &TextureDescriptor,
        palette: Option<Vec<u8>>,
    ) -> Option<MirrorId> {
        let ph = format.page_height;
        let real_y = desc.y / ph * ph;
        let real_height = (desc.y + desc.height).div_ceil(ph) * ph - real_y;

        let width_multiplier = real_height.div_ceil(self.config.max_texture_height).max(1);
        let tex_width = desc.stride * width_multiplier;
        let tex_height = real_height.div_ceil(width_multiplier);

        let texture = self.acquire_texture(gpu, tex_width, tex_height)?;

        let mut texels = vec![0u32; tex_width as usize * tex_height as usize];
        for row in 0..real_height {
            let y = real_y + row;
            let x_offset = (row / tex_height) * desc.stride;
            let line = (row % tex_height) as usize * tex_width as usize + x_offset as usize;

            for x in 0..desc.stride {
                let raw = load_pixel(store.vram(), format, x, y, desc.base, desc.stride);
                texels[line + x as usize] = match (&palette, desc.clut) {
                    (Some(palette), clut) => lookup_palette(palette, clut.unwrap_or_default(), palette_index(format, raw)),
                    (None, _) => raw,
                };
            }
        }
        gpu.upload(texture, TexRect::new(0, 0, tex_width, tex_height), &texels);

        let range = footprint(format, 0, real_y, desc.stride, real_height, desc.base, desc.stride);
        let contents = store.vram()[range.start as usize..range.end as usize].to_vec();

        trace!(
            "Built mirror of {} at 0x{:06X} rows {}..{} ({}x{} texture)",
            format.name,
            desc.base,
            real_y,
            real_y + real_height,
            tex_width,
            tex_height
        );

        let id = self.surfaces.insert(MemoryTargetSurface {
            psm: desc.psm,
            base: desc.base,
            stride: desc.stride,
            start_y: real_y,
            height: real_height,
            real_y,
            real_height,
            texture,
            tex_width,
            tex_height,
            width_multiplier,
            clut: if format.indexed { Some(desc.clut.unwrap_or_default()) } else { None },
            palette,
            clear_min_y: 0,
            clear_max_y: 0,
            page_height: ph,
            page_row_bytes: format.page_row_bytes(desc.stride),
            footprint: range,
            contents,
            validate_count: 0,
            last_used: self.tick,
            used_frame: self.frame,
        });

        Some(id)
    }

    fn acquire_texture(&mut self, gpu: &mut dyn GpuBackend, width: u32, height: u32) -> Option<TextureId> {
        if let Some(pos) = self.pool.iter().position(|p| p.width == width && p.height == height) {
            self.stats.pool_reuses += 1;
            return self.pool.remove(pos).map(|p| p.texture);
        }

        loop {
            match gpu.create_texture(width, height) {
                Ok(texture) => return Some(texture),
                Err(err) => {
                    if let Some(pooled) = self.pool.pop_front() {
                        gpu.destroy_texture(pooled.texture);
                        continue;
                    }

                    if self.destroy_oldest(gpu) {
                        continue;
                    }

                    warn!("Texture mirror skipped: {}", err);
                    return None;
                }
            }
        }
    }

    /// Lazily invalidate every mirror overlapping `range`.
    pub fn clear_range(&mut self, range: ByteRange) -> usize {
        let mut touched = 0;

        for surface in self.surfaces.values_mut() {
            if !surface.footprint.intersects(range) {
                continue;
            }

            let lo = range.start.max(surface.footprint.start) - surface.base;
            let hi = range.end.min(surface.footprint.end) - surface.base;
            let ph = surface.page_height as u64;

            let first = (lo as u64 / surface.page_row_bytes * ph) as u32;
            let last = ((hi as u64 - 1) / surface.page_row_bytes * ph + ph) as u32;

            let min_y = first.max(surface.start_y);
            let max_y = last.min(surface.end_y());
            if max_y <= min_y {
                continue;
            }

            match surface.pending() {
                Some((cur_min, cur_max)) => {
                    surface.clear_min_y = cur_min.min(min_y);
                    surface.clear_max_y = cur_max.max(max_y);
                }
                None => {
                    surface.clear_min_y = min_y;
                    surface.clear_max_y = max_y;
                }
            }
            touched += 1;
        }

        touched
    }

    /// Copy mirrored rows into another texture, one row block at a time.
    pub fn copy_rows_to(
        &self,
        gpu: &mut dyn GpuBackend,
        id: MirrorId,
        y: u32,
        rows: u32,
        dst: TextureId,
        dst_y: u32,
    ) -> bool {
        let Some(surface) = self.surfaces.get(id) else {
            return false;
        };

        if !surface.covers(y, rows) {
            return false;
        }

        let mut done = 0;
        while done < rows {
            let (x, ty) = surface.texel_row(y + done);
            let chunk = (surface.tex_height - ty).min(rows - done);
            gpu.copy_texture(surface.texture, TexRect::new(x, ty, surface.stride, chunk), dst, 0, dst_y + done);
            done += chunk;
        }

        true
    }

    /// Release a mirror's texture into the free pool.
    pub fn destroy(&mut self, gpu: &mut dyn GpuBackend, id: MirrorId) {
        let Some(surface) = self.surfaces.remove(id) else {
            return;
        };

        self.stats.destroyed += 1;
        self.pool.push_back(PooledTexture {
            texture: surface.texture,
            width: surface.tex_width,
            height: surface.tex_height,
            freed_frame: self.frame,
        });

        while self.pool.len() > self.config.memory_pool_capacity {
            if let Some(old) = self.pool.pop_front() {
                gpu.destroy_texture(old.texture);
            }
        }
    }

    /// Free the least recently used mirror outright.
    pub fn destroy_oldest(&mut self, gpu: &mut dyn GpuBackend) -> bool {
        let Some(id) = self.surfaces.iter().min_by_key(|(_, s)| s.last_used).map(|(id, _)| id) else {
            return false;
        };

        if let Some(surface) = self.surfaces.remove(id) {
            trace!("Destroying oldest mirror at 0x{:06X}", surface.base);
            gpu.destroy_texture(surface.texture);
            self.stats.destroyed += 1;
        }
        true
    }

    /// Give storage back to the device when a render target cannot be allocated.
    pub fn release_for_allocation(&mut self, gpu: &mut dyn GpuBackend) -> bool {
        if let Some(pooled) = self.pool.pop_front() {
            gpu.destroy_texture(pooled.texture);
            return true;
        }

        self.surfaces.len() > self.config.memory_release_threshold && self.destroy_oldest(gpu)
    }

    /// Age out the free pool and, periodically, mirrors nobody samples.
    pub fn sweep(&mut self, gpu: &mut dyn GpuBackend) {
        self.frame += 1;
        let frame = self.frame;

        let pool_age = self.config.memory_pool_max_age;
        self.pool.retain(|p| {
            let keep = p.freed_frame + pool_age >= frame;
            if !keep {
                gpu.destroy_texture(p.texture);
            }
            keep
        });

        if frame % self.config.memory_purge_interval.max(1) != 0 {
            return;
        }

        let unused_age = self.config.memory_unused_max_age;
        let stale: Vec<MirrorId> = self
            .surfaces
            .iter()
            .filter(|(_, s)| s.used_frame + unused_age < frame)
            .map(|(id, _)| id)
            .collect();

        if !stale.is_empty() {
            debug!("Purging {} unused texture mirrors", stale.len());
        }

        for id in stale {
            self.destroy(gpu, id);
        }
    }

    /// Drop every mirror and pooled texture.
    pub fn clear(&mut self, gpu: &mut dyn GpuBackend) {
        for (_, surface) in self.surfaces.drain() {
            gpu.destroy_texture(surface.texture);
        }

        for pooled in self.pool.drain(..) {
            gpu.destroy_texture(pooled.texture);
        }
    }
}

fn window_unchanged(surface: &MemoryTargetSurface, store: &BackingStore, min_y: u32, max_y: u32) -> bool {
    let page_rows = |y: u32| (y / surface.page_height) as u64 * surface.page_row_bytes;
    let start = (surface.base as u64 + page_rows(min_y)).max(surface.footprint.start as u64);
    let end = (surface.base as u64 + page_rows(max_y.div_ceil(surface.page_height) * surface.page_height))
        .min(surface.footprint.end as u64);

    if end <= start {
        return true;
    }

    let offset = (start - surface.footprint.start as u64) as usize;
    let len = (end - start) as usize;
    store.vram()[start as usize..end as usize] == surface.contents[offset..offset + len]
}

/// Live palette bytes an indexed texture would use.
pub fn palette_bytes(clut: &[u8], format: &PixelFormatDescriptor, desc: ClutDescriptor) -> Vec<u8> {
    let entries = 1u32 << format.index_bits;
    let csa = desc.csa & CSA_MASK;
    let (start, size) = if is_half_clut(desc.cpsm) {
        (csa * 32, entries.min(512u32.saturating_sub(csa * 16)) * 2)
    } else {
        (csa * 64, entries.min(256u32.saturating_sub(csa * 16)) * 4)
    };

    let start = (start as usize).min(clut.len());
    let end = (start + size as usize).min(clut.len());
    clut[start..end].to_vec()
}

fn is_half_clut(cpsm: u8) -> bool {
    matches!(cpsm, psm::CT16 | psm::CT16S)
}

fn lookup_palette(palette: &[u8], clut: ClutDescriptor, index: u32) -> u32 {
    let i = index as usize;
    if is_half_clut(clut.cpsm) {
        palette
            .get(i * 2..i * 2 + 2)
            .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]) as u32)
    } else {
        palette
            .get(i * 4..i * 4 + 4)
            .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
