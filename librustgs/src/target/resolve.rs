/*
    Moving render target contents between the GPU and local memory
*/

use tracing::{trace, warn};

use super::memory::TextureDescriptor;
use super::{RenderTargetCache, SurfaceId, SurfaceKind, TargetEnv, TargetStatus};
use crate::format::rgba32_to_16;
use crate::gpu::{TexRect, TextureId};
use crate::memory::translate::{footprint, load_pixel, pixel_address, store_pixel};
use crate::memory::ByteRange;

#[derive(Clone, Copy)]
struct Layout {
    kind: SurfaceKind,
    base: u32,
    stride: u32,
    height: u32,
    texel_psm: u8,
    write_mask: u32,
    texture: TextureId,
    row_offset: u32,
}

impl RenderTargetCache {
    fn layout(&self, id: SurfaceId) -> Option<Layout> {
        let s = self.surfaces.get(id)?;
        Some(Layout {
            kind: s.key.kind,
            base: s.key.base,
            stride: s.key.stride,
            height: s.height,
            texel_psm: s.texel_psm,
            write_mask: s.write_mask,
            texture: s.texture?,
            row_offset: s.row_offset(),
        })
    }

    fn set_resolved(&mut self, id: SurfaceId) {
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.status.insert(TargetStatus::RESOLVED);
        }
    }

    /// Why a non-forced copy back would be dropped, if it would.
    fn skip_reason(&self, kind: SurfaceKind) -> Option<&'static str> {
        if kind == SurfaceKind::Depth && !self.depth_write {
            return Some("depth writes are off");
        }

        if self.config.no_target_resolve {
            return Some("target resolves are disabled");
        }

        match self.config.resolve_budget {
            Some(budget) if self.resolves_this_frame >= budget => Some("frame resolve budget exhausted"),
            _ => None,
        }
    }

    /// Copy the surface back into local memory. Returns whether anything was copied.
    pub fn resolve(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId) -> bool {
        self.resolve_inner(env, id, false)
    }

    /// Copy back regardless of budgets and depth gating, for read-backs.
    pub fn force_resolve(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId) -> bool {
        self.resolve_inner(env, id, true)
    }

    fn resolve_inner(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId, forced: bool) -> bool {
        let Some(surface) = self.surfaces.get(id) else {
            return false;
        };

        if surface.status.intersects(TargetStatus::VIRTUAL | TargetStatus::RESOLVED) {
            return false;
        }

        // Local memory is already newer than the surface
        if surface.status.contains(TargetStatus::NEEDS_UPDATE) {
            self.set_resolved(id);
            return false;
        }

        if let Some(mimic) = surface.mimic {
            self.set_resolved(id);
            if forced {
                return self.resolve_inner(env, mimic.parent, true);
            }
            self.stats.skipped_resolves += 1;
            return false;
        }

        let Some(layout) = self.layout(id) else {
            return false;
        };

        if !forced {
            if let Some(reason) = self.skip_reason(layout.kind) {
                trace!("Skipping resolve of 0x{:06X}: {}", layout.base, reason);
                self.stats.skipped_resolves += 1;
                self.set_resolved(id);
                return false;
            }
        }

        self.copy_back(env, layout, 0, layout.height, &[]);
        self.resolves_this_frame += 1;
        self.stats.full_resolves += 1;
        self.set_resolved(id);
        true
    }

    /// Rows `[first, first + rows)` lying wholly inside `range`, on page row boundaries.
    fn rows_within(&self, env: &TargetEnv<'_>, id: SurfaceId, range: ByteRange) -> (u32, u32) {
        let Some(surface) = self.surfaces.get(id) else {
            return (0, 0);
        };
        let Ok(format) = env.translator.format(surface.texel_psm) else {
            return (0, 0);
        };

        let clip = range.intersection(surface.range);
        if clip.is_empty() {
            return (0, 0);
        }

        let row_bytes = format.page_row_bytes(surface.key.stride);
        let ph = format.page_height;
        let rel_start = (clip.start - surface.key.base) as u64;
        let rel_end = (clip.end - surface.key.base) as u64;

        let first = (rel_start.div_ceil(row_bytes) as u32).saturating_mul(ph);
        let end = ((rel_end / row_bytes) as u32).saturating_mul(ph).min(surface.height);
        (first, end.saturating_sub(first))
    }

    /// Settles the surfaces that have nothing to copy back. Returns whether
    /// a copy may go ahead.
    fn wants_copy_back(&mut self, id: SurfaceId) -> bool {
        let Some(surface) = self.surfaces.get(id) else {
            return false;
        };

        if surface.status.intersects(TargetStatus::VIRTUAL | TargetStatus::RESOLVED) {
            return false;
        }

        if surface.status.contains(TargetStatus::NEEDS_UPDATE) || surface.mimic.is_some() {
            self.set_resolved(id);
            return false;
        }

        true
    }

    /// Copy back only the rows inside `[start, end)`, rounded to page rows.
    /// Copies too short to be worth it are dropped and the surface still
    /// counts as resolved.
    pub fn resolve_range(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId, start: u32, end: u32) -> bool {
        self.resolve_spans(env, id, &[ByteRange::new(start, end)])
    }

    /// Copy back what lies before and after `hole`, leaving the hole to local memory.
    pub fn resolve_around(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId, hole: ByteRange) -> bool {
        let Some(range) = self.surfaces.get(id).map(|s| s.range) else {
            return false;
        };

        let head = ByteRange::new(range.start, hole.start.max(range.start).min(range.end));
        let tail = ByteRange::new(hole.end.max(range.start).min(range.end), range.end);
        self.resolve_spans(env, id, &[head, tail])
    }

    fn resolve_spans(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId, spans: &[ByteRange]) -> bool {
        if !self.wants_copy_back(id) {
            return false;
        }

        let mut copied = false;
        for &span in spans.iter().filter(|s| !s.is_empty()) {
            copied |= self.copy_rows_in(env, id, span);
        }

        self.set_resolved(id);
        copied
    }

    fn copy_rows_in(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId, range: ByteRange) -> bool {
        let Some(layout) = self.layout(id) else {
            return false;
        };

        if let Some(reason) = self.skip_reason(layout.kind) {
            trace!("Skipping partial resolve of 0x{:06X}: {}", layout.base, reason);
            self.stats.skipped_resolves += 1;
            return false;
        }

        let (first, rows) = self.rows_within(env, id, range);
        if rows == 0 || rows < self.config.min_partial_rows {
            trace!("Partial resolve of 0x{:06X} too short ({} rows), dropped", layout.base, rows);
            self.stats.skipped_resolves += 1;
            return false;
        }

        self.copy_back(env, layout, first, rows, &[]);
        self.resolves_this_frame += 1;
        self.stats.partial_resolves += 1;
        true
    }

    /// Copy back every pixel that does not touch one of `exclude`.
    pub fn resolve_excluding(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId, exclude: &[ByteRange]) {
        let Some(layout) = self.layout(id) else {
            return;
        };

        if let Some(reason) = self.skip_reason(layout.kind) {
            trace!("Skipping masked resolve of 0x{:06X}: {}", layout.base, reason);
            self.stats.skipped_resolves += 1;
            return;
        }

        self.copy_back(env, layout, 0, layout.height, exclude);
        self.resolves_this_frame += 1;
        self.stats.full_resolves += 1;
    }

    fn copy_back(&mut self, env: &mut TargetEnv<'_>, layout: Layout, first: u32, rows: u32, exclude: &[ByteRange]) {
        let translator = env.translator;
        let Ok(format) = translator.format(layout.texel_psm) else {
            return;
        };

        let texels = env.gpu.download(
            layout.texture,
            TexRect::new(0, layout.row_offset + first, layout.stride, rows),
        );

        let preserve = match layout.kind {
            SurfaceKind::Color if format.is_half() => rgba32_to_16(layout.write_mask),
            SurfaceKind::Color => layout.write_mask,
            SurfaceKind::Depth => 0,
        };
        let pixel_bytes = format.bits_per_pixel / 8;

        let vram = env.store.vram_mut();
        for row in 0..rows {
            let y = first + row;
            for x in 0..layout.stride {
                if !exclude.is_empty() {
                    let addr = pixel_address(format, x, y, layout.base, layout.stride).byte;
                    let pixel = ByteRange::new(addr, addr + pixel_bytes);
                    if exclude.iter().any(|r| r.intersects(pixel)) {
                        continue;
                    }
                }

                let texel = texels[(row * layout.stride + x) as usize];
                store_pixel(vram, format, x, y, layout.base, layout.stride, texel, preserve);
            }
        }

        let written = footprint(format, 0, first, layout.stride, rows, layout.base, layout.stride);
        env.memory_targets.clear_range(written);

        trace!(
            "Resolved rows {}..{} of 0x{:06X} ({} bytes)",
            first,
            first + rows,
            layout.base,
            written.len()
        );
    }

    /// Bring a surface up to date with local memory before it is drawn to
    /// or sampled.
    pub fn update(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId) -> bool {
        let Some(surface) = self.surfaces.get(id) else {
            return false;
        };

        if surface.is_virtual() {
            return false;
        }

        if let Some(mimic) = surface.mimic {
            let needs = surface.status.intersects(TargetStatus::NEEDS_UPDATE | TargetStatus::CONVERT);
            let updated = needs && self.update(env, mimic.parent);
            let parent_resolved = self
                .surfaces
                .get(mimic.parent)
                .map_or(TargetStatus::empty(), |p| p.status & TargetStatus::RESOLVED);

            if let Some(surface) = self.surfaces.get_mut(id) {
                if needs {
                    surface.status.remove(TargetStatus::NEEDS_UPDATE | TargetStatus::CONVERT | TargetStatus::RESOLVED);
                    surface.status.insert(parent_resolved);
                }
            }
            return updated;
        }

        let status = surface.status;
        if !status.contains(TargetStatus::NEEDS_UPDATE) {
            return status.intersects(TargetStatus::CONVERT) && self.convert(env, id);
        }

        if surface.key.kind == SurfaceKind::Depth && !self.depth_test {
            trace!("Depth target 0x{:06X} left stale, depth testing is off", surface.key.base);
            return false;
        }

        let source = surface.update_source;
        let psm = surface.psm;
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.status.remove(TargetStatus::CONVERT);
            surface.texel_psm = psm;
            surface.update_source = None;
        }

        let Some(layout) = self.layout(id) else {
            return false;
        };

        let translator = env.translator;
        let formats = translator.formats();
        let from_gpu = source.and_then(|src| {
            let s = self.surfaces.get(src)?;
            if s.status.contains(TargetStatus::NEEDS_UPDATE) {
                return None;
            }
            let row = Self::source_row(formats, s, psm, layout.base, layout.stride, layout.height)?;
            Some((s.texture?, row, s.status & TargetStatus::RESOLVED))
        });

        if let Some((src_texture, row, resolved)) = from_gpu {
            env.gpu.copy_texture(src_texture, TexRect::new(0, row, layout.stride, layout.height), layout.texture, 0, 0);

            if let Some(surface) = self.surfaces.get_mut(id) {
                surface.status.remove(TargetStatus::NEEDS_UPDATE | TargetStatus::RESOLVED);
                surface.status.insert(resolved);
            }
            self.stats.gpu_updates += 1;
            trace!("Updated 0x{:06X} from an enclosing surface", layout.base);
            return true;
        }

        self.update_from_memory(env, layout, psm);

        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.status.remove(TargetStatus::NEEDS_UPDATE);
            surface.status.insert(TargetStatus::RESOLVED);
        }
        self.stats.memory_updates += 1;
        true
    }

    fn update_from_memory(&mut self, env: &mut TargetEnv<'_>, layout: Layout, psm: u8) {
        let translator = env.translator;
        let desc = TextureDescriptor {
            psm,
            base: layout.base,
            stride: layout.stride,
            y: 0,
            height: layout.height,
            clut: None,
        };

        let mirrored = env
            .memory_targets
            .get_or_build(&mut *env.gpu, &*env.store, translator, &desc, true)
            .is_some_and(|mirror| {
                env.memory_targets.copy_rows_to(&mut *env.gpu, mirror, 0, layout.height, layout.texture, 0)
            });

        if mirrored {
            return;
        }

        let Ok(format) = translator.format(psm) else {
            return;
        };

        let mut texels = Vec::with_capacity(layout.stride as usize * layout.height as usize);
        for y in 0..layout.height {
            for x in 0..layout.stride {
                texels.push(load_pixel(env.store.vram(), format, x, y, layout.base, layout.stride));
            }
        }
        env.gpu.upload(layout.texture, TexRect::new(0, 0, layout.stride, layout.height), &texels);
    }

    /// Re-lay the texels out for the storage mode the surface is now used as.
    fn convert(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId) -> bool {
        let Some(layout) = self.layout(id) else {
            return false;
        };
        let Some(psm) = self.surfaces.get(id).map(|s| s.psm) else {
            return false;
        };

        let translator = env.translator;
        let (Ok(from), Ok(to)) = (translator.format(layout.texel_psm), translator.format(psm)) else {
            return false;
        };

        let (width, height) = (layout.stride, layout.height);
        let texels = env.gpu.download(layout.texture, TexRect::new(0, layout.row_offset, width, height));

        // Lay the old texels down over current memory, then read them back as the new format
        let mut scratch = env.store.vram().to_vec();
        for y in 0..height {
            for x in 0..width {
                store_pixel(&mut scratch, from, x, y, layout.base, width, texels[(y * width + x) as usize], 0);
            }
        }

        let converted: Vec<u32> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| load_pixel(&scratch, to, x, y, layout.base, width))
            .collect();

        env.gpu.upload(layout.texture, TexRect::new(0, layout.row_offset, width, height), &converted);

        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.status.remove(TargetStatus::CONVERT);
            surface.texel_psm = psm;
        }

        self.stats.conversions += 1;
        trace!("Converted 0x{:06X} from {} to {}", layout.base, from.name, to.name);
        true
    }

    /// Snapshot a surface for sampling while it is also being drawn to.
    pub fn create_feedback(&mut self, env: &mut TargetEnv<'_>, id: SurfaceId) -> Option<TextureId> {
        let surface = self.surfaces.get(id)?;
        if surface.status.contains(TargetStatus::FEEDBACK_READY) {
            if let Some(feedback) = surface.feedback {
                return Some(feedback);
            }
        }

        let layout = self.layout(id)?;
        let feedback = match self.surfaces.get(id).and_then(|s| s.feedback) {
            Some(feedback) => feedback,
            None => match env.gpu.create_texture(layout.stride, layout.height) {
                Ok(texture) => texture,
                Err(err) => {
                    warn!("No feedback copy for 0x{:06X}: {}", layout.base, err);
                    return None;
                }
            },
        };

        env.gpu.copy_texture(
            layout.texture,
            TexRect::new(0, layout.row_offset, layout.stride, layout.height),
            feedback,
            0,
            0,
        );

        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.feedback = Some(feedback);
            surface.status.insert(TargetStatus::FEEDBACK_READY);
        }
        Some(feedback)
    }
}
