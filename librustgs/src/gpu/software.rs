/*
    Texture backend kept in host memory
*/

use slotmap::SlotMap;
use tracing::{error, trace};

use super::{GpuBackend, GpuStats, TexRect, TextureId};
use crate::error::{Result, VramError};

struct SoftTexture {
    width: u32,
    height: u32,
    texels: Vec<u32>,
}

impl SoftTexture {
    fn contains(&self, rect: TexRect) -> bool {
        rect.x as u64 + rect.width as u64 <= self.width as u64
            && rect.y as u64 + rect.height as u64 <= self.height as u64
    }
}

/// Host memory textures. An optional byte budget makes allocations fail
/// once exhausted, the way a real device runs out of memory.
#[derive(Default)]
pub struct SoftwareBackend {
    textures: SlotMap<TextureId, SoftTexture>,
    budget: Option<usize>,
    stats: GpuStats,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        SoftwareBackend::default()
    }

    pub fn with_budget(budget: Option<usize>) -> Self {
        SoftwareBackend { budget, ..SoftwareBackend::default() }
    }

    /// Direct texel access for inspection.
    pub fn texels(&self, id: TextureId) -> Option<&[u32]> {
        self.textures.get(id).map(|t| t.texels.as_slice())
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "Software"
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId> {
        let bytes = width as usize * height as usize * 4;
        if width == 0 || height == 0 {
            return Err(VramError::AllocationFailure { width, height });
        }

        if let Some(budget) = self.budget {
            if self.stats.live_bytes + bytes > budget {
                trace!("Texture budget exhausted: {} live, {} requested", self.stats.live_bytes, bytes);
                return Err(VramError::AllocationFailure { width, height });
            }
        }

        let id = self.textures.insert(SoftTexture {
            width,
            height,
            texels: vec![0u32; width as usize * height as usize],
        });

        self.stats.live_textures += 1;
        self.stats.live_bytes += bytes;
        self.stats.created += 1;
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        match self.textures.remove(id) {
            Some(texture) => {
                self.stats.live_textures -= 1;
                self.stats.live_bytes -= texture.texels.len() * 4;
            }
            None => error!("Destroying unknown texture {:?}", id),
        }
    }

    fn texture_size(&self, id: TextureId) -> Option<(u32, u32)> {
        self.textures.get(id).map(|t| (t.width, t.height))
    }

    fn upload(&mut self, id: TextureId, rect: TexRect, texels: &[u32]) {
        let Some(texture) = self.textures.get_mut(id) else {
            error!("Upload to unknown texture {:?}", id);
            return;
        };

        if !texture.contains(rect) || texels.len() < rect.area() {
            error!("Upload of {:?} does not fit texture {:?}", rect, id);
            return;
        }

        if rect.area() == 0 {
            return;
        }

        let row_len = rect.width as usize;
        for (row, src) in texels.chunks_exact(row_len).take(rect.height as usize).enumerate() {
            let start = (rect.y as usize + row) * texture.width as usize + rect.x as usize;
            texture.texels[start..start + row_len].copy_from_slice(src);
        }

        self.stats.uploads += 1;
    }

    fn download(&mut self, id: TextureId, rect: TexRect) -> Vec<u32> {
        let mut out = vec![0u32; rect.area()];
        let Some(texture) = self.textures.get(id) else {
            error!("Download from unknown texture {:?}", id);
            return out;
        };

        if !texture.contains(rect) {
            error!("Download of {:?} does not fit texture {:?}", rect, id);
            return out;
        }

        let row_len = rect.width as usize;
        for (row, dst) in out.chunks_exact_mut(row_len.max(1)).enumerate().take(rect.height as usize) {
            let start = (rect.y as usize + row) * texture.width as usize + rect.x as usize;
            dst.copy_from_slice(&texture.texels[start..start + row_len]);
        }

        self.stats.downloads += 1;
        out
    }

    fn copy_texture(&mut self, src: TextureId, src_rect: TexRect, dst: TextureId, dst_x: u32, dst_y: u32) {
        let Some(source) = self.textures.get(src) else {
            error!("Copy from unknown texture {:?}", src);
            return;
        };

        if !source.contains(src_rect) {
            error!("Copy of {:?} does not fit texture {:?}", src_rect, src);
            return;
        }

        let row_len = src_rect.width as usize;
        let mut staging = Vec::with_capacity(src_rect.area());
        for row in 0..src_rect.height as usize {
            let start = (src_rect.y as usize + row) * source.width as usize + src_rect.x as usize;
            staging.extend_from_slice(&source.texels[start..start + row_len]);
        }

        let Some(target) = self.textures.get_mut(dst) else {
            error!("Copy to unknown texture {:?}", dst);
            return;
        };

        let dst_rect = TexRect::new(dst_x, dst_y, src_rect.width, src_rect.height);
        if !target.contains(dst_rect) {
            error!("Copy to {:?} does not fit texture {:?}", dst_rect, dst);
            return;
        }

        for (row, src) in staging.chunks_exact(row_len.max(1)).enumerate().take(src_rect.height as usize) {
            let start = (dst_y as usize + row) * target.width as usize + dst_x as usize;
            target.texels[start..start + row_len].copy_from_slice(src);
        }

        self.stats.copies += 1;
    }

    fn fill(&mut self, id: TextureId, rect: TexRect, value: u32) {
        let Some(texture) = self.textures.get_mut(id) else {
            error!("Fill of unknown texture {:?}", id);
            return;
        };

        if !texture.contains(rect) {
            error!("Fill of {:?} does not fit texture {:?}", rect, id);
            return;
        }

        for row in rect.y..rect.y + rect.height {
            let start = row as usize * texture.width as usize + rect.x as usize;
            texture.texels[start..start + rect.width as usize].fill(value);
        }

        self.stats.fills += 1;
    }

    fn stats(&self) -> GpuStats {
        self.stats
    }
}
