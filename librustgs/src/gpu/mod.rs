/*
    GPU device boundary
*/

pub mod software;

pub use software::SoftwareBackend;

use slotmap::new_key_type;

use crate::error::Result;

new_key_type! {
    pub struct TextureId;
}

/// Texel rectangle inside a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TexRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TexRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        TexRect { x, y, width, height }
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuStats {
    pub live_textures: usize,
    pub live_bytes: usize,
    pub created: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub copies: u64,
    pub fills: u64,
}

/// Texture storage and transfers. Texels are 32 bits wide and hold either
/// the raw stored pixel of a surface or a palette-expanded colour.
pub trait GpuBackend: Send {
    fn name(&self) -> &'static str;

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId>;

    fn destroy_texture(&mut self, id: TextureId);

    fn texture_size(&self, id: TextureId) -> Option<(u32, u32)>;

    fn upload(&mut self, id: TextureId, rect: TexRect, texels: &[u32]);

    fn download(&mut self, id: TextureId, rect: TexRect) -> Vec<u32>;

    fn copy_texture(&mut self, src: TextureId, src_rect: TexRect, dst: TextureId, dst_x: u32, dst_y: u32);

    fn fill(&mut self, id: TextureId, rect: TexRect, value: u32);

    fn stats(&self) -> GpuStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Software,
}

impl BackendKind {
    pub fn display_name(self) -> &'static str {
        match self {
            BackendKind::Software => "Software",
        }
    }

    pub fn create(self, budget: Option<usize>) -> Box<dyn GpuBackend> {
        match self {
            BackendKind::Software => Box::new(SoftwareBackend::with_budget(budget)),
        }
    }
}
