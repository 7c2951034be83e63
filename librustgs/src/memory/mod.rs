/*
    GS local memory: backing store, byte ranges and dirty tracking
*/

pub mod dirty;
pub mod translate;


pub use dirty::DirtyRangeSet;
pub use translate::{AddressTranslator, PixelAddress};

use tracing::trace;

use crate::error::{Result, VramError};

pub const VRAM_SIZE: usize = 4 * 1024 * 1024;
pub const CLUT_SIZE: usize = 1024;

/// `[start, end)` in local memory address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteRange {
    pub start: u32,
    pub end: u32,
}

impl ByteRange {
    pub const fn new(start: u32, end: u32) -> Self {
        ByteRange { start, end }
    }

    pub const fn full() -> Self {
        ByteRange { start: 0, end: VRAM_SIZE as u32 }
    }

    pub fn len(self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(self) -> bool {
        self.end <= self.start
    }

    pub fn intersects(self, other: ByteRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    pub fn contains_range(self, other: ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains(self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn intersection(self, other: ByteRange) -> ByteRange {
        ByteRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }

    pub fn clamp_to(self, limit: ByteRange) -> ByteRange {
        let clamped = self.intersection(limit);
        if clamped.is_empty() { ByteRange::default() } else { clamped }
    }
}

/// A rectangle of pixels laid out in local memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub psm: u8,
    pub base: u32,
    /// Buffer width in pixels
    pub stride: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Raw copy of local memory and the palette buffer for save states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VramSnapshot {
    pub vram: Vec<u8>,
    pub clut: Vec<u8>,
}

pub struct BackingStore {
    vram: Vec<u8>,
    clut: Vec<u8>,
}

impl Default for BackingStore {
    fn default() -> Self {
        BackingStore::new()
    }
}

impl BackingStore {
    pub fn new() -> Self {
        BackingStore {
            vram: vec![0u8; VRAM_SIZE],
            clut: vec![0u8; CLUT_SIZE],
        }
    }

    pub fn vram(&self) -> &[u8] {
        &self.vram
    }

    pub fn vram_mut(&mut self) -> &mut [u8] {
        &mut self.vram
    }

    pub fn clut(&self) -> &[u8] {
        &self.clut
    }

    pub fn read(&self, addr: u32, len: usize) -> Result<&[u8]> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= VRAM_SIZE => Ok(&self.vram[start..end]),
            _ => Err(VramError::OutOfBounds { addr, len }),
        }
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let start = addr as usize;
        match start.checked_add(data.len()) {
            Some(end) if end <= VRAM_SIZE => {
                trace!("Local memory write of {} bytes at 0x{:06X}", data.len(), addr);
                self.vram[start..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(VramError::OutOfBounds { addr, len: data.len() }),
        }
    }

    pub fn write_clut(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        match start.checked_add(data.len()) {
            Some(end) if end <= CLUT_SIZE => {
                self.clut[start..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(VramError::OutOfBounds { addr: offset, len: data.len() }),
        }
    }

    pub fn snapshot(&self) -> VramSnapshot {
        VramSnapshot {
            vram: self.vram.clone(),
            clut: self.clut.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &VramSnapshot) -> Result<()> {
        if snapshot.vram.len() != VRAM_SIZE || snapshot.clut.len() != CLUT_SIZE {
            return Err(VramError::OutOfBounds { addr: 0, len: snapshot.vram.len() });
        }

        self.vram.copy_from_slice(&snapshot.vram);
        self.clut.copy_from_slice(&snapshot.clut);
        Ok(())
    }
}
