/*
    Logical rectangle -> local memory address translation
*/

use std::sync::Arc;

use tracing::warn;

use super::{ByteRange, Rect, VRAM_SIZE};
use crate::error::Result;
use crate::format::{FormatTable, PixelFormatDescriptor, PAGE_SIZE};

/// Location of one pixel. `nibble` selects the low (0) or high (1) half of
/// the byte for 4-bit formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelAddress {
    pub byte: u32,
    pub nibble: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct AddressTranslator {
    formats: Arc<FormatTable>,
}

impl AddressTranslator {
    pub fn new(formats: Arc<FormatTable>) -> Self {
        AddressTranslator { formats }
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    pub fn format(&self, psm: u8) -> Result<&PixelFormatDescriptor> {
        self.formats.lookup(psm)
    }

    /// Pages touched by the rectangle, as one contiguous byte range. Unknown
    /// formats get the whole of local memory.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_byte_range(
        &self,
        psm: u8,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        base: u32,
        stride: u32,
    ) -> ByteRange {
        let Some(desc) = self.formats.get(psm) else {
            warn!("Unknown pixel storage mode 0x{:02X}, assuming all of local memory", psm);
            return ByteRange::full();
        };

        if w == 0 || h == 0 {
            return ByteRange::new(base, base);
        }

        footprint(desc, x, y, w, h, base, stride)
    }

    pub fn query(&self, rect: &Rect) -> ByteRange {
        self.compute_byte_range(rect.psm, rect.x, rect.y, rect.width, rect.height, rect.base, rect.stride)
    }

    pub fn pixel_offset(&self, psm: u8, x: u32, y: u32, base: u32, stride: u32) -> Result<PixelAddress> {
        let desc = self.formats.lookup(psm)?;
        Ok(pixel_address(desc, x, y, base, stride))
    }
}

/// Byte footprint of a rectangle, rounded out to whole pages.
pub fn footprint(desc: &PixelFormatDescriptor, x: u32, y: u32, w: u32, h: u32, base: u32, stride: u32) -> ByteRange {
    let ppr = desc.pages_per_row(stride) as u64;
    let (pw, ph) = (desc.page_width as u64, desc.page_height as u64);
    let (x, y) = (x as u64, y as u64);
    let (last_x, last_y) = (x + w as u64 - 1, y + h as u64 - 1);

    let first_page = (y / ph) * ppr + x / pw;
    let last_page = (last_y / ph) * ppr + last_x / pw;

    let start = base as u64 + first_page * PAGE_SIZE as u64;
    let end = base as u64 + (last_page + 1) * PAGE_SIZE as u64;

    ByteRange::new(
        start.min(VRAM_SIZE as u64) as u32,
        end.min(VRAM_SIZE as u64) as u32,
    )
}

pub fn pixel_address(desc: &PixelFormatDescriptor, x: u32, y: u32, base: u32, stride: u32) -> PixelAddress {
    let ppr = desc.pages_per_row(stride) as u64;
    let (pw, ph) = (desc.page_width, desc.page_height);

    let page = (y / ph) as u64 * ppr + (x / pw) as u64;
    let mut index = (y % ph) * pw + x % pw;
    if let Some(table) = &desc.swizzle {
        index = table[index as usize];
    }

    let bit = index as u64 * desc.bits_per_pixel as u64;
    let byte = (base as u64 + page * PAGE_SIZE as u64 + bit / 8) % VRAM_SIZE as u64;

    PixelAddress {
        byte: byte as u32,
        nibble: (desc.bits_per_pixel == 4).then_some((index & 1) as u8),
    }
}

#[inline(always)]
fn byte_at(vram: &[u8], addr: u32, offset: u32) -> u8 {
    vram[((addr + offset) as usize) % VRAM_SIZE]
}

pub fn load_pixel(vram: &[u8], desc: &PixelFormatDescriptor, x: u32, y: u32, base: u32, stride: u32) -> u32 {
    let addr = pixel_address(desc, x, y, base, stride);
    match desc.bits_per_pixel {
        32 => u32::from_le_bytes([
            byte_at(vram, addr.byte, 0),
            byte_at(vram, addr.byte, 1),
            byte_at(vram, addr.byte, 2),
            byte_at(vram, addr.byte, 3),
        ]),
        16 => u16::from_le_bytes([byte_at(vram, addr.byte, 0), byte_at(vram, addr.byte, 1)]) as u32,
        8 => byte_at(vram, addr.byte, 0) as u32,
        _ => {
            let byte = byte_at(vram, addr.byte, 0);
            match addr.nibble {
                Some(1) => (byte >> 4) as u32,
                _ => (byte & 0xF) as u32,
            }
        }
    }
}

/// Store one pixel. Bits set in `preserve` keep their old value; 24-bit
/// formats never touch the top byte.
#[allow(clippy::too_many_arguments)]
pub fn store_pixel(
    vram: &mut [u8],
    desc: &PixelFormatDescriptor,
    x: u32,
    y: u32,
    base: u32,
    stride: u32,
    value: u32,
    preserve: u32,
) {
    let addr = pixel_address(desc, x, y, base, stride);
    let mut preserve = preserve & desc.storage_mask();
    if desc.color_bits == 24 {
        preserve |= 0xFF00_0000;
    }

    let old = load_pixel(vram, desc, x, y, base, stride);
    let merged = ((old & preserve) | (value & !preserve)) & desc.storage_mask();
    let at = |offset: u32| ((addr.byte + offset) as usize) % VRAM_SIZE;

    match desc.bits_per_pixel {
        32 => {
            for (offset, byte) in merged.to_le_bytes().into_iter().enumerate() {
                vram[at(offset as u32)] = byte;
            }
        }
        16 => {
            for (offset, byte) in (merged as u16).to_le_bytes().into_iter().enumerate() {
                vram[at(offset as u32)] = byte;
            }
        }
        8 => vram[at(0)] = merged as u8,
        _ => {
            let slot = &mut vram[at(0)];
            *slot = match addr.nibble {
                Some(1) => (*slot & 0x0F) | ((merged as u8) << 4),
                _ => (*slot & 0xF0) | (merged as u8 & 0xF),
            };
        }
    }
}

/// Palette index held by a stored pixel of an indexed format.
pub fn palette_index(desc: &PixelFormatDescriptor, raw: u32) -> u32 {
    (raw >> desc.index_shift) & ((1u32 << desc.index_bits) - 1)
}
