/*
    GS pixel storage modes and their memory geometry
*/

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, VramError};

/// Every GS page is 8 KiB regardless of the pixel format stored in it.
pub const PAGE_SIZE: u32 = 8192;

/// Pixel storage mode codes (PSM field of FRAME/ZBUF/TEX0)
pub mod psm {
    pub const CT32: u8 = 0x00;
    pub const CT24: u8 = 0x01;
    pub const CT16: u8 = 0x02;
    pub const CT16S: u8 = 0x0A;
    pub const T8: u8 = 0x13;
    pub const T4: u8 = 0x14;
    pub const T8H: u8 = 0x1B;
    pub const T4HL: u8 = 0x24;
    pub const T4HH: u8 = 0x2C;
    pub const Z32: u8 = 0x30;
    pub const Z24: u8 = 0x31;
    pub const Z16: u8 = 0x32;
    pub const Z16S: u8 = 0x3A;
}

/// Geometry and interpretation of one pixel storage mode.
#[derive(Debug, Clone)]
pub struct PixelFormatDescriptor {
    pub psm: u8,
    pub name: &'static str,
    /// Bits each pixel occupies in video memory
    pub bits_per_pixel: u32,
    pub page_width: u32,
    pub page_height: u32,
    pub block_width: u32,
    pub block_height: u32,
    /// Bits actually holding colour data (24 for CT24/Z24)
    pub color_bits: u32,
    pub indexed: bool,
    /// Width of the palette index for indexed formats
    pub index_bits: u32,
    /// Position of the index inside the stored pixel (T8H/T4HL/T4HH)
    pub index_shift: u32,
    pub depth: bool,
    /// In-page pixel permutation, `page_width * page_height` entries.
    /// `None` stores pixels row-major inside each page.
    pub swizzle: Option<Arc<[u32]>>,
}

impl PixelFormatDescriptor {
    fn linear(
        psm: u8,
        name: &'static str,
        bits_per_pixel: u32,
        page: (u32, u32),
        block: (u32, u32),
    ) -> Self {
        PixelFormatDescriptor {
            psm,
            name,
            bits_per_pixel,
            page_width: page.0,
            page_height: page.1,
            block_width: block.0,
            block_height: block.1,
            color_bits: bits_per_pixel,
            indexed: false,
            index_bits: 0,
            index_shift: 0,
            depth: false,
            swizzle: None,
        }
    }

    fn with_color_bits(mut self, bits: u32) -> Self {
        self.color_bits = bits;
        self
    }

    fn with_index(mut self, bits: u32, shift: u32) -> Self {
        self.indexed = true;
        self.index_bits = bits;
        self.index_shift = shift;
        self
    }

    fn as_depth(mut self) -> Self {
        self.depth = true;
        self
    }

    /// 16-bit formats share a page geometry that differs from the 32-bit one.
    pub fn is_half(&self) -> bool {
        self.bits_per_pixel == 16
    }

    pub fn pages_per_row(&self, stride: u32) -> u32 {
        stride.div_ceil(self.page_width).max(1)
    }

    /// Bytes covered by one row of pages for a buffer of the given stride.
    pub fn page_row_bytes(&self, stride: u32) -> u64 {
        self.pages_per_row(stride) as u64 * PAGE_SIZE as u64
    }

    /// Mask of the bits a stored pixel occupies.
    pub fn storage_mask(&self) -> u32 {
        match self.bits_per_pixel {
            32 => 0xFFFF_FFFF,
            bits => (1u32 << bits) - 1,
        }
    }

    /// Render targets can only live in the direct colour and depth formats.
    pub fn can_render(&self) -> bool {
        !self.indexed && self.bits_per_pixel >= 16
    }
}

/// Read-only lookup of every known storage mode.
#[derive(Debug, Clone)]
pub struct FormatTable {
    descriptors: HashMap<u8, PixelFormatDescriptor>,
}

impl Default for FormatTable {
    fn default() -> Self {
        FormatTable::standard()
    }
}

impl FormatTable {
    /// Table with every GS storage mode, pixels row-major inside their page.
    pub fn standard() -> Self {
        let entries = [
            PixelFormatDescriptor::linear(psm::CT32, "PSMCT32", 32, (64, 32), (8, 8)),
            PixelFormatDescriptor::linear(psm::CT24, "PSMCT24", 32, (64, 32), (8, 8)).with_color_bits(24),
            PixelFormatDescriptor::linear(psm::CT16, "PSMCT16", 16, (64, 64), (16, 8)),
            PixelFormatDescriptor::linear(psm::CT16S, "PSMCT16S", 16, (64, 64), (16, 8)),
            PixelFormatDescriptor::linear(psm::T8, "PSMT8", 8, (128, 64), (16, 16)).with_index(8, 0),
            PixelFormatDescriptor::linear(psm::T4, "PSMT4", 4, (128, 128), (32, 16)).with_index(4, 0),
            PixelFormatDescriptor::linear(psm::T8H, "PSMT8H", 32, (64, 32), (8, 8)).with_index(8, 24),
            PixelFormatDescriptor::linear(psm::T4HL, "PSMT4HL", 32, (64, 32), (8, 8)).with_index(4, 24),
            PixelFormatDescriptor::linear(psm::T4HH, "PSMT4HH", 32, (64, 32), (8, 8)).with_index(4, 28),
            PixelFormatDescriptor::linear(psm::Z32, "PSMZ32", 32, (64, 32), (8, 8)).as_depth(),
            PixelFormatDescriptor::linear(psm::Z24, "PSMZ24", 32, (64, 32), (8, 8))
                .with_color_bits(24)
                .as_depth(),
            PixelFormatDescriptor::linear(psm::Z16, "PSMZ16", 16, (64, 64), (16, 8)).as_depth(),
            PixelFormatDescriptor::linear(psm::Z16S, "PSMZ16S", 16, (64, 64), (16, 8)).as_depth(),
        ];

        FormatTable {
            descriptors: entries.into_iter().map(|d| (d.psm, d)).collect(),
        }
    }

    pub fn get(&self, psm: u8) -> Option<&PixelFormatDescriptor> {
        self.descriptors.get(&psm)
    }

    pub fn lookup(&self, psm: u8) -> Result<&PixelFormatDescriptor> {
        self.get(psm).ok_or(VramError::UnknownFormat { psm })
    }

    /// Plug a descriptor in, replacing any existing entry for the same mode.
    pub fn register(&mut self, descriptor: PixelFormatDescriptor) -> Result<()> {
        let expected = (descriptor.page_width * descriptor.page_height) as usize;
        let page_bits = expected as u64 * descriptor.bits_per_pixel as u64;
        if page_bits != PAGE_SIZE as u64 * 8 {
            return Err(VramError::Config(format!(
                "{} pages are {} bits, not one 8 KiB page",
                descriptor.name, page_bits
            )));
        }

        if let Some(table) = &descriptor.swizzle {
            if table.len() != expected {
                return Err(VramError::InvalidSwizzle {
                    psm: descriptor.psm,
                    expected,
                    actual: table.len(),
                });
            }
        }

        debug!("Registering pixel format {} (0x{:02X})", descriptor.name, descriptor.psm);
        self.descriptors.insert(descriptor.psm, descriptor);
        Ok(())
    }

    /// True when both modes share the 16-bit (or both the 32-bit) page geometry.
    pub fn same_half_class(&self, a: u8, b: u8) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(a), Some(b)) => a.is_half() == b.is_half(),
            _ => false,
        }
    }
}

/// Convert a 32-bit FBM write mask to the 16-bit RGB5A1 layout.
pub fn rgba32_to_16(mask: u32) -> u32 {
    ((mask >> 3) & 0x001F) | ((mask >> 6) & 0x03E0) | ((mask >> 9) & 0x7C00) | ((mask >> 16) & 0x8000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_standard_page_is_eight_kib() {
        let table = FormatTable::standard();
        for code in [psm::CT32, psm::CT16, psm::T8, psm::T4, psm::Z16S, psm::T4HH] {
            let desc = table.get(code).unwrap();
            let bits = desc.page_width * desc.page_height * desc.bits_per_pixel;
            assert_eq!(bits, PAGE_SIZE * 8, "{}", desc.name);
        }
    }

    #[test]
    fn register_rejects_short_swizzle() {
        let mut table = FormatTable::standard();
        let mut desc = table.get(psm::CT32).unwrap().clone();
        desc.swizzle = Some(vec![0u32; 16].into());
        assert_eq!(
            table.register(desc),
            Err(VramError::InvalidSwizzle { psm: psm::CT32, expected: 2048, actual: 16 })
        );
    }

    #[test]
    fn half_class_comparison() {
        let table = FormatTable::standard();
        assert!(table.same_half_class(psm::CT16, psm::Z16S));
        assert!(!table.same_half_class(psm::CT16, psm::CT32));
        assert!(!table.same_half_class(psm::CT32, 0x7F));
    }

    #[test]
    fn mask_conversion_keeps_channel_tops() {
        assert_eq!(rgba32_to_16(0xFFFF_FFFF), 0xFFFF);
        assert_eq!(rgba32_to_16(0x0000_00F8), 0x001F);
        assert_eq!(rgba32_to_16(0x8000_0000), 0x8000);
    }
}
