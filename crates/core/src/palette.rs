//! Pen-indexed palettes.
//!
//! Displays that produce a small number of pixel states (monochrome LCD panels,
//! LED matrices) hand the renderer a pen number per pixel; the palette turns that
//! into an ARGB8888 value (0xAARRGGBB) for the framebuffer.

/// Pack an opaque RGB triple as ARGB8888.
pub const fn rgb(r: u8, g: u8, b: u8) -> u32 {
    0xFF00_0000 | ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

/// Fixed-size pen table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    pens: Vec<u32>,
}

impl Palette {
    /// Create a palette with `entries` pens, all opaque black
    pub fn new(entries: usize) -> Self {
        Self {
            pens: vec![rgb(0, 0, 0); entries],
        }
    }

    /// Set a pen; out-of-range pens are ignored
    pub fn set_pen_color(&mut self, pen: usize, r: u8, g: u8, b: u8) {
        if let Some(slot) = self.pens.get_mut(pen) {
            *slot = rgb(r, g, b);
        }
    }

    /// ARGB value of a pen. Out-of-range pens read as opaque black.
    pub fn pen(&self, pen: usize) -> u32 {
        self.pens.get(pen).copied().unwrap_or(rgb(0, 0, 0))
    }

    pub fn len(&self) -> usize {
        self.pens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_packs_opaque_argb() {
        assert_eq!(rgb(0x12, 0x34, 0x56), 0xFF123456);
        assert_eq!(rgb(0, 0, 0), 0xFF000000);
    }

    #[test]
    fn pens_default_to_black_and_ignore_out_of_range() {
        let mut palette = Palette::new(2);
        assert_eq!(palette.len(), 2);
        assert_eq!(palette.pen(1), 0xFF000000);

        palette.set_pen_color(1, 255, 0, 0);
        palette.set_pen_color(5, 0, 255, 0);
        assert_eq!(palette.pen(1), 0xFFFF0000);
        assert_eq!(palette.pen(5), 0xFF000000);
    }
}
