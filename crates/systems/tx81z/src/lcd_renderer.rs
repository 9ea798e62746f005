//! Front panel renderer
//!
//! Rasterizes the HD44780 into a 96x16 frame: each character cell is 6 pixels
//! wide (5 dots plus a gap) and 8 tall, and every dot becomes one pixel in one
//! of the two LCD pens.

use crate::config::MachineConfig;
use crate::lcdc::Hd44780;
use emu_core::palette::Palette;
use emu_core::renderer::Renderer;
use emu_core::types::Frame;

/// Pen for unlit dots and the gaps between cells
pub const PEN_OFF: usize = 0;
/// Pen for lit dots
pub const PEN_ON: usize = 1;

pub struct LcdRenderer {
    frame: Frame,
    palette: Palette,
    lines: usize,
    chars: usize,
    cell_width: usize,
    cell_height: usize,
}

impl LcdRenderer {
    pub fn new(config: &MachineConfig) -> Self {
        let mut palette = Palette::new(config.palette.len());
        for (pen, &(r, g, b)) in config.palette.iter().enumerate() {
            palette.set_pen_color(pen, r, g, b);
        }
        let mut renderer = Self {
            frame: Frame::new(config.screen.width, config.screen.height),
            palette,
            lines: config.lcd.lines,
            chars: config.lcd.chars_per_line,
            cell_width: config.lcd.cell_width as usize,
            cell_height: config.lcd.cell_height as usize,
        };
        renderer.reset();
        renderer
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// Draw the controller's current contents
    pub fn render(&mut self, lcdc: &Hd44780) {
        self.clear(self.palette.pen(PEN_OFF));
        let on = self.palette.pen(PEN_ON);
        let off = self.palette.pen(PEN_OFF);
        let (lines, chars) = (self.lines, self.chars);
        let (cell_width, cell_height) = (self.cell_width, self.cell_height);
        let frame = &mut self.frame;
        lcdc.render(lines, chars, |line, pos, y, x, state| {
            if x < 5 && y < 8 && line < lines && pos < chars {
                let row = line * cell_height + y;
                let col = pos * cell_width + x;
                frame.set_pixel(col as u32, row as u32, if state { on } else { off });
            }
        });
    }
}

impl Renderer for LcdRenderer {
    fn get_frame(&self) -> &Frame {
        &self.frame
    }

    fn clear(&mut self, color: u32) {
        self.frame.pixels.fill(color);
    }

    fn reset(&mut self) {
        self.clear(self.palette.pen(PEN_OFF));
    }

    fn name(&self) -> &str {
        "HD44780 Panel Renderer"
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.frame = Frame::new(width, height);
        self.reset();
    }
}
