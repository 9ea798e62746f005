//! Hitachi HD44780 dot-matrix LCD controller
//!
//! The TX81Z front panel is a 2x16 character module. The controller sits at
//! two addresses:
//!
//! | A0 | Write              | Read                         |
//! |----|--------------------|------------------------------|
//! | 0  | instruction        | busy flag (bit 7) + address  |
//! | 1  | data to DDRAM/CGRAM| data from DDRAM/CGRAM        |
//!
//! # Memory
//! - DDRAM: 80 characters. In 2-line mode line 1 starts at 0x00 and line 2 at
//!   0x40, 40 characters each.
//! - CGRAM: 8 user glyphs of 8 rows, used for codes 0x00-0x0F (mirrored).
//! - Character generator: built-in A00 glyphs, or an external 4 KiB dump
//!   with 16 bytes per code when one is mounted.
//!
//! # Timing
//! Clear display and return home keep the controller busy for 1.52 ms, every
//! other instruction and data access for 37 us.

use crate::font;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// Size of an external character generator dump
pub const CHAR_ROM_SIZE: usize = 0x1000;
/// Bytes per code in an external character generator dump
pub const CHAR_ROM_STRIDE: usize = 16;

const DDRAM_SIZE: usize = 80;
const CGRAM_SIZE: usize = 64;
const LINE_LENGTH_2: usize = 40;

const BUSY_SHORT_NS: u64 = 37_000;
const BUSY_LONG_NS: u64 = 1_520_000;

/// Frames per cursor blink phase
pub const BLINK_FRAMES: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Target {
    Ddram,
    Cgram,
}

/// HD44780 state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hd44780 {
    ddram: Vec<u8>,
    cgram: Vec<u8>,
    /// Address counter
    ac: u8,
    target: Target,
    /// Entry mode: increment (I/D) and shift display on write (S)
    increment: bool,
    shift_on_write: bool,
    display_on: bool,
    cursor_on: bool,
    blink_on: bool,
    data_8bit: bool,
    two_lines: bool,
    /// Display shift in characters
    shift: usize,
    busy_ns: u64,
    /// High nibble of a pending 4-bit transfer
    write_nibble: Option<u8>,
    /// Second half of a 4-bit read
    read_nibble: Option<u8>,
    blink_frames: u32,
    blink_phase: bool,
    #[serde(skip)]
    char_rom: Option<Vec<u8>>,
}

impl Default for Hd44780 {
    fn default() -> Self {
        Self::new()
    }
}

impl Hd44780 {
    pub fn new() -> Self {
        let mut lcdc = Self {
            ddram: vec![0x20; DDRAM_SIZE],
            cgram: vec![0; CGRAM_SIZE],
            ac: 0,
            target: Target::Ddram,
            increment: true,
            shift_on_write: false,
            display_on: false,
            cursor_on: false,
            blink_on: false,
            data_8bit: true,
            two_lines: false,
            shift: 0,
            busy_ns: 0,
            write_nibble: None,
            read_nibble: None,
            blink_frames: 0,
            blink_phase: false,
            char_rom: None,
        };
        lcdc.reset();
        lcdc
    }

    /// Internal power-on reset. CGRAM contents are undefined on hardware and kept here.
    pub fn reset(&mut self) {
        self.ddram.fill(0x20);
        self.ac = 0;
        self.target = Target::Ddram;
        self.increment = true;
        self.shift_on_write = false;
        self.display_on = false;
        self.cursor_on = false;
        self.blink_on = false;
        self.data_8bit = true;
        self.two_lines = false;
        self.shift = 0;
        self.busy_ns = 0;
        self.write_nibble = None;
        self.read_nibble = None;
        self.blink_frames = 0;
        self.blink_phase = false;
    }

    /// Replace the built-in glyphs with a character generator dump
    pub fn set_char_rom(&mut self, rom: Option<Vec<u8>>) {
        self.char_rom = rom;
    }

    pub fn take_char_rom(&mut self) -> Option<Vec<u8>> {
        self.char_rom.take()
    }

    pub fn has_char_rom(&self) -> bool {
        self.char_rom.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.busy_ns > 0
    }

    pub fn display_on(&self) -> bool {
        self.display_on
    }

    pub fn address_counter(&self) -> u8 {
        self.ac
    }

    /// Whether deserialized state has the controller's memory sizes
    pub fn is_well_formed(&self) -> bool {
        self.ddram.len() == DDRAM_SIZE && self.cgram.len() == CGRAM_SIZE && self.shift < DDRAM_SIZE
    }

    /// Let time pass for the busy flag
    pub fn tick(&mut self, elapsed_ns: u64) {
        self.busy_ns = self.busy_ns.saturating_sub(elapsed_ns);
    }

    /// Advance the cursor blink by one video frame
    pub fn frame_tick(&mut self) {
        self.blink_frames += 1;
        if self.blink_frames >= BLINK_FRAMES {
            self.blink_frames = 0;
            self.blink_phase = !self.blink_phase;
        }
    }

    // ----------------------------------------------------------------------
    // Bus interface
    // ----------------------------------------------------------------------

    pub fn write(&mut self, a0: u16, val: u8) {
        let byte = if self.data_8bit {
            val
        } else {
            match self.write_nibble.take() {
                Some(high) => (high << 4) | (val >> 4),
                None => {
                    self.write_nibble = Some(val >> 4);
                    return;
                }
            }
        };

        if self.is_busy() {
            log(LogCategory::Video, LogLevel::Debug, || {
                format!("HD44780: write {:02X} while busy", byte)
            });
        }

        if a0 & 1 == 0 {
            self.write_instruction(byte);
        } else {
            self.write_data(byte);
        }
    }

    pub fn read(&mut self, a0: u16) -> u8 {
        if !self.data_8bit {
            if let Some(low) = self.read_nibble.take() {
                return low << 4;
            }
        }

        let byte = if a0 & 1 == 0 {
            (if self.is_busy() { 0x80 } else { 0 }) | (self.ac & 0x7F)
        } else {
            self.read_data()
        };

        if self.data_8bit {
            byte
        } else {
            self.read_nibble = Some(byte & 0x0F);
            byte & 0xF0
        }
    }

    fn write_instruction(&mut self, val: u8) {
        let mut busy = BUSY_SHORT_NS;
        if val & 0x80 != 0 {
            // Set DDRAM address
            self.target = Target::Ddram;
            self.ac = val & 0x7F;
        } else if val & 0x40 != 0 {
            // Set CGRAM address
            self.target = Target::Cgram;
            self.ac = val & 0x3F;
        } else if val & 0x20 != 0 {
            // Function set
            self.data_8bit = val & 0x10 != 0;
            self.two_lines = val & 0x08 != 0;
            self.write_nibble = None;
            self.read_nibble = None;
            log(LogCategory::Video, LogLevel::Debug, || {
                format!(
                    "HD44780: function set {}-bit, {} line(s)",
                    if self.data_8bit { 8 } else { 4 },
                    if self.two_lines { 2 } else { 1 }
                )
            });
        } else if val & 0x10 != 0 {
            // Cursor or display shift
            let right = val & 0x04 != 0;
            if val & 0x08 != 0 {
                self.shift_display(right);
            } else {
                self.step_address(right);
            }
        } else if val & 0x08 != 0 {
            self.display_on = val & 0x04 != 0;
            self.cursor_on = val & 0x02 != 0;
            self.blink_on = val & 0x01 != 0;
        } else if val & 0x04 != 0 {
            self.increment = val & 0x02 != 0;
            self.shift_on_write = val & 0x01 != 0;
        } else if val & 0x02 != 0 {
            // Return home
            self.target = Target::Ddram;
            self.ac = 0;
            self.shift = 0;
            busy = BUSY_LONG_NS;
        } else if val & 0x01 != 0 {
            // Clear display
            self.ddram.fill(0x20);
            self.target = Target::Ddram;
            self.ac = 0;
            self.shift = 0;
            self.increment = true;
            busy = BUSY_LONG_NS;
        }
        self.busy_ns = busy;
    }

    fn write_data(&mut self, val: u8) {
        match self.target {
            Target::Ddram => {
                let idx = self.ddram_index(self.ac);
                self.ddram[idx] = val;
                if self.shift_on_write {
                    self.shift_display(!self.increment);
                }
            }
            Target::Cgram => {
                self.cgram[(self.ac as usize) % CGRAM_SIZE] = val & 0x1F;
            }
        }
        self.step_address(self.increment);
        self.busy_ns = BUSY_SHORT_NS;
    }

    fn read_data(&mut self) -> u8 {
        let val = match self.target {
            Target::Ddram => self.ddram[self.ddram_index(self.ac)],
            Target::Cgram => self.cgram[(self.ac as usize) % CGRAM_SIZE],
        };
        self.step_address(self.increment);
        self.busy_ns = BUSY_SHORT_NS;
        val
    }

    // ----------------------------------------------------------------------
    // Addressing
    // ----------------------------------------------------------------------

    fn ddram_index(&self, addr: u8) -> usize {
        let addr = addr as usize;
        if self.two_lines {
            if addr >= 0x40 {
                LINE_LENGTH_2 + (addr - 0x40) % LINE_LENGTH_2
            } else {
                addr % LINE_LENGTH_2
            }
        } else {
            addr % DDRAM_SIZE
        }
    }

    fn step_address(&mut self, forward: bool) {
        self.ac = match self.target {
            Target::Cgram => {
                if forward {
                    self.ac.wrapping_add(1) & 0x3F
                } else {
                    self.ac.wrapping_sub(1) & 0x3F
                }
            }
            // Addresses outside a line's window snap to the next valid one
            Target::Ddram if self.two_lines => match (forward, self.ac) {
                (true, 0x27..=0x3F) => 0x40,
                (true, a) if a >= 0x67 => 0x00,
                (true, a) => a + 1,
                (false, 0x00) => 0x67,
                (false, 0x28..=0x40) => 0x27,
                (false, a) if a > 0x67 => 0x67,
                (false, a) => a - 1,
            },
            Target::Ddram => match (forward, self.ac) {
                (true, a) if a >= 0x4F => 0x00,
                (true, a) => a + 1,
                (false, 0x00) => 0x4F,
                (false, a) if a > 0x4F => 0x4F,
                (false, a) => a - 1,
            },
        };
    }

    fn shift_display(&mut self, right: bool) {
        let len = if self.two_lines { LINE_LENGTH_2 } else { DDRAM_SIZE };
        // Shifting the display right moves the window left
        self.shift = if right {
            (self.shift + len - 1) % len
        } else {
            (self.shift + 1) % len
        };
    }

    /// DDRAM address shown at a screen position
    fn visible_address(&self, line: usize, pos: usize) -> u8 {
        if self.two_lines {
            let base = if line == 0 { 0x00 } else { 0x40 };
            base + ((pos + self.shift) % LINE_LENGTH_2) as u8
        } else {
            ((pos + self.shift) % DDRAM_SIZE) as u8
        }
    }

    // ----------------------------------------------------------------------
    // Rendering
    // ----------------------------------------------------------------------

    fn glyph_row(&self, code: u8, row: usize) -> u8 {
        if code < 0x10 {
            return self.cgram[((code & 0x07) as usize) * 8 + row];
        }
        match &self.char_rom {
            Some(rom) => rom
                .get(code as usize * CHAR_ROM_STRIDE + row)
                .copied()
                .unwrap_or(0),
            None => font::glyph_row(code, row),
        }
    }

    /// Walk every dot of a `lines` x `chars` panel, reporting
    /// `(line, pos, y, x, state)` for 5x8 cells.
    pub fn render<F>(&self, lines: usize, chars: usize, mut pixel: F)
    where
        F: FnMut(usize, usize, usize, usize, bool),
    {
        for line in 0..lines {
            let line_visible = self.display_on && (line == 0 || self.two_lines);
            for pos in 0..chars {
                let addr = self.visible_address(line, pos);
                let code = self.ddram[self.ddram_index(addr)];
                let cursor_here = self.target == Target::Ddram && self.ac == addr;
                for y in 0..8 {
                    let mut row = if line_visible { self.glyph_row(code, y) } else { 0 };
                    if line_visible && cursor_here {
                        if self.cursor_on && y == 7 {
                            row = 0x1F;
                        }
                        if self.blink_on && self.blink_phase {
                            row = 0x1F;
                        }
                    }
                    for x in 0..5 {
                        pixel(line, pos, y, x, row & (0x10 >> x) != 0);
                    }
                }
            }
        }
    }

    /// Visible characters per line as text (for headless output)
    pub fn text(&self, lines: usize, chars: usize) -> Vec<String> {
        (0..lines)
            .map(|line| {
                (0..chars)
                    .map(|pos| {
                        let code = self.ddram[self.ddram_index(self.visible_address(line, pos))];
                        match code {
                            0x5C => '\u{a5}',
                            0x20..=0x7D => code as char,
                            0x7E => '\u{2192}',
                            _ => '?',
                        }
                    })
                    .collect()
            })
            .collect()
    }
}
