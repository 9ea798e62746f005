//! Machine configuration for the TX81Z
//!
//! Everything the system instantiates is declared here as plain data: which
//! chips exist, their clocks, how their interrupt and audio outputs are
//! routed, the display geometry and the ROM banking. `Tx81zSystem::new`
//! builds the hardware from this description, so a test can check the wiring
//! without running any code.

use crate::memory_map::{self, Region, MEMORY_MAP};
use emu_core::cpu_hd6301::Port;

/// Main crystal (7.15909 MHz)
pub const MAIN_CLOCK_HZ: u32 = 7_159_090;
/// MIDI serial clock fed to the CPU's SCI clock pin
pub const MIDI_CLOCK_HZ: u32 = 500_000;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Screen is {screen_width}x{screen_height} but the LCD produces {lcd_width}x{lcd_height}")]
    ScreenGeometry {
        screen_width: u32,
        screen_height: u32,
        lcd_width: u32,
        lcd_height: u32,
    },
    #[error("NVRAM is {size} bytes but its memory window is {window} bytes")]
    NvramWindow { size: usize, window: usize },
    #[error("{banks} ROM banks of {bank_size} bytes do not tile a {program_size} byte program region")]
    RomBanks {
        banks: usize,
        bank_size: usize,
        program_size: usize,
    },
    #[error("ROM bank window is {window} bytes but banks are {bank_size} bytes")]
    BankWindow { window: usize, bank_size: usize },
    #[error("Bank select bit {bit} does not exist")]
    BankSelectBit { bit: u8 },
    #[error("Memory map region '{region}' is empty")]
    EmptyRange { region: &'static str },
    #[error("Memory map is not sorted at region '{region}'")]
    UnsortedMap { region: &'static str },
    #[error("Memory map regions '{first}' and '{second}' overlap")]
    OverlappingRanges {
        first: &'static str,
        second: &'static str,
    },
    #[error("Memory map names region '{region}' {count} times")]
    RegionCount { region: &'static str, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Boots firmware but is not expected to work as a synthesizer
    Skeleton,
    Working,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuConfig {
    pub model: &'static str,
    pub clock_hz: u32,
    /// Crystal to E clock divider
    pub clock_divider: u32,
}

impl CpuConfig {
    /// Bus (E) clock in Hz
    pub fn e_clock_hz(&self) -> f64 {
        self.clock_hz as f64 / self.clock_divider as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqLine {
    Irq1,
    Irq2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundRoute {
    pub output: usize,
    pub speaker: Speaker,
    pub gain: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FmConfig {
    pub model: &'static str,
    pub clock_hz: u32,
    pub irq: IrqLine,
    pub routes: Vec<SoundRoute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenConfig {
    pub refresh_hz: f64,
    pub vblank_us: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcdConfig {
    pub lines: usize,
    pub chars_per_line: usize,
    /// Character cell in pixels (5x8 glyph plus a blank column)
    pub cell_width: u32,
    pub cell_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvramDefault {
    AllZero,
    AllOnes,
}

impl NvramDefault {
    pub fn fill_byte(self) -> u8 {
        match self {
            NvramDefault::AllZero => 0x00,
            NvramDefault::AllOnes => 0xFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvramConfig {
    pub size: usize,
    pub default: NvramDefault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankConfig {
    pub port: Port,
    pub bit: u8,
    pub banks: usize,
    pub bank_size: usize,
    pub program_size: usize,
}

impl BankConfig {
    /// Bank selected by a port output value
    pub fn bank_for(&self, port_value: u8) -> usize {
        (port_value.checked_shr(self.bit as u32).unwrap_or(0) & 1) as usize % self.banks.max(1)
    }
}

/// Full machine declaration
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub name: &'static str,
    pub full_name: &'static str,
    pub manufacturer: &'static str,
    pub year: u16,
    pub status: MachineStatus,
    pub cpu: CpuConfig,
    pub fm: FmConfig,
    pub midi_clock_hz: u32,
    pub screen: ScreenConfig,
    /// Pen colors as RGB
    pub palette: Vec<(u8, u8, u8)>,
    pub lcd: LcdConfig,
    pub nvram: NvramConfig,
    pub bank: BankConfig,
}

impl MachineConfig {
    pub fn tx81z() -> Self {
        Self {
            name: "tx81z",
            full_name: "TX81Z FM Tone Generator",
            manufacturer: "Yamaha",
            year: 1987,
            status: MachineStatus::Skeleton,
            cpu: CpuConfig {
                model: "HD6303X",
                clock_hz: MAIN_CLOCK_HZ,
                clock_divider: 4,
            },
            fm: FmConfig {
                model: "YM2414",
                clock_hz: MAIN_CLOCK_HZ / 2,
                irq: IrqLine::Irq1,
                routes: vec![
                    SoundRoute {
                        output: 0,
                        speaker: Speaker::Left,
                        gain: 0.60,
                    },
                    SoundRoute {
                        output: 1,
                        speaker: Speaker::Right,
                        gain: 0.60,
                    },
                ],
            },
            midi_clock_hz: MIDI_CLOCK_HZ,
            screen: ScreenConfig {
                refresh_hz: 60.0,
                vblank_us: 2500,
                width: 6 * 16,
                height: 8 * 2,
            },
            palette: vec![(131, 136, 139), (92, 83, 88)],
            lcd: LcdConfig {
                lines: 2,
                chars_per_line: 16,
                cell_width: 6,
                cell_height: 8,
            },
            nvram: NvramConfig {
                size: 0x2000,
                default: NvramDefault::AllZero,
            },
            bank: BankConfig {
                port: Port::P6,
                bit: 3,
                banks: 2,
                bank_size: 0x8000,
                program_size: 0x10000,
            },
        }
    }

    /// CPU E cycles per emulated frame
    pub fn cycles_per_frame(&self) -> f64 {
        self.cpu.e_clock_hz() / self.screen.refresh_hz
    }

    /// Check the declaration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        memory_map::validate(&MEMORY_MAP)?;

        let lcd_width = self.lcd.chars_per_line as u32 * self.lcd.cell_width;
        let lcd_height = self.lcd.lines as u32 * self.lcd.cell_height;
        if self.screen.width != lcd_width || self.screen.height != lcd_height {
            return Err(ConfigError::ScreenGeometry {
                screen_width: self.screen.width,
                screen_height: self.screen.height,
                lcd_width,
                lcd_height,
            });
        }

        let nvram_window = memory_map::region(Region::Nvram).map_or(0, |e| e.len());
        if self.nvram.size != nvram_window {
            return Err(ConfigError::NvramWindow {
                size: self.nvram.size,
                window: nvram_window,
            });
        }

        if self.bank.banks * self.bank.bank_size != self.bank.program_size {
            return Err(ConfigError::RomBanks {
                banks: self.bank.banks,
                bank_size: self.bank.bank_size,
                program_size: self.bank.program_size,
            });
        }

        let bank_window = memory_map::region(Region::RomBank).map_or(0, |e| e.len());
        if bank_window != self.bank.bank_size {
            return Err(ConfigError::BankWindow {
                window: bank_window,
                bank_size: self.bank.bank_size,
            });
        }

        if self.bank.bit > 7 {
            return Err(ConfigError::BankSelectBit { bit: self.bank.bit });
        }

        Ok(())
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::tx81z()
    }
}
