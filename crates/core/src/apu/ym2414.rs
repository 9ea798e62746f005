//! Yamaha YM2414 (OPZ) FM Operator Type-Z
//!
//! The OPZ is the 8-voice, 4-operator FM chip of the TX81Z and DX11. Its host
//! interface is the same two-port layout as the YM2151:
//!
//! | A0 | Write            | Read   |
//! |----|------------------|--------|
//! | 0  | register address | status |
//! | 1  | register data    | status |
//!
//! Status bits: 7 = busy, 1 = timer B overflow, 0 = timer A overflow.
//!
//! # Timers
//! - Timer A: 10-bit value from registers 0x10 (bits 9-2) and 0x11 (bits 1-0),
//!   period `64 * (1024 - N)` chip clocks
//! - Timer B: 8-bit value from register 0x12, period `1024 * (256 - N)` chip clocks
//! - Register 0x14: bit 5/4 reset flag B/A, bit 3/2 IRQ enable B/A, bit 1/0 load B/A
//!
//! Only the register interface is emulated. Voice synthesis is not, and both
//! outputs stay at zero.

use crate::apu::AudioChip;
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

const REG_KEY_ON: u8 = 0x08;
const REG_CLKA_HI: u8 = 0x10;
const REG_CLKA_LO: u8 = 0x11;
const REG_CLKB: u8 = 0x12;
const REG_TIMER_CONTROL: u8 = 0x14;

const STATUS_BUSY: u8 = 0x80;
const STATUS_TIMER_B: u8 = 0x02;
const STATUS_TIMER_A: u8 = 0x01;

/// Chip clocks the busy flag stays set after a data write
pub const BUSY_CLOCKS: u32 = 64;
/// Chip clocks per output sample
pub const CLOCKS_PER_SAMPLE: u32 = 64;

/// Serializable chip state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ym2414State {
    pub registers: Vec<u8>,
    pub address: u8,
    pub status: u8,
    pub busy_clocks: u32,
    pub timer_a_counter: u32,
    pub timer_b_counter: u32,
    pub sample_clocks: u32,
}

/// YM2414 register/timer model
#[derive(Debug, Clone)]
pub struct Ym2414 {
    clock_hz: u32,
    registers: [u8; 256],
    /// Latched register address
    address: u8,
    /// Timer flags (busy is derived from `busy_clocks`)
    status: u8,
    busy_clocks: u32,
    /// Chip clocks left until the timer overflows
    timer_a_counter: u32,
    timer_b_counter: u32,
    /// Clocks accumulated toward the next output sample
    sample_clocks: u32,
}

impl Ym2414 {
    /// Create a chip clocked at `clock_hz`
    pub fn new(clock_hz: u32) -> Self {
        let mut chip = Self {
            clock_hz,
            registers: [0; 256],
            address: 0,
            status: 0,
            busy_clocks: 0,
            timer_a_counter: 0,
            timer_b_counter: 0,
            sample_clocks: 0,
        };
        chip.timer_a_counter = chip.timer_a_period();
        chip.timer_b_counter = chip.timer_b_period();
        chip
    }

    /// Timer A period in chip clocks
    pub fn timer_a_period(&self) -> u32 {
        let n = ((self.registers[REG_CLKA_HI as usize] as u32) << 2)
            | (self.registers[REG_CLKA_LO as usize] as u32 & 0x03);
        64 * (1024 - n)
    }

    /// Timer B period in chip clocks
    pub fn timer_b_period(&self) -> u32 {
        1024 * (256 - self.registers[REG_CLKB as usize] as u32)
    }

    /// Current value of a register
    pub fn register(&self, reg: u8) -> u8 {
        self.registers[reg as usize]
    }

    /// Status byte as seen by the host
    pub fn status(&self) -> u8 {
        let busy = if self.busy_clocks > 0 { STATUS_BUSY } else { 0 };
        self.status | busy
    }

    fn control(&self) -> u8 {
        self.registers[REG_TIMER_CONTROL as usize]
    }

    fn write_data(&mut self, val: u8) {
        let reg = self.address;
        let old_control = self.control();
        self.registers[reg as usize] = val;
        self.busy_clocks = BUSY_CLOCKS;

        match reg {
            REG_KEY_ON => {
                log(LogCategory::Sound, LogLevel::Debug, || {
                    format!(
                        "YM2414: key {} channel {} (ops {:04b})",
                        if val & 0x78 != 0 { "on" } else { "off" },
                        val & 0x07,
                        (val >> 3) & 0x0F
                    )
                });
            }
            REG_TIMER_CONTROL => {
                // Reload on the 0 -> 1 edge of the load bits
                if val & 0x01 != 0 && old_control & 0x01 == 0 {
                    self.timer_a_counter = self.timer_a_period();
                }
                if val & 0x02 != 0 && old_control & 0x02 == 0 {
                    self.timer_b_counter = self.timer_b_period();
                }
                if val & 0x10 != 0 {
                    self.status &= !STATUS_TIMER_A;
                }
                if val & 0x20 != 0 {
                    self.status &= !STATUS_TIMER_B;
                }
            }
            _ => {
                log(LogCategory::Sound, LogLevel::Trace, || {
                    format!("YM2414: reg {:02X} <- {:02X}", reg, val)
                });
            }
        }
    }

    /// Run one timer; returns true each time it overflows
    fn run_timer(counter: &mut u32, period: u32, mut clocks: u32) -> bool {
        let mut overflowed = false;
        while clocks >= *counter {
            clocks -= *counter;
            *counter = period;
            overflowed = true;
        }
        *counter -= clocks;
        overflowed
    }

    pub fn save_state(&self) -> Ym2414State {
        Ym2414State {
            registers: self.registers.to_vec(),
            address: self.address,
            status: self.status,
            busy_clocks: self.busy_clocks,
            timer_a_counter: self.timer_a_counter,
            timer_b_counter: self.timer_b_counter,
            sample_clocks: self.sample_clocks,
        }
    }

    pub fn load_state(&mut self, state: &Ym2414State) {
        let len = state.registers.len().min(self.registers.len());
        self.registers[..len].copy_from_slice(&state.registers[..len]);
        self.address = state.address;
        self.status = state.status & (STATUS_TIMER_A | STATUS_TIMER_B);
        self.busy_clocks = state.busy_clocks;
        self.timer_a_counter = state.timer_a_counter.max(1);
        self.timer_b_counter = state.timer_b_counter.max(1);
        self.sample_clocks = state.sample_clocks % CLOCKS_PER_SAMPLE;
    }
}

impl AudioChip for Ym2414 {
    fn write_register(&mut self, addr: u16, val: u8) {
        if addr & 1 == 0 {
            self.address = val;
        } else {
            self.write_data(val);
        }
    }

    fn read_register(&self, _addr: u16) -> u8 {
        self.status()
    }

    fn advance(&mut self, clocks: u32) -> u32 {
        self.busy_clocks = self.busy_clocks.saturating_sub(clocks);

        let control = self.control();
        if control & 0x01 != 0 {
            let period = self.timer_a_period();
            if Self::run_timer(&mut self.timer_a_counter, period, clocks) && control & 0x04 != 0
            {
                if self.status & STATUS_TIMER_A == 0 {
                    log(LogCategory::Interrupts, LogLevel::Trace, || {
                        "YM2414: timer A IRQ".to_string()
                    });
                }
                self.status |= STATUS_TIMER_A;
            }
        }
        if control & 0x02 != 0 {
            let period = self.timer_b_period();
            if Self::run_timer(&mut self.timer_b_counter, period, clocks) && control & 0x08 != 0
            {
                if self.status & STATUS_TIMER_B == 0 {
                    log(LogCategory::Interrupts, LogLevel::Trace, || {
                        "YM2414: timer B IRQ".to_string()
                    });
                }
                self.status |= STATUS_TIMER_B;
            }
        }

        self.sample_clocks += clocks;
        let samples = self.sample_clocks / CLOCKS_PER_SAMPLE;
        self.sample_clocks %= CLOCKS_PER_SAMPLE;
        samples
    }

    fn output(&self, _channel: usize) -> i16 {
        0
    }

    fn output_count(&self) -> usize {
        2
    }

    fn clock_hz(&self) -> f64 {
        self.clock_hz as f64
    }

    fn clocks_per_sample(&self) -> u32 {
        CLOCKS_PER_SAMPLE
    }

    fn irq(&self) -> bool {
        self.status & (STATUS_TIMER_A | STATUS_TIMER_B) != 0
    }

    fn reset(&mut self) {
        self.registers = [0; 256];
        self.address = 0;
        self.status = 0;
        self.busy_clocks = 0;
        self.sample_clocks = 0;
        self.timer_a_counter = self.timer_a_period();
        self.timer_b_counter = self.timer_b_period();
    }
}
