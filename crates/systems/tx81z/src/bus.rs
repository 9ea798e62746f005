//! TX81Z memory bus
//!
//! Owns every peripheral the CPU can reach and routes accesses through the
//! static map in `memory_map`. The CPU decodes its own I/O block, so the bus
//! only sees port pin traffic for it.
//!
//! # Banking
//! The 64 KiB program EPROM is seen through a 32 KiB window at $8000.
//! Port 6 bit 3 picks the half: 0 = $0000-$7FFF of the image, 1 = $8000-$FFFF.

use crate::config::{BankConfig, MachineConfig};
use crate::lcdc::Hd44780;
use crate::memory_map::{self, Region};
use crate::nvram::Nvram;
use emu_core::apu::{AudioChip, Ym2414};
use emu_core::cpu_hd6301::{MemoryHd6301, Port};
use emu_core::logging::{log, LogCategory, LogLevel};

/// Value returned for addresses nothing drives
pub const OPEN_BUS: u8 = 0x00;

const INTERNAL_RAM_SIZE: usize = 0xC0;

pub struct Tx81zBus {
    /// Program region (empty until a BIOS is mounted)
    rom: Vec<u8>,
    bank: usize,
    bank_config: BankConfig,
    internal_ram: [u8; INTERNAL_RAM_SIZE],
    pub nvram: Nvram,
    pub ym: Ym2414,
    pub lcdc: Hd44780,
    /// Last value driven on each CPU port
    port_outputs: [u8; 7],
}

impl Tx81zBus {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            rom: Vec::new(),
            bank: 0,
            bank_config: config.bank.clone(),
            internal_ram: [0; INTERNAL_RAM_SIZE],
            nvram: Nvram::new(config.nvram.size, config.nvram.default),
            ym: Ym2414::new(config.fm.clock_hz),
            lcdc: Hd44780::new(),
            port_outputs: [0xFF; 7],
        }
    }

    pub fn load_rom(&mut self, data: &[u8]) {
        self.rom = data.to_vec();
    }

    pub fn clear_rom(&mut self) {
        self.rom.clear();
    }

    pub fn has_rom(&self) -> bool {
        !self.rom.is_empty()
    }

    pub fn current_bank(&self) -> usize {
        self.bank
    }

    pub fn internal_ram(&self) -> &[u8] {
        &self.internal_ram
    }

    pub fn internal_ram_mut(&mut self) -> &mut [u8] {
        &mut self.internal_ram
    }

    pub fn port_output(&self, port: Port) -> u8 {
        self.port_outputs[port as usize]
    }

    /// Restore banking after a state load without replaying port writes
    pub fn set_bank(&mut self, bank: usize) {
        self.bank = bank % self.bank_config.banks.max(1);
    }

    /// Reset peripherals. NVRAM and ROM survive.
    pub fn reset(&mut self) {
        self.bank = 0;
        self.internal_ram = [0; INTERNAL_RAM_SIZE];
        self.ym.reset();
        self.lcdc.reset();
        self.port_outputs = [0xFF; 7];
    }

    fn rom_byte(&self, offset: usize) -> u8 {
        self.rom
            .get(self.bank * self.bank_config.bank_size + offset)
            .copied()
            .unwrap_or(OPEN_BUS)
    }
}

impl MemoryHd6301 for Tx81zBus {
    fn read(&mut self, addr: u16) -> u8 {
        let Some(entry) = memory_map::lookup(addr) else {
            log(LogCategory::Bus, LogLevel::Debug, || {
                format!("TX81Z: read from unmapped address {:04X}", addr)
            });
            return OPEN_BUS;
        };
        let offset = entry.offset(addr);
        match entry.region {
            Region::InternalRam => self.internal_ram[offset],
            Region::Ym2414 => self.ym.read_register(addr),
            Region::Lcdc => self.lcdc.read(addr),
            Region::Nvram => self.nvram.read(offset),
            Region::RomBank => self.rom_byte(offset),
            Region::InternalIo => OPEN_BUS,
        }
    }

    fn write(&mut self, addr: u16, val: u8) {
        let Some(entry) = memory_map::lookup(addr) else {
            log(LogCategory::Bus, LogLevel::Debug, || {
                format!("TX81Z: write {:02X} to unmapped address {:04X}", val, addr)
            });
            return;
        };
        let offset = entry.offset(addr);
        match entry.region {
            Region::InternalRam => self.internal_ram[offset] = val,
            Region::Ym2414 => self.ym.write_register(addr, val),
            Region::Lcdc => self.lcdc.write(addr, val),
            Region::Nvram => self.nvram.write(offset, val),
            Region::RomBank => {
                log(LogCategory::Bus, LogLevel::Debug, || {
                    format!("TX81Z: ignored write {:02X} to ROM at {:04X}", val, addr)
                });
            }
            Region::InternalIo => {}
        }
    }

    fn port_write(&mut self, port: Port, val: u8) {
        self.port_outputs[port as usize] = val;
        if port == self.bank_config.port {
            let bank = self.bank_config.bank_for(val);
            if bank != self.bank {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("TX81Z: ROM bank {} -> {}", self.bank, bank)
                });
                self.bank = bank;
            }
        }
    }
}
