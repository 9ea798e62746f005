//! Yamaha TX81Z FM tone generator
//!
//! An HD6303X runs the firmware out of a banked 64 KiB EPROM, drives a
//! YM2414 through two registers and shows its menus on a 2x16 HD44780 panel.
//! MIDI arrives and leaves through the CPU's serial interface. Patches live in
//! 8 KiB of battery-backed RAM.
//!
//! The machine is declared in [`config::MachineConfig`] and built by
//! [`Tx81zSystem::new`]. Sound is modeled at the register/timer level only,
//! so the firmware sees a working chip but the audio output is silent.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use emu_core::apu::ym2414::Ym2414State;
use emu_core::apu::AudioChip;
use emu_core::cpu_hd6301::{CpuHd6301, Hd6301State};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::renderer::Renderer;
use emu_core::{types::Frame, MountPointInfo, System};
use serde::de::Error as _;

pub mod bus;
pub mod config;
mod font;
pub mod lcd_renderer;
pub mod lcdc;
pub mod memory_map;
pub mod nvram;
pub mod rom;

use bus::Tx81zBus;
use config::{ConfigError, IrqLine, MachineConfig, Speaker};
use lcd_renderer::LcdRenderer;
use nvram::{Nvram, NvramError};
use rom::{BiosVariant, RomError, RomSet, PROGRAM_SIZE};

pub const MOUNT_BIOS: &str = "BIOS";
pub const MOUNT_CHARACTER_ROM: &str = "CharacterRom";

#[derive(thiserror::Error, Debug)]
pub enum Tx81zError {
    #[error("No BIOS loaded")]
    NoBios,
    #[error("Invalid mount point")]
    InvalidMountPoint,
    #[error("Character ROM must be {expected} bytes, got {actual}")]
    InvalidCharacterRom { expected: usize, actual: usize },
    #[error(transparent)]
    Rom(#[from] RomError),
    #[error(transparent)]
    Nvram(#[from] NvramError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct Tx81zSystem {
    config: MachineConfig,
    cpu: CpuHd6301<Tx81zBus>,
    renderer: LcdRenderer,
    bios_loaded: bool,
    /// Known dump the mounted image matched, if any
    bios: Option<BiosVariant>,
    cycles_per_frame: f64,
    /// Cycles owed to (positive) or borrowed from (negative) the next frame
    cycle_carry: f64,
    chip_clocks_per_cycle: f64,
    chip_clock_carry: f64,
    ns_per_cycle: f64,
    frame_count: u64,
    /// Interleaved left/right samples not yet taken by the frontend
    audio: Vec<i16>,
}

impl Default for Tx81zSystem {
    fn default() -> Self {
        Self::build(MachineConfig::tx81z())
    }
}

impl Tx81zSystem {
    /// Build a system from a validated declaration
    pub fn new(config: MachineConfig) -> Result<Self, Tx81zError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: MachineConfig) -> Self {
        let e_clock = config.cpu.e_clock_hz();
        let bus = Tx81zBus::new(&config);
        let mut cpu = CpuHd6301::new(bus);
        cpu.set_sci_external_clock(config.midi_clock_hz, e_clock.round() as u32);

        Self {
            renderer: LcdRenderer::new(&config),
            cycles_per_frame: config.cycles_per_frame(),
            chip_clocks_per_cycle: config.fm.clock_hz as f64 / e_clock,
            ns_per_cycle: 1.0e9 / e_clock,
            config,
            cpu,
            bios_loaded: false,
            bios: None,
            cycle_carry: 0.0,
            chip_clock_carry: 0.0,
            frame_count: 0,
            audio: Vec::new(),
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// The known firmware revision that is mounted, if it matched one
    pub fn bios(&self) -> Option<&BiosVariant> {
        self.bios.as_ref()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn nvram(&self) -> &Nvram {
        &self.cpu.memory.nvram
    }

    pub fn nvram_mut(&mut self) -> &mut Nvram {
        &mut self.cpu.memory.nvram
    }

    /// Feed bytes into the MIDI IN port
    pub fn midi_in(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.cpu.sci_receive(byte);
        }
    }

    /// Bytes the firmware sent out of MIDI OUT since the last call
    pub fn take_midi_out(&mut self) -> Vec<u8> {
        self.cpu.take_sci_output()
    }

    /// Drain the interleaved stereo samples produced so far
    pub fn get_audio_samples(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.audio)
    }

    pub fn audio_sample_rate(&self) -> f64 {
        self.cpu.memory.ym.sample_rate()
    }

    /// Panel contents as text, one string per line
    pub fn lcd_text(&self) -> Vec<String> {
        self.cpu
            .memory
            .lcdc
            .text(self.config.lcd.lines, self.config.lcd.chars_per_line)
    }

    /// Return debug information useful for inspecting execution state.
    pub fn debug_state(&self) -> serde_json::Value {
        let bus = &self.cpu.memory;
        serde_json::json!({
            "pc": format!("{:04X}", self.cpu.pc),
            "a": self.cpu.a,
            "b": self.cpu.b,
            "x": format!("{:04X}", self.cpu.x),
            "sp": format!("{:04X}", self.cpu.sp),
            "cc": format!("{:02X}", self.cpu.cc),
            "cycles": self.cpu.cycles,
            "run_state": format!("{:?}", self.cpu.run_state()),
            "rom_bank": bus.current_bank(),
            "bios": self.bios.map(|b| b.name),
            "ym_status": bus.ym.status(),
            "ym_irq": bus.ym.irq(),
            "lcd_busy": bus.lcdc.is_busy(),
            "lcd": self.lcd_text(),
            "nvram_dirty": bus.nvram.is_dirty(),
            "frame": self.frame_count,
        })
    }

    fn run_cycles(&mut self, cycles: u32) {
        let clocks = cycles as f64 * self.chip_clocks_per_cycle + self.chip_clock_carry;
        let whole = clocks.floor();
        self.chip_clock_carry = clocks - whole;

        let bus = &mut self.cpu.memory;
        let samples = bus.ym.advance(whole as u32);
        for _ in 0..samples {
            let mut stereo = [0i32; 2];
            for route in &self.config.fm.routes {
                let value = bus.ym.output(route.output) as f32 * route.gain;
                let slot = match route.speaker {
                    Speaker::Left => 0,
                    Speaker::Right => 1,
                };
                stereo[slot] += value as i32;
            }
            self.audio.extend(
                stereo
                    .iter()
                    .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16),
            );
        }

        bus.lcdc.tick((cycles as f64 * self.ns_per_cycle).round() as u64);

        let irq = bus.ym.irq();
        match self.config.fm.irq {
            IrqLine::Irq1 => self.cpu.set_irq1(irq),
            IrqLine::Irq2 => self.cpu.set_irq2(irq),
        }
    }
}

impl System for Tx81zSystem {
    type Error = Tx81zError;

    fn reset(&mut self) {
        self.cpu.memory.reset();
        self.cpu.reset();
        self.renderer.reset();
        self.cycle_carry = 0.0;
        self.chip_clock_carry = 0.0;
        self.audio.clear();
    }

    fn step_frame(&mut self) -> Result<Frame, Self::Error> {
        if !self.bios_loaded {
            return Err(Tx81zError::NoBios);
        }

        let budget = self.cycles_per_frame + self.cycle_carry;
        let mut executed = 0u64;
        while (executed as f64) < budget {
            let cycles = self.cpu.step();
            executed += cycles as u64;
            self.run_cycles(cycles);
        }
        self.cycle_carry = budget - executed as f64;

        self.cpu.memory.lcdc.frame_tick();
        self.renderer.render(&self.cpu.memory.lcdc);
        self.frame_count += 1;

        Ok(self.renderer.get_frame().clone())
    }

    fn save_state(&self) -> serde_json::Value {
        let bus = &self.cpu.memory;
        serde_json::json!({
            "system": "tx81z",
            "version": 1,
            "cpu": self.cpu.save_state(),
            "rom_bank": bus.current_bank(),
            "internal_ram": BASE64.encode(bus.internal_ram()),
            "nvram": BASE64.encode(bus.nvram.contents()),
            "ym2414": bus.ym.save_state(),
            "lcdc": bus.lcdc,
            "timing": {
                "cycle_carry": self.cycle_carry,
                "chip_clock_carry": self.chip_clock_carry,
                "frame_count": self.frame_count,
            },
        })
    }

    fn load_state(&mut self, v: &serde_json::Value) -> Result<(), serde_json::Error> {
        macro_rules! load_f64 {
            ($state:expr, $field:literal, $target:expr) => {
                if let Some(val) = $state.get($field).and_then(|v| v.as_f64()) {
                    $target = val;
                }
            };
        }

        macro_rules! load_u64 {
            ($state:expr, $field:literal, $target:expr) => {
                if let Some(val) = $state.get($field).and_then(|v| v.as_u64()) {
                    $target = val;
                }
            };
        }

        if v.get("system").and_then(|s| s.as_str()) != Some("tx81z") {
            return Err(serde_json::Error::custom("not a TX81Z save state"));
        }

        // Decode and check every section before touching the machine
        let decode = |field: &str| -> Result<Option<Vec<u8>>, serde_json::Error> {
            match v.get(field).and_then(|s| s.as_str()) {
                Some(text) => BASE64
                    .decode(text)
                    .map(Some)
                    .map_err(|e| serde_json::Error::custom(format!("{}: {}", field, e))),
                None => Ok(None),
            }
        };
        let internal_ram = decode("internal_ram")?;
        let nvram = decode("nvram")?;
        if let Some(ram) = &internal_ram {
            let expected = self.cpu.memory.internal_ram().len();
            if ram.len() != expected {
                return Err(serde_json::Error::custom(format!(
                    "internal RAM is {} bytes, expected {}",
                    ram.len(),
                    expected
                )));
            }
        }
        if let Some(bytes) = &nvram {
            let expected = self.cpu.memory.nvram.size();
            if bytes.len() != expected {
                return Err(serde_json::Error::custom(format!(
                    "NVRAM is {} bytes, expected {}",
                    bytes.len(),
                    expected
                )));
            }
        }

        let cpu: Option<Hd6301State> = v
            .get("cpu")
            .map(|cpu| serde_json::from_value(cpu.clone()))
            .transpose()?;
        let ym: Option<Ym2414State> = v
            .get("ym2414")
            .map(|ym| serde_json::from_value(ym.clone()))
            .transpose()?;
        let lcdc: Option<lcdc::Hd44780> = v
            .get("lcdc")
            .map(|lcdc| serde_json::from_value(lcdc.clone()))
            .transpose()?;
        if lcdc.as_ref().is_some_and(|l| !l.is_well_formed()) {
            return Err(serde_json::Error::custom("malformed LCD controller state"));
        }

        // Commit
        if let Some(state) = cpu {
            self.cpu.load_state(&state);
        }
        let bus = &mut self.cpu.memory;
        if let Some(state) = ym {
            bus.ym.load_state(&state);
        }
        if let Some(mut restored) = lcdc {
            restored.set_char_rom(bus.lcdc.take_char_rom());
            bus.lcdc = restored;
        }
        if let Some(bank) = v.get("rom_bank").and_then(|b| b.as_u64()) {
            bus.set_bank(bank as usize);
        }
        if let Some(ram) = internal_ram {
            bus.internal_ram_mut().copy_from_slice(&ram);
        }
        if let Some(bytes) = nvram {
            bus.nvram
                .load(&bytes)
                .map_err(|e| serde_json::Error::custom(e.to_string()))?;
        }

        if let Some(timing) = v.get("timing") {
            load_f64!(timing, "cycle_carry", self.cycle_carry);
            load_f64!(timing, "chip_clock_carry", self.chip_clock_carry);
            load_u64!(timing, "frame_count", self.frame_count);
        }

        self.audio.clear();
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![
            MountPointInfo {
                id: MOUNT_BIOS.to_string(),
                name: "Program EPROM (IC15)".to_string(),
                extensions: vec!["ic15".to_string(), "bin".to_string(), "rom".to_string()],
                required: true,
            },
            MountPointInfo {
                id: MOUNT_CHARACTER_ROM.to_string(),
                name: "LCD Character Generator".to_string(),
                extensions: vec!["bin".to_string(), "rom".to_string()],
                required: false,
            },
        ]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        match mount_point_id {
            MOUNT_BIOS => {
                if data.len() != PROGRAM_SIZE {
                    return Err(RomError::WrongSize {
                        file: MOUNT_BIOS.to_string(),
                        expected: PROGRAM_SIZE,
                        actual: data.len(),
                    }
                    .into());
                }
                self.bios = RomSet::tx81z().identify(data).copied();
                match &self.bios {
                    Some(variant) => log(LogCategory::Bus, LogLevel::Info, || {
                        format!("TX81Z: mounted BIOS '{}' ({})", variant.name, variant.description)
                    }),
                    None => log(LogCategory::Bus, LogLevel::Warn, || {
                        "TX81Z: BIOS image matches no known revision".to_string()
                    }),
                }
                self.cpu.memory.load_rom(data);
                self.bios_loaded = true;
                self.reset();
                Ok(())
            }
            MOUNT_CHARACTER_ROM => {
                if data.len() != lcdc::CHAR_ROM_SIZE {
                    return Err(Tx81zError::InvalidCharacterRom {
                        expected: lcdc::CHAR_ROM_SIZE,
                        actual: data.len(),
                    });
                }
                self.cpu.memory.lcdc.set_char_rom(Some(data.to_vec()));
                Ok(())
            }
            _ => Err(Tx81zError::InvalidMountPoint),
        }
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error> {
        match mount_point_id {
            MOUNT_BIOS => {
                self.cpu.memory.clear_rom();
                self.bios_loaded = false;
                self.bios = None;
                Ok(())
            }
            MOUNT_CHARACTER_ROM => {
                self.cpu.memory.lcdc.set_char_rom(None);
                Ok(())
            }
            _ => Err(Tx81zError::InvalidMountPoint),
        }
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        match mount_point_id {
            MOUNT_BIOS => self.bios_loaded,
            MOUNT_CHARACTER_ROM => self.cpu.memory.lcdc.has_char_rom(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx81z_system_creation() {
        let sys = Tx81zSystem::new(MachineConfig::tx81z()).expect("valid config");
        assert!(!sys.bios_loaded);
        assert!(sys.bios().is_none());
        assert_eq!(sys.nvram().size(), 0x2000);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = MachineConfig::tx81z();
        config.lcd.chars_per_line = 20;
        assert!(matches!(
            Tx81zSystem::new(config),
            Err(Tx81zError::Config(ConfigError::ScreenGeometry { .. }))
        ));
    }

    #[test]
    fn test_tx81z_mount_points() {
        let sys = Tx81zSystem::default();
        let mount_points = sys.mount_points();
        assert_eq!(mount_points.len(), 2);
        assert_eq!(mount_points[0].id, "BIOS");
        assert!(mount_points[0].required);
        assert_eq!(mount_points[1].id, "CharacterRom");
        assert!(!mount_points[1].required);
    }

    #[test]
    fn test_step_frame_without_bios() {
        let mut sys = Tx81zSystem::default();
        assert!(matches!(sys.step_frame(), Err(Tx81zError::NoBios)));
    }

    #[test]
    fn test_mount_validation() {
        let mut sys = Tx81zSystem::default();
        assert!(matches!(
            sys.mount("Cartridge", &[0; 16]),
            Err(Tx81zError::InvalidMountPoint)
        ));
        assert!(matches!(
            sys.mount(MOUNT_BIOS, &[0; 0x8000]),
            Err(Tx81zError::Rom(RomError::WrongSize { .. }))
        ));
        assert!(matches!(
            sys.mount(MOUNT_CHARACTER_ROM, &[0; 100]),
            Err(Tx81zError::InvalidCharacterRom { .. })
        ));
        assert!(!sys.is_mounted(MOUNT_BIOS));

        sys.mount(MOUNT_CHARACTER_ROM, &[0; lcdc::CHAR_ROM_SIZE])
            .expect("char rom");
        assert!(sys.is_mounted(MOUNT_CHARACTER_ROM));
        sys.unmount(MOUNT_CHARACTER_ROM).expect("unmount");
        assert!(!sys.is_mounted(MOUNT_CHARACTER_ROM));
    }

    #[test]
    fn test_unknown_bios_image_still_boots() {
        let mut sys = Tx81zSystem::default();
        let mut rom = vec![0x01u8; PROGRAM_SIZE]; // NOP sled
        rom[0x7FFE] = 0x80;
        rom[0x7FFF] = 0x00;
        sys.mount(MOUNT_BIOS, &rom).expect("mount");
        assert!(sys.is_mounted(MOUNT_BIOS));
        assert!(sys.bios().is_none());
        let frame = sys.step_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (96, 16));
    }

    #[test]
    fn test_load_state_rejects_other_systems() {
        let mut sys = Tx81zSystem::default();
        let state = serde_json::json!({"system": "gb", "version": 1});
        assert!(sys.load_state(&state).is_err());
    }

    #[test]
    fn test_rejected_load_leaves_machine_untouched() {
        let mut sys = Tx81zSystem::default();
        sys.cpu.memory.internal_ram_mut()[0] = 0x5A;
        let before = sys.debug_state();
        let ram_before = sys.cpu.memory.internal_ram().to_vec();
        let nvram_before = sys.nvram().contents().to_vec();

        let mut bad_ram = sys.save_state();
        bad_ram["cpu"]["pc"] = serde_json::json!(0x1234);
        bad_ram["internal_ram"] = serde_json::json!("AAAA");
        assert!(sys.load_state(&bad_ram).is_err());
        assert_eq!(sys.debug_state(), before);
        assert_eq!(sys.cpu.memory.internal_ram(), &ram_before[..]);

        let mut bad_nvram = sys.save_state();
        bad_nvram["cpu"]["pc"] = serde_json::json!(0x1234);
        bad_nvram["nvram"] = serde_json::json!(BASE64.encode([0xFFu8; 16]));
        assert!(sys.load_state(&bad_nvram).is_err());
        assert_eq!(sys.debug_state(), before);
        assert_eq!(sys.nvram().contents(), &nvram_before[..]);

        let mut bad_lcd = sys.save_state();
        bad_lcd["cpu"]["pc"] = serde_json::json!(0x1234);
        bad_lcd["lcdc"]["ddram"] = serde_json::json!([0x41, 0x42]);
        assert!(sys.load_state(&bad_lcd).is_err());
        assert_eq!(sys.debug_state(), before);
    }

    #[test]
    fn test_valid_load_applies_every_section() {
        let mut sys = Tx81zSystem::default();
        let mut state = sys.save_state();
        state["cpu"]["pc"] = serde_json::json!(0x1234);
        let mut ram = vec![0u8; sys.cpu.memory.internal_ram().len()];
        ram[3] = 0x77;
        state["internal_ram"] = serde_json::json!(BASE64.encode(&ram));
        sys.load_state(&state).expect("load");
        assert_eq!(sys.cpu.pc, 0x1234);
        assert_eq!(sys.cpu.memory.internal_ram()[3], 0x77);
    }
}
