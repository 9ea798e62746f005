//! Hitachi HD6301X / HD6303X CPU core implementation
//!
//! The HD6301 family is a CMOS 6801 derivative: the full 6800/6801 instruction
//! set plus AIM/OIM/EIM/TIM, XGDX and SLP, with faster cycle counts and an
//! illegal-opcode TRAP. The X variants carry an on-chip I/O block at
//! 0x0000-0x001F (ports, a 16-bit free-running timer with two output compares,
//! an 8-bit reload timer and a serial communication interface).
//!
//! The HD6303X is the ROM-less part; both divide the crystal by 4 to produce
//! the E clock every cycle count in this module is expressed in.
//!
//! Systems plug in through the `MemoryHd6301` trait. The core decodes the
//! on-chip I/O block itself and forwards every other address to the trait,
//! including the on-chip RAM window, which systems map like ordinary RAM.

use crate::logging::{log, LogCategory, LogConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Memory interface trait for the HD6301 CPU
pub trait MemoryHd6301 {
    /// Read a byte from memory at the given address
    fn read(&mut self, addr: u16) -> u8;

    /// Write a byte to memory at the given address
    fn write(&mut self, addr: u16, val: u8);

    /// Sample the external pins of an I/O port
    fn port_read(&mut self, port: Port) -> u8 {
        let _ = port;
        0xFF
    }

    /// A port's output pins changed. `val` has input pins pulled high.
    fn port_write(&mut self, port: Port, val: u8) {
        let _ = (port, val);
    }
}

/// On-chip I/O ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Port {
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

impl Port {
    pub const ALL: [Port; 7] = [
        Port::P1,
        Port::P2,
        Port::P3,
        Port::P4,
        Port::P5,
        Port::P6,
        Port::P7,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// First address of the on-chip I/O block
pub const IO_START: u16 = 0x0000;
/// Last address of the on-chip I/O block
pub const IO_END: u16 = 0x001F;

/// Interrupt vector addresses
pub mod vectors {
    pub const IRQ2: u16 = 0xFFEA;
    pub const CMI: u16 = 0xFFEC;
    pub const TRAP: u16 = 0xFFEE;
    pub const SCI: u16 = 0xFFF0;
    pub const TOI: u16 = 0xFFF2;
    pub const OCI: u16 = 0xFFF4;
    pub const ICI: u16 = 0xFFF6;
    pub const IRQ1: u16 = 0xFFF8;
    pub const SWI: u16 = 0xFFFA;
    pub const NMI: u16 = 0xFFFC;
    pub const RESET: u16 = 0xFFFE;
}

/// Condition code register bits (bits 6 and 7 always read as 1)
pub mod flags {
    pub const H: u8 = 0x20;
    pub const I: u8 = 0x10;
    pub const N: u8 = 0x08;
    pub const Z: u8 = 0x04;
    pub const V: u8 = 0x02;
    pub const C: u8 = 0x01;
}

use flags::{C, H, I, N, V, Z};

// On-chip register offsets
const REG_P1DDR: u8 = 0x00;
const REG_P2DDR: u8 = 0x01;
const REG_P1DATA: u8 = 0x02;
const REG_P2DATA: u8 = 0x03;
const REG_P3DDR: u8 = 0x04;
const REG_P4DDR: u8 = 0x05;
const REG_P3DATA: u8 = 0x06;
const REG_P4DATA: u8 = 0x07;
const REG_TCSR1: u8 = 0x08;
const REG_FRCH: u8 = 0x09;
const REG_FRCL: u8 = 0x0A;
const REG_OCR1H: u8 = 0x0B;
const REG_OCR1L: u8 = 0x0C;
const REG_ICRH: u8 = 0x0D;
const REG_ICRL: u8 = 0x0E;
const REG_TCSR2: u8 = 0x0F;
const REG_RMCR: u8 = 0x10;
const REG_TRCSR: u8 = 0x11;
const REG_RDR: u8 = 0x12;
const REG_TDR: u8 = 0x13;
const REG_RCR: u8 = 0x14;
const REG_P5DATA: u8 = 0x15;
const REG_P6DDR: u8 = 0x16;
const REG_P6DATA: u8 = 0x17;
const REG_P7DATA: u8 = 0x18;
const REG_OCR2H: u8 = 0x19;
const REG_OCR2L: u8 = 0x1A;
const REG_TCSR3: u8 = 0x1B;
const REG_TCONR: u8 = 0x1C;
const REG_T2CNT: u8 = 0x1D;

// TCSR1
const TCSR_ICF: u8 = 0x80;
const TCSR_OCF1: u8 = 0x40;
const TCSR_TOF: u8 = 0x20;
const TCSR_EICI: u8 = 0x10;
const TCSR_EOCI1: u8 = 0x08;
const TCSR_ETOI: u8 = 0x04;
// TCSR2
const TCSR2_OCF2: u8 = 0x20;
const TCSR2_EOCI2: u8 = 0x10;
// TCSR3
const TCSR3_CMF: u8 = 0x80;
const TCSR3_ECMI: u8 = 0x40;
const TCSR3_T2E: u8 = 0x20;
// TRCSR
const TRCSR_RDRF: u8 = 0x80;
const TRCSR_ORFE: u8 = 0x40;
const TRCSR_TDRE: u8 = 0x20;
const TRCSR_RIE: u8 = 0x10;
const TRCSR_RE: u8 = 0x08;
const TRCSR_TIE: u8 = 0x04;
const TRCSR_TE: u8 = 0x02;

/// Cycles for interrupt entry (hardware interrupts, SWI and TRAP)
const INTERRUPT_CYCLES: u32 = 12;
/// Cycles burned per step while waiting in WAI or SLP
const IDLE_CYCLES: u32 = 4;
/// Bits per serial frame (start + 8 data + stop)
const SCI_FRAME_BITS: u32 = 10;

// 0 marks an illegal opcode (TRAP)
#[rustfmt::skip]
const CYCLES: [u8; 256] = [
    /*       0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F */
    /* 0 */  0, 1, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    /* 1 */  1, 1, 0, 0, 0, 0, 1, 1, 2, 2, 4, 1, 0, 0, 0, 0,
    /* 2 */  3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
    /* 3 */  1, 1, 3, 3, 1, 1, 4, 4, 4, 5, 1,10, 5, 7, 9,12,
    /* 4 */  1, 0, 0, 1, 1, 0, 1, 1, 1, 1, 1, 0, 1, 1, 0, 1,
    /* 5 */  1, 0, 0, 1, 1, 0, 1, 1, 1, 1, 1, 0, 1, 1, 0, 1,
    /* 6 */  6, 7, 7, 6, 6, 7, 6, 6, 6, 6, 6, 5, 6, 4, 3, 5,
    /* 7 */  6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 4, 6, 4, 3, 5,
    /* 8 */  2, 2, 2, 3, 2, 2, 2, 0, 2, 2, 2, 2, 3, 5, 3, 0,
    /* 9 */  3, 3, 3, 4, 3, 3, 3, 3, 3, 3, 3, 3, 4, 5, 4, 4,
    /* A */  4, 4, 4, 5, 4, 4, 4, 4, 4, 4, 4, 4, 5, 5, 5, 5,
    /* B */  4, 4, 4, 5, 4, 4, 4, 4, 4, 4, 4, 4, 5, 6, 5, 5,
    /* C */  2, 2, 2, 3, 2, 2, 2, 0, 2, 2, 2, 2, 3, 0, 3, 0,
    /* D */  3, 3, 3, 4, 3, 3, 3, 3, 3, 3, 3, 3, 4, 4, 4, 4,
    /* E */  4, 4, 4, 5, 4, 4, 4, 4, 4, 4, 4, 4, 5, 5, 5, 5,
    /* F */  4, 4, 4, 5, 4, 4, 4, 4, 4, 4, 4, 4, 5, 5, 5, 5,
];

/// Execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Running,
    /// WAI: registers already stacked, waiting for an interrupt
    Waiting,
    /// SLP: halted until any interrupt source requests service
    Sleeping,
}

/// On-chip peripheral registers (ports, timers, SCI)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChipIo {
    pub port_ddr: [u8; 7],
    pub port_data: [u8; 7],

    /// Free-running counter
    pub frc: u16,
    /// Low byte latched by a read of the counter high byte
    frc_read_latch: u8,
    /// High byte held by a write of the counter high byte
    frc_write_latch: u8,
    pub ocr1: u16,
    pub ocr2: u16,
    pub icr: u16,
    pub tcsr1: u8,
    pub tcsr2: u8,
    /// Timer flags seen by the last TCSR read, eligible for clearing
    timer_flags_armed: u8,

    pub t2cnt: u8,
    pub tconr: u8,
    pub tcsr3: u8,
    t2_prescale: u32,

    pub rmcr: u8,
    pub trcsr: u8,
    pub rdr: u8,
    pub tdr: u8,
    /// Serial flags seen by the last TRCSR read
    sci_flags_armed: u8,
    /// Byte in the transmit shift register and cycles until it is out
    tx_shift: Option<u8>,
    tx_cycles: u32,
    rx_cycles: u32,
    rx_queue: VecDeque<u8>,
    tx_out: Vec<u8>,

    pub rcr: u8,
}

impl Default for OnChipIo {
    fn default() -> Self {
        Self {
            // Port 5 is input-only, port 7 output-only
            port_ddr: [0, 0, 0, 0, 0x00, 0, 0xFF],
            port_data: [0; 7],
            frc: 0,
            frc_read_latch: 0,
            frc_write_latch: 0,
            ocr1: 0xFFFF,
            ocr2: 0xFFFF,
            icr: 0,
            tcsr1: 0,
            tcsr2: 0,
            timer_flags_armed: 0,
            t2cnt: 0,
            tconr: 0xFF,
            tcsr3: 0,
            t2_prescale: 0,
            rmcr: 0,
            trcsr: TRCSR_TDRE,
            rdr: 0,
            tdr: 0,
            sci_flags_armed: 0,
            tx_shift: None,
            tx_cycles: 0,
            rx_cycles: 0,
            rx_queue: VecDeque::new(),
            tx_out: Vec::new(),
            rcr: 0xC0,
        }
    }
}

/// Serializable CPU state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hd6301State {
    pub a: u8,
    pub b: u8,
    pub x: u16,
    pub sp: u16,
    pub pc: u16,
    pub cc: u8,
    pub cycles: u64,
    pub run_state: RunState,
    pub irq1_line: bool,
    pub nmi_pending: bool,
    pub io: OnChipIo,
}

/// HD6301X CPU state and execution engine
#[derive(Debug)]
pub struct CpuHd6301<M: MemoryHd6301> {
    /// Accumulator A (high byte of D)
    pub a: u8,
    /// Accumulator B (low byte of D)
    pub b: u8,
    /// Index register
    pub x: u16,
    /// Stack pointer (points at the next free byte)
    pub sp: u16,
    /// Program counter
    pub pc: u16,
    /// Condition codes (11HINZVC)
    pub cc: u8,
    /// Total E cycles executed
    pub cycles: u64,
    /// Memory interface
    pub memory: M,
    /// On-chip peripherals
    pub io: OnChipIo,
    run_state: RunState,
    irq1_line: bool,
    irq2_line: bool,
    nmi_pending: bool,
    /// Serial frame length when the SCI runs from an external clock
    external_sci_frame_cycles: Option<u32>,
}

impl<M: MemoryHd6301> CpuHd6301<M> {
    /// Create a new CPU with the given memory interface
    pub fn new(memory: M) -> Self {
        Self {
            a: 0,
            b: 0,
            x: 0,
            sp: 0,
            pc: 0,
            cc: 0xC0 | I,
            cycles: 0,
            memory,
            io: OnChipIo::default(),
            run_state: RunState::Running,
            irq1_line: false,
            irq2_line: false,
            nmi_pending: false,
            external_sci_frame_cycles: None,
        }
    }

    /// Reset the CPU and on-chip peripherals (memory is preserved)
    pub fn reset(&mut self) {
        self.a = 0;
        self.b = 0;
        self.x = 0;
        self.sp = 0;
        self.cc = 0xC0 | I;
        self.cycles = 0;
        self.run_state = RunState::Running;
        self.nmi_pending = false;
        self.io = OnChipIo::default();
        self.pc = self.read_u16(vectors::RESET);
    }

    /// Feed the SCI from an external clock pin.
    ///
    /// The serial clock input runs at 16 times the bit rate, so a 500 kHz
    /// clock gives 31250 baud.
    pub fn set_sci_external_clock(&mut self, clock_hz: u32, e_clock_hz: u32) {
        let frame = (e_clock_hz as f64 * 16.0 * SCI_FRAME_BITS as f64) / clock_hz as f64;
        self.external_sci_frame_cycles = Some((frame.round() as u32).max(1));
    }

    /// Drive the level-sensitive IRQ1 input
    pub fn set_irq1(&mut self, asserted: bool) {
        self.irq1_line = asserted;
    }

    /// Drive the level-sensitive IRQ2 input
    pub fn set_irq2(&mut self, asserted: bool) {
        self.irq2_line = asserted;
    }

    /// Latch a non-maskable interrupt
    pub fn trigger_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Accumulator D (A:B)
    pub fn d(&self) -> u16 {
        u16::from_be_bytes([self.a, self.b])
    }

    pub fn set_d(&mut self, d: u16) {
        [self.a, self.b] = d.to_be_bytes();
    }

    /// Queue a byte on the serial receive pin
    pub fn sci_receive(&mut self, byte: u8) {
        self.io.rx_queue.push_back(byte);
    }

    /// Take every byte fully shifted out of the serial transmitter
    pub fn take_sci_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.io.tx_out)
    }

    pub fn save_state(&self) -> Hd6301State {
        Hd6301State {
            a: self.a,
            b: self.b,
            x: self.x,
            sp: self.sp,
            pc: self.pc,
            cc: self.cc,
            cycles: self.cycles,
            run_state: self.run_state,
            irq1_line: self.irq1_line,
            nmi_pending: self.nmi_pending,
            io: self.io.clone(),
        }
    }

    pub fn load_state(&mut self, state: &Hd6301State) {
        self.a = state.a;
        self.b = state.b;
        self.x = state.x;
        self.sp = state.sp;
        self.pc = state.pc;
        self.cc = state.cc | 0xC0;
        self.cycles = state.cycles;
        self.run_state = state.run_state;
        self.irq1_line = state.irq1_line;
        self.nmi_pending = state.nmi_pending;
        self.io = state.io.clone();
    }

    // ----------------------------------------------------------------------
    // Bus access
    // ----------------------------------------------------------------------

    fn read(&mut self, addr: u16) -> u8 {
        if addr <= IO_END {
            self.io_read(addr as u8)
        } else {
            self.memory.read(addr)
        }
    }

    fn write(&mut self, addr: u16, val: u8) {
        if addr <= IO_END {
            self.io_write(addr as u8, val);
        } else {
            self.memory.write(addr, val);
        }
    }

    fn read_u16(&mut self, addr: u16) -> u16 {
        let hi = self.read(addr);
        let lo = self.read(addr.wrapping_add(1));
        u16::from_be_bytes([hi, lo])
    }

    fn write_u16(&mut self, addr: u16, val: u16) {
        let [hi, lo] = val.to_be_bytes();
        self.write(addr, hi);
        self.write(addr.wrapping_add(1), lo);
    }

    #[inline]
    fn fetch_u8(&mut self) -> u8 {
        let v = self.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        v
    }

    #[inline]
    fn fetch_u16(&mut self) -> u16 {
        let hi = self.fetch_u8();
        let lo = self.fetch_u8();
        u16::from_be_bytes([hi, lo])
    }

    #[inline]
    fn addr_direct(&mut self) -> u16 {
        self.fetch_u8() as u16
    }

    #[inline]
    fn addr_indexed(&mut self) -> u16 {
        let offset = self.fetch_u8() as u16;
        self.x.wrapping_add(offset)
    }

    #[inline]
    fn addr_extended(&mut self) -> u16 {
        self.fetch_u16()
    }

    #[inline]
    fn push_u8(&mut self, v: u8) {
        self.write(self.sp, v);
        self.sp = self.sp.wrapping_sub(1);
    }

    #[inline]
    fn pull_u8(&mut self) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        self.read(self.sp)
    }

    fn push_u16(&mut self, v: u16) {
        let [hi, lo] = v.to_be_bytes();
        self.push_u8(lo);
        self.push_u8(hi);
    }

    fn pull_u16(&mut self) -> u16 {
        let hi = self.pull_u8();
        let lo = self.pull_u8();
        u16::from_be_bytes([hi, lo])
    }

    fn push_machine_state(&mut self) {
        self.push_u16(self.pc);
        self.push_u16(self.x);
        self.push_u8(self.a);
        self.push_u8(self.b);
        self.push_u8(self.cc);
    }

    // ----------------------------------------------------------------------
    // On-chip I/O
    // ----------------------------------------------------------------------

    fn port_input(&mut self, port: Port) -> u8 {
        let idx = port.index();
        let ddr = self.io.port_ddr[idx];
        (self.io.port_data[idx] & ddr) | (self.memory.port_read(port) & !ddr)
    }

    fn port_output(&mut self, port: Port) {
        let idx = port.index();
        let ddr = self.io.port_ddr[idx];
        let out = (self.io.port_data[idx] & ddr) | !ddr;
        self.memory.port_write(port, out);
    }

    fn write_port_data(&mut self, port: Port, val: u8) {
        self.io.port_data[port.index()] = val;
        self.port_output(port);
    }

    fn write_port_ddr(&mut self, port: Port, val: u8) {
        self.io.port_ddr[port.index()] = val;
        self.port_output(port);
    }

    fn io_read(&mut self, reg: u8) -> u8 {
        match reg {
            REG_P1DDR => self.io.port_ddr[0],
            REG_P2DDR => self.io.port_ddr[1],
            REG_P3DDR => self.io.port_ddr[2],
            REG_P4DDR => self.io.port_ddr[3],
            REG_P6DDR => self.io.port_ddr[5],
            REG_P1DATA => self.port_input(Port::P1),
            REG_P2DATA => self.port_input(Port::P2),
            REG_P3DATA => self.port_input(Port::P3),
            REG_P4DATA => self.port_input(Port::P4),
            REG_P5DATA => self.port_input(Port::P5),
            REG_P6DATA => self.port_input(Port::P6),
            REG_P7DATA => self.port_input(Port::P7),
            REG_TCSR1 => {
                self.io.timer_flags_armed = self.io.tcsr1 & (TCSR_ICF | TCSR_OCF1 | TCSR_TOF)
                    | (self.io.tcsr2 & TCSR2_OCF2);
                self.io.tcsr1
            }
            REG_TCSR2 => {
                self.io.timer_flags_armed = self.io.tcsr1 & (TCSR_ICF | TCSR_OCF1 | TCSR_TOF)
                    | (self.io.tcsr2 & TCSR2_OCF2);
                (self.io.tcsr1 & (TCSR_ICF | TCSR_OCF1)) | (self.io.tcsr2 & 0x3F)
            }
            REG_FRCH => {
                if self.io.timer_flags_armed & TCSR_TOF != 0 {
                    self.io.tcsr1 &= !TCSR_TOF;
                    self.io.timer_flags_armed &= !TCSR_TOF;
                }
                let [hi, lo] = self.io.frc.to_be_bytes();
                self.io.frc_read_latch = lo;
                hi
            }
            REG_FRCL => self.io.frc_read_latch,
            REG_OCR1H => (self.io.ocr1 >> 8) as u8,
            REG_OCR1L => self.io.ocr1 as u8,
            REG_OCR2H => (self.io.ocr2 >> 8) as u8,
            REG_OCR2L => self.io.ocr2 as u8,
            REG_ICRH => {
                if self.io.timer_flags_armed & TCSR_ICF != 0 {
                    self.io.tcsr1 &= !TCSR_ICF;
                    self.io.timer_flags_armed &= !TCSR_ICF;
                }
                (self.io.icr >> 8) as u8
            }
            REG_ICRL => self.io.icr as u8,
            REG_RMCR => self.io.rmcr,
            REG_TRCSR => {
                self.io.sci_flags_armed = self.io.trcsr & (TRCSR_RDRF | TRCSR_ORFE);
                self.io.trcsr
            }
            REG_RDR => {
                if self.io.sci_flags_armed != 0 {
                    self.io.trcsr &= !self.io.sci_flags_armed;
                    self.io.sci_flags_armed = 0;
                }
                self.io.rdr
            }
            REG_RCR => self.io.rcr,
            REG_TCSR3 => self.io.tcsr3,
            REG_TCONR => 0xFF, // write-only
            REG_T2CNT => self.io.t2cnt,
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("HD6301: read from reserved I/O register {:02X}", reg)
                });
                0xFF
            }
        }
    }

    fn io_write(&mut self, reg: u8, val: u8) {
        match reg {
            REG_P1DDR => self.write_port_ddr(Port::P1, val),
            REG_P2DDR => self.write_port_ddr(Port::P2, val),
            REG_P3DDR => self.write_port_ddr(Port::P3, val),
            REG_P4DDR => self.write_port_ddr(Port::P4, val),
            REG_P6DDR => self.write_port_ddr(Port::P6, val),
            REG_P1DATA => self.write_port_data(Port::P1, val),
            REG_P2DATA => self.write_port_data(Port::P2, val),
            REG_P3DATA => self.write_port_data(Port::P3, val),
            REG_P4DATA => self.write_port_data(Port::P4, val),
            REG_P5DATA => self.io.port_data[Port::P5.index()] = val,
            REG_P6DATA => self.write_port_data(Port::P6, val),
            REG_P7DATA => self.write_port_data(Port::P7, val),
            REG_TCSR1 => self.io.tcsr1 = (self.io.tcsr1 & 0xE0) | (val & 0x1F),
            REG_TCSR2 => self.io.tcsr2 = (self.io.tcsr2 & TCSR2_OCF2) | (val & 0x1F),
            REG_FRCH => {
                self.io.frc_write_latch = val;
                self.io.frc = 0xFFF8;
            }
            REG_FRCL => {
                self.io.frc = u16::from_be_bytes([self.io.frc_write_latch, val]);
            }
            REG_OCR1H | REG_OCR1L => {
                let [mut hi, mut lo] = self.io.ocr1.to_be_bytes();
                if reg == REG_OCR1H {
                    hi = val;
                } else {
                    lo = val;
                }
                self.io.ocr1 = u16::from_be_bytes([hi, lo]);
                if self.io.timer_flags_armed & TCSR_OCF1 != 0 {
                    self.io.tcsr1 &= !TCSR_OCF1;
                    self.io.timer_flags_armed &= !TCSR_OCF1;
                }
            }
            REG_OCR2H | REG_OCR2L => {
                let [mut hi, mut lo] = self.io.ocr2.to_be_bytes();
                if reg == REG_OCR2H {
                    hi = val;
                } else {
                    lo = val;
                }
                self.io.ocr2 = u16::from_be_bytes([hi, lo]);
                if self.io.timer_flags_armed & TCSR2_OCF2 != 0 {
                    self.io.tcsr2 &= !TCSR2_OCF2;
                    self.io.timer_flags_armed &= !TCSR2_OCF2;
                }
            }
            REG_RMCR => self.io.rmcr = val & 0x0F,
            REG_TRCSR => {
                self.io.trcsr = (self.io.trcsr & 0xE0) | (val & 0x1F);
                if self.io.trcsr & TRCSR_RE == 0 {
                    self.io.rx_cycles = 0;
                }
            }
            REG_TDR => {
                self.io.tdr = val;
                self.io.trcsr &= !TRCSR_TDRE;
                log(LogCategory::Serial, LogLevel::Trace, || {
                    format!("HD6301: TDR <- {:02X}", val)
                });
            }
            REG_RCR => self.io.rcr = val,
            REG_TCSR3 => {
                // CMF can only be cleared by software
                let cmf = self.io.tcsr3 & val & TCSR3_CMF;
                self.io.tcsr3 = cmf | (val & 0x7F);
            }
            REG_TCONR => self.io.tconr = val,
            REG_T2CNT => self.io.t2cnt = val,
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!(
                        "HD6301: write {:02X} to read-only/reserved I/O register {:02X}",
                        val, reg
                    )
                });
            }
        }
    }

    // ----------------------------------------------------------------------
    // Peripheral clocking
    // ----------------------------------------------------------------------

    /// True when the counter passes `target` while advancing from `old` by `delta`
    fn counter_passes(old: u16, delta: u32, target: u16) -> bool {
        (target.wrapping_sub(old.wrapping_add(1)) as u32) < delta
    }

    fn sci_frame_cycles(&self) -> u32 {
        if self.io.rmcr & 0x0C == 0x0C {
            if let Some(cycles) = self.external_sci_frame_cycles {
                return cycles;
            }
        }
        let divider = [16, 128, 1024, 4096][(self.io.rmcr & 0x03) as usize];
        divider * SCI_FRAME_BITS
    }

    fn tick_peripherals(&mut self, cycles: u32) {
        // Free-running counter and output compares
        let old = self.io.frc;
        if Self::counter_passes(old, cycles, self.io.ocr1) {
            self.io.tcsr1 |= TCSR_OCF1;
        }
        if Self::counter_passes(old, cycles, self.io.ocr2) {
            self.io.tcsr2 |= TCSR2_OCF2;
        }
        if Self::counter_passes(old, cycles, 0x0000) {
            self.io.tcsr1 |= TCSR_TOF;
        }
        self.io.frc = old.wrapping_add(cycles as u16);

        // Timer 2
        if self.io.tcsr3 & TCSR3_T2E != 0 {
            let divider = match self.io.tcsr3 & 0x03 {
                0 => Some(1),
                1 => Some(8),
                2 => Some(128),
                _ => None, // external clock pin, not driven
            };
            if let Some(divider) = divider {
                self.io.t2_prescale += cycles;
                while self.io.t2_prescale >= divider {
                    self.io.t2_prescale -= divider;
                    self.io.t2cnt = self.io.t2cnt.wrapping_add(1);
                    if self.io.t2cnt == self.io.tconr {
                        self.io.t2cnt = 0;
                        self.io.tcsr3 |= TCSR3_CMF;
                    }
                }
            }
        }

        self.tick_sci(cycles);
    }

    fn tick_sci(&mut self, cycles: u32) {
        let frame = self.sci_frame_cycles();

        // Transmitter
        if self.io.trcsr & TRCSR_TE != 0 {
            let mut budget = cycles;
            loop {
                if self.io.tx_shift.is_none() {
                    if self.io.trcsr & TRCSR_TDRE != 0 {
                        break;
                    }
                    self.io.tx_shift = Some(self.io.tdr);
                    self.io.tx_cycles = frame;
                    self.io.trcsr |= TRCSR_TDRE;
                }
                if budget < self.io.tx_cycles {
                    self.io.tx_cycles -= budget;
                    break;
                }
                budget -= self.io.tx_cycles;
                self.io.tx_cycles = 0;
                if let Some(byte) = self.io.tx_shift.take() {
                    log(LogCategory::Serial, LogLevel::Debug, || {
                        format!("HD6301: SCI transmit {:02X}", byte)
                    });
                    self.io.tx_out.push(byte);
                }
            }
        }

        // Receiver
        if self.io.trcsr & TRCSR_RE != 0 && !self.io.rx_queue.is_empty() {
            self.io.rx_cycles += cycles;
            while self.io.rx_cycles >= frame {
                let Some(byte) = self.io.rx_queue.pop_front() else {
                    self.io.rx_cycles = 0;
                    break;
                };
                self.io.rx_cycles -= frame;
                if self.io.trcsr & TRCSR_RDRF != 0 {
                    self.io.trcsr |= TRCSR_ORFE;
                    log(LogCategory::Serial, LogLevel::Warn, || {
                        format!("HD6301: SCI overrun, dropped {:02X}", byte)
                    });
                } else {
                    self.io.rdr = byte;
                    self.io.trcsr |= TRCSR_RDRF;
                    log(LogCategory::Serial, LogLevel::Debug, || {
                        format!("HD6301: SCI receive {:02X}", byte)
                    });
                }
            }
            if self.io.rx_queue.is_empty() {
                self.io.rx_cycles = 0;
            }
        }
    }

    // ----------------------------------------------------------------------
    // Interrupts
    // ----------------------------------------------------------------------

    /// Highest-priority maskable interrupt currently requested, ignoring the I flag
    fn requested_irq(&self) -> Option<u16> {
        let io = &self.io;
        if self.irq1_line {
            Some(vectors::IRQ1)
        } else if io.tcsr1 & TCSR_ICF != 0 && io.tcsr1 & TCSR_EICI != 0 {
            Some(vectors::ICI)
        } else if (io.tcsr1 & TCSR_OCF1 != 0 && io.tcsr1 & TCSR_EOCI1 != 0)
            || (io.tcsr2 & TCSR2_OCF2 != 0 && io.tcsr2 & TCSR2_EOCI2 != 0)
        {
            Some(vectors::OCI)
        } else if io.tcsr1 & TCSR_TOF != 0 && io.tcsr1 & TCSR_ETOI != 0 {
            Some(vectors::TOI)
        } else if io.tcsr3 & TCSR3_CMF != 0 && io.tcsr3 & TCSR3_ECMI != 0 {
            Some(vectors::CMI)
        } else if self.irq2_line {
            Some(vectors::IRQ2)
        } else if (io.trcsr & (TRCSR_RDRF | TRCSR_ORFE) != 0 && io.trcsr & TRCSR_RIE != 0)
            || (io.trcsr & TRCSR_TDRE != 0 && io.trcsr & TRCSR_TIE != 0)
        {
            Some(vectors::SCI)
        } else {
            None
        }
    }

    fn take_interrupt(&mut self, vector: u16) -> u32 {
        if self.run_state != RunState::Waiting {
            self.push_machine_state();
        }
        self.run_state = RunState::Running;
        self.cc |= I;
        let pc = self.pc;
        self.pc = self.read_u16(vector);
        log(LogCategory::Interrupts, LogLevel::Trace, || {
            format!(
                "HD6301: interrupt via {:04X} from PC={:04X} to {:04X}",
                vector, pc, self.pc
            )
        });
        INTERRUPT_CYCLES
    }

    // ----------------------------------------------------------------------
    // ALU helpers
    // ----------------------------------------------------------------------

    #[inline]
    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.cc |= flag;
        } else {
            self.cc &= !flag;
        }
    }

    #[inline]
    fn flag(&self, flag: u8) -> bool {
        self.cc & flag != 0
    }

    fn set_nz8(&mut self, v: u8) {
        self.set_flag(N, v & 0x80 != 0);
        self.set_flag(Z, v == 0);
    }

    fn set_nz16(&mut self, v: u16) {
        self.set_flag(N, v & 0x8000 != 0);
        self.set_flag(Z, v == 0);
    }

    /// Load/store/logic flags: N, Z, V cleared
    fn set_logic8(&mut self, v: u8) {
        self.set_nz8(v);
        self.cc &= !V;
    }

    fn add8(&mut self, a: u8, b: u8, carry_in: bool) -> u8 {
        let c = carry_in as u16;
        let sum = a as u16 + b as u16 + c;
        let r = sum as u8;
        self.set_flag(H, ((a & 0x0F) + (b & 0x0F) + c as u8) & 0x10 != 0);
        self.set_nz8(r);
        self.set_flag(V, (!(a ^ b) & (a ^ r)) & 0x80 != 0);
        self.set_flag(C, sum > 0xFF);
        r
    }

    fn sub8(&mut self, a: u8, b: u8, borrow_in: bool) -> u8 {
        let diff = (a as i16) - (b as i16) - (borrow_in as i16);
        let r = diff as u8;
        self.set_nz8(r);
        self.set_flag(V, ((a ^ b) & (a ^ r)) & 0x80 != 0);
        self.set_flag(C, diff < 0);
        r
    }

    fn add16(&mut self, a: u16, b: u16) -> u16 {
        let sum = a as u32 + b as u32;
        let r = sum as u16;
        self.set_nz16(r);
        self.set_flag(V, (!(a ^ b) & (a ^ r)) & 0x8000 != 0);
        self.set_flag(C, sum > 0xFFFF);
        r
    }

    fn sub16(&mut self, a: u16, b: u16) -> u16 {
        let r = a.wrapping_sub(b);
        self.set_nz16(r);
        self.set_flag(V, ((a ^ b) & (a ^ r)) & 0x8000 != 0);
        self.set_flag(C, b > a);
        r
    }

    /// Read-modify-write unary operation selected by the low opcode nibble.
    /// Returns `None` for TST, which does not write back.
    fn unary(&mut self, op: u8, v: u8) -> Option<u8> {
        let r = match op & 0x0F {
            0x0 => {
                // NEG
                let r = 0u8.wrapping_sub(v);
                self.set_nz8(r);
                self.set_flag(V, r == 0x80);
                self.set_flag(C, r != 0);
                r
            }
            0x3 => {
                // COM
                let r = !v;
                self.set_logic8(r);
                self.cc |= C;
                r
            }
            0x4 => {
                // LSR
                let r = v >> 1;
                self.set_flag(C, v & 0x01 != 0);
                self.set_nz8(r);
                self.set_flag(V, self.flag(C));
                r
            }
            0x6 => {
                // ROR
                let r = (v >> 1) | if self.flag(C) { 0x80 } else { 0 };
                self.set_flag(C, v & 0x01 != 0);
                self.set_nz8(r);
                self.set_flag(V, self.flag(N) != self.flag(C));
                r
            }
            0x7 => {
                // ASR
                let r = (v >> 1) | (v & 0x80);
                self.set_flag(C, v & 0x01 != 0);
                self.set_nz8(r);
                self.set_flag(V, self.flag(N) != self.flag(C));
                r
            }
            0x8 => {
                // ASL
                let r = v << 1;
                self.set_flag(C, v & 0x80 != 0);
                self.set_nz8(r);
                self.set_flag(V, self.flag(N) != self.flag(C));
                r
            }
            0x9 => {
                // ROL
                let r = (v << 1) | self.flag(C) as u8;
                self.set_flag(C, v & 0x80 != 0);
                self.set_nz8(r);
                self.set_flag(V, self.flag(N) != self.flag(C));
                r
            }
            0xA => {
                // DEC
                let r = v.wrapping_sub(1);
                self.set_nz8(r);
                self.set_flag(V, v == 0x80);
                r
            }
            0xC => {
                // INC
                let r = v.wrapping_add(1);
                self.set_nz8(r);
                self.set_flag(V, v == 0x7F);
                r
            }
            0xD => {
                // TST
                self.set_logic8(v);
                self.cc &= !C;
                return None;
            }
            _ => {
                // CLR
                self.cc = (self.cc & !(N | V | C)) | Z;
                0
            }
        };
        Some(r)
    }

    fn branch_taken(&self, op: u8) -> bool {
        let (n, z, v, c) = (self.flag(N), self.flag(Z), self.flag(V), self.flag(C));
        match op & 0x0F {
            0x0 => true,        // BRA
            0x1 => false,       // BRN
            0x2 => !(c || z),   // BHI
            0x3 => c || z,      // BLS
            0x4 => !c,          // BCC
            0x5 => c,           // BCS
            0x6 => !z,          // BNE
            0x7 => z,           // BEQ
            0x8 => !v,          // BVC
            0x9 => v,           // BVS
            0xA => !n,          // BPL
            0xB => n,           // BMI
            0xC => n == v,      // BGE
            0xD => n != v,      // BLT
            0xE => !z && n == v, // BGT
            _ => z || n != v,   // BLE
        }
    }

    fn trap(&mut self, op: u8) -> u32 {
        let pc = self.pc.wrapping_sub(1);
        log(LogCategory::CPU, LogLevel::Warn, || {
            format!("HD6301: illegal opcode {:02X} at {:04X}, TRAP", op, pc)
        });
        self.take_interrupt(vectors::TRAP)
    }

    // ----------------------------------------------------------------------
    // Execution
    // ----------------------------------------------------------------------

    /// Execute one instruction (or service one interrupt) and return E cycles used.
    pub fn step(&mut self) -> u32 {
        let cycles = self.step_inner();
        self.cycles = self.cycles.wrapping_add(cycles as u64);
        self.tick_peripherals(cycles);
        cycles
    }

    fn step_inner(&mut self) -> u32 {
        if self.nmi_pending {
            self.nmi_pending = false;
            return self.take_interrupt(vectors::NMI);
        }

        let requested = self.requested_irq();
        if self.run_state == RunState::Sleeping && requested.is_some() {
            self.run_state = RunState::Running;
        }
        if let Some(vector) = requested {
            if !self.flag(I) {
                return self.take_interrupt(vector);
            }
        }
        if self.run_state != RunState::Running {
            return IDLE_CYCLES;
        }

        let pc = self.pc;
        let op = self.fetch_u8();
        if LogConfig::global().should_log(LogCategory::CPU, LogLevel::Trace) {
            log(LogCategory::CPU, LogLevel::Trace, || {
                format!(
                    "HD6301: {:04X} op={:02X} A={:02X} B={:02X} X={:04X} SP={:04X} CC={:02X}",
                    pc, op, self.a, self.b, self.x, self.sp, self.cc
                )
            });
        }

        let cycles = CYCLES[op as usize] as u32;
        if cycles == 0 {
            return self.trap(op);
        }

        match op {
            0x00..=0x1F => self.exec_inherent(op),
            0x20..=0x2F => {
                let offset = self.fetch_u8() as i8;
                if self.branch_taken(op) {
                    self.pc = self.pc.wrapping_add(offset as u16);
                }
            }
            0x30..=0x3F => self.exec_stack(op),
            0x40..=0x7F => self.exec_rmw(op),
            _ => self.exec_alu(op),
        }
        cycles
    }

    fn exec_inherent(&mut self, op: u8) {
        match op {
            0x01 => {} // NOP
            0x04 => {
                // LSRD
                let d = self.d();
                let r = d >> 1;
                self.set_d(r);
                self.set_flag(C, d & 1 != 0);
                self.set_nz16(r);
                self.set_flag(V, self.flag(C));
            }
            0x05 => {
                // ASLD
                let d = self.d();
                let r = d << 1;
                self.set_d(r);
                self.set_flag(C, d & 0x8000 != 0);
                self.set_nz16(r);
                self.set_flag(V, self.flag(N) != self.flag(C));
            }
            0x06 => self.cc = self.a | 0xC0, // TAP
            0x07 => self.a = self.cc | 0xC0, // TPA
            0x08 => {
                // INX
                self.x = self.x.wrapping_add(1);
                self.set_flag(Z, self.x == 0);
            }
            0x09 => {
                // DEX
                self.x = self.x.wrapping_sub(1);
                self.set_flag(Z, self.x == 0);
            }
            0x0A => self.cc &= !V, // CLV
            0x0B => self.cc |= V,  // SEV
            0x0C => self.cc &= !C, // CLC
            0x0D => self.cc |= C,  // SEC
            0x0E => self.cc &= !I, // CLI
            0x0F => self.cc |= I,  // SEI
            0x10 => self.a = self.sub8(self.a, self.b, false), // SBA
            0x11 => {
                // CBA
                self.sub8(self.a, self.b, false);
            }
            0x16 => {
                // TAB
                self.b = self.a;
                self.set_logic8(self.b);
            }
            0x17 => {
                // TBA
                self.a = self.b;
                self.set_logic8(self.a);
            }
            0x18 => {
                // XGDX
                let d = self.d();
                self.set_d(self.x);
                self.x = d;
            }
            0x19 => {
                // DAA
                let a = self.a;
                let lsn = a & 0x0F;
                let msn = a >> 4;
                let mut correction = 0u8;
                let mut carry = self.flag(C);
                if self.flag(H) || lsn > 9 {
                    correction |= 0x06;
                }
                if carry || msn > 9 || (msn > 8 && lsn > 9) {
                    correction |= 0x60;
                    carry = true;
                }
                self.a = a.wrapping_add(correction);
                self.set_nz8(self.a);
                self.cc &= !V;
                self.set_flag(C, carry);
            }
            0x1A => {
                // SLP
                self.run_state = RunState::Sleeping;
                log(LogCategory::CPU, LogLevel::Trace, || {
                    format!("HD6301: SLP at {:04X}", self.pc.wrapping_sub(1))
                });
            }
            0x1B => self.a = self.add8(self.a, self.b, false), // ABA
            _ => {}
        }
    }

    fn exec_stack(&mut self, op: u8) {
        match op {
            0x30 => self.x = self.sp.wrapping_add(1), // TSX
            0x31 => self.sp = self.sp.wrapping_add(1), // INS
            0x32 => self.a = self.pull_u8(),           // PULA
            0x33 => self.b = self.pull_u8(),           // PULB
            0x34 => self.sp = self.sp.wrapping_sub(1), // DES
            0x35 => self.sp = self.x.wrapping_sub(1),  // TXS
            0x36 => self.push_u8(self.a),              // PSHA
            0x37 => self.push_u8(self.b),              // PSHB
            0x38 => self.x = self.pull_u16(),          // PULX
            0x39 => self.pc = self.pull_u16(),         // RTS
            0x3A => self.x = self.x.wrapping_add(self.b as u16), // ABX
            0x3B => {
                // RTI
                self.cc = self.pull_u8() | 0xC0;
                self.b = self.pull_u8();
                self.a = self.pull_u8();
                self.x = self.pull_u16();
                self.pc = self.pull_u16();
            }
            0x3C => self.push_u16(self.x), // PSHX
            0x3D => {
                // MUL
                let d = self.a as u16 * self.b as u16;
                self.set_d(d);
                self.set_flag(C, d & 0x80 != 0);
            }
            0x3E => {
                // WAI
                self.push_machine_state();
                self.run_state = RunState::Waiting;
            }
            _ => {
                // SWI
                self.push_machine_state();
                self.cc |= I;
                self.pc = self.read_u16(vectors::SWI);
            }
        }
    }

    fn exec_rmw(&mut self, op: u8) {
        let low = op & 0x0F;
        match op & 0xF0 {
            0x40 => {
                if let Some(r) = self.unary(op, self.a) {
                    self.a = r;
                }
            }
            0x50 => {
                if let Some(r) = self.unary(op, self.b) {
                    self.b = r;
                }
            }
            _ => {
                // AIM/OIM/EIM/TIM: immediate mask, then indexed (0x6x) or direct (0x7x)
                if matches!(low, 0x1 | 0x2 | 0x5 | 0xB) {
                    let mask = self.fetch_u8();
                    let addr = if op & 0xF0 == 0x60 {
                        self.addr_indexed()
                    } else {
                        self.addr_direct()
                    };
                    let v = self.read(addr);
                    let r = match low {
                        0x1 => v & mask,
                        0x2 => v | mask,
                        0x5 => v ^ mask,
                        _ => v & mask,
                    };
                    self.set_logic8(r);
                    if low != 0xB {
                        self.write(addr, r);
                    }
                    return;
                }

                let addr = if op & 0xF0 == 0x60 {
                    self.addr_indexed()
                } else {
                    self.addr_extended()
                };
                match low {
                    0xE => self.pc = addr, // JMP
                    0xF => {
                        // CLR (no read cycle on the 6301)
                        self.unary(op, 0);
                        self.write(addr, 0);
                    }
                    _ => {
                        let v = self.read(addr);
                        if let Some(r) = self.unary(op, v) {
                            self.write(addr, r);
                        }
                    }
                }
            }
        }
    }

    fn exec_alu(&mut self, op: u8) {
        let mode = (op >> 4) & 0x03;
        let use_b = op >= 0xC0;
        let low = op & 0x0F;

        // Effective address for non-immediate modes
        let ea = match mode {
            1 => Some(self.addr_direct()),
            2 => Some(self.addr_indexed()),
            3 => Some(self.addr_extended()),
            _ => None,
        };

        match low {
            0x3 | 0xC | 0xE => {
                // 16-bit operand: SUBD/ADDD, CPX/LDD, LDS/LDX
                let operand = match ea {
                    Some(addr) => self.read_u16(addr),
                    None => self.fetch_u16(),
                };
                match (low, use_b) {
                    (0x3, false) => {
                        let r = self.sub16(self.d(), operand);
                        self.set_d(r);
                    }
                    (0x3, true) => {
                        let r = self.add16(self.d(), operand);
                        self.set_d(r);
                    }
                    (0xC, false) => {
                        self.sub16(self.x, operand);
                    }
                    (0xC, true) => {
                        self.set_d(operand);
                        self.set_nz16(operand);
                        self.cc &= !V;
                    }
                    (_, false) => {
                        self.sp = operand;
                        self.set_nz16(operand);
                        self.cc &= !V;
                    }
                    (_, true) => {
                        self.x = operand;
                        self.set_nz16(operand);
                        self.cc &= !V;
                    }
                }
            }
            0xD if !use_b => {
                // BSR (immediate slot) / JSR
                match ea {
                    Some(addr) => {
                        self.push_u16(self.pc);
                        self.pc = addr;
                    }
                    None => {
                        let offset = self.fetch_u8() as i8;
                        self.push_u16(self.pc);
                        self.pc = self.pc.wrapping_add(offset as u16);
                    }
                }
            }
            0x7 | 0xD | 0xF => {
                // STA/STB, STD, STS/STX; immediate forms are illegal and never reach here
                let Some(addr) = ea else { return };
                match (low, use_b) {
                    (0x7, false) => {
                        self.write(addr, self.a);
                        self.set_logic8(self.a);
                    }
                    (0x7, true) => {
                        self.write(addr, self.b);
                        self.set_logic8(self.b);
                    }
                    (0xD, _) => {
                        let d = self.d();
                        self.write_u16(addr, d);
                        self.set_nz16(d);
                        self.cc &= !V;
                    }
                    (_, false) => {
                        self.write_u16(addr, self.sp);
                        self.set_nz16(self.sp);
                        self.cc &= !V;
                    }
                    (_, true) => {
                        self.write_u16(addr, self.x);
                        self.set_nz16(self.x);
                        self.cc &= !V;
                    }
                }
            }
            _ => {
                let operand = match ea {
                    Some(addr) => self.read(addr),
                    None => self.fetch_u8(),
                };
                let acc = if use_b { self.b } else { self.a };
                let result = match low {
                    0x0 => Some(self.sub8(acc, operand, false)), // SUB
                    0x1 => {
                        // CMP
                        self.sub8(acc, operand, false);
                        None
                    }
                    0x2 => {
                        // SBC
                        let borrow = self.flag(C);
                        Some(self.sub8(acc, operand, borrow))
                    }
                    0x4 => {
                        // AND
                        let r = acc & operand;
                        self.set_logic8(r);
                        Some(r)
                    }
                    0x5 => {
                        // BIT
                        self.set_logic8(acc & operand);
                        None
                    }
                    0x6 => {
                        // LDA
                        self.set_logic8(operand);
                        Some(operand)
                    }
                    0x8 => {
                        // EOR
                        let r = acc ^ operand;
                        self.set_logic8(r);
                        Some(r)
                    }
                    0x9 => {
                        // ADC
                        let carry = self.flag(C);
                        Some(self.add8(acc, operand, carry))
                    }
                    0xA => {
                        // ORA
                        let r = acc | operand;
                        self.set_logic8(r);
                        Some(r)
                    }
                    _ => Some(self.add8(acc, operand, false)), // ADD
                };
                if let Some(r) = result {
                    if use_b {
                        self.b = r;
                    } else {
                        self.a = r;
                    }
                }
            }
        }
    }
}

impl<M: MemoryHd6301> crate::Cpu for CpuHd6301<M> {
    fn reset(&mut self) {
        CpuHd6301::reset(self);
    }

    fn step(&mut self) -> u32 {
        CpuHd6301::step(self)
    }
}

/// Flat 64 KiB memory for tests and benchmarks, with port pin recording
pub struct ArrayMemory {
    pub data: Vec<u8>,
    /// Levels presented on each port's input pins
    pub port_inputs: [u8; 7],
    /// Every port output change, in order
    pub port_writes: Vec<(Port, u8)>,
}

impl ArrayMemory {
    pub fn new() -> Self {
        Self {
            data: vec![0; 0x10000],
            port_inputs: [0xFF; 7],
            port_writes: Vec::new(),
        }
    }

    /// Load a program into memory and point the reset vector at it
    pub fn load_program(&mut self, offset: u16, program: &[u8]) {
        let off = offset as usize;
        self.data[off..off + program.len()].copy_from_slice(program);
        self.set_vector(vectors::RESET, offset);
    }

    /// Store a big-endian vector
    pub fn set_vector(&mut self, vector: u16, target: u16) {
        let [hi, lo] = target.to_be_bytes();
        self.data[vector as usize] = hi;
        self.data[vector as usize + 1] = lo;
    }
}

impl Default for ArrayMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHd6301 for ArrayMemory {
    fn read(&mut self, addr: u16) -> u8 {
        self.data[addr as usize]
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.data[addr as usize] = val;
    }

    fn port_read(&mut self, port: Port) -> u8 {
        self.port_inputs[port.index()]
    }

    fn port_write(&mut self, port: Port, val: u8) {
        self.port_writes.push((port, val));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_with(program: &[u8]) -> CpuHd6301<ArrayMemory> {
        let mut mem = ArrayMemory::new();
        mem.load_program(0x8000, program);
        let mut cpu = CpuHd6301::new(mem);
        cpu.reset();
        cpu.sp = 0x00FF;
        cpu
    }

    #[test]
    fn reset_loads_big_endian_vector_and_masks_irq() {
        let mut mem = ArrayMemory::new();
        mem.data[0xFFFE] = 0x9A;
        mem.data[0xFFFF] = 0xBC;
        let mut cpu = CpuHd6301::new(mem);
        cpu.reset();
        assert_eq!(cpu.pc, 0x9ABC);
        assert_eq!(cpu.cc & I, I);
        assert_eq!(cpu.cc & 0xC0, 0xC0);
        assert_eq!(cpu.run_state(), RunState::Running);
    }

    #[test]
    fn ldaa_immediate_sets_flags() {
        let mut cpu = cpu_with(&[0x86, 0x00, 0x86, 0x80]);
        assert_eq!(cpu.step(), 2);
        assert_eq!(cpu.a, 0);
        assert!(cpu.flag(Z));
        assert_eq!(cpu.step(), 2);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.flag(N));
        assert!(!cpu.flag(Z));
    }

    #[test]
    fn ldd_std_are_big_endian() {
        // LDD #$1234; STD $0200 (extended); LDX $0200
        let mut cpu = cpu_with(&[0xCC, 0x12, 0x34, 0xFD, 0x02, 0x00, 0xFE, 0x02, 0x00]);
        assert_eq!(cpu.step(), 3);
        assert_eq!((cpu.a, cpu.b), (0x12, 0x34));
        assert_eq!(cpu.step(), 5);
        assert_eq!(cpu.memory.data[0x0200], 0x12);
        assert_eq!(cpu.memory.data[0x0201], 0x34);
        assert_eq!(cpu.step(), 5);
        assert_eq!(cpu.x, 0x1234);
    }

    #[test]
    fn adda_sets_half_carry_overflow_and_carry() {
        // LDAA #$7F; ADDA #$01
        let mut cpu = cpu_with(&[0x86, 0x7F, 0x8B, 0x01, 0x8B, 0x80]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.flag(H));
        assert!(cpu.flag(V));
        assert!(cpu.flag(N));
        assert!(!cpu.flag(C));
        cpu.step(); // 0x80 + 0x80
        assert_eq!(cpu.a, 0x00);
        assert!(cpu.flag(C));
        assert!(cpu.flag(V));
        assert!(cpu.flag(Z));
    }

    #[test]
    fn cmpa_borrow_and_sbc() {
        // LDAA #$10; CMPA #$20; SBCA #$00
        let mut cpu = cpu_with(&[0x86, 0x10, 0x81, 0x20, 0x82, 0x00]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.a, 0x10);
        assert!(cpu.flag(C));
        assert!(cpu.flag(N));
        cpu.step();
        assert_eq!(cpu.a, 0x0F);
        assert!(!cpu.flag(C));
    }

    #[test]
    fn sixteen_bit_arithmetic() {
        // LDD #$00FF; ADDD #$0001; SUBD #$0101; LDX #$1000; CPX #$1000
        let mut cpu = cpu_with(&[
            0xCC, 0x00, 0xFF, 0xC3, 0x00, 0x01, 0x83, 0x01, 0x01, 0xCE, 0x10, 0x00, 0x8C,
            0x10, 0x00,
        ]);
        cpu.step();
        assert_eq!(cpu.step(), 3);
        assert_eq!(cpu.d(), 0x0100);
        cpu.step();
        assert_eq!(cpu.d(), 0xFFFF);
        assert!(cpu.flag(C));
        assert!(cpu.flag(N));
        cpu.step();
        cpu.step();
        assert!(cpu.flag(Z));
        assert!(!cpu.flag(C));
    }

    #[test]
    fn mul_and_daa() {
        // LDAA #$0C; LDAB #$0B; MUL
        let mut cpu = cpu_with(&[0x86, 0x0C, 0xC6, 0x0B, 0x3D]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.step(), 7);
        assert_eq!(cpu.d(), 132);
        assert!(cpu.flag(C)); // bit 7 of B (0x84)

        // LDAA #$15; ADDA #$27; DAA -> BCD 42
        let mut cpu = cpu_with(&[0x86, 0x15, 0x8B, 0x27, 0x19]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.a, 0x3C);
        assert_eq!(cpu.step(), 2);
        assert_eq!(cpu.a, 0x42);
        assert!(!cpu.flag(C));
    }

    #[test]
    fn branches_bne_and_brn() {
        // LDAA #1; BNE +2; LDAA #2; BRN +2; LDAB #3
        let mut cpu = cpu_with(&[0x86, 0x01, 0x26, 0x02, 0x86, 0x02, 0x21, 0x02, 0xC6, 0x03]);
        cpu.step();
        assert_eq!(cpu.step(), 3);
        assert_eq!(cpu.pc, 0x8006);
        assert_eq!(cpu.step(), 3); // BRN never taken
        assert_eq!(cpu.pc, 0x8008);
        cpu.step();
        assert_eq!((cpu.a, cpu.b), (1, 3));
    }

    #[test]
    fn jsr_pushes_big_endian_return_address() {
        let mut cpu = cpu_with(&[0xBD, 0x90, 0x00]);
        cpu.memory.data[0x9000] = 0x39; // RTS
        assert_eq!(cpu.step(), 6);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(cpu.sp, 0x00FD);
        assert_eq!(cpu.memory.data[0x00FE], 0x80);
        assert_eq!(cpu.memory.data[0x00FF], 0x03);
        assert_eq!(cpu.step(), 5);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.sp, 0x00FF);
    }

    #[test]
    fn bsr_and_stack_ops() {
        // BSR +1; NOP; (sub) PSHX; PULA; PULB; RTS
        let mut cpu = cpu_with(&[0x8D, 0x01, 0x01, 0x3C, 0x32, 0x33, 0x39]);
        cpu.x = 0xBEEF;
        assert_eq!(cpu.step(), 5);
        assert_eq!(cpu.pc, 0x8003);
        cpu.step();
        cpu.step();
        cpu.step();
        assert_eq!((cpu.a, cpu.b), (0xBE, 0xEF));
        cpu.step();
        assert_eq!(cpu.pc, 0x8002);
    }

    #[test]
    fn bit_manipulation_instructions() {
        // OIM #$0F,$80 (direct); AIM #$3C,$80; EIM #$FF,$80; TIM #$00,$80
        let mut cpu = cpu_with(&[
            0x72, 0x0F, 0x80, 0x71, 0x3C, 0x80, 0x75, 0xFF, 0x80, 0x7B, 0x00, 0x80,
        ]);
        cpu.memory.data[0x80] = 0xA0;
        assert_eq!(cpu.step(), 6);
        assert_eq!(cpu.memory.data[0x80], 0xAF);
        cpu.step();
        assert_eq!(cpu.memory.data[0x80], 0x2C);
        cpu.step();
        assert_eq!(cpu.memory.data[0x80], 0xD3);
        assert!(cpu.flag(N));
        assert_eq!(cpu.step(), 4);
        assert_eq!(cpu.memory.data[0x80], 0xD3);
        assert!(cpu.flag(Z));
    }

    #[test]
    fn indexed_bit_manipulation() {
        // LDX #$0100; OIM #$01,2,X
        let mut cpu = cpu_with(&[0xCE, 0x01, 0x00, 0x62, 0x01, 0x02]);
        cpu.step();
        assert_eq!(cpu.step(), 7);
        assert_eq!(cpu.memory.data[0x0102], 0x01);
    }

    #[test]
    fn xgdx_and_abx() {
        let mut cpu = cpu_with(&[0x18, 0x3A]);
        cpu.set_d(0x1234);
        cpu.x = 0x00F0;
        assert_eq!(cpu.step(), 2);
        assert_eq!(cpu.d(), 0x00F0);
        assert_eq!(cpu.x, 0x1234);
        cpu.step();
        assert_eq!(cpu.x, 0x1234 + 0xF0);
    }

    #[test]
    fn shifts_and_rotates() {
        // LDAA #$81; ASLA; RORA; LSRA; ASRA
        let mut cpu = cpu_with(&[0x86, 0x81, 0x48, 0x46, 0x44, 0x47]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.a, 0x02);
        assert!(cpu.flag(C));
        cpu.step();
        assert_eq!(cpu.a, 0x81);
        assert!(!cpu.flag(C));
        cpu.step();
        assert_eq!(cpu.a, 0x40);
        assert!(cpu.flag(C));
        cpu.step();
        assert_eq!(cpu.a, 0x20);
    }

    #[test]
    fn memory_rmw_and_clr() {
        // INC $0200; NEG $0200; CLR $0200
        let mut cpu = cpu_with(&[0x7C, 0x02, 0x00, 0x70, 0x02, 0x00, 0x7F, 0x02, 0x00]);
        cpu.memory.data[0x0200] = 0x7F;
        assert_eq!(cpu.step(), 6);
        assert_eq!(cpu.memory.data[0x0200], 0x80);
        assert!(cpu.flag(V));
        cpu.step();
        assert_eq!(cpu.memory.data[0x0200], 0x80);
        assert!(cpu.flag(C));
        assert_eq!(cpu.step(), 5);
        assert_eq!(cpu.memory.data[0x0200], 0);
        assert!(cpu.flag(Z));
        assert!(!cpu.flag(C));
    }

    #[test]
    fn swi_and_rti_restore_registers() {
        let mut cpu = cpu_with(&[0x3F, 0x01]);
        cpu.memory.set_vector(vectors::SWI, 0x9000);
        cpu.memory.data[0x9000] = 0x3B; // RTI
        cpu.a = 0x11;
        cpu.b = 0x22;
        cpu.x = 0x3344;
        cpu.cc = 0xC0 | C;
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(cpu.sp, 0x00FF - 7);
        assert!(cpu.flag(I));
        // Stack layout from SP+1: CC, B, A, XH, XL, PCH, PCL
        assert_eq!(&cpu.memory.data[0xF9..0x100], &[0xC1, 0x22, 0x11, 0x33, 0x44, 0x80, 0x01]);

        cpu.a = 0;
        cpu.x = 0;
        assert_eq!(cpu.step(), 10);
        assert_eq!(cpu.pc, 0x8001);
        assert_eq!((cpu.a, cpu.b, cpu.x), (0x11, 0x22, 0x3344));
        assert_eq!(cpu.cc, 0xC1);
    }

    #[test]
    fn illegal_opcode_traps() {
        let mut cpu = cpu_with(&[0x00]);
        cpu.memory.set_vector(vectors::TRAP, 0xA000);
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.pc, 0xA000);
    }

    #[test]
    fn irq1_respects_mask() {
        // CLI; NOP; NOP
        let mut cpu = cpu_with(&[0x01, 0x0E, 0x01]);
        cpu.memory.set_vector(vectors::IRQ1, 0xB000);
        cpu.set_irq1(true);
        cpu.step(); // NOP, still masked
        assert_eq!(cpu.pc, 0x8001);
        cpu.step(); // CLI
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.pc, 0xB000);
        assert!(cpu.flag(I));
    }

    #[test]
    fn wai_stacks_once_and_resumes_on_irq() {
        let mut cpu = cpu_with(&[0x0E, 0x3E]);
        cpu.memory.set_vector(vectors::IRQ1, 0xB000);
        cpu.step(); // CLI
        assert_eq!(cpu.step(), 9);
        assert_eq!(cpu.run_state(), RunState::Waiting);
        let sp_after_wai = cpu.sp;
        assert_eq!(cpu.step(), IDLE_CYCLES);
        cpu.set_irq1(true);
        cpu.step();
        assert_eq!(cpu.run_state(), RunState::Running);
        assert_eq!(cpu.pc, 0xB000);
        assert_eq!(cpu.sp, sp_after_wai);
    }

    #[test]
    fn nmi_ignores_mask() {
        let mut cpu = cpu_with(&[0x01]);
        cpu.memory.set_vector(vectors::NMI, 0xC000);
        cpu.trigger_nmi();
        assert_eq!(cpu.step(), 12);
        assert_eq!(cpu.pc, 0xC000);
    }

    #[test]
    fn io_block_is_decoded_on_chip() {
        // LDAA #$55; STAA $16 (P6DDR); STAA $20 (external RAM)
        let mut cpu = cpu_with(&[0x86, 0x55, 0x97, 0x16, 0x97, 0x20]);
        cpu.step();
        cpu.step();
        cpu.step();
        assert_eq!(cpu.io.port_ddr[5], 0x55);
        assert_eq!(cpu.memory.data[0x16], 0);
        assert_eq!(cpu.memory.data[0x20], 0x55);
    }

    #[test]
    fn port_output_pulls_inputs_high() {
        // LDAA #$08; STAA $17 (P6 data); STAA $16 (P6DDR = bit 3 output); CLR $0017
        let mut cpu = cpu_with(&[0x86, 0x08, 0x97, 0x17, 0x97, 0x16, 0x7F, 0x00, 0x17]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.memory.port_writes.last(), Some(&(Port::P6, 0xFF)));
        cpu.step();
        assert_eq!(cpu.memory.port_writes.last(), Some(&(Port::P6, 0xFF)));
        cpu.step();
        assert_eq!(cpu.memory.port_writes.last(), Some(&(Port::P6, 0xF7)));
    }

    #[test]
    fn port_read_mixes_latch_and_pins() {
        // LDAA #$F0; STAA $01 (P2DDR); LDAA #$A0; STAA $03; LDAB $03
        let mut cpu = cpu_with(&[0x86, 0xF0, 0x97, 0x01, 0x86, 0xA0, 0x97, 0x03, 0xD6, 0x03]);
        cpu.memory.port_inputs[Port::P2.index()] = 0x05;
        for _ in 0..5 {
            cpu.step();
        }
        assert_eq!(cpu.b, 0xA5);
    }

    #[test]
    fn counter_overflow_raises_toi() {
        let mut cpu = cpu_with(&[0x01; 16]);
        cpu.memory.set_vector(vectors::TOI, 0xD000);
        cpu.io.frc = 0xFFFE;
        cpu.io.tcsr1 = TCSR_ETOI;
        cpu.cc &= !I;
        cpu.step(); // NOP: FFFE -> FFFF
        assert_eq!(cpu.io.tcsr1 & TCSR_TOF, 0);
        cpu.step(); // FFFF -> 0000
        assert_eq!(cpu.io.tcsr1 & TCSR_TOF, TCSR_TOF);
        cpu.step();
        assert_eq!(cpu.pc, 0xD000);
    }

    #[test]
    fn overflow_flag_clears_after_tcsr_then_counter_read() {
        // LDAA $08; LDAA $09
        let mut cpu = cpu_with(&[0x96, 0x08, 0x96, 0x09]);
        cpu.io.tcsr1 = TCSR_TOF;
        cpu.step();
        assert_eq!(cpu.a & TCSR_TOF, TCSR_TOF);
        cpu.step();
        assert_eq!(cpu.io.tcsr1 & TCSR_TOF, 0);
    }

    #[test]
    fn output_compare_sets_flag_and_clears_on_write() {
        // NOP x3, then LDAA $08; STAA $0C
        let mut cpu = cpu_with(&[0x01, 0x01, 0x01, 0x96, 0x08, 0x97, 0x0C]);
        cpu.io.ocr1 = 0x0002;
        cpu.step();
        assert_eq!(cpu.io.tcsr1 & TCSR_OCF1, 0);
        cpu.step();
        assert_eq!(cpu.io.tcsr1 & TCSR_OCF1, TCSR_OCF1);
        cpu.step();
        cpu.step();
        cpu.step();
        assert_eq!(cpu.io.tcsr1 & TCSR_OCF1, 0);
    }

    #[test]
    fn sleep_wakes_on_output_compare() {
        let mut cpu = cpu_with(&[0x0E, 0x1A, 0x01]);
        cpu.memory.set_vector(vectors::OCI, 0xE000);
        cpu.io.ocr1 = 0x0040;
        cpu.io.tcsr1 = TCSR_EOCI1;
        cpu.step(); // CLI
        cpu.step(); // SLP
        assert_eq!(cpu.run_state(), RunState::Sleeping);
        let mut guard = 0;
        while cpu.pc != 0xE000 {
            cpu.step();
            guard += 1;
            assert!(guard < 100, "CPU never woke up");
        }
        assert_eq!(cpu.run_state(), RunState::Running);
    }

    #[test]
    fn timer2_compare_match() {
        let mut cpu = cpu_with(&[0x01; 8]);
        cpu.io.tconr = 3;
        cpu.io.tcsr3 = TCSR3_T2E; // E clock
        cpu.step();
        cpu.step();
        assert_eq!(cpu.io.tcsr3 & TCSR3_CMF, 0);
        cpu.step();
        assert_eq!(cpu.io.tcsr3 & TCSR3_CMF, TCSR3_CMF);
        assert_eq!(cpu.io.t2cnt, 0);
    }

    #[test]
    fn sci_transmits_after_one_frame() {
        // LDAA #$02; STAA $11 (TE); LDAA #$90; STAA $13
        let mut cpu = cpu_with(&[0x86, 0x02, 0x97, 0x11, 0x86, 0x90, 0x97, 0x13, 0x20, 0xFE]);
        cpu.set_sci_external_clock(500_000, 1_789_773);
        cpu.io.rmcr = 0x0C;
        for _ in 0..4 {
            cpu.step();
        }
        assert!(cpu.take_sci_output().is_empty());
        for _ in 0..200 {
            cpu.step();
        }
        assert_eq!(cpu.take_sci_output(), vec![0x90]);
        assert_eq!(cpu.io.trcsr & TRCSR_TDRE, TRCSR_TDRE);
    }

    #[test]
    fn sci_receive_sets_rdrf_and_overrun() {
        // LDAA #$08; STAA $11 (RE); BRA *
        let mut cpu = cpu_with(&[0x86, 0x08, 0x97, 0x11, 0x20, 0xFE]);
        cpu.io.rmcr = 0x00; // E/16 per bit, 160 cycles per frame
        cpu.sci_receive(0x90);
        cpu.sci_receive(0x3C);
        cpu.step();
        cpu.step();
        let mut guard = 0;
        while cpu.io.trcsr & TRCSR_RDRF == 0 {
            cpu.step();
            guard += 1;
            assert!(guard < 200);
        }
        assert_eq!(cpu.io.rdr, 0x90);
        for _ in 0..100 {
            cpu.step();
        }
        assert_eq!(cpu.io.trcsr & TRCSR_ORFE, TRCSR_ORFE);
        assert_eq!(cpu.io.rdr, 0x90);
    }

    #[test]
    fn sci_flags_clear_after_status_then_data_read() {
        // LDAA $11; LDAB $12
        let mut cpu = cpu_with(&[0x96, 0x11, 0xD6, 0x12]);
        cpu.io.trcsr |= TRCSR_RDRF;
        cpu.io.rdr = 0x42;
        cpu.step();
        cpu.step();
        assert_eq!(cpu.b, 0x42);
        assert_eq!(cpu.io.trcsr & TRCSR_RDRF, 0);
    }

    #[test]
    fn external_clock_frame_length_matches_midi_rate() {
        let mut cpu = cpu_with(&[0x01]);
        cpu.set_sci_external_clock(500_000, 1_789_773);
        cpu.io.rmcr = 0x0C;
        // 320 us at 1.789773 MHz
        assert_eq!(cpu.sci_frame_cycles(), 573);
        cpu.io.rmcr = 0x01;
        assert_eq!(cpu.sci_frame_cycles(), 1280);
    }

    #[test]
    fn state_roundtrip() {
        let mut cpu = cpu_with(&[0x86, 0x42, 0x01]);
        cpu.step();
        cpu.io.tcsr1 = TCSR_EOCI1;
        let state = cpu.save_state();

        let mut other = cpu_with(&[]);
        other.load_state(&state);
        assert_eq!(other.a, 0x42);
        assert_eq!(other.pc, 0x8002);
        assert_eq!(other.io, cpu.io);
        assert_eq!(other.save_state(), state);
    }
}
