//! Whole-machine tests driven by small hand-assembled firmware images
//!
//! Every image is a full 64 KiB EPROM. Bank 0 (image $0000-$7FFF) is what the
//! CPU sees at $8000-$FFFF after reset, so the reset vector lives at image
//! offset $7FFE.

use emu_core::logging::{LogCategory, LogConfig, LogLevel};
use emu_core::System;
use emu_tx81z::{Tx81zSystem, MOUNT_BIOS, MOUNT_CHARACTER_ROM};

const ENTRY: u16 = 0x8000;

/// 64 KiB program image with a small assembler-style cursor
struct Image {
    data: Vec<u8>,
}

impl Image {
    fn new() -> Self {
        // Filled with NOPs
        let mut image = Self {
            data: vec![0x01; 0x10000],
        };
        image.vector(0, 0xFFFE, ENTRY);
        image.vector(1, 0xFFFE, ENTRY);
        image
    }

    /// Image offset for a CPU address inside the bank window
    fn offset(bank: usize, addr: u16) -> usize {
        bank * 0x8000 + (addr as usize - 0x8000)
    }

    fn put(&mut self, bank: usize, addr: u16, bytes: &[u8]) {
        let start = Self::offset(bank, addr);
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn vector(&mut self, bank: usize, vector: u16, target: u16) {
        let [hi, lo] = target.to_be_bytes();
        self.put(bank, vector, &[hi, lo]);
    }
}

fn boot(image: &Image) -> Tx81zSystem {
    let mut sys = Tx81zSystem::default();
    sys.mount(MOUNT_BIOS, &image.data).expect("mount program image");
    sys
}

fn run_frames(sys: &mut Tx81zSystem, frames: usize) {
    for _ in 0..frames {
        sys.step_frame().expect("frame");
    }
}

#[test]
fn test_frame_geometry_and_blank_panel() {
    let mut image = Image::new();
    image.put(0, ENTRY, &[0x20, 0xFE]); // BRA *
    let mut sys = boot(&image);

    let frame = sys.step_frame().expect("frame");
    assert_eq!((frame.width, frame.height), (96, 16));
    let off = emu_core::palette::rgb(131, 136, 139);
    assert!(frame.pixels.iter().all(|&p| p == off));
    assert_eq!(sys.frame_count(), 1);
}

#[test]
fn test_bank_switch_from_firmware() {
    let mut image = Image::new();
    // Bank 0: drive P6 bit 3 high, then fall through into bank 1
    image.put(
        0,
        ENTRY,
        &[
            0x86, 0x08, // LDAA #$08
            0x97, 0x16, // STAA P6DDR   (output F7, stays in bank 0)
            0x97, 0x17, // STAA P6DATA  (output FF, bank 1)
            0x86, 0x11, // LDAA #$11 (only reached if the switch failed)
            0xB7, 0x60, 0x00, // STAA $6000
            0x20, 0xFE, // BRA *
        ],
    );
    // Bank 1, continuing at $8006
    image.put(
        1,
        0x8006,
        &[
            0x86, 0x5A, // LDAA #$5A
            0xB7, 0x60, 0x00, // STAA $6000
            0x86, 0x00, // LDAA #$00
            0x97, 0x17, // STAA P6DATA  (back to bank 0)
        ],
    );
    // Bank 0, continuing at $800F
    image.put(
        0,
        0x800F,
        &[
            0x86, 0x77, // LDAA #$77
            0xB7, 0x60, 0x01, // STAA $6001
            0x20, 0xFE, // BRA *
        ],
    );

    let mut sys = boot(&image);
    run_frames(&mut sys, 1);

    assert_eq!(sys.nvram().read(0), 0x5A);
    assert_eq!(sys.nvram().read(1), 0x77);
    assert_eq!(sys.debug_state()["rom_bank"], 0);
}

/// Initialize the panel and copy a zero-terminated string from ROM
fn lcd_program(image: &mut Image, message: &[u8]) {
    const MESSAGE: u16 = 0x8100;
    let [hi, lo] = MESSAGE.to_be_bytes();
    let mut code = Vec::new();
    for cmd in [0x38u8, 0x0C, 0x06, 0x01, 0x80] {
        code.extend_from_slice(&[0x86, cmd, 0xB7, 0x40, 0x00]); // LDAA #cmd, STAA $4000
    }
    code.extend_from_slice(&[
        0xCE, hi, lo, // LDX #MESSAGE
        0xA6, 0x00, // loop: LDAA 0,X
        0x27, 0x06, // BEQ done
        0xB7, 0x40, 0x01, // STAA $4001
        0x08, // INX
        0x20, 0xF6, // BRA loop
        0x20, 0xFE, // done: BRA *
    ]);
    image.put(0, ENTRY, &code);
    let mut text = message.to_vec();
    text.push(0);
    image.put(0, MESSAGE, &text);
}

#[test]
fn test_firmware_writes_lcd_text() {
    let mut image = Image::new();
    lcd_program(&mut image, b"TX81Z TEST");
    let mut sys = boot(&image);
    let frame = sys.step_frame().expect("frame");

    let text = sys.lcd_text();
    assert_eq!(text.len(), 2);
    assert_eq!(text[0], "TX81Z TEST      ");
    assert_eq!(text[1], " ".repeat(16));

    let on = emu_core::palette::rgb(92, 83, 88);
    assert!(frame.pixels.iter().any(|&p| p == on));
    // Bottom line is blank
    assert!(frame.pixels[96 * 8..].iter().all(|&p| p != on));
}

#[test]
fn test_character_rom_replaces_builtin_font() {
    let mut image = Image::new();
    lcd_program(&mut image, b"A");
    let mut sys = boot(&image);

    // Every glyph fully lit
    let char_rom = vec![0x1Fu8; 0x1000];
    sys.mount(MOUNT_CHARACTER_ROM, &char_rom).expect("char rom");
    let frame = sys.step_frame().expect("frame");

    let on = emu_core::palette::rgb(92, 83, 88);
    for y in 0..8 {
        for x in 0..5 {
            assert_eq!(frame.pixel(x, y), Some(on));
        }
    }
}

#[test]
fn test_nvram_survives_reset() {
    let mut image = Image::new();
    image.put(
        0,
        ENTRY,
        &[
            0x7C, 0x60, 0x10, // INC $6010
            0x20, 0xFE, // BRA *
        ],
    );
    let mut sys = boot(&image);
    run_frames(&mut sys, 1);
    assert_eq!(sys.nvram().read(0x10), 1);
    assert!(sys.nvram().is_dirty());

    sys.reset();
    run_frames(&mut sys, 1);
    assert_eq!(sys.nvram().read(0x10), 2);
}

#[test]
fn test_save_state_round_trip_is_deterministic() {
    let mut image = Image::new();
    image.put(
        0,
        ENTRY,
        &[
            0x7C, 0x60, 0x00, // loop: INC $6000
            0x7C, 0x00, 0x40, // INC $0040
            0x20, 0xF8, // BRA loop
        ],
    );
    let mut sys = boot(&image);
    run_frames(&mut sys, 2);
    let state = sys.save_state();

    run_frames(&mut sys, 1);
    let expected_debug = sys.debug_state();
    let expected_nvram = sys.nvram().contents().to_vec();

    let mut restored = boot(&image);
    restored.load_state(&state).expect("load state");
    assert_eq!(restored.frame_count(), 2);
    run_frames(&mut restored, 1);

    assert_eq!(restored.debug_state(), expected_debug);
    assert_eq!(restored.nvram().contents(), &expected_nvram[..]);
}

#[test]
fn test_load_state_rejects_corrupt_nvram() {
    let mut image = Image::new();
    image.put(0, ENTRY, &[0x20, 0xFE]);
    let mut sys = boot(&image);
    let mut state = sys.save_state();
    state["nvram"] = serde_json::json!("not base64!");
    assert!(sys.load_state(&state).is_err());
}

#[test]
fn test_midi_echo_through_sci() {
    LogConfig::global().set_level(LogCategory::Serial, LogLevel::Debug);

    let mut image = Image::new();
    image.put(
        0,
        ENTRY,
        &[
            0x86, 0x0C, // LDAA #$0C
            0x97, 0x10, // STAA RMCR   (external serial clock)
            0x86, 0x0A, // LDAA #$0A
            0x97, 0x11, // STAA TRCSR  (RE | TE)
            0x96, 0x11, // loop: LDAA TRCSR
            0x2A, 0xFC, // BPL loop    (wait for RDRF)
            0x96, 0x12, // LDAA RDR
            0x97, 0x13, // STAA TDR
            0x20, 0xF6, // BRA loop
        ],
    );
    let mut sys = boot(&image);
    let message = [0x90, 0x3C, 0x64, 0x80, 0x3C, 0x00];
    sys.midi_in(&message);
    run_frames(&mut sys, 2);

    assert_eq!(sys.take_midi_out(), message.to_vec());
    assert!(sys.take_midi_out().is_empty());
}

#[test]
fn test_ym2414_timer_drives_irq1() {
    const HANDLER: u16 = 0x8080;
    let mut image = Image::new();
    let mut code = vec![0x8E, 0x00, 0xFF]; // LDS #$00FF
    // Timer A = $300 (16384 chip clocks), then load + IRQ enable
    for (reg, val) in [(0x10u8, 0xC0u8), (0x11, 0x00), (0x14, 0x05)] {
        code.extend_from_slice(&[
            0x86, reg, 0xB7, 0x20, 0x00, // LDAA #reg, STAA $2000
            0x86, val, 0xB7, 0x20, 0x01, // LDAA #val, STAA $2001
        ]);
    }
    code.extend_from_slice(&[
        0x0E, // CLI
        0x20, 0xFE, // BRA *
    ]);
    image.put(0, ENTRY, &code);
    image.put(
        0,
        HANDLER,
        &[
            0x7C, 0x60, 0x00, // INC $6000
            0x86, 0x14, 0xB7, 0x20, 0x00, // select timer control
            0x86, 0x15, 0xB7, 0x20, 0x01, // reset flag A, keep running
            0x3B, // RTI
        ],
    );
    image.vector(0, 0xFFF8, HANDLER);

    let mut sys = boot(&image);
    run_frames(&mut sys, 3);

    // Three frames are ~179k chip clocks, so about ten overflows
    let irqs = sys.nvram().read(0);
    assert!((9..=11).contains(&irqs), "irq count {}", irqs);
    assert_eq!(sys.debug_state()["ym_irq"], false);
}

#[test]
fn test_audio_is_silent_stereo() {
    let mut image = Image::new();
    image.put(0, ENTRY, &[0x20, 0xFE]);
    let mut sys = boot(&image);
    run_frames(&mut sys, 1);

    let samples = sys.get_audio_samples();
    let expected = (sys.audio_sample_rate() / 60.0) as usize * 2;
    assert!(samples.len().abs_diff(expected) <= 4, "{} samples", samples.len());
    assert_eq!(samples.len() % 2, 0);
    assert!(samples.iter().all(|&s| s == 0));
    assert!(sys.get_audio_samples().is_empty());
}
