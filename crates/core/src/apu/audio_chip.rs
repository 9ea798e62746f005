//! Audio chip trait for pluggable audio implementations.
//!
//! The host system owns scheduling: it converts elapsed CPU time into chip
//! clocks, calls [`AudioChip::advance`] and, for every completed output
//! sample, reads the chip's outputs and applies its own speaker routing.

/// A sound chip driven by an external clock.
pub trait AudioChip {
    /// Write to a register port on the audio chip
    fn write_register(&mut self, addr: u16, val: u8);

    /// Read from a register port on the audio chip (if supported)
    fn read_register(&self, addr: u16) -> u8 {
        let _ = addr;
        0 // Default: no readable registers
    }

    /// Advance the chip by `clocks` input clocks.
    ///
    /// Returns how many output samples completed during the advance.
    fn advance(&mut self, clocks: u32) -> u32;

    /// Current level of one output pin
    fn output(&self, channel: usize) -> i16;

    /// Number of output pins (1 = mono, 2 = stereo)
    fn output_count(&self) -> usize {
        1
    }

    /// Input clock frequency in Hz
    fn clock_hz(&self) -> f64;

    /// Input clocks per output sample
    fn clocks_per_sample(&self) -> u32;

    /// Native output sample rate in Hz
    fn sample_rate(&self) -> f64 {
        self.clock_hz() / self.clocks_per_sample() as f64
    }

    /// Whether the chip is asserting its IRQ output
    fn irq(&self) -> bool {
        false
    }

    /// Reset the chip to power-on state
    fn reset(&mut self);
}
