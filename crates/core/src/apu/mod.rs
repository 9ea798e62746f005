//! Sound chip components.
//!
//! Chips are modeled behind the [`AudioChip`] trait so a system can write
//! registers, clock the chip from its own scheduler and pick up output levels
//! without knowing which chip it is driving.
//!
//! ## Audio Chips
//!
//! - **YM2414 (OPZ)**: Yamaha 4-operator FM chip. Register file, timers, status
//!   and IRQ are modeled; the FM voice engine is not, so its outputs are silent.

pub mod audio_chip;
pub mod ym2414;

pub use audio_chip::AudioChip;
pub use ym2414::Ym2414;
