//! TX81Z address decoder
//!
//! ```text
//! $0000-$001F  HD6303X on-chip I/O (decoded inside the CPU core)
//! $0040-$00FF  HD6303X on-chip RAM (192 bytes)
//! $2000-$2001  YM2414 (A0=0 address/status, A0=1 data)
//! $4000-$4001  HD44780 LCD controller (A0=0 instruction/busy, A0=1 data)
//! $6000-$7FFF  Battery-backed RAM (8 KiB)
//! $8000-$FFFF  Program ROM, one 32 KiB bank selected by port 6 bit 3
//! ```
//!
//! Everything else is open bus.

use crate::config::ConfigError;

/// What an address range is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    InternalIo,
    InternalRam,
    Ym2414,
    Lcdc,
    Nvram,
    RomBank,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::InternalIo,
        Region::InternalRam,
        Region::Ym2414,
        Region::Lcdc,
        Region::Nvram,
        Region::RomBank,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Region::InternalIo => "internal I/O",
            Region::InternalRam => "internal RAM",
            Region::Ym2414 => "ym2414",
            Region::Lcdc => "lcdc",
            Region::Nvram => "nvram",
            Region::RomBank => "rombank",
        }
    }
}

/// One decoded range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u16,
    pub end: u16,
    pub region: Region,
}

impl MapEntry {
    pub const fn new(start: u16, end: u16, region: Region) -> Self {
        Self { start, end, region }
    }

    pub fn contains(&self, addr: u16) -> bool {
        addr >= self.start && addr <= self.end
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of `addr` inside this range
    pub fn offset(&self, addr: u16) -> usize {
        addr.wrapping_sub(self.start) as usize
    }
}

pub static MEMORY_MAP: [MapEntry; 6] = [
    MapEntry::new(0x0000, 0x001F, Region::InternalIo),
    MapEntry::new(0x0040, 0x00FF, Region::InternalRam),
    MapEntry::new(0x2000, 0x2001, Region::Ym2414),
    MapEntry::new(0x4000, 0x4001, Region::Lcdc),
    MapEntry::new(0x6000, 0x7FFF, Region::Nvram),
    MapEntry::new(0x8000, 0xFFFF, Region::RomBank),
];

/// Decode an address against the TX81Z map
pub fn lookup(addr: u16) -> Option<&'static MapEntry> {
    lookup_in(&MEMORY_MAP, addr)
}

pub fn lookup_in(table: &[MapEntry], addr: u16) -> Option<&MapEntry> {
    table.iter().find(|entry| entry.contains(addr))
}

/// The TX81Z map entry for a region
pub fn region(region: Region) -> Option<&'static MapEntry> {
    MEMORY_MAP.iter().find(|entry| entry.region == region)
}

/// Number of addresses that decode to something
pub fn mapped_bytes(table: &[MapEntry]) -> usize {
    table.iter().map(MapEntry::len).sum()
}

/// Check that a table is sorted, non-overlapping and names every region exactly once
pub fn validate(table: &[MapEntry]) -> Result<(), ConfigError> {
    for entry in table {
        if entry.is_empty() {
            return Err(ConfigError::EmptyRange {
                region: entry.region.name(),
            });
        }
    }

    for pair in table.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.start < prev.start {
            return Err(ConfigError::UnsortedMap {
                region: next.region.name(),
            });
        }
        if next.start <= prev.end {
            return Err(ConfigError::OverlappingRanges {
                first: prev.region.name(),
                second: next.region.name(),
            });
        }
    }

    for region in Region::ALL {
        let count = table.iter().filter(|e| e.region == region).count();
        if count != 1 {
            return Err(ConfigError::RegionCount {
                region: region.name(),
                count,
            });
        }
    }

    Ok(())
}
