//! Program ROM set and BIOS selection
//!
//! The TX81Z firmware lives in a single 27512 EPROM (IC15). Eight dumps are
//! known; one of them is picked at boot as the "BIOS". Each dump is 64 KiB and
//! is identified by CRC32 and SHA-1.

use emu_core::logging::{log, LogCategory, LogLevel};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

/// Size of the "program" region
pub const PROGRAM_SIZE: usize = 0x10000;

/// Directory searched under each rompath entry before the entry itself
pub const ROM_SUBDIR: &str = "tx81z";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosVariant {
    pub index: usize,
    pub name: &'static str,
    pub description: &'static str,
    pub file: &'static str,
    pub crc32: u32,
    pub sha1: &'static str,
}

pub static BIOS_VARIANTS: [BiosVariant; 8] = [
    BiosVariant {
        index: 0,
        name: "last",
        description: "Last Revision",
        file: "tx81z-last-revision.ic15",
        crc32: 0x2d635c40,
        sha1: "cae098724079d7b8a711351c3132d7332ca43751",
    },
    BiosVariant {
        index: 1,
        name: "v16",
        description: "Version 1.6",
        file: "tx81z-v1.6.ic15",
        crc32: 0xab9b7347,
        sha1: "208a72c0dc615825c442240e520a6a3c5fe860ea",
    },
    BiosVariant {
        index: 2,
        name: "v15",
        description: "Version 1.5",
        file: "tx81z-27512-image-version-1_5.ic15",
        crc32: 0x64ab615b,
        sha1: "82cdd8637caf3828aee5ccf25f1ed92ae5d65d3b",
    },
    BiosVariant {
        index: 3,
        name: "v14",
        description: "Version 1.4",
        file: "tx81z-v1.4.ic15",
        crc32: 0x694a13e2,
        sha1: "0b656a8040748f1e4ee73df2a9436fee1c724be8",
    },
    BiosVariant {
        index: 4,
        name: "v13",
        description: "Version 1.3",
        file: "tx81z-v1.3.ic15",
        crc32: 0x7abd5a61,
        sha1: "93ae5498ce650fe09952ca81c9ac3821f44c20dc",
    },
    BiosVariant {
        index: 5,
        name: "v12",
        description: "Version 1.2",
        file: "tx81z-v1.2.ic15",
        crc32: 0x8378f744,
        sha1: "d76b573d4deb67f0e1553c9c17804e970b392803",
    },
    BiosVariant {
        index: 6,
        name: "v11",
        description: "Version 1.1",
        file: "tx81z-v1.1.ic15",
        crc32: 0x3e78db9f,
        sha1: "52eafb9a1cb3ffb68e8b8dd7a2b85d9e607f9e1c",
    },
    BiosVariant {
        index: 7,
        name: "v10",
        description: "Version 1.0",
        file: "tx81z-27512-image-first-version-1_0.ic15",
        crc32: 0x2f9628fa,
        sha1: "ce62dfb9a86da092c469fd25328b5447375f5bb2",
    },
];

#[derive(thiserror::Error, Debug)]
pub enum RomError {
    #[error("Unknown BIOS '{name}' (valid: {valid})")]
    UnknownBios { name: String, valid: String },
    #[error("BIOS index {index} out of range (0-{max})")]
    BiosIndexOutOfRange { index: usize, max: usize },
    #[error("{file}: expected {expected} bytes, got {actual}")]
    WrongSize {
        file: String,
        expected: usize,
        actual: usize,
    },
    #[error(
        "{file}: wrong checksum (expected CRC {expected_crc32:08x} SHA1 {expected_sha1}, \
         found CRC {actual_crc32:08x} SHA1 {actual_sha1})"
    )]
    ChecksumMismatch {
        file: String,
        expected_crc32: u32,
        expected_sha1: String,
        actual_crc32: u32,
        actual_sha1: String,
    },
    #[error("{file} not found (searched: {searched})")]
    NotFound { file: String, searched: String },
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// CRC32 and SHA-1 of a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomDigest {
    pub crc32: u32,
    pub sha1: String,
}

impl RomDigest {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self {
            crc32: crc32fast::hash(data),
            sha1: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn matches(&self, variant: &BiosVariant) -> bool {
        self.crc32 == variant.crc32 && self.sha1.eq_ignore_ascii_case(variant.sha1)
    }
}

/// A ROM image read from disk
#[derive(Debug, Clone)]
pub struct LoadedRom {
    pub variant: BiosVariant,
    pub path: PathBuf,
    pub data: Vec<u8>,
    /// False when the image was accepted despite a checksum mismatch
    pub verified: bool,
}

/// The set of firmware images a machine can boot
#[derive(Debug, Clone)]
pub struct RomSet {
    variants: Vec<BiosVariant>,
}

impl Default for RomSet {
    fn default() -> Self {
        Self::tx81z()
    }
}

impl RomSet {
    pub fn tx81z() -> Self {
        Self::new(BIOS_VARIANTS.to_vec())
    }

    pub fn new(variants: Vec<BiosVariant>) -> Self {
        Self { variants }
    }

    pub fn variants(&self) -> &[BiosVariant] {
        &self.variants
    }

    /// The variant booted when no BIOS is requested
    pub fn default_variant(&self) -> Option<&BiosVariant> {
        self.variants.first()
    }

    /// Select a variant by short name (case-insensitive)
    pub fn select(&self, name: &str) -> Result<&BiosVariant, RomError> {
        self.variants
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RomError::UnknownBios {
                name: name.to_string(),
                valid: self
                    .variants
                    .iter()
                    .map(|v| v.name)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn select_index(&self, index: usize) -> Result<&BiosVariant, RomError> {
        self.variants
            .get(index)
            .ok_or(RomError::BiosIndexOutOfRange {
                index,
                max: self.variants.len().saturating_sub(1),
            })
    }

    /// Check a dump against a variant's size and checksums
    pub fn verify(&self, variant: &BiosVariant, data: &[u8]) -> Result<(), RomError> {
        if data.len() != PROGRAM_SIZE {
            return Err(RomError::WrongSize {
                file: variant.file.to_string(),
                expected: PROGRAM_SIZE,
                actual: data.len(),
            });
        }
        let digest = RomDigest::of(data);
        if digest.matches(variant) {
            Ok(())
        } else {
            Err(RomError::ChecksumMismatch {
                file: variant.file.to_string(),
                expected_crc32: variant.crc32,
                expected_sha1: variant.sha1.to_string(),
                actual_crc32: digest.crc32,
                actual_sha1: digest.sha1,
            })
        }
    }

    /// Which known variant (if any) a dump is
    pub fn identify(&self, data: &[u8]) -> Option<&BiosVariant> {
        if data.len() != PROGRAM_SIZE {
            return None;
        }
        let digest = RomDigest::of(data);
        self.variants.iter().find(|v| digest.matches(v))
    }

    /// Find a variant's file on a `;`-separated rompath
    pub fn locate(&self, rompath: &str, variant: &BiosVariant) -> Result<PathBuf, RomError> {
        let mut searched = Vec::new();
        for dir in rompath.split(';').map(str::trim).filter(|d| !d.is_empty()) {
            let dir = Path::new(dir);
            for candidate in [dir.join(ROM_SUBDIR).join(variant.file), dir.join(variant.file)] {
                if candidate.is_file() {
                    return Ok(candidate);
                }
                searched.push(candidate.display().to_string());
            }
        }
        Err(RomError::NotFound {
            file: variant.file.to_string(),
            searched: searched.join(", "),
        })
    }

    /// Locate, read and verify a variant.
    ///
    /// Missing files and wrong sizes always fail. A checksum mismatch fails in
    /// strict mode; otherwise it is logged and the image is used anyway.
    pub fn load(
        &self,
        rompath: &str,
        variant: &BiosVariant,
        strict: bool,
    ) -> Result<LoadedRom, RomError> {
        let path = self.locate(rompath, variant)?;
        let data = std::fs::read(&path).map_err(|source| RomError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let verified = match self.verify(variant, &data) {
            Ok(()) => true,
            Err(err @ RomError::ChecksumMismatch { .. }) => {
                if strict {
                    return Err(err);
                }
                log(LogCategory::Bus, LogLevel::Warn, || {
                    format!("{} (may not work)", err)
                });
                false
            }
            Err(err) => return Err(err),
        };

        Ok(LoadedRom {
            variant: *variant,
            path,
            data,
            verified,
        })
    }
}
