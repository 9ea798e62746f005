//! Battery-backed RAM (TC5564 + CR2032)

use crate::config::NvramDefault;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum NvramError {
    #[error("NVRAM image is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("NVRAM I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Nvram {
    data: Vec<u8>,
    default: NvramDefault,
    dirty: bool,
}

impl Nvram {
    /// Fresh memory, as on first power-up
    pub fn new(size: usize, default: NvramDefault) -> Self {
        Self {
            data: vec![default.fill_byte(); size],
            default,
            dirty: false,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn read(&self, offset: usize) -> u8 {
        self.data.get(offset).copied().unwrap_or(0)
    }

    pub fn write(&mut self, offset: usize, val: u8) {
        if let Some(byte) = self.data.get_mut(offset) {
            if *byte != val {
                *byte = val;
                self.dirty = true;
            }
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// True once the CPU changed a byte since the last load or save
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force the next write-back, e.g. after contents were restored from a save state
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Re-apply the first power-up contents
    pub fn apply_default(&mut self) {
        self.data.fill(self.default.fill_byte());
        self.dirty = false;
    }

    pub fn load(&mut self, bytes: &[u8]) -> Result<(), NvramError> {
        if bytes.len() != self.data.len() {
            return Err(NvramError::SizeMismatch {
                expected: self.data.len(),
                actual: bytes.len(),
            });
        }
        self.data.copy_from_slice(bytes);
        self.dirty = false;
        Ok(())
    }

    /// Load from disk; a missing file means first power-up
    pub fn load_from_path(&mut self, path: &Path) -> Result<(), NvramError> {
        match std::fs::read(path) {
            Ok(bytes) => self.load(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.apply_default();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_to_path(&mut self, path: &Path) -> Result<(), NvramError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &self.data)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_power_up_applies_default() {
        let nvram = Nvram::new(0x2000, NvramDefault::AllZero);
        assert_eq!(nvram.size(), 8192);
        assert!(nvram.contents().iter().all(|&b| b == 0));

        let nvram = Nvram::new(16, NvramDefault::AllOnes);
        assert!(nvram.contents().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn writes_mark_dirty_and_ignore_out_of_range() {
        let mut nvram = Nvram::new(0x2000, NvramDefault::AllZero);
        nvram.write(0x10, 0);
        assert!(!nvram.is_dirty());
        nvram.write(0x10, 0x5A);
        assert!(nvram.is_dirty());
        assert_eq!(nvram.read(0x10), 0x5A);
        nvram.write(0x2000, 1);
        assert_eq!(nvram.read(0x2000), 0);
    }

    #[test]
    fn load_rejects_wrong_size() {
        let mut nvram = Nvram::new(0x2000, NvramDefault::AllZero);
        assert!(matches!(
            nvram.load(&[0; 100]),
            Err(NvramError::SizeMismatch {
                expected: 0x2000,
                actual: 100
            })
        ));
    }

    #[test]
    fn survives_save_and_reload_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nvram").join("tx81z.nv");

        let mut nvram = Nvram::new(0x2000, NvramDefault::AllZero);
        nvram.write(0x0000, 0x12);
        nvram.write(0x1FFF, 0x34);
        nvram.save_to_path(&path).expect("save");
        assert!(!nvram.is_dirty());

        let mut restored = Nvram::new(0x2000, NvramDefault::AllZero);
        restored.load_from_path(&path).expect("load");
        assert_eq!(restored.contents(), nvram.contents());
    }

    #[test]
    fn restored_contents_can_be_flagged_for_write_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tx81z.nv");

        let mut nvram = Nvram::new(0x2000, NvramDefault::AllZero);
        let mut image = vec![0u8; 0x2000];
        image[0x100] = 0xA5;
        nvram.load(&image).expect("load");
        assert!(!nvram.is_dirty());

        nvram.mark_dirty();
        assert!(nvram.is_dirty());
        nvram.save_to_path(&path).expect("save");
        assert!(!nvram.is_dirty());
        assert_eq!(std::fs::read(&path).expect("read"), image);
    }

    #[test]
    fn missing_file_means_first_power_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut nvram = Nvram::new(0x2000, NvramDefault::AllZero);
        nvram.write(5, 5);
        nvram
            .load_from_path(&dir.path().join("absent.nv"))
            .expect("missing is fine");
        assert!(nvram.contents().iter().all(|&b| b == 0));
    }
}
