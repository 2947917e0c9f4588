//! Stub loader module.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{targets::Chip, Error};

/// Flash stub object (deserialized from TOML, converted from JSON as used by
/// `esptool.py`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data
    data: String,
    /// Start of data section address
    data_start: u32,
    #[serde(skip)]
    chip: Option<Chip>,
}

pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x40001000;
pub(crate) const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";

pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;
pub(crate) const FLASH_WRITE_SIZE: usize = 0x400;
pub(crate) const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// Largest block the ROM accepts in a single MemData command
pub(crate) const RAM_BLOCK_SIZE: usize = 0x1800;

impl FlashStub {
    /// Path of the stub for `chip` inside `dir`
    pub fn path(chip: Chip, dir: &Path) -> PathBuf {
        dir.join(format!("{}.toml", chip.file_stem()))
    }

    /// Load the flash stub for the provided chip from a stub directory
    pub fn load(chip: Chip, dir: &Path) -> Result<FlashStub, Error> {
        let path = Self::path(chip, dir);
        let s = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::StubNotFound {
                chip,
                path: path.display().to_string(),
            },
            _ => Error::FileOpenError(path.display().to_string(), e),
        })?;

        Self::parse(chip, &s)
    }

    /// Parse a stub from its TOML text
    pub fn parse(chip: Chip, s: &str) -> Result<FlashStub, Error> {
        let mut stub: FlashStub = toml::from_str(s).map_err(|e| Error::InvalidStub {
            chip,
            reason: e.message().to_string(),
        })?;
        stub.chip = Some(chip);

        Ok(stub)
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.text_start, self.decode("text", &self.text)?))
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.data_start, self.decode("data", &self.data)?))
    }

    fn decode(&self, section: &str, encoded: &str) -> Result<Vec<u8>, Error> {
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidStub {
                chip: self.chip.unwrap_or(Chip::Esp32),
                reason: format!("the {section} section is not valid base64: {e}"),
            })
    }
}
