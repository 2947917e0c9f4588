//! Application and bootloader image headers
//!
//! Only the common 8 byte header is interpreted: the flash mode and the flash
//! configuration byte (size in the high nibble, frequency in the low nibble)
//! are read from the application and rewritten in the boot image.

use std::{borrow::Cow, fmt, mem::size_of};

use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use sha2::{Digest, Sha256};

use crate::{
    error::Error,
    flasher::{FlashFrequency, FlashMode, FlashSize},
    targets::Chip,
};

const ESP_MAGIC: u8 = 0xE9;
/// Length of the ESP32 extended header that follows the common header
const EXTENDED_HEADER_LEN: usize = 16;
const APPEND_DIGEST_OFFSET: usize = size_of::<ImageHeader>() + EXTENDED_HEADER_LEN - 1;
const DIGEST_LEN: usize = 32;

/// Common header at the start of every ESP8266/ESP32 image
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
#[doc(alias = "esp_image_header_t")]
pub struct ImageHeader {
    magic: u8,
    segment_count: u8,
    /// Flash read mode (esp_image_spi_mode_t)
    flash_mode: u8,
    /// ..4 bits are flash frequency (esp_image_spi_freq_t)
    /// 4.. bits are flash chip size (esp_image_flash_size_t)
    flash_config: u8,
    entry: u32,
}

impl ImageHeader {
    /// Read the header at the start of `image`
    pub fn parse(image: &[u8]) -> Result<Self, Error> {
        if image.len() < size_of::<ImageHeader>() {
            return Err(Error::InvalidImage(format!(
                "image is only {} bytes long",
                image.len()
            )));
        }

        let header: ImageHeader = *from_bytes(&image[..size_of::<ImageHeader>()]);
        if header.magic != ESP_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad magic byte {:#04x}, expected {:#04x}",
                header.magic, ESP_MAGIC
            )));
        }

        Ok(header)
    }

    pub fn flash_mode(&self) -> Result<FlashMode, Error> {
        FlashMode::from_repr(self.flash_mode).ok_or_else(|| {
            Error::InvalidImage(format!("unknown flash mode {:#04x}", self.flash_mode))
        })
    }

    pub fn flash_frequency(&self) -> Result<FlashFrequency, Error> {
        let code = self.flash_config & 0x0F;
        FlashFrequency::from_header_code(code)
            .ok_or_else(|| Error::InvalidImage(format!("unknown flash frequency {code:#x}")))
    }

    /// Updates the flash mode, size and frequency fields
    pub fn write_flash_config(
        &mut self,
        mode: FlashMode,
        size: FlashSize,
        freq: FlashFrequency,
        chip: Chip,
    ) -> Result<(), Error> {
        let flash_size = size.encode_flash_size(chip)?;
        let flash_speed = freq.encode_flash_frequency(chip)?;

        self.flash_mode = mode as u8;
        // bit field
        self.flash_config = (flash_size << 4) | flash_speed;
        Ok(())
    }
}

/// Rewrite the flash settings in the header of the image the ROM boots from
///
/// When an ESP32 image carries an appended SHA-256 digest it is recomputed,
/// since the digest covers the header.
pub fn patch_boot_header(
    image: &mut [u8],
    mode: FlashMode,
    size: FlashSize,
    freq: FlashFrequency,
    chip: Chip,
) -> Result<(), Error> {
    let mut header = ImageHeader::parse(image)?;
    header.write_flash_config(mode, size, freq, chip)?;
    image[..size_of::<ImageHeader>()].copy_from_slice(bytes_of(&header));

    let has_digest = chip == Chip::Esp32
        && image.len() > APPEND_DIGEST_OFFSET + DIGEST_LEN
        && image[APPEND_DIGEST_OFFSET] == 1;
    if has_digest {
        let body_len = image.len() - DIGEST_LEN;
        let digest = Sha256::digest(&image[..body_len]);
        image[body_len..].copy_from_slice(&digest);
    }

    Ok(())
}

/// A contiguous run of bytes placed at a fixed flash or RAM address
#[derive(Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub addr: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    pub fn new(addr: u32, data: impl Into<Cow<'a, [u8]>>) -> Self {
        Segment {
            addr,
            data: data.into(),
        }
    }

    /// Size of the segment in bytes
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// First address past the end of the segment
    pub fn end(&self) -> u64 {
        self.addr as u64 + self.data.len() as u64
    }
}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.data.len())
            .finish()
    }
}
