//! Flashable target devices
//!
//! Both supported chips are identified through the ROM's magic register and
//! describe themselves through eFuse/OTP words, decoded into a [ChipInfo].

use std::{collections::HashMap, fmt};

use strum::{Display, EnumIter};

pub use self::{
    esp32::{Esp32, Esp32Info},
    esp8266::{Esp8266, Esp8266Info},
};
use crate::{
    connection::Connection,
    flasher::{FlashFrequency, FlashSize},
    Error,
};

mod esp32;
mod esp8266;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[non_exhaustive]
pub enum Chip {
    /// ESP32
    #[strum(serialize = "ESP32")]
    Esp32,
    /// ESP8266, ESP8285
    #[strum(serialize = "ESP8266")]
    Esp8266,
}

impl Chip {
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        if Esp32::has_magic_value(magic) {
            Ok(Chip::Esp32)
        } else if Esp8266::has_magic_value(magic) {
            Ok(Chip::Esp8266)
        } else {
            Err(Error::UnsupportedChip(magic))
        }
    }

    pub fn into_target(&self) -> Box<dyn Target> {
        match self {
            Chip::Esp32 => Box::new(Esp32),
            Chip::Esp8266 => Box::new(Esp8266),
        }
    }

    /// Lower-case name used for the chip's stub file
    pub fn file_stem(&self) -> &'static str {
        match self {
            Chip::Esp32 => "esp32",
            Chip::Esp8266 => "esp8266",
        }
    }
}

/// SPI register addresses
#[derive(Debug)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// Enable the reading of eFuses for a target
pub trait ReadEFuse {
    /// Returns the base address of the eFuse register
    fn efuse_reg(&self) -> u32;

    /// Given an active connection, read the nth word of the eFuse region
    fn read_efuse(&self, connection: &mut Connection, n: u32) -> Result<u32, Error> {
        let reg = self.efuse_reg() + (n * 0x4);
        connection.read_reg(reg)
    }
}

/// Operations for interacting with supported target devices
pub trait Target: ReadEFuse {
    /// Read and decode everything the chip reports about itself
    fn chip_info(&self, connection: &mut Connection) -> Result<ChipInfo, Error>;

    /// Numeric encodings for the flash frequencies supported by a chip
    fn flash_frequency_encodings(&self) -> HashMap<FlashFrequency, u8> {
        use FlashFrequency::*;

        let encodings = [(_20Mhz, 0x2), (_26Mhz, 0x1), (_40Mhz, 0x0), (_80Mhz, 0xf)];

        HashMap::from(encodings)
    }

    /// Header nibble for each flash size a chip can boot from
    fn flash_size_encodings(&self) -> HashMap<FlashSize, u8>;

    /// Whether the flash must be attached with `SpiAttach` before use
    fn needs_spi_attach(&self) -> bool;

    /// SPI register addresses for a chip
    fn spi_registers(&self) -> SpiRegisters;
}

/// Everything the chip reports about itself, read once after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChipInfo {
    Esp32(Esp32Info),
    Esp8266(Esp8266Info),
}

impl ChipInfo {
    pub fn chip(&self) -> Chip {
        match self {
            ChipInfo::Esp32(_) => Chip::Esp32,
            ChipInfo::Esp8266(_) => Chip::Esp8266,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ChipInfo::Esp32(info) => &info.model,
            ChipInfo::Esp8266(info) => &info.model,
        }
    }

    pub fn mac(&self) -> &str {
        match self {
            ChipInfo::Esp32(info) => &info.mac,
            ChipInfo::Esp8266(info) => &info.mac,
        }
    }
}

impl fmt::Display for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn yes_no(value: bool) -> &'static str {
            if value {
                "YES"
            } else {
                "NO"
            }
        }

        writeln!(f, "Chip Info:")?;
        writeln!(f, " - Chip Family: {}", self.chip())?;
        writeln!(f, " - Chip Model: {}", self.model())?;
        match self {
            ChipInfo::Esp32(info) => {
                writeln!(f, " - Number of Cores: {}", info.cores)?;
                writeln!(f, " - Max CPU Frequency: {}MHz", info.cpu_frequency)?;
                writeln!(f, " - Has Bluetooth: {}", yes_no(info.bluetooth))?;
                writeln!(f, " - Has Embedded Flash: {}", yes_no(info.embedded_flash))?;
                writeln!(
                    f,
                    " - Has Factory-Calibrated ADC: {}",
                    yes_no(info.adc_calibrated)
                )?;
            }
            ChipInfo::Esp8266(info) => {
                writeln!(f, " - Chip ID: {:08X}", info.chip_id)?;
            }
        }
        write!(f, " - MAC Address: {}", self.mac())
    }
}

fn bytes_to_mac_addr(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn magic_values_map_to_chips() {
        assert_eq!(Chip::from_magic(0x00f0_1d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0xfff0_c101).unwrap(), Chip::Esp8266);
    }

    #[test]
    fn unknown_magic_is_unsupported() {
        // ESP32-S2
        assert!(matches!(
            Chip::from_magic(0x0000_07c6),
            Err(Error::UnsupportedChip(0x0000_07c6))
        ));
    }

    #[test]
    fn mac_addresses_are_upper_case() {
        assert_eq!(
            bytes_to_mac_addr(&[0x24, 0x0a, 0xc4, 0x01, 0xab, 0xff]),
            "24:0A:C4:01:AB:FF"
        );
    }

    #[test]
    fn esp8266_summary_shows_the_chip_id() {
        let info = ChipInfo::Esp8266(Esp8266Info {
            model: "ESP8266EX".into(),
            chip_id: 0x00ab_cdef,
            mac: "18:FE:34:AB:CD:EF".into(),
        });

        assert_eq!(
            info.to_string(),
            "Chip Info:\n - Chip Family: ESP8266\n - Chip Model: ESP8266EX\n - Chip ID: 00ABCDEF\n - MAC Address: 18:FE:34:AB:CD:EF"
        );
    }
}
