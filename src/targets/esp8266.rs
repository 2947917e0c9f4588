use std::collections::HashMap;

use super::{bytes_to_mac_addr, ChipInfo, ReadEFuse, SpiRegisters, Target};
use crate::{connection::Connection, flasher::FlashSize, Error};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xfff0_c101];

/// ESP8266 Target
pub struct Esp8266;

impl Esp8266 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl ReadEFuse for Esp8266 {
    fn efuse_reg(&self) -> u32 {
        0x3ff0_0050
    }
}

impl Target for Esp8266 {
    fn chip_info(&self, connection: &mut Connection) -> Result<ChipInfo, Error> {
        let mut words = [0u32; 4];
        for (n, word) in words.iter_mut().enumerate() {
            *word = self.read_efuse(connection, n as u32)?;
        }

        Esp8266Info::decode(&words).map(ChipInfo::Esp8266)
    }

    fn flash_size_encodings(&self) -> HashMap<FlashSize, u8> {
        use FlashSize::*;

        HashMap::from([
            (_512Kb, 0x0),
            (_256Kb, 0x1),
            (_1Mb, 0x2),
            (_2Mb, 0x3),
            (_4Mb, 0x4),
            (_8Mb, 0x8),
            (_16Mb, 0x9),
        ])
    }

    fn needs_spi_attach(&self) -> bool {
        false
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x6000_0200,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x40,
            mosi_length_offset: None,
            miso_length_offset: None,
        }
    }
}

/// ESP8266 identity decoded from the OTP words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esp8266Info {
    pub model: String,
    pub chip_id: u32,
    pub mac: String,
}

impl Esp8266Info {
    /// Decode OTP words 0 to 3
    ///
    /// Without a programmed OUI, the second OTP word selects one of the two
    /// Espressif prefixes; any other value is rejected.
    pub fn decode(words: &[u32; 4]) -> Result<Self, Error> {
        let [word0, word1, word2, word3] = *words;

        let chip_id = (word0 >> 24) | ((word1 & 0x00ff_ffff) << 8);

        // First determine the OUI portion of the MAC address
        let mut bytes = if word3 != 0 {
            vec![
                ((word3 >> 16) & 0xff) as u8,
                ((word3 >> 8) & 0xff) as u8,
                (word3 & 0xff) as u8,
            ]
        } else {
            match ((word1 >> 16) & 0xff) as u8 {
                0 => vec![0x18, 0xfe, 0x34],
                1 => vec![0xac, 0xd0, 0x74],
                selector => return Err(Error::UnknownOui(selector)),
            }
        };

        // Add the remaining NIC portion of the MAC address
        bytes.push(((word1 >> 8) & 0xff) as u8);
        bytes.push((word1 & 0xff) as u8);
        bytes.push(((word0 >> 24) & 0xff) as u8);

        let esp8285 = word0 & (1 << 4) != 0 || word2 & (1 << 16) != 0;

        Ok(Esp8266Info {
            model: if esp8285 { "ESP8285" } else { "ESP8266EX" }.to_string(),
            chip_id,
            mac: bytes_to_mac_addr(&bytes),
        })
    }
}
