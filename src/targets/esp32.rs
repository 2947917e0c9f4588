use std::collections::HashMap;

use super::{bytes_to_mac_addr, ChipInfo, ReadEFuse, SpiRegisters, Target};
use crate::{connection::Connection, flasher::FlashSize, Error};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00f0_1d83];

const APB_CTL_DATE_ADDR: u32 = 0x3FF6_607C;

/// ESP32 Target
pub struct Esp32;

impl Esp32 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl ReadEFuse for Esp32 {
    fn efuse_reg(&self) -> u32 {
        0x3FF5_A000
    }
}

impl Target for Esp32 {
    fn chip_info(&self, connection: &mut Connection) -> Result<ChipInfo, Error> {
        let mut words = [0u32; 6];
        for (n, word) in words.iter_mut().enumerate() {
            *word = self.read_efuse(connection, n as u32)?;
        }
        let apb_ctl_date = connection.read_reg(APB_CTL_DATE_ADDR)?;

        Ok(ChipInfo::Esp32(Esp32Info::decode(&words, apb_ctl_date)))
    }

    fn flash_size_encodings(&self) -> HashMap<FlashSize, u8> {
        use FlashSize::*;

        HashMap::from([
            (_1Mb, 0x0),
            (_2Mb, 0x1),
            (_4Mb, 0x2),
            (_8Mb, 0x3),
            (_16Mb, 0x4),
            (_32Mb, 0x5),
            (_64Mb, 0x6),
            (_128Mb, 0x7),
        ])
    }

    fn needs_spi_attach(&self) -> bool {
        true
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x3ff4_2000,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x80,
            mosi_length_offset: Some(0x28),
            miso_length_offset: Some(0x2c),
        }
    }
}

/// ESP32 capabilities decoded from eFuse block 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esp32Info {
    pub model: String,
    pub mac: String,
    pub cores: u8,
    /// Rated CPU frequency in MHz
    pub cpu_frequency: u32,
    pub bluetooth: bool,
    pub embedded_flash: bool,
    pub adc_calibrated: bool,
    /// Major and minor chip revision
    pub revision: (u32, u32),
}

impl Esp32Info {
    /// Decode eFuse block 0 words 0 to 5 and the `APB_CTL_DATE` register
    pub fn decode(words: &[u32; 6], apb_ctl_date: u32) -> Self {
        let word3 = words[3];

        let single_core = word3 & 0x1 != 0;
        let bluetooth = word3 & 0x2 == 0;

        let cpu_frequency = if word3 & (1 << 13) != 0 {
            if word3 & (1 << 12) != 0 {
                160
            } else {
                240
            }
        } else {
            // unrated parts report the lowest supported clock
            80
        };

        let package = ((word3 >> 9) & 0x7) + (((word3 >> 2) & 0x1) << 3);
        let embedded_flash = matches!(package, 2 | 4 | 5 | 6);
        let adc_calibrated = (words[4] >> 8) & 0x1F != 0;

        let revision = (
            major_chip_version(word3, words[5], apb_ctl_date),
            (words[5] >> 24) & 0x3,
        );

        let mac = ((words[2] as u64) << 32) | words[1] as u64;
        let mac = bytes_to_mac_addr(&mac.to_be_bytes()[2..]);

        Esp32Info {
            model: model_name(package, revision, single_core),
            mac,
            cores: if single_core { 1 } else { 2 },
            cpu_frequency,
            bluetooth,
            embedded_flash,
            adc_calibrated,
            revision,
        }
    }
}

fn major_chip_version(word3: u32, word5: u32, apb_ctl_date: u32) -> u32 {
    let rev_bit0 = (word3 >> 15) & 0x1;
    let rev_bit1 = (word5 >> 20) & 0x1;
    let rev_bit2 = (apb_ctl_date >> 31) & 0x1;

    match (rev_bit2 << 2) | (rev_bit1 << 1) | rev_bit0 {
        1 => 1,
        3 => 2,
        7 => 3,
        _ => 0,
    }
}

fn model_name(package: u32, (major, minor): (u32, u32), single_core: bool) -> String {
    let name = match package {
        0 if single_core => "ESP32-S0WDQ6",
        0 => "ESP32-D0WDQ6",
        1 if single_core => "ESP32-S0WD",
        1 => "ESP32-D0WD",
        2 => "ESP32-D2WD",
        4 => "ESP32-U4WDH",
        5 if major == 3 => "ESP32-PICO-V3",
        5 => "ESP32-PICO-D4",
        6 => "ESP32-PICO-V3-02",
        7 => "ESP32-D0WDR2-V3",
        _ => "unknown ESP32",
    };

    format!("{name} (revision v{major}.{minor})")
}
