//! Commands understood by the ROM bootloader and the flasher stub

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{SpiAttachParams, SpiSetParams};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const FLASH_BEGIN_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_DEFLATE_END_TIMEOUT: Duration = Duration::from_secs(10);
const FLASH_MD5_TIMEOUT: Duration = Duration::from_secs(8);

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

const CHECKSUM_INIT: u8 = 0xEF;

/// Types of commands that can be sent to a target device
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    Unknown = 0,
    // Supported by both the ROM loader and the stub
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    // Not supported by the ESP8266 ROM loader
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    // Stub only
    EraseFlash = 0xD0,
    // Read SPI flash manufacturer and device id, not part of the protocol
    FlashDetect = 0x9F,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFLATE_END_TIMEOUT,
            CommandType::FlashMd5 => FLASH_MD5_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout scaled by the amount of data the command touches
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                FLASH_DEFLATE_END_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashDeflBegin => calc_timeout(FLASH_BEGIN_TIMEOUT_PER_MB, size),
            CommandType::FlashDeflData => calc_timeout(ERASE_WRITE_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        spi_params: SpiSetParams,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
    },
    SpiAttachStub {
        spi_params: SpiAttachParams,
    },
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    FlashDetect,
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } | Command::SpiAttachStub { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::FlashDetect => CommandType::FlashDetect,
        }
    }

    /// Return a timeout based on the size
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    /// Write the command packet, without SLIP framing
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        // Direction and command identifier
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )?;
            }
            Command::MemData {
                pad_to,
                pad_byte,
                data,
                sequence,
            }
            | Command::FlashDeflData {
                pad_to,
                pad_byte,
                data,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            // The stub reboots on 0 and does nothing on 1
            Command::FlashDeflEnd { reboot } => {
                write_basic(writer, &[u8::from(!reboot)], 0)?;
            }
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(no_entry),
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_FRAME, 0)?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    address: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    address,
                    value,
                    mask: mask.unwrap_or(0xFFFFFFFF),
                    delay_us: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { spi_params } => {
                write_basic(writer, &spi_params.encode(), 0)?;
            }
            Command::SpiAttach { spi_params } => {
                write_basic(writer, &spi_params.encode(false), 0)?;
            }
            Command::SpiAttachStub { spi_params } => {
                write_basic(writer, &spi_params.encode(true), 0)?;
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&new_baud.to_le_bytes());
                data[4..].copy_from_slice(&prior_baud.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::FlashMd5 { offset, size } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct Md5Params {
                    offset: u32,
                    size: u32,
                    dummy1: u32,
                    dummy2: u32,
                }
                let params = Md5Params {
                    offset,
                    size,
                    dummy1: 0,
                    dummy2: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::EraseFlash | Command::FlashDetect => {
                write_basic(writer, &[], 0)?;
            }
        };
        Ok(())
    }
}

/// Write a data array and its checksum to a writer
fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

/// Write a Begin command to a writer
fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    let data = if !supports_encryption {
        // Neither the ESP32 nor the ESP8266 take the `encrypted` field
        &bytes[..bytes.len() - 4]
    } else {
        bytes
    };
    write_basic(writer, data, 0)
}

/// Write a Data command to a writer
fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode(command: Command) -> Vec<u8> {
        let mut buf = Vec::new();
        command.write(&mut buf).unwrap();
        buf
    }

    #[test]
    fn sync_packet_layout() {
        let packet = encode(Command::Sync);

        assert_eq!(&packet[..2], &[0x00, 0x08]);
        assert_eq!(&packet[2..4], &36u16.to_le_bytes());
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]);
        assert_eq!(&packet[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(packet[12..].iter().all(|b| *b == 0x55));
        assert_eq!(packet.len(), 8 + 36);
    }

    #[test]
    fn data_checksum_covers_padding() {
        let data = [0x01, 0x02, 0x03];
        let packet = encode(Command::MemData {
            data: &data,
            pad_to: 4,
            pad_byte: 0xFF,
            sequence: 7,
        });

        let expected = 0xEF ^ 0x01 ^ 0x02 ^ 0x03 ^ 0xFF;
        assert_eq!(&packet[4..8], &(expected as u32).to_le_bytes());
        // length covers the 16 byte block header and the padded data
        assert_eq!(&packet[2..4], &20u16.to_le_bytes());
        assert_eq!(&packet[8..12], &4u32.to_le_bytes());
        assert_eq!(&packet[12..16], &7u32.to_le_bytes());
        assert_eq!(&packet[24..], &[0x01, 0x02, 0x03, 0xFF]);
    }

    #[test]
    fn begin_without_encryption_drops_the_last_field() {
        let packet = encode(Command::FlashDeflBegin {
            size: 0x2000,
            blocks: 1,
            block_size: 0x4000,
            offset: 0x10000,
            supports_encryption: false,
        });

        assert_eq!(&packet[2..4], &16u16.to_le_bytes());
        assert_eq!(&packet[20..24], &0x10000u32.to_le_bytes());
    }

    #[test]
    fn change_baudrate_carries_both_rates() {
        let packet = encode(Command::ChangeBaudrate {
            new_baud: 460_800,
            prior_baud: 115_200,
        });

        assert_eq!(packet[1], 0x0F);
        assert_eq!(&packet[8..12], &460_800u32.to_le_bytes());
        assert_eq!(&packet[12..16], &115_200u32.to_le_bytes());
    }

    #[test]
    fn flash_end_encodes_reboot_inverted() {
        assert_eq!(encode(Command::FlashDeflEnd { reboot: true })[8], 0);
        assert_eq!(encode(Command::FlashDeflEnd { reboot: false })[8], 1);
    }

    #[test]
    fn write_timeouts_scale_with_size() {
        let four_mb = 4 * 1024 * 1024;

        assert_eq!(
            CommandType::FlashDeflBegin.timeout_for_size(1024),
            Duration::from_secs(10)
        );
        assert!(CommandType::FlashDeflData.timeout_for_size(four_mb) > Duration::from_secs(160));
        assert_eq!(
            CommandType::Sync.timeout_for_size(four_mb),
            Duration::from_millis(100)
        );
    }
}
