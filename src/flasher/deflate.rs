use std::io::Write;

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use log::debug;
use md5::{Digest, Md5};

use super::{
    stubs::{FLASH_SECTOR_SIZE, FLASH_WRITE_SIZE, STUB_FLASH_WRITE_SIZE},
    ProgressCallbacks, SpiAttachParams,
};
use crate::{
    connection::{
        command::{Command, CommandType},
        Connection,
    },
    error::Error,
    image_format::Segment,
    targets::Chip,
};

/// Writes segments to flash as zlib-compressed blocks
///
/// Every block is acknowledged by the device before the next one is sent,
/// and a pending cancellation stops the write between two blocks.
pub(crate) struct DeflateWriter {
    chip: Chip,
    spi_attach_params: SpiAttachParams,
    use_stub: bool,
    verify: bool,
    need_deflate_end: bool,
}

impl DeflateWriter {
    pub fn new(chip: Chip, spi_attach_params: SpiAttachParams, use_stub: bool, verify: bool) -> Self {
        DeflateWriter {
            chip,
            spi_attach_params,
            use_stub,
            verify,
            need_deflate_end: false,
        }
    }

    fn flash_write_size(&self) -> usize {
        if self.use_stub {
            STUB_FLASH_WRITE_SIZE
        } else {
            FLASH_WRITE_SIZE
        }
    }

    /// Attach the SPI flash where the loader does not do it by itself
    pub fn begin(&mut self, connection: &mut Connection) -> Result<(), Error> {
        if !self.chip.into_target().needs_spi_attach() {
            return Ok(());
        }

        connection.with_timeout(CommandType::SpiAttach.timeout(), |connection| {
            let command = if self.use_stub {
                Command::SpiAttachStub {
                    spi_params: self.spi_attach_params,
                }
            } else {
                Command::SpiAttach {
                    spi_params: self.spi_attach_params,
                }
            };

            connection.command(command)
        })?;

        Ok(())
    }

    pub fn write_segment(
        &mut self,
        connection: &mut Connection,
        segment: &Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let addr = segment.addr;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&segment.data)?;
        let compressed = encoder.finish()?;

        let flash_write_size = self.flash_write_size();
        let block_count = compressed.len().div_ceil(flash_write_size);
        let erase_count = segment.data.len().div_ceil(FLASH_SECTOR_SIZE);

        // round up to sector size
        let erase_size = (erase_count * FLASH_SECTOR_SIZE) as u32;

        debug!(
            "Writing {} bytes ({} compressed) at {:#x} in {} blocks",
            segment.data.len(),
            compressed.len(),
            addr,
            block_count
        );

        connection.with_timeout(
            CommandType::FlashDeflBegin.timeout_for_size(erase_size),
            |connection| {
                connection.command(Command::FlashDeflBegin {
                    size: segment.data.len() as u32,
                    blocks: block_count as u32,
                    block_size: flash_write_size as u32,
                    offset: addr,
                    supports_encryption: false,
                })?;
                Ok(())
            },
        )?;
        self.need_deflate_end = true;

        let chunks = compressed.chunks(flash_write_size);
        let num_chunks = chunks.len();

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, num_chunks)
        }

        // decode the chunks to see how much data the device will have to save
        let mut decoder = ZlibDecoder::new(Vec::new());
        let mut decoded_size = 0;

        for (i, block) in chunks.enumerate() {
            connection.check_cancelled()?;

            decoder.write_all(block)?;
            decoder.flush()?;
            let size = decoder.get_ref().len() - decoded_size;
            decoded_size = decoder.get_ref().len();

            connection.with_timeout(
                CommandType::FlashDeflData.timeout_for_size(size as u32),
                |connection| {
                    connection.command(Command::FlashDeflData {
                        sequence: i as u32,
                        pad_to: 0,
                        pad_byte: 0xff,
                        data: block,
                    })?;
                    Ok(())
                },
            )?;

            if let Some(cb) = progress.as_mut() {
                cb.update(i + 1)
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        if self.verify {
            let checksum_md5 = Md5::digest(&segment.data);
            let flash_checksum_md5: u128 =
                connection.with_timeout(CommandType::FlashMd5.timeout(), |connection| {
                    connection
                        .command(Command::FlashMd5 {
                            offset: addr,
                            size: segment.data.len() as u32,
                        })?
                        .try_into()
                })?;

            if checksum_md5.as_slice() != flash_checksum_md5.to_be_bytes() {
                return Err(Error::VerifyFailed { offset: addr });
            }
            debug!("Segment at {:#x} verified", addr);
        }

        Ok(())
    }

    /// End the compressed write, leaving the device in the loader
    pub fn finish(&mut self, connection: &mut Connection) -> Result<(), Error> {
        if self.need_deflate_end {
            connection.with_timeout(CommandType::FlashDeflEnd.timeout(), |connection| {
                connection.command(Command::FlashDeflEnd { reboot: false })
            })?;
            self.need_deflate_end = false;
        }

        Ok(())
    }
}
