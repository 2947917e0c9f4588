//! Talk to the ROM bootloader and the flasher stub of a target device
//!
//! The [ChipClient] and [Connector] traits are the seam between the flashing
//! session and the device. [Flasher] and [SerialConnector] implement them over
//! a serial port.

use std::{
    io::Read,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread::sleep,
    time::Duration,
};

use log::{debug, info};
use serialport::{ClearBuffer, FlowControl, SerialPort};
use strum::{Display, FromRepr};

use self::{deflate::DeflateWriter, stubs::RAM_BLOCK_SIZE};
pub use self::stubs::FlashStub;
use crate::{
    connection::{
        command::{Command, CommandType},
        Connection, Port, DEFAULT_TIMEOUT,
    },
    error::{ConnectionError, Error, ResultExt as _},
    flasher::stubs::{CHIP_DETECT_MAGIC_REG_ADDR, EXPECTED_STUB_HANDSHAKE},
    image_format::Segment,
    serial::PortCandidate,
    targets::{Chip, ChipInfo},
};

mod deflate;
pub(crate) mod stubs;

/// List of SPI parameters to try while detecting flash size
pub(crate) const TRY_SPI_PARAMS: [SpiAttachParams; 2] =
    [SpiAttachParams::default(), SpiAttachParams::esp32_pico_d4()];

/// Baud rate the ROM bootloader talks at, and the one logs are read at
pub const DEFAULT_BAUD: u32 = 115_200;

/// Read timeout of the serial port while streaming logs
const LOG_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Supported flash frequencies
///
/// Note that not all frequencies are supported by each target device.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashFrequency {
    /// 20 MHz
    #[strum(serialize = "20MHz")]
    _20Mhz,
    /// 26 MHz
    #[strum(serialize = "26MHz")]
    _26Mhz,
    /// 40 MHz
    #[default]
    #[strum(serialize = "40MHz")]
    _40Mhz,
    /// 80 MHz
    #[strum(serialize = "80MHz")]
    _80Mhz,
}

impl FlashFrequency {
    /// Decode the low nibble of an image's flash configuration byte
    pub fn from_header_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(FlashFrequency::_40Mhz),
            0x1 => Some(FlashFrequency::_26Mhz),
            0x2 => Some(FlashFrequency::_20Mhz),
            0xf => Some(FlashFrequency::_80Mhz),
            _ => None,
        }
    }

    /// Encodes flash frequency into the format used by the bootloader.
    pub fn encode_flash_frequency(self: FlashFrequency, chip: Chip) -> Result<u8, Error> {
        let encodings = chip.into_target().flash_frequency_encodings();
        if let Some(&f) = encodings.get(&self) {
            Ok(f)
        } else {
            Err(Error::UnsupportedFlashFrequency {
                chip,
                frequency: self,
            })
        }
    }

    /// Short form used in bootloader file names, e.g. `40m`
    pub fn file_suffix(&self) -> &'static str {
        match self {
            FlashFrequency::_20Mhz => "20m",
            FlashFrequency::_26Mhz => "26m",
            FlashFrequency::_40Mhz => "40m",
            FlashFrequency::_80Mhz => "80m",
        }
    }
}

/// Supported flash modes
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, FromRepr)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

/// Supported flash sizes
///
/// Note that not all sizes are supported by each target device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Display)]
#[non_exhaustive]
#[repr(u8)]
#[doc(alias("esp_image_flash_size_t"))]
pub enum FlashSize {
    /// 256 KB
    #[strum(serialize = "256KB")]
    _256Kb,
    /// 512 KB
    #[strum(serialize = "512KB")]
    _512Kb,
    /// 1 MB
    #[strum(serialize = "1MB")]
    _1Mb,
    /// 2 MB
    #[strum(serialize = "2MB")]
    _2Mb,
    /// 4 MB
    #[default]
    #[strum(serialize = "4MB")]
    _4Mb,
    /// 8 MB
    #[strum(serialize = "8MB")]
    _8Mb,
    /// 16 MB
    #[strum(serialize = "16MB")]
    _16Mb,
    /// 32 MB
    #[strum(serialize = "32MB")]
    _32Mb,
    /// 64 MB
    #[strum(serialize = "64MB")]
    _64Mb,
    /// 128 MB
    #[strum(serialize = "128MB")]
    _128Mb,
}

impl FlashSize {
    /// Encodes flash size into the header nibble used by the chip's bootloader
    pub fn encode_flash_size(self: FlashSize, chip: Chip) -> Result<u8, Error> {
        let encodings = chip.into_target().flash_size_encodings();
        if let Some(&s) = encodings.get(&self) {
            Ok(s)
        } else {
            Err(Error::UnsupportedFlashSize { chip, size: self })
        }
    }

    /// Create a [FlashSize] from the size byte of a JEDEC flash ID
    ///
    /// [source](https://github.com/espressif/esptool/blob/f4d2510/esptool/cmds.py#L42)
    pub const fn from_detected(value: u8) -> Option<FlashSize> {
        match value {
            0x12 | 0x32 => Some(FlashSize::_256Kb),
            0x13 | 0x33 => Some(FlashSize::_512Kb),
            0x14 | 0x34 => Some(FlashSize::_1Mb),
            0x15 | 0x35 => Some(FlashSize::_2Mb),
            0x16 | 0x36 => Some(FlashSize::_4Mb),
            0x17 | 0x37 => Some(FlashSize::_8Mb),
            0x18 | 0x38 => Some(FlashSize::_16Mb),
            0x19 | 0x39 => Some(FlashSize::_32Mb),
            0x20 | 0x1A | 0x3A => Some(FlashSize::_64Mb),
            0x21 | 0x1B => Some(FlashSize::_128Mb),
            _ => None,
        }
    }

    /// Returns the flash size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_256Kb => 0x0040000,
            FlashSize::_512Kb => 0x0080000,
            FlashSize::_1Mb => 0x0100000,
            FlashSize::_2Mb => 0x0200000,
            FlashSize::_4Mb => 0x0400000,
            FlashSize::_8Mb => 0x0800000,
            FlashSize::_16Mb => 0x1000000,
            FlashSize::_32Mb => 0x2000000,
            FlashSize::_64Mb => 0x4000000,
            FlashSize::_128Mb => 0x8000000,
        }
    }
}

/// Parameters of the attached SPI flash chip (sizes, etc).
///
/// See: <https://github.com/espressif/esptool/blob/da31d9d/esptool.py#L655>
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    pub const fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded: Vec<u8> = Vec::new();
        encoded.extend_from_slice(&self.fl_id.to_le_bytes());
        encoded.extend_from_slice(&self.total_size.to_le_bytes());
        encoded.extend_from_slice(&self.block_size.to_le_bytes());
        encoded.extend_from_slice(&self.sector_size.to_le_bytes());
        encoded.extend_from_slice(&self.page_size.to_le_bytes());
        encoded.extend_from_slice(&self.status_mask.to_le_bytes());
        encoded
    }
}

/// Parameters for attaching to a target devices SPI flash
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    // Default SPI parameters for ESP32-PICO-D4
    pub const fn esp32_pico_d4() -> Self {
        SpiAttachParams {
            clk: 6,
            q: 17,
            d: 8,
            hd: 11,
            cs: 16,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(self, stub: bool) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded: Vec<u8> = packed.to_le_bytes().to_vec();

        if !stub {
            encoded.append(&mut vec![0u8; 4]);
        }

        encoded
    }
}

/// Progress of a segment write, one update per acknowledged block
pub trait ProgressCallbacks {
    /// Writing `total` blocks at `addr` begins
    fn init(&mut self, addr: u32, total: usize);
    /// `current` blocks have been written
    fn update(&mut self, current: usize);
    fn finish(&mut self);
}

/// Operations a flashing session needs from a connected device
///
/// Every method maps to one step of the session; an implementation must leave
/// the device usable for the next step or fail.
pub trait ChipClient {
    /// The chip family the client talks to
    fn chip(&self) -> Chip;

    /// Read the chip's identity and capabilities
    fn read_chip_info(&mut self) -> Result<ChipInfo, Error>;

    /// Upload the flasher stub to RAM and switch to talking to it
    fn run_stub(&mut self) -> Result<(), Error>;

    /// Ask the device to switch to `baud`, then follow on the host side
    fn change_baud(&mut self, baud: u32) -> Result<(), Error>;

    /// Read the JEDEC ID of the attached SPI flash
    fn detect_flash_size(&mut self) -> Result<FlashSize, Error>;

    /// Tell the loader the geometry of the attached flash
    fn set_flash_parameters(&mut self, size: FlashSize) -> Result<(), Error>;

    /// Erase the whole flash chip
    fn erase_flash(&mut self) -> Result<(), Error>;

    /// Prepare for a sequence of [ChipClient::write_segment] calls
    fn begin_flash(&mut self, verify: bool) -> Result<(), Error>;

    /// Write one segment, acknowledging every block before sending the next
    fn write_segment(
        &mut self,
        segment: &Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error>;

    /// Complete the sequence started by [ChipClient::begin_flash]
    fn end_flash(&mut self) -> Result<(), Error>;

    /// Reset the device into the freshly written application
    fn hard_reset(&mut self) -> Result<(), Error>;

    /// Give up the protocol and read the device's output at `baud`
    fn into_log_stream(self, baud: u32) -> Result<Box<dyn Read + Send>, Error>
    where
        Self: Sized;
}

/// Opens connections to devices
pub trait Connector {
    type Client: ChipClient;

    /// Serial ports a device may be attached to
    fn available_ports(&self) -> Result<Vec<PortCandidate>, Error>;

    /// Reset the device on `port` into its bootloader and identify it
    ///
    /// A forced `chip` skips probing the chip family.
    fn connect(&mut self, port: &str, chip: Option<Chip>) -> Result<Self::Client, Error>;

    /// Open `port` at `baud` for reading the device's output only
    fn open_monitor(&mut self, port: &str, baud: u32) -> Result<Box<dyn Read + Send>, Error>;
}

/// Connect to and flash a target device
pub struct Flasher {
    /// Connection for flash operations
    connection: Connection,
    /// Chip ID
    chip: Chip,
    /// Configuration for SPI attached flash (0 to use fused values)
    spi_params: SpiAttachParams,
    /// Indicate RAM stub loader is in use
    use_stub: bool,
    /// Directory holding the stub loaders
    stub_dir: PathBuf,
    /// Write in progress, see [ChipClient::begin_flash]
    writer: Option<DeflateWriter>,
}

impl Flasher {
    /// Reset the device into its bootloader and identify the chip
    ///
    /// The serial port's baud rate must be 115_200 to connect. Once `cancel`
    /// is set, the connect attempts, the erase and the block writes stop with
    /// [Error::Cancelled].
    pub fn connect(
        serial: Port,
        chip: Option<Chip>,
        stub_dir: PathBuf,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(serial).with_cancel(cancel);
        connection.begin()?;
        connection.set_timeout(DEFAULT_TIMEOUT)?;

        let chip = match chip {
            Some(chip) => {
                debug!("Skipping chip detection, using {}", chip);
                chip
            }
            None => detect_chip(&mut connection)?,
        };

        Ok(Flasher {
            connection,
            chip,
            spi_params: SpiAttachParams::default(),
            use_stub: false,
            stub_dir,
            writer: None,
        })
    }

    /// The active serial connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    fn load_stub(&mut self) -> Result<(), Error> {
        debug!("Loading flash stub for chip: {:?}", self.chip);

        let stub = FlashStub::load(self.chip, &self.stub_dir)?;
        let (text_addr, text) = stub.text()?;
        let (data_addr, data) = stub.data()?;

        debug!("Write {} byte stub text", text.len());
        self.write_ram(text_addr, &text).flashing()?;

        debug!("Write {} byte stub data", data.len());
        self.write_ram(data_addr, &data).flashing()?;

        let entry = stub.entry();
        debug!("Starting the stub at {:#x}", entry);
        self.connection
            .with_timeout(CommandType::MemEnd.timeout(), |connection| {
                connection.command(Command::MemEnd {
                    no_entry: entry == 0,
                    entry,
                })
            })
            .flashing()?;

        match self.connection.read(EXPECTED_STUB_HANDSHAKE.len())? {
            Some(resp) if resp == EXPECTED_STUB_HANDSHAKE.as_bytes() => Ok(()),
            _ => Err(Error::Connection(ConnectionError::InvalidStubHandshake)),
        }?;

        debug!("Stub written!");

        Ok(())
    }

    /// Copy `data` into the device's RAM at `addr`
    fn write_ram(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let blocks = data.len().div_ceil(RAM_BLOCK_SIZE);

        self.connection.command(Command::MemBegin {
            size: data.len() as u32,
            blocks: blocks as u32,
            block_size: RAM_BLOCK_SIZE as u32,
            offset: addr,
            supports_encryption: false,
        })?;

        for (sequence, block) in data.chunks(RAM_BLOCK_SIZE).enumerate() {
            self.connection.command(Command::MemData {
                data: block,
                pad_to: 4,
                pad_byte: 0,
                sequence: sequence as u32,
            })?;
        }

        Ok(())
    }

    fn enable_flash(&mut self, spi_params: SpiAttachParams) -> Result<(), Error> {
        let use_stub = self.use_stub;
        self.connection
            .with_timeout(CommandType::SpiAttach.timeout(), |connection| {
                connection.command(if use_stub {
                    Command::SpiAttachStub { spi_params }
                } else {
                    Command::SpiAttach { spi_params }
                })
            })?;

        Ok(())
    }

    /// Read the flash ID, `None` when the flash did not answer
    fn flash_detect(&mut self) -> Result<Option<(u32, Option<FlashSize>)>, Error> {
        const FLASH_RETRY: u8 = 0xFF;

        let flash_id = self.spi_command(CommandType::FlashDetect, &[], 24)?;
        let size_id = (flash_id >> 16) as u8;

        // This value indicates that an alternate detection method should be tried.
        if size_id == FLASH_RETRY {
            return Ok(None);
        }

        Ok(Some((flash_id, FlashSize::from_detected(size_id))))
    }

    fn spi_command(
        &mut self,
        command: CommandType,
        data: &[u8],
        read_bits: u32,
    ) -> Result<u32, Error> {
        debug_assert!(read_bits < 32);
        debug_assert!(data.len() < 64);

        let spi_registers = self.chip.into_target().spi_registers();

        let old_spi_usr = self.connection.read_reg(spi_registers.usr())?;
        let old_spi_usr2 = self.connection.read_reg(spi_registers.usr2())?;

        let mut flags = 1 << 31;
        if !data.is_empty() {
            flags |= 1 << 27;
        }
        if read_bits > 0 {
            flags |= 1 << 28;
        }

        self.connection
            .write_reg(spi_registers.usr(), flags, None)?;
        self.connection
            .write_reg(spi_registers.usr2(), (7 << 28) | command as u32, None)?;

        if let (Some(mosi_data_length), Some(miso_data_length)) =
            (spi_registers.mosi_length(), spi_registers.miso_length())
        {
            if !data.is_empty() {
                self.connection
                    .write_reg(mosi_data_length, data.len() as u32 * 8 - 1, None)?;
            }
            if read_bits > 0 {
                self.connection
                    .write_reg(miso_data_length, read_bits - 1, None)?;
            }
        } else {
            let mosi_mask = if data.is_empty() {
                0
            } else {
                data.len() as u32 * 8 - 1
            };
            let miso_mask = if read_bits == 0 { 0 } else { read_bits - 1 };
            self.connection.write_reg(
                spi_registers.usr1(),
                (miso_mask << 8) | (mosi_mask << 17),
                None,
            )?;
        }

        if data.is_empty() {
            self.connection.write_reg(spi_registers.w0(), 0, None)?;
        } else {
            for (i, bytes) in data.chunks(4).enumerate() {
                let mut data_bytes = [0; 4];
                data_bytes[0..bytes.len()].copy_from_slice(bytes);
                let data = u32::from_le_bytes(data_bytes);
                self.connection
                    .write_reg(spi_registers.w0() + 4 * i as u32, data, None)?;
            }
        }

        self.connection
            .write_reg(spi_registers.cmd(), 1 << 18, None)?;

        let mut i = 0;
        loop {
            sleep(Duration::from_millis(1));
            if self.connection.read_reg(spi_registers.usr())? & (1 << 18) == 0 {
                break;
            }
            i += 1;
            if i > 10 {
                return Err(Error::Connection(ConnectionError::Timeout(command.into())));
            }
        }

        let result = self.connection.read_reg(spi_registers.w0())?;
        self.connection
            .write_reg(spi_registers.usr(), old_spi_usr, None)?;
        self.connection
            .write_reg(spi_registers.usr2(), old_spi_usr2, None)?;

        Ok(result)
    }
}

impl ChipClient for Flasher {
    fn chip(&self) -> Chip {
        self.chip
    }

    fn read_chip_info(&mut self) -> Result<ChipInfo, Error> {
        self.chip.into_target().chip_info(&mut self.connection)
    }

    fn run_stub(&mut self) -> Result<(), Error> {
        if self.use_stub {
            return Ok(());
        }

        self.load_stub()
            .map_err(|e| Error::StubUpload(Box::new(e)))?;
        self.use_stub = true;
        info!("Using flash stub");

        Ok(())
    }

    fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        debug!("Change baud to: {}", baud);

        let prior_baud = match self.use_stub {
            true => self.connection.baud()?,
            false => 0,
        };

        let result = self
            .connection
            .with_timeout(CommandType::ChangeBaudrate.timeout(), |connection| {
                connection.command(Command::ChangeBaudrate {
                    new_baud: baud,
                    prior_baud,
                })
            })
            .and_then(|_| self.connection.set_baud(baud));

        result.map_err(|e| Error::BaudChange {
            baud,
            source: Box::new(e),
        })?;

        // get rid of anything sent while the rates did not match
        sleep(Duration::from_millis(50));
        self.connection.flush()?;
        self.connection.clear_input()?;

        Ok(())
    }

    fn detect_flash_size(&mut self) -> Result<FlashSize, Error> {
        let needs_attach = self.chip.into_target().needs_spi_attach();
        let mut flash_id = 0xFFFF_FFFF;

        // Loop over all available SPI parameters until we find one that successfully
        // reads the flash size.
        for spi_params in TRY_SPI_PARAMS.iter().copied() {
            if needs_attach {
                debug!("Attempting flash enable with: {:?}", spi_params);

                // in some instances this command may fail while the flash
                // connection succeeds
                if let Err(e) = self.enable_flash(spi_params) {
                    debug!("Flash enable failed: {}", e);
                }
            }

            match self.flash_detect()? {
                Some((id, Some(flash_size))) => {
                    debug!("Flash detect OK, ID {:#08x}", id);
                    self.spi_params = spi_params;

                    return Ok(flash_size);
                }
                Some((id, None)) => {
                    flash_id = id;
                    break;
                }
                None => debug!("Flash detect failed"),
            }

            if !needs_attach {
                break;
            }
        }

        debug!("SPI flash autodetection failed");

        Err(Error::FlashDetect { flash_id })
    }

    fn set_flash_parameters(&mut self, size: FlashSize) -> Result<(), Error> {
        let spi_params = SpiSetParams::default(size.size());

        self.connection
            .with_timeout(CommandType::SpiSetParams.timeout(), |connection| {
                connection.command(Command::SpiSetParams { spi_params })
            })?;

        Ok(())
    }

    fn erase_flash(&mut self) -> Result<(), Error> {
        debug!("Erasing the entire flash");

        self.connection
            .command_cancellable(Command::EraseFlash, CommandType::EraseFlash.timeout())
            .flashing()?;
        sleep(Duration::from_millis(50));
        self.connection.flush()?;

        Ok(())
    }

    fn begin_flash(&mut self, verify: bool) -> Result<(), Error> {
        let mut writer = DeflateWriter::new(self.chip, self.spi_params, self.use_stub, verify);
        writer.begin(&mut self.connection).flashing()?;
        self.writer = Some(writer);

        Ok(())
    }

    fn write_segment(
        &mut self,
        segment: &Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let writer = self.writer.as_mut().ok_or(Error::FlashNotStarted)?;

        writer
            .write_segment(&mut self.connection, segment, progress)
            .flashing()
    }

    fn end_flash(&mut self) -> Result<(), Error> {
        let mut writer = self.writer.take().ok_or(Error::FlashNotStarted)?;

        writer.finish(&mut self.connection).flashing()
    }

    fn hard_reset(&mut self) -> Result<(), Error> {
        self.connection.hard_reset()
    }

    fn into_log_stream(self, baud: u32) -> Result<Box<dyn Read + Send>, Error> {
        let mut serial = self.connection.into_serial();
        serial.set_baud_rate(baud)?;
        serial.set_timeout(LOG_READ_TIMEOUT)?;

        sleep(Duration::from_millis(50));
        serial.clear(ClearBuffer::Input)?;

        Ok(Box::new(serial))
    }
}

/// Read the magic register to tell the supported chips apart
pub fn detect_chip(connection: &mut Connection) -> Result<Chip, Error> {
    let magic = connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
    debug!("Read chip magic value: 0x{:08x}", magic);

    Chip::from_magic(magic)
}

/// Opens serial ports and hands out [Flasher]s
#[derive(Debug, Clone)]
pub struct SerialConnector {
    stub_dir: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl SerialConnector {
    pub fn new(stub_dir: impl Into<PathBuf>) -> Self {
        SerialConnector {
            stub_dir: stub_dir.into(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hand `flag` to every [Flasher] so long operations can be interrupted
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }
}

impl Connector for SerialConnector {
    type Client = Flasher;

    fn available_ports(&self) -> Result<Vec<PortCandidate>, Error> {
        crate::serial::available_ports()
    }

    fn connect(&mut self, port: &str, chip: Option<Chip>) -> Result<Flasher, Error> {
        let serial = open_port(port, DEFAULT_BAUD, DEFAULT_TIMEOUT)?;

        Flasher::connect(serial, chip, self.stub_dir.clone(), self.cancel.clone())
    }

    fn open_monitor(&mut self, port: &str, baud: u32) -> Result<Box<dyn Read + Send>, Error> {
        let serial = open_port(port, baud, LOG_READ_TIMEOUT)?;

        Ok(Box::new(serial))
    }
}

fn open_port(name: &str, baud: u32, timeout: Duration) -> Result<Port, Error> {
    debug!("Opening serial port {} at {} baud", name, baud);

    serialport::new(name, baud)
        .flow_control(FlowControl::None)
        .timeout(timeout)
        .open_native()
        .map_err(|e| match ConnectionError::from(e) {
            ConnectionError::DeviceNotFound => Error::SerialNotFound(name.to_owned()),
            e => Error::Connection(e),
        })
}
