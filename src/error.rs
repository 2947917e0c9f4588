//! Library and application errors

use std::{
    array::TryFromSliceError,
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use slip_codec::SlipError;
use thiserror::Error;

use crate::{
    connection::command::CommandType,
    flasher::{FlashFrequency, FlashSize},
    targets::Chip,
};

/// All possible errors returned by wledflasher
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("The device did not accept a baud rate of {baud}")]
    #[diagnostic(
        code(wledflasher::baud_change),
        help("Lower the `--upload-baud-rate`, or use 115200")
    )]
    BaudChange {
        baud: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("No bootloader is available for a flash frequency of {frequency}")]
    #[diagnostic(
        code(wledflasher::bootloader_unavailable),
        help("ESP32 images must be built for a flash frequency of 40MHz or 80MHz")
    )]
    BootloaderUnavailable { frequency: FlashFrequency },

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(wledflasher::cancelled))]
    Cancelled,

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Failed to download '{asset}'")]
    #[diagnostic(code(wledflasher::download))]
    Download {
        asset: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to erase the flash")]
    #[diagnostic(
        code(wledflasher::erase),
        help("The flash contents are indeterminate, erase and flash the full image again")
    )]
    Erase(#[source] Box<Error>),

    #[error("No {0} file was given, the ESP32 needs one to boot")]
    #[diagnostic(
        code(wledflasher::companion_missing),
        help("Pass it with --bootloader, --partitions or --otadata, or set it in wledflasher.toml")
    )]
    CompanionFileMissing(&'static str),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(wledflasher::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("Flash chip not supported, unrecognized flash ID: {flash_id:#08x}")]
    #[diagnostic(
        code(wledflasher::flash_detect),
        help("Check the wiring of the flash chip, then hard-reset the device and try again")
    )]
    FlashDetect { flash_id: u32 },

    #[error("A flash segment was written before the flash write was started")]
    #[diagnostic(code(wledflasher::flash_not_started))]
    FlashNotStarted,

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The configuration file {0} is invalid: {1}")]
    #[diagnostic(code(wledflasher::invalid_config))]
    InvalidConfig(String, String),

    #[error("The firmware image is invalid: {0}")]
    #[diagnostic(
        code(wledflasher::invalid_image),
        help("Make sure the binary is an ESP8266/ESP32 application image (*.bin)")
    )]
    InvalidImage(String),

    #[error("Invalid response from the stub/ROM loader: {0}")]
    #[diagnostic(code(wledflasher::invalid_response))]
    InvalidResponse(String),

    #[error("The flasher stub for the {chip} is invalid: {reason}")]
    #[diagnostic(
        code(wledflasher::invalid_stub),
        help("Stub files are TOML documents with `entry`, `text`, `text_start`, `data` and `data_start` keys")
    )]
    InvalidStub { chip: Chip, reason: String },

    #[error("Found more than one serial port: {}", .0.join(", "))]
    #[diagnostic(
        code(wledflasher::multiple_serial_ports),
        help("Please choose one with the --port argument")
    )]
    MultipleSerialPorts(Vec<String>),

    #[error("No binary image to flash was given")]
    #[diagnostic(code(wledflasher::no_binary))]
    NoBinary,

    #[error("No serial port found")]
    #[diagnostic(
        code(wledflasher::no_serial),
        help("Make sure you have connected a device to the host system, or pass the port with --port")
    )]
    NoSerial,

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Segment at {offset:#x} ends at {end:#x}, past the end of the {flash_size} flash")]
    #[diagnostic(code(wledflasher::segment_out_of_bounds))]
    SegmentOutOfBounds {
        offset: u32,
        end: u32,
        flash_size: FlashSize,
    },

    #[error("Segment at {offset:#x} overlaps the segment at {previous:#x}")]
    #[diagnostic(code(wledflasher::segment_overlap))]
    SegmentOverlap { offset: u32, previous: u32 },

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(wledflasher::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("No flasher stub for the {chip} at {path}")]
    #[diagnostic(
        code(wledflasher::stub_not_found),
        help("Copy `esp32.toml` and `esp8266.toml` from espflash's `resources/stubs` \
              into that directory, or point --stub-dir at a directory holding them")
    )]
    StubNotFound { chip: Chip, path: String },

    #[error("Failed to start the flasher stub")]
    #[diagnostic(code(wledflasher::stub_upload))]
    StubUpload(#[source] Box<Error>),

    #[error("Unknown OUI selector {0:#04x} in the ESP8266 MAC address")]
    #[diagnostic(code(wledflasher::unknown_oui))]
    UnknownOui(u8),

    #[error("Unrecognized chip magic value: {0:#010x}")]
    #[diagnostic(
        code(wledflasher::unsupported_chip),
        help("Supported chips are: ESP32, ESP8266\n\
              If your chip is supported, try hard-resetting the device and try again")
    )]
    UnsupportedChip(u32),

    #[error("The flash frequency '{frequency}' is not supported by the {chip}")]
    #[diagnostic(code(wledflasher::unsupported_flash_frequency))]
    UnsupportedFlashFrequency {
        chip: Chip,
        frequency: FlashFrequency,
    },

    #[error("A flash size of {size} is not supported by the {chip}")]
    #[diagnostic(code(wledflasher::unsupported_flash_size))]
    UnsupportedFlashSize { chip: Chip, size: FlashSize },

    #[error("Verification of the flash contents at {offset:#x} failed")]
    #[diagnostic(code(wledflasher::verify_failed))]
    VerifyFailed { offset: u32 },

    #[error("Failed to write flash at {offset:#x}")]
    #[diagnostic(
        code(wledflasher::write),
        help("The flash contents are indeterminate, erase and flash the full image again")
    )]
    Write {
        offset: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attribute a failure to the flash segment starting at `offset`
    pub(crate) fn write_at(offset: u32, err: Error) -> Self {
        match err {
            err @ (Error::Write { .. } | Error::Cancelled) => err,
            err => Error::Write {
                offset,
                source: Box::new(err),
            },
        }
    }

    /// Whether the serial port went away underneath the operation
    pub fn is_port_closed(&self) -> bool {
        match self {
            Error::Connection(ConnectionError::PortClosed)
            | Error::Flashing(ConnectionError::PortClosed) => true,
            Error::BaudChange { source, .. }
            | Error::Erase(source)
            | Error::StubUpload(source)
            | Error::Write { source, .. } => source.is_port_closed(),
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

impl From<TryFromSliceError> for Error {
    fn from(err: TryFromSliceError) -> Self {
        Error::InvalidResponse(err.to_string())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(wledflasher::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(wledflasher::connection_failed),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(wledflasher::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    FramingError,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(wledflasher::stub_handshake))]
    InvalidStubHandshake,

    #[error("Download mode successfully detected, but getting no sync reply")]
    #[diagnostic(
        code(wledflasher::no_sync_reply),
        help("The serial TX path seems to be down")
    )]
    NoSyncReply,

    #[error("Received packet to large for buffer")]
    #[diagnostic(
        code(wledflasher::oversized_packet),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    OverSizedPacket,

    #[error("Serial port closed")]
    #[diagnostic(code(wledflasher::port_closed))]
    PortClosed,

    #[error("Failed to read the available bytes on the serial port. Available bytes: {0}, Read bytes: {1}")]
    #[diagnostic(code(wledflasher::read_mismatch))]
    ReadMismatch(u32, u32),

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(wledflasher::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(wledflasher::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("ESP is not in flash boot mode ({0})! The chip needs to be in download mode.")]
    #[diagnostic(
        code(wledflasher::wrong_boot_mode),
        help("If the board has a BOOT/FLASH button, hold it while the device resets")
    )]
    WrongBootMode(String),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::FramingError,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::PortClosed,
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(wledflasher::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(wledflasher::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(wledflasher::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(wledflasher::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(wledflasher::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(wledflasher::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(wledflasher::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(wledflasher::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(wledflasher::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(wledflasher::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(wledflasher::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(wledflasher::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(wledflasher::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(wledflasher::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(wledflasher::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(wledflasher::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(wledflasher::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(wledflasher::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}

fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> ConnectionError
where
    E: Into<serialport::Error>,
{
    use io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset => ConnectionError::PortClosed,
        _ => ConnectionError::Serial(err.into()),
    }
}
