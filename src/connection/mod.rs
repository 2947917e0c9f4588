//! Establish a connection with a target device
//!
//! The [Connection] struct abstracts over the serial connection and
//! sending/decoding of commands, and provides higher-level operations with the
//! device.

use std::{
    io::{BufWriter, Read, Write},
    iter::zip,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;
use regex::Regex;
use serialport::{ClearBuffer, SerialPort};
use slip_codec::SlipDecoder;

use self::{
    command::{Command, CommandType},
    encoder::SlipEncoder,
    reset::{construct_reset_strategy_sequence, ResetStrategy},
};
use crate::error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind};

pub mod command;
pub mod reset;

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
const MAX_RESPONSE_READS: usize = 100;

/// How often a long running command looks at the cancellation flag
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout applied to every command without a specific one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[cfg(unix)]
pub type Port = serialport::TTYPort;
#[cfg(windows)]
pub type Port = serialport::COMPort;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandResponseValue {
    ValueU32(u32),
    ValueU128(u128),
}

impl TryInto<u32> for CommandResponseValue {
    type Error = Error;

    fn try_into(self) -> Result<u32, Self::Error> {
        match self {
            CommandResponseValue::ValueU32(value) => Ok(value),
            CommandResponseValue::ValueU128(_) => Err(Error::InvalidResponse(
                "expected a 32-bit value, received a digest".into(),
            )),
        }
    }
}

impl TryInto<u128> for CommandResponseValue {
    type Error = Error;

    fn try_into(self) -> Result<u128, Self::Error> {
        match self {
            CommandResponseValue::ValueU32(_) => Err(Error::InvalidResponse(
                "expected a digest, received a 32-bit value".into(),
            )),
            CommandResponseValue::ValueU128(value) => Ok(value),
        }
    }
}

/// A response from a target device following a command
#[derive(Debug, Copy, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: CommandResponseValue,
    /// Non-zero when the command failed
    pub status: u8,
    /// Reason for the failure, see [RomErrorKind]
    pub error: u8,
}

impl CommandResponse {
    /// Decode a response packet with its SLIP framing already removed
    ///
    /// The packet carries no indication of how many status bytes follow the
    /// data, so the known response sizes decide: the ESP8266 ROM and the stub
    /// send two status bytes, the ESP32 ROM sends four. MD5 answers are 32
    /// ASCII hex characters from the ROM and 16 raw bytes from the stub.
    pub fn parse(response: &[u8]) -> Result<Self, Error> {
        if response.len() < 10 {
            return Err(Error::InvalidResponse(format!(
                "expected response of at least 10 bytes, received {} bytes",
                response.len()
            )));
        }

        let status_len = match response.len() {
            10 | 26 | 42 => 2,
            _ => 4,
        };

        let value = match response.len() {
            42 | 44 => {
                let digest = std::str::from_utf8(&response[8..][..32])
                    .map_err(|e| Error::InvalidResponse(e.to_string()))?;
                let digest = u128::from_str_radix(digest, 16)
                    .map_err(|e| Error::InvalidResponse(e.to_string()))?;

                CommandResponseValue::ValueU128(digest)
            }
            26 => CommandResponseValue::ValueU128(u128::from_be_bytes(
                response[8..][..16].try_into()?,
            )),
            _ => CommandResponseValue::ValueU32(u32::from_le_bytes(response[4..][..4].try_into()?)),
        };

        Ok(CommandResponse {
            resp: response[0],
            return_op: response[1],
            return_length: u16::from_le_bytes(response[2..][..2].try_into()?),
            value,
            status: response[response.len() - status_len],
            error: response[response.len() - status_len + 1],
        })
    }
}

/// An established connection with a target device
pub struct Connection {
    serial: Port,
    decoder: SlipDecoder,
    cancel: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(serial: Port) -> Self {
        Connection {
            serial,
            decoder: SlipDecoder::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Give up with [Error::Cancelled] at the next check once `flag` is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Reset the device into its ROM bootloader and synchronize with it
    pub fn begin(&mut self) -> Result<(), Error> {
        let reset_sequence = construct_reset_strategy_sequence();

        for (_, reset_strategy) in zip(0..MAX_CONNECT_ATTEMPTS, reset_sequence.iter().cycle()) {
            self.check_cancelled()?;

            match self.connect_attempt(reset_strategy.as_ref()) {
                Ok(_) => {
                    return Ok(());
                }
                Err(e @ (Error::Connection(ConnectionError::PortClosed) | Error::Cancelled)) => {
                    return Err(e)
                }
                Err(e) => {
                    debug!("Failed to reset, error {:#?}, retrying", e);
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Try to connect to a device
    fn connect_attempt(&mut self, reset_strategy: &dyn ResetStrategy) -> Result<(), Error> {
        reset_strategy.reset(&mut self.serial)?;

        let available_bytes = self.serial.bytes_to_read()?;
        let mut buff = vec![0; available_bytes as usize];
        let read_bytes = if available_bytes > 0 {
            self.serial.read(&mut buff)? as u32
        } else {
            0
        };

        if read_bytes != available_bytes {
            return Err(Error::Connection(ConnectionError::ReadMismatch(
                available_bytes,
                read_bytes,
            )));
        }

        let boot_log = String::from_utf8_lossy(&buff[..read_bytes as usize]);
        let boot_mode = parse_boot_mode(&boot_log);
        if let Some((mode, download)) = &boot_mode {
            debug!("Boot Mode: {}", mode);
            debug!("Download Mode: {}", download);
        }

        for _ in 0..MAX_SYNC_ATTEMPTS {
            self.check_cancelled()?;
            self.flush()?;

            match self.sync() {
                Ok(()) => return Ok(()),
                Err(e @ Error::Connection(ConnectionError::PortClosed)) => return Err(e),
                Err(_) => continue,
            }
        }

        match boot_mode {
            Some((_, true)) => Err(Error::Connection(ConnectionError::NoSyncReply)),
            Some((mode, false)) => Err(Error::Connection(ConnectionError::WrongBootMode(mode))),
            None => Err(Error::Connection(ConnectionError::ConnectionFailed)),
        }
    }

    /// Try to sync with the device for a given timeout
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.write_command(Command::Sync)?;
            connection.flush()?;

            sleep(Duration::from_millis(10));

            // The ROM answers a SYNC with a burst of identical responses
            for _ in 0..MAX_CONNECT_ATTEMPTS {
                match connection.read_response()? {
                    Some(response) if response.return_op == CommandType::Sync as u8 => {
                        if response.status != 0 {
                            connection.flush().ok();
                            return Err(Error::RomError(RomError::new(
                                CommandType::Sync,
                                RomErrorKind::from(response.error),
                            )));
                        }
                    }
                    _ => {
                        return Err(Error::RomError(RomError::new(
                            CommandType::Sync,
                            RomErrorKind::InvalidMessage,
                        )))
                    }
                }
            }

            Ok(())
        })
    }

    /// Pulse the enable line so the device boots its application
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        reset::hard_reset(&mut self.serial)
    }

    /// Set timeout for the serial port
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }

    /// Set baud rate for the serial port
    pub fn set_baud(&mut self, speed: u32) -> Result<(), Error> {
        self.serial.set_baud_rate(speed)?;

        Ok(())
    }

    /// Get the current baud rate of the serial port
    pub fn baud(&self) -> Result<u32, Error> {
        Ok(self.serial.baud_rate()?)
    }

    /// Run a command with a timeout defined by the command type
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.serial.timeout();
        self.serial.set_timeout(timeout)?;

        let result = f(self);

        self.serial.set_timeout(old_timeout)?;

        result
    }

    /// Read the response from a serial port
    pub fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        match self.read(10)? {
            None => Ok(None),
            Some(response) => CommandResponse::parse(&response).map(Some),
        }
    }

    /// Write a command to the serial port
    pub fn write_command(&mut self, command: Command) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        self.serial.clear(ClearBuffer::Input)?;
        let mut writer = BufWriter::new(&mut self.serial);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    /// Write a command and read the response
    pub fn command(&mut self, command: Command) -> Result<CommandResponseValue, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        for _ in 0..MAX_RESPONSE_READS {
            match self.read_response().for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return self.response_value(ty, response);
                }
                _ => continue,
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Write a command and wait up to `timeout` for its response
    ///
    /// The wait is split into short reads so a cancellation is noticed while
    /// the device is still busy, e.g. erasing the whole flash.
    pub fn command_cancellable(
        &mut self,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandResponseValue, Error> {
        let ty = command.command_type();
        let deadline = Instant::now() + timeout;
        self.write_command(command).for_command(ty)?;

        self.with_timeout(CANCEL_POLL_INTERVAL, |connection| loop {
            connection.check_cancelled()?;

            let response = match connection.read_response() {
                Err(Error::Connection(ConnectionError::Timeout(_))) => None,
                other => other.for_command(ty)?,
            };

            match response {
                Some(response) if response.return_op == ty as u8 => {
                    return connection.response_value(ty, response);
                }
                _ if Instant::now() >= deadline => {
                    return Err(Error::Connection(ConnectionError::Timeout(ty.into())));
                }
                _ => {}
            }
        })
    }

    fn response_value(
        &mut self,
        ty: CommandType,
        response: CommandResponse,
    ) -> Result<CommandResponseValue, Error> {
        if response.status != 0 {
            let _error = self.flush();
            Err(Error::RomError(RomError::new(
                ty,
                RomErrorKind::from(response.error),
            )))
        } else {
            Ok(response.value)
        }
    }

    /// Read a register command with a timeout
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })
        })?
        .try_into()
    }

    /// Write a register command with a timeout
    pub fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address: addr,
                value,
                mask,
            })
        })?;

        Ok(())
    }

    /// Read one SLIP-framed packet of at least `len` bytes
    pub(crate) fn read(&mut self, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let mut tmp = Vec::with_capacity(1024);
        loop {
            self.decoder.decode(&mut self.serial, &mut tmp)?;
            if tmp.len() >= len {
                return Ok(Some(tmp));
            }
        }
    }

    /// Flush the serial port
    pub fn flush(&mut self) -> Result<(), Error> {
        self.serial.flush()?;
        Ok(())
    }

    /// Discard anything the device sent that has not been read yet
    pub fn clear_input(&mut self) -> Result<(), Error> {
        self.serial.clear(ClearBuffer::Input)?;
        Ok(())
    }

    /// Give up the protocol layer and hand back the raw serial port
    pub fn into_serial(self) -> Port {
        self.serial
    }
}

/// Look for the ROM's boot banner in the output captured after a reset
///
/// Returns the boot mode and whether the ROM reported that it is waiting for
/// a download.
fn parse_boot_mode(boot_log: &str) -> Option<(String, bool)> {
    let pattern = Regex::new(r"boot:(0x[0-9a-fA-F]+)(.*waiting for download)?").ok()?;
    let captures = pattern.captures(boot_log)?;

    let mode = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    Some((mode.to_string(), captures.get(2).is_some()))
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }

}
