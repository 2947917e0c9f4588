//! Reset strategies driving the DTR/RTS lines of a USB-to-serial bridge
//!
//! On common development boards DTR is wired to GPIO0 and RTS to the enable
//! pin, so toggling them in the right order resets the chip into its ROM
//! download mode.

#[cfg(unix)]
use std::{io, os::unix::io::AsRawFd};
use std::{thread::sleep, time::Duration};

use log::debug;
use serialport::SerialPort;

use crate::{connection::Port, error::Error};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms

/// Some strategy for resetting a target device into download mode
pub trait ResetStrategy {
    fn reset(&self, serial_port: &mut Port) -> Result<(), Error>;

    fn set_dtr(&self, serial_port: &mut Port, level: bool) -> Result<(), Error> {
        serial_port.write_data_terminal_ready(level)?;

        Ok(())
    }

    fn set_rts(&self, serial_port: &mut Port, level: bool) -> Result<(), Error> {
        serial_port.write_request_to_send(level)?;

        Ok(())
    }

    #[cfg(unix)]
    fn set_dtr_rts(
        &self,
        serial_port: &mut Port,
        dtr_level: bool,
        rts_level: bool,
    ) -> Result<(), Error> {
        let fd = serial_port.as_raw_fd();
        let mut status = tiocmget(fd)?;

        if dtr_level {
            status |= libc::TIOCM_DTR
        } else {
            status &= !libc::TIOCM_DTR
        }

        if rts_level {
            status |= libc::TIOCM_RTS
        } else {
            status &= !libc::TIOCM_RTS
        }

        tiocmset(fd, status)?;

        Ok(())
    }
}

/// Classic reset sequence, sets DTR and RTS sequentially.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, serial_port: &mut Port) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        self.set_dtr(serial_port, false)?; // IO0 = HIGH
        self.set_rts(serial_port, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_dtr(serial_port, true)?; // IO0 = LOW
        self.set_rts(serial_port, false)?; // EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        self.set_dtr(serial_port, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// UNIX-only reset sequence which sets the DTR and RTS lines at the same time.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct UnixTightReset {
    delay: u64,
}

#[cfg(unix)]
impl UnixTightReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

#[cfg(unix)]
impl ResetStrategy for UnixTightReset {
    fn reset(&self, serial_port: &mut Port) -> Result<(), Error> {
        debug!(
            "Using UnixTight reset strategy with delay of {}ms",
            self.delay
        );

        self.set_dtr_rts(serial_port, false, false)?;
        self.set_dtr_rts(serial_port, true, true)?;
        self.set_dtr_rts(serial_port, false, true)?; // IO = HIGH, EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_dtr_rts(serial_port, true, false)?; // IO0 = LOW, EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        self.set_dtr_rts(serial_port, false, false)?; // IO0 = HIGH, done
        self.set_dtr(serial_port, false)?; // Needed in some environments to ensure IO0 = HIGH

        Ok(())
    }
}

/// Construct the sequence of reset strategies to cycle through while
/// connecting.
pub fn construct_reset_strategy_sequence() -> Vec<Box<dyn ResetStrategy>> {
    let mut sequence: Vec<Box<dyn ResetStrategy>> = Vec::with_capacity(4);

    #[cfg(unix)]
    {
        sequence.push(Box::new(UnixTightReset::new(false)));
        sequence.push(Box::new(UnixTightReset::new(true)));
    }

    sequence.push(Box::new(ClassicReset::new(false)));
    sequence.push(Box::new(ClassicReset::new(true)));

    sequence
}

/// Pulse the enable line so the chip boots the freshly written application
pub fn hard_reset(serial_port: &mut Port) -> Result<(), Error> {
    debug!("Hard resetting the device");

    serial_port.write_request_to_send(true)?;
    sleep(Duration::from_millis(100));
    serial_port.write_request_to_send(false)?;

    Ok(())
}

/// Get the status of modem bits
#[cfg(unix)]
fn tiocmget(fd: libc::c_int) -> io::Result<libc::c_int> {
    let mut bits: libc::c_int = 0;

    // SAFETY: `fd` is an open tty owned by the serial port and `bits` outlives
    // the call.
    match unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut bits) } {
        0 => Ok(bits),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Set the status of modem bits
#[cfg(unix)]
fn tiocmset(fd: libc::c_int, bits: libc::c_int) -> io::Result<()> {
    // SAFETY: see `tiocmget`
    match unsafe { libc::ioctl(fd, libc::TIOCMSET, &bits) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}
