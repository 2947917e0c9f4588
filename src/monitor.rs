//! Stream a device's log output line by line
//!
//! Lines are split on `\n`, every `\r` is dropped and bytes that are not
//! valid UTF-8 become U+FFFD. ANSI color sequences are passed through.

use std::{
    io::{ErrorKind, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{Local, NaiveTime};
use log::debug;

use crate::Error;

const READ_BUFFER_SIZE: usize = 1024;

/// Prefix `raw` with a `[HH:MM:SS] ` timestamp, dropping line endings
pub fn format_line(raw: &[u8], time: NaiveTime) -> String {
    let text = String::from_utf8_lossy(raw);
    let line = text.replace(['\r', '\n'], "");

    format!("{} {}", time.format("[%H:%M:%S]"), line)
}

/// Reads a serial stream until the port goes away
pub struct LogStreamer<R> {
    reader: R,
    pending: Vec<u8>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<R: Read> LogStreamer<R> {
    pub fn new(reader: R) -> Self {
        LogStreamer {
            reader,
            pending: Vec::new(),
            cancel: None,
        }
    }

    /// Stop with [Error::Cancelled] once `flag` is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Emit every complete line until the port is closed
    ///
    /// Read timeouts are not an error; end of stream and any other I/O
    /// failure mean the port was closed and end the stream cleanly.
    pub fn run(&mut self, mut emit: impl FnMut(String)) -> Result<(), Error> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            if self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
            {
                return Err(Error::Cancelled);
            }

            match self.reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => self.feed(&buffer[..count], &mut emit),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    debug!("Serial port read failed: {}", e);
                    break;
                }
            }
        }

        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            emit(format_line(&rest, Local::now().time()));
        }

        Ok(())
    }

    fn feed(&mut self, data: &[u8], emit: &mut impl FnMut(String)) {
        self.pending.extend_from_slice(data);

        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.drain(..=end).collect::<Vec<_>>();
            emit(format_line(&line, Local::now().time()));
        }
    }
}
