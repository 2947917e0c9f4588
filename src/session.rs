//! Sequence a complete flashing session
//!
//! A [FlashSession] walks through the [SessionState]s in order, reporting
//! every transition to an [Observer]. Any failure ends the session in
//! [SessionState::Failed]; the only retry is the [BaudFallback].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};

use crate::{
    error::Error,
    flash_data::{
        check_inputs, configure_flash_parameters, CompanionFiles, Firmware, FlashParameters,
    },
    flasher::{ChipClient, Connector, FlashSize, ProgressCallbacks, DEFAULT_BAUD},
    monitor::LogStreamer,
    serial::{select_port, SelectedPort},
    targets::{Chip, ChipInfo},
    writer,
};

/// Baud rate used for uploading unless configured otherwise
pub const DEFAULT_UPLOAD_BAUD: u32 = 460_800;

/// Steps of a session, in the order they are reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PortSelected,
    ChipDetected,
    InfoRead,
    StubRunning,
    BaudNegotiated,
    FlashSizeKnown,
    ParametersConfigured,
    Erased,
    Written,
    Reset,
    LoggingStreamed,
    Done,
    /// Terminal, with the reason the session stopped
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "Failed({reason})"),
            state => fmt::Debug::fmt(state, f),
        }
    }
}

/// Receives everything a session has to tell
///
/// All methods but [Observer::state_changed] default to doing nothing.
pub trait Observer {
    /// Called once the session has reached `state`
    fn state_changed(&mut self, state: &SessionState);

    fn port_selected(&mut self, _port: &SelectedPort) {}

    fn chip_info(&mut self, _info: &ChipInfo) {}

    /// The device rejected `rejected`, the session continues at `fallback`
    fn baud_fallback(&mut self, _rejected: u32, _fallback: u32) {}

    fn flash_size(&mut self, _size: FlashSize) {}

    fn flash_parameters(&mut self, _params: &FlashParameters) {}

    /// A full erase is about to start
    fn erase_started(&mut self) {}

    /// Writing a segment of `blocks` blocks at `addr` started
    fn segment_started(&mut self, _addr: u32, _blocks: usize) {}

    fn segment_progress(&mut self, _block: usize) {}

    fn segment_finished(&mut self) {}

    /// The device is about to be reset into its application
    fn reset_started(&mut self) {}

    /// The log stream is open, lines follow
    fn log_stream_opened(&mut self) {}

    fn log_line(&mut self, _line: &str) {}
}

/// Forwards block progress to an [Observer]
struct ObserverProgress<'a>(&'a mut dyn Observer);

impl ProgressCallbacks for ObserverProgress<'_> {
    fn init(&mut self, addr: u32, total: usize) {
        self.0.segment_started(addr, total)
    }

    fn update(&mut self, current: usize) {
        self.0.segment_progress(current)
    }

    fn finish(&mut self) {
        self.0.segment_finished()
    }
}

/// What to do when the device does not take the upload baud rate
///
/// After each failed attempt the connection is recreated at the ROM's rate,
/// since the device may be left at either rate. Once `max_attempts` are used
/// up the session continues at `fallback_baud`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaudFallback {
    pub max_attempts: u32,
    pub fallback_baud: u32,
}

impl Default for BaudFallback {
    fn default() -> Self {
        BaudFallback {
            max_attempts: 1,
            fallback_baud: DEFAULT_BAUD,
        }
    }
}

impl BaudFallback {
    /// Whether `baud` differs from the rate a fresh connection runs at
    pub fn needs_change(&self, baud: u32) -> bool {
        baud != DEFAULT_BAUD
    }
}

/// Everything a session needs to know up front
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serial port, auto-detected when `None`
    pub port: Option<String>,
    /// Skip chip detection and assume this family
    pub chip: Option<Chip>,
    pub upload_baud: u32,
    /// Baud rate of the device's log output
    pub log_baud: u32,
    /// Erase the whole flash before writing
    pub erase: bool,
    /// Compare the MD5 digest of every written segment
    pub verify: bool,
    pub firmware: Firmware,
    pub companions: CompanionFiles,
    pub baud_fallback: BaudFallback,
}

impl SessionConfig {
    pub fn new(firmware: Firmware) -> Self {
        SessionConfig {
            port: None,
            chip: None,
            upload_baud: DEFAULT_UPLOAD_BAUD,
            log_baud: DEFAULT_BAUD,
            erase: true,
            verify: false,
            firmware,
            companions: CompanionFiles::default(),
            baud_fallback: BaudFallback::default(),
        }
    }
}

/// One flashing session against one device
pub struct FlashSession<'a, C: Connector> {
    connector: &'a mut C,
    observer: &'a mut dyn Observer,
    cancel: Arc<AtomicBool>,
    state: SessionState,
}

impl<'a, C: Connector> FlashSession<'a, C> {
    pub fn new(connector: &'a mut C, observer: &'a mut dyn Observer) -> Self {
        FlashSession {
            connector,
            observer,
            cancel: Arc::new(AtomicBool::new(false)),
            state: SessionState::Idle,
        }
    }

    /// Stop the session with [Error::Cancelled] once `flag` is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Flash the configured firmware, then stream the device's logs
    pub fn run(&mut self, config: &SessionConfig) -> Result<(), Error> {
        let result = self.flash(config);
        self.finish(result)
    }

    /// Only stream the logs of the device on `port`
    pub fn monitor(&mut self, port: Option<&str>, baud: u32) -> Result<(), Error> {
        let result = self.stream_logs_only(port, baud);
        self.finish(result)
    }

    fn finish(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        if let Err(e) = &result {
            debug!("Session failed: {:?}", e);
            self.state = SessionState::Failed(e.to_string());
            self.observer.state_changed(&self.state);
        }

        result
    }

    fn flash(&mut self, config: &SessionConfig) -> Result<(), Error> {
        check_inputs(config.chip, &config.firmware, &config.companions)?;

        let port = self.select_port(config.port.as_deref())?;

        let mut client = self.connector.connect(port.name(), config.chip)?;
        info!("Connected to {}", client.chip());
        self.advance(SessionState::ChipDetected)?;

        let chip_info = client.read_chip_info()?;
        self.observer.chip_info(&chip_info);
        self.advance(SessionState::InfoRead)?;

        client.run_stub()?;
        self.advance(SessionState::StubRunning)?;

        let (mut client, flash_size) = self.negotiate_baud(client, port.name(), config)?;
        self.observer.flash_size(flash_size);
        self.advance(SessionState::FlashSizeKnown)?;

        let params = configure_flash_parameters(
            &chip_info,
            flash_size,
            &config.firmware,
            &config.companions,
        )?;
        self.observer.flash_parameters(&params);
        client.set_flash_parameters(flash_size)?;
        self.advance(SessionState::ParametersConfigured)?;

        if config.erase {
            self.observer.erase_started();
            writer::erase(&mut client)?;
            self.advance(SessionState::Erased)?;
        }

        {
            let mut progress = ObserverProgress(&mut *self.observer);
            let mut progress: Option<&mut dyn ProgressCallbacks> = Some(&mut progress);
            writer::write(
                &mut client,
                &params,
                config.verify,
                &mut progress,
                &self.cancel,
            )?;
        }
        self.advance(SessionState::Written)?;

        self.observer.reset_started();
        writer::hard_reset(&mut client)?;
        self.advance(SessionState::Reset)?;

        let stream = client.into_log_stream(config.log_baud)?;
        self.stream_logs(stream)
    }

    fn stream_logs_only(&mut self, port: Option<&str>, baud: u32) -> Result<(), Error> {
        let port = self.select_port(port)?;
        let stream = self.connector.open_monitor(port.name(), baud)?;

        self.stream_logs(stream)
    }

    fn stream_logs(&mut self, stream: Box<dyn std::io::Read + Send>) -> Result<(), Error> {
        self.observer.log_stream_opened();

        let observer = &mut *self.observer;
        LogStreamer::new(stream)
            .with_cancel(self.cancel.clone())
            .run(|line| observer.log_line(&line))?;

        self.advance(SessionState::LoggingStreamed)?;
        self.advance(SessionState::Done)
    }

    fn select_port(&mut self, requested: Option<&str>) -> Result<SelectedPort, Error> {
        self.check_cancelled()?;

        let candidates = match requested {
            Some(_) => Vec::new(),
            None => self.connector.available_ports()?,
        };
        let port = select_port(requested, &candidates)?;

        self.observer.port_selected(&port);
        self.advance(SessionState::PortSelected)?;

        Ok(port)
    }

    /// Switch to the upload baud rate and read the flash size at it
    ///
    /// Reading the flash size proves the new rate works. When it does not,
    /// the connection is recreated and the session goes on at the fallback
    /// rate.
    fn negotiate_baud(
        &mut self,
        mut client: C::Client,
        port: &str,
        config: &SessionConfig,
    ) -> Result<(C::Client, FlashSize), Error> {
        let policy = config.baud_fallback;
        let baud = config.upload_baud;

        if policy.needs_change(baud) {
            for attempt in 1..=policy.max_attempts {
                let result = client
                    .change_baud(baud)
                    .and_then(|()| client.detect_flash_size());

                match result {
                    Ok(size) => {
                        self.advance(SessionState::BaudNegotiated)?;
                        return Ok((client, size));
                    }
                    Err(e @ Error::Cancelled) => return Err(e),
                    Err(e) if e.is_port_closed() => return Err(e),
                    Err(e) => {
                        warn!("Attempt {} at {} baud failed: {}", attempt, baud, e);
                        if attempt == policy.max_attempts {
                            self.observer.baud_fallback(baud, policy.fallback_baud);
                        }

                        // the old connection must release the port first
                        drop(client);
                        self.check_cancelled()?;
                        client = self.connector.connect(port, config.chip)?;
                        client.run_stub()?;
                        if policy.fallback_baud != DEFAULT_BAUD {
                            client.change_baud(policy.fallback_baud)?;
                        }
                    }
                }
            }
        }

        let size = client.detect_flash_size()?;

        Ok((client, size))
    }

    fn advance(&mut self, state: SessionState) -> Result<(), Error> {
        debug!("Session state: {}", state);
        self.state = state;
        self.observer.state_changed(&self.state);

        self.check_cancelled()
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run one flashing session from start to finish
pub fn run_session<C: Connector>(
    connector: &mut C,
    config: &SessionConfig,
    observer: &mut dyn Observer,
    cancel: Arc<AtomicBool>,
) -> Result<(), Error> {
    FlashSession::new(connector, observer)
        .with_cancel(cancel)
        .run(config)
}

/// Stream the logs of the device on `port`, or the only port present
pub fn run_monitor<C: Connector>(
    connector: &mut C,
    port: Option<&str>,
    baud: u32,
    observer: &mut dyn Observer,
    cancel: Arc<AtomicBool>,
) -> Result<(), Error> {
    FlashSession::new(connector, observer)
        .with_cancel(cancel)
        .monitor(port, baud)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fallback_policy_defaults() {
        let policy = BaudFallback::default();

        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.fallback_baud, 115_200);
        assert!(policy.needs_change(460_800));
        assert!(!policy.needs_change(115_200));
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Done.is_terminal());
        assert!(SessionState::Failed("boom".into()).is_terminal());
        assert!(!SessionState::Written.is_terminal());
        assert_eq!(SessionState::FlashSizeKnown.to_string(), "FlashSizeKnown");
        assert_eq!(
            SessionState::Failed("No serial port found".into()).to_string(),
            "Failed(No serial port found)"
        );
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::new(Firmware::from_bytes("app.bin", vec![0xE9]));

        assert_eq!(config.upload_baud, 460_800);
        assert_eq!(config.log_baud, 115_200);
        assert!(config.erase);
        assert!(!config.verify);
    }
}
