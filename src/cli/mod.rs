//! Command-line interface
//!
//! No stability guaranties apply

use std::{
    error::Error as _,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use log::debug;

use self::{config::Config, progress::ConsoleObserver};
use crate::{
    flash_data::{CompanionFiles, Firmware},
    flasher::{SerialConnector, DEFAULT_BAUD},
    session::{run_monitor, run_session, SessionConfig, DEFAULT_UPLOAD_BAUD},
    targets::Chip,
    Error,
};

pub mod config;
pub mod progress;

const DEFAULT_BOOTLOADER_TEMPLATE: &str = "bootloader_$FLASH_MODE$_$FLASH_FREQ$.bin";
const DEFAULT_PARTITIONS: &str = "partitions.bin";
const DEFAULT_OTADATA: &str = "otadata.bin";

/// Flash firmware onto ESP8266 and ESP32 devices
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Select the USB/COM port for uploading
    #[arg(short = 'p', long, env = "WLEDFLASHER_PORT")]
    pub port: Option<String>,
    /// Skip chip detection, the device is an ESP8266
    #[arg(long, conflicts_with = "esp32")]
    pub esp8266: bool,
    /// Skip chip detection, the device is an ESP32
    #[arg(long)]
    pub esp32: bool,
    /// Baud rate to upload with (not for logging)
    #[arg(long, value_name = "BAUD")]
    pub upload_baud_rate: Option<u32>,
    /// (ESP32-only) The bootloader to flash, `$FLASH_MODE$` and `$FLASH_FREQ$`
    /// are replaced with the image's settings
    #[arg(long, value_name = "PATH")]
    pub bootloader: Option<String>,
    /// (ESP32-only) The partitions to flash
    #[arg(long, value_name = "PATH")]
    pub partitions: Option<PathBuf>,
    /// (ESP32-only) The otadata file to flash
    #[arg(long, value_name = "PATH")]
    pub otadata: Option<PathBuf>,
    /// Directory holding the flasher stubs, `esp32.toml` and `esp8266.toml`
    ///
    /// These are the RAM loader stubs published with esptool, in the TOML form
    /// espflash ships under `resources/stubs`. Defaults to `stubs` in the
    /// user's data directory.
    #[arg(long, value_name = "DIR")]
    pub stub_dir: Option<PathBuf>,
    /// Do not erase flash before flashing
    #[arg(long)]
    pub no_erase: bool,
    /// Verify the flash contents after writing
    #[arg(long)]
    pub verify: bool,
    /// Only show logs
    #[arg(long)]
    pub show_logs: bool,
    /// The binary image to flash
    #[arg(required_unless_present = "show_logs")]
    pub binary: Option<PathBuf>,
}

impl Cli {
    /// Chip family forced on the command line
    pub fn chip(&self) -> Option<Chip> {
        match (self.esp8266, self.esp32) {
            (true, _) => Some(Chip::Esp8266),
            (_, true) => Some(Chip::Esp32),
            _ => None,
        }
    }

    pub fn port<'a>(&'a self, config: &'a Config) -> Option<&'a str> {
        self.port
            .as_deref()
            .or(config.connection.serial.as_deref())
    }

    /// Merge the arguments with the configuration file and built-in defaults
    pub fn session_config(&self, config: &Config, firmware: Firmware) -> SessionConfig {
        let data_dir = config::default_data_dir().map(|dir| dir.join("esp32"));
        let in_data_dir = |name: &str| data_dir.as_ref().map(|dir| dir.join(name));

        let companions = CompanionFiles {
            bootloader: self
                .bootloader
                .clone()
                .or_else(|| config.flash.bootloader.clone())
                .or_else(|| {
                    in_data_dir(DEFAULT_BOOTLOADER_TEMPLATE).map(|p| p.display().to_string())
                }),
            partitions: self
                .partitions
                .clone()
                .or_else(|| config.flash.partitions.clone())
                .or_else(|| in_data_dir(DEFAULT_PARTITIONS)),
            otadata: self
                .otadata
                .clone()
                .or_else(|| config.flash.otadata.clone())
                .or_else(|| in_data_dir(DEFAULT_OTADATA)),
        };

        SessionConfig {
            port: self.port(config).map(str::to_owned),
            chip: self.chip(),
            upload_baud: self
                .upload_baud_rate
                .or(config.flash.upload_baud_rate)
                .unwrap_or(DEFAULT_UPLOAD_BAUD),
            erase: !self.no_erase,
            verify: self.verify,
            companions,
            ..SessionConfig::new(firmware)
        }
    }

    pub fn stub_dir(&self, config: &Config) -> PathBuf {
        self.stub_dir
            .clone()
            .or_else(|| config.flash.stub_dir.clone())
            .or_else(|| config::default_data_dir().map(|dir| dir.join("stubs")))
            .unwrap_or_else(|| PathBuf::from("stubs"))
    }
}

/// Run whatever the command line asks for against real serial ports
pub fn run(cli: Cli, config: Config, cancel: Arc<AtomicBool>) -> Result<(), Error> {
    let mut connector = SerialConnector::new(cli.stub_dir(&config)).with_cancel(cancel.clone());
    let mut observer = ConsoleObserver::new();

    if cli.show_logs {
        return run_monitor(
            &mut connector,
            cli.port(&config),
            DEFAULT_BAUD,
            &mut observer,
            cancel,
        );
    }

    let binary = cli.binary.as_deref().ok_or(Error::NoBinary)?;
    let firmware = Firmware::from_path(binary)?;
    let session_config = cli.session_config(&config, firmware);
    debug!("{:#?}", session_config);

    run_session(&mut connector, &session_config, &mut observer, cancel)
}

/// The error and its sources as a single line
pub fn format_error(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}
