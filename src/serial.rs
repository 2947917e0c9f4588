//! Locate the serial port a device is attached to

use std::fmt;

use log::debug;
use serialport::{SerialPortInfo, SerialPortType};

use crate::Error;

/// A serial port a device may be attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub description: Option<String>,
}

impl PortCandidate {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        PortCandidate {
            name: name.into(),
            description,
        }
    }
}

impl fmt::Display for PortCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} ({})", self.name, description),
            None => write!(f, "{} (n/a)", self.name),
        }
    }
}

impl From<SerialPortInfo> for PortCandidate {
    fn from(info: SerialPortInfo) -> Self {
        let description = match info.port_type {
            SerialPortType::UsbPort(usb) => usb
                .product
                .or(usb.manufacturer)
                .or_else(|| Some(format!("USB {:04x}:{:04x}", usb.vid, usb.pid))),
            _ => None,
        };

        PortCandidate {
            name: info.port_name,
            description,
        }
    }
}

/// The port a session will use, and how it was chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedPort {
    /// Named on the command line or in the configuration file
    Requested(String),
    /// The only candidate present
    AutoDetected(String),
}

impl SelectedPort {
    pub fn name(&self) -> &str {
        match self {
            SelectedPort::Requested(name) | SelectedPort::AutoDetected(name) => name,
        }
    }
}

impl fmt::Display for SelectedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectedPort::Requested(name) => write!(f, "Using '{}' as serial port.", name),
            SelectedPort::AutoDetected(name) => write!(f, "Auto-detected serial port: {}", name),
        }
    }
}

/// USB serial ports, and ports whose type cannot be determined
pub fn available_ports() -> Result<Vec<PortCandidate>, Error> {
    let ports = serialport::available_ports()?
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .map(PortCandidate::from)
        .collect::<Vec<_>>();

    debug!("Found {} candidate serial port(s)", ports.len());

    Ok(ports)
}

/// Pick the port to use
///
/// A requested port is used as given, even when it is not among the
/// candidates. Otherwise exactly one candidate must be present.
pub fn select_port(
    requested: Option<&str>,
    candidates: &[PortCandidate],
) -> Result<SelectedPort, Error> {
    if let Some(name) = requested {
        return Ok(SelectedPort::Requested(name.to_owned()));
    }

    match candidates {
        [] => Err(Error::NoSerial),
        [port] => Ok(SelectedPort::AutoDetected(port.name.clone())),
        ports => Err(Error::MultipleSerialPorts(
            ports.iter().map(ToString::to_string).collect(),
        )),
    }
}
