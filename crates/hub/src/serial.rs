//! Serial link to the controller.
//!
//! [`ConnectionManager`] owns the one transport handle. Opening, recovering,
//! sending and reading all happen under the same mutex so a command write can
//! never interleave with a reconnect. Failures never escape as errors: the
//! link flips to `Faulted`, callers get `false`/`ReadOutcome::Faulted`, and
//! the next use tries to open it again.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SerialConfig;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Byte-level access to an open port.
pub trait SerialTransport: Send {
    /// Bytes already received and waiting to be read.
    fn bytes_to_read(&mut self) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Finds and opens the controller's port. Returns the port name with the
/// handle so the manager can log what it is talking to.
pub trait PortOpener: Send + Sync {
    fn open(&self) -> Result<(String, Box<dyn SerialTransport>)>;
}

// ---------------------------------------------------------------------------
// Link state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Closed,
    Open,
    Faulted,
}

#[derive(Debug)]
pub enum ReadOutcome {
    /// Whatever was waiting; empty when the line was quiet.
    Data(Vec<u8>),
    NotOpen,
    Faulted(io::Error),
}

struct Link {
    state: LinkState,
    port: Option<Box<dyn SerialTransport>>,
    port_name: Option<String>,
}

impl Link {
    fn fault(&mut self) {
        self.state = LinkState::Faulted;
        self.port = None;
    }
}

pub struct ConnectionManager {
    opener: Box<dyn PortOpener>,
    link: Mutex<Link>,
    max_read: usize,
}

impl ConnectionManager {
    pub fn new(opener: impl PortOpener + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            link: Mutex::new(Link {
                state: LinkState::Closed,
                port: None,
                port_name: None,
            }),
            max_read: 4096,
        }
    }

    // A panic while holding the lock can only leave a half-updated `Link`,
    // which the state machine already treats as recoverable.
    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    /// Name of the most recently opened port, if any.
    pub fn port_name(&self) -> Option<String> {
        self.lock().port_name.clone()
    }

    /// Open the link if needed. No-op when already open; a faulted link is
    /// reset to closed and reopened.
    pub fn ensure_open(&self) -> bool {
        let mut link = self.lock();
        self.open_locked(&mut link)
    }

    fn open_locked(&self, link: &mut Link) -> bool {
        match link.state {
            LinkState::Open => return true,
            LinkState::Faulted => {
                debug!("resetting faulted serial link");
                link.state = LinkState::Closed;
            }
            LinkState::Closed => {}
        }

        match self.opener.open() {
            Ok((name, port)) => {
                info!(port = %name, "serial port opened");
                link.port = Some(port);
                link.port_name = Some(name);
                link.state = LinkState::Open;
                true
            }
            Err(e) => {
                warn!("serial open failed: {e:#}");
                false
            }
        }
    }

    /// Write `command` plus a newline and flush. `false` means the command
    /// may or may not have reached the controller.
    pub fn send(&self, command: &str) -> bool {
        let mut link = self.lock();
        if !self.open_locked(&mut link) {
            return false;
        }

        let line = format!("{}\n", command.trim());
        let result = match link.port.as_mut() {
            Some(port) => port
                .write_all(line.as_bytes())
                .and_then(|()| port.flush()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no port handle")),
        };

        match result {
            Ok(()) => {
                debug!(command = command.trim(), "command sent");
                true
            }
            Err(e) => {
                warn!(command = command.trim(), "serial write failed: {e}");
                link.fault();
                false
            }
        }
    }

    /// Drain bytes that have already arrived. Never waits for more.
    pub fn read_available(&self) -> ReadOutcome {
        let mut link = self.lock();
        if link.state != LinkState::Open {
            return ReadOutcome::NotOpen;
        }

        let max_read = self.max_read;
        let result = match link.port.as_mut() {
            Some(port) => drain(port.as_mut(), max_read),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no port handle")),
        };

        match result {
            Ok(bytes) => ReadOutcome::Data(bytes),
            Err(e) => {
                link.fault();
                ReadOutcome::Faulted(e)
            }
        }
    }
}

fn drain(port: &mut dyn SerialTransport, max_read: usize) -> io::Result<Vec<u8>> {
    let waiting = port.bytes_to_read()?;
    if waiting == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; waiting.min(max_read)];
    let n = port.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Native ports (serialport crate)
// ---------------------------------------------------------------------------

struct NativePort(Box<dyn serialport::SerialPort>);

impl SerialTransport for NativePort {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.0.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.0, bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.0)
    }
}

/// Opens the configured port, or discovers one when none is configured.
pub struct SerialPortOpener {
    config: SerialConfig,
}

impl SerialPortOpener {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    fn resolve_port(&self) -> Result<String> {
        if let Some(port) = &self.config.port {
            return Ok(port.clone());
        }
        if !self.config.auto_detect {
            bail!("no serial port configured and auto_detect is off");
        }

        let ports = serialport::available_ports().context("failed to enumerate serial ports")?;
        let candidates: Vec<PortCandidate> = ports.iter().map(PortCandidate::from).collect();
        debug!(count = candidates.len(), "enumerated serial ports");
        select_port(&candidates)
            .ok_or_else(|| anyhow!("no controller port found among {} port(s)", candidates.len()))
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self) -> Result<(String, Box<dyn SerialTransport>)> {
        let name = self.resolve_port()?;
        let mut builder = serialport::new(&name, self.config.baud_rate)
            .timeout(Duration::from_millis(self.config.read_timeout_ms));
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let port = builder
            .open()
            .with_context(|| format!("failed to open serial port {name}"))?;
        Ok((name, Box::new(NativePort(port))))
    }
}

// ---------------------------------------------------------------------------
// Port discovery
// ---------------------------------------------------------------------------

/// Description fragments of the USB-UART bridges the controller boards use.
const CONTROLLER_HINTS: &[&str] = &["USB", "Serial", "CP210", "CH340", "Silicon Labs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortCandidate {
    pub(crate) name: String,
    pub(crate) description: String,
}

impl PortCandidate {
    fn looks_like_controller(&self) -> bool {
        CONTROLLER_HINTS
            .iter()
            .any(|hint| self.description.contains(hint))
    }
}

impl From<&SerialPortInfo> for PortCandidate {
    fn from(info: &SerialPortInfo) -> Self {
        let description = match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                let mut parts = vec!["USB".to_string()];
                parts.extend(usb.manufacturer.clone());
                parts.extend(usb.product.clone());
                parts.join(" ")
            }
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::Unknown => String::new(),
        };
        Self {
            name: info.port_name.clone(),
            description,
        }
    }
}

/// Pick the controller's port without prompting. Likely bridges win; among
/// several the first is used. With no likely bridge a lone port is still
/// taken, otherwise nothing is.
pub(crate) fn select_port(candidates: &[PortCandidate]) -> Option<String> {
    let likely: Vec<&PortCandidate> = candidates
        .iter()
        .filter(|c| c.looks_like_controller())
        .collect();

    match likely.as_slice() {
        [only] => Some(only.name.clone()),
        [first, ..] => {
            warn!(
                port = %first.name,
                candidates = likely.len(),
                "several controller-like ports found; using the first"
            );
            Some(first.name.clone())
        }
        [] => match candidates {
            [only] => Some(only.name.clone()),
            _ => None,
        },
    }
}

// ---------------------------------------------------------------------------
// In-memory controller for tests
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
