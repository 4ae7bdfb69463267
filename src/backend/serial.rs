//! RS-232 transport built on the `serialport` crate.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::debug;

use crate::backend::message::{not_connected, Transport};
use crate::error::{CommErrorKind, DaqError, DaqResult};

/// Serial line transport with configurable terminators.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    response_delimiter: u8,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open `port_name` (e.g. `/dev/ttyUSB0`, `COM3`) at `baud_rate`.
    pub fn open(port_name: &str, baud_rate: u32) -> DaqResult<Self> {
        let mut transport = Self {
            port_name: port_name.to_string(),
            baud_rate,
            timeout: Duration::from_millis(1000),
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            port: None,
        };
        transport.reopen()?;
        Ok(transport)
    }

    /// Read timeout of the port.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            let _ = port.set_timeout(timeout);
        }
        self
    }

    /// Appended to every command, and the byte ending a reply.
    pub fn with_terminators(mut self, line_terminator: &str, response_delimiter: u8) -> Self {
        self.line_terminator = line_terminator.to_string();
        self.response_delimiter = response_delimiter;
        self
    }

    fn port(&mut self) -> DaqResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(not_connected)
    }
}

fn io_error(err: std::io::Error) -> DaqError {
    let kind = match err.kind() {
        std::io::ErrorKind::TimedOut => CommErrorKind::Timeout,
        _ => CommErrorKind::Io,
    };
    DaqError::comm(kind, err.to_string())
}

impl Transport for SerialTransport {
    fn query(&mut self, command: &str) -> DaqResult<String> {
        self.write(command)?;
        let delimiter = self.response_delimiter;
        let port = self.port()?;
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            port.read_exact(&mut byte).map_err(io_error)?;
            if byte[0] == delimiter {
                break;
            }
            reply.push(byte[0]);
        }
        let reply = String::from_utf8_lossy(&reply).trim_end_matches('\r').to_string();
        debug!(port = %self.port_name, %command, %reply, "serial query");
        Ok(reply)
    }

    fn write(&mut self, command: &str) -> DaqResult<()> {
        let line = format!("{command}{}", self.line_terminator);
        let port = self.port()?;
        port.write_all(line.as_bytes()).map_err(io_error)?;
        port.flush().map_err(io_error)
    }

    fn reopen(&mut self) -> DaqResult<()> {
        self.port = None;
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| {
                DaqError::comm(
                    CommErrorKind::Io,
                    format!("failed to open serial port '{}': {e}", self.port_name),
                )
            })?;
        debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn clear(&mut self) -> DaqResult<()> {
        self.port()?
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| DaqError::comm(CommErrorKind::Io, e.to_string()))
    }

    fn close(&mut self) -> DaqResult<()> {
        self.port = None;
        Ok(())
    }
}
