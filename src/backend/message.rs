//! Backend for text based (SCPI like) instruments.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::{Backend, CommandKwargs};
use crate::checks::format_command;
use crate::error::{DaqError, DaqResult};
use crate::features::Feature;
use crate::value::Value;

/// Line oriented connection to an instrument.
pub trait Transport: Send {
    /// Write `command` and read one reply line.
    fn query(&mut self, command: &str) -> DaqResult<String>;

    fn write(&mut self, command: &str) -> DaqResult<()>;

    /// Drop and reopen the underlying connection.
    fn reopen(&mut self) -> DaqResult<()>;

    /// Device clear, if the transport supports one.
    fn clear(&mut self) -> DaqResult<()> {
        Ok(())
    }

    fn close(&mut self) -> DaqResult<()> {
        Ok(())
    }
}

/// Formats feature commands and exchanges them over a [`Transport`].
///
/// Positional `{}` placeholders receive the value being set, named ones such
/// as `{id}` the channel ids. With an error query configured (e.g.
/// `SYST:ERR?`), every set is followed by reading the instrument error queue.
pub struct MessageBackend<T: Transport> {
    transport: Mutex<T>,
    error_query: Option<String>,
    reopen_delay: Duration,
    connected: AtomicBool,
}

impl<T: Transport> MessageBackend<T> {
    /// Backend over `transport` with SCPI style defaults.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
            error_query: None,
            reopen_delay: Duration::ZERO,
            connected: AtomicBool::new(true),
        }
    }

    /// Query run after each set to read the instrument error queue.
    pub fn with_error_query(mut self, query: &str) -> Self {
        self.error_query = Some(query.to_string());
        self
    }

    /// Pause after reopening, letting the instrument finish its clear.
    pub fn with_reopen_delay(mut self, delay: Duration) -> Self {
        self.reopen_delay = delay;
        self
    }
}

/// `0,"No error"` style replies: a leading zero code means success.
fn parse_error_reply(reply: &str) -> (bool, String) {
    let reply = reply.trim();
    let code = reply.split(',').next().unwrap_or_default().trim();
    match code.parse::<i64>() {
        Ok(0) => (true, String::new()),
        _ => (false, reply.to_string()),
    }
}

impl<T: Transport> Backend for MessageBackend<T> {
    fn default_get_feature(
        &self,
        _feat: &Feature,
        cmd: &str,
        args: &[Value],
        kwargs: &CommandKwargs,
    ) -> DaqResult<Value> {
        let command = format_command(cmd, args, kwargs)?;
        let reply = self.transport.lock().query(&command)?;
        debug!(%command, %reply, "query");
        Ok(Value::Str(reply))
    }

    fn default_set_feature(
        &self,
        _feat: &Feature,
        cmd: &str,
        args: &[Value],
        kwargs: &CommandKwargs,
    ) -> DaqResult<Value> {
        let command = format_command(cmd, args, kwargs)?;
        self.transport.lock().write(&command)?;
        debug!(%command, "write");
        Ok(Value::Str(command))
    }

    fn default_check_operation(
        &self,
        _feat: &Feature,
        _value: &Value,
        _i_value: &Value,
        _response: &Value,
    ) -> DaqResult<(bool, String)> {
        match &self.error_query {
            Some(query) => {
                let reply = self.transport.lock().query(query)?;
                Ok(parse_error_reply(&reply))
            }
            None => Ok((true, String::new())),
        }
    }

    fn reopen_connection(&self) -> DaqResult<()> {
        let mut transport = self.transport.lock();
        transport.reopen()?;
        transport.clear()?;
        if !self.reopen_delay.is_zero() {
            thread::sleep(self.reopen_delay);
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("connection reopened");
        Ok(())
    }

    fn query(&self, cmd: &str) -> DaqResult<String> {
        self.transport.lock().query(cmd)
    }

    fn write(&self, cmd: &str) -> DaqResult<()> {
        self.transport.lock().write(cmd)
    }

    fn initialize(&self) -> DaqResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            self.transport.lock().reopen()?;
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn finalize(&self) -> DaqResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.transport.lock().close()?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl<T: Transport> std::fmt::Debug for MessageBackend<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBackend")
            .field("error_query", &self.error_query)
            .field("reopen_delay", &self.reopen_delay)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Error for transports asked to talk while closed.
pub fn not_connected() -> DaqError {
    DaqError::comm(
        crate::error::CommErrorKind::InvalidSession,
        "transport is not connected",
    )
}
