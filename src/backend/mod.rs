//! Communication backends.
//!
//! The driver runtime never talks to hardware itself: features and actions
//! call into a [`Backend`], which formats commands and performs the I/O.
//! Backends also decide which failures are transient ([`Backend::retries_exceptions`])
//! and know how to reopen a dropped connection.

/// Line oriented command/reply backend.
pub mod message;
/// Scripted backend for tests.
pub mod mock;
/// Serial port transport.
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use message::{MessageBackend, Transport};
pub use mock::MockBackend;

use std::collections::BTreeMap;

use crate::error::{CommErrorKind, DaqError, DaqResult};
use crate::features::Feature;
use crate::value::Value;

/// Named command arguments (channel ids) passed to the backend.
pub type CommandKwargs = BTreeMap<String, Value>;

const DEFAULT_RETRYABLE: &[CommErrorKind] = &[CommErrorKind::Timeout, CommErrorKind::Io];

/// Collaborator performing the instrument I/O for a driver.
pub trait Backend: Send + Sync {
    /// Query the raw value of a feature.
    fn default_get_feature(
        &self,
        feat: &Feature,
        cmd: &str,
        args: &[Value],
        kwargs: &CommandKwargs,
    ) -> DaqResult<Value>;

    /// Send a new value; returns the instrument response, if any.
    fn default_set_feature(
        &self,
        feat: &Feature,
        cmd: &str,
        args: &[Value],
        kwargs: &CommandKwargs,
    ) -> DaqResult<Value>;

    /// Check that the last set succeeded. Returns `(success, detail)`.
    fn default_check_operation(
        &self,
        _feat: &Feature,
        _value: &Value,
        _i_value: &Value,
        _response: &Value,
    ) -> DaqResult<(bool, String)> {
        Ok((true, String::new()))
    }

    /// Close and reestablish the connection.
    fn reopen_connection(&self) -> DaqResult<()>;

    /// Communication failures worth retrying.
    fn retries_exceptions(&self) -> &[CommErrorKind] {
        DEFAULT_RETRYABLE
    }

    /// Raw query used by action implementations.
    fn query(&self, cmd: &str) -> DaqResult<String> {
        Err(DaqError::Instrument(format!(
            "backend does not support raw queries ({cmd})"
        )))
    }

    /// Raw write used by action implementations.
    fn write(&self, cmd: &str) -> DaqResult<()> {
        Err(DaqError::Instrument(format!(
            "backend does not support raw writes ({cmd})"
        )))
    }

    fn initialize(&self) -> DaqResult<()> {
        Ok(())
    }

    fn finalize(&self) -> DaqResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}
