//! In-memory backend for tests.
//!
//! `MockBackend` records every command it receives, counts calls per
//! operation and can be scripted to fail a given number of times.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{Backend, CommandKwargs};
use crate::checks::format_command;
use crate::error::{CommErrorKind, DaqError, DaqResult};
use crate::features::Feature;
use crate::value::Value;

#[derive(Debug, Default)]
struct MockState {
    responses: HashMap<String, Value>,
    /// Last value written per feature name, served back when nothing is scripted.
    written: HashMap<String, Value>,
    commands: Vec<String>,
    get_calls: usize,
    set_calls: usize,
    reopen_calls: usize,
    check_calls: usize,
    failures: u32,
    failure_kind: Option<CommErrorKind>,
    check_failure: Option<String>,
}

/// Scriptable backend counting the calls it receives.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    finalized: AtomicBool,
}

impl MockBackend {
    /// Backend answering `Value::None` to every query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply returned for the formatted command `cmd`.
    pub fn with_response(self, cmd: &str, value: impl Into<Value>) -> Self {
        self.set_response(cmd, value);
        self
    }

    /// Set the reply for `cmd` after construction.
    pub fn set_response(&self, cmd: &str, value: impl Into<Value>) {
        self.state.lock().responses.insert(cmd.to_string(), value.into());
    }

    /// Fail the next `count` get/set/query calls with `kind`.
    pub fn fail_next(&self, count: u32, kind: CommErrorKind) {
        let mut state = self.state.lock();
        state.failures = count;
        state.failure_kind = Some(kind);
    }

    /// Fail every get/set/query call with `kind`.
    pub fn fail_always(&self, kind: CommErrorKind) {
        self.fail_next(u32::MAX, kind);
    }

    /// Make the post-set check report failure with `detail`.
    pub fn fail_check(&self, detail: &str) {
        self.state.lock().check_failure = Some(detail.to_string());
    }

    /// Number of get calls received.
    pub fn get_count(&self) -> usize {
        self.state.lock().get_calls
    }

    /// Number of set calls received.
    pub fn set_count(&self) -> usize {
        self.state.lock().set_calls
    }

    /// Number of reopened connections.
    pub fn reopen_count(&self) -> usize {
        self.state.lock().reopen_calls
    }

    /// Number of post-set checks run.
    pub fn check_count(&self) -> usize {
        self.state.lock().check_calls
    }

    /// Formatted commands, in the order they were received.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Zero every counter.
    pub fn reset_counts(&self) {
        let mut state = self.state.lock();
        state.get_calls = 0;
        state.set_calls = 0;
        state.reopen_calls = 0;
        state.check_calls = 0;
        state.commands.clear();
    }

    fn maybe_fail(state: &mut MockState, command: &str) -> DaqResult<()> {
        if state.failures == 0 {
            return Ok(());
        }
        if state.failures != u32::MAX {
            state.failures -= 1;
        }
        let kind = state.failure_kind.unwrap_or(CommErrorKind::Io);
        Err(DaqError::comm(kind, format!("scripted failure on '{command}'")))
    }
}

impl Backend for MockBackend {
    fn default_get_feature(
        &self,
        feat: &Feature,
        cmd: &str,
        args: &[Value],
        kwargs: &CommandKwargs,
    ) -> DaqResult<Value> {
        let command = format_command(cmd, args, kwargs)?;
        let mut state = self.state.lock();
        state.get_calls += 1;
        state.commands.push(command.clone());
        Self::maybe_fail(&mut state, &command)?;
        debug!(%command, "mock get");
        state
            .responses
            .get(&command)
            .or_else(|| state.written.get(feat.name()))
            .cloned()
            .ok_or_else(|| DaqError::Instrument(format!("no response scripted for '{command}'")))
    }

    fn default_set_feature(
        &self,
        feat: &Feature,
        cmd: &str,
        args: &[Value],
        kwargs: &CommandKwargs,
    ) -> DaqResult<Value> {
        let command = format_command(cmd, args, kwargs)?;
        let mut state = self.state.lock();
        state.set_calls += 1;
        state.commands.push(command.clone());
        Self::maybe_fail(&mut state, &command)?;
        debug!(%command, "mock set");
        if let Some(value) = args.first() {
            state.written.insert(feat.name().to_string(), value.clone());
        }
        Ok(Value::Str(command))
    }

    fn default_check_operation(
        &self,
        _feat: &Feature,
        _value: &Value,
        _i_value: &Value,
        _response: &Value,
    ) -> DaqResult<(bool, String)> {
        let mut state = self.state.lock();
        state.check_calls += 1;
        Ok(match &state.check_failure {
            Some(detail) => (false, detail.clone()),
            None => (true, String::new()),
        })
    }

    fn reopen_connection(&self) -> DaqResult<()> {
        self.state.lock().reopen_calls += 1;
        Ok(())
    }

    fn query(&self, cmd: &str) -> DaqResult<String> {
        let mut state = self.state.lock();
        state.commands.push(cmd.to_string());
        Self::maybe_fail(&mut state, cmd)?;
        state
            .responses
            .get(cmd)
            .map(Value::to_command_text)
            .ok_or_else(|| DaqError::Instrument(format!("no response scripted for '{cmd}'")))
    }

    fn write(&self, cmd: &str) -> DaqResult<()> {
        let mut state = self.state.lock();
        state.commands.push(cmd.to_string());
        Self::maybe_fail(&mut state, cmd)
    }

    fn finalize(&self) -> DaqResult<()> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn initialize(&self) -> DaqResult<()> {
        self.finalized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.finalized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features;

    #[test]
    fn test_scripted_responses_and_counts() {
        let feat = Feature::new(features::float().getter("?FREQ").setter("FREQ {}")).unwrap();
        let mock = MockBackend::new().with_response("?FREQ", "100.0");
        let kwargs = CommandKwargs::new();
        assert_eq!(
            mock.default_get_feature(&feat, "?FREQ", &[], &kwargs).unwrap(),
            Value::Str("100.0".into())
        );
        mock.default_set_feature(&feat, "FREQ {}", &[Value::Float(10.0)], &kwargs)
            .unwrap();
        assert_eq!(mock.get_count(), 1);
        assert_eq!(mock.set_count(), 1);
        assert_eq!(mock.commands(), vec!["?FREQ".to_string(), "FREQ 10".to_string()]);
    }

    #[test]
    fn test_scripted_failures() {
        let feat = Feature::new(features::int().getter("?X")).unwrap();
        let mock = MockBackend::new().with_response("?X", 1);
        mock.fail_next(2, CommErrorKind::Timeout);
        let kwargs = CommandKwargs::new();
        for _ in 0..2 {
            let err = mock.default_get_feature(&feat, "?X", &[], &kwargs).unwrap_err();
            assert_eq!(err.comm_kind(), Some(CommErrorKind::Timeout));
        }
        assert!(mock.default_get_feature(&feat, "?X", &[], &kwargs).is_ok());
        assert_eq!(mock.get_count(), 3);
    }
}
