//! Log forwarding from the companion to the runtime.
//!
//! The companion cannot share the runtime's stderr once it execs the user
//! program, so it writes JSON lines to a dedicated pipe. The runtime reads
//! them on a background thread and re-emits each record under the
//! `berth::companion` target.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::OwnedFd;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, RuntimeError};
use crate::process::poll_until;

/// Target under which companion records are re-emitted.
pub const COMPANION_TARGET: &str = "berth::companion";

/// Companion end of the log pipe.
///
/// Clones share the descriptor. After [`LogPipe::close`] every write is
/// silently discarded, so nothing reaches the user program's inherited
/// descriptors.
#[derive(Debug, Clone)]
pub struct LogPipe {
    file: Arc<Mutex<Option<File>>>,
}

impl LogPipe {
    /// Wraps the write end of the log pipe.
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: Arc::new(Mutex::new(Some(File::from(fd)))),
        }
    }

    /// Closes the descriptor.
    pub fn close(&self) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        drop(guard.take());
    }
}

impl Write for LogPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map_or(Ok(()), Write::flush)
    }
}

/// Installs a JSON subscriber writing to `pipe` in the companion.
///
/// # Errors
///
/// Returns an error if `level` is not a valid filter or a subscriber is
/// already installed.
pub fn install_companion_logging(pipe: &LogPipe, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| RuntimeError::Configuration(format!("log level {level:?}: {e}")))?;
    let writer = pipe.clone();
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(move || writer.clone())
        .try_init()
        .map_err(|e| RuntimeError::external("install companion logger", e))
}

#[derive(Deserialize)]
struct RawRecord {
    level: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

/// One record read from the log pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionRecord {
    /// Severity.
    pub level: Level,
    /// The record's message.
    pub message: String,
    /// Remaining structured fields as compact JSON, empty if none.
    pub fields: String,
}

/// Parses one JSON line written by the companion's subscriber.
///
/// Returns `None` for lines that are not such records.
#[must_use]
pub fn parse_log_line(line: &str) -> Option<CompanionRecord> {
    let raw: RawRecord = serde_json::from_str(line).ok()?;
    let level = Level::from_str(&raw.level).ok()?;
    let mut fields = raw.fields;
    let message = match fields.remove("message") {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let fields = if fields.is_empty() {
        String::new()
    } else {
        Value::Object(fields).to_string()
    };
    Some(CompanionRecord {
        level,
        message,
        fields,
    })
}

fn emit(record: &CompanionRecord) {
    let CompanionRecord {
        level,
        message,
        fields,
    } = record;
    match *level {
        Level::ERROR => tracing::error!(target: COMPANION_TARGET, fields = %fields, "{message}"),
        Level::WARN => tracing::warn!(target: COMPANION_TARGET, fields = %fields, "{message}"),
        Level::INFO => tracing::info!(target: COMPANION_TARGET, fields = %fields, "{message}"),
        Level::DEBUG => tracing::debug!(target: COMPANION_TARGET, fields = %fields, "{message}"),
        _ => tracing::trace!(target: COMPANION_TARGET, fields = %fields, "{message}"),
    }
}

/// Reads `reader` line by line until EOF and re-emits every record.
/// Lines that are not records are emitted as warnings verbatim; invalid
/// UTF-8 is replaced rather than ending the stream.
///
/// Returns the number of lines read.
pub fn pump_logs(reader: impl Read) -> usize {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "companion log pipe read failed");
                break;
            }
        }
        count += 1;
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }
        match parse_log_line(line) {
            Some(record) => emit(&record),
            None => tracing::warn!(target: COMPANION_TARGET, "{line}"),
        }
    }
    count
}

/// Runs [`pump_logs`] on a background thread. The thread ends when every
/// write end of the pipe is closed.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned.
pub fn forward_logs(reader: impl Read + Send + 'static) -> Result<JoinHandle<usize>> {
    std::thread::Builder::new()
        .name("companion-logs".into())
        .spawn(move || pump_logs(reader))
        .map_err(|e| RuntimeError::external("spawn log forwarder", e))
}

/// Waits up to `attempts * interval` for a forwarder to reach EOF.
///
/// Returns the number of lines it read, or `None` if it is still running
/// and was left detached.
pub fn drain(forwarder: JoinHandle<usize>, attempts: u32, interval: Duration) -> Option<usize> {
    if !poll_until(attempts, interval, || forwarder.is_finished()) {
        tracing::debug!("companion log forwarder still running, detaching");
        return None;
    }
    match forwarder.join() {
        Ok(lines) => Some(lines),
        Err(_) => {
            tracing::debug!("companion log forwarder panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn record_keeps_level_message_and_fields() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"WARN","fields":{"message":"slow mount","ms":120},"target":"berth_runtime::init"}"#;
        let record = parse_log_line(line).expect("record");
        assert_eq!(record.level, Level::WARN);
        assert_eq!(record.message, "slow mount");
        assert_eq!(record.fields, r#"{"ms":120}"#);
    }

    #[test]
    fn plain_text_is_not_a_record() {
        assert!(parse_log_line("exec: no such file").is_none());
        assert!(parse_log_line(r#"{"level":"LOUD","fields":{}}"#).is_none());
    }

    #[test]
    fn forwarder_stops_at_eof() {
        let (read_end, write_end) = UnixStream::pair().expect("pair");
        let mut pipe = LogPipe::new(OwnedFd::from(write_end));
        let handle = forward_logs(read_end).expect("spawn");

        writeln!(pipe, r#"{{"level":"INFO","fields":{{"message":"hello"}}}}"#).expect("write");
        writeln!(pipe, "not json").expect("write");
        pipe.close();
        writeln!(pipe, "discarded after close").expect("write after close");

        assert_eq!(handle.join().expect("join"), 2);
    }

    #[test]
    fn invalid_utf8_does_not_stop_forwarding() {
        let mut input = b"{\"level\":\"INFO\",\"fields\":{\"message\":\"one\"}}\n".to_vec();
        input.extend_from_slice(b"bad \xff\xfe bytes\n");
        input.extend_from_slice(b"{\"level\":\"INFO\",\"fields\":{\"message\":\"three\"}}\n");
        assert_eq!(pump_logs(input.as_slice()), 3);
    }

    #[test]
    fn drain_waits_for_eof_and_gives_up_on_open_pipe() {
        let (read_end, write_end) = UnixStream::pair().expect("pair");
        let open = forward_logs(read_end).expect("spawn");
        assert_eq!(drain(open, 3, Duration::from_millis(10)), None);
        drop(write_end);

        let (read_end, write_end) = UnixStream::pair().expect("pair");
        let mut pipe = LogPipe::new(OwnedFd::from(write_end));
        let handle = forward_logs(read_end).expect("spawn");
        writeln!(pipe, "last words").expect("write");
        pipe.close();
        assert_eq!(drain(handle, 100, Duration::from_millis(10)), Some(1));
    }
}
