//! # Serial Link
//!
//! Opens the telemetry device's serial port and splits it in two halves:
//! a blocking reader thread that feeds complete lines into the [`LineSender`],
//! and a [`CommandSink`] used by the dispatcher to write `START`/`STOP` back
//! to the device.

use crate::config::SerialConfig;
use crate::error::BridgeError;
use crate::events::EventReporter;
use crate::telemetry::queue::LineSender;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Destination for the dispatcher's control strings
pub trait CommandSink: Send {
    fn send_command(&mut self, command: &str) -> Result<(), BridgeError>;

    /// Releases the device; later commands fail with `NotOpen`
    fn close(&mut self);
}

/// Writes newline-terminated commands to the serial port
pub struct SerialCommandWriter {
    port_name: String,
    port: Option<Box<dyn Write + Send>>,
}

impl SerialCommandWriter {
    pub fn new(port_name: impl Into<String>, port: Box<dyn Write + Send>) -> Self {
        Self {
            port_name: port_name.into(),
            port: Some(port),
        }
    }
}

impl CommandSink for SerialCommandWriter {
    fn send_command(&mut self, command: &str) -> Result<(), BridgeError> {
        let port = self.port.as_mut().ok_or_else(|| {
            BridgeError::NotOpen(format!("serial port {} is not open", self.port_name))
        })?;

        port.write_all(format!("{command}\n").as_bytes())
            .and_then(|_| port.flush())
            .map_err(|e| {
                BridgeError::Send(format!(
                    "failed to write {command} to {}: {e}",
                    self.port_name
                ))
            })?;
        debug!("Wrote {} to {}", command, self.port_name);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Serial command writer for {} closed", self.port_name);
        }
    }
}

/// Read half of an open serial port
pub struct SerialReader {
    port_name: String,
    port: Box<dyn Read + Send>,
}

impl SerialReader {
    pub fn new(port_name: impl Into<String>, port: Box<dyn Read + Send>) -> Self {
        Self {
            port_name: port_name.into(),
            port,
        }
    }

    /// Runs the line pump on its own thread
    pub fn spawn(self, lines: LineSender, events: EventReporter) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || {
                let name = self.port_name;
                pump_lines(BufReader::new(self.port), &name, &lines, &events);
            })
    }
}

/// Opens the configured port and returns its reader and writer halves
pub fn open(config: &SerialConfig) -> Result<(SerialReader, SerialCommandWriter), BridgeError> {
    let port = serialport::new(&config.port, config.baud_rate)
        .timeout(Duration::from_millis(config.read_timeout_ms))
        .open()
        .map_err(|e| {
            BridgeError::NotOpen(format!("failed to open serial port {}: {e}", config.port))
        })?;
    let writer = port.try_clone().map_err(|e| {
        BridgeError::NotOpen(format!("failed to clone serial port {}: {e}", config.port))
    })?;

    info!(
        "Serial port {} opened at {} baud",
        config.port, config.baud_rate
    );
    Ok((
        SerialReader::new(config.port.clone(), Box::new(port)),
        SerialCommandWriter::new(config.port.clone(), Box::new(writer)),
    ))
}

/// Names of the serial ports present on this machine
pub fn available_ports() -> Result<Vec<String>, BridgeError> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| BridgeError::NotOpen(format!("failed to enumerate serial ports: {e}")))
}

/// Feeds trimmed, non-empty lines into `lines` until EOF, a read error or a
/// closed queue
///
/// Read timeouts are expected on an idle port and keep the partial line.
pub fn pump_lines<R: BufRead>(
    mut reader: R,
    port_name: &str,
    lines: &LineSender,
    events: &EventReporter,
) {
    let mut buf = Vec::new();
    loop {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                events.error(format!("serial port {port_name} closed"));
                break;
            }
            Ok(_) => {
                if !forward(&buf, lines) {
                    break;
                }
                buf.clear();
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => {
                events.error(format!("serial read error on {port_name}: {e}"));
                break;
            }
        }
    }
    warn!("Serial reader for {} stopped", port_name);
}

fn forward(raw: &[u8], lines: &LineSender) -> bool {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    lines.push(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::queue::{line_queue, OverflowPolicy};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pump_forwards_trimmed_lines() {
        let (tx, mut rx) = line_queue(16, OverflowPolicy::Block);
        let (events, mut event_rx) = EventReporter::channel(8);
        let input = Cursor::new(b"rpm:3500\r\n\r\n  tps:45 \nspeed:88".to_vec());

        tokio::task::spawn_blocking(move || pump_lines(input, "ttyTEST", &tx, &events))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("rpm:3500"));
        assert_eq!(rx.recv().await.as_deref(), Some("tps:45"));
        assert_eq!(rx.recv().await.as_deref(), Some("speed:88"));
        assert_eq!(rx.recv().await, None);
        let closed = event_rx.try_recv().unwrap();
        assert!(closed.is_error());
        assert!(closed.message.contains("ttyTEST"));
    }

    #[test]
    fn pump_stops_when_queue_closes() {
        let (tx, rx) = line_queue(16, OverflowPolicy::Block);
        drop(rx);
        let (events, _rx) = EventReporter::channel(8);

        pump_lines(Cursor::new(b"a:1\nb:2\n".to_vec()), "ttyTEST", &tx, &events);
        assert!(tx.is_empty());
    }

    #[test]
    fn writer_appends_newline() {
        let buf = SharedBuf::default();
        let mut writer = SerialCommandWriter::new("ttyTEST", Box::new(buf.clone()));

        writer.send_command("START").unwrap();
        writer.send_command("STOP").unwrap();

        assert_eq!(buf.0.lock().unwrap().as_slice(), b"START\nSTOP\n");
    }

    #[test]
    fn closed_writer_reports_not_open() {
        let buf = SharedBuf::default();
        let mut writer = SerialCommandWriter::new("ttyTEST", Box::new(buf.clone()));
        writer.close();

        assert!(matches!(
            writer.send_command("START"),
            Err(BridgeError::NotOpen(_))
        ));
        assert!(buf.0.lock().unwrap().is_empty());
    }
}
