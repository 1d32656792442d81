//! Device abstraction consumed by the driver loop, and a blocking
//! std-only implementation for hosted deployments.
//!
//! Real serial I/O (opening a UART, setting baud/parity) is explicitly
//! out of this crate's scope — [`StdDevice`] wraps *any* already-open
//! `Read + Write` stream (a `TcpStream`, a `File` opened on a
//! `/dev/ttyUSBx` node the caller configured, a test double) and supplies
//! only the timeout/EOF semantics the handler needs.

use std::io::{Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::ErrorKind;

/// Distinguishable outcomes of a timed byte read: a byte arrived, nothing
/// arrived before the timeout, or the peer closed the connection. A hard
/// device error is carried by `Err` at the `Device::recv` level instead
/// of a fourth variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A byte was read.
    Byte(u8),
    /// No byte arrived before `timeout` elapsed.
    Timeout,
    /// The device reported end-of-file (peer closed).
    Eof,
}

/// The I/O contract the bus state machine and driver loop depend on.
///
/// Exactly one thread — the driver loop — calls these methods; the
/// device is never shared with any other caller.
pub trait Device {
    /// Opens the underlying device. Idempotent if already open.
    fn open(&mut self) -> Result<(), ErrorKind>;

    /// Closes the underlying device. Idempotent if already closed.
    fn close(&mut self);

    /// Whether the device is currently open and presumed valid.
    fn is_open(&self) -> bool;

    /// Writes one byte.
    fn send(&mut self, byte: u8) -> Result<(), ErrorKind>;

    /// Reads one byte, waiting up to `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<RecvOutcome, ErrorKind>;
}

/// A blocking [`Device`] built on any `Read + Write` stream, using a
/// background reader thread and a channel to turn blocking reads into
/// timed ones without relying on platform-specific poll syscalls.
pub struct StdDevice<S> {
    stream: Option<S>,
    writer: Option<S>,
    rx: Option<mpsc::Receiver<std::io::Result<Option<u8>>>>,
    reader_handle: Option<JoinHandle<()>>,
    open: bool,
}

impl<S> std::fmt::Debug for StdDevice<S> {
    /// The wrapped stream and its reader-thread plumbing aren't worth
    /// printing; only the open/closed state is.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdDevice").field("open", &self.open).finish_non_exhaustive()
    }
}

impl<S> StdDevice<S>
where
    S: Read + Write + Send + Clone + 'static,
{
    /// Wraps `stream`, which must be `Clone` so the reader thread and the
    /// writer half can each own a handle (as e.g. `TcpStream` is).
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            writer: None,
            rx: None,
            reader_handle: None,
            open: false,
        }
    }
}

impl<S> Device for StdDevice<S>
where
    S: Read + Write + Send + Clone + 'static,
{
    fn open(&mut self) -> Result<(), ErrorKind> {
        if self.open {
            return Ok(());
        }
        let stream = self
            .stream
            .clone()
            .ok_or_else(|| ErrorKind::device("device already consumed"))?;
        self.writer = Some(stream.clone());

        let (tx, rx) = mpsc::channel();
        let mut reader = stream;
        let handle = std::thread::spawn(move || {
            let mut byte = [0u8; 1];
            loop {
                match reader.read(&mut byte) {
                    Ok(0) => {
                        let _ = tx.send(Ok(None));
                        break;
                    }
                    Ok(_) => {
                        if tx.send(Ok(Some(byte[0]))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });
        self.rx = Some(rx);
        self.reader_handle = Some(handle);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.writer = None;
        self.rx = None;
        // The reader thread will observe a broken pipe or EOF on its own;
        // we don't join it here to avoid blocking the caller.
        self.reader_handle = None;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send(&mut self, byte: u8) -> Result<(), ErrorKind> {
        let writer = self.writer.as_mut().ok_or(ErrorKind::Offline)?;
        writer.write_all(&[byte]).map_err(ErrorKind::device)
    }

    fn recv(&mut self, timeout: Duration) -> Result<RecvOutcome, ErrorKind> {
        let rx = self.rx.as_ref().ok_or(ErrorKind::Offline)?;
        match rx.recv_timeout(timeout) {
            Ok(Ok(Some(byte))) => Ok(RecvOutcome::Byte(byte)),
            Ok(Ok(None)) => Ok(RecvOutcome::Eof),
            Ok(Err(e)) => Err(ErrorKind::device(e)),
            Err(RecvTimeoutError::Timeout) => Ok(RecvOutcome::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(RecvOutcome::Eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct MockStream {
        inbound: Arc<Mutex<Cursor<Vec<u8>>>>,
        outbound: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.lock().unwrap().read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_back_bytes_and_detects_eof() {
        let stream = MockStream {
            inbound: Arc::new(Mutex::new(Cursor::new(vec![0x10, 0x20]))),
            outbound: Arc::new(Mutex::new(Vec::new())),
        };
        let mut dev = StdDevice::new(stream);
        dev.open().unwrap();

        assert_eq!(
            dev.recv(Duration::from_millis(200)).unwrap(),
            RecvOutcome::Byte(0x10)
        );
        assert_eq!(
            dev.recv(Duration::from_millis(200)).unwrap(),
            RecvOutcome::Byte(0x20)
        );
        assert_eq!(dev.recv(Duration::from_millis(200)).unwrap(), RecvOutcome::Eof);
    }

    #[test]
    fn send_reaches_outbound_buffer() {
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let stream = MockStream {
            inbound: Arc::new(Mutex::new(Cursor::new(Vec::new()))),
            outbound: outbound.clone(),
        };
        let mut dev = StdDevice::new(stream);
        dev.open().unwrap();
        dev.send(0xAA).unwrap();
        assert_eq!(*outbound.lock().unwrap(), vec![0xAA]);
    }

    #[test]
    fn recv_times_out_when_nothing_arrives() {
        let stream = MockStream {
            inbound: Arc::new(Mutex::new(Cursor::new(Vec::new()))),
            outbound: Arc::new(Mutex::new(Vec::new())),
        };
        // Leave it unread-from forever by never writing to `inbound`; the
        // reader thread blocks on an empty cursor's read, which returns
        // EOF immediately for Cursor, so this exercises the Eof path
        // rather than a true timeout — real serial streams block instead.
        let mut dev = StdDevice::new(stream);
        dev.open().unwrap();
        let outcome = dev.recv(Duration::from_millis(50)).unwrap();
        assert!(matches!(outcome, RecvOutcome::Eof | RecvOutcome::Timeout));
    }
}
