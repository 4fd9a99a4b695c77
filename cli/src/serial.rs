//! Serial-port byte transport
//!
//! Wraps a `serialport` handle as the link layer's `Transport`: a reader
//! thread delivers inbound chunks to the delegate, writes go straight to
//! the port. Read timeouts just poll again; hard I/O errors are reported
//! as a fatal loss of the port.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use threewire_core::{Transport, TransportDelegate, TransportError};
use tracing::debug;

const READ_CHUNK: usize = 256;
const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
    stop: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            port: None,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, delegate: Arc<dyn TransportDelegate>) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::IoResourcesUnavailable(e.to_string()))?;
        let reader_port = port
            .try_clone()
            .map_err(|e| TransportError::IoResourcesUnavailable(e.to_string()))?;

        debug!("opened {} at {} baud", self.path, self.baud_rate);
        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let reader = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(reader_port, delegate, stop))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        self.port = Some(port);
        self.reader = Some(reader);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        port.write_all(data)
            .and_then(|()| port.flush())
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_none() {
            return Err(TransportError::Closed);
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        Ok(())
    }
}

fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    delegate: Arc<dyn TransportDelegate>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_CHUNK];
    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => delegate.on_data(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                delegate.on_error(TransportError::IoResourcesUnavailable(e.to_string()));
                break;
            }
        }
    }
}
