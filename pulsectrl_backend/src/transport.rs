//! Line transports to the pulser.
//!
//! The device worker owns one [`Transport`] and talks to it strictly in request/reply order.
//! [`TcpTransport`] is the network link; [`RecordingTransport`] answers locally and keeps every
//! line it was sent, which is what the demo binary and the tests run against.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::STATUS_QUERY;
use crate::error::{DeviceError, Result};

pub trait Transport: Send {
    /// Sends one line; the line terminator is added by the transport.
    fn send_line(&mut self, line: &str) -> Result<()>;
    /// Blocks until one reply line has been received.
    fn read_line(&mut self) -> Result<String>;
}

pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        log::info!("Connected to pulser at {}", stream.peer_addr()?);
        Ok(Self {
            stream,
            reader,
            timeout,
        })
    }
}

impl Transport for TcpTransport {
    fn send_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.stream, "{line}")?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(std::io::Error::from(ErrorKind::UnexpectedEof).into()),
            Ok(_) => Ok(line),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(DeviceError::Timeout(self.timeout))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory pulser: acknowledges every line and records it.
///
/// Lines starting with one of the `reject` prefixes are answered with `ERR 1 rejected`. Status
/// queries are answered with the number of status queries seen so far.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<String>>>,
    reject: Vec<String>,
    delay: Option<Duration>,
    pending: Option<String>,
    status_queries: u64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every line starting with `prefix`.
    pub fn rejecting(mut self, prefix: &str) -> Self {
        self.reject.push(prefix.to_string());
        self
    }

    /// Answers every line only after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Handle to the lines sent so far, shared with every clone.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }
}

impl Transport for RecordingTransport {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.sent.lock().push(line.to_string());
        let reply = if self.reject.iter().any(|prefix| line.starts_with(prefix.as_str())) {
            "ERR 1 rejected".to_string()
        } else if line == STATUS_QUERY {
            self.status_queries += 1;
            format!("OK {}", self.status_queries)
        } else {
            "OK".to_string()
        };
        self.pending = Some(reply);
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.pending.take().ok_or_else(|| {
            std::io::Error::new(ErrorKind::UnexpectedEof, "no request pending").into()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recording_transport_answers_in_order() {
        let mut transport = RecordingTransport::new().rejecting("PAT 2");
        let log = transport.log();

        transport.send_line("PAT 1 0").unwrap();
        assert_eq!(transport.read_line().unwrap(), "OK");
        transport.send_line("PAT 2 0").unwrap();
        assert_eq!(transport.read_line().unwrap(), "ERR 1 rejected");
        transport.send_line(STATUS_QUERY).unwrap();
        assert_eq!(transport.read_line().unwrap(), "OK 1");

        assert!(transport.read_line().is_err());
        assert_eq!(log.lock().len(), 3);
    }
}
