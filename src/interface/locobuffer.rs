//! RR-CirKits LocoBuffer-USB driver.
//!
//! The LocoBuffer-USB presents itself as a serial port running at 57 600
//! baud. It forwards every byte seen on LocoNet, including the bytes it
//! transmits itself, which is what the send pipeline relies on for
//! confirmation.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serialport::SerialPort;

use super::{ByteQueues, Interface};
use crate::error::Result;

/// Line speed of the LocoBuffer-USB.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Serial read timeout; bounds how long queued outbound bytes wait.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// LocoBuffer-USB on a serial device.
pub struct LocoBufferUsb {
    path: String,
    port: Mutex<Box<dyn SerialPort>>,
    queues: ByteQueues,
}

impl LocoBufferUsb {
    /// Open the serial device at `path`.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;

        tracing::info!("Opened LocoBuffer-USB on {} at {} baud", path, baud_rate);

        Ok(Self {
            path: path.to_string(),
            port: Mutex::new(port),
            queues: ByteQueues::new(),
        })
    }

    /// Serial device path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for LocoBufferUsb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocoBufferUsb")
            .field("path", &self.path)
            .field("queues", &self.queues)
            .finish()
    }
}

impl Interface for LocoBufferUsb {
    fn queues(&self) -> &ByteQueues {
        &self.queues
    }

    fn run(&self) -> Result<()> {
        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = [0u8; 256];

        loop {
            pump_once(&mut **port, &self.queues, &self.path, &mut buf)?;
        }
    }
}

/// Move received serial bytes inbound, then transmit anything queued.
///
/// A read timeout is not an error; any other I/O failure is logged with
/// the device path and returned.
fn pump_once<P>(port: &mut P, queues: &ByteQueues, path: &str, buf: &mut [u8]) -> Result<()>
where
    P: Read + Write + ?Sized,
{
    match port.read(buf) {
        Ok(0) => {}
        Ok(n) => queues.push_inbound(&buf[..n]),
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
        Err(e) => {
            tracing::error!("LocoBuffer-USB read failed on {}: {}", path, e);
            return Err(e.into());
        }
    }

    let outbound = queues.drain_outbound();
    if outbound.is_empty() {
        return Ok(());
    }
    if let Err(e) = port.write_all(&outbound).and_then(|()| port.flush()) {
        tracing::error!("LocoBuffer-USB write failed on {}: {}", path, e);
        return Err(e.into());
    }
    tracing::trace!("Transmitted {} bytes to LocoNet", outbound.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::io;

    /// In-memory port with scripted reads and an optional broken write side.
    #[derive(Default)]
    struct FakePort {
        incoming: Vec<u8>,
        written: Vec<u8>,
        broken: bool,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.incoming.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.incoming.len());
            buf[..n].copy_from_slice(&self.incoming[..n]);
            self.incoming.drain(..n);
            Ok(n)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "unplugged"));
            }
            self.written.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_pump_moves_bytes_both_ways() {
        let queues = ByteQueues::new();
        let mut port = FakePort {
            incoming: vec![0xB2, 0x01, 0x02, 0x03],
            ..Default::default()
        };
        queues.push_outbound(&[0x83, 0x7C]);

        let mut buf = [0u8; 16];
        pump_once(&mut port, &queues, "/dev/fake", &mut buf).unwrap();

        assert_eq!(&queues.drain_inbound()[..], &[0xB2, 0x01, 0x02, 0x03]);
        assert_eq!(port.written, vec![0x83, 0x7C]);
    }

    #[test]
    fn test_pump_read_timeout_is_quiet() {
        let queues = ByteQueues::new();
        let mut port = FakePort::default();

        let mut buf = [0u8; 16];
        assert!(pump_once(&mut port, &queues, "/dev/fake", &mut buf).is_ok());
        assert_eq!(queues.inbound_len(), 0);
    }

    #[test]
    fn test_pump_write_failure_is_returned() {
        let queues = ByteQueues::new();
        let mut port = FakePort {
            broken: true,
            ..Default::default()
        };
        queues.push_outbound(&[0x83, 0x7C]);

        let mut buf = [0u8; 16];
        let result = pump_once(&mut port, &queues, "/dev/fake", &mut buf);

        match result {
            Err(GatewayError::Io(e)) => assert_eq!(e.kind(), ErrorKind::BrokenPipe),
            other => panic!("expected I/O error, got {:?}", other),
        }
        assert_eq!(queues.outbound_len(), 0);
    }
}
