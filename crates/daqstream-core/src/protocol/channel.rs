//! Transport channel abstraction
//!
//! The session is written against [`CommunicationChannel`] so the same
//! protocol engine drives a local UART, a front-end behind a TCP terminal
//! server, or a scripted in-memory channel in tests.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serialport::SerialPort;

/// Byte-stream transport with the small amount of out-of-band control the
/// protocol engine needs.
pub trait CommunicationChannel: Read + Write + Send {
    /// Set the per-read blocking timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any bytes waiting in the receive buffer.
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Discard any bytes queued for transmission.
    fn clear_output_buffer(&mut self) -> io::Result<()>;

    /// Number of bytes that can be read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Reconfigure the line rate. Transports without a line rate ignore it.
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;
}

fn other(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::other(e)
}

/// Serial port transport.
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::Input).map_err(other)
    }

    fn clear_output_buffer(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::Output).map_err(other)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(other)
    }

    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud).map_err(other)
    }
}

/// TCP transport, for front-ends reached through a serial-to-network bridge.
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl CommunicationChannel for TcpChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        // No kernel-level discard for a socket: drain whatever is readable
        // right now and drop it.
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.stream.set_nonblocking(false);
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)?;
        Ok(())
    }

    fn clear_output_buffer(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 8192];
        let result = self.stream.peek(&mut buf);
        self.stream.set_nonblocking(false)?;

        match result {
            Ok(n) => Ok(n as u32),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_baud_rate(&mut self, _baud: u32) -> io::Result<()> {
        // The bridge owns the physical line rate.
        Ok(())
    }
}
