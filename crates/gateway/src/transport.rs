//! Blocking TCP primitives for the sensor wire protocol
//!
//! Receives distinguish three outcomes: the requested bytes arrived, the peer
//! closed, or the per-field timeout elapsed. Anything else is an error.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use socket2::SockRef;

use crate::error::TransportError;
use crate::reading::Reading;

/// Result of a bounded receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Complete,
    Closed,
    TimedOut,
}

/// Listening endpoint for sensor nodes
pub struct SensorListener {
    listener: TcpListener,
}

impl SensorListener {
    /// Bind on all interfaces. Port 0 picks an ephemeral port.
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|source| TransportError::Bind { port, source })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until the next sensor node connects
    pub fn accept(&self) -> Result<SensorStream, TransportError> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        Ok(SensorStream { stream, peer })
    }

    /// Switch accepts to non-blocking mode for `try_accept`
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), TransportError> {
        self.listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Accept a pending connection, or `None` when nobody is waiting.
    /// The returned stream is always in blocking mode.
    pub fn try_accept(&self) -> Result<Option<SensorStream>, TransportError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                // Some platforms let accepted sockets inherit O_NONBLOCK
                stream.set_nonblocking(false)?;
                Ok(Some(SensorStream { stream, peer }))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => Err(TransportError::Accept(e)),
        }
    }
}

/// Server side of one sensor connection
pub struct SensorStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl SensorStream {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Fill `buf` completely or report why not. `timeout` bounds the whole field.
    pub fn recv_exact(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<RecvOutcome, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(RecvOutcome::TimedOut);
            }
            self.stream.set_read_timeout(Some(remaining))?;

            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Ok(RecvOutcome::Closed),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(RecvOutcome::TimedOut)
                }
                Err(e) => return Err(TransportError::Receive(e)),
            }
        }

        Ok(RecvOutcome::Complete)
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Sending side of the protocol, as run by a sensor node
pub struct SensorClient {
    stream: TcpStream,
}

impl SensorClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn send_reading(&mut self, reading: &Reading) -> Result<(), TransportError> {
        self.send(&reading.to_wire())
    }

    /// Send raw bytes, e.g. a partial reading
    pub fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).map_err(TransportError::Send)?;
        self.stream.flush().map_err(TransportError::Send)
    }

    /// Orderly close: the gateway sees end-of-stream on its next receive
    pub fn close(self) -> Result<(), TransportError> {
        self.stream.shutdown(Shutdown::Write)?;
        Ok(())
    }

    /// Abortive close: zero linger makes the drop send a reset instead of FIN
    pub fn abort(self) -> Result<(), TransportError> {
        SockRef::from(&self.stream).set_linger(Some(Duration::ZERO))?;
        Ok(())
    }
}
