//! Buffered duplex byte stream over a hijacked client socket.
//!
//! The serving layer hands over an opaque socket. The transport picks an implementation
//! once, by walking [`SOCKET_KINDS`] in order and adopting the socket with the first
//! kind whose predicate matches.

mod embedded_tls;
mod standard;
mod tls_library;

pub use embedded_tls::{EmbeddedTlsIo, EmbeddedTlsStream};
pub use standard::{StandardIo, StandardSocket};
pub use tls_library::{NonBlockingTls, RustlsSocket, TlsLibraryIo, TlsProgress};

use crate::errors::ProxyError;
use crate::utils::readiness::{self, Interest};
use bytes::{Buf, Bytes, BytesMut};
use std::any::Any;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

/// One concrete socket flavor as seen by the buffered transport.
pub trait SocketIo: Send {
    /// Appends whatever the socket yields to `input`. `Ok(0)` means the peer closed.
    fn recv(&mut self, input: &mut BytesMut) -> io::Result<usize>;

    /// Writes a prefix of `data`. `Ok(0)` means no progress; the caller keeps the bytes.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Pushes out bytes the socket accepted but still holds internally.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn has_unflushed(&self) -> bool {
        false
    }

    /// Decoded input that is already buffered and will not show up as fd readiness.
    fn has_buffered_input(&mut self) -> bool {
        false
    }

    fn shutdown(&mut self) -> io::Result<()>;

    fn raw_fd(&self) -> RawFd;

    fn kind(&self) -> &'static str;
}

/// Socket handed over by a hijack, plus any bytes the serving layer had already read
/// past the request body.
pub struct HijackedIo {
    socket: Box<dyn Any + Send>,
    prefetched: Vec<u8>,
}

impl HijackedIo {
    pub fn new<T: Any + Send>(socket: T) -> Self {
        Self {
            socket: Box::new(socket),
            prefetched: Vec::new(),
        }
    }

    pub fn with_prefetched(mut self, bytes: Vec<u8>) -> Self {
        self.prefetched = bytes;
        self
    }
}

struct SocketKind {
    name: &'static str,
    matches: fn(&(dyn Any + Send)) -> bool,
    adopt: fn(Box<dyn Any + Send>) -> io::Result<Box<dyn SocketIo>>,
}

/// Checked in order; the first match wins.
const SOCKET_KINDS: &[SocketKind] = &[
    SocketKind {
        name: "tls-library",
        matches: is_kind::<RustlsSocket>,
        adopt: adopt_tls_library,
    },
    SocketKind {
        name: "embedded-tls",
        matches: is_kind::<EmbeddedTlsStream>,
        adopt: adopt_embedded_tls,
    },
    SocketKind {
        name: "standard-tcp",
        matches: is_kind::<TcpStream>,
        adopt: adopt_standard::<TcpStream>,
    },
    SocketKind {
        name: "standard-unix",
        matches: is_kind::<UnixStream>,
        adopt: adopt_standard::<UnixStream>,
    },
];

fn is_kind<T: Any>(socket: &(dyn Any + Send)) -> bool {
    socket.is::<T>()
}

fn downcast<T: Any>(socket: Box<dyn Any + Send>) -> io::Result<T> {
    socket
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "socket kind mismatch"))
}

fn adopt_tls_library(socket: Box<dyn Any + Send>) -> io::Result<Box<dyn SocketIo>> {
    let socket = downcast::<RustlsSocket>(socket)?;
    Ok(Box::new(TlsLibraryIo::new(socket)))
}

fn adopt_embedded_tls(socket: Box<dyn Any + Send>) -> io::Result<Box<dyn SocketIo>> {
    let stream = downcast::<EmbeddedTlsStream>(socket)?;
    Ok(Box::new(EmbeddedTlsIo::new(stream)?))
}

fn adopt_standard<S: StandardSocket>(socket: Box<dyn Any + Send>) -> io::Result<Box<dyn SocketIo>> {
    let socket = downcast::<S>(socket)?;
    Ok(Box::new(StandardIo::new(socket)?))
}

pub struct BufferedTransport {
    io: Box<dyn SocketIo>,
    input: BytesMut,
    output: BytesMut,
    peer_closed: bool,
    closed: bool,
}

impl BufferedTransport {
    pub fn new(io: Box<dyn SocketIo>) -> Self {
        Self {
            io,
            input: BytesMut::new(),
            output: BytesMut::new(),
            peer_closed: false,
            closed: false,
        }
    }

    /// Selects the socket implementation for a hijacked connection. A socket no kind
    /// recognises is a configuration error of the serving layer.
    pub fn from_hijacked(hijacked: HijackedIo) -> Result<Self, ProxyError> {
        let HijackedIo { socket, prefetched } = hijacked;
        let kind = SOCKET_KINDS
            .iter()
            .find(|kind| (kind.matches)(socket.as_ref()))
            .ok_or_else(|| {
                ProxyError::configuration("Hijacked socket type is not supported").with_hint(
                    "The serving layer must hand over a TcpStream, UnixStream or rustls stream.",
                )
            })?;
        let io = (kind.adopt)(socket).map_err(|err| {
            ProxyError::configuration(format!(
                "Failed to adopt {} socket: {}",
                kind.name, err
            ))
        })?;
        let mut transport = Self::new(io);
        transport.input.extend_from_slice(&prefetched);
        Ok(transport)
    }

    pub fn kind(&self) -> &'static str {
        self.io.kind()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.io.raw_fd()
    }

    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    /// Bytes queued for the client but not yet accepted by the socket.
    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    pub fn available(&self) -> usize {
        self.input.len()
    }

    pub fn read_available(&mut self) -> Bytes {
        self.input.split().freeze()
    }

    /// Receives from the socket into the input buffer. Called once the socket is
    /// readable; `Ok(0)` marks the peer as gone.
    pub fn fill(&mut self) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let received = match self.io.recv(&mut self.input) {
            Ok(n) => n,
            Err(err) if is_disconnect(&err) => 0,
            Err(err) => return Err(err),
        };
        if received == 0 {
            self.peer_closed = true;
        }
        Ok(received)
    }

    pub fn has_buffered_input(&mut self) -> bool {
        !self.is_closed() && self.io.has_buffered_input()
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.output.is_empty() || self.io.has_unflushed()
    }

    /// Writes as much queued output as the socket takes right now.
    pub fn send_pending(&mut self) -> io::Result<usize> {
        let mut sent = 0;
        while !self.output.is_empty() {
            let n = self.io.send(&self.output)?;
            if n == 0 {
                break;
            }
            self.output.advance(n);
            sent += n;
        }
        if self.io.has_unflushed() {
            self.io.flush()?;
        }
        Ok(sent)
    }

    pub fn wait_for_pending_sends(&mut self) -> io::Result<()> {
        while self.has_pending_sends() {
            self.send_pending()?;
            if self.has_pending_sends() {
                readiness::wait_writable(self.io.raw_fd(), None)?;
            }
        }
        Ok(())
    }

    /// Readiness the relay loop should wait for on this transport.
    pub fn interest(&self) -> Interest {
        Interest {
            readable: !self.is_closed(),
            writable: self.has_pending_sends(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.peer_closed
    }

    /// Drains pending output, then shuts the socket down. Later calls are no-ops.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let drained = self.wait_for_pending_sends();
        self.closed = true;
        let shutdown = self.io.shutdown();
        drained.and(shutdown)
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn unix_transport() -> (BufferedTransport, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let transport = BufferedTransport::from_hijacked(HijackedIo::new(ours)).unwrap();
        (transport, theirs)
    }

    #[test]
    fn unix_socket_selects_standard_kind() {
        let (transport, _peer) = unix_transport();
        assert_eq!(transport.kind(), "standard");
    }

    #[test]
    fn unknown_socket_type_is_a_configuration_error() {
        let err = BufferedTransport::from_hijacked(HijackedIo::new(String::from("not a socket")))
            .err()
            .expect("selection must fail");
        assert_eq!(err.kind, crate::errors::ProxyErrorKind::Configuration);
    }

    #[test]
    fn prefetched_bytes_are_available_before_any_read() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let hijacked = HijackedIo::new(ours).with_prefetched(b"early".to_vec());
        let mut transport = BufferedTransport::from_hijacked(hijacked).unwrap();
        assert_eq!(transport.available(), 5);
        assert_eq!(&transport.read_available()[..], b"early");
        assert_eq!(transport.available(), 0);
    }

    #[test]
    fn fill_collects_peer_bytes_in_order() {
        let (mut transport, mut peer) = unix_transport();
        peer.write_all(b"abc").unwrap();
        transport.fill().unwrap();
        peer.write_all(b"def").unwrap();
        transport.fill().unwrap();
        assert_eq!(&transport.read_available()[..], b"abcdef");
    }

    #[test]
    fn peer_close_is_reported_as_closed() {
        let (mut transport, peer) = unix_transport();
        drop(peer);
        assert_eq!(transport.fill().unwrap(), 0);
        assert!(transport.is_closed());
        assert!(!transport.interest().readable);
    }

    #[test]
    fn close_drains_queued_output_once() {
        let (mut transport, mut peer) = unix_transport();
        transport.enqueue(b"Status: 101\r\n");
        transport.enqueue(b"payload");
        assert!(transport.has_pending_sends());
        transport.close().unwrap();
        transport.close().unwrap();
        assert!(transport.is_closed());

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"Status: 101\r\npayload");
    }
}
