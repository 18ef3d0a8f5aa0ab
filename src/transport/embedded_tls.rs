use super::SocketIo;
use crate::constants::buffers::SOCKET_READ_CHUNK;
use bytes::BytesMut;
use rustls::{ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// TLS stream owned by the serving host, used with blocking semantics.
pub type EmbeddedTlsStream = StreamOwned<ServerConnection, TcpStream>;

pub struct EmbeddedTlsIo {
    stream: EmbeddedTlsStream,
}

impl EmbeddedTlsIo {
    pub fn new(stream: EmbeddedTlsStream) -> io::Result<Self> {
        stream.sock.set_nonblocking(false)?;
        Ok(Self { stream })
    }
}

impl SocketIo for EmbeddedTlsIo {
    /// Returns whatever plaintext one read yields, possibly less than is in flight.
    fn recv(&mut self, input: &mut BytesMut) -> io::Result<usize> {
        let mut buf = [0u8; SOCKET_READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(n) => {
                    input.extend_from_slice(&buf[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // Peer dropped TCP without close_notify.
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(err) => return Err(err),
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(data.len())
    }

    fn has_buffered_input(&mut self) -> bool {
        self.stream
            .conn
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read() > 0)
            .unwrap_or(false)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        match self.stream.sock.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.sock.as_raw_fd()
    }

    fn kind(&self) -> &'static str {
        "embedded-tls"
    }
}
