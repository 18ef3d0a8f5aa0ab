use super::SocketIo;
use crate::constants::buffers::SOCKET_READ_CHUNK;
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Plain stream sockets driven with native blocking send/receive.
pub trait StandardSocket: Read + Write + AsRawFd + Send + 'static {
    fn set_blocking(&self) -> io::Result<()>;
    fn shutdown_both(&self) -> io::Result<()>;
}

impl StandardSocket for TcpStream {
    fn set_blocking(&self) -> io::Result<()> {
        self.set_nonblocking(false)
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl StandardSocket for UnixStream {
    fn set_blocking(&self) -> io::Result<()> {
        self.set_nonblocking(false)
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

pub struct StandardIo<S> {
    socket: S,
}

impl<S: StandardSocket> StandardIo<S> {
    pub fn new(socket: S) -> io::Result<Self> {
        socket.set_blocking()?;
        Ok(Self { socket })
    }
}

impl<S: StandardSocket> SocketIo for StandardIo<S> {
    fn recv(&mut self, input: &mut BytesMut) -> io::Result<usize> {
        let mut buf = [0u8; SOCKET_READ_CHUNK];
        loop {
            match self.socket.read(&mut buf) {
                Ok(n) => {
                    input.extend_from_slice(&buf[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        loop {
            match self.socket.write(data) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.socket.shutdown_both() {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn kind(&self) -> &'static str {
        "standard"
    }
}
