use super::SocketIo;
use crate::constants::buffers::SOCKET_READ_CHUNK;
use crate::utils::readiness::{wait_readable, wait_writable};
use bytes::BytesMut;
use rustls::ServerConnection;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

const CLOSE_NOTIFY_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one non-blocking TLS operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProgress {
    /// Bytes moved. A read of zero means the peer closed the session.
    Done(usize),
    /// Cannot continue until the socket is readable.
    WantRead,
    /// Cannot continue until the socket is writable.
    WantWrite,
}

/// A TLS session driven by the library over a non-blocking socket. A read may need
/// the socket writable and a write may need it readable.
pub trait NonBlockingTls: Send {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<TlsProgress>;

    fn try_write(&mut self, data: &[u8]) -> io::Result<TlsProgress>;

    /// Writes encrypted records produced earlier but not yet on the wire.
    fn flush_records(&mut self) -> io::Result<TlsProgress>;

    fn has_pending_records(&self) -> bool;

    fn has_buffered_plaintext(&mut self) -> bool {
        false
    }

    fn send_close_notify(&mut self) {}

    fn shutdown(&mut self) -> io::Result<()>;

    fn raw_fd(&self) -> RawFd;
}

pub struct TlsLibraryIo<S> {
    socket: S,
}

impl<S: NonBlockingTls> TlsLibraryIo<S> {
    pub fn new(socket: S) -> Self {
        Self { socket }
    }
}

impl<S: NonBlockingTls> SocketIo for TlsLibraryIo<S> {
    /// Drains the session until it would block. Never reports an empty read unless the
    /// peer closed: with nothing decoded yet it parks on readiness and tries again.
    fn recv(&mut self, input: &mut BytesMut) -> io::Result<usize> {
        let mut buf = [0u8; SOCKET_READ_CHUNK];
        let mut total = 0;
        loop {
            match self.socket.try_read(&mut buf)? {
                TlsProgress::Done(0) => return Ok(total),
                TlsProgress::Done(n) => {
                    input.extend_from_slice(&buf[..n]);
                    total += n;
                }
                TlsProgress::WantRead => {
                    if total > 0 {
                        return Ok(total);
                    }
                    wait_readable(self.socket.raw_fd(), None)?;
                }
                TlsProgress::WantWrite => {
                    wait_writable(self.socket.raw_fd(), None)?;
                }
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        loop {
            match self.socket.try_write(data)? {
                TlsProgress::Done(n) => return Ok(n),
                TlsProgress::WantWrite => return Ok(0),
                TlsProgress::WantRead => {
                    wait_readable(self.socket.raw_fd(), None)?;
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        loop {
            match self.socket.flush_records()? {
                TlsProgress::Done(_) | TlsProgress::WantWrite => return Ok(()),
                TlsProgress::WantRead => {
                    wait_readable(self.socket.raw_fd(), None)?;
                }
            }
        }
    }

    fn has_unflushed(&self) -> bool {
        self.socket.has_pending_records()
    }

    fn has_buffered_input(&mut self) -> bool {
        self.socket.has_buffered_plaintext()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.socket.send_close_notify();
        while self.socket.has_pending_records() {
            match self.socket.flush_records()? {
                TlsProgress::WantWrite => {
                    if !wait_writable(self.socket.raw_fd(), Some(CLOSE_NOTIFY_GRACE))? {
                        break;
                    }
                }
                TlsProgress::WantRead => break,
                TlsProgress::Done(_) => {}
            }
        }
        self.socket.shutdown()
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.raw_fd()
    }

    fn kind(&self) -> &'static str {
        "tls-library"
    }
}

/// rustls server session over a non-blocking TCP socket.
pub struct RustlsSocket {
    conn: ServerConnection,
    sock: TcpStream,
    tcp_eof: bool,
}

impl RustlsSocket {
    pub fn new(conn: ServerConnection, sock: TcpStream) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        Ok(Self {
            conn,
            sock,
            tcp_eof: false,
        })
    }

    fn process_packets(&mut self) -> io::Result<()> {
        self.conn
            .process_new_packets()
            .map(|_| ())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

impl NonBlockingTls for RustlsSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<TlsProgress> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(TlsProgress::Done(n)),
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(TlsProgress::Done(0))
                }
                Err(err) if would_block(&err) => {
                    if self.tcp_eof {
                        return Ok(TlsProgress::Done(0));
                    }
                }
                Err(err) => return Err(err),
            }
            // Handshake or key-update traffic has to go out before more input decodes.
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut self.sock) {
                    Ok(_) => continue,
                    Err(err) if would_block(&err) => return Ok(TlsProgress::WantWrite),
                    Err(err) => return Err(err),
                }
            }
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => self.tcp_eof = true,
                Ok(_) => self.process_packets()?,
                Err(err) if would_block(&err) => return Ok(TlsProgress::WantRead),
                Err(err) => return Err(err),
            }
        }
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<TlsProgress> {
        if self.conn.is_handshaking() && self.conn.wants_read() {
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "peer closed during TLS handshake",
                    ))
                }
                Ok(_) => self.process_packets()?,
                Err(err) if would_block(&err) => return Ok(TlsProgress::WantRead),
                Err(err) => return Err(err),
            }
        }
        if self.flush_records()? == TlsProgress::WantWrite {
            return Ok(TlsProgress::WantWrite);
        }
        let accepted = self.conn.writer().write(data)?;
        // Records that do not fit the socket now stay queued for the next flush.
        self.flush_records()?;
        Ok(TlsProgress::Done(accepted))
    }

    fn flush_records(&mut self) -> io::Result<TlsProgress> {
        let mut written = 0;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(n) => written += n,
                Err(err) if would_block(&err) => return Ok(TlsProgress::WantWrite),
                Err(err) => return Err(err),
            }
        }
        Ok(TlsProgress::Done(written))
    }

    fn has_pending_records(&self) -> bool {
        self.conn.wants_write()
    }

    fn has_buffered_plaintext(&mut self) -> bool {
        self.conn
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read() > 0)
            .unwrap_or(false)
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.sock.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    /// Plain socket behind the non-blocking TLS contract, with a script of signals to
    /// return before touching the socket.
    struct ScriptedTls {
        sock: UnixStream,
        read_script: Vec<TlsProgress>,
        write_script: Vec<TlsProgress>,
        read_calls: usize,
    }

    impl ScriptedTls {
        fn new(sock: UnixStream) -> Self {
            sock.set_nonblocking(true).unwrap();
            Self {
                sock,
                read_script: Vec::new(),
                write_script: Vec::new(),
                read_calls: 0,
            }
        }
    }

    impl NonBlockingTls for ScriptedTls {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<TlsProgress> {
            self.read_calls += 1;
            if !self.read_script.is_empty() {
                return Ok(self.read_script.remove(0));
            }
            match self.sock.read(buf) {
                Ok(n) => Ok(TlsProgress::Done(n)),
                Err(err) if would_block(&err) => Ok(TlsProgress::WantRead),
                Err(err) => Err(err),
            }
        }

        fn try_write(&mut self, data: &[u8]) -> io::Result<TlsProgress> {
            if !self.write_script.is_empty() {
                return Ok(self.write_script.remove(0));
            }
            match self.sock.write(data) {
                Ok(n) => Ok(TlsProgress::Done(n)),
                Err(err) if would_block(&err) => Ok(TlsProgress::WantWrite),
                Err(err) => Err(err),
            }
        }

        fn flush_records(&mut self) -> io::Result<TlsProgress> {
            Ok(TlsProgress::Done(0))
        }

        fn has_pending_records(&self) -> bool {
            false
        }

        fn shutdown(&mut self) -> io::Result<()> {
            self.sock.shutdown(Shutdown::Both)
        }

        fn raw_fd(&self) -> RawFd {
            self.sock.as_raw_fd()
        }
    }

    #[test]
    fn empty_would_block_read_waits_for_data() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut io = TlsLibraryIo::new(ScriptedTls::new(ours));
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            theirs.write_all(b"hello").unwrap();
            theirs
        });

        let mut input = BytesMut::new();
        let n = io.recv(&mut input).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&input[..], b"hello");
        assert!(io.socket.read_calls >= 2);
        drop(writer.join().unwrap());
    }

    #[test]
    fn read_waits_for_writability_on_renegotiation() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(b"data").unwrap();
        let mut tls = ScriptedTls::new(ours);
        tls.read_script = vec![TlsProgress::WantWrite];
        let mut io = TlsLibraryIo::new(tls);

        let mut input = BytesMut::new();
        assert_eq!(io.recv(&mut input).unwrap(), 4);
        assert_eq!(&input[..], b"data");
    }

    #[test]
    fn read_reports_zero_only_on_real_close() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut io = TlsLibraryIo::new(ScriptedTls::new(ours));
        drop(theirs);
        let mut input = BytesMut::new();
        assert_eq!(io.recv(&mut input).unwrap(), 0);
        assert!(input.is_empty());
    }

    #[test]
    fn write_would_block_reports_no_progress() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let mut tls = ScriptedTls::new(ours);
        tls.write_script = vec![TlsProgress::WantWrite];
        let mut io = TlsLibraryIo::new(tls);

        assert_eq!(io.send(b"queued").unwrap(), 0);
        assert_eq!(io.send(b"queued").unwrap(), 6);
    }

    #[test]
    fn write_wanting_read_waits_then_retries() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(b"x").unwrap();
        let mut tls = ScriptedTls::new(ours);
        tls.write_script = vec![TlsProgress::WantRead];
        let mut io = TlsLibraryIo::new(tls);

        assert_eq!(io.send(b"abc").unwrap(), 3);
        let mut echoed = [0u8; 3];
        theirs.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"abc");
    }
}
