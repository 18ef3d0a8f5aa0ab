use crate::errors::ProxyError;
use crate::services::config::TlsIoMode;
use crate::transport::{HijackedIo, RustlsSocket};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls::StreamOwned;
use std::io;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Takes the socket back out of an upgraded hyper connection as a blocking std socket.
/// Bytes hyper had read past the request body travel along as prefetched input.
pub fn into_hijacked(upgraded: Upgraded, io_mode: TlsIoMode) -> Result<HijackedIo, ProxyError> {
    let upgraded = match upgraded.downcast::<TokioIo<TcpStream>>() {
        Ok(parts) => {
            let tcp = parts.io.into_inner().into_std().map_err(detach_failed)?;
            return Ok(HijackedIo::new(tcp).with_prefetched(parts.read_buf.to_vec()));
        }
        Err(upgraded) => upgraded,
    };
    match upgraded.downcast::<TokioIo<TlsStream<TcpStream>>>() {
        Ok(parts) => {
            let (tcp, conn) = parts.io.into_inner().into_inner();
            let tcp = tcp.into_std().map_err(detach_failed)?;
            let hijacked = match io_mode {
                TlsIoMode::Embedded => HijackedIo::new(StreamOwned::new(conn, tcp)),
                TlsIoMode::Library => {
                    HijackedIo::new(RustlsSocket::new(conn, tcp).map_err(detach_failed)?)
                }
            };
            Ok(hijacked.with_prefetched(parts.read_buf.to_vec()))
        }
        Err(_) => Err(ProxyError::hijack_unsupported(
            "Upgraded connection is not a TCP or TLS stream",
        )),
    }
}

fn detach_failed(err: io::Error) -> ProxyError {
    ProxyError::internal(format!("Failed to detach upgraded socket: {}", err))
}
