use crate::errors::ProxyError;
use crate::services::config::TlsSettings;
use crate::services::logger::Logger;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::Service;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves the router one HTTP/1.1 connection per task, with upgrades enabled so a
/// route can take the socket over.
pub struct HttpServer {
    logger: Logger,
    tls: Option<TlsAcceptor>,
    router: Router,
}

impl HttpServer {
    pub fn new(
        logger: Logger,
        tls: Option<&TlsSettings>,
        router: Router,
    ) -> Result<Self, ProxyError> {
        let tls = match tls {
            Some(settings) => Some(TlsAcceptor::from(load_tls_config(settings)?)),
            None => None,
        };
        Ok(Self {
            logger: logger.child("http"),
            tls,
            router,
        })
    }

    /// Binds `address` and serves until ctrl-c.
    pub async fn run(self, address: SocketAddr) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(address).await.map_err(|err| {
            ProxyError::configuration(format!("Failed to bind {}: {}", address, err))
        })?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let address = listener.local_addr()?;
        self.logger.info(
            "listening",
            Some(&json!({ "address": address.to_string(), "tls": self.tls.is_some() })),
        );

        let server = Arc::new(self);
        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        server.logger.warn("accept failed", Some(&json!({ "error": err.to_string() })));
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    server.logger.info("shutdown requested", None);
                    return Ok(());
                }
            };
            let worker = server.clone();
            tokio::spawn(async move { worker.serve_connection(stream, peer).await });
        }
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        self.logger
            .debug("connection accepted", Some(&json!({ "peer": peer.to_string() })));
        let Some(acceptor) = &self.tls else {
            self.serve_http(stream, peer).await;
            return;
        };
        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => self.serve_http(tls, peer).await,
            Ok(Err(err)) => self.logger.warn(
                "TLS handshake failed",
                Some(&json!({ "peer": peer.to_string(), "error": err.to_string() })),
            ),
            Err(_) => self.logger.warn(
                "TLS handshake timed out",
                Some(&json!({ "peer": peer.to_string() })),
            ),
        }
    }

    async fn serve_http<I>(&self, io: I, peer: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let router = self.router.clone();
        let service = service_fn(move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(peer));
            router.clone().call(request)
        });
        let served = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await;
        if let Err(err) = served {
            self.logger.debug(
                "connection ended with error",
                Some(&json!({ "peer": peer.to_string(), "error": err.to_string() })),
            );
        }
    }
}

pub fn load_tls_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, ProxyError> {
    let cert_pem = std::fs::read(&settings.cert_file).map_err(|err| {
        ProxyError::configuration(format!(
            "Failed to read TLS certificate {}: {}",
            settings.cert_file.display(),
            err
        ))
    })?;
    let key_pem = std::fs::read(&settings.key_file).map_err(|err| {
        ProxyError::configuration(format!(
            "Failed to read TLS key {}: {}",
            settings.key_file.display(),
            err
        ))
    })?;
    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ProxyError::configuration(format!("Invalid TLS certificate: {}", err)))?;
    if certs.is_empty() {
        return Err(ProxyError::configuration("TLS certificate file holds no certificates"));
    }
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|err| ProxyError::configuration(format!("Invalid TLS key: {}", err)))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ProxyError::configuration(format!("Invalid TLS configuration: {}", err)))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::TlsIoMode;
    use std::path::PathBuf;

    #[test]
    fn missing_tls_files_are_configuration_errors() {
        let settings = TlsSettings {
            cert_file: PathBuf::from("/nonexistent/cert.pem"),
            key_file: PathBuf::from("/nonexistent/key.pem"),
            io_mode: TlsIoMode::Library,
        };
        let err = load_tls_config(&settings).unwrap_err();
        assert_eq!(err.kind, crate::errors::ProxyErrorKind::Configuration);
    }
}
