use crate::errors::ProxyError;
use crate::http::{router, HttpServer, Routes};
use crate::managers::relay::SshRelay;
use crate::managers::session::SessionHandler;
use crate::services::authorization::TrustedHostsAuthorizer;
use crate::services::config::{ProxyConfig, TlsIoMode};
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use axum::Router;
use serde_json::json;
use std::sync::Arc;

pub struct App {
    pub logger: Logger,
    pub config: Arc<ProxyConfig>,
    pub session_handler: Arc<SessionHandler>,
}

impl App {
    pub fn initialize(config: ProxyConfig, logger: Logger) -> Result<Self, ProxyError> {
        let config = Arc::new(config);
        let authorizer = Arc::new(TrustedHostsAuthorizer::new(
            logger.clone(),
            config.trusted_hosts.clone(),
        ));
        let relay = Arc::new(SshRelay::new(logger.clone()));
        let session_handler = Arc::new(SessionHandler::new(
            logger.clone(),
            config.clone(),
            authorizer,
            Validation::new(),
            relay,
        ));

        if !config.identity_key_file.exists() {
            logger.warn(
                "identity key file not found; public key authentication will fail",
                Some(&json!({ "path": config.identity_key_file.display().to_string() })),
            );
        }

        Ok(Self {
            logger,
            config,
            session_handler,
        })
    }

    pub fn router(&self) -> Router {
        let io_mode = self
            .config
            .tls
            .as_ref()
            .map(|tls| tls.io_mode)
            .unwrap_or(TlsIoMode::Library);
        router(Routes::new(
            self.logger.clone(),
            self.session_handler.clone(),
            io_mode,
        ))
    }

    pub async fn serve(self) -> Result<(), ProxyError> {
        let server = HttpServer::new(self.logger.clone(), self.config.tls.as_ref(), self.router())?;
        server.run(self.config.bind_address).await
    }
}
