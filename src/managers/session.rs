use crate::constants::network::SSH_DEFAULT_PORT;
use crate::constants::upgrade::PROTOCOL;
use crate::errors::ProxyError;
use crate::http::header_has_token;
use crate::managers::relay::{AuthMethod, SshOptions, SshRelay};
use crate::services::authorization::Authorizer;
use crate::services::config::ProxyConfig;
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use crate::transport::{BufferedTransport, HijackedIo};
use axum::http::HeaderMap;
use serde_json::{json, Value};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub hostname: String,
    pub ssh_user: String,
    pub command: String,
    pub ssh_port: u16,
    pub ssh_password: Option<String>,
    pub ssh_key_passphrase: Option<String>,
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("hostname", &self.hostname)
            .field("ssh_user", &self.ssh_user)
            .field("command", &self.command)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_password", &self.ssh_password.as_ref().map(|_| "***"))
            .field(
                "ssh_key_passphrase",
                &self.ssh_key_passphrase.as_ref().map(|_| "***"),
            )
            .finish()
    }
}

impl SessionRequest {
    pub fn parse(body: &[u8], validation: &Validation) -> Result<Self, ProxyError> {
        let value: Value = serde_json::from_slice(body).map_err(|err| {
            ProxyError::invalid_request(format!("Request body is not valid JSON: {}", err))
        })?;
        let fields = validation.ensure_object(&value)?;
        Ok(Self {
            hostname: validation.ensure_string(fields.get("hostname"), "hostname", true)?,
            ssh_user: validation.ensure_string(fields.get("ssh_user"), "ssh_user", true)?,
            command: validation.ensure_string(fields.get("command"), "command", false)?,
            ssh_port: validation.ensure_port(fields.get("ssh_port"), SSH_DEFAULT_PORT)?,
            ssh_password: validation
                .ensure_optional_secret(fields.get("ssh_password"), "ssh_password")?,
            ssh_key_passphrase: validation
                .ensure_optional_secret(fields.get("ssh_key_passphrase"), "ssh_key_passphrase")?,
        })
    }
}

/// Runs a parsed session against a hijacked transport.
pub trait SessionRunner: Send + Sync {
    fn run(&self, transport: BufferedTransport, session: &SessionRequest, options: &SshOptions);
}

impl SessionRunner for SshRelay {
    fn run(&self, transport: BufferedTransport, session: &SessionRequest, options: &SshOptions) {
        SshRelay::run(
            self,
            transport,
            &session.command,
            &session.ssh_user,
            &session.hostname,
            options,
        )
    }
}

/// What the serving layer knows about a session request before it takes the socket.
pub struct UpgradeRequest<'a> {
    pub headers: &'a HeaderMap,
    pub peer: Option<SocketAddr>,
    /// Whether the connection can be handed over after the response head.
    pub upgradable: bool,
    pub body: &'a [u8],
}

/// A validated session waiting for its socket.
#[derive(Clone)]
pub struct AcceptedSession {
    pub request: SessionRequest,
    pub options: SshOptions,
}

pub struct SessionHandler {
    logger: Logger,
    config: Arc<ProxyConfig>,
    authorizer: Arc<dyn Authorizer>,
    validation: Validation,
    runner: Arc<dyn SessionRunner>,
}

impl SessionHandler {
    pub fn new(
        logger: Logger,
        config: Arc<ProxyConfig>,
        authorizer: Arc<dyn Authorizer>,
        validation: Validation,
        runner: Arc<dyn SessionRunner>,
    ) -> Self {
        Self {
            logger: logger.child("session"),
            config,
            authorizer,
            validation,
            runner,
        }
    }

    pub fn pubkey(&self) -> Result<Vec<u8>, ProxyError> {
        std::fs::read(&self.config.public_key_file).map_err(|err| {
            let err = ProxyError::internal(format!(
                "Failed to read public key {}: {}",
                self.config.public_key_file.display(),
                err
            ));
            self.logger
                .error("public key unavailable", Some(&json!({ "error": err.message })));
            err
        })
    }

    /// Runs every check that can still be answered with a plain HTTP response.
    pub fn accept(&self, request: &UpgradeRequest<'_>) -> Result<AcceptedSession, ProxyError> {
        self.try_accept(request).map_err(|err| {
            let meta = json!({
                "peer": request.peer.map(|p| p.to_string()),
                "status": err.http_status(),
                "error": err.message,
            });
            if err.http_status() >= 500 {
                self.logger.error("session rejected", Some(&meta));
            } else {
                self.logger.warn("session rejected", Some(&meta));
            }
            err
        })
    }

    fn try_accept(&self, request: &UpgradeRequest<'_>) -> Result<AcceptedSession, ProxyError> {
        if !header_has_token(request.headers, "connection", "upgrade")
            || !header_has_token(request.headers, "upgrade", PROTOCOL)
        {
            return Err(ProxyError::invalid_request(format!(
                "Session requests must send Connection: upgrade and Upgrade: {}",
                PROTOCOL
            )));
        }
        self.authorizer.authorize(request.peer.map(|p| p.ip()))?;
        if !request.upgradable {
            return Err(ProxyError::hijack_unsupported(
                "Upgrade requires a server that can hand over the connection",
            ));
        }
        let session = SessionRequest::parse(request.body, &self.validation)?;
        let options = self.ssh_options(&session);
        Ok(AcceptedSession {
            request: session,
            options,
        })
    }

    /// Adopts the handed-over socket and runs the session on it. Blocks until the
    /// session ends; every outcome is reported on the socket or in the log.
    pub fn run(&self, accepted: AcceptedSession, hijacked: HijackedIo) {
        let transport = match BufferedTransport::from_hijacked(hijacked) {
            Ok(transport) => transport,
            Err(err) => {
                // The socket is gone; only the log can report this.
                self.logger.error(
                    "hijacked socket could not be adopted",
                    Some(&json!({ "error": err.message, "hint": err.hint })),
                );
                return;
            }
        };
        let AcceptedSession { request, options } = accepted;
        self.logger.info(
            "session upgraded",
            Some(&json!({
                "host": request.hostname,
                "user": request.ssh_user,
                "port": request.ssh_port,
                "transport": transport.kind(),
            })),
        );
        self.runner.run(transport, &request, &options);
    }

    fn ssh_options(&self, session: &SessionRequest) -> SshOptions {
        let mut auth_methods = Vec::new();
        if let Some(password) = &session.ssh_password {
            auth_methods.push(AuthMethod::Password(password.clone()));
        }
        auth_methods.push(AuthMethod::PublicKey {
            identity_file: self.config.identity_key_file.clone(),
            passphrase: session.ssh_key_passphrase.clone(),
        });
        SshOptions {
            port: session.ssh_port,
            auth_methods,
            host_key_policy: self.config.host_key_policy,
            known_hosts_file: self.config.known_hosts_file.clone(),
            connect_timeout: Duration::from_millis(self.config.connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_core_fields() {
        let validation = Validation::new();
        let ok = SessionRequest::parse(
            br#"{"hostname":"web1","ssh_user":"deploy","command":"uptime","ssh_port":"2222"}"#,
            &validation,
        )
        .unwrap();
        assert_eq!(ok.ssh_port, 2222);
        assert_eq!(ok.ssh_password, None);

        let missing = SessionRequest::parse(br#"{"hostname":"web1","command":"x"}"#, &validation);
        assert_eq!(missing.unwrap_err().http_status(), 400);
        assert!(SessionRequest::parse(b"[1,2]", &validation).is_err());
        assert!(SessionRequest::parse(b"not json", &validation).is_err());
    }

    #[test]
    fn empty_password_is_still_a_password() {
        let request = SessionRequest::parse(
            br#"{"hostname":"web1","ssh_user":"deploy","command":"id","ssh_password":""}"#,
            &Validation::new(),
        )
        .unwrap();
        assert_eq!(request.ssh_password.as_deref(), Some(""));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let request = SessionRequest {
            hostname: "web1".into(),
            ssh_user: "root".into(),
            command: "id".into(),
            ssh_port: 22,
            ssh_password: Some("hunter2".into()),
            ssh_key_passphrase: Some("swordfish".into()),
        };
        let shown = format!("{:?}", request);
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("swordfish"));
    }
}
