use crate::errors::ProxyError;
use crate::services::logger::Logger;
use std::net::IpAddr;

/// Policy gate consulted before a session socket is hijacked.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, peer: Option<IpAddr>) -> Result<(), ProxyError>;
}

/// Admits peers whose address is on the trusted list. An empty list admits everyone.
pub struct TrustedHostsAuthorizer {
    logger: Logger,
    trusted: Vec<IpAddr>,
}

impl TrustedHostsAuthorizer {
    pub fn new(logger: Logger, trusted: Vec<IpAddr>) -> Self {
        if trusted.is_empty() {
            logger.warn("no trusted hosts configured; all peers are authorized", None);
        }
        Self {
            logger: logger.child("authz"),
            trusted,
        }
    }
}

impl Authorizer for TrustedHostsAuthorizer {
    fn authorize(&self, peer: Option<IpAddr>) -> Result<(), ProxyError> {
        if self.trusted.is_empty() {
            return Ok(());
        }
        match peer {
            Some(addr) if self.trusted.contains(&addr) => Ok(()),
            _ => {
                let shown = peer
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                self.logger.warn(
                    "untrusted peer rejected",
                    Some(&serde_json::json!({ "peer": shown })),
                );
                Err(ProxyError::forbidden(format!(
                    "Untrusted client {} attempted to access the API",
                    shown
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_admits_everyone() {
        let authz = TrustedHostsAuthorizer::new(Logger::new("test"), Vec::new());
        assert!(authz.authorize(None).is_ok());
        assert!(authz.authorize(Some("192.0.2.7".parse().unwrap())).is_ok());
    }

    #[test]
    fn only_listed_peers_pass() {
        let authz =
            TrustedHostsAuthorizer::new(Logger::new("test"), vec!["10.1.1.1".parse().unwrap()]);
        assert!(authz.authorize(Some("10.1.1.1".parse().unwrap())).is_ok());
        let err = authz
            .authorize(Some("10.1.1.2".parse().unwrap()))
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
        assert!(authz.authorize(None).is_err());
    }
}
