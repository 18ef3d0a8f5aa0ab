mod common;
use common::tmp_path;

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::Response;
use ssh_exec_proxy::app::App;
use ssh_exec_proxy::errors::ProxyError;
use ssh_exec_proxy::managers::relay::{AuthMethod, SshOptions};
use ssh_exec_proxy::managers::session::{
    AcceptedSession, SessionHandler, SessionRequest, SessionRunner, UpgradeRequest,
};
use ssh_exec_proxy::services::authorization::TrustedHostsAuthorizer;
use ssh_exec_proxy::services::config::ProxyConfig;
use ssh_exec_proxy::services::logger::Logger;
use ssh_exec_proxy::services::validation::Validation;
use ssh_exec_proxy::transport::{BufferedTransport, HijackedIo};
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

const BODY: &str = r#"{"hostname":"web1","ssh_user":"deploy","command":"uptime","ssh_password":"hunter2"}"#;

#[derive(Default)]
struct RecordingRunner {
    runs: Mutex<Vec<(SessionRequest, SshOptions, &'static str)>>,
}

impl SessionRunner for RecordingRunner {
    fn run(&self, mut transport: BufferedTransport, session: &SessionRequest, options: &SshOptions) {
        self.runs
            .lock()
            .unwrap()
            .push((session.clone(), options.clone(), transport.kind()));
        transport.enqueue(b"relayed");
        transport.close().unwrap();
    }
}

fn config(pairs: &[(&str, &str)]) -> ProxyConfig {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ProxyConfig::from_lookup(|key| map.get(key).cloned()).unwrap()
}

fn handler_with(config: ProxyConfig, runner: Arc<RecordingRunner>) -> SessionHandler {
    let logger = Logger::new("test");
    let authorizer = Arc::new(TrustedHostsAuthorizer::new(
        logger.clone(),
        config.trusted_hosts.clone(),
    ));
    SessionHandler::new(
        logger,
        Arc::new(config),
        authorizer,
        Validation::new(),
        runner,
    )
}

fn upgrade_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("connection", HeaderValue::from_static("Upgrade"));
    headers.insert("upgrade", HeaderValue::from_static("raw"));
    headers
}

fn peer() -> Option<SocketAddr> {
    Some("10.0.0.5:40000".parse().unwrap())
}

fn accept(handler: &SessionHandler, headers: &HeaderMap, body: &str) -> Result<AcceptedSession, ProxyError> {
    handler.accept(&UpgradeRequest {
        headers,
        peer: peer(),
        upgradable: true,
        body: body.as_bytes(),
    })
}

fn accepted(handler: &SessionHandler, body: &str) -> AcceptedSession {
    match accept(handler, &upgrade_headers(), body) {
        Ok(accepted) => accepted,
        Err(err) => panic!("session should be accepted: {}", err),
    }
}

async fn reason(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value["reason"].as_str().unwrap_or_default().to_string()
}

#[test]
fn missing_upgrade_headers_are_rejected() {
    let runner = Arc::new(RecordingRunner::default());
    let handler = handler_with(config(&[]), runner.clone());
    let err = accept(&handler, &HeaderMap::new(), BODY).err().expect("must be rejected");
    assert_eq!(err.http_status(), 400);
    assert!(err.public_body()["reason"].as_str().unwrap().contains("Upgrade: raw"));
    assert!(runner.runs.lock().unwrap().is_empty());
}

#[test]
fn wrong_protocol_token_is_rejected() {
    let handler = handler_with(config(&[]), Arc::new(RecordingRunner::default()));
    let mut headers = upgrade_headers();
    headers.insert("upgrade", HeaderValue::from_static("websocket"));
    let err = accept(&handler, &headers, BODY).err().expect("must be rejected");
    assert_eq!(err.http_status(), 400);
}

#[test]
fn connection_that_cannot_upgrade_gets_501() {
    let handler = handler_with(config(&[]), Arc::new(RecordingRunner::default()));
    let headers = upgrade_headers();
    let err = handler
        .accept(&UpgradeRequest {
            headers: &headers,
            peer: peer(),
            upgradable: false,
            body: BODY.as_bytes(),
        })
        .err()
        .expect("must be rejected");
    assert_eq!(err.http_status(), 501);
}

#[test]
fn untrusted_peer_is_forbidden() {
    let handler = handler_with(
        config(&[("SSH_PROXY_TRUSTED_HOSTS", "10.9.9.9")]),
        Arc::new(RecordingRunner::default()),
    );
    let err = accept(&handler, &upgrade_headers(), BODY).err().expect("must be rejected");
    assert_eq!(err.http_status(), 403);
}

#[test]
fn invalid_body_is_rejected() {
    let handler = handler_with(config(&[]), Arc::new(RecordingRunner::default()));
    let err = accept(&handler, &upgrade_headers(), r#"{"hostname":"web1"}"#)
        .err()
        .expect("must be rejected");
    assert_eq!(err.http_status(), 400);
    assert!(err.message.contains("ssh_user"));
}

#[test]
fn accepted_session_hands_the_socket_to_the_runner() {
    let runner = Arc::new(RecordingRunner::default());
    let handler = handler_with(
        config(&[
            ("SSH_PROXY_IDENTITY_KEY_FILE", "/etc/proxy/id_ed25519"),
            ("SSH_PROXY_TRUSTED_HOSTS", "10.0.0.5"),
        ]),
        runner.clone(),
    );
    let session = accepted(&handler, BODY);
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    handler.run(session, HijackedIo::new(ours));

    let mut relayed = String::new();
    theirs.read_to_string(&mut relayed).unwrap();
    assert_eq!(relayed, "relayed");

    let runs = runner.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    let (session, options, kind) = &runs[0];
    assert_eq!(session.hostname, "web1");
    assert_eq!(session.ssh_user, "deploy");
    assert_eq!(options.port, 22);
    assert_eq!(*kind, "standard");
    assert_eq!(options.auth_methods.len(), 2);
    assert!(matches!(&options.auth_methods[0], AuthMethod::Password(p) if p == "hunter2"));
    match &options.auth_methods[1] {
        AuthMethod::PublicKey { identity_file, passphrase } => {
            assert_eq!(identity_file.to_str(), Some("/etc/proxy/id_ed25519"));
            assert!(passphrase.is_none());
        }
        AuthMethod::Password(_) => panic!("expected public key method"),
    }
}

#[test]
fn keys_only_session_offers_just_the_identity_file() {
    let handler = handler_with(config(&[]), Arc::new(RecordingRunner::default()));
    let session = accepted(
        &handler,
        r#"{"hostname":"web1","ssh_user":"root","command":"id","ssh_key_passphrase":"swordfish"}"#,
    );
    assert_eq!(session.options.auth_methods.len(), 1);
    assert!(matches!(
        &session.options.auth_methods[0],
        AuthMethod::PublicKey { passphrase: Some(p), .. } if p == "swordfish"
    ));
}

#[test]
fn empty_password_still_offers_password_first() {
    let handler = handler_with(config(&[]), Arc::new(RecordingRunner::default()));
    let session = accepted(
        &handler,
        r#"{"hostname":"web1","ssh_user":"root","command":"id","ssh_password":""}"#,
    );
    assert_eq!(session.options.auth_methods.len(), 2);
    assert!(matches!(&session.options.auth_methods[0], AuthMethod::Password(p) if p.is_empty()));
}

#[test]
fn unadoptable_socket_never_reaches_the_runner() {
    let runner = Arc::new(RecordingRunner::default());
    let handler = handler_with(config(&[]), runner.clone());
    let session = accepted(&handler, BODY);
    handler.run(session, HijackedIo::new(String::from("not a socket")));
    assert!(runner.runs.lock().unwrap().is_empty());
}

#[test]
fn pubkey_returns_file_bytes() {
    let path = tmp_path("ssh-exec-proxy-pubkey");
    std::fs::write(&path, b"ssh-ed25519 AAAAC3Nz proxy\n").unwrap();
    let handler = handler_with(
        config(&[("SSH_PROXY_PUBLIC_KEY_FILE", path.to_str().unwrap())]),
        Arc::new(RecordingRunner::default()),
    );
    assert_eq!(handler.pubkey().unwrap(), b"ssh-ed25519 AAAAC3Nz proxy\n");
    let _ = std::fs::remove_file(&path);
}

fn app(pairs: &[(&str, &str)]) -> App {
    App::initialize(config(pairs), Logger::new("test")).unwrap()
}

#[tokio::test]
async fn pubkey_route_serves_plain_text() {
    let path = tmp_path("ssh-exec-proxy-pubkey-route");
    std::fs::write(&path, b"ssh-ed25519 AAAAC3Nz proxy\n").unwrap();
    let router = app(&[("SSH_PROXY_PUBLIC_KEY_FILE", path.to_str().unwrap())]).router();

    let response = router
        .oneshot(Request::get("/pubkey").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"ssh-ed25519 AAAAC3Nz proxy\n");
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn missing_pubkey_is_an_internal_error() {
    let path = tmp_path("ssh-exec-proxy-missing");
    let router = app(&[("SSH_PROXY_PUBLIC_KEY_FILE", path.to_str().unwrap())]).router();
    let response = router
        .oneshot(Request::get("/pubkey").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reason(response).await, "Internal error");
}

#[tokio::test]
async fn session_route_rejects_before_any_upgrade() {
    let router = app(&[]).router();
    let response = router
        .clone()
        .oneshot(Request::post("/session").body(Body::from(BODY)).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(reason(response).await.contains("Upgrade: raw"));

    // A request that never went through a hyper connection has nothing to upgrade.
    let response = router
        .oneshot(
            Request::post("/session")
                .header("connection", "upgrade")
                .header("upgrade", "raw")
                .body(Body::from(BODY))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn unknown_paths_are_404() {
    let router = app(&[]).router();
    let response = router
        .clone()
        .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(reason(response).await.contains("GET /nope"));

    let response = router
        .oneshot(Request::get("/session").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
