use crate::constants::buffers::{CHANNEL_READ_CHUNK, RELAY_HIGH_WATER_MARK};
use crate::constants::network::{RELAY_POLL_INTERVAL_MS, TIMEOUT_CHANNEL_CLOSE_MS};
use crate::constants::ssh::PASSWORD_PROMPTS;
use crate::constants::upgrade::{COMMAND_FAILURE_STATUS, SUCCESS_PREAMBLE};
use crate::errors::{ProxyError, ProxyErrorKind};
use crate::services::config::HostKeyPolicy;
use crate::services::logger::Logger;
use crate::transport::BufferedTransport;
use crate::utils::readiness::{poll_many, Interest};
use base64::Engine;
use bytes::{Buf, BytesMut};
use serde_json::json;
use sha2::{Digest, Sha256};
use ssh2::{BlockDirections, Channel, CheckResult, KnownHostFileKind, Session};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey {
        identity_file: PathBuf,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

#[derive(Clone)]
pub struct SshOptions {
    pub port: u16,
    /// Tried in order until one authenticates.
    pub auth_methods: Vec<AuthMethod>,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_file: PathBuf,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelExit {
    Status(i32),
    Signal {
        name: String,
        message: Option<String>,
    },
    /// The channel ended without a final exit report.
    Unknown,
}

impl ChannelExit {
    fn summary(&self) -> String {
        match self {
            ChannelExit::Status(code) => format!("Process exited with code {}.\n", code),
            ChannelExit::Signal {
                name,
                message: Some(message),
            } if !message.is_empty() => {
                format!("Process terminated by signal {} ({}).\n", name, message)
            }
            ChannelExit::Signal { name, .. } => format!("Process terminated by signal {}.\n", name),
            ChannelExit::Unknown => "No exit status received.\n".to_string(),
        }
    }
}

/// Whether the upgrade preamble can still go out on the raw stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preamble {
    NotSent,
    Sent,
    /// A failure block went out instead; nothing else may claim the stream.
    Unsendable,
}

/// Channel reactions onto the client transport: the one-shot preamble, verbatim
/// stdout, and the stderr/exit buffer surfaced only when nothing was committed.
pub struct Splice {
    transport: BufferedTransport,
    preamble: Preamble,
    errors: Vec<u8>,
}

impl Splice {
    pub fn new(transport: BufferedTransport) -> Self {
        Self {
            transport,
            preamble: Preamble::NotSent,
            errors: Vec::new(),
        }
    }

    pub fn transport_mut(&mut self) -> &mut BufferedTransport {
        &mut self.transport
    }

    pub fn is_committed(&self) -> bool {
        self.preamble != Preamble::NotSent
    }

    fn commit(&mut self) {
        if self.preamble == Preamble::NotSent {
            self.transport.enqueue(SUCCESS_PREAMBLE);
            self.preamble = Preamble::Sent;
        }
    }

    /// Returns false when a failure block already owns the stream and the bytes were
    /// dropped.
    pub fn on_stdout(&mut self, data: &[u8]) -> bool {
        self.commit();
        if self.preamble != Preamble::Sent {
            return false;
        }
        self.transport.enqueue(data);
        true
    }

    pub fn on_stderr(&mut self, data: &[u8]) {
        self.errors.extend_from_slice(data);
    }

    pub fn on_exit(&mut self, exit: &ChannelExit) {
        if *exit == ChannelExit::Status(0) {
            self.commit();
        }
        self.errors.extend_from_slice(exit.summary().as_bytes());
    }

    pub fn note_error(&mut self, message: &str) {
        self.errors.extend_from_slice(message.as_bytes());
        if !message.ends_with('\n') {
            self.errors.push(b'\n');
        }
    }

    /// Writes a failure block in place of the preamble. No-op once anything was sent.
    pub fn fail(&mut self, status: u16, body: &[u8]) -> bool {
        if self.preamble != Preamble::NotSent {
            return false;
        }
        self.transport.enqueue(
            format!("Status: {}\r\nConnection: close\r\n\r\n", status).as_bytes(),
        );
        self.transport.enqueue(body);
        self.preamble = Preamble::Unsendable;
        true
    }

    /// Surfaces the error buffer if the stream was never committed, then flushes and
    /// closes the transport.
    pub fn finish(mut self) -> io::Result<()> {
        if self.preamble == Preamble::NotSent {
            let body = std::mem::take(&mut self.errors);
            self.fail(COMMAND_FAILURE_STATUS, &body);
        }
        self.transport.close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    RemoteEof,
    ClientClosed,
}

/// One exec channel as the relay loop drives it. Reads and writes are non-blocking and
/// report `WouldBlock` when the connection has nothing to give or take.
pub trait ExecChannel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize>;

    /// True once the remote sent EOF and no channel data is left to read.
    fn eof(&self) -> bool;

    /// Readiness the connection underneath is waiting for.
    fn interest(&self) -> Interest;

    fn raw_fd(&self) -> RawFd;

    fn keepalive(&mut self) {}

    /// Closes the channel. Returns true only when the remote side had already closed
    /// it, which is when its exit report is final.
    fn close(&mut self) -> bool;

    fn exit(&self) -> ChannelExit;
}

struct SshConnection {
    session: Session,
    fd: RawFd,
}

struct Ssh2Exec {
    connection: SshConnection,
    channel: Channel,
}

impl ExecChannel for Ssh2Exec {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.stderr().read(buf)
    }

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize> {
        self.channel.write(data)
    }

    fn eof(&self) -> bool {
        self.channel.eof()
    }

    fn interest(&self) -> Interest {
        match self.connection.session.block_directions() {
            BlockDirections::Outbound => Interest::WRITABLE,
            BlockDirections::Both => Interest::BOTH,
            _ => Interest::READABLE,
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.connection.fd
    }

    fn keepalive(&mut self) {
        let _ = self.connection.session.keepalive_send();
    }

    fn close(&mut self) -> bool {
        let session = &self.connection.session;
        session.set_blocking(true);
        session.set_timeout(TIMEOUT_CHANNEL_CLOSE_MS as u32);
        // libssh2 reports exit status 0 until an exit-status message arrives, so the
        // status only counts when the remote closed the channel on its own.
        let remote_closed = self.channel.eof() && self.channel.wait_close().is_ok();
        let _ = self.channel.close();
        remote_closed
    }

    fn exit(&self) -> ChannelExit {
        if let Ok(signal) = self.channel.exit_signal() {
            if let Some(name) = signal.exit_signal {
                return ChannelExit::Signal {
                    name,
                    message: signal.error_message,
                };
            }
        }
        match self.channel.exit_status() {
            Ok(code) => ChannelExit::Status(code),
            Err(_) => ChannelExit::Unknown,
        }
    }
}

#[derive(Clone)]
pub struct SshRelay {
    logger: Logger,
}

impl SshRelay {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("relay"),
        }
    }

    /// Runs `command` as `user` on `host` and splices it onto `transport` until either
    /// side finishes. Every outcome ends on the raw stream; nothing is returned.
    pub fn run(
        &self,
        transport: BufferedTransport,
        command: &str,
        user: &str,
        host: &str,
        options: &SshOptions,
    ) {
        let mut splice = Splice::new(transport);
        if let Err(err) = self.relay(&mut splice, command, user, host, options) {
            self.classify_failure(&mut splice, host, &err);
        }
        if let Err(err) = splice.finish() {
            self.logger.debug(
                "client transport closed with error",
                Some(&json!({ "host": host, "error": err.to_string() })),
            );
        }
    }

    fn classify_failure(&self, splice: &mut Splice, host: &str, err: &ProxyError) {
        let meta = json!({
            "host": host,
            "kind": err.kind,
            "error": err.message,
            "committed": splice.is_committed(),
        });
        match err.kind {
            ProxyErrorKind::AuthenticationFailed
            | ProxyErrorKind::Unreachable
            | ProxyErrorKind::InvalidRequest => {
                self.logger.warn("ssh session failed", Some(&meta));
                if !splice.fail(err.http_status(), err.public_body().to_string().as_bytes()) {
                    splice.note_error(&err.message);
                }
            }
            _ => {
                self.logger.error("unexpected relay failure", Some(&meta));
                if !splice.fail(500, err.public_body().to_string().as_bytes()) {
                    splice.note_error(&err.message);
                }
            }
        }
    }

    fn relay(
        &self,
        splice: &mut Splice,
        command: &str,
        user: &str,
        host: &str,
        options: &SshOptions,
    ) -> Result<(), ProxyError> {
        let connection = self.connect(host, user, options)?;
        let mut channel = connection
            .session
            .channel_session()
            .map_err(|err| map_ssh_error("Failed to open channel", err))?;
        channel
            .exec(command)
            .map_err(|err| ProxyError::internal(format!("Could not execute command: {}", err)))?;
        self.logger.info(
            "session opened",
            Some(&json!({
                "host": host,
                "user": user,
                "port": options.port,
                "auth": options.auth_methods.iter().map(AuthMethod::name).collect::<Vec<_>>(),
                "transport": splice.transport_mut().kind(),
            })),
        );

        connection.session.set_blocking(false);
        let mut exec = Ssh2Exec {
            connection,
            channel,
        };
        self.drive(&mut exec, splice, host)
    }

    /// Pumps until either side ends, then closes the channel and records the exit.
    fn drive<C: ExecChannel>(
        &self,
        exec: &mut C,
        splice: &mut Splice,
        host: &str,
    ) -> Result<(), ProxyError> {
        let end = pump(exec, splice)?;
        let remote_closed = exec.close();

        if end == PumpEnd::ClientClosed {
            self.logger.info(
                "client disconnected; channel closed",
                Some(&json!({ "host": host })),
            );
            return Ok(());
        }
        let exit = if remote_closed {
            exec.exit()
        } else {
            self.logger.debug(
                "channel close was not confirmed by the remote side",
                Some(&json!({ "host": host })),
            );
            ChannelExit::Unknown
        };
        self.logger.info(
            "command finished",
            Some(&json!({ "host": host, "exit": format!("{:?}", exit) })),
        );
        splice.on_exit(&exit);
        Ok(())
    }

    fn connect(
        &self,
        host: &str,
        user: &str,
        options: &SshOptions,
    ) -> Result<SshConnection, ProxyError> {
        let tcp = open_tcp(host, options.port, options.connect_timeout)?;
        let fd = tcp.as_raw_fd();

        let mut session = Session::new()
            .map_err(|err| ProxyError::internal(format!("Failed to create SSH session: {}", err)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(options.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(|err| {
            ProxyError::unreachable(format!("SSH handshake with {} failed: {}", host, err))
        })?;

        self.verify_host_key(&session, host, options)?;
        self.authenticate(&session, host, user, &options.auth_methods)?;

        session.set_timeout(0);
        session.set_keepalive(true, 30);
        Ok(SshConnection { session, fd })
    }

    fn verify_host_key(
        &self,
        session: &Session,
        host: &str,
        options: &SshOptions,
    ) -> Result<(), ProxyError> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| ProxyError::unreachable(format!("{} offered no host key", host)))?;
        let fingerprint = fingerprint_sha256(key);

        let mut known_hosts = session
            .known_hosts()
            .map_err(|err| map_ssh_error("Failed to load known hosts", err))?;
        if options.known_hosts_file.exists() {
            known_hosts
                .read_file(&options.known_hosts_file, KnownHostFileKind::OpenSSH)
                .map_err(|err| map_ssh_error("Failed to read known hosts file", err))?;
        }

        match known_hosts.check_port(host, options.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound if options.host_key_policy == HostKeyPolicy::AcceptNew => {
                let entry = known_hosts_entry(host, options.port);
                known_hosts
                    .add(&entry, key, "added by ssh-exec-proxy", key_type.into())
                    .map_err(|err| map_ssh_error("Failed to record host key", err))?;
                ensure_parent_dir(&options.known_hosts_file)?;
                known_hosts
                    .write_file(&options.known_hosts_file, KnownHostFileKind::OpenSSH)
                    .map_err(|err| map_ssh_error("Failed to write known hosts file", err))?;
                self.logger.warn(
                    "learned new host key",
                    Some(&json!({ "host": entry, "fingerprint": fingerprint })),
                );
                Ok(())
            }
            CheckResult::NotFound => Err(ProxyError::unreachable(format!(
                "Host key for {} is not known ({})",
                host, fingerprint
            ))
            .with_hint("Add the host to the known hosts file or use the accept_new policy.")),
            CheckResult::Mismatch => Err(ProxyError::unreachable(format!(
                "Host key for {} does not match the known hosts entry ({})",
                host, fingerprint
            ))),
            CheckResult::Failure => Err(ProxyError::internal(format!(
                "Host key check for {} failed",
                host
            ))),
        }
    }

    fn authenticate(
        &self,
        session: &Session,
        host: &str,
        user: &str,
        methods: &[AuthMethod],
    ) -> Result<(), ProxyError> {
        let mut failures = Vec::new();
        for method in methods {
            let attempt = match method {
                AuthMethod::Password(password) => {
                    let mut result = Ok(());
                    for _ in 0..PASSWORD_PROMPTS {
                        result = session.userauth_password(user, password);
                        if result.is_ok() {
                            break;
                        }
                    }
                    result
                }
                AuthMethod::PublicKey {
                    identity_file,
                    passphrase,
                } => session.userauth_pubkey_file(
                    user,
                    None,
                    identity_file,
                    passphrase.as_deref(),
                ),
            };
            match attempt {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => failures.push(format!("{}: partial success", method.name())),
                Err(err) => failures.push(format!("{}: {}", method.name(), err.message())),
            }
        }
        Err(ProxyError::authentication_failed(format!(
            "Authentication failed for user {}@{}",
            user, host
        ))
        .with_details(json!({ "attempts": failures })))
    }
}

/// Moves client input to the channel and channel output to the client until the
/// remote side reaches EOF or the client goes away. Either direction stops reading its
/// source while the other side holds more than the high-water mark.
pub fn pump<C: ExecChannel>(exec: &mut C, splice: &mut Splice) -> Result<PumpEnd, ProxyError> {
    let mut stdin_backlog = BytesMut::new();
    let mut buf = vec![0u8; CHANNEL_READ_CHUNK];
    let idle = Duration::from_millis(RELAY_POLL_INTERVAL_MS);

    loop {
        let transport = splice.transport_mut();
        if transport.available() > 0 {
            stdin_backlog.extend_from_slice(&transport.read_available());
        }
        while !stdin_backlog.is_empty() {
            match exec.write_stdin(&stdin_backlog) {
                Ok(0) => break,
                Ok(n) => stdin_backlog.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    return Err(ProxyError::internal(format!(
                        "Failed to forward client input: {}",
                        err
                    )))
                }
            }
        }
        if transport.is_closed() && stdin_backlog.is_empty() {
            return Ok(PumpEnd::ClientClosed);
        }

        let output_throttled = transport.pending_output() >= RELAY_HIGH_WATER_MARK;
        if !output_throttled {
            drain_output(exec, splice, &mut buf)?;
        }
        if exec.eof() {
            // Output and EOF can land in the same packet batch.
            drain_output(exec, splice, &mut buf)?;
            return Ok(PumpEnd::RemoteEof);
        }

        let transport = splice.transport_mut();
        match transport.send_pending() {
            Ok(_) => {}
            Err(err) if is_disconnect(&err) => return Ok(PumpEnd::ClientClosed),
            Err(err) => return Err(err.into()),
        }
        exec.keepalive();

        let input_throttled = stdin_backlog.len() >= RELAY_HIGH_WATER_MARK;
        let mut session_interest = exec.interest();
        if output_throttled {
            session_interest.readable = false;
        }
        if !stdin_backlog.is_empty() {
            session_interest.writable = true;
        }
        let mut client_interest = transport.interest();
        if input_throttled {
            client_interest.readable = false;
        }
        let buffered = !input_throttled && transport.has_buffered_input();
        let timeout = if buffered { Duration::ZERO } else { idle };
        let ready = poll_many(
            &[
                (exec.raw_fd(), session_interest),
                (transport.raw_fd(), client_interest),
            ],
            Some(timeout),
        )?;
        let client_ready = ready.get(1).map(|r| r.readable).unwrap_or(false);
        if (client_ready || buffered) && !input_throttled && !transport.is_closed() {
            transport.fill()?;
        }
    }
}

fn drain_output<C: ExecChannel>(
    exec: &mut C,
    splice: &mut Splice,
    buf: &mut [u8],
) -> Result<(), ProxyError> {
    loop {
        match exec.read_stdout(buf) {
            Ok(0) => break,
            Ok(n) => {
                splice.on_stdout(&buf[..n]);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => return Err(ProxyError::internal(format!("SSH stdout read failed: {}", err))),
        }
    }
    loop {
        match exec.read_stderr(buf) {
            Ok(0) => break,
            Ok(n) => splice.on_stderr(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => return Err(ProxyError::internal(format!("SSH stderr read failed: {}", err))),
        }
    }
    Ok(())
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProxyError> {
    let addrs = (host, port).to_socket_addrs().map_err(|err| {
        ProxyError::unreachable(format!("Failed to resolve {}: {}", host, err))
    })?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(ProxyError::unreachable(match last_error {
        Some(err) => format!("Failed to connect to {}:{}: {}", host, port, err),
        None => format!("No addresses found for {}", host),
    }))
}

fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == crate::constants::network::SSH_DEFAULT_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), ProxyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| {
            ProxyError::internal(format!("Failed to create {}: {}", parent.display(), err))
        })?;
    }
    Ok(())
}

fn fingerprint_sha256(key: &[u8]) -> String {
    let hash = Sha256::digest(key);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", encoded)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

fn map_ssh_error(context: &str, err: ssh2::Error) -> ProxyError {
    let io_err: io::Error = err.into();
    match io_err.kind() {
        io::ErrorKind::TimedOut => ProxyError::unreachable(format!("{}: timed out", context)),
        _ => ProxyError::internal(format!("{}: {}", context, io_err)),
    }
}
