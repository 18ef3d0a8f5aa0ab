pub mod network {
    pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8022";
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_CONNECT_MS: u64 = 10_000;
    /// Upper bound for one readiness wait in the relay loop; keeps keepalives and exit
    /// detection moving when neither side produces traffic.
    pub const RELAY_POLL_INTERVAL_MS: u64 = 250;
    pub const TIMEOUT_CHANNEL_CLOSE_MS: u64 = 5_000;
}

pub mod limits {
    pub const MAX_PORT: u16 = 65_535;
    pub const MIN_PORT: u16 = 1;
    pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
}

pub mod buffers {
    pub const SOCKET_READ_CHUNK: usize = 16 * 1024;
    pub const CHANNEL_READ_CHUNK: usize = 32 * 1024;
    /// Queued bytes in either relay direction above which the relay stops reading
    /// from the producing side until the consumer catches up.
    pub const RELAY_HIGH_WATER_MARK: usize = 256 * 1024;
}

pub mod retry {
    pub const DEFAULT_RETRY_COUNT: u32 = 3;
    pub const DEFAULT_RETRY_INTERVAL_SECS: f64 = 10.0;
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 0.1;
}

pub mod upgrade {
    pub const PROTOCOL: &str = "raw";
    pub const SUCCESS_PREAMBLE: &[u8] = b"Status: 101\r\nConnection: upgrade\r\nUpgrade: raw\r\n\r\n";
    pub const COMMAND_FAILURE_STATUS: u16 = 400;
}

pub mod ssh {
    /// User the managed execution path always connects as.
    pub const MANAGED_SSH_USER: &str = "root";
    pub const PASSWORD_PROMPTS: usize = 1;
}
