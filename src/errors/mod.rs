mod proxy_error;

pub use proxy_error::{ProxyError, ProxyErrorKind};
