pub mod app;
pub mod constants;
pub mod errors;
pub mod http;
pub mod managers;
pub mod services;
pub mod transport;
pub mod utils;
