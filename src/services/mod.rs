pub mod authorization;
pub mod config;
pub mod dispatcher;
pub mod logger;
pub mod validation;
