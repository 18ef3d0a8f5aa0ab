pub mod command_action;
pub mod relay;
pub mod session;
