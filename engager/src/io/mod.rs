//! Side-effecting adapters: configuration, persistence, generation, and the
//! external surface.

pub mod actuator;
pub mod broadcast;
pub mod command_actuator;
pub mod config;
pub mod generator;
pub mod init;
pub mod prompt;
pub mod session_store;
