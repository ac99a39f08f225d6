#[cfg(not(unix))]
compile_error!("Only unix-like platforms are currently supported");

pub mod config;
pub mod controller;
pub mod supervisor;

pub use config::{PosternConfig, find_config_file};
pub use controller::Postern;
