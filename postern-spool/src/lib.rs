pub mod buffer;
pub mod config;
pub mod error;

pub use buffer::{SpoolBuffer, SpoolReader};
pub use config::SpoolConfig;
pub use error::{Result, SpoolError};
