pub mod address;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod info;
pub mod logging;
pub mod reply;
pub mod status;

pub use domain::Domain;
pub use tracing;

/// Signal broadcast to every listener and session when the server is asked
/// to stop.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
