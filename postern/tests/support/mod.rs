pub mod client;
pub mod harness;

pub use client::TestClient;
pub use harness::Harness;
