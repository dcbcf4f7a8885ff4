//! chatgate: an OpenAI-compatible chat gateway in front of a device-code
//! authorized upstream.
//!
//! Re-exports modules needed by integration tests in `tests/`.

pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod server;
pub mod session;
pub mod store;

pub use server::AppState;
