//! API server for isoforge.
//!
//! Serves the caller-facing build API, the worker status gateway and signed
//! artifact downloads.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
