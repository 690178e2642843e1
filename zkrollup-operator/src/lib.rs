//! zkrollup-operator
//!
//! Runs the rollup state machine behind a single-writer task and, with the
//! `server` feature, exposes it over HTTP.

pub mod config;
pub mod operator;
#[cfg(feature = "server")]
pub mod server;

pub use config::OperatorConfig;
pub use operator::{JobHandle, Operator, OperatorError, OperatorHandle, OperatorStatus};
#[cfg(feature = "server")]
pub use server::{create_router, run_server, AppState};
