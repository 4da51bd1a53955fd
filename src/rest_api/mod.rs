//! Operator HTTP endpoints
//!
//! Serves `/health`, `/readyz` and, with the `metrics` feature, `/metrics`.

mod handlers;
mod server;

pub use server::run_server;
