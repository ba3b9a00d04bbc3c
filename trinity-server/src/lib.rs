//! # Trinity Server
//!
//! The control API: a thin axum layer that validates input, resolves
//! the actor, checks permissions and calls into `trinity-runtime` and
//! `trinity-store`. This crate is the only place that knows HTTP status
//! codes; everything below it speaks tagged error variants.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ServerConfig;
pub use state::AppState;
