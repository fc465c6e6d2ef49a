//! HTTP control surface over the execution core.

pub mod app;
pub mod routes;

pub use app::{build_app, AppState};
