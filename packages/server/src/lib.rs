// Stepflow - durable step-execution control plane
//
// This crate provides a workflow runner that accepts plans of ordered steps,
// dispatches each step to a typed tool handler, and guarantees exactly-once
// effective execution across crashes, duplicate deliveries, and transient
// failures. The execution core lives in `kernel`; the HTTP control surface
// in `server`.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
