//! Parley session gateway.
//!
//! Accepts secure-computation provisioning tasks over HTTP and drives each
//! one through a fixed pipeline: config templating, engine restart, dataset
//! staging into the local store, broker session establishment, virtual-table
//! registration, column grants, and finally query execution with result
//! handoff to the remote file store.

pub mod config;
pub mod grants;
pub mod pipeline;
pub mod query;
pub mod readiness;
pub mod retry;
pub mod server;
pub mod service;
pub mod session;
pub mod staging;
pub mod task;
pub mod template;
