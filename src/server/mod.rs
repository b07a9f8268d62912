//! HTTP surface for the capability engine.
//!
//! Thin axum handlers over [`ExecutionCoordinator`](crate::coordinator::ExecutionCoordinator);
//! see [`routes`] for the endpoint list.

pub mod routes;

pub use routes::{app_router, status_for, AppState};
