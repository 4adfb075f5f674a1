//! # Lattice Server
//!
//! Memory orchestration service for AI agents: durable ingest + fanout,
//! federated retrieval, and a lease-based task queue behind one HTTP
//! surface.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - sqlite (sqlx) for the durable outbox, tasks, and feedback
//! - an external document store for raw events (and optionally the outbox)
//! - reqwest clients for the vector, analytic, archival, observability,
//!   canonical, and embedding backends

/// Error types and handling
pub mod errors;

/// Request handlers per endpoint family
pub mod handlers;

/// Middleware implementations
pub mod middleware;

/// Route table
pub mod routes;

/// Application state and startup wiring
pub mod state;
