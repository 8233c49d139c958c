//! Observability: health endpoints.
//!
//! The `/metrics` endpoint is served separately from the Prometheus
//! recorder installed in `main`.

mod health;

pub use health::{health_router, HealthState};
