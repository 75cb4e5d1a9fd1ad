//! Process health: Prometheus metrics and the liveness endpoint.

pub mod health;

pub use health::HealthMetrics;
