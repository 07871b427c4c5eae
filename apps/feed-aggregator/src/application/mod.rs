//! Application Layer - Use cases and port definitions.
//!
//! This layer holds the aggregation core (merge, cache, dispatch) and the
//! port interfaces it uses to reach sources, normalizers and history APIs.

/// Port interfaces for external systems (transports, normalizers, history).
pub mod ports;

/// Aggregation, caching and fan-out services.
pub mod services;
