//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, plus the engine
//! handle that wires them together and the process-level surfaces.

/// Environment settings and YAML source definitions.
pub mod config;

/// Engine handle and builder.
pub mod engine;

/// Transports, supervision and REST backfill.
pub mod feeds;

/// Health, metrics and query HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Per-schema wire decoders.
pub mod normalizers;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
