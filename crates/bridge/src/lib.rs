//! Telemetry ingestion and actuation dispatch for the irrigation dashboard.
//!
//! The binary runs the inbound half: it owns the MQTT subscription, parses
//! the gateway's free-text telemetry, resolves device tags to registered
//! fields/sensors, and maintains the TTL-bounded latest-value cache. The
//! library additionally exposes [`dispatch::Dispatcher`], which the
//! dashboard layer calls to publish valve commands and irrigation schedules
//! with a durable record per dispatch.

pub mod bus;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod ingest;
pub mod payload;
