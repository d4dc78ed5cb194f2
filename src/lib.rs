//! Streaming session heuristics
//!
//! Consumes web and mobile telemetry from a message bus, runs per-session
//! detectors over it, and produces derived incidents back to the bus with
//! at-least-once delivery.

pub mod bus_core;
pub mod handlers;
pub mod pipeline;
