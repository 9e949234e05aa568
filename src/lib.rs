//! Automated manufacturing-test orchestrator: session engine, instrument
//! drivers, connection pool, and report writer (spec §1–§2).
//!
//! The HTTP transport, auth, CSV test-plan upload parser, browser UI, user
//! administration, relational store, and log sinks are explicitly out of
//! scope; this crate exposes the seams (`Repository`, `TelemetrySink`,
//! `EngineRegistry`) those collaborators are expected to plug into.

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod measurement;
pub mod model;
pub mod pool;
pub mod registry;
pub mod report;
pub mod repository;
pub mod telemetry;
pub mod transport;

pub use config::EngineConfig;
pub use engine::SessionEngine;
pub use error::{EngineError, EngineResult};
pub use pool::ConnectionPool;
pub use registry::EngineRegistry;
pub use repository::Repository;
