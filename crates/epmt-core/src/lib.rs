//! Core library for the job performance-monitoring pipeline
//!
//! This crate provides the building blocks of the daemon:
//! - Counter-file collation and validation
//! - Process-tree construction and metric rollup
//! - Reference-model statistics and outlier/root-cause analysis
//! - Job-archive ingestion and lifecycle orchestration
//! - The daemon control loop, health checks, and observability

pub mod collate;
pub mod daemon;
pub mod health;
pub mod ingest;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod proctree;
pub mod stats;
pub mod store;
pub mod tags;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
