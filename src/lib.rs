//! Tattoo Preview Pipeline
//!
//! This library provides the core functionality for the tattoo-preview
//! system: clients upload a body photo and a tattoo design, a worker pool
//! composites them with an external image-generation API, and the result is
//! tracked as a job until it lands in S3-compatible storage.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
