//! # Relay Hub Library
//!
//! This library provides the core functionality for the Relay Hub service:
//! webhook ingestion, the database-backed job queue with its worker pool,
//! plan-tier rate limiting, credential encryption and notification dispatch.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notify;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod reconcile;
pub mod repositories;
pub mod server;
pub mod store;
pub mod telemetry;
pub use migration;
